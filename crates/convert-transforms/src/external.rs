//! Running external helper programs (font subsetter, rasterizers) with a
//! deadline.

use std::ffi::OsStr;
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use convert_core::error::ConvertError;
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("could not run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' did not finish within {seconds} s")]
    Timeout { command: String, seconds: u64 },

    #[error("'{command}' failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl From<HelperError> for ConvertError {
    fn from(e: HelperError) -> Self {
        ConvertError::Other(e.to_string())
    }
}

/// Run `command` with `args`, killing it once `timeout` elapses.
pub fn run<I, S>(command: &str, args: I, timeout: Duration) -> Result<(), HelperError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    log::debug!("Running helper {}", command);
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| HelperError::Spawn {
            command: command.to_string(),
            source,
        })?;

    // stderr is drained concurrently with the exit poll.
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = pipe.read_to_string(&mut text);
            text
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HelperError::Timeout {
                command: command.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    if status.success() {
        Ok(())
    } else {
        Err(HelperError::Failed {
            command: command.to_string(),
            status,
            stderr: stderr.trim().to_string(),
        })
    }
}
