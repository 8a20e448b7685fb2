//! OEB input plugin: an existing `.opf` descriptor, or a directory that
//! holds one. The descriptor is handed to the pipeline as-is.

use std::path::{Path, PathBuf};

use convert_core::book::EbookFormat;
use convert_core::error::{ConvertError, Result};
use convert_core::plugin::{Context, InputPlugin};

const PLUGIN_NAME: &str = "OEB Input";

/// Directory levels searched for a descriptor below an input directory.
const MAX_SEARCH_DEPTH: usize = 3;

pub struct OebInputPlugin;

impl InputPlugin for OebInputPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn supported_formats(&self) -> &[EbookFormat] {
        &[EbookFormat::Oeb]
    }

    fn convert(
        &self,
        input: &Path,
        _format: EbookFormat,
        _scratch: &Path,
        ctx: &Context<'_>,
    ) -> Result<PathBuf> {
        let descriptor = if input.is_dir() {
            find_descriptor(input)?
        } else {
            input.to_path_buf()
        };
        if !descriptor.is_file() {
            return Err(ConvertError::format(
                PLUGIN_NAME,
                format!("{} is not a readable descriptor", descriptor.display()),
            ));
        }
        log::info!("Reading OEB descriptor: {}", descriptor.display());
        ctx.report_progress(1.0, "Descriptor located");
        Ok(descriptor)
    }
}

/// Shallowest `.opf` file below `dir`; ties are broken by path.
pub fn find_descriptor(dir: &Path) -> Result<PathBuf> {
    let mut level = vec![dir.to_path_buf()];
    for _ in 0..=MAX_SEARCH_DEPTH {
        let mut found = Vec::new();
        let mut next = Vec::new();
        for current in &level {
            for entry in std::fs::read_dir(current)? {
                let path = entry?.path();
                if path.is_dir() {
                    next.push(path);
                } else if is_descriptor(&path) {
                    found.push(path);
                }
            }
        }
        found.sort();
        if let Some(first) = found.into_iter().next() {
            return Ok(first);
        }
        if next.is_empty() {
            break;
        }
        next.sort();
        level = next;
    }
    Err(ConvertError::format(
        PLUGIN_NAME,
        format!("no .opf descriptor found in {}", dir.display()),
    ))
}

fn is_descriptor(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("opf"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use convert_core::error::ErrorKind;
    use convert_core::options::ConversionOptions;

    #[test]
    fn test_descriptor_file_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        let opf = dir.path().join("book.opf");
        std::fs::write(&opf, "<package/>").unwrap();

        let opts = ConversionOptions::default();
        let found = OebInputPlugin
            .convert(&opf, EbookFormat::Oeb, dir.path(), &Context::new(&opts))
            .unwrap();
        assert_eq!(found, opf);
    }

    #[test]
    fn test_shallowest_descriptor_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/deep")).unwrap();
        std::fs::create_dir_all(dir.path().join("OEBPS")).unwrap();
        std::fs::write(dir.path().join("a/deep/other.opf"), "").unwrap();
        std::fs::write(dir.path().join("OEBPS/content.OPF"), "").unwrap();
        std::fs::write(dir.path().join("OEBPS/readme.txt"), "").unwrap();

        let found = find_descriptor(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("OEBPS/content.OPF"));
    }

    #[test]
    fn test_missing_descriptor_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html/>").unwrap();

        let opts = ConversionOptions::default();
        let err = OebInputPlugin
            .convert(dir.path(), EbookFormat::Oeb, dir.path(), &Context::new(&opts))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert_eq!(err.component(), PLUGIN_NAME);
    }
}
