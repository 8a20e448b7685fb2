//! Pipeline orchestrator: runs the full conversion.
//!
//! The pipeline runs in three phases:
//!   Phase 1 (0-10%): detect format → input plugin writes an OPF descriptor
//!     into a scratch directory → container built and normalized →
//!     postprocess → specialize
//!   Phase 2 (10-80%): transforms in declared order
//!   Phase 3 (80-100%): output plugin writes a sibling temporary path which
//!     is renamed over the destination on success

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};

use crate::book::{BookDocument, EbookFormat};
use crate::error::{ConvertError, Result};
use crate::opf;
use crate::options::OptionSet;
use crate::plugin::{
    CancellationToken, Context, CoreUsage, OutputCapabilities, Progress, ProgressReporter,
    SharedReporter, Severity, Transform,
};
use crate::registry::{format_names, PluginRegistry};

const INPUT_END: f64 = 0.10;
const TRANSFORMS_END: f64 = 0.80;

/// The conversion pipeline orchestrator.
pub struct Pipeline {
    registry: Arc<PluginRegistry>,
    transforms: Vec<Box<dyn Transform>>,
    progress_reporter: Option<SharedReporter>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Token that cancels this pipeline's runs when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn transform_names(&self) -> Vec<&str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Run the full conversion pipeline.
    pub fn run(&self, input_path: &Path, output_path: &Path, options: &OptionSet) -> Result<()> {
        let progress = Progress::shared(self.progress_reporter.clone());
        self.cancel.check()?;
        progress.report(0.0, "Starting conversion...");

        // Phase 1: Input
        let input_format = match options.options().input_format {
            Some(f) => f,
            None => EbookFormat::detect(input_path).ok_or_else(|| {
                ConvertError::format(
                    "pipeline",
                    format!("cannot detect the format of {}", input_path.display()),
                )
            })?,
        };
        let output_format = match options.options().output_format {
            Some(f) => f,
            None => output_format_for(&self.registry, output_path)?,
        };

        let input_plugin = self.registry.input_for(input_format)?;
        let output_plugin = self.registry.output_for(output_format)?;

        let mut merged = options.clone();
        let recs = input_plugin.option_recommendations(merged.options());
        merged.merge_recommendations(input_plugin.name(), &recs);
        let recs = output_plugin.option_recommendations(merged.options());
        merged.merge_recommendations(output_plugin.name(), &recs);
        let options = merged.options();

        let ctx = Context::new(options)
            .with_cancel(self.cancel.clone())
            .with_output(OutputCapabilities::of(output_plugin.as_ref()))
            .with_progress(&progress);

        let scratch = tempfile::Builder::new()
            .prefix("ebook-convert-")
            .tempdir()?;

        info!("Running {} input plugin ({})...", input_plugin.name(), input_format);
        let input_ctx = ctx.scoped(0.0, INPUT_END * 0.8);
        input_ctx.report_progress(0.0, &format!("Running {} plugin", input_plugin.name()));
        let descriptor = with_core_usage(input_plugin.core_usage(), || {
            input_plugin.convert(input_path, input_format, scratch.path(), &input_ctx)
        })?;
        self.cancel.check()?;

        let mut book = opf::read_opf(&descriptor)?;
        book.normalize()?;
        input_plugin.postprocess(&mut book, &ctx)?;
        info!("Specializing for {} output...", output_format);
        input_plugin.specialize(&mut book, &ctx, output_format)?;
        ctx.report_progress(INPUT_END, "Input parsing complete");

        if let Some(ref debug_dir) = options.debug_pipeline {
            dump_book_debug(&book, &debug_dir.join("input"));
        }

        // Phase 2: Transforms
        self.run_transforms(&mut book, &ctx)?;
        ctx.report_progress(TRANSFORMS_END, "All transforms complete");

        if let Some(ref debug_dir) = options.debug_pipeline {
            dump_book_debug(&book, &debug_dir.join("processed"));
        }

        // Phase 3: Output
        self.cancel.check()?;
        info!("Running {} output plugin...", output_plugin.name());
        let output_ctx = ctx.scoped(TRANSFORMS_END, 1.0);
        output_ctx.report_progress(0.0, &format!("Creating {}...", output_plugin.name()));

        let partial = partial_path(output_path);
        let written = with_core_usage(output_plugin.core_usage(), || {
            output_plugin.convert(&book, &partial, input_format, &output_ctx)
        })
        .and_then(|_| self.cancel.check())
        .and_then(|_| commit(&partial, output_path));
        if let Err(e) = written {
            remove_path(&partial);
            return Err(e);
        }

        ctx.report_progress(1.0, "Conversion complete");
        info!("{} output written to {}", output_format, output_path.display());
        Ok(())
    }

    /// Apply every active transform to `book`. Recoverable failures roll
    /// the container back to its pre-transform state.
    pub fn run_transforms(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        let active: Vec<&dyn Transform> = self
            .transforms
            .iter()
            .map(|t| t.as_ref())
            .filter(|t| {
                let run = t.should_run(ctx.options);
                if !run {
                    info!("Skipping transform: {}", t.name());
                }
                run
            })
            .collect();
        let step = (TRANSFORMS_END - INPUT_END) / active.len().max(1) as f64;

        for (idx, transform) in active.iter().enumerate() {
            ctx.check_cancelled()?;
            let name = transform.name();
            let start = INPUT_END + step * idx as f64;
            let t_ctx = ctx.scoped(start, start + step);
            t_ctx.report_progress(0.0, &format!("Running {}", name));
            info!("Running transform: {}", name);

            let began = Instant::now();
            let snapshot = (!transform.transactional()).then(|| book.clone());
            match transform.apply(book, &t_ctx) {
                Ok(()) => {
                    info!("Finished {} in {} ms", name, began.elapsed().as_millis());
                }
                Err(e) if e.is_cancelled() => return Err(ConvertError::Cancelled),
                Err(e) => {
                    let fatal = transform.severity() == Severity::Required || ctx.output.requires(name);
                    if fatal {
                        error!("Transform {} failed: {}", name, e);
                        return Err(ConvertError::transform(name, true, e));
                    }
                    let e = ConvertError::transform(name, false, e);
                    warn!("{:#}; continuing with the previous state", e);
                    if let Some(snapshot) = snapshot {
                        *book = snapshot;
                    }
                }
            }
            t_ctx.report_progress(1.0, &format!("{} complete", name));
        }
        Ok(())
    }
}

fn output_format_for(registry: &PluginRegistry, output_path: &Path) -> Result<EbookFormat> {
    match output_path.extension().and_then(|e| e.to_str()) {
        None => Ok(EbookFormat::Oeb),
        Some(ext) => EbookFormat::from_extension(ext).ok_or_else(|| ConvertError::PluginMissing {
            format: ext.to_string(),
            known: format_names(registry.output_formats()),
        }),
    }
}

/// Sibling path the output plugin writes to before the final rename.
fn partial_path(output_path: &Path) -> PathBuf {
    let name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let partial = format!(".{}.partial-{}", name, uuid::Uuid::new_v4());
    match output_path.parent() {
        Some(parent) => parent.join(partial),
        None => PathBuf::from(partial),
    }
}

fn commit(partial: &Path, output_path: &Path) -> Result<()> {
    if output_path.is_dir() {
        std::fs::remove_dir_all(output_path)?;
    }
    std::fs::rename(partial, output_path)?;
    Ok(())
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        Ok(())
    };
    if let Err(e) = result {
        warn!("Cannot remove partial output {}: {}", path.display(), e);
    }
}

/// Run `f` inside a rayon pool sized for the plugin.
fn with_core_usage<T: Send>(usage: CoreUsage, f: impl FnOnce() -> Result<T> + Send) -> Result<T> {
    let threads = match usage {
        CoreUsage::All => return f(),
        CoreUsage::Single => 1,
        CoreUsage::Count(n) => n.max(1),
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| ConvertError::Pipeline(format!("cannot build thread pool: {}", e)))?;
    pool.install(f)
}

/// Dump the container as an OEB directory for debugging.
fn dump_book_debug(book: &BookDocument, dir: &Path) {
    if let Err(e) = opf::write_oeb_dir(book, dir) {
        warn!("Cannot write debug dump to {}: {}", dir.display(), e);
    }
}

/// Builder for constructing a pipeline; validates transform ordering.
pub struct PipelineBuilder {
    registry: Option<Arc<PluginRegistry>>,
    transforms: Vec<Box<dyn Transform>>,
    progress_reporter: Option<ProgressReporter>,
    cancel: CancellationToken,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            transforms: Vec::new(),
            progress_reporter: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn transform(mut self, transform: Box<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn transforms(mut self, transforms: impl IntoIterator<Item = Box<dyn Transform>>) -> Self {
        self.transforms.extend(transforms);
        self
    }

    pub fn progress_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let registry = self
            .registry
            .ok_or_else(|| ConvertError::Pipeline("No plugin registry specified".to_string()))?;

        for (idx, transform) in self.transforms.iter().enumerate() {
            for before in transform.run_after() {
                let later = self.transforms[idx + 1..]
                    .iter()
                    .any(|t| t.name() == *before);
                if later {
                    return Err(ConvertError::Pipeline(format!(
                        "Transform '{}' must run after '{}'",
                        transform.name(),
                        before
                    )));
                }
            }
        }

        Ok(Pipeline {
            registry,
            transforms: self.transforms,
            progress_reporter: self.progress_reporter.map(Arc::from),
            cancel: self.cancel,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
