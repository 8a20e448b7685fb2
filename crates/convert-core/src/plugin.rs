//! Plugin traits for input, output, and transform plugins, and the
//! [`Context`] threaded through every plugin call.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::book::{BookDocument, EbookFormat};
use crate::error::{ConvertError, Result};
use crate::options::{ConversionOptions, OptionRecommendation};

/// Progress reporter callback type.
pub type ProgressReporter = Box<dyn Fn(f64, &str) + Send + Sync>;

pub type SharedReporter = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ConvertError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Monotonic progress sink. Fractions are clamped to `[0, 1]` and never go
/// backwards.
pub struct Progress {
    reporter: Option<SharedReporter>,
    last: Mutex<f64>,
}

impl Progress {
    pub fn new(reporter: Option<ProgressReporter>) -> Self {
        Self::shared(reporter.map(Arc::from))
    }

    /// A fresh sink feeding a reporter that outlives it.
    pub fn shared(reporter: Option<SharedReporter>) -> Self {
        Self {
            reporter,
            last: Mutex::new(0.0),
        }
    }

    pub fn report(&self, fraction: f64, message: &str) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let fraction = fraction.clamp(0.0, 1.0).max(*last);
        *last = fraction;
        if let Some(ref reporter) = self.reporter {
            reporter(fraction, message);
        }
    }
}

/// How many threads a plugin wants while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreUsage {
    #[default]
    Single,
    All,
    Count(usize),
}

/// What happens when a transform fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    /// Logged; the pipeline continues with the pre-transform container.
    #[default]
    Recoverable,
    /// The pipeline aborts.
    Required,
}

/// What the selected output plugin can consume, visible to transforms.
#[derive(Debug, Clone)]
pub struct OutputCapabilities {
    pub format: EbookFormat,
    pub supported_image_types: Vec<String>,
    pub required_transforms: Vec<String>,
}

impl OutputCapabilities {
    pub fn of(plugin: &dyn OutputPlugin) -> Self {
        Self {
            format: plugin.output_format(),
            supported_image_types: plugin
                .supported_image_types()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            required_transforms: plugin
                .required_transforms()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn supports_image(&self, media_type: &str) -> bool {
        self.supported_image_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(media_type))
    }

    pub fn requires(&self, transform: &str) -> bool {
        self.required_transforms.iter().any(|t| t == transform)
    }
}

impl Default for OutputCapabilities {
    fn default() -> Self {
        Self {
            format: EbookFormat::Oeb,
            supported_image_types: DEFAULT_IMAGE_TYPES.iter().map(|s| s.to_string()).collect(),
            required_transforms: Vec::new(),
        }
    }
}

/// Image types every reading system handles.
pub const DEFAULT_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/svg+xml"];

/// Everything a plugin or transform may consult: options, cancellation,
/// progress and the output plugin's capabilities.
#[derive(Clone)]
pub struct Context<'a> {
    pub options: &'a ConversionOptions,
    pub cancel: CancellationToken,
    pub output: OutputCapabilities,
    progress: Option<&'a Progress>,
    span: (f64, f64),
}

impl<'a> Context<'a> {
    pub fn new(options: &'a ConversionOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
            output: OutputCapabilities::default(),
            progress: None,
            span: (0.0, 1.0),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_output(mut self, output: OutputCapabilities) -> Self {
        self.output = output;
        self
    }

    pub fn with_progress(mut self, progress: &'a Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Same context with sub-progress mapped into `[start, end]` of the
    /// overall run.
    pub fn scoped(&self, start: f64, end: f64) -> Context<'a> {
        let mut ctx = self.clone();
        ctx.span = (start, end.max(start));
        ctx
    }

    /// Report progress within the current span (`fraction` in `[0, 1]`).
    pub fn report_progress(&self, fraction: f64, message: &str) {
        if let Some(progress) = self.progress {
            let (start, end) = self.span;
            progress.report(start + (end - start) * fraction.clamp(0.0, 1.0), message);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }
}

/// Input format plugin: turns an input file into an OPF descriptor plus
/// resources on disk.
pub trait InputPlugin: Send + Sync {
    /// Human-readable name of this plugin.
    fn name(&self) -> &str;

    /// File formats this plugin handles.
    fn supported_formats(&self) -> &[EbookFormat];

    /// Higher wins when several plugins handle a format.
    fn priority(&self) -> i32 {
        0
    }

    fn core_usage(&self) -> CoreUsage {
        CoreUsage::Single
    }

    fn option_recommendations(&self, _options: &ConversionOptions) -> Vec<OptionRecommendation> {
        Vec::new()
    }

    /// Convert `input` into resources under `scratch`; returns the path of
    /// the OPF descriptor (which may also point at an existing descriptor).
    fn convert(
        &self,
        input: &Path,
        format: EbookFormat,
        scratch: &Path,
        ctx: &Context<'_>,
    ) -> Result<PathBuf>;

    /// Called after the container was built and normalized.
    fn postprocess(&self, _book: &mut BookDocument, _ctx: &Context<'_>) -> Result<()> {
        Ok(())
    }

    /// Called after postprocess to specialize the book for a particular output format.
    fn specialize(
        &self,
        _book: &mut BookDocument,
        _ctx: &Context<'_>,
        _output_format: EbookFormat,
    ) -> Result<()> {
        Ok(())
    }
}

/// Output format plugin: converts a BookDocument to a target file.
pub trait OutputPlugin: Send + Sync {
    /// Human-readable name of this plugin.
    fn name(&self) -> &str;

    /// The output format this plugin produces.
    fn output_format(&self) -> EbookFormat;

    fn priority(&self) -> i32 {
        0
    }

    fn core_usage(&self) -> CoreUsage {
        CoreUsage::Single
    }

    fn option_recommendations(&self, _options: &ConversionOptions) -> Vec<OptionRecommendation> {
        Vec::new()
    }

    /// Image media types the format can carry as-is.
    fn supported_image_types(&self) -> &[&str] {
        DEFAULT_IMAGE_TYPES
    }

    /// Transforms whose failure must abort the conversion.
    fn required_transforms(&self) -> &[&str] {
        &[]
    }

    /// Write the book to `output_path`.
    fn convert(
        &self,
        book: &BookDocument,
        output_path: &Path,
        input_format: EbookFormat,
        ctx: &Context<'_>,
    ) -> Result<()>;
}

/// A transform that mutates the BookDocument IR.
/// Transforms run between input and output in priority order.
pub trait Transform: Send + Sync {
    /// Human-readable name of this transform.
    fn name(&self) -> &str;

    /// Position in the standard chain; lower runs first.
    fn priority(&self) -> i32 {
        100
    }

    /// Option names this transform reads.
    fn options_consumed(&self) -> &[&str] {
        &[]
    }

    /// Transforms that must come earlier in the chain when present.
    fn run_after(&self) -> &[&str] {
        &[]
    }

    /// A transactional transform leaves the container untouched when it
    /// fails, so the driver does not snapshot before it.
    fn transactional(&self) -> bool {
        false
    }

    fn severity(&self) -> Severity {
        Severity::Recoverable
    }

    /// Whether this transform should run given the current options.
    /// Default: always run.
    fn should_run(&self, _options: &ConversionOptions) -> bool {
        true
    }

    /// Apply this transform to the book document.
    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()>;
}
