use std::fmt;

use thiserror::Error;

/// Machine-readable error kind, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Format,
    PluginMissing,
    Transform { fatal: bool },
    Resource,
    Cancelled,
    Io,
    Xml,
    Css,
    Manifest,
    Options,
    Pipeline,
    Plugin,
    Image,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorKind::Format => "format",
            ErrorKind::PluginMissing => "plugin-missing",
            ErrorKind::Transform { fatal: true } => "transform-fatal",
            ErrorKind::Transform { fatal: false } => "transform-recoverable",
            ErrorKind::Resource => "resource",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
            ErrorKind::Xml => "xml",
            ErrorKind::Css => "css",
            ErrorKind::Manifest => "manifest",
            ErrorKind::Options => "options",
            ErrorKind::Pipeline => "pipeline",
            ErrorKind::Plugin => "plugin",
            ErrorKind::Image => "image",
            ErrorKind::Other => "other",
        };
        f.write_str(tag)
    }
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input bytes do not conform to the claimed format.
    #[error("{component}: malformed input: {message}")]
    Format { component: String, message: String },

    #[error("No plugin registered for format '{format}' (known formats: {})", .known.join(", "))]
    PluginMissing { format: String, known: Vec<String> },

    #[error("Transform '{transform}' failed: {source}")]
    Transform {
        transform: String,
        fatal: bool,
        #[source]
        source: Box<ConvertError>,
    },

    /// A referenced image, font or stylesheet is missing.
    #[error("Missing resource '{href}': {message}")]
    Resource { href: String, message: String },

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("XML parsing error: {0}")]
    Xml(String),

    #[error("CSS parsing error: {0}")]
    Css(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Invalid option: {0}")]
    Options(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("{plugin}: {message}")]
    Plugin { plugin: String, message: String },

    #[error("Image processing error: {0}")]
    Image(String),

    #[error("{0}")]
    Other(String),
}

impl ConvertError {
    pub fn format(component: impl Into<String>, message: impl Into<String>) -> Self {
        ConvertError::Format {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        ConvertError::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn resource(href: impl Into<String>, message: impl Into<String>) -> Self {
        ConvertError::Resource {
            href: href.into(),
            message: message.into(),
        }
    }

    /// Wrap an error raised inside a transform.
    pub fn transform(transform: impl Into<String>, fatal: bool, source: ConvertError) -> Self {
        ConvertError::Transform {
            transform: transform.into(),
            fatal,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::Io(_) => ErrorKind::Io,
            ConvertError::Format { .. } => ErrorKind::Format,
            ConvertError::PluginMissing { .. } => ErrorKind::PluginMissing,
            ConvertError::Transform { fatal, .. } => ErrorKind::Transform { fatal: *fatal },
            ConvertError::Resource { .. } => ErrorKind::Resource,
            ConvertError::Cancelled => ErrorKind::Cancelled,
            ConvertError::Xml(_) => ErrorKind::Xml,
            ConvertError::Css(_) => ErrorKind::Css,
            ConvertError::Manifest(_) => ErrorKind::Manifest,
            ConvertError::Options(_) => ErrorKind::Options,
            ConvertError::Pipeline(_) => ErrorKind::Pipeline,
            ConvertError::Plugin { .. } => ErrorKind::Plugin,
            ConvertError::Image(_) => ErrorKind::Image,
            ConvertError::Other(_) => ErrorKind::Other,
        }
    }

    /// Name of the component the error originated in.
    pub fn component(&self) -> &str {
        match self {
            ConvertError::Format { component, .. } => component,
            ConvertError::PluginMissing { .. } => "registry",
            ConvertError::Transform { transform, .. } => transform,
            ConvertError::Resource { .. } => "container",
            ConvertError::Cancelled => "pipeline",
            ConvertError::Io(_) => "io",
            ConvertError::Xml(_) => "xml",
            ConvertError::Css(_) => "css",
            ConvertError::Manifest(_) => "container",
            ConvertError::Options(_) => "options",
            ConvertError::Pipeline(_) => "pipeline",
            ConvertError::Plugin { plugin, .. } => plugin,
            ConvertError::Image(_) => "image",
            ConvertError::Other(_) => "core",
        }
    }

    /// True for user cancellation, including cancellation surfaced from
    /// inside a transform.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ConvertError::Cancelled => true,
            ConvertError::Transform { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_component() {
        let err = ConvertError::transform("FlattenCSS", false, ConvertError::Css("bad".into()));
        assert_eq!(err.kind(), ErrorKind::Transform { fatal: false });
        assert_eq!(err.component(), "FlattenCSS");
        assert_eq!(err.kind().to_string(), "transform-recoverable");
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_plugin_missing_lists_formats() {
        let err = ConvertError::PluginMissing {
            format: "lit".into(),
            known: vec!["epub".into(), "txt".into()],
        };
        assert_eq!(
            err.to_string(),
            "No plugin registered for format 'lit' (known formats: epub, txt)"
        );
    }

    #[test]
    fn test_cancelled_through_transform() {
        let err = ConvertError::transform("SplitOnPageBreaks", false, ConvertError::Cancelled);
        assert!(err.is_cancelled());
        assert!(!ConvertError::Other("x".into()).is_cancelled());
    }
}
