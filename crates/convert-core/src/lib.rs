//! Core of the conversion pipeline: the OEB container, its XHTML and CSS
//! object models, descriptor I/O, plugin traits and the pipeline driver.

pub mod error;
pub mod options;
pub mod href;
pub mod dom;
pub mod stylesheet;
pub mod links;
pub mod book;
pub mod opf;
pub mod plugin;
pub mod registry;
pub mod pipeline;

pub use book::{BookDocument, EbookFormat, ManifestData, ManifestItem};
pub use error::{ConvertError, ErrorKind, Result};
pub use options::{ConversionOptions, OptionSet};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use registry::PluginRegistry;
