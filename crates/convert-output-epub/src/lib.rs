//! EPUB output plugin: serializes the container as an EPUB 2 OCF archive.

mod writer;

use std::path::Path;

use convert_core::book::{BookDocument, EbookFormat};
use convert_core::error::Result;
use convert_core::plugin::{Context, CoreUsage, OutputPlugin};

pub(crate) const PLUGIN_NAME: &str = "EPUB Output";

/// Core media types EPUB 2 reading systems display without a fallback.
const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/svg+xml"];

pub struct EpubOutputPlugin;

impl OutputPlugin for EpubOutputPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn output_format(&self) -> EbookFormat {
        EbookFormat::Epub
    }

    fn core_usage(&self) -> CoreUsage {
        CoreUsage::All
    }

    fn supported_image_types(&self) -> &[&str] {
        IMAGE_TYPES
    }

    fn required_transforms(&self) -> &[&str] {
        &["RasterizeImages"]
    }

    fn convert(
        &self,
        book: &BookDocument,
        output_path: &Path,
        input_format: EbookFormat,
        ctx: &Context<'_>,
    ) -> Result<()> {
        log::info!(
            "Writing EPUB: {} (from {})",
            output_path.display(),
            input_format
        );
        writer::write_epub(book, output_path, ctx)?;
        ctx.report_progress(1.0, "EPUB written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convert_core::plugin::OutputCapabilities;

    #[test]
    fn test_capabilities() {
        let caps = OutputCapabilities::of(&EpubOutputPlugin);
        assert_eq!(caps.format, EbookFormat::Epub);
        assert!(caps.supports_image("image/png"));
        assert!(!caps.supports_image("image/webp"));
        assert!(caps.requires("RasterizeImages"));
        assert!(!caps.requires("FlattenCSS"));
    }
}
