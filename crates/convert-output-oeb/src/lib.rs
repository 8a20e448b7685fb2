//! OEB output plugin: writes the container as a directory of serialized
//! items next to a `content.opf` descriptor and a `toc.ncx`.

use std::path::Path;

use convert_core::book::{BookDocument, EbookFormat};
use convert_core::error::{ConvertError, Result};
use convert_core::opf;
use convert_core::plugin::{Context, CoreUsage, OutputPlugin};

const PLUGIN_NAME: &str = "OEB Output";

pub struct OebOutputPlugin;

impl OutputPlugin for OebOutputPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn output_format(&self) -> EbookFormat {
        EbookFormat::Oeb
    }

    fn core_usage(&self) -> CoreUsage {
        CoreUsage::All
    }

    fn convert(
        &self,
        book: &BookDocument,
        output_path: &Path,
        input_format: EbookFormat,
        ctx: &Context<'_>,
    ) -> Result<()> {
        log::info!(
            "Writing OEB directory: {} (from {})",
            output_path.display(),
            input_format
        );
        if output_path.is_file() {
            return Err(ConvertError::format(
                PLUGIN_NAME,
                format!("{} exists and is not a directory", output_path.display()),
            ));
        }
        ctx.check_cancelled()?;
        let descriptor = opf::write_oeb_dir(book, output_path)?;
        log::debug!("Descriptor written to {}", descriptor.display());
        ctx.report_progress(1.0, "OEB written");
        Ok(())
    }
}
