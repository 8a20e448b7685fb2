//! EPUB input plugin: unpacks the OCF container into the scratch directory,
//! undoes font obfuscation and hands the package descriptor to the
//! pipeline.

mod container;
mod fonts;

use std::path::{Path, PathBuf};

use convert_core::book::EbookFormat;
use convert_core::error::{ConvertError, Result};
use convert_core::opf;
use convert_core::plugin::{Context, InputPlugin};
use convert_utils::{archive, encoding, mime};

pub(crate) const PLUGIN_NAME: &str = "EPUB Input";

pub struct EpubInputPlugin;

impl InputPlugin for EpubInputPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn supported_formats(&self) -> &[EbookFormat] {
        &[EbookFormat::Epub]
    }

    fn convert(
        &self,
        input: &Path,
        _format: EbookFormat,
        scratch: &Path,
        ctx: &Context<'_>,
    ) -> Result<PathBuf> {
        log::info!("Reading EPUB: {}", input.display());
        let root = scratch.join("epub");
        let extracted = archive::extract_zip(input, &root).map_err(|e| {
            ConvertError::format(
                PLUGIN_NAME,
                format!("{} is not a ZIP container: {}", input.display(), e),
            )
        })?;
        log::debug!("Unpacked {} container entries", extracted.len());
        ctx.check_cancelled()?;
        ctx.report_progress(0.6, "Container unpacked");

        let descriptor = locate_descriptor(&root)?;
        log::info!("Package descriptor: {}", descriptor.display());

        let encryption = root.join("META-INF").join("encryption.xml");
        if encryption.is_file() {
            let resources = container::encrypted_resources(&read_text(&encryption)?)?;
            fonts::deobfuscate(&root, &descriptor, &resources)?;
        }
        ctx.report_progress(1.0, "EPUB ready");
        Ok(descriptor)
    }
}

/// The descriptor named by `container.xml`, preferring an OPF media type;
/// without a usable container file, the shallowest `.opf` in the tree.
fn locate_descriptor(root: &Path) -> Result<PathBuf> {
    let container = root.join("META-INF").join("container.xml");
    if container.is_file() {
        match container::rootfiles(&read_text(&container)?) {
            Ok(rootfiles) => {
                let chosen = rootfiles
                    .iter()
                    .find(|r| r.media_type == mime::OPF_MIME)
                    .or_else(|| rootfiles.first());
                if let Some(rootfile) = chosen {
                    let path = opf::join_href(root, &rootfile.full_path);
                    if path.is_file() {
                        return Ok(path);
                    }
                    log::warn!(
                        "container.xml names a missing descriptor: {}",
                        rootfile.full_path
                    );
                }
            }
            Err(e) => log::warn!("{}", e),
        }
    } else {
        log::warn!("EPUB has no META-INF/container.xml");
    }
    convert_input_oeb::find_descriptor(root)
        .map_err(|_| ConvertError::format(PLUGIN_NAME, "no package descriptor in the container"))
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(encoding::decode_to_utf8(&bytes).0)
}
