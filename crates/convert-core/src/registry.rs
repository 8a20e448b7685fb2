//! Static plugin registry: built once at program start, then shared
//! read-only behind an `Arc`.

use std::sync::Arc;

use crate::book::EbookFormat;
use crate::error::{ConvertError, Result};
use crate::plugin::{InputPlugin, OutputPlugin};

#[derive(Default)]
pub struct PluginRegistry {
    inputs: Vec<Arc<dyn InputPlugin>>,
    outputs: Vec<Arc<dyn OutputPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_input(&mut self, plugin: impl InputPlugin + 'static) -> &mut Self {
        log::debug!("Registered input plugin {}", plugin.name());
        self.inputs.push(Arc::new(plugin));
        self
    }

    pub fn register_output(&mut self, plugin: impl OutputPlugin + 'static) -> &mut Self {
        log::debug!("Registered output plugin {}", plugin.name());
        self.outputs.push(Arc::new(plugin));
        self
    }

    /// Best input plugin for `format`: highest priority, then earliest
    /// registered.
    pub fn input_for(&self, format: EbookFormat) -> Result<Arc<dyn InputPlugin>> {
        best(
            self.inputs
                .iter()
                .filter(|p| p.supported_formats().contains(&format))
                .map(|p| (p.priority(), p)),
        )
        .cloned()
        .ok_or_else(|| ConvertError::PluginMissing {
            format: format.to_string(),
            known: format_names(self.input_formats()),
        })
    }

    pub fn output_for(&self, format: EbookFormat) -> Result<Arc<dyn OutputPlugin>> {
        best(
            self.outputs
                .iter()
                .filter(|p| p.output_format() == format)
                .map(|p| (p.priority(), p)),
        )
        .cloned()
        .ok_or_else(|| ConvertError::PluginMissing {
            format: format.to_string(),
            known: format_names(self.output_formats()),
        })
    }

    pub fn input_formats(&self) -> Vec<EbookFormat> {
        let mut formats: Vec<EbookFormat> = Vec::new();
        for plugin in &self.inputs {
            for f in plugin.supported_formats() {
                if !formats.contains(f) {
                    formats.push(*f);
                }
            }
        }
        formats
    }

    pub fn output_formats(&self) -> Vec<EbookFormat> {
        let mut formats: Vec<EbookFormat> = Vec::new();
        for plugin in &self.outputs {
            let f = plugin.output_format();
            if !formats.contains(&f) {
                formats.push(f);
            }
        }
        formats
    }

    pub fn inputs(&self) -> &[Arc<dyn InputPlugin>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<dyn OutputPlugin>] {
        &self.outputs
    }
}

fn best<T>(candidates: impl Iterator<Item = (i32, T)>) -> Option<T> {
    let mut winner: Option<(i32, T)> = None;
    for (priority, plugin) in candidates {
        let replace = winner.as_ref().map_or(true, |(p, _)| priority > *p);
        if replace {
            winner = Some((priority, plugin));
        }
    }
    winner.map(|(_, p)| p)
}

pub(crate) fn format_names(formats: Vec<EbookFormat>) -> Vec<String> {
    let mut names: Vec<String> = formats.iter().map(|f| f.to_string()).collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::BookDocument;
    use crate::error::ErrorKind;
    use crate::plugin::Context;
    use std::path::{Path, PathBuf};

    struct Named(&'static str, i32);

    impl InputPlugin for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn supported_formats(&self) -> &[EbookFormat] {
            &[EbookFormat::Txt, EbookFormat::Markdown]
        }
        fn priority(&self) -> i32 {
            self.1
        }
        fn convert(&self, _: &Path, _: EbookFormat, scratch: &Path, _: &Context<'_>) -> Result<PathBuf> {
            Ok(scratch.join("content.opf"))
        }
    }

    struct Out;

    impl OutputPlugin for Out {
        fn name(&self) -> &str {
            "out"
        }
        fn output_format(&self) -> EbookFormat {
            EbookFormat::Epub
        }
        fn convert(&self, _: &BookDocument, _: &Path, _: EbookFormat, _: &Context<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_by_priority_then_order() {
        let mut registry = PluginRegistry::new();
        registry
            .register_input(Named("first", 0))
            .register_input(Named("second", 0))
            .register_input(Named("low", -1));
        assert_eq!(registry.input_for(EbookFormat::Txt).unwrap().name(), "first");

        registry.register_input(Named("preferred", 5));
        assert_eq!(registry.input_for(EbookFormat::Markdown).unwrap().name(), "preferred");
    }

    #[test]
    fn test_missing_plugin_lists_known_formats() {
        let mut registry = PluginRegistry::new();
        registry.register_input(Named("txt", 0)).register_output(Out);
        let err = registry.input_for(EbookFormat::Pdf).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::PluginMissing);
        assert!(err.to_string().contains("MD, TXT"));
        assert!(registry.output_for(EbookFormat::Epub).is_ok());
        assert!(registry.output_for(EbookFormat::Oeb).is_err());
    }
}
