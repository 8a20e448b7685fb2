//! Layered TOML configuration.
//!
//! Layers, lowest first: the global file in the user config directory, the
//! project-local `.ebook-convert-rs.toml`, then an explicit `--config` file.
//! Tables are merged key by key, so a later layer only overrides what it
//! actually names. Every key that appears in some layer is recorded as a
//! user value and therefore outranks plugin recommendations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use convert_core::options::{ConversionOptions, OptionSet};

pub const LOCAL_CONFIG: &str = ".ebook-convert-rs.toml";

/// One configuration file and whether it must exist and parse.
#[derive(Debug, Clone)]
pub struct Layer {
    pub path: PathBuf,
    pub required: bool,
}

/// Global, project-local and explicit layers in merge order.
pub fn default_layers(explicit: Option<&Path>) -> Vec<Layer> {
    let mut layers = Vec::new();
    if let Some(config_dir) = dirs::config_dir() {
        layers.push(Layer {
            path: config_dir.join("ebook-convert-rs").join("config.toml"),
            required: false,
        });
    }
    layers.push(Layer {
        path: PathBuf::from(LOCAL_CONFIG),
        required: false,
    });
    if let Some(path) = explicit {
        layers.push(Layer {
            path: path.to_path_buf(),
            required: true,
        });
    }
    layers
}

/// Merge the layers into an option set. Optional layers that are missing
/// are skipped and unparsable ones are logged; a required layer must load.
pub fn load(layers: &[Layer]) -> Result<OptionSet> {
    let mut merged = toml::Table::new();
    for layer in layers {
        match read_layer(&layer.path) {
            Ok(Some(table)) => {
                log::debug!("Loaded config {}", layer.path.display());
                merge_tables(&mut merged, table);
            }
            Ok(None) if layer.required => {
                anyhow::bail!("config file {} does not exist", layer.path.display())
            }
            Ok(None) => {}
            Err(e) if layer.required => return Err(e),
            Err(e) => log::warn!("{:#}", e),
        }
    }

    let options: ConversionOptions = toml::Value::Table(merged.clone())
        .try_into()
        .context("invalid configuration")?;
    let mut set = OptionSet::new(options);
    for key in merged.keys() {
        if let Err(e) = set.mark_user(key) {
            log::warn!("Ignoring config key '{}': {}", key, e);
        }
    }
    Ok(set)
}

fn read_layer(path: &Path) -> Result<Option<toml::Table>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
    };
    let table = contents
        .parse::<toml::Table>()
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(table))
}

/// Merge `layer` into `base`. Nested tables (profiles) merge recursively;
/// any other value replaces the earlier one.
pub fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        let toml::Value::Table(incoming) = value else {
            base.insert(key, value);
            continue;
        };
        if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
            merge_tables(existing, incoming);
            continue;
        }
        base.insert(key, toml::Value::Table(incoming));
    }
}

/// Split a `-O name=value` argument.
pub fn parse_option_pair(arg: &str) -> Result<(String, String)> {
    let (name, value) = arg
        .split_once('=')
        .with_context(|| format!("expected NAME=VALUE, got '{}'", arg))?;
    let name = name.trim().replace('-', "_");
    anyhow::ensure!(!name.is_empty(), "empty option name in '{}'", arg);
    Ok((name, value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use convert_core::options::Priority;

    fn layer(dir: &Path, name: &str, contents: &str) -> Layer {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        Layer {
            path,
            required: false,
        }
    }

    #[test]
    fn test_later_layers_override_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let layers = vec![
            layer(
                dir.path(),
                "global.toml",
                "toc_depth = 2\nminify_css = true\n[output_profile]\nname = \"kobo\"\nscreen_width = 536\n",
            ),
            layer(
                dir.path(),
                "local.toml",
                "toc_depth = 4\n[output_profile]\nscreen_height = 710\n",
            ),
        ];
        let set = load(&layers).unwrap();
        let opts = set.options();
        assert_eq!(opts.toc_depth, 4);
        assert!(opts.minify_css);
        assert_eq!(opts.output_profile.name, "kobo");
        assert_eq!(opts.output_profile.screen_width, 536);
        assert_eq!(opts.output_profile.screen_height, 710);
        assert_eq!(opts.margin_top, ConversionOptions::default().margin_top);

        assert_eq!(set.priority_of("toc_depth"), Some(Priority::User));
        assert_eq!(set.priority_of("minify_css"), Some(Priority::User));
        assert_eq!(set.priority_of("margin_top"), None);
    }

    #[test]
    fn test_missing_and_broken_optional_layers() {
        let dir = tempfile::tempdir().unwrap();
        let layers = vec![
            Layer {
                path: dir.path().join("absent.toml"),
                required: false,
            },
            layer(dir.path(), "broken.toml", "toc_depth = [unclosed"),
        ];
        let set = load(&layers).unwrap();
        assert_eq!(set.options().toc_depth, ConversionOptions::default().toc_depth);
    }

    #[test]
    fn test_required_layer_must_load() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Layer {
            path: dir.path().join("absent.toml"),
            required: true,
        };
        assert!(load(&[missing]).is_err());

        let mut broken = layer(dir.path(), "broken.toml", "= nope");
        broken.required = true;
        assert!(load(&[broken]).is_err());
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layers = vec![layer(dir.path(), "bad.toml", "toc_depth = \"deep\"\n")];
        assert!(load(&layers).is_err());
    }

    #[test]
    fn test_parse_option_pair() {
        assert_eq!(
            parse_option_pair("max-toc-links = 10").unwrap(),
            ("max_toc_links".to_string(), "10".to_string())
        );
        assert_eq!(
            parse_option_pair("chapter_regex=^Chapter \\d+=x").unwrap().1,
            "^Chapter \\d+=x"
        );
        assert!(parse_option_pair("no_value").is_err());
        assert!(parse_option_pair("=1").is_err());
    }
}
