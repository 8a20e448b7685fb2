//! Conversion options shared across the pipeline, and the recommendation
//! model plugins use to suggest values.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::book::EbookFormat;
use crate::error::{ConvertError, Result};

/// All options controlling the conversion pipeline.
///
/// Every field has a stable name (its serde name) and can be read or
/// written through [`ConversionOptions::get`] / [`ConversionOptions::set`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    // -- General --
    pub verbose: u8,
    pub debug_pipeline: Option<PathBuf>,

    // -- Input --
    pub input_encoding: Option<String>,
    /// How plain text marks paragraphs: `auto`, `block`, `single` or
    /// `unformatted`.
    pub paragraph_type: String,
    /// Levels of local links followed when reading HTML; 0 reads only the
    /// input file.
    pub max_html_levels: u32,

    // -- Look & Feel --
    /// Base font size in points for flattened output; 0 keeps sizes as authored.
    pub base_font_size: f64,
    pub extra_css: Option<String>,
    /// Comma separated CSS property names removed while flattening.
    pub filter_css: Option<String>,
    pub embed_fonts: bool,
    pub subset_embedded_fonts: bool,
    pub flatten_css: bool,
    pub remove_unused_css: bool,
    pub remove_unused_classes: bool,
    pub minify_css: bool,

    // -- Page Setup --
    pub margin_top: f64,
    pub margin_bottom: f64,
    pub margin_left: f64,
    pub margin_right: f64,

    // -- Structure --
    pub chapter_regex: Option<String>,
    /// CSS selector list; matching elements start a new file.
    pub page_breaks_before: Option<String>,
    pub split_on_page_breaks: bool,

    // -- Table of Contents --
    pub toc_depth: u8,
    pub max_toc_links: usize,
    pub use_auto_toc: bool,
    pub normalize_toc_titles: bool,

    // -- Images --
    #[serde(
        serialize_with = "serialize_image_size",
        deserialize_with = "deserialize_image_size"
    )]
    pub max_image_size: Option<(u32, u32)>,

    // -- External helpers --
    pub font_subsetter_command: String,
    pub svg_rasterizer_command: String,
    pub vector_rasterizer_command: String,
    pub helper_timeout_secs: u64,

    // -- Metadata overrides --
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub language: Option<String>,
    pub publisher: Option<String>,
    pub tags: Vec<String>,

    // -- Profiles --
    pub output_profile: OutputProfile,
    pub input_profile: InputProfile,

    // -- Formats (CLI/extension only, not from config file) --
    #[serde(skip)]
    pub input_format: Option<EbookFormat>,
    #[serde(skip)]
    pub output_format: Option<EbookFormat>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            verbose: 0,
            debug_pipeline: None,
            input_encoding: None,
            paragraph_type: "auto".to_string(),
            max_html_levels: 5,
            base_font_size: 0.0,
            extra_css: None,
            filter_css: None,
            embed_fonts: true,
            subset_embedded_fonts: true,
            flatten_css: true,
            remove_unused_css: true,
            remove_unused_classes: false,
            minify_css: false,
            margin_top: 5.0,
            margin_bottom: 5.0,
            margin_left: 5.0,
            margin_right: 5.0,
            chapter_regex: None,
            page_breaks_before: None,
            split_on_page_breaks: true,
            toc_depth: 3,
            max_toc_links: 50,
            use_auto_toc: false,
            normalize_toc_titles: true,
            max_image_size: None,
            font_subsetter_command: "pyftsubset".to_string(),
            svg_rasterizer_command: "rsvg-convert".to_string(),
            vector_rasterizer_command: "magick".to_string(),
            helper_timeout_secs: 60,
            title: None,
            authors: Vec::new(),
            language: None,
            publisher: None,
            tags: Vec::new(),
            output_profile: OutputProfile::default(),
            input_profile: InputProfile::default(),
            input_format: None,
            output_format: None,
        }
    }
}

impl ConversionOptions {
    /// Property names listed in `filter_css`, lower-cased.
    pub fn filtered_css_properties(&self) -> Vec<String> {
        self.filter_css
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_ascii_lowercase())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bounding box for rasterized images: explicit option, else the
    /// output profile screen.
    pub fn image_bounds(&self) -> (u32, u32) {
        self.max_image_size.unwrap_or((
            self.output_profile.screen_width,
            self.output_profile.screen_height,
        ))
    }

    /// Names of all options, sorted.
    pub fn names() -> Vec<String> {
        match serde_json::to_value(ConversionOptions::default()) {
            Ok(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Read an option by name.
    pub fn get(&self, name: &str) -> Option<OptionValue> {
        let value = serde_json::to_value(self).ok()?;
        value.get(name).map(OptionValue::from_json)
    }

    /// Set an option by name. The value must be compatible with the
    /// option's type.
    pub fn set(&mut self, name: &str, value: OptionValue) -> Result<()> {
        let mut json = serde_json::to_value(&*self)
            .map_err(|e| ConvertError::Options(format!("cannot serialize options: {}", e)))?;
        let map = json
            .as_object_mut()
            .ok_or_else(|| ConvertError::Options("options are not a table".to_string()))?;
        if !map.contains_key(name) {
            return Err(ConvertError::Options(format!("unknown option '{}'", name)));
        }
        map.insert(name.to_string(), value.to_json());
        let mut parsed: ConversionOptions = serde_json::from_value(json)
            .map_err(|e| ConvertError::Options(format!("bad value for '{}': {}", name, e)))?;
        parsed.input_format = self.input_format;
        parsed.output_format = self.output_format;
        *self = parsed;
        Ok(())
    }

    /// Set an option from its textual form (`-O name=value`), converting
    /// according to the option's current type.
    pub fn set_from_str(&mut self, name: &str, raw: &str) -> Result<()> {
        let current = self
            .get(name)
            .ok_or_else(|| ConvertError::Options(format!("unknown option '{}'", name)))?;
        let value = OptionValue::parse_like(&current, raw)
            .ok_or_else(|| ConvertError::Options(format!("bad value for '{}': {}", name, raw)))?;
        self.set(name, value)
    }
}

/// Name-typed option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
    /// Nested tables (profiles) travel untyped.
    Table(serde_json::Value),
}

impl OptionValue {
    fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => OptionValue::Null,
            Value::Bool(b) => OptionValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => OptionValue::Int(i),
                None => OptionValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => OptionValue::Str(s.clone()),
            Value::Array(items) if items.iter().all(|v| v.is_string()) => OptionValue::List(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            other => OptionValue::Table(other.clone()),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            OptionValue::Null => Value::Null,
            OptionValue::Bool(b) => Value::Bool(*b),
            OptionValue::Int(i) => Value::from(*i),
            OptionValue::Float(f) => Value::from(*f),
            OptionValue::Str(s) => Value::String(s.clone()),
            OptionValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            OptionValue::Table(v) => v.clone(),
        }
    }

    /// Parse `raw` into the same shape as `like`.
    fn parse_like(like: &OptionValue, raw: &str) -> Option<OptionValue> {
        let raw = raw.trim();
        Some(match like {
            OptionValue::Bool(_) => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => OptionValue::Bool(true),
                "false" | "no" | "off" | "0" => OptionValue::Bool(false),
                _ => return None,
            },
            OptionValue::Int(_) => OptionValue::Int(raw.parse().ok()?),
            OptionValue::Float(_) => OptionValue::Float(raw.parse().ok()?),
            OptionValue::List(_) => OptionValue::List(
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            OptionValue::Table(_) => {
                OptionValue::Table(serde_json::from_str(raw).ok()?)
            }
            OptionValue::Null | OptionValue::Str(_) => {
                if raw.is_empty() {
                    OptionValue::Null
                } else {
                    OptionValue::Str(raw.to_string())
                }
            }
        })
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Str(v)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Null => f.write_str("none"),
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Float(x) => write!(f, "{}", x),
            OptionValue::Str(s) => f.write_str(s),
            OptionValue::List(items) => f.write_str(&items.join(",")),
            OptionValue::Table(v) => write!(f, "{}", v),
        }
    }
}

/// Recommendation priority. `User` is the level of values supplied by the
/// user on the command line or in a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    User,
}

/// A plugin's suggested value for an option.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionRecommendation {
    pub name: String,
    pub value: OptionValue,
    pub priority: Priority,
}

impl OptionRecommendation {
    pub fn new(name: impl Into<String>, value: impl Into<OptionValue>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    User,
    Plugin,
}

/// Options together with the priority each value was set at.
///
/// Merge rule: a higher priority replaces a lower one. At equal priority a
/// user value is never replaced by a plugin recommendation; otherwise the
/// later value wins. Options never set explicitly carry no priority, so any
/// recommendation replaces the built-in default.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    options: ConversionOptions,
    provenance: BTreeMap<String, (Priority, Origin)>,
}

impl OptionSet {
    pub fn new(options: ConversionOptions) -> Self {
        Self {
            options,
            provenance: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut ConversionOptions {
        &mut self.options
    }

    pub fn into_options(self) -> ConversionOptions {
        self.options
    }

    /// Record that the current value of `name` was supplied by the user.
    pub fn mark_user(&mut self, name: &str) -> Result<()> {
        if self.options.get(name).is_none() {
            return Err(ConvertError::Options(format!("unknown option '{}'", name)));
        }
        self.provenance
            .insert(name.to_string(), (Priority::User, Origin::User));
        Ok(())
    }

    /// Set a user value at [`Priority::User`].
    pub fn set_user(&mut self, name: &str, value: OptionValue) -> Result<()> {
        self.set_user_at(name, value, Priority::User)
    }

    /// Set a user value at an explicit priority (presets use lower levels).
    pub fn set_user_at(&mut self, name: &str, value: OptionValue, priority: Priority) -> Result<()> {
        if self.accepts(name, priority, Origin::User) {
            self.options.set(name, value)?;
            self.provenance
                .insert(name.to_string(), (priority, Origin::User));
        }
        Ok(())
    }

    /// Apply one plugin recommendation; returns whether it took effect.
    pub fn recommend(&mut self, rec: &OptionRecommendation) -> Result<bool> {
        if !self.accepts(&rec.name, rec.priority, Origin::Plugin) {
            return Ok(false);
        }
        self.options.set(&rec.name, rec.value.clone())?;
        self.provenance
            .insert(rec.name.clone(), (rec.priority, Origin::Plugin));
        Ok(true)
    }

    /// Merge a plugin's recommendations, logging the ones that applied.
    pub fn merge_recommendations(&mut self, plugin: &str, recs: &[OptionRecommendation]) {
        for rec in recs {
            match self.recommend(rec) {
                Ok(true) => log::debug!(
                    "{} recommends {} = {} ({:?})",
                    plugin,
                    rec.name,
                    rec.value,
                    rec.priority
                ),
                Ok(false) => {}
                Err(e) => log::warn!("{}: ignoring recommendation for {}: {}", plugin, rec.name, e),
            }
        }
    }

    pub fn priority_of(&self, name: &str) -> Option<Priority> {
        self.provenance.get(name).map(|(p, _)| *p)
    }

    fn accepts(&self, name: &str, priority: Priority, origin: Origin) -> bool {
        match self.provenance.get(name) {
            None => true,
            Some((current, current_origin)) => {
                if priority != *current {
                    return priority > *current;
                }
                !(*current_origin == Origin::User && origin == Origin::Plugin)
            }
        }
    }
}

impl From<ConversionOptions> for OptionSet {
    fn from(options: ConversionOptions) -> Self {
        OptionSet::new(options)
    }
}

/// Serialize `Option<(u32, u32)>` as `"WxH"` string.
fn serialize_image_size<S>(val: &Option<(u32, u32)>, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match val {
        Some((w, h)) => s.serialize_str(&format!("{}x{}", w, h)),
        None => s.serialize_none(),
    }
}

/// Deserialize `Option<(u32, u32)>` from `"WxH"` string.
fn deserialize_image_size<'de, D>(d: D) -> std::result::Result<Option<(u32, u32)>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(d)?;
    match opt {
        None => Ok(None),
        Some(s) => parse_image_size(&s).map(Some).ok_or_else(|| {
            serde::de::Error::custom("expected format 'WxH' (e.g. '1200x1600')")
        }),
    }
}

/// Parse `"WxH"`.
pub fn parse_image_size(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Output device profile (screen size, DPI, font sizes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputProfile {
    pub name: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub dpi: f64,
    pub fbase: f64,
    pub fsizes: Vec<f64>,
}

impl Default for OutputProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            screen_width: 600,
            screen_height: 800,
            dpi: 166.0,
            fbase: 12.0,
            fsizes: vec![7.5, 9.0, 10.0, 12.0, 15.5, 20.0, 22.0, 24.0],
        }
    }
}

impl OutputProfile {
    /// Named device presets.
    pub fn preset(name: &str) -> Option<Self> {
        let base = OutputProfile::default();
        let (width, height, dpi) = match name {
            "default" => return Some(base),
            "kindle" => (525, 640, 168.451),
            "kindle_pw" => (658, 940, 212.0),
            "kobo" => (536, 710, 168.451),
            "tablet" => (1200, 1600, 132.0),
            "generic_eink" => (590, 775, 168.451),
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            screen_width: width,
            screen_height: height,
            dpi,
            ..base
        })
    }

    pub fn preset_names() -> &'static [&'static str] {
        &["default", "generic_eink", "kindle", "kindle_pw", "kobo", "tablet"]
    }
}

/// Input device profile: the font size the source was authored for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputProfile {
    pub name: String,
    pub fbase: f64,
    pub fsizes: Vec<f64>,
}

impl Default for InputProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            fbase: 12.0,
            fsizes: vec![7.5, 9.0, 10.0, 12.0, 15.5, 20.0, 22.0, 24.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_round_trip_full() {
        let mut opts = ConversionOptions::default();
        opts.verbose = 2;
        opts.toc_depth = 2;
        opts.max_image_size = Some((1200, 1600));
        opts.extra_css = Some("body { font-size: 14px; }".to_string());
        opts.filter_css = Some("font-family, color".to_string());
        opts.margin_top = 10.0;
        opts.authors = vec!["A. Writer".to_string()];
        opts.output_profile = OutputProfile::preset("kobo").unwrap();

        let toml_str = toml::to_string_pretty(&opts).unwrap();
        let parsed: ConversionOptions = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.verbose, 2);
        assert_eq!(parsed.toc_depth, 2);
        assert_eq!(parsed.max_image_size, Some((1200, 1600)));
        assert_eq!(
            parsed.extra_css.as_deref(),
            Some("body { font-size: 14px; }")
        );
        assert_eq!(parsed.filtered_css_properties(), vec!["font-family", "color"]);
        assert_eq!(parsed.margin_top, 10.0);
        assert_eq!(parsed.authors, vec!["A. Writer"]);
        assert_eq!(parsed.output_profile.name, "kobo");
    }

    #[test]
    fn test_toml_partial_config() {
        let toml_str = r#"
verbose = 1
subset_embedded_fonts = false
"#;
        let opts: ConversionOptions = toml::from_str(toml_str).unwrap();
        assert_eq!(opts.verbose, 1);
        assert!(!opts.subset_embedded_fonts);
        assert_eq!(opts.margin_top, 5.0);
        assert_eq!(opts.toc_depth, 3);
        assert_eq!(opts.font_subsetter_command, "pyftsubset");
    }

    #[test]
    fn test_image_size_serde() {
        let opts: ConversionOptions = toml::from_str(r#"max_image_size = "800x600""#).unwrap();
        assert_eq!(opts.max_image_size, Some((800, 600)));
        assert_eq!(opts.image_bounds(), (800, 600));

        let opts: ConversionOptions = toml::from_str("").unwrap();
        assert_eq!(opts.max_image_size, None);
        assert_eq!(opts.image_bounds(), (600, 800));

        assert!(toml::from_str::<ConversionOptions>(r#"max_image_size = "big""#).is_err());
    }

    #[test]
    fn test_get_and_set_by_name() {
        let mut opts = ConversionOptions::default();
        assert_eq!(opts.get("toc_depth"), Some(OptionValue::Int(3)));
        assert_eq!(opts.get("flatten_css"), Some(OptionValue::Bool(true)));
        assert_eq!(opts.get("no_such_option"), None);

        opts.set("toc_depth", OptionValue::Int(2)).unwrap();
        assert_eq!(opts.toc_depth, 2);

        opts.set_from_str("margin_left", "12.5").unwrap();
        assert_eq!(opts.margin_left, 12.5);
        opts.set_from_str("embed_fonts", "no").unwrap();
        assert!(!opts.embed_fonts);
        opts.set_from_str("authors", "A, B").unwrap();
        assert_eq!(opts.authors, vec!["A", "B"]);
        opts.set_from_str("chapter_regex", "^Chapter").unwrap();
        assert_eq!(opts.chapter_regex.as_deref(), Some("^Chapter"));

        assert!(opts.set("toc_depth", OptionValue::Str("deep".into())).is_err());
        assert!(opts.set_from_str("bogus", "1").is_err());
        assert!(ConversionOptions::names().contains(&"subset_embedded_fonts".to_string()));
    }

    #[test]
    fn test_set_keeps_formats() {
        let mut opts = ConversionOptions::default();
        opts.output_format = Some(EbookFormat::Epub);
        opts.set("verbose", OptionValue::Int(1)).unwrap();
        assert_eq!(opts.output_format, Some(EbookFormat::Epub));
    }

    #[test]
    fn test_recommendation_precedence() {
        let mut set = OptionSet::new(ConversionOptions::default());

        // Defaults yield to any recommendation.
        let low = OptionRecommendation::new("toc_depth", 4i64, Priority::Low);
        assert!(set.recommend(&low).unwrap());
        assert_eq!(set.options().toc_depth, 4);

        // Higher wins, lower loses.
        let high = OptionRecommendation::new("toc_depth", 5i64, Priority::High);
        assert!(set.recommend(&high).unwrap());
        let normal = OptionRecommendation::new("toc_depth", 6i64, Priority::Normal);
        assert!(!set.recommend(&normal).unwrap());
        assert_eq!(set.options().toc_depth, 5);

        // Ties between plugins: later wins.
        let high2 = OptionRecommendation::new("toc_depth", 2i64, Priority::High);
        assert!(set.recommend(&high2).unwrap());
        assert_eq!(set.options().toc_depth, 2);

        // User beats everything below it.
        set.set_user("toc_depth", OptionValue::Int(1)).unwrap();
        let high3 = OptionRecommendation::new("toc_depth", 6i64, Priority::High);
        assert!(!set.recommend(&high3).unwrap());
        assert_eq!(set.priority_of("toc_depth"), Some(Priority::User));
    }

    #[test]
    fn test_user_wins_equal_priority() {
        let mut set = OptionSet::new(ConversionOptions::default());
        set.set_user_at("margin_top", OptionValue::Float(1.0), Priority::Normal)
            .unwrap();
        let rec = OptionRecommendation::new("margin_top", 9.0, Priority::Normal);
        assert!(!set.recommend(&rec).unwrap());
        assert_eq!(set.options().margin_top, 1.0);

        // A later user value at the same level still replaces an earlier one.
        set.set_user_at("margin_top", OptionValue::Float(2.0), Priority::Normal)
            .unwrap();
        assert_eq!(set.options().margin_top, 2.0);
    }

    #[test]
    fn test_mark_user_from_config() {
        let opts: ConversionOptions = toml::from_str("toc_depth = 1").unwrap();
        let mut set = OptionSet::new(opts);
        set.mark_user("toc_depth").unwrap();
        let rec = OptionRecommendation::new("toc_depth", 3i64, Priority::High);
        assert!(!set.recommend(&rec).unwrap());
        assert_eq!(set.options().toc_depth, 1);
        assert!(set.mark_user("nope").is_err());
    }

    #[test]
    fn test_profile_presets() {
        let kindle = OutputProfile::preset("kindle").unwrap();
        assert_eq!(kindle.screen_width, 525);
        assert_eq!(kindle.fbase, 12.0);
        assert!(OutputProfile::preset("nope").is_none());
        for name in OutputProfile::preset_names() {
            assert!(OutputProfile::preset(name).is_some());
        }
    }
}
