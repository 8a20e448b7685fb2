//! SubsetFonts: reduces embedded fonts to the characters the book renders
//! with them.
//!
//! Character usage is gathered per spine item in parallel through the
//! cascade and CSS Fonts 3 face matching; the subsetter then runs once per
//! font file, also in parallel.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use thiserror::Error;

use convert_core::book::BookDocument;
use convert_core::dom::{NodeData, NodeId};
use convert_core::error::Result;
use convert_core::links;
use convert_core::options::ConversionOptions;
use convert_core::plugin::{Context, Transform};
use convert_core::stylesheet::{CssRule, DeclarationBlock, Stylesheet};
use convert_css::{match_face, CascadeOptions, FontFace, PseudoElement, Stylizer, Value};
use convert_utils::mime;

use crate::external::{self, HelperError};

#[derive(Debug, Error)]
pub enum SubsetError {
    #[error(transparent)]
    Helper(#[from] HelperError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Produces a font containing only the glyphs for `chars`.
pub trait FontSubsetter: Send + Sync {
    fn subset(
        &self,
        data: &[u8],
        media_type: &str,
        chars: &BTreeSet<char>,
    ) -> std::result::Result<Vec<u8>, SubsetError>;
}

/// Runs a `pyftsubset` compatible command in a scratch directory.
pub struct ExternalSubsetter {
    pub command: String,
    pub timeout: Duration,
}

impl ExternalSubsetter {
    pub fn from_options(opts: &ConversionOptions) -> Self {
        Self {
            command: opts.font_subsetter_command.clone(),
            timeout: Duration::from_secs(opts.helper_timeout_secs.max(1)),
        }
    }
}

impl FontSubsetter for ExternalSubsetter {
    fn subset(
        &self,
        data: &[u8],
        media_type: &str,
        chars: &BTreeSet<char>,
    ) -> std::result::Result<Vec<u8>, SubsetError> {
        let dir = tempfile::tempdir()?;
        let ext = mime::extension_from_mime(media_type);
        let input = dir.path().join(format!("input.{}", ext));
        let text = dir.path().join("chars.txt");
        let output = dir.path().join(format!("output.{}", ext));
        std::fs::write(&input, data)?;
        std::fs::write(&text, chars.iter().collect::<String>())?;

        let mut args: Vec<OsString> = vec![
            input.into_os_string(),
            format!("--text-file={}", text.display()).into(),
            format!("--output-file={}", output.display()).into(),
            "--layout-features=*".into(),
            "--notdef-outline".into(),
            "--name-IDs=*".into(),
        ];
        if matches!(ext, "woff" | "woff2") {
            args.push(format!("--flavor={}", ext).into());
        }
        external::run(&self.command, args, self.timeout)?;
        Ok(std::fs::read(&output)?)
    }
}

/// Removes `@font-face` rules (and their font files) nothing is rendered
/// with and subsets the remaining fonts to the characters in use.
#[derive(Default)]
pub struct SubsetFonts {
    subsetter: Option<Arc<dyn FontSubsetter>>,
}

impl SubsetFonts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subsetter(subsetter: Arc<dyn FontSubsetter>) -> Self {
        Self {
            subsetter: Some(subsetter),
        }
    }
}

impl Transform for SubsetFonts {
    fn name(&self) -> &str {
        "SubsetFonts"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn options_consumed(&self) -> &[&str] {
        &[
            "subset_embedded_fonts",
            "font_subsetter_command",
            "helper_timeout_secs",
        ]
    }

    fn run_after(&self) -> &[&str] {
        &["FlattenCSS"]
    }

    fn should_run(&self, options: &ConversionOptions) -> bool {
        options.subset_embedded_fonts
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        book.parse_all()?;
        let declared = declared_faces(book)?;
        if declared.is_empty() {
            return Ok(());
        }
        let faces = font_usage(book, &CascadeOptions::from_options(ctx.options))?;
        ctx.check_cancelled()?;

        let used: Vec<&FontFace> = faces.iter().filter(|f| !f.used_chars.is_empty()).collect();
        let (kept, dead): (Vec<&FontFace>, Vec<&FontFace>) = declared
            .iter()
            .partition(|face| used.iter().any(|u| same_rule(u, face)));

        if !dead.is_empty() {
            remove_faces(book, &dead)?;
            let referenced: HashSet<&str> = kept
                .iter()
                .flat_map(|f| f.src.iter().map(String::as_str))
                .collect();
            let orphaned: BTreeSet<&String> = dead
                .iter()
                .flat_map(|f| f.src.iter())
                .filter(|src| !referenced.contains(src.as_str()) && book.item(src).is_some())
                .collect();
            for href in orphaned {
                log::info!("Removing unused font {}", href);
                book.remove_item(href, true)?;
            }
        }

        let mut usage: BTreeMap<String, BTreeSet<char>> = BTreeMap::new();
        for face in &used {
            for src in &face.src {
                usage
                    .entry(src.clone())
                    .or_default()
                    .extend(face.used_chars.iter().copied());
            }
        }
        let jobs: Vec<(String, String, BTreeSet<char>)> = usage
            .into_iter()
            .filter_map(|(href, chars)| {
                let media_type = book.item(&href)?.media_type.clone();
                Some((href, media_type, chars))
            })
            .collect();
        if jobs.is_empty() {
            return Ok(());
        }
        let payloads = jobs
            .iter()
            .map(|(href, _, _)| book.bytes(href))
            .collect::<Result<Vec<_>>>()?;
        ctx.check_cancelled()?;

        let subsetter: Arc<dyn FontSubsetter> = match &self.subsetter {
            Some(s) => s.clone(),
            None => Arc::new(ExternalSubsetter::from_options(ctx.options)),
        };
        let results: Vec<_> = jobs
            .par_iter()
            .zip(payloads.par_iter())
            .map(|((_, media_type, chars), data)| subsetter.subset(data, media_type, chars))
            .collect();

        for ((href, _, chars), (result, original)) in jobs.iter().zip(results.into_iter().zip(payloads)) {
            match result {
                Ok(bytes) if !bytes.is_empty() => {
                    log::info!(
                        "Subset {} to {} characters: {} -> {} bytes",
                        href,
                        chars.len(),
                        original.len(),
                        bytes.len()
                    );
                    book.set_bytes(href, bytes)?;
                }
                Ok(_) => log::warn!("Font subsetter returned nothing for {}, keeping original", href),
                Err(e) => log::warn!("Could not subset {}, keeping original: {}", href, e),
            }
        }
        Ok(())
    }
}

/// Two faces come from the same `@font-face` rule.
fn same_rule(a: &FontFace, b: &FontFace) -> bool {
    a.sheet_href == b.sheet_href && a.declarations == b.declarations
}

/// Every `@font-face` rule in the book: stylesheet items, `@media` blocks
/// inside them, and `<style>` elements of content documents.
fn declared_faces(book: &BookDocument) -> Result<Vec<FontFace>> {
    fn collect(rules: &[CssRule], base: &str, out: &mut Vec<FontFace>) {
        for rule in rules {
            match rule {
                CssRule::FontFace(block) => out.extend(FontFace::from_declarations(block, base)),
                CssRule::Media { rules, .. } => collect(rules, base, out),
                _ => {}
            }
        }
    }

    let mut out = Vec::new();
    for item in book.iter_manifest() {
        if item.is_css() {
            collect(&book.css(&item.href)?.rules, &item.href, &mut out);
        } else if item.is_xhtml() {
            for (_, text) in links::style_elements(&*book.xhtml(&item.href)?) {
                collect(&Stylesheet::parse(&text).rules, &item.href, &mut out);
            }
        }
    }
    Ok(out)
}

/// Every `@font-face` in effect somewhere in the spine, once per rule,
/// with `used_chars` filled from the elements and `::before`/`::after`
/// content rendered with it.
pub fn font_usage(book: &BookDocument, cascade: &CascadeOptions) -> Result<Vec<FontFace>> {
    let per_item: Vec<Vec<FontFace>> = book
        .spine_hrefs()
        .par_iter()
        .map(|item_href| item_font_usage(book, item_href, cascade))
        .collect::<Result<Vec<_>>>()?;

    let mut merged: Vec<FontFace> = Vec::new();
    for face in per_item.into_iter().flatten() {
        match merged.iter_mut().find(|f| same_rule(f, &face)) {
            Some(existing) => existing.used_chars.extend(face.used_chars),
            None => merged.push(face),
        }
    }
    Ok(merged)
}

fn item_font_usage(book: &BookDocument, item_href: &str, cascade: &CascadeOptions) -> Result<Vec<FontFace>> {
    let stylizer = Stylizer::new(book, item_href, cascade)?;
    let mut faces: Vec<FontFace> = stylizer.font_faces().to_vec();
    if faces.is_empty() {
        return Ok(faces);
    }
    let doc = stylizer.document();
    for node in doc.elements() {
        let text = own_text(doc, node);
        if !text.is_empty() {
            let transform = stylizer.style_of(node, "text-transform");
            let request = stylizer.font_request(node, None);
            if let Some(idx) = match_face(&faces, &request) {
                record(&mut faces[idx], &text, &transform);
            }
        }
        for pseudo in [PseudoElement::Before, PseudoElement::After] {
            let Some(content) = stylizer.pseudo_style_of(node, pseudo, "content") else {
                continue;
            };
            let text = content_text(&content);
            if text.is_empty() {
                continue;
            }
            let transform = stylizer
                .pseudo_style_of(node, pseudo, "text-transform")
                .unwrap_or_else(|| stylizer.style_of(node, "text-transform"));
            let request = stylizer.font_request(node, Some(pseudo));
            if let Some(idx) = match_face(&faces, &request) {
                record(&mut faces[idx], &text, &transform);
            }
        }
    }
    Ok(faces)
}

/// Text of the direct text children of an element.
fn own_text(doc: &convert_core::dom::Document, node: NodeId) -> String {
    doc.children(node)
        .iter()
        .filter_map(|&c| match &doc.node(c).data {
            NodeData::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

/// Literal strings of a `content` value.
fn content_text(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::List(items) | Value::Comma(items) => items.iter().map(content_text).collect(),
        _ => String::new(),
    }
}

fn record(face: &mut FontFace, text: &str, transform: &Value) {
    let transform = transform.keyword().unwrap_or("none").to_string();
    for c in text.chars().filter(|c| !c.is_control()) {
        let variants: Vec<char> = match transform.as_str() {
            "uppercase" => c.to_uppercase().collect(),
            "lowercase" => c.to_lowercase().collect(),
            "capitalize" => std::iter::once(c).chain(c.to_uppercase()).collect(),
            _ => vec![c],
        };
        for v in variants {
            if face.covers(v) {
                face.used_chars.insert(v);
            }
        }
    }
}

/// Drop the `dead` rules from stylesheets and `<style>` elements.
fn remove_faces(book: &mut BookDocument, dead: &[&FontFace]) -> Result<()> {
    fn retain(rules: &mut Vec<CssRule>, is_dead: &dyn Fn(&DeclarationBlock) -> bool) -> usize {
        let before = rules.len();
        rules.retain(|r| !matches!(r, CssRule::FontFace(block) if is_dead(block)));
        let mut removed = before - rules.len();
        for rule in rules.iter_mut() {
            if let CssRule::Media { rules, .. } = rule {
                removed += retain(rules, is_dead);
            }
        }
        removed
    }

    let targets: Vec<(String, bool)> = book
        .iter_manifest()
        .filter(|i| i.is_css() || i.is_xhtml())
        .map(|i| (i.href.clone(), i.is_css()))
        .collect();
    for (item_href, is_css) in targets {
        if !dead.iter().any(|f| f.sheet_href == item_href) {
            continue;
        }
        let is_dead = |block: &DeclarationBlock| {
            dead.iter()
                .any(|f| f.sheet_href == item_href && &f.declarations == block)
        };

        if is_css {
            let removed = retain(&mut book.css_mut(&item_href)?.rules, &is_dead);
            log::debug!("Removed {} unused @font-face rules from {}", removed, item_href);
            continue;
        }

        let mut edits = Vec::new();
        for (node, text) in links::style_elements(&*book.xhtml(&item_href)?) {
            let mut sheet = Stylesheet::parse(&text);
            if retain(&mut sheet.rules, &is_dead) > 0 {
                edits.push((node, sheet));
            }
        }
        if edits.is_empty() {
            continue;
        }
        let doc = book.xhtml_mut(&item_href)?;
        for (node, sheet) in edits {
            if sheet.is_empty() {
                doc.detach(node);
            } else {
                doc.set_text_content(node, &sheet.to_css());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{book, text_of, xhtml};
    use convert_core::book::ManifestData;
    use std::sync::Mutex;

    const FONT_MIME: &str = "font/ttf";

    /// Records the requested characters and returns them as the "font".
    #[derive(Default)]
    struct RecordingSubsetter {
        calls: Mutex<Vec<BTreeSet<char>>>,
    }

    impl FontSubsetter for RecordingSubsetter {
        fn subset(
            &self,
            _data: &[u8],
            _media_type: &str,
            chars: &BTreeSet<char>,
        ) -> std::result::Result<Vec<u8>, SubsetError> {
            self.calls.lock().unwrap().push(chars.clone());
            Ok(chars.iter().collect::<String>().into_bytes())
        }
    }

    struct FailingSubsetter;

    impl FontSubsetter for FailingSubsetter {
        fn subset(
            &self,
            _data: &[u8],
            _media_type: &str,
            _chars: &BTreeSet<char>,
        ) -> std::result::Result<Vec<u8>, SubsetError> {
            Err(SubsetError::Io(std::io::Error::other("boom")))
        }
    }

    fn font_book(css: &str, body: &str) -> BookDocument {
        let mut book = book(
            &[("ch.xhtml", xhtml("<link rel=\"stylesheet\" href=\"s.css\"/>", body))],
            &[("s.css", css)],
        );
        for name in ["x.ttf", "y.ttf"] {
            book.add_item(name, FONT_MIME, ManifestData::binary(b"original font".to_vec()))
                .unwrap();
        }
        book
    }

    #[test]
    fn test_used_characters_are_subset() {
        let css = "@font-face { font-family: X; src: url(x.ttf) } p { font-family: X }";
        let mut book = font_book(css, "<p>ABC</p><div>zzz</div>");
        let faces = font_usage(&book, &CascadeOptions::default()).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].used_chars, BTreeSet::from(['A', 'B', 'C']));

        let subsetter = Arc::new(RecordingSubsetter::default());
        let opts = ConversionOptions::default();
        SubsetFonts::with_subsetter(subsetter.clone())
            .apply(&mut book, &Context::new(&opts))
            .unwrap();

        assert_eq!(*subsetter.calls.lock().unwrap(), vec![BTreeSet::from(['A', 'B', 'C'])]);
        assert_eq!(text_of(&book, "x.ttf"), "ABC");
    }

    #[test]
    fn test_unused_faces_removed_with_their_files() {
        let css = "@font-face { font-family: X; src: url(x.ttf) } \
                   @font-face { font-family: Y; src: url(y.ttf) } \
                   p { font-family: X }";
        let mut book = font_book(css, "<p>hi</p>");
        let opts = ConversionOptions::default();
        SubsetFonts::with_subsetter(Arc::new(RecordingSubsetter::default()))
            .apply(&mut book, &Context::new(&opts))
            .unwrap();

        assert!(book.item("y.ttf").is_none());
        assert!(book.item("x.ttf").is_some());
        let out = book.css("s.css").unwrap().to_css();
        assert!(out.contains("x.ttf"));
        assert!(!out.contains("y.ttf"));
    }

    #[test]
    fn test_unused_face_sharing_a_file_is_removed() {
        let css = "@font-face { font-family: X; src: url(x.ttf) } \
                   @font-face { font-family: X; font-weight: bold; src: url(x.ttf) } \
                   p { font-family: X }";
        let mut book = font_book(css, "<p>hi</p>");
        let opts = ConversionOptions::default();
        SubsetFonts::with_subsetter(Arc::new(RecordingSubsetter::default()))
            .apply(&mut book, &Context::new(&opts))
            .unwrap();

        let out = book.css("s.css").unwrap().to_css();
        assert_eq!(out.matches("@font-face").count(), 1);
        assert!(!out.contains("bold"));
        assert!(out.contains("x.ttf"));
        assert_eq!(text_of(&book, "x.ttf"), "hi");
    }

    #[test]
    fn test_unused_face_with_missing_file_is_removed() {
        let css = "@font-face { font-family: X; src: url(x.ttf) } \
                   @font-face { font-family: Z; src: url(missing.ttf) } \
                   p { font-family: X }";
        let mut book = font_book(css, "<p>hi</p>");
        let opts = ConversionOptions::default();
        SubsetFonts::with_subsetter(Arc::new(RecordingSubsetter::default()))
            .apply(&mut book, &Context::new(&opts))
            .unwrap();

        let out = book.css("s.css").unwrap().to_css();
        assert!(!out.contains("missing.ttf"));
        assert!(out.contains("x.ttf"));
    }

    #[test]
    fn test_face_outside_its_unicode_range_is_removed() {
        let css = "@font-face { font-family: X; src: url(x.ttf); unicode-range: U+0041-005A } \
                   p { font-family: X }";
        let mut book = font_book(css, "<p>123</p>");
        let subsetter = Arc::new(RecordingSubsetter::default());
        let opts = ConversionOptions::default();
        SubsetFonts::with_subsetter(subsetter.clone())
            .apply(&mut book, &Context::new(&opts))
            .unwrap();

        assert!(!book.css("s.css").unwrap().to_css().contains("@font-face"));
        assert!(book.item("x.ttf").is_none());
        assert!(subsetter.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unused_faces_in_media_and_style_elements() {
        let css = "@font-face { font-family: X; src: url(x.ttf) } \
                   @media print { @font-face { font-family: P; src: url(x.ttf) } } \
                   p { font-family: X }";
        let head = "<link rel=\"stylesheet\" href=\"s.css\"/>\
                    <style>@font-face { font-family: W; src: url(y.ttf) }</style>";
        let mut book = book(&[("ch.xhtml", xhtml(head, "<p>hi</p>"))], &[("s.css", css)]);
        for name in ["x.ttf", "y.ttf"] {
            book.add_item(name, FONT_MIME, ManifestData::binary(b"original font".to_vec()))
                .unwrap();
        }
        let opts = ConversionOptions::default();
        SubsetFonts::with_subsetter(Arc::new(RecordingSubsetter::default()))
            .apply(&mut book, &Context::new(&opts))
            .unwrap();

        let out = book.css("s.css").unwrap().to_css();
        assert_eq!(out.matches("@font-face").count(), 1);
        assert!(!text_of(&book, "ch.xhtml").contains("y.ttf"));
        assert!(book.item("y.ttf").is_none());
        assert!(book.item("x.ttf").is_some());
    }

    #[test]
    fn test_items_parsed_once_up_front() {
        let mut book = BookDocument::new();
        book.add_item(
            "s.css",
            convert_utils::mime::CSS_MIME,
            ManifestData::binary(b"@font-face { font-family: X; src: url(x.ttf) } p { font-family: X }".to_vec()),
        )
        .unwrap();
        let markup = xhtml("<link rel=\"stylesheet\" href=\"s.css\"/>", "<p>ok</p>");
        book.add_item("ch.xhtml", convert_utils::mime::XHTML_MIME, ManifestData::binary(markup.into_bytes()))
            .unwrap();
        book.add_to_spine("ch.xhtml", true).unwrap();
        book.add_item("x.ttf", FONT_MIME, ManifestData::binary(b"original font".to_vec()))
            .unwrap();
        assert!(book.item("ch.xhtml").unwrap().needs_parse());

        let opts = ConversionOptions::default();
        SubsetFonts::with_subsetter(Arc::new(RecordingSubsetter::default()))
            .apply(&mut book, &Context::new(&opts))
            .unwrap();
        assert!(!book.item("ch.xhtml").unwrap().needs_parse());
        assert!(!book.item("s.css").unwrap().needs_parse());
        assert_eq!(text_of(&book, "x.ttf"), "ko");
    }

    #[test]
    fn test_pseudo_content_transform_and_unicode_range() {
        let css = "@font-face { font-family: X; src: url(x.ttf); unicode-range: U+0041-005A } \
                   p { font-family: X; text-transform: uppercase } \
                   p::before { content: \"q\" }";
        let book = font_book(css, "<p>ab 1</p>");
        let faces = font_usage(&book, &CascadeOptions::default()).unwrap();
        assert_eq!(faces[0].used_chars, BTreeSet::from(['A', 'B', 'Q']));
    }

    #[test]
    fn test_subsetter_failure_keeps_original() {
        let css = "@font-face { font-family: X; src: url(x.ttf) } p { font-family: X }";
        let mut book = font_book(css, "<p>A</p>");
        let opts = ConversionOptions::default();
        SubsetFonts::with_subsetter(Arc::new(FailingSubsetter))
            .apply(&mut book, &Context::new(&opts))
            .unwrap();
        assert_eq!(text_of(&book, "x.ttf"), "original font");
    }

    #[test]
    fn test_content_text() {
        let value = Value::parse("\"a\" counter(x) \"b\"", None);
        assert_eq!(content_text(&value), "ab");
        assert_eq!(content_text(&Value::Keyword("none".into())), "");
    }
}
