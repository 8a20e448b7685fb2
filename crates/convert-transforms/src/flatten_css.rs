//! FlattenCSS: bakes the cascade into per-element classes of a single
//! shared stylesheet.
//!
//! Styles of every content document are resolved in parallel (the
//! container is only read); classes are then assigned and documents
//! rewritten on the driver thread so numbering is deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};

use rayon::prelude::*;

use convert_core::book::{BookDocument, ManifestData};
use convert_core::dom::{Document, NodeId};
use convert_core::error::Result;
use convert_core::href;
use convert_core::links;
use convert_core::options::ConversionOptions;
use convert_core::plugin::{Context, Transform};
use convert_core::stylesheet::{CssRule, Declaration, DeclarationBlock, StyleRule, Stylesheet};
use convert_css::values::format_number;
use convert_css::{CascadeOptions, Origin, PseudoElement, StyleDeclaration, Stylizer};
use convert_utils::mime::CSS_MIME;

const CLASS_PREFIX: &str = "calibre";
const SHARED_SHEET: &str = "stylesheet";

/// Replaces every stylesheet, `<style>` element and `style` attribute with
/// classes in one shared `stylesheet.css`. Identical declaration blocks
/// share a class across the whole book.
pub struct FlattenCss;

impl Transform for FlattenCss {
    fn name(&self) -> &str {
        "FlattenCSS"
    }

    fn priority(&self) -> i32 {
        70
    }

    fn options_consumed(&self) -> &[&str] {
        &[
            "flatten_css",
            "extra_css",
            "filter_css",
            "base_font_size",
            "margin_top",
            "margin_bottom",
            "margin_left",
            "margin_right",
        ]
    }

    fn should_run(&self, options: &ConversionOptions) -> bool {
        options.flatten_css
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        book.parse_all()?;
        let opts = ctx.options;
        let cascade = CascadeOptions::from_options(opts);
        if !has_author_styling(book, &cascade)? {
            log::debug!("No author styling, nothing to flatten");
            return Ok(());
        }

        let documents = content_documents(book);
        let sheet_href = match book.item(&format!("{}.css", SHARED_SHEET)) {
            Some(item) if !item.is_css() => book.manifest.generate_href(SHARED_SHEET, "css"),
            _ => format!("{}.css", SHARED_SHEET),
        };
        let filtered = opts.filtered_css_properties();

        ctx.check_cancelled()?;
        let flat: Vec<FlatItem> = {
            let book_ref: &BookDocument = book;
            documents
                .par_iter()
                .map(|item_href| flatten_item(book_ref, item_href, &cascade, opts, &filtered, &sheet_href))
                .collect::<Result<Vec<_>>>()?
        };
        ctx.check_cancelled()?;

        let mut classes = ClassTable::default();
        let mut faces: Vec<DeclarationBlock> = Vec::new();
        let mut seen_faces: HashSet<String> = HashSet::new();
        for (n, item) in flat.iter().enumerate() {
            for face in &item.font_faces {
                if seen_faces.insert(face.to_inline_css()) {
                    faces.push(face.clone());
                }
            }
            let assigned: HashMap<NodeId, String> = item
                .styles
                .iter()
                .map(|(node, style)| (*node, classes.class_for(style)))
                .collect();
            let link = href::percent_encode_href(&href::relative(&item.href, &sheet_href));
            rewrite_document(book.xhtml_mut(&item.href)?, &assigned, &link);
            ctx.report_progress((n + 1) as f64 / flat.len().max(1) as f64, "Flattening CSS");
        }

        let old_sheets: Vec<String> = book
            .iter_manifest()
            .filter(|i| i.is_css())
            .map(|i| i.href.clone())
            .collect();
        for old in old_sheets {
            book.remove_item(&old, false)?;
        }

        let sheet = build_sheet(&classes, faces, opts);
        log::info!(
            "Flattened CSS of {} documents into {} classes in {}",
            flat.len(),
            classes.len(),
            sheet_href
        );
        book.add_item(&sheet_href, CSS_MIME, ManifestData::css(sheet))?;
        Ok(())
    }
}

/// Spine documents in reading order, then other XHTML items.
fn content_documents(book: &BookDocument) -> Vec<String> {
    let mut out = book.spine_hrefs();
    let in_spine: HashSet<String> = out.iter().cloned().collect();
    out.extend(
        book.iter_manifest()
            .filter(|i| i.is_xhtml() && !in_spine.contains(&i.href))
            .map(|i| i.href.clone()),
    );
    out
}

fn has_author_styling(book: &BookDocument, cascade: &CascadeOptions) -> Result<bool> {
    if cascade.extra_css.is_some() || book.iter_manifest().any(|i| i.is_css()) {
        return Ok(true);
    }
    for item in book.iter_manifest().filter(|i| i.is_xhtml()) {
        let doc = book.xhtml(&item.href)?;
        let styled = doc
            .elements()
            .into_iter()
            .any(|n| doc.is_named(n, "style") || doc.attr(n, "style").is_some());
        if styled {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Flattened declarations of one element and its pseudo-elements.
#[derive(Debug, Clone, PartialEq)]
struct ElementStyle {
    own: Vec<(String, String)>,
    pseudo: Vec<(PseudoElement, Vec<(String, String)>)>,
}

impl ElementStyle {
    fn key(&self) -> String {
        let mut key = block_text(&self.own);
        for (pseudo, decls) in &self.pseudo {
            key.push_str(&format!("|{}{{{}}}", pseudo, block_text(decls)));
        }
        key
    }
}

fn block_text(decls: &[(String, String)]) -> String {
    decls
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join("; ")
}

struct FlatItem {
    href: String,
    styles: Vec<(NodeId, ElementStyle)>,
    font_faces: Vec<DeclarationBlock>,
}

fn flatten_item(
    book: &BookDocument,
    item_href: &str,
    cascade: &CascadeOptions,
    opts: &ConversionOptions,
    filtered: &[String],
    sheet_href: &str,
) -> Result<FlatItem> {
    let stylizer = Stylizer::new(book, item_href, cascade)?;
    let doc = stylizer.document().clone();
    let scale = (opts.base_font_size > 0.0).then(|| opts.base_font_size / stylizer.base_font_size_pt());

    let mut styles = Vec::new();
    for node in doc.elements() {
        let mut own = stylizer
            .specified(node)
            .map(|m| flattened(m, filtered, sheet_href))
            .unwrap_or_default();
        if let Some(scale) = scale {
            if let Some(slot) = own.iter_mut().find(|(k, _)| k == "font-size") {
                let size = stylizer.computed_font_size_pt(node) * scale;
                slot.1 = format!("{}pt", format_number(size as f32));
            }
        }
        let pseudo: Vec<(PseudoElement, Vec<(String, String)>)> = stylizer
            .pseudo_elements_of(node)
            .into_iter()
            .filter_map(|pe| {
                let decls = flattened(stylizer.pseudo_specified(node, pe)?, filtered, sheet_href);
                (!decls.is_empty()).then_some((pe, decls))
            })
            .collect();
        if own.is_empty() && pseudo.is_empty() {
            continue;
        }
        styles.push((node, ElementStyle { own, pseudo }));
    }

    let font_faces = stylizer
        .font_faces()
        .iter()
        .map(|face| {
            face.declarations
                .iter()
                .map(|d| Declaration::new(d.name.clone(), rebase_urls(&d.value, &face.sheet_href, sheet_href)))
                .collect::<DeclarationBlock>()
        })
        .collect();

    Ok(FlatItem {
        href: item_href.to_string(),
        styles,
        font_faces,
    })
}

/// Author, user and inline declarations of a cascade result, with
/// filtered properties dropped and URLs made relative to the shared sheet.
fn flattened(
    declarations: &BTreeMap<String, StyleDeclaration>,
    filtered: &[String],
    sheet_href: &str,
) -> Vec<(String, String)> {
    declarations
        .values()
        .filter(|d| d.origin != Origin::UserAgent)
        .filter(|d| !is_filtered(&d.name, filtered))
        .map(|d| (d.name.clone(), rebase_urls(d.value.trim(), &d.base, sheet_href)))
        .collect()
}

/// A filter entry names a property and all its longhands.
fn is_filtered(name: &str, filtered: &[String]) -> bool {
    filtered.iter().any(|f| {
        name == f || (name.starts_with(f.as_str()) && name.as_bytes().get(f.len()) == Some(&b'-'))
    })
}

fn rebase_urls(value: &str, base: &str, sheet_href: &str) -> String {
    if !value.to_ascii_lowercase().contains("url(") {
        return value.to_string();
    }
    links::rewrite_css_text(value, &mut |raw| {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') || href::is_external(raw) {
            return None;
        }
        let target = href::resolve(base, raw);
        Some(href::percent_encode_href(&href::relative(sheet_href, &target)))
    })
}

/// Global table of declaration blocks to class names, in first-use order.
#[derive(Default)]
struct ClassTable {
    by_key: HashMap<String, String>,
    ordered: Vec<(String, ElementStyle)>,
}

impl ClassTable {
    fn class_for(&mut self, style: &ElementStyle) -> String {
        let key = style.key();
        if let Some(name) = self.by_key.get(&key) {
            return name.clone();
        }
        let name = format!("{}{}", CLASS_PREFIX, self.ordered.len() + 1);
        self.by_key.insert(key, name.clone());
        self.ordered.push((name.clone(), style.clone()));
        name
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

fn rewrite_document(doc: &mut Document, assigned: &HashMap<NodeId, String>, link_href: &str) {
    let mut doomed = Vec::new();
    for node in doc.elements() {
        doc.remove_attr(node, "style");
        match assigned.get(&node) {
            Some(class) => doc.set_attr(node, "class", class.clone()),
            None => {
                doc.remove_attr(node, "class");
            }
        }
        let is_stylesheet_link = doc.is_named(node, "link")
            && doc
                .attr(node, "rel")
                .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")));
        if doc.is_named(node, "style") || is_stylesheet_link {
            doomed.push(node);
        }
    }
    for node in doomed {
        doc.detach(node);
    }

    let head = match doc.head() {
        Some(head) => head,
        None => {
            let head = doc.create_element("head", Vec::new());
            match (doc.body(), doc.root_element()) {
                (Some(body), _) => doc.insert_before(body, head),
                (None, Some(root)) => doc.append_child(root, head),
                (None, None) => {}
            }
            head
        }
    };
    let link = doc.create_element(
        "link",
        vec![
            ("rel".to_string(), "stylesheet".to_string()),
            ("type".to_string(), CSS_MIME.to_string()),
            ("href".to_string(), link_href.to_string()),
        ],
    );
    doc.append_child(head, link);
}

fn build_sheet(classes: &ClassTable, faces: Vec<DeclarationBlock>, opts: &ConversionOptions) -> Stylesheet {
    let mut rules: Vec<CssRule> = faces.into_iter().map(CssRule::FontFace).collect();

    let mut page = DeclarationBlock::new();
    page.set("margin-top", format!("{}pt", format_number(opts.margin_top as f32)));
    page.set("margin-bottom", format!("{}pt", format_number(opts.margin_bottom as f32)));
    page.set("margin-left", format!("{}pt", format_number(opts.margin_left as f32)));
    page.set("margin-right", format!("{}pt", format_number(opts.margin_right as f32)));
    rules.push(CssRule::Page {
        selector: String::new(),
        declarations: page,
    });

    for (class, style) in &classes.ordered {
        if !style.own.is_empty() {
            rules.push(style_rule(format!(".{}", class), &style.own));
        }
        for (pseudo, decls) in &style.pseudo {
            rules.push(style_rule(format!(".{}{}", class, pseudo), decls));
        }
    }
    Stylesheet { rules }
}

fn style_rule(selectors: String, decls: &[(String, String)]) -> CssRule {
    CssRule::Style(StyleRule {
        selectors,
        declarations: decls
            .iter()
            .map(|(k, v)| Declaration::new(k.clone(), v.clone()))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{book, text_of, xhtml};

    fn run(book: &mut BookDocument, opts: &ConversionOptions) {
        FlattenCss.apply(book, &Context::new(opts)).unwrap();
    }

    fn class_of(doc: &Document, id: &str) -> Option<String> {
        doc.attr(doc.element_by_id(id).unwrap(), "class").map(str::to_string)
    }

    #[test]
    fn test_flatten_to_shared_classes() {
        let head = "<link rel=\"stylesheet\" href=\"../css/main.css\"/><style>.note { font-style: italic }</style>";
        let body = "<p id=\"a\">one</p><p id=\"b\">two</p><p id=\"c\" class=\"note\" style=\"color: blue\">three</p><div id=\"d\">plain</div>";
        let mut book = book(
            &[
                ("text/ch1.xhtml", xhtml(head, body)),
                ("text/ch2.xhtml", xhtml(head, "<p id=\"e\">again</p>")),
            ],
            &[("css/main.css", "p { color: red; margin: 0 }")],
        );
        run(&mut book, &ConversionOptions::default());

        assert!(book.item("css/main.css").is_none());
        let sheets = book.manifest.items_of_type(CSS_MIME);
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].href, "stylesheet.css");

        let doc = book.xhtml("text/ch1.xhtml").unwrap();
        assert_eq!(class_of(&doc, "a").as_deref(), Some("calibre1"));
        assert_eq!(class_of(&doc, "b").as_deref(), Some("calibre1"));
        assert_eq!(class_of(&doc, "c").as_deref(), Some("calibre2"));
        assert_eq!(class_of(&doc, "d"), None);
        assert!(doc.elements().into_iter().all(|n| doc.attr(n, "style").is_none()));
        assert!(doc.find_first("style").is_none());
        let links = doc.find_all("link");
        assert_eq!(links.len(), 1);
        assert_eq!(doc.attr(links[0], "href"), Some("../stylesheet.css"));

        let doc2 = book.xhtml("text/ch2.xhtml").unwrap();
        assert_eq!(class_of(&doc2, "e").as_deref(), Some("calibre1"));

        let css = text_of(&book, "stylesheet.css");
        assert!(css.contains(".calibre1 {"));
        assert!(css.contains("color: red"));
        assert!(css.contains("margin-top: 0"));
        assert!(css.contains("color: blue"));
        assert!(css.contains("font-style: italic"));
        assert!(css.contains("@page"));
        assert!(!css.contains("display"));
    }

    #[test]
    fn test_unstyled_book_is_untouched() {
        let mut book = book(&[("ch.xhtml", xhtml("", "<p>plain</p>"))], &[]);
        let before = text_of(&book, "ch.xhtml");
        run(&mut book, &ConversionOptions::default());
        assert_eq!(text_of(&book, "ch.xhtml"), before);
        assert_eq!(book.manifest.len(), 1);
    }

    #[test]
    fn test_filter_css_and_font_size_normalization() {
        let mut book = book(
            &[("ch.xhtml", xhtml("", "<p id=\"p\" style=\"margin: 1em; color: red; font-size: 2em\">x</p>"))],
            &[],
        );
        let opts = ConversionOptions {
            filter_css: Some("margin, color".to_string()),
            base_font_size: 10.0,
            ..ConversionOptions::default()
        };
        run(&mut book, &opts);

        let css = text_of(&book, "stylesheet.css");
        assert!(!css.contains("margin-left: 1em"));
        assert!(!css.contains("color"));
        assert!(css.contains("font-size: 20pt"));
    }

    #[test]
    fn test_urls_rebased_and_font_faces_kept() {
        let css = "@font-face { font-family: Serif1; src: url(../fonts/s.ttf) } \
                   p { background-image: url(../img/a.png) } \
                   p::before { content: \"> \" }";
        let mut book = book(
            &[("text/ch.xhtml", xhtml("<link rel=\"stylesheet\" href=\"../css/s.css\"/>", "<p id=\"p\">x</p>"))],
            &[("css/s.css", css)],
        );
        run(&mut book, &ConversionOptions::default());

        let out = text_of(&book, "stylesheet.css");
        assert!(out.contains("url(\"img/a.png\")"), "{}", out);
        assert!(out.contains("@font-face"));
        assert!(out.contains("url(\"fonts/s.ttf\")"));
        assert!(out.contains(".calibre1::before"));
        assert!(out.contains("content: \"> \""));
    }

    #[test]
    fn test_is_filtered() {
        let filtered = vec!["margin".to_string(), "color".to_string()];
        assert!(is_filtered("margin-top", &filtered));
        assert!(is_filtered("color", &filtered));
        assert!(!is_filtered("marginal", &filtered));
        assert!(!is_filtered("background-color", &filtered));
    }
}
