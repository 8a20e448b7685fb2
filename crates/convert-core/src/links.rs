//! Reference extraction and rewriting for XHTML and CSS.
//!
//! Callers pass a closure that receives each raw reference exactly as
//! written and returns `Some(new)` to replace it, `None` to keep it.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::dom::{Document, NodeData, NodeId};
use crate::stylesheet::{CssRule, Stylesheet};

static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)\s]*))\s*\)"#).expect("static regex")
});

static CSS_IMPORT_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("static regex")
});

/// Attributes that carry a link to another resource.
pub const LINK_ATTRIBUTES: &[&str] = &["href", "src", "xlink:href", "poster", "data"];

/// Every `url(...)` reference in a chunk of CSS text.
pub fn css_text_urls(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for caps in CSS_URL.captures_iter(text) {
        out.push(url_capture(&caps).to_string());
    }
    for caps in CSS_IMPORT_STRING.captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            out.push(m.as_str().to_string());
        }
    }
    out
}

fn url_capture<'t>(caps: &Captures<'t>) -> &'t str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str())
        .unwrap_or("")
}

/// Rewrite `url(...)` and string `@import` references in CSS text. A
/// replacement of `Some("")` drops the `url()` (it becomes `none`).
pub fn rewrite_css_text(text: &str, f: &mut dyn FnMut(&str) -> Option<String>) -> String {
    let step = CSS_URL.replace_all(text, |caps: &Captures<'_>| {
        let raw = url_capture(caps);
        match f(raw) {
            Some(new) if new.is_empty() => "none".to_string(),
            Some(new) => format!("url(\"{}\")", new.replace('"', "%22")),
            None => caps[0].to_string(),
        }
    });
    CSS_IMPORT_STRING
        .replace_all(&step, |caps: &Captures<'_>| {
            let raw = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
            match f(raw) {
                Some(new) => format!("@import \"{}\"", new.replace('"', "%22")),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// References held by a parsed stylesheet (`@import` targets and `url()`
/// values), in source order.
pub fn stylesheet_urls(sheet: &Stylesheet) -> Vec<String> {
    fn walk(rules: &[CssRule], out: &mut Vec<String>) {
        for rule in rules {
            match rule {
                CssRule::Import { href, .. } => out.push(href.clone()),
                CssRule::Style(r) => {
                    for d in r.declarations.iter() {
                        out.extend(css_text_urls(&d.value));
                    }
                }
                CssRule::FontFace(block) | CssRule::Page { declarations: block, .. } => {
                    for d in block.iter() {
                        out.extend(css_text_urls(&d.value));
                    }
                }
                CssRule::Media { rules, .. } => walk(rules, out),
                CssRule::Other(raw) => out.extend(css_text_urls(raw)),
            }
        }
    }
    let mut out = Vec::new();
    walk(&sheet.rules, &mut out);
    out
}

/// Rewrite references in a parsed stylesheet. An import whose replacement
/// is empty is removed; `url()` values with an empty replacement become
/// `none`.
pub fn rewrite_stylesheet(sheet: &mut Stylesheet, f: &mut dyn FnMut(&str) -> Option<String>) -> bool {
    fn walk(rules: &mut Vec<CssRule>, f: &mut dyn FnMut(&str) -> Option<String>, changed: &mut bool) {
        rules.retain_mut(|rule| match rule {
            CssRule::Import { href, .. } => match f(href) {
                Some(new) if new.is_empty() => {
                    *changed = true;
                    false
                }
                Some(new) => {
                    *href = new;
                    *changed = true;
                    true
                }
                None => true,
            },
            CssRule::Media { rules, .. } => {
                walk(rules, f, changed);
                true
            }
            CssRule::Style(r) => {
                rewrite_block(&mut r.declarations.declarations, f, changed);
                true
            }
            CssRule::FontFace(block) | CssRule::Page { declarations: block, .. } => {
                rewrite_block(&mut block.declarations, f, changed);
                true
            }
            CssRule::Other(raw) => {
                let new = rewrite_css_text(raw, f);
                if new != *raw {
                    *raw = new;
                    *changed = true;
                }
                true
            }
        });
    }
    fn rewrite_block(
        decls: &mut [crate::stylesheet::Declaration],
        f: &mut dyn FnMut(&str) -> Option<String>,
        changed: &mut bool,
    ) {
        for d in decls {
            if !d.value.to_ascii_lowercase().contains("url(") {
                continue;
            }
            let new = rewrite_css_text(&d.value, f);
            if new != d.value {
                d.value = new;
                *changed = true;
            }
        }
    }
    let mut changed = false;
    walk(&mut sheet.rules, f, &mut changed);
    changed
}

/// Raw link values in a document: link attributes, inline `style`
/// attributes and `<style>` element contents.
pub fn document_links(doc: &Document) -> Vec<String> {
    let mut out = Vec::new();
    for id in doc.elements() {
        let Some(el) = doc.element(id) else { continue };
        for (k, v) in &el.attrs {
            if LINK_ATTRIBUTES.contains(&k.as_str()) {
                out.push(v.clone());
            } else if k == "style" {
                out.extend(css_text_urls(v));
            }
        }
        if el.local_name().eq_ignore_ascii_case("style") {
            out.extend(css_text_urls(&doc.text_content(id)));
        }
    }
    out
}

/// What to do with a link attribute.
pub enum LinkAction {
    Keep,
    Replace(String),
    /// Drop the attribute; `img`, `link` and similar elements that exist
    /// only for the link are removed entirely, anchors are unwrapped.
    Remove,
}

/// Rewrite links in a document. Returns true when anything changed.
pub fn rewrite_document(doc: &mut Document, f: &mut dyn FnMut(&str) -> LinkAction) -> bool {
    let mut changed = false;
    let mut doomed: Vec<(NodeId, bool)> = Vec::new();

    for id in doc.elements() {
        let Some(el) = doc.element(id) else { continue };
        let local = el.local_name().to_ascii_lowercase();
        let mut updates: Vec<(String, Option<String>)> = Vec::new();
        for (k, v) in &el.attrs {
            if LINK_ATTRIBUTES.contains(&k.as_str()) {
                match f(v) {
                    LinkAction::Keep => {}
                    LinkAction::Replace(new) => updates.push((k.clone(), Some(new))),
                    LinkAction::Remove => updates.push((k.clone(), None)),
                }
            } else if k == "style" && v.to_ascii_lowercase().contains("url(") {
                let new = rewrite_css_text(v, &mut |raw| link_action_to_css(f(raw)));
                if new != *v {
                    updates.push((k.clone(), Some(new)));
                }
            }
        }
        for (k, v) in updates {
            changed = true;
            match v {
                Some(v) => doc.set_attr(id, &k, v),
                None => {
                    doc.remove_attr(id, &k);
                    match local.as_str() {
                        "a" => doomed.push((id, true)),
                        "img" | "link" | "script" | "image" | "object" | "embed" | "iframe" => {
                            doomed.push((id, false))
                        }
                        _ => {}
                    }
                }
            }
        }
        if local == "style" {
            let text = doc.text_content(id);
            let new = rewrite_css_text(&text, &mut |raw| link_action_to_css(f(raw)));
            if new != text {
                doc.set_text_content(id, &new);
                changed = true;
            }
        }
    }

    for (id, unwrap) in doomed {
        if unwrap {
            doc.unwrap_element(id);
        } else {
            doc.detach(id);
        }
    }
    changed
}

fn link_action_to_css(action: LinkAction) -> Option<String> {
    match action {
        LinkAction::Keep => None,
        LinkAction::Replace(s) => Some(s),
        LinkAction::Remove => Some(String::new()),
    }
}

/// Text nodes directly inside `<style>` elements, for callers that need
/// to parse embedded sheets.
pub fn style_elements(doc: &Document) -> Vec<(NodeId, String)> {
    doc.find_all("style")
        .into_iter()
        .map(|id| {
            let text = doc
                .children(id)
                .iter()
                .filter_map(|&c| match &doc.node(c).data {
                    NodeData::Text(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect::<String>();
            (id, text)
        })
        .collect()
}
