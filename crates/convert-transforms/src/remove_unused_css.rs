//! RemoveUnusedCSS: drops style rules whose selectors match nothing.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;

use convert_core::book::BookDocument;
use convert_core::dom::Document;
use convert_core::error::Result;
use convert_core::links;
use convert_core::options::ConversionOptions;
use convert_core::plugin::{Context, Transform};
use convert_core::stylesheet::{CssRule, Stylesheet};
use convert_css::select::{split_selector_list, strip_dynamic_pseudo_classes};
use convert_css::{compile, CompiledSelector};

static CLASS_SELECTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(-?[_a-zA-Z][_a-zA-Z0-9-]*)").expect("static regex"));

/// Prunes every stylesheet against the documents that use it. With
/// `remove_unused_classes`, class tokens no rule refers to are dropped
/// from the markup as well.
pub struct RemoveUnusedCss;

impl Transform for RemoveUnusedCss {
    fn name(&self) -> &str {
        "RemoveUnusedCSS"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn options_consumed(&self) -> &[&str] {
        &["remove_unused_css", "remove_unused_classes"]
    }

    fn run_after(&self) -> &[&str] {
        &["FlattenCSS"]
    }

    fn should_run(&self, options: &ConversionOptions) -> bool {
        options.remove_unused_css || options.remove_unused_classes
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        let opts = ctx.options;
        let users = sheet_users(book)?;
        ctx.check_cancelled()?;

        if opts.remove_unused_css {
            let pruned: Vec<(String, Stylesheet, usize)> = {
                let book_ref: &BookDocument = book;
                users
                    .par_iter()
                    .map(|(sheet_href, docs)| -> Result<(String, Stylesheet, usize)> {
                        let mut sheet = (*book_ref.css(sheet_href)?).clone();
                        let docs = docs
                            .iter()
                            .map(|d| book_ref.xhtml(d))
                            .collect::<Result<Vec<_>>>()?;
                        let removed = prune_rules(&mut sheet.rules, &docs);
                        Ok((sheet_href.clone(), sheet, removed))
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            for (sheet_href, sheet, removed) in pruned {
                if removed > 0 {
                    log::info!("Removed {} unused CSS rules from {}", removed, sheet_href);
                    book.set_css(&sheet_href, sheet)?;
                }
            }
            ctx.check_cancelled()?;
            prune_style_elements(book)?;
        }

        if opts.remove_unused_classes {
            remove_unused_classes(book)?;
        }
        Ok(())
    }
}

/// Documents that each stylesheet applies to: linked directly or through
/// `@import` chains. Sheets no document reaches apply to the whole spine.
fn sheet_users(book: &BookDocument) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut users: BTreeMap<String, BTreeSet<String>> = book
        .iter_manifest()
        .filter(|i| i.is_css())
        .map(|i| (i.href.clone(), BTreeSet::new()))
        .collect();

    let documents: Vec<String> = book
        .iter_manifest()
        .filter(|i| i.is_xhtml())
        .map(|i| i.href.clone())
        .collect();
    for doc_href in &documents {
        let doc = book.xhtml(doc_href)?;
        let mut pending: Vec<String> = linked_sheets(&doc)
            .into_iter()
            .filter_map(|raw| book.resolve_link(doc_href, &raw))
            .collect();
        let mut seen = HashSet::new();
        while let Some(sheet_href) = pending.pop() {
            if !seen.insert(sheet_href.clone()) {
                continue;
            }
            let Some(entry) = users.get_mut(&sheet_href) else {
                continue;
            };
            entry.insert(doc_href.clone());
            let sheet = book.css(&sheet_href)?;
            pending.extend(
                sheet
                    .imports()
                    .filter_map(|(target, _)| book.resolve_link(&sheet_href, target)),
            );
        }
    }

    let spine: BTreeSet<String> = book.spine_hrefs().into_iter().collect();
    for docs in users.values_mut() {
        if docs.is_empty() {
            docs.clone_from(&spine);
        }
    }
    Ok(users)
}

fn linked_sheets(doc: &Document) -> Vec<String> {
    doc.find_all("link")
        .into_iter()
        .filter(|&n| {
            doc.attr(n, "rel")
                .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")))
        })
        .filter_map(|n| doc.attr(n, "href").map(str::to_string))
        .collect()
}

/// Remove style rules (and selectors of a group) that match no element of
/// `docs`; empty `@media` blocks go too. Returns the number of rules
/// removed.
fn prune_rules(rules: &mut Vec<CssRule>, docs: &[Arc<Document>]) -> usize {
    let mut removed = 0;
    rules.retain_mut(|rule| match rule {
        CssRule::Style(style) => match used_selectors(&style.selectors, docs) {
            Some(used) if used.is_empty() => {
                removed += 1;
                false
            }
            Some(used) => {
                style.selectors = used.join(", ");
                true
            }
            None => true,
        },
        CssRule::Media { rules: inner, .. } => {
            removed += prune_rules(inner, docs);
            !inner.is_empty()
        }
        _ => true,
    });
    removed
}

/// The selectors of a group that match something. `None` keeps the group
/// as written, which is what happens when a selector does not parse.
fn used_selectors(group: &str, docs: &[Arc<Document>]) -> Option<Vec<String>> {
    let mut used = Vec::new();
    let mut dropped = false;
    for selector in split_selector_list(group) {
        let compiled = match compile(&strip_dynamic_pseudo_classes(&selector)) {
            Ok(compiled) => compiled,
            Err(e) => {
                log::debug!("Keeping rule with unsupported selector: {}", e);
                return None;
            }
        };
        if docs.iter().any(|doc| matches_any(doc, &compiled)) {
            used.push(selector);
        } else {
            dropped = true;
        }
    }
    if dropped {
        Some(used)
    } else {
        None
    }
}

fn matches_any(doc: &Document, selector: &CompiledSelector) -> bool {
    doc.elements().into_iter().any(|n| selector.matches(doc, n))
}

/// `<style>` blocks only apply to their own document.
fn prune_style_elements(book: &mut BookDocument) -> Result<()> {
    let documents: Vec<String> = book
        .iter_manifest()
        .filter(|i| i.is_xhtml())
        .map(|i| i.href.clone())
        .collect();
    for doc_href in documents {
        let doc = book.xhtml(&doc_href)?;
        let blocks = links::style_elements(&doc);
        if blocks.is_empty() {
            continue;
        }
        let mut edits = Vec::new();
        for (node, text) in blocks {
            let mut sheet = Stylesheet::parse(&text);
            if prune_rules(&mut sheet.rules, std::slice::from_ref(&doc)) > 0 {
                edits.push((node, sheet));
            }
        }
        if edits.is_empty() {
            continue;
        }
        let doc = book.xhtml_mut(&doc_href)?;
        for (node, sheet) in edits {
            if sheet.is_empty() {
                doc.detach(node);
            } else {
                doc.set_text_content(node, &sheet.to_css());
            }
        }
        log::debug!("Pruned <style> blocks in {}", doc_href);
    }
    Ok(())
}

/// Drop class tokens no selector anywhere in the book refers to.
fn remove_unused_classes(book: &mut BookDocument) -> Result<()> {
    let mut referenced: HashSet<String> = HashSet::new();
    let mut collect = |sheet: &Stylesheet| {
        for rule in sheet.style_rules() {
            for caps in CLASS_SELECTOR.captures_iter(&rule.selectors) {
                referenced.insert(caps[1].to_string());
            }
        }
    };
    let sheets: Vec<String> = book
        .iter_manifest()
        .filter(|i| i.is_css())
        .map(|i| i.href.clone())
        .collect();
    for sheet_href in &sheets {
        collect(&*book.css(sheet_href)?);
    }
    let documents: Vec<String> = book
        .iter_manifest()
        .filter(|i| i.is_xhtml())
        .map(|i| i.href.clone())
        .collect();
    for doc_href in &documents {
        for (_, text) in links::style_elements(&*book.xhtml(doc_href)?) {
            collect(&Stylesheet::parse(&text));
        }
    }

    let mut dropped = 0usize;
    for doc_href in &documents {
        let doc = book.xhtml(doc_href)?;
        let stale: Vec<_> = doc
            .elements()
            .into_iter()
            .filter(|&n| {
                doc.attr(n, "class")
                    .is_some_and(|c| c.split_whitespace().any(|t| !referenced.contains(t)))
            })
            .collect();
        if stale.is_empty() {
            continue;
        }
        let doc = book.xhtml_mut(doc_href)?;
        for node in stale {
            let kept: Vec<String> = doc
                .attr(node, "class")
                .unwrap_or("")
                .split_whitespace()
                .filter(|t| referenced.contains(*t))
                .map(str::to_string)
                .collect();
            dropped += 1;
            if kept.is_empty() {
                doc.remove_attr(node, "class");
            } else {
                doc.set_attr(node, "class", kept.join(" "));
            }
        }
    }
    if dropped > 0 {
        log::info!("Removed unused classes from {} elements", dropped);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{book, text_of, xhtml};

    const LINK: &str = "<link rel=\"stylesheet\" href=\"style.css\"/>";

    fn run(book: &mut BookDocument, opts: &ConversionOptions) {
        RemoveUnusedCss.apply(book, &Context::new(opts)).unwrap();
    }

    #[test]
    fn test_unused_rule_removed_and_markup_untouched() {
        let mut book = book(
            &[("ch.xhtml", xhtml(LINK, "<p class=\"used\">x</p>"))],
            &[("style.css", ".used {color:red;} .unused {color:green;}")],
        );
        let markup = text_of(&book, "ch.xhtml");
        run(&mut book, &ConversionOptions::default());

        let sheet = book.css("style.css").unwrap();
        let rules = sheet.style_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].selectors, ".used");
        assert_eq!(text_of(&book, "ch.xhtml"), markup);
    }

    #[test]
    fn test_groups_media_and_dynamic_pseudo_classes() {
        let css = "h1, .gone { color: red } a:hover { color: blue } p::first-line { color: red } \
                   @media print { .gone { color: red } } \
                   @media screen { p { margin: 0 } .gone { margin: 1em } } \
                   p:no-such-state { color: red }";
        let mut book = book(
            &[("ch.xhtml", xhtml(LINK, "<h1>t</h1><p><a href=\"#\">l</a></p>"))],
            &[("style.css", css)],
        );
        run(&mut book, &ConversionOptions::default());

        let out = book.css("style.css").unwrap().to_css();
        assert!(out.contains("h1 {"), "{}", out);
        assert!(!out.contains(".gone"));
        assert!(out.contains("a:hover"));
        assert!(out.contains("p::first-line"));
        assert!(!out.contains("@media print"));
        assert!(out.contains("@media screen"));
        assert!(out.contains("p:no-such-state"));
    }

    #[test]
    fn test_imports_reach_their_documents() {
        let mut book = book(
            &[
                ("a.xhtml", xhtml("<link rel=\"stylesheet\" href=\"main.css\"/>", "<p class=\"x\">a</p>")),
                ("b.xhtml", xhtml("", "<div class=\"y\">b</div>")),
            ],
            &[
                ("main.css", "@import url(\"base.css\"); .x { color: red }"),
                ("base.css", ".x { margin: 0 } .y { margin: 0 }"),
                ("orphan.css", ".y { color: red } .x { color: red }"),
            ],
        );
        run(&mut book, &ConversionOptions::default());

        let base = book.css("base.css").unwrap().to_css();
        assert!(base.contains(".x"));
        assert!(!base.contains(".y"));
        let orphan = book.css("orphan.css").unwrap().to_css();
        assert!(orphan.contains(".y") && orphan.contains(".x"));
    }

    #[test]
    fn test_style_elements_pruned_against_own_document() {
        let head = "<style>.here { color: red } .elsewhere { color: blue }</style><style>.none { x: y }</style>";
        let mut book = book(&[("ch.xhtml", xhtml(head, "<p class=\"here\">x</p>"))], &[]);
        run(&mut book, &ConversionOptions::default());

        let doc = book.xhtml("ch.xhtml").unwrap();
        let styles = doc.find_all("style");
        assert_eq!(styles.len(), 1);
        let text = doc.text_content(styles[0]);
        assert!(text.contains(".here"));
        assert!(!text.contains(".elsewhere"));
    }

    #[test]
    fn test_unused_classes_removed() {
        let mut book = book(
            &[("ch.xhtml", xhtml(LINK, "<p id=\"a\" class=\"used stale\">x</p><p id=\"b\" class=\"stale\">y</p>"))],
            &[("style.css", ".used { color: red }")],
        );
        let opts = ConversionOptions {
            remove_unused_classes: true,
            ..ConversionOptions::default()
        };
        run(&mut book, &opts);

        let doc = book.xhtml("ch.xhtml").unwrap();
        assert_eq!(doc.attr(doc.element_by_id("a").unwrap(), "class"), Some("used"));
        assert_eq!(doc.attr(doc.element_by_id("b").unwrap(), "class"), None);
    }
}
