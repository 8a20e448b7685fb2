//! GenerateTOC: synthesizes a table of contents from headings.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use convert_core::book::{BookDocument, TocEntry};
use convert_core::dom::{Document, NodeId};
use convert_core::error::Result;
use convert_core::href;
use convert_core::plugin::{Context, Transform};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Block elements a `chapter_regex` may promote to chapter headings.
const CHAPTER_CANDIDATES: &[&str] = &["p", "div", "h1", "h2", "h3", "h4", "h5", "h6"];

/// Builds the TOC from `h1..hN` (N = `toc_depth`) when the book has none or
/// `use_auto_toc` is set, falling back to one entry per spine item. Titles
/// are normalized and play orders assigned in every case.
pub struct GenerateToc;

impl Transform for GenerateToc {
    fn name(&self) -> &str {
        "GenerateTOC"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn options_consumed(&self) -> &[&str] {
        &[
            "toc_depth",
            "max_toc_links",
            "chapter_regex",
            "use_auto_toc",
            "normalize_toc_titles",
        ]
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        let opts = ctx.options;
        if book.toc.is_empty() || opts.use_auto_toc {
            let chapter_regex = opts.chapter_regex.as_deref().and_then(|pattern| {
                match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        log::warn!("Ignoring invalid chapter regex '{}': {}", pattern, e);
                        None
                    }
                }
            });
            let depth = opts.toc_depth.clamp(1, 6);
            let mut headings = collect_headings(book, depth, chapter_regex.as_ref(), ctx)?;
            if opts.max_toc_links > 0 && headings.len() > opts.max_toc_links {
                log::info!(
                    "Limiting generated TOC to {} of {} headings",
                    opts.max_toc_links,
                    headings.len()
                );
                headings.truncate(opts.max_toc_links);
            }

            let entries = if headings.is_empty() {
                spine_entries(book)?
            } else {
                assign_ids(book, &mut headings)?;
                build_tree(
                    headings
                        .into_iter()
                        .map(|h| {
                            let target = href::with_fragment(&h.item_href, h.id.as_deref());
                            (h.level, TocEntry::new(h.title, target))
                        })
                        .collect(),
                )
            };
            book.toc.entries = entries;
            log::info!("Generated TOC with {} entries", book.toc.count());
        }

        if opts.normalize_toc_titles {
            book.toc.for_each_mut(|entry| entry.title = normalize_title(&entry.title));
        }
        book.toc.rationalize_play_orders();
        Ok(())
    }
}

struct Heading {
    item_href: String,
    node: NodeId,
    level: u8,
    title: String,
    id: Option<String>,
}

fn collect_headings(
    book: &BookDocument,
    depth: u8,
    chapter_regex: Option<&Regex>,
    ctx: &Context<'_>,
) -> Result<Vec<Heading>> {
    let mut out = Vec::new();
    for item_href in book.spine_hrefs() {
        ctx.check_cancelled()?;
        let doc = book.xhtml(&item_href)?;
        for node in doc.elements() {
            let Some(level) = heading_level(&doc, node, depth, chapter_regex) else {
                continue;
            };
            let title = normalize_title(&doc.text_content(node));
            if title.is_empty() {
                continue;
            }
            out.push(Heading {
                item_href: item_href.clone(),
                node,
                level,
                title,
                id: doc.attr(node, "id").map(str::to_string),
            });
        }
    }
    Ok(out)
}

fn heading_level(doc: &Document, node: NodeId, depth: u8, chapter_regex: Option<&Regex>) -> Option<u8> {
    let name = doc.local_name(node)?.to_ascii_lowercase();
    if let Some(re) = chapter_regex {
        if CHAPTER_CANDIDATES.contains(&name.as_str()) && re.is_match(doc.text_content(node).trim()) {
            return Some(1);
        }
    }
    let level = match name.as_bytes() {
        [b'h', d @ b'1'..=b'6'] => d - b'0',
        _ => return None,
    };
    (level <= depth).then_some(level)
}

/// Give every heading without an id a fresh `toc_<n>` id.
fn assign_ids(book: &mut BookDocument, headings: &mut [Heading]) -> Result<()> {
    let mut current: Option<(String, HashSet<String>)> = None;
    let mut counter = 0usize;
    for heading in headings.iter_mut().filter(|h| h.id.is_none()) {
        if current.as_ref().map_or(true, |(href, _)| *href != heading.item_href) {
            let doc = book.xhtml(&heading.item_href)?;
            let taken = doc
                .elements()
                .into_iter()
                .filter_map(|n| doc.attr(n, "id").map(str::to_string))
                .collect();
            current = Some((heading.item_href.clone(), taken));
        }
        let Some((_, taken)) = current.as_mut() else {
            continue;
        };
        let id = loop {
            counter += 1;
            let candidate = format!("toc_{}", counter);
            if taken.insert(candidate.clone()) {
                break candidate;
            }
        };
        book.xhtml_mut(&heading.item_href)?
            .set_attr(heading.node, "id", id.clone());
        heading.id = Some(id);
    }
    Ok(())
}

/// Nest entries by heading level: each entry becomes a child of the
/// nearest preceding entry with a smaller level.
fn build_tree(flat: Vec<(u8, TocEntry)>) -> Vec<TocEntry> {
    let mut roots: Vec<TocEntry> = Vec::new();
    let mut stack: Vec<(u8, TocEntry)> = Vec::new();

    fn close(stack: &mut Vec<(u8, TocEntry)>, roots: &mut Vec<TocEntry>) {
        if let Some((_, done)) = stack.pop() {
            match stack.last_mut() {
                Some((_, parent)) => parent.add_child(done),
                None => roots.push(done),
            }
        }
    }

    for (level, entry) in flat {
        while stack.last().is_some_and(|(top, _)| *top >= level) {
            close(&mut stack, &mut roots);
        }
        stack.push((level, entry));
    }
    while !stack.is_empty() {
        close(&mut stack, &mut roots);
    }
    roots
}

/// One entry per spine item, titled from `<title>`, else the first
/// heading, else the file name.
fn spine_entries(book: &BookDocument) -> Result<Vec<TocEntry>> {
    let mut entries = Vec::new();
    for item_href in book.spine_hrefs() {
        let doc = book.xhtml(&item_href)?;
        let from_title = doc
            .find_first("title")
            .map(|t| normalize_title(&doc.text_content(t)))
            .filter(|t| !t.is_empty());
        let from_heading = || {
            ["h1", "h2", "h3", "h4", "h5", "h6"]
                .iter()
                .filter_map(|name| doc.find_first(name))
                .map(|h| normalize_title(&doc.text_content(h)))
                .find(|t| !t.is_empty())
        };
        let title = from_title
            .or_else(from_heading)
            .unwrap_or_else(|| href::stem_and_extension(&item_href).0.to_string());
        entries.push(TocEntry::new(title, item_href));
    }
    Ok(entries)
}

fn normalize_title(title: &str) -> String {
    WHITESPACE.replace_all(title.trim(), " ").into_owned()
}
