//! SplitOnPageBreaks: cuts content documents at forced page breaks.
//!
//! Break positions are found in parallel through the cascade, then the
//! container is rewritten on the driver thread: the first non-empty part
//! keeps the original href, later parts become `<stem>_split_NNN.<ext>`
//! items right after it in the spine.

use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;

use convert_core::book::{BookDocument, LinkTarget, ManifestData};
use convert_core::dom::{Document, NodeData, NodeId};
use convert_core::error::Result;
use convert_core::href;
use convert_core::options::ConversionOptions;
use convert_core::plugin::{Context, Transform};
use convert_css::{compile, select, CascadeOptions, CompiledSelector, Stylizer};

/// Elements that make a part worth keeping even without text.
const CONTENT_ELEMENTS: &[&str] = &[
    "img", "svg", "image", "object", "embed", "video", "audio", "iframe", "hr", "table",
];

const BREAK_VALUES: &[&str] = &["always", "page", "left", "right", "recto", "verso"];

pub struct SplitOnPageBreaks;

impl Transform for SplitOnPageBreaks {
    fn name(&self) -> &str {
        "SplitOnPageBreaks"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn options_consumed(&self) -> &[&str] {
        &["split_on_page_breaks", "page_breaks_before"]
    }

    fn run_after(&self) -> &[&str] {
        &["FlattenCSS"]
    }

    fn should_run(&self, options: &ConversionOptions) -> bool {
        options.split_on_page_breaks
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        let opts = ctx.options;
        let cascade = CascadeOptions::from_options(opts);
        let forced = opts
            .page_breaks_before
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .and_then(|text| match compile(text) {
                Ok(selector) => Some(selector),
                Err(e) => {
                    log::warn!("Ignoring invalid page break selector '{}': {}", text, e);
                    None
                }
            });

        let candidates: Vec<String> = book
            .iter_spine()
            .filter(|i| i.is_xhtml())
            .map(|i| i.href.clone())
            .collect();
        ctx.check_cancelled()?;

        let plans: Vec<SplitPlan> = {
            let book_ref: &BookDocument = book;
            candidates
                .par_iter()
                .map(|item_href| plan_split(book_ref, item_href, &cascade, forced.as_ref()))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect()
        };
        ctx.check_cancelled()?;

        let mut moved: HashMap<String, HashMap<String, String>> = HashMap::new();
        for plan in plans {
            let original = plan.href.clone();
            if let Some((hrefs, anchors)) = apply_plan(book, plan)? {
                log::info!("Split {} into {} parts", original, hrefs.len());
                for part_href in hrefs {
                    moved.insert(part_href, anchors.clone());
                }
            }
        }
        if moved.is_empty() {
            return Ok(());
        }

        book.rewrite_links(|_, target| {
            let (path, fragment) = href::split_fragment(target);
            match fragment.and_then(|f| moved.get(path)?.get(f).map(|to| (f, to))) {
                Some((frag, to)) if to != path => {
                    LinkTarget::Retarget(href::with_fragment(to, Some(frag)))
                }
                _ => LinkTarget::Keep,
            }
        })?;
        book.toc.for_each_mut(|entry| {
            if let Some(to) = entry
                .fragment
                .as_deref()
                .and_then(|f| moved.get(&entry.href)?.get(f))
            {
                entry.href = to.clone();
            }
        });
        for guide_ref in book.guide.iter_mut() {
            let (path, fragment) = href::split_fragment(&guide_ref.href);
            if let Some(to) = fragment.and_then(|f| moved.get(path)?.get(f)) {
                guide_ref.href = href::with_fragment(to, fragment);
            }
        }
        Ok(())
    }
}

/// The non-empty parts of one document and where its anchors ended up.
struct SplitPlan {
    href: String,
    parts: Vec<Document>,
    /// Anchor name to index into `parts`.
    anchors: HashMap<String, usize>,
}

fn plan_split(
    book: &BookDocument,
    item_href: &str,
    cascade: &CascadeOptions,
    forced: Option<&CompiledSelector>,
) -> Result<Option<SplitPlan>> {
    let stylizer = Stylizer::new(book, item_href, cascade)?;
    let doc = stylizer.document();
    let Some(body) = doc.body() else {
        return Ok(None);
    };
    let order = DocumentOrder::new(doc, body);
    let forced_nodes: BTreeSet<NodeId> = forced
        .map(|sel| select::select_all(doc, sel).into_iter().collect())
        .unwrap_or_default();

    let mut boundaries = BTreeSet::new();
    for (index, &node) in order.nodes.iter().enumerate() {
        if !doc.is_element(node) {
            continue;
        }
        let declared = |prop: &str| {
            stylizer
                .specified(node)
                .and_then(|m| m.get(prop))
                .is_some_and(|d| BREAK_VALUES.contains(&d.value.trim().to_ascii_lowercase().as_str()))
        };
        if index > 0
            && (forced_nodes.contains(&node) || declared("page-break-before") || declared("break-before"))
        {
            boundaries.insert(index);
        }
        let after = order.end[index] + 1;
        if after < order.nodes.len() && (declared("page-break-after") || declared("break-after")) {
            boundaries.insert(after);
        }
    }
    if boundaries.is_empty() {
        return Ok(None);
    }

    let mut starts = vec![0];
    starts.extend(boundaries);
    let mut raw_parts = Vec::with_capacity(starts.len());
    for (n, &lo) in starts.iter().enumerate() {
        let hi = starts.get(n + 1).copied().unwrap_or(order.nodes.len());
        let part = order.slice(doc, lo, hi);
        let keep = has_content(&part, body);
        raw_parts.push((part, keep));
    }

    let kept: Vec<usize> = (0..raw_parts.len()).filter(|&i| raw_parts[i].1).collect();
    if kept.len() < 2 {
        return Ok(None);
    }
    // An anchor in a skipped part moves to the next kept part, else the last.
    let target_of = |raw: usize| {
        kept.iter()
            .position(|&k| k >= raw)
            .unwrap_or(kept.len() - 1)
    };

    let mut anchors = HashMap::new();
    for (index, &node) in order.nodes.iter().enumerate() {
        let raw = starts.partition_point(|&s| s <= index) - 1;
        for name in anchor_names(doc, node) {
            anchors.entry(name).or_insert_with(|| target_of(raw));
        }
    }
    let parts = raw_parts
        .into_iter()
        .filter_map(|(part, keep)| keep.then_some(part))
        .collect();
    Ok(Some(SplitPlan {
        href: item_href.to_string(),
        parts,
        anchors,
    }))
}

/// Pre-order positions of the nodes under `body`, with the position of
/// the last descendant of each.
struct DocumentOrder {
    nodes: Vec<NodeId>,
    end: Vec<usize>,
}

impl DocumentOrder {
    fn new(doc: &Document, body: NodeId) -> Self {
        let nodes = doc.descendants(body);
        let position: HashMap<NodeId, usize> =
            nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let mut end: Vec<usize> = (0..nodes.len()).collect();
        for i in (0..nodes.len()).rev() {
            if let Some(&last) = doc.children(nodes[i]).last().and_then(|c| position.get(c)) {
                end[i] = end[last];
            }
        }
        Self { nodes, end }
    }

    /// Copy of `doc` keeping only nodes whose subtree overlaps `lo..hi`.
    /// Ancestors repeated from an earlier part lose their ids.
    fn slice(&self, doc: &Document, lo: usize, hi: usize) -> Document {
        let mut part = doc.clone();
        for (i, &node) in self.nodes.iter().enumerate() {
            if i >= hi || self.end[i] < lo {
                part.detach(node);
            } else if i < lo {
                part.remove_attr(node, "id");
            }
        }
        part
    }
}

fn has_content(doc: &Document, body: NodeId) -> bool {
    doc.descendants(body).into_iter().any(|n| match &doc.node(n).data {
        NodeData::Text(t) => !t.trim().is_empty(),
        NodeData::Element(e) => CONTENT_ELEMENTS
            .iter()
            .any(|c| e.local_name().eq_ignore_ascii_case(c)),
        _ => false,
    })
}

fn anchor_names(doc: &Document, node: NodeId) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(id) = doc.attr(node, "id") {
        names.push(id.to_string());
    }
    if doc.is_named(node, "a") {
        if let Some(name) = doc.attr(node, "name") {
            names.push(name.to_string());
        }
    }
    names
}

/// Store the parts in the container. Returns the part hrefs and the href
/// holding each anchor.
fn apply_plan(
    book: &mut BookDocument,
    plan: SplitPlan,
) -> Result<Option<(Vec<String>, HashMap<String, String>)>> {
    let Some(item) = book.item(&plan.href) else {
        return Ok(None);
    };
    let media_type = item.media_type.clone();
    let Some(position) = book.spine_position(&plan.href) else {
        return Ok(None);
    };
    let linear = book.spine.items()[position].linear;

    let dir = href::dirname(&plan.href);
    let (stem, ext) = href::stem_and_extension(&plan.href);
    let (stem, ext) = (stem.to_string(), ext.unwrap_or("xhtml").to_string());
    let mut hrefs = vec![plan.href.clone()];
    for (n, part) in plan.parts.into_iter().enumerate() {
        if n == 0 {
            book.set_xhtml(&plan.href, part)?;
            continue;
        }
        let wanted = format!("{}{}_split_{:03}.{}", dir, stem, n, ext);
        let part_href = if book.item(&wanted).is_some() {
            book.manifest
                .generate_href(&format!("{}{}_split_{:03}", dir, stem, n), &ext)
        } else {
            wanted
        };
        book.add_item(&part_href, &media_type, ManifestData::xhtml(part))?;
        book.insert_into_spine(position + n, &part_href, linear)?;
        hrefs.push(part_href);
    }

    let anchors = plan
        .anchors
        .into_iter()
        .filter_map(|(anchor, part)| Some((anchor, hrefs.get(part)?.clone())))
        .collect();
    Ok(Some((hrefs, anchors)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{book, text_of, xhtml};
    use convert_core::book::{GuideRef, TocEntry};

    fn run(book: &mut BookDocument, opts: &ConversionOptions) {
        SplitOnPageBreaks.apply(book, &Context::new(opts)).unwrap();
    }

    #[test]
    fn test_split_at_breaks_and_remap_fragments() {
        let body = concat!(
            "<p>alpha <a href=\"#x\">jump</a></p>",
            "<h1 id=\"c2\" style=\"page-break-before: always\">Two</h1><p>beta</p>",
            "<div style=\"page-break-after: always\"><p id=\"x\">gamma</p></div>",
            "<p id=\"last\">delta</p>",
        );
        let mut book = book(
            &[
                ("text/ch.xhtml", xhtml("", body)),
                ("text/other.xhtml", xhtml("", "<a id=\"l\" href=\"ch.xhtml#c2\">to two</a>")),
            ],
            &[],
        );
        book.toc.add(TocEntry::new("Two", "text/ch.xhtml#c2"));
        book.toc.add(TocEntry::new("Start", "text/ch.xhtml"));
        book.guide.add(GuideRef::new("text", "Text", "text/ch.xhtml#last"));
        run(&mut book, &ConversionOptions::default());

        assert_eq!(
            book.spine_hrefs(),
            vec![
                "text/ch.xhtml",
                "text/ch_split_001.xhtml",
                "text/ch_split_002.xhtml",
                "text/other.xhtml"
            ]
        );
        let first = text_of(&book, "text/ch.xhtml");
        assert!(first.contains("alpha"));
        assert!(!first.contains("beta"));
        assert!(first.contains("href=\"ch_split_001.xhtml#x\""));
        let second = text_of(&book, "text/ch_split_001.xhtml");
        assert!(second.contains("Two") && second.contains("gamma"));
        assert!(!second.contains("delta"));
        assert!(text_of(&book, "text/ch_split_002.xhtml").contains("delta"));

        let other = book.xhtml("text/other.xhtml").unwrap();
        let link = other.element_by_id("l").unwrap();
        assert_eq!(other.attr(link, "href"), Some("ch_split_001.xhtml#c2"));
        assert_eq!(book.toc.entries[0].href, "text/ch_split_001.xhtml");
        assert_eq!(book.toc.entries[1].href, "text/ch.xhtml");
        assert_eq!(
            book.guide.get("text").map(|g| g.href.as_str()),
            Some("text/ch_split_002.xhtml#last")
        );
    }

    #[test]
    fn test_empty_parts_are_skipped() {
        let body = concat!(
            "<p style=\"page-break-after: always\">one</p>",
            "<div id=\"gap\">  </div>",
            "<p style=\"page-break-before: always\">two</p>",
            "<p style=\"page-break-after: always\">end</p>",
        );
        let mut book = book(&[("ch.xhtml", xhtml("", body))], &[]);
        run(&mut book, &ConversionOptions::default());

        assert_eq!(book.spine_hrefs(), vec!["ch.xhtml", "ch_split_001.xhtml"]);
        assert!(text_of(&book, "ch_split_001.xhtml").contains("two"));
    }

    #[test]
    fn test_selector_forced_breaks_keep_linear_flag() {
        let body = "<h2>A</h2><p>a</p><h2>B</h2><p>b</p>";
        let mut book = book(&[("ch.xhtml", xhtml("", body))], &[]);
        book.spine.retain(|_| false);
        book.add_to_spine("ch.xhtml", false).unwrap();
        let opts = ConversionOptions {
            page_breaks_before: Some("h2".to_string()),
            ..ConversionOptions::default()
        };
        run(&mut book, &opts);

        assert_eq!(book.spine.len(), 2);
        assert!(book.spine.iter().all(|s| !s.linear));
        assert!(text_of(&book, "ch_split_001.xhtml").contains(">B<"));
    }

    #[test]
    fn test_parts_of_extensionless_item_get_xhtml_names() {
        let body = "<p style=\"page-break-after: always\">one</p><p>two</p>";
        let mut book = book(&[("text/chapter", xhtml("", body))], &[]);
        run(&mut book, &ConversionOptions::default());

        assert_eq!(
            book.spine_hrefs(),
            vec!["text/chapter", "text/chapter_split_001.xhtml"]
        );
        assert!(text_of(&book, "text/chapter_split_001.xhtml").contains("two"));
    }

    #[test]
    fn test_no_breaks_is_noop() {
        let mut book = book(&[("ch.xhtml", xhtml("", "<p>only</p>"))], &[]);
        run(&mut book, &ConversionOptions::default());
        assert_eq!(book.manifest.len(), 1);
    }

    #[test]
    fn test_disabled_by_option() {
        let opts = ConversionOptions {
            split_on_page_breaks: false,
            ..ConversionOptions::default()
        };
        assert!(!SplitOnPageBreaks.should_run(&opts));
    }
}
