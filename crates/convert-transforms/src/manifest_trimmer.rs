//! ManifestTrimmer: removes items nothing refers to any more.

use std::collections::HashSet;

use convert_core::book::BookDocument;
use convert_core::error::Result;
use convert_core::href;
use convert_core::links;
use convert_core::plugin::{Context, Transform};

/// Drops manifest items that cannot be reached from the spine, TOC, guide
/// or cover metadata by following links through XHTML and CSS.
pub struct ManifestTrimmer;

impl Transform for ManifestTrimmer {
    fn name(&self) -> &str {
        "ManifestTrimmer"
    }

    fn priority(&self) -> i32 {
        110
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        let reachable = reachable_items(book)?;
        ctx.check_cancelled()?;

        let unreachable: Vec<String> = book
            .iter_manifest()
            .filter(|i| !reachable.contains(&i.href))
            .map(|i| i.href.clone())
            .collect();
        for item_href in &unreachable {
            log::debug!("Trimming unreferenced manifest item: {}", item_href);
            book.remove_item(item_href, false)?;
        }
        if !unreachable.is_empty() {
            log::info!("Trimmed {} unreferenced manifest items", unreachable.len());
        }
        Ok(())
    }
}

fn reachable_items(book: &BookDocument) -> Result<HashSet<String>> {
    let mut pending: Vec<String> = book.spine_hrefs();
    for entry in book.toc.iter_depth_first() {
        pending.push(entry.href.clone());
        pending.extend(entry.thumbnail.clone());
    }
    pending.extend(book.guide.iter().map(|g| href::split_fragment(&g.href).0.to_string()));
    if let Some(cover) = book
        .metadata
        .get_first_value("cover")
        .and_then(|id| book.manifest.by_id(id))
    {
        pending.push(cover.href.clone());
    }

    let mut reachable = HashSet::new();
    while let Some(next) = pending.pop() {
        let Some(item) = book.item(&next) else {
            continue;
        };
        if !reachable.insert(item.href.clone()) {
            continue;
        }
        if let Some(fallback) = item.fallback.as_deref().and_then(|id| book.manifest.by_id(id)) {
            pending.push(fallback.href.clone());
        }
        let raw_links = if item.is_xhtml() {
            links::document_links(&*book.xhtml(&item.href)?)
        } else if item.is_css() {
            links::stylesheet_urls(&*book.css(&item.href)?)
        } else {
            continue;
        };
        pending.extend(
            raw_links
                .iter()
                .filter_map(|raw| book.resolve_link(&item.href, raw)),
        );
    }
    Ok(reachable)
}
