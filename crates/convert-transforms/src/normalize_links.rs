//! NormalizeLinks: canonical link text, broken link removal and fragment
//! checks.

use std::collections::{HashMap, HashSet};

use convert_core::book::{BookDocument, LinkTarget};
use convert_core::error::Result;
use convert_core::href;
use convert_core::links::{self, LinkAction};
use convert_core::plugin::{Context, Transform};

/// Rewrites every internal link to its canonical relative form, strips
/// links to items that are not in the manifest, drops fragments that name
/// no element of the target document and canonicalizes external URIs.
pub struct NormalizeLinks;

impl Transform for NormalizeLinks {
    fn name(&self) -> &str {
        "NormalizeLinks"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        let known: HashSet<String> = book.iter_manifest().map(|i| i.href.clone()).collect();
        let anchors = collect_anchors(book)?;
        ctx.check_cancelled()?;

        let mut broken = 0usize;
        let mut dropped_fragments = 0usize;
        book.rewrite_links(|item_href, target| {
            let (path, fragment) = href::split_fragment(target);
            if !known.contains(path) {
                log::warn!("Broken link in {}: {}", item_href, target);
                broken += 1;
                return LinkTarget::Remove;
            }
            match (fragment, anchors.get(path)) {
                (Some(frag), Some(ids)) if frag.is_empty() || !ids.contains(frag) => {
                    log::debug!("Dropping missing fragment in {}: {}", item_href, target);
                    dropped_fragments += 1;
                    LinkTarget::Retarget(path.to_string())
                }
                _ => LinkTarget::Retarget(target.to_string()),
            }
        })?;

        let documents: Vec<String> = book
            .iter_manifest()
            .filter(|i| i.is_xhtml())
            .map(|i| i.href.clone())
            .collect();
        let mut externals = 0usize;
        for item_href in documents {
            ctx.check_cancelled()?;
            let doc = book.xhtml_mut(&item_href)?;
            links::rewrite_document(doc, &mut |raw| {
                if !href::is_external(raw) {
                    return LinkAction::Keep;
                }
                match canonical_external(raw) {
                    Some(canon) if canon != raw => {
                        externals += 1;
                        LinkAction::Replace(canon)
                    }
                    _ => LinkAction::Keep,
                }
            });
        }

        if broken + dropped_fragments + externals > 0 {
            log::info!(
                "Normalized links: {} broken removed, {} fragments dropped, {} external URIs rewritten",
                broken,
                dropped_fragments,
                externals
            );
        }
        Ok(())
    }
}

/// Element ids (and `<a name>` anchors) per XHTML item.
fn collect_anchors(book: &BookDocument) -> Result<HashMap<String, HashSet<String>>> {
    let mut anchors = HashMap::new();
    for item in book.iter_manifest().filter(|i| i.is_xhtml()) {
        let doc = book.xhtml(&item.href)?;
        let mut ids = HashSet::new();
        for node in doc.elements() {
            if let Some(id) = doc.attr(node, "id") {
                ids.insert(id.to_string());
            }
            if doc.is_named(node, "a") {
                if let Some(name) = doc.attr(node, "name") {
                    ids.insert(name.to_string());
                }
            }
        }
        anchors.insert(item.href.clone(), ids);
    }
    Ok(anchors)
}

/// Canonical form of an external URI: trimmed, lower-case scheme, and for
/// hierarchical web URLs the normalized form (lower-case host, default
/// port dropped, empty path as `/`).
fn canonical_external(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let scheme = href::scheme(trimmed)?;
    match scheme.as_str() {
        "data" => None,
        "http" | "https" | "ftp" => url::Url::parse(trimmed).ok().map(|u| u.to_string()),
        _ => {
            let rest = &trimmed[scheme.len()..];
            Some(format!("{}{}", scheme, rest))
        }
    }
}
