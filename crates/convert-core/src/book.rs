//! Book document intermediate representation.
//!
//! All conversions pass through this container: input plugin → descriptor →
//! `BookDocument` → transforms → output plugin. Item payloads sit behind
//! `Arc`, so cloning the book is shallow and the first mutation of an item
//! copies only that item.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use convert_utils::mime;

use crate::dom::Document;
use crate::error::{ConvertError, Result};
use crate::href;
use crate::links::{self, LinkAction};
use crate::stylesheet::Stylesheet;

/// The central intermediate representation for an ebook.
#[derive(Debug, Clone)]
pub struct BookDocument {
    /// Dublin Core and extended metadata
    pub metadata: Metadata,
    /// All resources (XHTML, CSS, images, fonts, etc.)
    pub manifest: Manifest,
    /// Reading order of content documents
    pub spine: Spine,
    /// Hierarchical table of contents
    pub toc: Toc,
    /// Standard section references (cover, toc page, etc.)
    pub guide: Guide,
    /// Unique book identifier
    pub uid: Option<String>,
    /// OPF version
    pub version: String,
    /// Directory the descriptor was read from
    pub base_path: Option<PathBuf>,
}

/// Decision returned by a link visitor, in terms of canonical targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Keep,
    /// Point the link at another canonical href (with optional fragment).
    Retarget(String),
    /// Remove the link (anchors unwrapped, embedding elements dropped).
    Remove,
}

impl BookDocument {
    pub fn new() -> Self {
        Self {
            metadata: Metadata::new(),
            manifest: Manifest::new(),
            spine: Spine::new(),
            toc: Toc::new(),
            guide: Guide::new(),
            uid: None,
            version: "2.0".to_string(),
            base_path: None,
        }
    }

    // -- Items --

    /// Register a resource. The href is canonicalized; duplicates are an
    /// error.
    pub fn add_item(
        &mut self,
        href: &str,
        media_type: &str,
        data: ManifestData,
    ) -> Result<&ManifestItem> {
        let href = href::canonicalize(href::split_fragment(href).0);
        if href.is_empty() {
            return Err(ConvertError::Manifest("empty href".to_string()));
        }
        if self.manifest.by_href(&href).is_some() {
            return Err(ConvertError::Manifest(format!("duplicate href '{}'", href)));
        }
        let id = self.manifest.generate_id(id_prefix(media_type));
        let idx = self
            .manifest
            .add(ManifestItem::new(id, href, media_type, data))?;
        Ok(&self.manifest.items()[idx])
    }

    pub fn item(&self, href: &str) -> Option<&ManifestItem> {
        self.manifest.by_href(href)
    }

    fn require(&self, href: &str) -> Result<&ManifestItem> {
        self.manifest
            .by_href(href)
            .ok_or_else(|| ConvertError::resource(href, "not in manifest"))
    }

    /// Remove an item from the manifest, spine, TOC and guide. With
    /// `rewrite_links`, links to it are stripped from every document and
    /// stylesheet.
    pub fn remove_item(&mut self, href: &str, rewrite_links: bool) -> Result<ManifestItem> {
        let item = self
            .manifest
            .remove_by_href(href)
            .ok_or_else(|| ConvertError::resource(href, "not in manifest"))?;
        self.spine.remove(&item.id);
        self.toc.retain(|e| e.href != item.href);
        self.guide
            .retain(|g| href::split_fragment(&g.href).0 != item.href);
        if rewrite_links {
            let removed = item.href.clone();
            self.rewrite_links(|_, target| {
                if href::split_fragment(target).0 == removed {
                    LinkTarget::Remove
                } else {
                    LinkTarget::Keep
                }
            })?;
        }
        log::debug!("Removed {} from manifest", item.href);
        Ok(item)
    }

    /// Move an item to a new href and update every reference to it.
    pub fn rename_item(&mut self, href: &str, new_href: &str) -> Result<()> {
        let new_href = href::canonicalize(href::split_fragment(new_href).0);
        if new_href == href {
            return Ok(());
        }
        if self.manifest.by_href(&new_href).is_some() {
            return Err(ConvertError::Manifest(format!(
                "cannot rename {}: '{}' already exists",
                href, new_href
            )));
        }
        self.require(href)?;
        self.manifest.rename(href, &new_href);

        let mut moved = HashMap::new();
        moved.insert(new_href.clone(), href.to_string());
        let old = href.to_string();
        let needle = href::basename(href).to_string();
        self.rewrite_links_inner(&moved, Some(&needle), &mut |_, target| {
            let (path, frag) = href::split_fragment(target);
            if path == old {
                LinkTarget::Retarget(href::with_fragment(&new_href, frag))
            } else {
                LinkTarget::Keep
            }
        })?;

        self.toc.for_each_mut(|entry| {
            if entry.href == old {
                entry.href = new_href.clone();
            }
        });
        for g in self.guide.iter_mut() {
            let (path, frag) = href::split_fragment(&g.href);
            if path == old {
                g.href = href::with_fragment(&new_href, frag);
            }
        }
        log::debug!("Renamed {} to {}", old, new_href);
        Ok(())
    }

    /// Visit every internal reference in every XHTML and CSS item.
    /// `f(item_href, target)` receives the canonical resolved target.
    pub fn rewrite_links(
        &mut self,
        mut f: impl FnMut(&str, &str) -> LinkTarget,
    ) -> Result<bool> {
        self.rewrite_links_inner(&HashMap::new(), None, &mut f)
    }

    fn rewrite_links_inner(
        &mut self,
        moved: &HashMap<String, String>,
        needle: Option<&str>,
        f: &mut dyn FnMut(&str, &str) -> LinkTarget,
    ) -> Result<bool> {
        let candidates: Vec<String> = self
            .manifest
            .iter()
            .filter(|i| i.is_xhtml() || i.is_css())
            .filter(|i| {
                moved.contains_key(&i.href)
                    || needle.map_or(true, |n| self.may_reference(i, n))
            })
            .map(|i| i.href.clone())
            .collect();

        let mut changed = false;
        for item_href in candidates {
            let origin = moved
                .get(&item_href)
                .cloned()
                .unwrap_or_else(|| item_href.clone());
            if let Err(e) = self.parse(&item_href) {
                log::warn!("Skipping links in {}: {}", item_href, e);
                continue;
            }
            let mut decide = |raw: &str| decide_link(&item_href, &origin, raw, &mut *f);
            let Some(item) = self.manifest.by_href_mut(&item_href) else {
                continue;
            };
            match &mut item.data {
                ManifestData::Xhtml(doc) => {
                    changed |= links::rewrite_document(Arc::make_mut(doc), &mut decide);
                }
                ManifestData::Css(sheet) => {
                    changed |= links::rewrite_stylesheet(Arc::make_mut(sheet), &mut |raw| {
                        match decide(raw) {
                            LinkAction::Keep => None,
                            LinkAction::Replace(s) => Some(s),
                            LinkAction::Remove => Some(String::new()),
                        }
                    });
                }
                _ => {}
            }
        }
        Ok(changed)
    }

    /// Cheap pre-check: can this item's text mention `needle` at all?
    fn may_reference(&self, item: &ManifestItem, needle: &str) -> bool {
        let bytes = match &item.data {
            ManifestData::Xhtml(_) | ManifestData::Css(_) => return true,
            ManifestData::Binary(b) => b.clone(),
            ManifestData::Lazy(path) => match std::fs::read(path) {
                Ok(b) => Arc::new(b),
                Err(_) => return true,
            },
            ManifestData::Empty => return false,
        };
        let encoded = href::percent_encode_href(needle);
        contains_bytes(&bytes, needle.as_bytes()) || contains_bytes(&bytes, encoded.as_bytes())
    }

    // -- Spine --

    pub fn iter_spine(&self) -> impl Iterator<Item = &ManifestItem> {
        self.spine
            .iter()
            .filter_map(move |s| self.manifest.by_id(&s.idref))
    }

    /// Hrefs of spine items in reading order.
    pub fn spine_hrefs(&self) -> Vec<String> {
        self.iter_spine().map(|i| i.href.clone()).collect()
    }

    pub fn iter_manifest(&self) -> impl Iterator<Item = &ManifestItem> {
        self.manifest.iter()
    }

    pub fn spine_position(&self, href: &str) -> Option<usize> {
        let id = &self.manifest.by_href(href)?.id;
        self.spine.iter().position(|s| &s.idref == id)
    }

    pub fn add_to_spine(&mut self, href: &str, linear: bool) -> Result<()> {
        let id = self.require(href)?.id.clone();
        self.spine.push(id, linear);
        Ok(())
    }

    pub fn insert_into_spine(&mut self, position: usize, href: &str, linear: bool) -> Result<()> {
        let id = self.require(href)?.id.clone();
        self.spine.insert(position.min(self.spine.len()), id, linear);
        Ok(())
    }

    // -- Parsed views --

    /// Parse an item into its typed view, memoized.
    pub fn parse(&mut self, href: &str) -> Result<&ManifestData> {
        let needs = self.require(href)?.needs_parse();
        if needs {
            let data = parse_item_data(self.require(href)?)?;
            if let Some(item) = self.manifest.by_href_mut(href) {
                item.data = data;
            }
        }
        Ok(&self.require(href)?.data)
    }

    /// Parse every XHTML and CSS item in parallel.
    pub fn parse_all(&mut self) -> Result<()> {
        let parsed: Vec<(usize, Result<ManifestData>)> = self
            .manifest
            .items()
            .par_iter()
            .enumerate()
            .filter(|(_, item)| item.needs_parse() && (item.is_xhtml() || item.is_css()))
            .map(|(idx, item)| (idx, parse_item_data(item)))
            .collect();
        for (idx, data) in parsed {
            let data = data?;
            if let Some(item) = self.manifest.get_mut(idx) {
                item.data = data;
            }
        }
        Ok(())
    }

    /// Document view of an XHTML item; parses on the fly without
    /// memoizing when the item is still lazy.
    pub fn xhtml(&self, href: &str) -> Result<Arc<Document>> {
        let item = self.require(href)?;
        match &item.data {
            ManifestData::Xhtml(doc) => Ok(doc.clone()),
            _ if item.is_xhtml() => match parse_item_data(item)? {
                ManifestData::Xhtml(doc) => Ok(doc),
                _ => Err(ConvertError::resource(href, "not an XHTML document")),
            },
            _ => Err(ConvertError::resource(href, "not an XHTML document")),
        }
    }

    pub fn xhtml_mut(&mut self, href: &str) -> Result<&mut Document> {
        self.parse(href)?;
        match self.manifest.by_href_mut(href).map(|i| &mut i.data) {
            Some(ManifestData::Xhtml(doc)) => Ok(Arc::make_mut(doc)),
            _ => Err(ConvertError::resource(href, "not an XHTML document")),
        }
    }

    pub fn css(&self, href: &str) -> Result<Arc<Stylesheet>> {
        let item = self.require(href)?;
        match &item.data {
            ManifestData::Css(sheet) => Ok(sheet.clone()),
            _ if item.is_css() => match parse_item_data(item)? {
                ManifestData::Css(sheet) => Ok(sheet),
                _ => Err(ConvertError::resource(href, "not a stylesheet")),
            },
            _ => Err(ConvertError::resource(href, "not a stylesheet")),
        }
    }

    pub fn css_mut(&mut self, href: &str) -> Result<&mut Stylesheet> {
        self.parse(href)?;
        match self.manifest.by_href_mut(href).map(|i| &mut i.data) {
            Some(ManifestData::Css(sheet)) => Ok(Arc::make_mut(sheet)),
            _ => Err(ConvertError::resource(href, "not a stylesheet")),
        }
    }

    /// Raw bytes of an item (serialized form for parsed items).
    pub fn bytes(&self, href: &str) -> Result<Arc<Vec<u8>>> {
        match &self.require(href)?.data {
            ManifestData::Binary(b) => Ok(b.clone()),
            _ => Ok(Arc::new(self.serialize(href)?)),
        }
    }

    /// Replace an item's payload with raw bytes.
    pub fn set_bytes(&mut self, href: &str, bytes: Vec<u8>) -> Result<()> {
        let item = self
            .manifest
            .by_href_mut(href)
            .ok_or_else(|| ConvertError::resource(href, "not in manifest"))?;
        item.data = ManifestData::Binary(Arc::new(bytes));
        Ok(())
    }

    pub fn set_xhtml(&mut self, href: &str, doc: Document) -> Result<()> {
        let item = self
            .manifest
            .by_href_mut(href)
            .ok_or_else(|| ConvertError::resource(href, "not in manifest"))?;
        item.data = ManifestData::Xhtml(Arc::new(doc));
        Ok(())
    }

    pub fn set_css(&mut self, href: &str, sheet: Stylesheet) -> Result<()> {
        let item = self
            .manifest
            .by_href_mut(href)
            .ok_or_else(|| ConvertError::resource(href, "not in manifest"))?;
        item.data = ManifestData::Css(Arc::new(sheet));
        Ok(())
    }

    /// Serialized bytes of an item.
    pub fn serialize(&self, href: &str) -> Result<Vec<u8>> {
        let item = self.require(href)?;
        Ok(match &item.data {
            ManifestData::Lazy(path) => std::fs::read(path)
                .map_err(|e| ConvertError::resource(href, e.to_string()))?,
            ManifestData::Binary(b) => b.as_ref().clone(),
            ManifestData::Xhtml(doc) => doc.to_xml().into_bytes(),
            ManifestData::Css(sheet) => sheet.to_css().into_bytes(),
            ManifestData::Empty => Vec::new(),
        })
    }

    /// Canonical manifest href a raw link in `base` points to, if it is
    /// internal and present.
    pub fn resolve_link(&self, base: &str, raw: &str) -> Option<String> {
        if raw.trim().is_empty() || href::is_external(raw) {
            return None;
        }
        let target = href::resolve(base, raw);
        let path = href::split_fragment(&target).0;
        self.manifest.by_href(path).map(|i| i.href.clone())
    }

    // -- Normalization --

    /// Bring a freshly loaded container into canonical shape: canonical
    /// hrefs and link text, XHTML media types, XHTML-only spine, TOC and
    /// guide entries that resolve.
    pub fn normalize(&mut self) -> Result<()> {
        for item in self.manifest.iter_mut() {
            if item.media_type == mime::HTML_MIME || item.media_type == "application/xml+xhtml" {
                item.media_type = mime::XHTML_MIME.to_string();
            }
        }

        let renames: Vec<(String, String)> = self
            .manifest
            .iter()
            .filter_map(|i| {
                let canon = href::canonicalize(&i.href);
                (canon != i.href).then(|| (i.href.clone(), canon))
            })
            .collect();
        for (old, new) in renames {
            self.rename_item(&old, &new)?;
        }

        let known: HashSet<String> = self.manifest.iter().map(|i| i.href.clone()).collect();
        self.rewrite_links(|_, target| {
            if known.contains(href::split_fragment(target).0) {
                LinkTarget::Retarget(target.to_string())
            } else {
                LinkTarget::Keep
            }
        })?;

        for item in self.manifest.iter_mut() {
            if let ManifestData::Xhtml(doc) = &mut item.data {
                if let Some(root) = doc.root_element() {
                    if doc.is_named(root, "html") && doc.attr(root, "xmlns").is_none() {
                        Arc::make_mut(doc).set_attr(root, "xmlns", convert_utils::xml::XHTML_NS);
                    }
                }
            }
        }

        let manifest = &self.manifest;
        self.spine.retain(|s| match manifest.by_id(&s.idref) {
            Some(item) if item.is_xhtml() => true,
            Some(item) => {
                log::warn!(
                    "Removing {} ({}) from spine: not a content document",
                    item.href,
                    item.media_type
                );
                false
            }
            None => {
                log::warn!("Removing unknown item '{}' from spine", s.idref);
                false
            }
        });

        self.toc.retain(|e| {
            let ok = href::is_external(&e.href) || known.contains(&e.href);
            if !ok {
                log::warn!("Dropping TOC entry '{}': {} not in manifest", e.title, e.href);
            }
            ok
        });
        self.guide.retain(|g| {
            let path = href::split_fragment(&g.href).0;
            let ok = href::is_external(&g.href) || known.contains(path);
            if !ok {
                log::warn!("Dropping guide reference '{}': {} not in manifest", g.ref_type, g.href);
            }
            ok
        });
        self.toc.rationalize_play_orders();
        Ok(())
    }
}

impl Default for BookDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn decide_link(
    item_href: &str,
    origin: &str,
    raw: &str,
    f: &mut dyn FnMut(&str, &str) -> LinkTarget,
) -> LinkAction {
    let trimmed = raw.trim();
    if trimmed.is_empty() || href::is_external(trimmed) {
        return LinkAction::Keep;
    }
    let same_document = trimmed.starts_with('#');
    let target = href::resolve(origin, trimmed);
    match f(item_href, &target) {
        LinkTarget::Keep => {
            if origin != item_href && !same_document {
                LinkAction::Replace(href::percent_encode_href(&href::relative(item_href, &target)))
            } else {
                LinkAction::Keep
            }
        }
        LinkTarget::Retarget(new_target) => {
            let (path, frag) = href::split_fragment(&new_target);
            let replacement = match frag {
                Some(frag) if path == item_href => format!("#{}", frag),
                _ => href::percent_encode_href(&href::relative(item_href, &new_target)),
            };
            if replacement == trimmed {
                LinkAction::Keep
            } else {
                LinkAction::Replace(replacement)
            }
        }
        LinkTarget::Remove => LinkAction::Remove,
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn id_prefix(media_type: &str) -> &'static str {
    if mime::is_xhtml_mime(media_type) {
        "html"
    } else if mime::is_css_mime(media_type) {
        "css"
    } else if mime::is_image_mime(media_type) {
        "img"
    } else if mime::is_font_mime(media_type) {
        "font"
    } else {
        "item"
    }
}

fn load_bytes(item: &ManifestItem) -> Result<Arc<Vec<u8>>> {
    match &item.data {
        ManifestData::Lazy(path) => std::fs::read(path)
            .map(Arc::new)
            .map_err(|e| ConvertError::resource(&item.href, format!("{}: {}", path.display(), e))),
        ManifestData::Binary(b) => Ok(b.clone()),
        ManifestData::Empty => Ok(Arc::new(Vec::new())),
        ManifestData::Xhtml(doc) => Ok(Arc::new(doc.to_xml().into_bytes())),
        ManifestData::Css(sheet) => Ok(Arc::new(sheet.to_css().into_bytes())),
    }
}

fn parse_item_data(item: &ManifestItem) -> Result<ManifestData> {
    if !item.needs_parse() {
        return Ok(item.data.clone());
    }
    let bytes = load_bytes(item)?;
    if item.is_xhtml() {
        let doc = Document::parse_bytes(&bytes)
            .map_err(|e| ConvertError::format(item.href.clone(), e.to_string()))?;
        Ok(ManifestData::Xhtml(Arc::new(doc)))
    } else if item.is_css() {
        let (text, _) = convert_utils::encoding::decode_to_utf8(&bytes);
        Ok(ManifestData::Css(Arc::new(Stylesheet::parse(&text))))
    } else {
        Ok(ManifestData::Binary(bytes))
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Dublin Core metadata plus extensions.
///
/// Terms are stored as a multimap: one term can have multiple values
/// (e.g., multiple `creator` entries for co-authors).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    items: BTreeMap<String, Vec<MetadataItem>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    /// Add a metadata item for the given term.
    pub fn add(&mut self, term: impl Into<String>, value: impl Into<String>) {
        self.add_with_attrs(term, value, BTreeMap::new());
    }

    /// Add a metadata item with attributes.
    pub fn add_with_attrs(
        &mut self,
        term: impl Into<String>,
        value: impl Into<String>,
        attrs: BTreeMap<String, String>,
    ) {
        let item = MetadataItem {
            value: value.into(),
            attributes: attrs,
        };
        self.items.entry(term.into()).or_default().push(item);
    }

    /// Add an identifier; an existing identifier with the same scheme is
    /// replaced.
    pub fn add_identifier(&mut self, value: impl Into<String>, scheme: Option<&str>) {
        let entry = self.items.entry("identifier".to_string()).or_default();
        let scheme_lower = scheme.map(|s| s.to_ascii_lowercase());
        entry.retain(|item| {
            item.attributes.get("scheme").map(|s| s.to_ascii_lowercase()) != scheme_lower
        });
        let mut attrs = BTreeMap::new();
        if let Some(s) = scheme {
            attrs.insert("scheme".to_string(), s.to_string());
        }
        entry.push(MetadataItem {
            value: value.into(),
            attributes: attrs,
        });
    }

    /// Get all values for a term.
    pub fn get(&self, term: &str) -> Option<&[MetadataItem]> {
        self.items.get(term).map(|v| v.as_slice())
    }

    /// Get the first value for a term (convenience).
    pub fn get_first(&self, term: &str) -> Option<&MetadataItem> {
        self.items.get(term).and_then(|v| v.first())
    }

    /// Get the first value as a string, or None.
    pub fn get_first_value(&self, term: &str) -> Option<&str> {
        self.get_first(term).map(|item| item.value.as_str())
    }

    /// Set a term to a single value (replacing any existing).
    pub fn set(&mut self, term: impl Into<String>, value: impl Into<String>) {
        let item = MetadataItem {
            value: value.into(),
            attributes: BTreeMap::new(),
        };
        self.items.insert(term.into(), vec![item]);
    }

    /// Remove all values for a term.
    pub fn remove(&mut self, term: &str) {
        self.items.remove(term);
    }

    /// Iterate over all (term, items) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[MetadataItem])> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Check if a term exists.
    pub fn contains(&self, term: &str) -> bool {
        self.items.contains_key(term)
    }

    // -- Convenience accessors for common DC terms --

    pub fn title(&self) -> Option<&str> {
        self.get_first_value("title")
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        let t = title.into();
        let trimmed = t.trim();
        if !trimmed.is_empty() {
            self.set("title", trimmed.to_string());
        }
    }

    pub fn authors(&self) -> Vec<&str> {
        self.get("creator")
            .map(|items| items.iter().map(|i| i.value.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn language(&self) -> Option<&str> {
        self.get_first_value("language")
    }

    pub fn description(&self) -> Option<&str> {
        self.get_first_value("description")
    }

    pub fn publisher(&self) -> Option<&str> {
        self.get_first_value("publisher")
    }

    pub fn identifier(&self) -> Option<&str> {
        self.get_first_value("identifier")
    }

    pub fn date(&self) -> Option<&str> {
        self.get_first_value("date")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub value: String,
    pub attributes: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Collection of all resources in the book.
/// Provides two-way indexing: by id and by href.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    items: Vec<ManifestItem>,
    /// Map from item id to index in items vec
    id_index: HashMap<String, usize>,
    /// Map from item href to index in items vec
    href_index: HashMap<String, usize>,
    /// Counter for generating unique IDs
    next_id: usize,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            id_index: HashMap::new(),
            href_index: HashMap::new(),
            next_id: 1,
        }
    }

    /// Add a manifest item. Returns the index.
    pub fn add(&mut self, item: ManifestItem) -> Result<usize> {
        if self.href_index.contains_key(&item.href) {
            return Err(ConvertError::Manifest(format!("duplicate href '{}'", item.href)));
        }
        if self.id_index.contains_key(&item.id) {
            return Err(ConvertError::Manifest(format!("duplicate id '{}'", item.id)));
        }
        let idx = self.items.len();
        self.id_index.insert(item.id.clone(), idx);
        self.href_index.insert(item.href.clone(), idx);
        self.items.push(item);
        Ok(idx)
    }

    /// Remove an item by href. Returns the removed item if found.
    pub fn remove_by_href(&mut self, href: &str) -> Option<ManifestItem> {
        let idx = self.href_index.remove(href)?;
        let item = self.items.remove(idx);
        self.rebuild_indices();
        Some(item)
    }

    /// Change an item's href in place.
    pub fn rename(&mut self, href: &str, new_href: &str) -> bool {
        let Some(idx) = self.href_index.remove(href) else {
            return false;
        };
        self.items[idx].href = new_href.to_string();
        self.href_index.insert(new_href.to_string(), idx);
        true
    }

    /// Get item by id.
    pub fn by_id(&self, id: &str) -> Option<&ManifestItem> {
        self.id_index.get(id).map(|&idx| &self.items[idx])
    }

    /// Get mutable item by id.
    pub fn by_id_mut(&mut self, id: &str) -> Option<&mut ManifestItem> {
        self.id_index
            .get(id)
            .copied()
            .map(move |idx| &mut self.items[idx])
    }

    /// Get item by href.
    pub fn by_href(&self, href: &str) -> Option<&ManifestItem> {
        self.href_index.get(href).map(|&idx| &self.items[idx])
    }

    /// Get mutable item by href.
    pub fn by_href_mut(&mut self, href: &str) -> Option<&mut ManifestItem> {
        self.href_index
            .get(href)
            .copied()
            .map(move |idx| &mut self.items[idx])
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ManifestItem> {
        self.items.get_mut(idx)
    }

    /// Iterate over all items in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ManifestItem> {
        self.items.iter()
    }

    /// Iterate over all items mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ManifestItem> {
        self.items.iter_mut()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Generate a unique id based on a prefix.
    pub fn generate_id(&mut self, prefix: &str) -> String {
        loop {
            let id = format!("{}{}", prefix, self.next_id);
            self.next_id += 1;
            if !self.id_index.contains_key(&id) {
                return id;
            }
        }
    }

    /// Generate an unused href from a base path (may contain directories)
    /// and extension.
    pub fn generate_href(&self, base: &str, ext: &str) -> String {
        let candidate = format!("{}.{}", base, ext);
        if !self.href_index.contains_key(&candidate) {
            return candidate;
        }
        let mut i = 1;
        loop {
            let candidate = format!("{}_{}.{}", base, i, ext);
            if !self.href_index.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    /// Get all items as a slice.
    pub fn items(&self) -> &[ManifestItem] {
        &self.items
    }

    /// Get items matching a media type prefix (e.g., "image/").
    pub fn items_of_type(&self, media_type_prefix: &str) -> Vec<&ManifestItem> {
        self.items
            .iter()
            .filter(|item| item.media_type.starts_with(media_type_prefix))
            .collect()
    }

    fn rebuild_indices(&mut self) {
        self.id_index.clear();
        self.href_index.clear();
        for (idx, item) in self.items.iter().enumerate() {
            self.id_index.insert(item.id.clone(), idx);
            self.href_index.insert(item.href.clone(), idx);
        }
    }
}

/// A single item in the manifest.
#[derive(Debug, Clone)]
pub struct ManifestItem {
    /// Unique identifier within the manifest
    pub id: String,
    /// Canonical href within the book
    pub href: String,
    /// MIME type (e.g., "application/xhtml+xml", "image/jpeg")
    pub media_type: String,
    pub data: ManifestData,
    /// Fallback item id for unsupported types
    pub fallback: Option<String>,
}

impl ManifestItem {
    pub fn new(
        id: impl Into<String>,
        href: impl Into<String>,
        media_type: impl Into<String>,
        data: ManifestData,
    ) -> Self {
        Self {
            id: id.into(),
            href: href.into(),
            media_type: media_type.into(),
            data,
            fallback: None,
        }
    }

    pub fn is_xhtml(&self) -> bool {
        mime::is_xhtml_mime(&self.media_type)
    }

    pub fn is_css(&self) -> bool {
        mime::is_css_mime(&self.media_type)
    }

    pub fn is_image(&self) -> bool {
        mime::is_image_mime(&self.media_type)
    }

    pub fn is_font(&self) -> bool {
        mime::is_font_mime(&self.media_type)
            || matches!(
                href::stem_and_extension(&self.href).1.map(|e| e.to_ascii_lowercase()).as_deref(),
                Some("ttf" | "otf" | "woff" | "woff2")
            )
    }

    /// Still lazy, or raw bytes of a kind that has a parsed view.
    pub fn needs_parse(&self) -> bool {
        match self.data {
            ManifestData::Lazy(_) => true,
            ManifestData::Binary(_) => self.is_xhtml() || self.is_css(),
            _ => false,
        }
    }
}

/// Payload of a manifest item.
#[derive(Debug, Clone)]
pub enum ManifestData {
    /// Not loaded yet; bytes live at this path
    Lazy(PathBuf),
    /// Loaded, unparsed bytes (images, fonts, ...)
    Binary(Arc<Vec<u8>>),
    Xhtml(Arc<Document>),
    Css(Arc<Stylesheet>),
    Empty,
}

impl ManifestData {
    pub fn binary(bytes: Vec<u8>) -> Self {
        ManifestData::Binary(Arc::new(bytes))
    }

    pub fn xhtml(doc: Document) -> Self {
        ManifestData::Xhtml(Arc::new(doc))
    }

    pub fn css(sheet: Stylesheet) -> Self {
        ManifestData::Css(Arc::new(sheet))
    }

    pub fn as_xhtml(&self) -> Option<&Document> {
        match self {
            ManifestData::Xhtml(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_css(&self) -> Option<&Stylesheet> {
        match self {
            ManifestData::Css(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            ManifestData::Binary(b) => Some(b),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Spine
// ---------------------------------------------------------------------------

/// Ordered reading sequence of content documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spine {
    items: Vec<SpineItem>,
    pub page_progression_direction: Option<PageDirection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpineItem {
    /// ID referencing a manifest item
    pub idref: String,
    /// Whether this item is part of the linear reading order
    pub linear: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageDirection {
    Ltr,
    Rtl,
}

impl Spine {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            page_progression_direction: None,
        }
    }

    /// Add an item to the end of the spine.
    pub fn push(&mut self, idref: impl Into<String>, linear: bool) {
        self.items.push(SpineItem {
            idref: idref.into(),
            linear,
        });
    }

    /// Insert an item at a specific position.
    pub fn insert(&mut self, index: usize, idref: impl Into<String>, linear: bool) {
        self.items.insert(
            index,
            SpineItem {
                idref: idref.into(),
                linear,
            },
        );
    }

    /// Remove an item by idref.
    pub fn remove(&mut self, idref: &str) -> bool {
        if let Some(pos) = self.items.iter().position(|i| i.idref == idref) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn retain(&mut self, f: impl FnMut(&SpineItem) -> bool) {
        self.items.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpineItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[SpineItem] {
        &self.items
    }

    /// Get idrefs of linear items only.
    pub fn linear_items(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|i| i.linear)
            .map(|i| i.idref.as_str())
    }
}

// ---------------------------------------------------------------------------
// Table of Contents
// ---------------------------------------------------------------------------

/// Hierarchical navigation tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Toc {
    /// Top-level TOC entries
    pub entries: Vec<TocEntry>,
}

impl Toc {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a top-level entry.
    pub fn add(&mut self, entry: TocEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of nodes.
    pub fn count(&self) -> usize {
        self.iter_depth_first().count()
    }

    /// Iterate depth-first over all entries.
    pub fn iter_depth_first(&self) -> TocIter<'_> {
        TocIter {
            stack: self.entries.iter().rev().collect(),
        }
    }

    /// Visit every node mutably, depth-first pre-order.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut TocEntry)) {
        fn walk(entries: &mut [TocEntry], f: &mut dyn FnMut(&mut TocEntry)) {
            for entry in entries {
                f(entry);
                walk(&mut entry.children, f);
            }
        }
        walk(&mut self.entries, &mut f);
    }

    /// Remove nodes failing the predicate. Their children move up into the
    /// removed node's place.
    pub fn retain(&mut self, mut keep: impl FnMut(&TocEntry) -> bool) {
        fn walk(entries: Vec<TocEntry>, keep: &mut dyn FnMut(&TocEntry) -> bool) -> Vec<TocEntry> {
            let mut out = Vec::with_capacity(entries.len());
            for mut entry in entries {
                let children = std::mem::take(&mut entry.children);
                let children = walk(children, keep);
                if keep(&entry) {
                    entry.children = children;
                    out.push(entry);
                } else {
                    out.extend(children);
                }
            }
            out
        }
        let entries = std::mem::take(&mut self.entries);
        self.entries = walk(entries, &mut keep);
    }

    /// Assign play orders: depth-first pre-order from 1, globally unique.
    pub fn rationalize_play_orders(&mut self) {
        let mut order = 1;
        for entry in &mut self.entries {
            entry.rationalize_play_orders_recursive(&mut order);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TocEntry {
    pub title: String,
    /// Canonical href of the target (no fragment) or an external URI.
    pub href: String,
    pub fragment: Option<String>,
    pub children: Vec<TocEntry>,
    pub play_order: Option<u32>,
    pub id: Option<String>,
    pub klass: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
}

impl TocEntry {
    /// New entry; a `#fragment` in `href` is split off.
    pub fn new(title: impl Into<String>, href: impl Into<String>) -> Self {
        let href = href.into();
        let (path, fragment) = if href::is_external(&href) {
            (href.clone(), None)
        } else {
            let (p, f) = href::split_fragment(&href);
            (p.to_string(), f.filter(|f| !f.is_empty()).map(str::to_string))
        };
        Self {
            title: title.into(),
            href: path,
            fragment,
            children: Vec::new(),
            play_order: None,
            id: None,
            klass: None,
            author: None,
            description: None,
            thumbnail: None,
        }
    }

    pub fn add_child(&mut self, child: TocEntry) {
        self.children.push(child);
    }

    /// `href#fragment`.
    pub fn target(&self) -> String {
        href::with_fragment(&self.href, self.fragment.as_deref())
    }

    fn rationalize_play_orders_recursive(&mut self, order: &mut u32) {
        self.play_order = Some(*order);
        *order += 1;
        for child in &mut self.children {
            child.rationalize_play_orders_recursive(order);
        }
    }
}

/// Depth-first iterator over TOC entries.
pub struct TocIter<'a> {
    stack: Vec<&'a TocEntry>,
}

impl<'a> Iterator for TocIter<'a> {
    type Item = &'a TocEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.stack.pop()?;
        // Push children in reverse so first child is popped next
        for child in entry.children.iter().rev() {
            self.stack.push(child);
        }
        Some(entry)
    }
}

// ---------------------------------------------------------------------------
// Guide
// ---------------------------------------------------------------------------

/// Standard section references (cover, table of contents, etc.).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guide {
    refs: Vec<GuideRef>,
}

impl Guide {
    pub fn new() -> Self {
        Self { refs: Vec::new() }
    }

    pub fn add(&mut self, reference: GuideRef) {
        // Replace existing reference of same type
        self.refs.retain(|r| r.ref_type != reference.ref_type);
        self.refs.push(reference);
    }

    pub fn get(&self, ref_type: &str) -> Option<&GuideRef> {
        self.refs.iter().find(|r| r.ref_type == ref_type)
    }

    pub fn remove(&mut self, ref_type: &str) {
        self.refs.retain(|r| r.ref_type != ref_type);
    }

    pub fn retain(&mut self, f: impl FnMut(&GuideRef) -> bool) {
        self.refs.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &GuideRef> {
        self.refs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GuideRef> {
        self.refs.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuideRef {
    pub ref_type: String,
    pub title: String,
    /// Canonical href, optionally with `#fragment`.
    pub href: String,
}

impl GuideRef {
    pub fn new(
        ref_type: impl Into<String>,
        title: impl Into<String>,
        href: impl Into<String>,
    ) -> Self {
        Self {
            ref_type: ref_type.into(),
            title: title.into(),
            href: href.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Format enumeration
// ---------------------------------------------------------------------------

/// Ebook formats the pipeline can name. Only some have plugins; the rest
/// exist so detection can report what it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EbookFormat {
    Oeb,
    Epub,
    Html,
    Xhtml,
    Txt,
    Markdown,
    Pdf,
    Mobi,
    Azw3,
    Docx,
    Fb2,
    Rtf,
    Odt,
}

impl EbookFormat {
    /// Parse from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "opf" | "oeb" => Some(Self::Oeb),
            "epub" => Some(Self::Epub),
            "html" | "htm" | "shtml" => Some(Self::Html),
            "xhtml" | "xhtm" => Some(Self::Xhtml),
            "txt" | "text" => Some(Self::Txt),
            "md" | "markdown" => Some(Self::Markdown),
            "pdf" => Some(Self::Pdf),
            "mobi" | "prc" | "azw" => Some(Self::Mobi),
            "azw3" | "kf8" => Some(Self::Azw3),
            "docx" => Some(Self::Docx),
            "fb2" => Some(Self::Fb2),
            "rtf" => Some(Self::Rtf),
            "odt" => Some(Self::Odt),
            _ => None,
        }
    }

    /// Parse a user supplied format name (`--input-format`).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::from_extension(name.trim_start_matches('.'))
    }

    /// Detect the format of a file: extension first, then content.
    pub fn detect(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Self::Oeb);
        }
        if let Some(fmt) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
        {
            return Some(fmt);
        }
        let head = read_head(path, 4096).ok()?;
        Self::sniff(&head)
    }

    /// Guess a format from the first bytes of a file.
    pub fn sniff(head: &[u8]) -> Option<Self> {
        if head.starts_with(convert_utils::archive::ZIP_MAGIC) {
            if contains_bytes(head, b"application/epub+zip") {
                return Some(Self::Epub);
            }
            if contains_bytes(head, b"application/vnd.oasis.opendocument.text") {
                return Some(Self::Odt);
            }
            if contains_bytes(head, b"word/") {
                return Some(Self::Docx);
            }
            return None;
        }
        if head.starts_with(b"%PDF") {
            return Some(Self::Pdf);
        }
        if head.starts_with(b"{\\rtf") {
            return Some(Self::Rtf);
        }
        if head.len() >= 68 && &head[60..68] == b"BOOKMOBI" {
            return Some(Self::Mobi);
        }
        let text = match std::str::from_utf8(head) {
            Ok(s) => s,
            Err(e) if e.error_len().is_none() => {
                std::str::from_utf8(&head[..e.valid_up_to()]).unwrap_or("")
            }
            Err(_) => return None,
        };
        let lower = text.to_ascii_lowercase();
        if lower.contains("<package") {
            Some(Self::Oeb)
        } else if lower.contains("<fictionbook") {
            Some(Self::Fb2)
        } else if lower.contains("<html")
            || lower.contains("<!doctype html")
            || (lower.trim_start().starts_with("<?xml") && lower.contains("xhtml"))
        {
            Some(Self::Html)
        } else {
            Some(Self::Txt)
        }
    }

    /// Get the canonical file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Oeb => "opf",
            Self::Epub => "epub",
            Self::Html => "html",
            Self::Xhtml => "xhtml",
            Self::Txt => "txt",
            Self::Markdown => "md",
            Self::Pdf => "pdf",
            Self::Mobi => "mobi",
            Self::Azw3 => "azw3",
            Self::Docx => "docx",
            Self::Fb2 => "fb2",
            Self::Rtf => "rtf",
            Self::Odt => "odt",
        }
    }

    /// Get MIME type.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Oeb => mime::OPF_MIME,
            Self::Epub => "application/epub+zip",
            Self::Html | Self::Xhtml => "text/html",
            Self::Txt | Self::Markdown => "text/plain",
            Self::Pdf => "application/pdf",
            Self::Mobi => "application/x-mobipocket-ebook",
            Self::Azw3 => "application/x-mobi8-ebook",
            Self::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Self::Fb2 => "application/x-fictionbook+xml",
            Self::Rtf => "application/rtf",
            Self::Odt => "application/vnd.oasis.opendocument.text",
        }
    }
}

impl std::fmt::Display for EbookFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oeb => f.write_str("OEB"),
            other => write!(f, "{}", other.extension().to_uppercase()),
        }
    }
}

fn read_head(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut buf = Vec::with_capacity(len);
    std::fs::File::open(path)?
        .take(len as u64)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xhtml(body: &str) -> ManifestData {
        ManifestData::binary(
            format!(
                "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>t</title></head><body>{}</body></html>",
                body
            )
            .into_bytes(),
        )
    }

    #[test]
    fn test_book_document_creation() {
        let book = BookDocument::new();
        assert!(book.manifest.is_empty());
        assert!(book.spine.is_empty());
        assert_eq!(book.version, "2.0");
    }

    #[test]
    fn test_metadata() {
        let mut meta = Metadata::new();
        meta.set_title("Test Book");
        meta.add("creator", "Author One");
        meta.add("creator", "Author Two");

        assert_eq!(meta.title(), Some("Test Book"));
        assert_eq!(meta.authors().len(), 2);
        assert_eq!(meta.authors()[0], "Author One");
    }

    #[test]
    fn test_identifier_unique_by_scheme() {
        let mut meta = Metadata::new();
        meta.add_identifier("111", Some("ISBN"));
        meta.add_identifier("urn:uuid:1", Some("uuid"));
        meta.add_identifier("222", Some("isbn"));
        let ids = meta.get("identifier").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().any(|i| i.value == "222"));
        assert!(!ids.iter().any(|i| i.value == "111"));
    }

    #[test]
    fn test_add_item_rejects_duplicates() {
        let mut book = BookDocument::new();
        let id = book
            .add_item("./text/ch1.xhtml", mime::XHTML_MIME, xhtml("<p>a</p>"))
            .unwrap()
            .id
            .clone();
        assert!(id.starts_with("html"));
        assert!(book.item("text/ch1.xhtml").is_some());
        assert!(book
            .add_item("text/ch1.xhtml", mime::XHTML_MIME, ManifestData::Empty)
            .is_err());
    }

    #[test]
    fn test_manifest_generate_id() {
        let mut manifest = Manifest::new();
        let id1 = manifest.generate_id("item");
        let id2 = manifest.generate_id("item");
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_spine() {
        let mut book = BookDocument::new();
        book.add_item("a.xhtml", mime::XHTML_MIME, xhtml("")).unwrap();
        book.add_item("b.xhtml", mime::XHTML_MIME, xhtml("")).unwrap();
        book.add_to_spine("a.xhtml", true).unwrap();
        book.add_to_spine("b.xhtml", false).unwrap();
        assert_eq!(book.spine_hrefs(), vec!["a.xhtml", "b.xhtml"]);
        assert_eq!(book.spine_position("b.xhtml"), Some(1));
        assert_eq!(book.spine.linear_items().count(), 1);
        assert!(book.add_to_spine("missing.xhtml", true).is_err());
    }

    #[test]
    fn test_rename_rewrites_links() {
        let mut book = BookDocument::new();
        book.add_item("x.html", mime::XHTML_MIME, xhtml("<a href=\"sub/y.html#z\">go</a>"))
            .unwrap();
        book.add_item(
            "sub/y.html",
            mime::XHTML_MIME,
            xhtml("<p id=\"z\">y</p><a href=\"../x.html\">back</a><img src=\"../img/a.png\"/>"),
        )
        .unwrap();
        book.add_item("img/a.png", "image/png", ManifestData::binary(vec![1, 2, 3]))
            .unwrap();
        book.toc.add(TocEntry::new("Y", "sub/y.html#z"));
        book.guide.add(GuideRef::new("text", "Start", "sub/y.html"));

        book.rename_item("sub/y.html", "renamed/y.html").unwrap();

        let x = book.xhtml("x.html").unwrap();
        let a = x.find_first("a").unwrap();
        assert_eq!(x.attr(a, "href"), Some("renamed/y.html#z"));

        // The moved document's own relative links still resolve.
        let y = book.xhtml("renamed/y.html").unwrap();
        assert_eq!(y.attr(y.find_first("a").unwrap(), "href"), Some("../x.html"));
        assert_eq!(y.attr(y.find_first("img").unwrap(), "src"), Some("../img/a.png"));

        assert_eq!(book.toc.entries[0].href, "renamed/y.html");
        assert_eq!(book.toc.entries[0].fragment.as_deref(), Some("z"));
        assert_eq!(book.guide.get("text").unwrap().href, "renamed/y.html");
        assert!(book.item("sub/y.html").is_none());
    }

    #[test]
    fn test_rename_updates_css_urls() {
        let mut book = BookDocument::new();
        book.add_item(
            "styles/main.css",
            mime::CSS_MIME,
            ManifestData::binary(b"@import \"base.css\"; p { background: url(../img/bg.png) }".to_vec()),
        )
        .unwrap();
        book.add_item("styles/base.css", mime::CSS_MIME, ManifestData::binary(Vec::new()))
            .unwrap();
        book.add_item("img/bg.png", "image/png", ManifestData::binary(vec![0]))
            .unwrap();

        book.rename_item("img/bg.png", "images/bg.png").unwrap();
        book.rename_item("styles/base.css", "base.css").unwrap();

        let css = book.css("styles/main.css").unwrap().to_css();
        assert!(css.contains("url(\"../images/bg.png\")"));
        assert!(css.contains("@import url(\"../base.css\")"));
    }

    #[test]
    fn test_remove_item_with_links() {
        let mut book = BookDocument::new();
        book.add_item(
            "a.xhtml",
            mime::XHTML_MIME,
            xhtml("<p><a href=\"b.xhtml\">to b</a><img src=\"i.png\"/></p>"),
        )
        .unwrap();
        book.add_item("b.xhtml", mime::XHTML_MIME, xhtml("<p>b</p>")).unwrap();
        book.add_item("i.png", "image/png", ManifestData::binary(vec![0])).unwrap();
        book.add_to_spine("a.xhtml", true).unwrap();
        book.add_to_spine("b.xhtml", true).unwrap();
        let mut entry = TocEntry::new("B", "b.xhtml");
        entry.add_child(TocEntry::new("A", "a.xhtml"));
        book.toc.add(entry);

        book.remove_item("b.xhtml", true).unwrap();
        book.remove_item("i.png", true).unwrap();

        assert_eq!(book.spine.len(), 1);
        assert_eq!(book.toc.entries.len(), 1);
        assert_eq!(book.toc.entries[0].href, "a.xhtml");
        let xml = String::from_utf8(book.serialize("a.xhtml").unwrap()).unwrap();
        assert!(xml.contains("<p>to b</p>"));
        assert!(!xml.contains("<img"));
    }

    #[test]
    fn test_snapshot_is_copy_on_write() {
        let mut book = BookDocument::new();
        book.add_item("a.xhtml", mime::XHTML_MIME, xhtml("<p>one</p>")).unwrap();
        book.parse("a.xhtml").unwrap();
        let snapshot = book.clone();

        let doc = book.xhtml_mut("a.xhtml").unwrap();
        let p = doc.find_first("p").unwrap();
        doc.set_text_content(p, "two");

        let before = snapshot.xhtml("a.xhtml").unwrap();
        assert_eq!(before.text_content(before.find_first("p").unwrap()), "one");
        let after = book.xhtml("a.xhtml").unwrap();
        assert_eq!(after.text_content(after.find_first("p").unwrap()), "two");
    }

    #[test]
    fn test_parse_is_memoized() {
        let mut book = BookDocument::new();
        book.add_item("a.xhtml", mime::XHTML_MIME, xhtml("<p>x</p>")).unwrap();
        book.add_item("s.css", mime::CSS_MIME, ManifestData::binary(b"p{color:red}".to_vec()))
            .unwrap();
        assert!(book.item("a.xhtml").unwrap().needs_parse());
        book.parse_all().unwrap();
        assert!(matches!(book.item("a.xhtml").unwrap().data, ManifestData::Xhtml(_)));
        assert!(matches!(book.item("s.css").unwrap().data, ManifestData::Css(_)));
        assert!(!book.item("s.css").unwrap().needs_parse());
    }

    #[test]
    fn test_normalize() {
        let mut book = BookDocument::new();
        book.manifest
            .add(ManifestItem::new("c1", "text/./c1.html", mime::HTML_MIME, xhtml("<a href=\"./c2.html\">n</a>")))
            .unwrap();
        book.manifest
            .add(ManifestItem::new("c2", "text/c2.html", mime::HTML_MIME, xhtml("")))
            .unwrap();
        book.manifest
            .add(ManifestItem::new("img", "cover.jpg", "image/jpeg", ManifestData::binary(vec![0])))
            .unwrap();
        book.spine.push("c1", true);
        book.spine.push("img", true);
        book.spine.push("c2", true);
        book.spine.push("ghost", true);
        book.toc.add(TocEntry::new("One", "text/c1.html"));
        book.toc.add(TocEntry::new("Gone", "missing.html"));
        book.toc.add(TocEntry::new("Web", "http://example.com/"));

        book.normalize().unwrap();

        assert!(book.item("text/c1.html").is_some());
        assert_eq!(book.item("text/c1.html").unwrap().media_type, mime::XHTML_MIME);
        assert_eq!(book.spine_hrefs(), vec!["text/c1.html", "text/c2.html"]);
        assert_eq!(book.toc.entries.len(), 2);
        assert_eq!(book.toc.entries[1].play_order, Some(2));
        let doc = book.xhtml("text/c1.html").unwrap();
        assert_eq!(doc.attr(doc.find_first("a").unwrap(), "href"), Some("c2.html"));
    }

    #[test]
    fn test_toc() {
        let mut toc = Toc::new();
        let mut ch1 = TocEntry::new("Chapter 1", "ch1.xhtml");
        ch1.add_child(TocEntry::new("Section 1.1", "ch1.xhtml#s1"));
        ch1.add_child(TocEntry::new("Section 1.2", "ch1.xhtml#s2"));
        toc.add(ch1);
        toc.add(TocEntry::new("Chapter 2", "ch2.xhtml"));

        assert_eq!(toc.count(), 4);
        assert_eq!(toc.entries[0].children[0].fragment.as_deref(), Some("s1"));
        assert_eq!(toc.entries[0].children[0].target(), "ch1.xhtml#s1");

        toc.rationalize_play_orders();
        let orders: Vec<u32> = toc
            .iter_depth_first()
            .map(|e| e.play_order.unwrap())
            .collect();
        assert_eq!(orders, vec![1, 2, 3, 4]);

        toc.for_each_mut(|e| e.title = e.title.to_uppercase());
        assert_eq!(toc.entries[0].children[1].title, "SECTION 1.2");

        toc.retain(|e| e.title != "CHAPTER 1");
        assert_eq!(toc.entries.len(), 3);
    }

    #[test]
    fn test_guide() {
        let mut guide = Guide::new();
        guide.add(GuideRef::new("cover", "Cover", "cover.xhtml"));
        guide.add(GuideRef::new("toc", "Table of Contents", "toc.xhtml"));

        assert_eq!(guide.get("cover").unwrap().href, "cover.xhtml");
        guide.remove("cover");
        assert!(guide.get("cover").is_none());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(EbookFormat::from_extension("epub"), Some(EbookFormat::Epub));
        assert_eq!(EbookFormat::from_extension("OPF"), Some(EbookFormat::Oeb));
        assert_eq!(EbookFormat::from_extension("unknown"), None);
        assert_eq!(EbookFormat::Epub.extension(), "epub");
        assert_eq!(EbookFormat::Oeb.to_string(), "OEB");
    }

    #[test]
    fn test_format_sniffing() {
        let mut epub = b"PK\x03\x04".to_vec();
        epub.extend_from_slice(&[0; 26]);
        epub.extend_from_slice(b"mimetypeapplication/epub+zip");
        assert_eq!(EbookFormat::sniff(&epub), Some(EbookFormat::Epub));
        assert_eq!(EbookFormat::sniff(b"%PDF-1.4"), Some(EbookFormat::Pdf));
        assert_eq!(
            EbookFormat::sniff(b"<?xml version=\"1.0\"?><package version=\"2.0\">"),
            Some(EbookFormat::Oeb)
        );
        assert_eq!(EbookFormat::sniff(b"<!DOCTYPE html><html>"), Some(EbookFormat::Html));
        assert_eq!(EbookFormat::sniff(b"Just some text."), Some(EbookFormat::Txt));
        assert_eq!(EbookFormat::sniff(&[0xff, 0xfe, 0x00, 0xd8, 0x00]), None);
    }
}
