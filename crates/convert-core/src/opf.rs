//! OPF 2 package descriptor and NCX table of contents.
//!
//! The descriptor is the hand-off point between input plugins and the
//! container: a plugin writes resources plus a `.opf` into its scratch
//! directory and the pipeline loads it with [`read_opf`]. Hrefs inside the
//! descriptor are relative to its directory and percent-encoded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use rayon::prelude::*;

use convert_utils::mime;
use convert_utils::xml::XmlBuilder;

use crate::book::{BookDocument, GuideRef, ManifestData, ManifestItem, PageDirection, TocEntry};
use crate::error::{ConvertError, Result};
use crate::href;

const OPF_NS: &str = "http://www.idpf.org/2007/opf";
const DC_NS: &str = "http://purl.org/dc/elements/1.1/";
const NCX_NS: &str = "http://www.daisy.org/z3986/2005/ncx/";
const CALIBRE_NS: &str = "http://calibre.kovidgoyal.net/2009/metadata";

/// Dublin Core terms written as `dc:` elements; anything else in the
/// metadata map becomes an OPF `<meta name content>`.
const DC_TERMS: &[&str] = &[
    "title",
    "creator",
    "contributor",
    "subject",
    "description",
    "publisher",
    "date",
    "type",
    "format",
    "identifier",
    "source",
    "language",
    "relation",
    "coverage",
    "rights",
];

/// Load a container from an OPF file. Every manifest entry becomes a lazy
/// item pointing at the file next to the descriptor.
pub fn read_opf(path: &Path) -> Result<BookDocument> {
    let bytes = std::fs::read(path)
        .map_err(|e| ConvertError::resource(path.display().to_string(), e.to_string()))?;
    let (text, _) = convert_utils::encoding::decode_to_utf8(&bytes);
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    read_opf_str(&text, base_dir)
}

/// Load a container from descriptor text; `base_dir` is where its hrefs
/// point.
pub fn read_opf_str(opf: &str, base_dir: &Path) -> Result<BookDocument> {
    let package = parse_package(opf)?;
    let mut book = BookDocument::new();
    book.base_path = Some(base_dir.to_path_buf());
    book.version = package.version;

    for (term, value, attrs) in package.metadata {
        book.metadata.add_with_attrs(term, value, attrs);
    }
    book.uid = package.uid;

    let mut ncx_href = None;
    for raw in &package.manifest {
        let canonical = href::canonicalize(&raw.href);
        if Some(&raw.id) == package.spine_toc.as_ref() || raw.media_type == mime::NCX_MIME {
            ncx_href = Some(canonical);
            continue;
        }
        if canonical.is_empty() || href::is_external(&raw.href) {
            log::warn!("Ignoring manifest entry '{}' with href '{}'", raw.id, raw.href);
            continue;
        }
        let media_type = if raw.media_type.is_empty() {
            mime::mime_from_path(Path::new(&canonical)).to_string()
        } else {
            raw.media_type.clone()
        };
        let mut item = ManifestItem::new(
            raw.id.clone(),
            canonical.clone(),
            media_type,
            ManifestData::Lazy(join_href(base_dir, &canonical)),
        );
        item.fallback = raw.fallback.clone();
        if let Err(e) = book.manifest.add(item) {
            log::warn!("Skipping manifest entry '{}': {}", raw.id, e);
        }
    }

    for (idref, linear) in package.spine {
        if book.manifest.by_id(&idref).is_some() {
            book.spine.push(idref, linear);
        } else {
            log::warn!("Spine references unknown manifest id '{}'", idref);
        }
    }
    book.spine.page_progression_direction = package.direction;

    for (ref_type, title, raw) in package.guide {
        book.guide.add(GuideRef::new(ref_type, title, href::canonicalize(&raw)));
    }

    if let Some(ncx_href) = ncx_href {
        match std::fs::read(join_href(base_dir, &ncx_href)) {
            Ok(bytes) => {
                let (text, _) = convert_utils::encoding::decode_to_utf8(&bytes);
                book.toc.entries = parse_ncx(&text, &ncx_href)?;
            }
            Err(e) => log::warn!("Cannot read NCX {}: {}", ncx_href, e),
        }
    }
    book.toc.rationalize_play_orders();

    log::info!(
        "Loaded descriptor: {} manifest items, {} spine items, {} TOC entries",
        book.manifest.len(),
        book.spine.len(),
        book.toc.count()
    );
    Ok(book)
}

/// Filesystem path of a canonical href under `dir`.
pub fn join_href(dir: &Path, href: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    for seg in href::split_fragment(href).0.split('/') {
        path.push(seg);
    }
    path
}

struct RawItem {
    id: String,
    href: String,
    media_type: String,
    fallback: Option<String>,
}

#[derive(Default)]
struct Package {
    version: String,
    uid: Option<String>,
    metadata: Vec<(String, String, BTreeMap<String, String>)>,
    manifest: Vec<RawItem>,
    spine: Vec<(String, bool)>,
    spine_toc: Option<String>,
    direction: Option<PageDirection>,
    guide: Vec<(String, String, String)>,
}

#[derive(PartialEq)]
enum Section {
    None,
    Metadata,
    Manifest,
    Spine,
    Guide,
}

fn parse_package(opf: &str) -> Result<Package> {
    let mut reader = Reader::from_str(opf);
    let mut package = Package {
        version: "2.0".to_string(),
        ..Default::default()
    };
    let mut seen_package = false;
    let mut unique_id_ref: Option<String> = None;
    let mut section = Section::None;
    // Open DC element inside <metadata>: (term, attrs, element id, text).
    let mut current: Option<(String, BTreeMap<String, String>, Option<String>, String)> = None;
    let mut identifier_ids: Vec<(Option<String>, String)> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ConvertError::format("opf", format!("XML error: {}", e)))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let local = local_name(e);
                let attrs = attributes(e);
                match (local.as_str(), &section) {
                    ("package", _) => {
                        seen_package = true;
                        if let Some(v) = attr(&attrs, "version") {
                            package.version = v.to_string();
                        }
                        unique_id_ref = attr(&attrs, "unique-identifier").map(str::to_string);
                    }
                    ("metadata", _) => section = Section::Metadata,
                    ("manifest", _) => section = Section::Manifest,
                    ("spine", _) => {
                        section = Section::Spine;
                        package.spine_toc = attr(&attrs, "toc").map(str::to_string);
                        package.direction = match attr(&attrs, "page-progression-direction") {
                            Some("rtl") => Some(PageDirection::Rtl),
                            Some("ltr") => Some(PageDirection::Ltr),
                            _ => None,
                        };
                    }
                    ("guide", _) => section = Section::Guide,
                    ("meta", Section::Metadata) => {
                        if let (Some(name), Some(content)) = (attr(&attrs, "name"), attr(&attrs, "content")) {
                            package
                                .metadata
                                .push((name.to_string(), content.to_string(), BTreeMap::new()));
                        }
                    }
                    (term, Section::Metadata) if DC_TERMS.contains(&term) => {
                        let id = attr(&attrs, "id").map(str::to_string);
                        let kept: BTreeMap<String, String> =
                            attrs.into_iter().filter(|(k, _)| k != "id").collect();
                        if is_empty {
                            continue;
                        }
                        current = Some((term.to_string(), kept, id, String::new()));
                    }
                    ("item", Section::Manifest) => {
                        let id = attr(&attrs, "id").unwrap_or_default().to_string();
                        let raw_href = attr(&attrs, "href").unwrap_or_default().to_string();
                        if id.is_empty() || raw_href.is_empty() {
                            log::warn!("Manifest item without id or href");
                            continue;
                        }
                        package.manifest.push(RawItem {
                            id,
                            href: raw_href,
                            media_type: attr(&attrs, "media-type").unwrap_or_default().to_string(),
                            fallback: attr(&attrs, "fallback").map(str::to_string),
                        });
                    }
                    ("itemref", Section::Spine) => {
                        if let Some(idref) = attr(&attrs, "idref") {
                            let linear = attr(&attrs, "linear") != Some("no");
                            package.spine.push((idref.to_string(), linear));
                        }
                    }
                    ("reference", Section::Guide) => {
                        let ref_type = attr(&attrs, "type").unwrap_or_default();
                        let target = attr(&attrs, "href").unwrap_or_default();
                        if !ref_type.is_empty() && !target.is_empty() {
                            package.guide.push((
                                ref_type.to_string(),
                                attr(&attrs, "title").unwrap_or_default().to_string(),
                                target.to_string(),
                            ));
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) => {
                if let Some((_, _, _, text)) = current.as_mut() {
                    match t.unescape() {
                        Ok(s) => text.push_str(&s),
                        Err(_) => text.push_str(&String::from_utf8_lossy(t)),
                    }
                }
            }
            Event::CData(ref c) => {
                if let Some((_, _, _, text)) = current.as_mut() {
                    text.push_str(&String::from_utf8_lossy(c));
                }
            }
            Event::End(ref e) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match local.as_str() {
                    "metadata" | "manifest" | "spine" | "guide" => section = Section::None,
                    _ => {
                        if let Some((term, attrs, id, text)) = current.take() {
                            if term != local {
                                current = Some((term, attrs, id, text));
                                continue;
                            }
                            let value = collapse_whitespace(&text);
                            if value.is_empty() {
                                continue;
                            }
                            if term == "identifier" {
                                identifier_ids.push((id, value.clone()));
                            }
                            package.metadata.push((term, value, attrs));
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_package {
        return Err(ConvertError::format("opf", "no <package> element"));
    }
    package.uid = identifier_ids
        .iter()
        .find(|(id, _)| id.is_some() && *id == unique_id_ref)
        .or_else(|| identifier_ids.first())
        .map(|(_, v)| v.clone());
    Ok(package)
}

/// Parse an NCX document; `ncx_href` is its canonical href, used to
/// resolve `content/@src`.
pub fn parse_ncx(ncx: &str, ncx_href: &str) -> Result<Vec<TocEntry>> {
    let mut reader = Reader::from_str(ncx);
    // Open navPoints, innermost last.
    let mut stack: Vec<TocEntry> = Vec::new();
    let mut roots: Vec<TocEntry> = Vec::new();
    let mut in_nav_map = false;
    let mut in_label_text = false;
    let mut in_label = false;
    let mut meta_name: Option<String> = None;
    let mut meta_text = String::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ConvertError::format("ncx", format!("XML error: {}", e)))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let local = local_name(e);
                let attrs = attributes(e);
                match local.as_str() {
                    "navMap" => in_nav_map = true,
                    "navPoint" if in_nav_map => {
                        let mut entry = TocEntry::new(String::new(), String::new());
                        entry.id = attr(&attrs, "id").map(str::to_string);
                        entry.klass = attr(&attrs, "class").map(str::to_string);
                        entry.play_order = attr(&attrs, "playOrder").and_then(|p| p.parse().ok());
                        if is_empty {
                            continue;
                        }
                        stack.push(entry);
                    }
                    "navLabel" if !stack.is_empty() => in_label = true,
                    "text" if in_label => in_label_text = true,
                    "content" => {
                        if let (Some(entry), Some(src)) = (stack.last_mut(), attr(&attrs, "src")) {
                            set_target(entry, ncx_href, src);
                        }
                    }
                    "meta" if !stack.is_empty() && !is_empty => {
                        meta_name = attr(&attrs, "name").map(str::to_string);
                        meta_text.clear();
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(t).into_owned());
                if in_label_text {
                    if let Some(entry) = stack.last_mut() {
                        entry.title.push_str(&text);
                    }
                } else if meta_name.is_some() {
                    meta_text.push_str(&text);
                }
            }
            Event::End(ref e) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match local.as_str() {
                    "navMap" => in_nav_map = false,
                    "text" => in_label_text = false,
                    "navLabel" => in_label = false,
                    "meta" => {
                        if let (Some(name), Some(entry)) = (meta_name.take(), stack.last_mut()) {
                            let value = collapse_whitespace(&meta_text);
                            match name.as_str() {
                                "author" => entry.author = Some(value),
                                "description" => entry.description = Some(value),
                                "thumbnail" => entry.thumbnail = Some(href::resolve(ncx_href, &value)),
                                _ => {}
                            }
                        }
                    }
                    "navPoint" => {
                        if let Some(mut entry) = stack.pop() {
                            entry.title = collapse_whitespace(&entry.title);
                            if entry.href.is_empty() {
                                log::warn!("NCX entry '{}' has no target", entry.title);
                                // Keep its children reachable.
                                match stack.last_mut() {
                                    Some(parent) => parent.children.extend(entry.children),
                                    None => roots.extend(entry.children),
                                }
                                continue;
                            }
                            match stack.last_mut() {
                                Some(parent) => parent.children.push(entry),
                                None => roots.push(entry),
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(roots)
}

fn set_target(entry: &mut TocEntry, ncx_href: &str, src: &str) {
    if href::is_external(src) {
        entry.href = src.trim().to_string();
        entry.fragment = None;
        return;
    }
    let resolved = href::resolve(ncx_href, src);
    let (path, frag) = href::split_fragment(&resolved);
    entry.href = path.to_string();
    entry.fragment = frag.filter(|f| !f.is_empty()).map(str::to_string);
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_string()
}

/// Attributes keyed by local name, values unescaped.
fn attributes(e: &BytesStart<'_>) -> Vec<(String, String)> {
    e.html_attributes()
        .with_checks(false)
        .flatten()
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.local_name().as_ref()).to_string();
            let value = a
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
            (key, value)
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Serialize the package descriptor. `ncx_href` names the NCX item to
/// reference from the spine.
pub fn write_opf(book: &BookDocument, ncx_href: Option<&str>) -> String {
    let mut xml = XmlBuilder::new();
    xml.open_tag(
        "package",
        &[
            ("xmlns", OPF_NS),
            ("unique-identifier", "uid"),
            ("version", &book.version),
        ],
    );

    xml.open_tag(
        "metadata",
        &[
            ("xmlns:dc", DC_NS),
            ("xmlns:opf", OPF_NS),
            ("xmlns:calibre", CALIBRE_NS),
        ],
    );
    let mut uid_written = false;
    for (term, items) in book.metadata.iter() {
        let is_dc = DC_TERMS.contains(&term);
        for item in items {
            if !is_dc {
                xml.empty_tag("meta", &[("name", term), ("content", &item.value)]);
                continue;
            }
            let mut attrs: Vec<(String, &str)> = Vec::new();
            if term == "identifier" && !uid_written && book.uid.as_deref() == Some(item.value.as_str()) {
                attrs.push(("id".to_string(), "uid"));
                uid_written = true;
            }
            for (k, v) in &item.attributes {
                let key = if k == "lang" {
                    "xml:lang".to_string()
                } else {
                    format!("opf:{}", k)
                };
                attrs.push((key, v.as_str()));
            }
            let borrowed: Vec<(&str, &str)> = attrs.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            xml.text_element(&format!("dc:{}", term), &item.value, &borrowed);
        }
    }
    if !uid_written {
        if let Some(uid) = &book.uid {
            xml.text_element("dc:identifier", uid, &[("id", "uid")]);
        }
    }
    xml.close_tag("metadata");

    xml.open_tag("manifest", &[]);
    let ncx_id = ncx_href.map(|_| unused_id(book, "ncx"));
    if let (Some(ncx), Some(id)) = (ncx_href, ncx_id.as_deref()) {
        let encoded = href::percent_encode_href(ncx);
        xml.empty_tag("item", &[("id", id), ("href", &encoded), ("media-type", mime::NCX_MIME)]);
    }
    for item in book.manifest.iter() {
        let encoded = href::percent_encode_href(&item.href);
        let mut attrs = vec![
            ("id", item.id.as_str()),
            ("href", encoded.as_str()),
            ("media-type", item.media_type.as_str()),
        ];
        if let Some(fallback) = &item.fallback {
            attrs.push(("fallback", fallback.as_str()));
        }
        xml.empty_tag("item", &attrs);
    }
    xml.close_tag("manifest");

    let mut spine_attrs: Vec<(&str, &str)> = Vec::new();
    if let Some(id) = ncx_id.as_deref() {
        spine_attrs.push(("toc", id));
    }
    match book.spine.page_progression_direction {
        Some(PageDirection::Rtl) => spine_attrs.push(("page-progression-direction", "rtl")),
        Some(PageDirection::Ltr) => spine_attrs.push(("page-progression-direction", "ltr")),
        None => {}
    }
    xml.open_tag("spine", &spine_attrs);
    for spine_item in book.spine.iter() {
        if spine_item.linear {
            xml.empty_tag("itemref", &[("idref", &spine_item.idref)]);
        } else {
            xml.empty_tag("itemref", &[("idref", &spine_item.idref), ("linear", "no")]);
        }
    }
    xml.close_tag("spine");

    if !book.guide.is_empty() {
        xml.open_tag("guide", &[]);
        for guide_ref in book.guide.iter() {
            let encoded = href::percent_encode_href(&guide_ref.href);
            xml.empty_tag(
                "reference",
                &[
                    ("type", &guide_ref.ref_type),
                    ("title", &guide_ref.title),
                    ("href", &encoded),
                ],
            );
        }
        xml.close_tag("guide");
    }

    xml.close_tag("package");
    xml.build()
}

fn unused_id(book: &BookDocument, base: &str) -> String {
    if book.manifest.by_id(base).is_none() {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{}{}", base, i))
        .find(|id| book.manifest.by_id(id).is_none())
        .unwrap_or_else(|| base.to_string())
}

/// Serialize the TOC as NCX. `ncx_href` is where the NCX will live; targets
/// are written relative to it. Play orders are depth-first pre-order from 1.
pub fn write_ncx(book: &BookDocument, ncx_href: &str) -> String {
    let uid = book.uid.as_deref().unwrap_or_default();
    let title = book.metadata.title().unwrap_or("Unknown");
    let depth = toc_depth(&book.toc.entries).max(1).to_string();

    let mut xml = XmlBuilder::new();
    xml.open_tag(
        "ncx",
        &[
            ("xmlns", NCX_NS),
            ("xmlns:calibre", CALIBRE_NS),
            ("version", "2005-1"),
        ],
    );
    xml.open_tag("head", &[]);
    xml.empty_tag("meta", &[("name", "dtb:uid"), ("content", uid)]);
    xml.empty_tag("meta", &[("name", "dtb:depth"), ("content", &depth)]);
    xml.empty_tag("meta", &[("name", "dtb:totalPageCount"), ("content", "0")]);
    xml.empty_tag("meta", &[("name", "dtb:maxPageNumber"), ("content", "0")]);
    xml.close_tag("head");

    xml.open_tag("docTitle", &[]);
    xml.text_element("text", title, &[]);
    xml.close_tag("docTitle");

    xml.open_tag("navMap", &[]);
    let mut play_order = 1;
    for entry in &book.toc.entries {
        write_nav_point(&mut xml, entry, ncx_href, &mut play_order);
    }
    xml.close_tag("navMap");
    xml.close_tag("ncx");
    xml.build()
}

fn toc_depth(entries: &[TocEntry]) -> usize {
    entries
        .iter()
        .map(|e| 1 + toc_depth(&e.children))
        .max()
        .unwrap_or(0)
}

fn write_nav_point(xml: &mut XmlBuilder, entry: &TocEntry, ncx_href: &str, play_order: &mut u32) {
    let id = entry
        .id
        .clone()
        .unwrap_or_else(|| format!("num_{}", play_order));
    let po = play_order.to_string();
    *play_order += 1;

    let mut attrs = vec![("id", id.as_str()), ("playOrder", po.as_str())];
    if let Some(klass) = &entry.klass {
        attrs.push(("class", klass.as_str()));
    }
    xml.open_tag("navPoint", &attrs);
    xml.open_tag("navLabel", &[]);
    xml.text_element("text", &entry.title, &[]);
    xml.close_tag("navLabel");
    let src = if href::is_external(&entry.href) {
        entry.href.clone()
    } else {
        href::percent_encode_href(&href::relative(ncx_href, &entry.target()))
    };
    xml.empty_tag("content", &[("src", &src)]);
    if let Some(author) = &entry.author {
        xml.text_element("calibre:meta", author, &[("name", "author")]);
    }
    if let Some(description) = &entry.description {
        xml.text_element("calibre:meta", description, &[("name", "description")]);
    }
    if let Some(thumbnail) = &entry.thumbnail {
        let rel = href::percent_encode_href(&href::relative(ncx_href, thumbnail));
        xml.text_element("calibre:meta", &rel, &[("name", "thumbnail")]);
    }
    for child in &entry.children {
        write_nav_point(xml, child, ncx_href, play_order);
    }
    xml.close_tag("navPoint");
}

/// Write the container as an OEB directory: every item serialized under
/// `dir`, plus `toc.ncx` and `content.opf`. Returns the descriptor path.
pub fn write_oeb_dir(book: &BookDocument, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let hrefs: Vec<&str> = book.manifest.iter().map(|i| i.href.as_str()).collect();
    hrefs
        .par_iter()
        .map(|href| -> Result<()> {
            let target = join_href(dir, href);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let bytes = book.serialize(href)?;
            std::fs::write(&target, bytes)?;
            Ok(())
        })
        .collect::<Result<Vec<()>>>()?;

    let ncx_href = book.manifest.generate_href("toc", "ncx");
    std::fs::write(join_href(dir, &ncx_href), write_ncx(book, &ncx_href))?;

    let opf_href = book.manifest.generate_href("content", "opf");
    let opf_path = join_href(dir, &opf_href);
    std::fs::write(&opf_path, write_opf(book, Some(&ncx_href)))?;

    log::debug!(
        "Wrote OEB directory {} ({} items)",
        dir.display(),
        book.manifest.len()
    );
    Ok(opf_path)
}
