//! Canonical href handling for manifest paths and intra-book links.
//!
//! Manifest hrefs are forward-slashed, URL-decoded, relative paths with no
//! `.` or `..` segments. Links inside documents are resolved against the
//! href of the document that contains them.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;

static SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").expect("static regex"));

/// Characters escaped in a path segment (RFC 3986 `pchar` complement).
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'%');

/// Split `href` at the first `#`.
pub fn split_fragment(href: &str) -> (&str, Option<&str>) {
    match href.split_once('#') {
        Some((path, frag)) => (path, Some(frag)),
        None => (href, None),
    }
}

/// Join a path and an optional fragment.
pub fn with_fragment(path: &str, fragment: Option<&str>) -> String {
    match fragment {
        Some(f) if !f.is_empty() => format!("{}#{}", path, f),
        _ => path.to_string(),
    }
}

/// True for hrefs carrying a URI scheme (`http:`, `mailto:`, `data:`, ...)
/// or a network-path reference.
pub fn is_external(href: &str) -> bool {
    let href = href.trim();
    if href.starts_with("//") {
        return true;
    }
    // A single letter followed by ':' is a Windows drive, not a scheme.
    match SCHEME.find(href) {
        Some(m) => m.end() > 2,
        None => false,
    }
}

/// Scheme of an external href, lower-cased.
pub fn scheme(href: &str) -> Option<String> {
    if !is_external(href) {
        return None;
    }
    SCHEME
        .find(href.trim())
        .map(|m| m.as_str().trim_end_matches(':').to_ascii_lowercase())
}

pub fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Percent-encode a canonical href for writing into a descriptor or link.
pub fn percent_encode_href(href: &str) -> String {
    let (path, fragment) = split_fragment(href);
    let encoded: Vec<Cow<'_, str>> = path
        .split('/')
        .map(|seg| Cow::from(utf8_percent_encode(seg, PATH_SEGMENT)))
        .collect();
    let mut out = encoded.join("/");
    if let Some(f) = fragment {
        out.push('#');
        out.push_str(&utf8_percent_encode(f, FRAGMENT).to_string());
    }
    out
}

/// Canonicalize an href: decode, forward slashes, drop `.` and empty
/// segments, fold `..`. Leading `..` past the root is dropped. A fragment,
/// if present, is kept.
pub fn canonicalize(href: &str) -> String {
    let (path, fragment) = split_fragment(href.trim());
    let decoded = percent_decode(path).replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for seg in decoded.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    with_fragment(&segments.join("/"), fragment)
}

/// Directory part of a canonical href, with trailing slash (empty at root).
pub fn dirname(href: &str) -> &str {
    let (path, _) = split_fragment(href);
    match path.rfind('/') {
        Some(i) => &path[..=i],
        None => "",
    }
}

/// Final path segment.
pub fn basename(href: &str) -> &str {
    let (path, _) = split_fragment(href);
    path.rsplit('/').next().unwrap_or(path)
}

/// Split a basename into stem and extension (without the dot).
pub fn stem_and_extension(href: &str) -> (&str, Option<&str>) {
    let name = basename(href);
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(i) => (&name[..i], Some(&name[i + 1..])),
    }
}

/// Resolve `rel` as found inside the item at `base`. External hrefs come
/// back unchanged; `#frag` alone refers to `base` itself.
pub fn resolve(base: &str, rel: &str) -> String {
    let rel = rel.trim();
    if is_external(rel) {
        return rel.to_string();
    }
    let (path, fragment) = split_fragment(rel);
    let (base_path, _) = split_fragment(base);
    if path.is_empty() {
        return with_fragment(&canonicalize(base_path), fragment);
    }
    if path.starts_with('/') {
        return with_fragment(&canonicalize(path), fragment);
    }
    let joined = format!("{}{}", dirname(base_path), path);
    with_fragment(&canonicalize(&joined), fragment)
}

/// Express canonical `to` relative to the directory of canonical `from`.
/// The fragment of `to` is kept.
pub fn relative(from: &str, to: &str) -> String {
    if is_external(to) {
        return to.to_string();
    }
    let (to_path, fragment) = split_fragment(to);
    let from_dir: Vec<&str> = dirname(from).split('/').filter(|s| !s.is_empty()).collect();
    let to_segs: Vec<&str> = to_path.split('/').filter(|s| !s.is_empty()).collect();
    let (to_dirs, to_file) = match to_segs.split_last() {
        Some((file, dirs)) => (dirs, *file),
        None => (&[][..], ""),
    };

    let common = from_dir
        .iter()
        .zip(to_dirs.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    for _ in common..from_dir.len() {
        parts.push("..");
    }
    parts.extend(&to_dirs[common..]);
    parts.push(to_file);
    with_fragment(&parts.join("/"), fragment)
}
