//! Link following for HTML input: starting from one file, collect the
//! local documents, stylesheets and media it reaches, and assign each a
//! manifest href.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use convert_core::dom::Document;
use convert_core::error::{ConvertError, Result};
use convert_core::href;
use convert_core::links::{self, LinkAction};
use convert_utils::{encoding, mime, xml};

pub enum Content {
    Document(Document),
    Stylesheet(String),
    Binary(Vec<u8>),
}

pub struct Resource {
    pub href: String,
    pub media_type: String,
    pub path: PathBuf,
    pub content: Content,
}

impl Resource {
    pub fn is_document(&self) -> bool {
        matches!(self.content, Content::Document(_))
    }
}

pub struct Crawler<'a> {
    root: PathBuf,
    encoding: Option<&'a str>,
    max_levels: u32,
    by_path: HashMap<PathBuf, usize>,
    taken: HashSet<String>,
    resources: Vec<Resource>,
}

impl<'a> Crawler<'a> {
    pub fn new(encoding: Option<&'a str>, max_levels: u32) -> Self {
        Self {
            root: PathBuf::new(),
            encoding,
            max_levels,
            by_path: HashMap::new(),
            taken: HashSet::new(),
            resources: Vec::new(),
        }
    }

    /// Read `input` and everything it links to. Resources come back in
    /// discovery order (breadth first) with internal links rewritten to the
    /// assigned hrefs.
    pub fn run(mut self, input: &Path) -> Result<Vec<Resource>> {
        let input = std::fs::canonicalize(input)?;
        self.root = input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let content = self.load(&input, true, mime::XHTML_MIME).map_err(|e| {
            ConvertError::format(crate::PLUGIN_NAME, format!("{}: {}", input.display(), e))
        })?;
        self.register(&input, mime::XHTML_MIME, content);

        let mut queue = VecDeque::from([(0usize, 0u32)]);
        while let Some((idx, level)) = queue.pop_front() {
            let raw_links = match &self.resources[idx].content {
                Content::Document(doc) => links::document_links(doc),
                Content::Stylesheet(text) => links::css_text_urls(text),
                Content::Binary(_) => continue,
            };
            let dir = parent_dir(&self.resources[idx].path);
            for raw in raw_links {
                let Some(target) = local_path(&dir, &raw) else {
                    continue;
                };
                if self.by_path.contains_key(&target) {
                    continue;
                }
                let media_type = mime::mime_from_path(&target);
                let is_html = mime::is_xhtml_mime(media_type);
                let child_level = if is_html { level + 1 } else { level };
                if is_html && child_level > self.max_levels {
                    log::debug!("Not following {} past {} levels", raw, self.max_levels);
                    continue;
                }
                let media_type = if is_html { mime::XHTML_MIME } else { media_type };
                match self.load(&target, is_html, media_type) {
                    Ok(content) => {
                        let scan = !matches!(content, Content::Binary(_));
                        let id = self.register(&target, media_type, content);
                        if scan {
                            queue.push_back((id, child_level));
                        }
                    }
                    Err(e) => log::warn!("Skipping linked file {}: {}", target.display(), e),
                }
            }
        }

        self.rewrite_links();
        log::debug!("Collected {} files", self.resources.len());
        Ok(self.resources)
    }

    fn load(&self, path: &Path, is_html: bool, media_type: &str) -> Result<Content> {
        let bytes = std::fs::read(path)?;
        if is_html {
            let (text, detected) = encoding::decode_document(&bytes, self.encoding);
            log::debug!("Decoded {} as {}", path.display(), detected);
            return parse_html(&text).map(Content::Document);
        }
        if mime::is_css_mime(media_type) {
            return Ok(Content::Stylesheet(encoding::decode_to_utf8(&bytes).0));
        }
        Ok(Content::Binary(bytes))
    }

    fn register(&mut self, path: &Path, media_type: &str, content: Content) -> usize {
        let href = self.assign_href(path);
        let idx = self.resources.len();
        self.by_path.insert(path.to_path_buf(), idx);
        self.resources.push(Resource {
            href,
            media_type: media_type.to_string(),
            path: path.to_path_buf(),
            content,
        });
        idx
    }

    /// Path relative to the input directory; files outside it go to
    /// `external/`.
    fn assign_href(&mut self, path: &Path) -> String {
        let relative = path
            .strip_prefix(&self.root)
            .ok()
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .filter(|s| !s.is_empty());
        let candidate = relative.unwrap_or_else(|| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            format!("external/{}", name)
        });

        let mut unique = candidate.clone();
        let mut n = 1;
        while self.taken.contains(&unique) {
            let dir = href::dirname(&candidate);
            unique = match href::stem_and_extension(&candidate) {
                (stem, Some(ext)) => format!("{}{}_{}.{}", dir, stem, n, ext),
                (stem, None) => format!("{}{}_{}", dir, stem, n),
            };
            n += 1;
        }
        self.taken.insert(unique.clone());
        unique
    }

    fn rewrite_links(&mut self) {
        let hrefs: HashMap<PathBuf, String> = self
            .by_path
            .iter()
            .map(|(path, &idx)| (path.clone(), self.resources[idx].href.clone()))
            .collect();

        for resource in &mut self.resources {
            let dir = parent_dir(&resource.path);
            let from = resource.href.clone();
            let map = |raw: &str| -> Option<String> {
                let target = local_path(&dir, raw)?;
                let to = hrefs.get(&target)?;
                let fragment = href::split_fragment(raw.trim()).1;
                let rel = href::relative(&from, &href::with_fragment(to, fragment));
                let new = href::percent_encode_href(&rel);
                (new != raw).then_some(new)
            };
            match &mut resource.content {
                Content::Document(doc) => {
                    links::rewrite_document(doc, &mut |raw| match map(raw) {
                        Some(new) => LinkAction::Replace(new),
                        None => LinkAction::Keep,
                    });
                }
                Content::Stylesheet(text) => {
                    *text = links::rewrite_css_text(text, &mut |raw| map(raw));
                }
                Content::Binary(_) => {}
            }
        }
    }
}

/// Parse HTML text; a fragment without an `<html>` element is wrapped in
/// a skeleton document.
pub fn parse_html(text: &str) -> Result<Document> {
    let doc = Document::parse(text)?;
    if doc.find_first("html").is_some() {
        return Ok(doc);
    }
    Document::parse(&xml::xhtml11_document("", "en", None, text))
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Existing local file a raw link points to.
fn local_path(dir: &Path, raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') || href::is_external(raw) {
        return None;
    }
    let path = href::split_fragment(raw).0;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    let target = std::fs::canonicalize(dir.join(href::percent_decode(path))).ok()?;
    target.is_file().then_some(target)
}
