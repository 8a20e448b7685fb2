//! Arena XHTML tree.
//!
//! Nodes live in a `Vec` and refer to each other by [`NodeId`]; parents are
//! plain indices so the tree can be mutated while walking it. Detached nodes
//! stay in the arena until the document is dropped.

use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use convert_utils::xml::{escape_xml_attr, escape_xml_text, XML_DECLARATION};

use crate::error::{ConvertError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub data: NodeData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Document,
    Element(ElementData),
    Text(String),
    Comment(String),
    ProcessingInstruction(String),
    Doctype(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementData {
    /// Qualified name as written (`svg:image`, `p`).
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl ElementData {
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whitespace separated `class` tokens.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_ascii_whitespace()
    }
}

/// HTML elements that never have content.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

pub fn is_void_element(name: &str) -> bool {
    VOID_ELEMENTS.iter().any(|v| v.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// An empty document holding only the document node.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                data: NodeData::Document,
            }],
        }
    }

    /// Parse XHTML, tolerating HTML-isms: void elements without a closing
    /// slash, unclosed and stray end tags, HTML named entities.
    pub fn parse(source: &str) -> Result<Self> {
        let mut doc = Document::new();
        let mut reader = Reader::from_str(source);
        {
            let config = reader.config_mut();
            config.check_end_names = false;
            config.allow_unmatched_ends = true;
        }

        let mut stack: Vec<NodeId> = vec![doc.root()];
        loop {
            let parent = stack.last().copied().unwrap_or(doc.root());
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    let element = element_from_start(e);
                    let void = is_void_element(&element.name);
                    let id = doc.push(NodeData::Element(element));
                    doc.append_child(parent, id);
                    if !void {
                        stack.push(id);
                    }
                }
                Ok(Event::Empty(ref e)) => {
                    let id = doc.push(NodeData::Element(element_from_start(e)));
                    doc.append_child(parent, id);
                }
                Ok(Event::End(ref e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let open = stack.iter().rposition(|&id| {
                        doc.element(id)
                            .map(|el| el.name.eq_ignore_ascii_case(&name))
                            .unwrap_or(false)
                    });
                    match open {
                        Some(pos) => stack.truncate(pos),
                        None => log::trace!("Ignoring stray end tag </{}>", name),
                    }
                }
                Ok(Event::Text(ref t)) => {
                    let raw = String::from_utf8_lossy(&**t);
                    doc.append_text(parent, &decode_entities(&raw));
                }
                Ok(Event::CData(ref t)) => {
                    let raw = String::from_utf8_lossy(&**t).into_owned();
                    doc.append_text(parent, &raw);
                }
                Ok(Event::Comment(ref t)) => {
                    let id = doc.push(NodeData::Comment(
                        String::from_utf8_lossy(&**t).into_owned(),
                    ));
                    doc.append_child(parent, id);
                }
                Ok(Event::PI(ref t)) => {
                    let id = doc.push(NodeData::ProcessingInstruction(
                        String::from_utf8_lossy(&**t).into_owned(),
                    ));
                    doc.append_child(parent, id);
                }
                Ok(Event::DocType(ref t)) => {
                    let id = doc.push(NodeData::Doctype(
                        String::from_utf8_lossy(&**t).trim().to_string(),
                    ));
                    doc.append_child(parent, id);
                }
                Ok(Event::Decl(_)) => {}
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(ConvertError::Xml(format!(
                        "at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
            }
        }
        Ok(doc)
    }

    /// Parse raw bytes, detecting the character encoding.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let (text, _) = convert_utils::encoding::decode_document(bytes, None);
        Self::parse(&text)
    }

    /// Build a minimal XHTML document with a `<head>`, `<title>` and an
    /// empty `<body>`.
    pub fn skeleton(title: &str) -> Self {
        let mut doc = Document::new();
        let root = doc.root();
        let html = doc.create_element(
            "html",
            vec![("xmlns".to_string(), convert_utils::xml::XHTML_NS.to_string())],
        );
        doc.append_child(root, html);
        let head = doc.create_element("head", Vec::new());
        doc.append_child(html, head);
        let title_el = doc.create_element("title", Vec::new());
        doc.append_child(head, title_el);
        let text = doc.create_text(title);
        doc.append_child(title_el, text);
        let body = doc.create_element("body", Vec::new());
        doc.append_child(html, body);
        doc
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            data,
        });
        id
    }

    fn append_text(&mut self, parent: NodeId, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(&last) = self.nodes[parent.0].children.last() {
            if let NodeData::Text(ref mut existing) = self.nodes[last.0].data {
                existing.push_str(text);
                return;
            }
        }
        let id = self.push(NodeData::Text(text.to_string()));
        self.append_child(parent, id);
    }

    /// The document node.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn element(&self, id: NodeId) -> Option<&ElementData> {
        match &self.nodes[id.0].data {
            NodeData::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match &mut self.nodes[id.0].data {
            NodeData::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.element(id).is_some()
    }

    /// Local name of an element, lower-cased comparisons are up to the caller.
    pub fn local_name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(ElementData::local_name)
    }

    /// True when `id` is an element with the given local name (ASCII
    /// case-insensitive).
    pub fn is_named(&self, id: NodeId, name: &str) -> bool {
        self.local_name(id)
            .map(|n| n.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|el| el.attr(name))
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: impl Into<String>) {
        if let Some(el) = self.element_mut(id) {
            let value = value.into();
            match el.attrs.iter_mut().find(|(k, _)| k == name) {
                Some(slot) => slot.1 = value,
                None => el.attrs.push((name.to_string(), value)),
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> Option<String> {
        let el = self.element_mut(id)?;
        let pos = el.attrs.iter().position(|(k, _)| k == name)?;
        Some(el.attrs.remove(pos).1)
    }

    pub fn create_element(&mut self, name: &str, attrs: Vec<(String, String)>) -> NodeId {
        self.push(NodeData::Element(ElementData {
            name: name.to_string(),
            attrs,
        }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Text(text.to_string()))
    }

    /// Append `child` as the last child of `parent`, detaching it first.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Insert `child` immediately before `reference` in its parent.
    pub fn insert_before(&mut self, reference: NodeId, child: NodeId) {
        let Some(parent) = self.nodes[reference.0].parent else {
            return;
        };
        self.detach(child);
        let pos = self.index_in_parent(reference).unwrap_or(0);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.insert(pos, child);
    }

    /// Remove `id` from its parent. The subtree stays in the arena.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent.take() {
            self.nodes[parent.0].children.retain(|&c| c != id);
        }
    }

    /// Replace an element by its children.
    pub fn unwrap_element(&mut self, id: NodeId) {
        let children = self.nodes[id.0].children.clone();
        for child in children {
            self.insert_before(id, child);
        }
        self.detach(id);
    }

    pub fn index_in_parent(&self, id: NodeId) -> Option<usize> {
        let parent = self.nodes[id.0].parent?;
        self.nodes[parent.0].children.iter().position(|&c| c == id)
    }

    /// Descendants of `id` in document order, `id` excluded.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id.0].children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next.0].children.iter().rev().copied());
        }
        out
    }

    /// All attached elements in document order.
    pub fn elements(&self) -> Vec<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .filter(|&id| self.is_element(id))
            .collect()
    }

    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.nodes[id.0].parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.nodes[p.0].parent;
        }
        out
    }

    pub fn root_element(&self) -> Option<NodeId> {
        self.children(self.root())
            .iter()
            .copied()
            .find(|&c| self.is_element(c))
    }

    /// First element with the given local name, in document order.
    pub fn find_first(&self, name: &str) -> Option<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .find(|&id| self.is_named(id, name))
    }

    pub fn find_all(&self, name: &str) -> Vec<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .filter(|&id| self.is_named(id, name))
            .collect()
    }

    pub fn head(&self) -> Option<NodeId> {
        self.find_first("head")
    }

    pub fn body(&self) -> Option<NodeId> {
        self.find_first("body")
    }

    /// Element whose `id` attribute equals `value`.
    pub fn element_by_id(&self, value: &str) -> Option<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .find(|&id| self.attr(id, "id") == Some(value) || self.attr(id, "name") == Some(value))
    }

    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let NodeData::Text(t) = &self.nodes[id.0].data {
            out.push_str(t);
        }
        for d in self.descendants(id) {
            if let NodeData::Text(t) = &self.nodes[d.0].data {
                out.push_str(t);
            }
        }
        out
    }

    /// Replace the children of `id` with a single text node.
    pub fn set_text_content(&mut self, id: NodeId, text: &str) {
        let children = self.nodes[id.0].children.clone();
        for child in children {
            self.detach(child);
        }
        let t = self.create_text(text);
        self.append_child(id, t);
    }

    pub fn first_element_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).iter().copied().find(|&c| self.is_element(c))
    }

    pub fn prev_sibling_element(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let pos = siblings.iter().position(|&c| c == id)?;
        siblings[..pos].iter().rev().copied().find(|&c| self.is_element(c))
    }

    pub fn next_sibling_element(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let pos = siblings.iter().position(|&c| c == id)?;
        siblings[pos + 1..].iter().copied().find(|&c| self.is_element(c))
    }

    /// True when an element has no element children and no non-whitespace
    /// text.
    pub fn is_blank(&self, id: NodeId) -> bool {
        self.descendants(id).into_iter().all(|d| match &self.nodes[d.0].data {
            NodeData::Text(t) => t.trim().is_empty(),
            NodeData::Comment(_) | NodeData::ProcessingInstruction(_) => true,
            _ => false,
        })
    }

    /// Serialize the whole document as XML with a declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(self.nodes.len() * 32);
        out.push_str(XML_DECLARATION);
        out.push('\n');
        for &child in self.children(self.root()) {
            self.write_node(child, &mut out);
            if !matches!(self.nodes[child.0].data, NodeData::Text(_)) {
                out.push('\n');
            }
        }
        out
    }

    /// Serialize one node and its subtree.
    pub fn outer_xml(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id.0];
        match &node.data {
            NodeData::Document => {
                for &c in &node.children {
                    self.write_node(c, out);
                }
            }
            NodeData::Element(el) => {
                out.push('<');
                out.push_str(&el.name);
                for (k, v) in &el.attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    out.push_str(&escape_xml_attr(v));
                    out.push('"');
                }
                if node.children.is_empty() && is_void_element(&el.name) {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for &c in &node.children {
                    self.write_node(c, out);
                }
                out.push_str("</");
                out.push_str(&el.name);
                out.push('>');
            }
            NodeData::Text(t) => out.push_str(&escape_xml_text(t)),
            NodeData::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            NodeData::ProcessingInstruction(p) => {
                out.push_str("<?");
                out.push_str(p);
                out.push_str("?>");
            }
            NodeData::Doctype(d) => {
                out.push_str("<!DOCTYPE ");
                out.push_str(d);
                out.push('>');
            }
        }
    }
}

fn element_from_start(e: &BytesStart<'_>) -> ElementData {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs: Vec<(String, String)> = Vec::new();
    let mut iter = e.html_attributes();
    iter.with_checks(false);
    for attr in iter.flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if attrs.iter().any(|(k, _)| *k == key) {
            continue;
        }
        let raw = String::from_utf8_lossy(&attr.value);
        attrs.push((key, decode_entities(&raw)));
    }
    ElementData { name, attrs }
}

/// Resolve character references. Unknown named references are kept
/// literally.
pub fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let end = tail[1..]
            .find(|c: char| c == ';' || c == '&' || c.is_whitespace() || c == '<')
            .map(|i| i + 1);
        let resolved = match end {
            Some(end) if tail.as_bytes()[end] == b';' => {
                resolve_entity(&tail[1..end]).map(|s| (s, end + 1))
            }
            _ => None,
        };
        match resolved {
            Some((text, consumed)) => {
                out.push_str(&text);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_entity(name: &str) -> Option<String> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    let c = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "shy" => '\u{ad}',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "deg" => '°',
        "plusmn" => '±',
        "times" => '×',
        "divide" => '÷',
        "middot" => '·',
        "para" => '¶',
        "sect" => '§',
        "laquo" => '«',
        "raquo" => '»',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "sbquo" => '\u{201a}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        "bdquo" => '\u{201e}',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "hellip" => '\u{2026}',
        "bull" => '\u{2022}',
        "dagger" => '\u{2020}',
        "Dagger" => '\u{2021}',
        "prime" => '\u{2032}',
        "Prime" => '\u{2033}',
        "ensp" => '\u{2002}',
        "emsp" => '\u{2003}',
        "thinsp" => '\u{2009}',
        "zwnj" => '\u{200c}',
        "zwj" => '\u{200d}',
        "euro" => '€',
        "pound" => '£',
        "yen" => '¥',
        "cent" => '¢',
        "iexcl" => '¡',
        "iquest" => '¿',
        "frac12" => '½',
        "frac14" => '¼',
        "frac34" => '¾',
        "sup1" => '¹',
        "sup2" => '²',
        "sup3" => '³',
        "Agrave" => 'À',
        "Aacute" => 'Á',
        "Acirc" => 'Â',
        "Auml" => 'Ä',
        "Ccedil" => 'Ç',
        "Egrave" => 'È',
        "Eacute" => 'É',
        "Ecirc" => 'Ê',
        "Ouml" => 'Ö',
        "Uuml" => 'Ü',
        "szlig" => 'ß',
        "agrave" => 'à',
        "aacute" => 'á',
        "acirc" => 'â',
        "atilde" => 'ã',
        "auml" => 'ä',
        "aring" => 'å',
        "aelig" => 'æ',
        "ccedil" => 'ç',
        "egrave" => 'è',
        "eacute" => 'é',
        "ecirc" => 'ê',
        "euml" => 'ë',
        "igrave" => 'ì',
        "iacute" => 'í',
        "icirc" => 'î',
        "iuml" => 'ï',
        "ntilde" => 'ñ',
        "ograve" => 'ò',
        "oacute" => 'ó',
        "ocirc" => 'ô',
        "otilde" => 'õ',
        "ouml" => 'ö',
        "oslash" => 'ø',
        "ugrave" => 'ù',
        "uacute" => 'ú',
        "ucirc" => 'û',
        "uuml" => 'ü',
        "yacute" => 'ý',
        "yuml" => 'ÿ',
        _ => return None,
    };
    Some(c.to_string())
}
