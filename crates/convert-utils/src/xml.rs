//! XML writing helpers for OPF, NCX, container.xml and generated XHTML.

use std::fmt::Write as _;

pub const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

/// XHTML 1.1 DOCTYPE for EPUB 2 compliance.
pub const XHTML11_DOCTYPE: &str =
    "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.1//EN\" \"http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd\">";

pub const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// Pretty-printing XML writer. Every element starts on its own line,
/// indented two spaces per open ancestor.
pub struct XmlBuilder {
    out: String,
    open: Vec<String>,
}

impl XmlBuilder {
    pub fn new() -> Self {
        let mut out = String::with_capacity(4096);
        out.push_str(XML_DECLARATION);
        out.push('\n');
        Self {
            out,
            open: Vec::new(),
        }
    }

    pub fn open_tag(&mut self, name: &str, attrs: &[(&str, &str)]) -> &mut Self {
        self.start_tag(name, attrs);
        self.out.push_str(">\n");
        self.open.push(name.to_string());
        self
    }

    /// Close the innermost open element. `name` must match it.
    pub fn close_tag(&mut self, name: &str) -> &mut Self {
        let top = self.open.pop();
        debug_assert_eq!(top.as_deref(), Some(name), "mismatched close tag");
        self.pad();
        let _ = writeln!(self.out, "</{}>", name);
        self
    }

    pub fn empty_tag(&mut self, name: &str, attrs: &[(&str, &str)]) -> &mut Self {
        self.start_tag(name, attrs);
        self.out.push_str("/>\n");
        self
    }

    pub fn text_element(&mut self, name: &str, text: &str, attrs: &[(&str, &str)]) -> &mut Self {
        self.start_tag(name, attrs);
        self.out.push('>');
        push_escaped(&mut self.out, text, false);
        let _ = writeln!(self.out, "</{}>", name);
        self
    }

    /// Append pre-serialized markup as is.
    pub fn raw(&mut self, markup: &str) -> &mut Self {
        self.out.push_str(markup);
        self
    }

    /// Finish the document, closing anything still open.
    pub fn build(mut self) -> String {
        while let Some(name) = self.open.pop() {
            self.pad();
            let _ = writeln!(self.out, "</{}>", name);
        }
        self.out
    }

    fn start_tag(&mut self, name: &str, attrs: &[(&str, &str)]) {
        self.pad();
        self.out.push('<');
        self.out.push_str(name);
        for (key, value) in attrs {
            let _ = write!(self.out, " {}=\"", key);
            push_escaped(&mut self.out, value, true);
            self.out.push('"');
        }
    }

    fn pad(&mut self) {
        let width = self.open.len() * 2;
        self.out.extend(std::iter::repeat(' ').take(width));
    }
}

impl Default for XmlBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a complete XHTML 1.1 document around an already serialized body.
pub fn xhtml11_document(title: &str, lang: &str, css_href: Option<&str>, body: &str) -> String {
    let stylesheet = css_href
        .map(|href| {
            format!(
                "  <link rel=\"stylesheet\" type=\"text/css\" href=\"{}\"/>\n",
                escape_xml_attr(href)
            )
        })
        .unwrap_or_default();
    format!(
        "{decl}\n{doctype}\n<html xmlns=\"{ns}\" xml:lang=\"{lang}\">\n<head>\n  <title>{title}</title>\n{stylesheet}</head>\n<body>\n{body}\n</body>\n</html>\n",
        decl = XML_DECLARATION,
        doctype = XHTML11_DOCTYPE,
        ns = XHTML_NS,
        lang = escape_xml_attr(lang),
        title = escape_xml_text(title),
        stylesheet = stylesheet,
        body = body,
    )
}

/// Escape `&`, `<` and `>` for use in character data.
pub fn escape_xml_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    push_escaped(&mut out, s, false);
    out
}

/// Escape for use inside a double-quoted attribute value.
pub fn escape_xml_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    push_escaped(&mut out, s, true);
    out
}

fn push_escaped(out: &mut String, s: &str, quote: bool) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if quote => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}
