//! Plain text and Markdown to XHTML body markup.

use pulldown_cmark::{html, Options, Parser};

use convert_utils::xml::escape_xml_text;

/// How paragraphs are marked in plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParagraphType {
    /// Blank lines separate paragraphs; line breaks inside are soft wraps.
    Block,
    /// Every line is a paragraph.
    Single,
    /// An indented line starts a paragraph.
    Print,
    /// Blank lines separate paragraphs; line breaks inside are kept.
    Unformatted,
}

impl ParagraphType {
    /// Parse the `paragraph_type` option; `auto` and unknown values
    /// detect from the text.
    pub fn from_option(value: &str, text: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => ParagraphType::Block,
            "single" => ParagraphType::Single,
            "print" => ParagraphType::Print,
            "unformatted" => ParagraphType::Unformatted,
            "auto" => Self::detect(text),
            other => {
                log::warn!("Unknown paragraph type '{}', detecting", other);
                Self::detect(text)
            }
        }
    }

    /// Guess the paragraph style from blank line and indentation ratios.
    pub fn detect(text: &str) -> Self {
        let mut lines = 0usize;
        let mut blank = 0usize;
        let mut indented = 0usize;
        for line in text.lines() {
            if line.trim().is_empty() {
                blank += 1;
                continue;
            }
            lines += 1;
            if line.starts_with('\t') || line.starts_with("  ") {
                indented += 1;
            }
        }
        let detected = if lines == 0 || (blank > 0 && blank * 10 >= lines) {
            ParagraphType::Block
        } else if indented * 4 >= lines {
            ParagraphType::Print
        } else {
            ParagraphType::Single
        };
        log::debug!(
            "Detected {:?} paragraphs ({} lines, {} blank, {} indented)",
            detected,
            lines,
            blank,
            indented
        );
        detected
    }
}

/// Plain text to a sequence of `<p>` elements.
pub fn text_to_html(text: &str, kind: ParagraphType) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let paragraphs: Vec<String> = match kind {
        ParagraphType::Block => blocks(&text)
            .into_iter()
            .map(|lines| join_escaped(&lines, " "))
            .collect(),
        ParagraphType::Unformatted => blocks(&text)
            .into_iter()
            .map(|lines| join_escaped(&lines, "<br/>\n"))
            .collect(),
        ParagraphType::Single => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(escape_xml_text)
            .collect(),
        ParagraphType::Print => {
            let mut out: Vec<Vec<&str>> = Vec::new();
            for line in text.lines() {
                if line.trim().is_empty() {
                    out.push(Vec::new());
                    continue;
                }
                let starts_new = line.starts_with('\t') || line.starts_with("  ");
                match out.last_mut() {
                    Some(current) if !starts_new && !current.is_empty() => {
                        current.push(line.trim())
                    }
                    _ => out.push(vec![line.trim()]),
                }
            }
            out.into_iter()
                .filter(|p| !p.is_empty())
                .map(|p| join_escaped(&p, " "))
                .collect()
        }
    };

    let mut body = String::with_capacity(text.len() + paragraphs.len() * 8);
    for p in paragraphs {
        body.push_str("<p>");
        body.push_str(&p);
        body.push_str("</p>\n");
    }
    body
}

fn blocks(text: &str) -> Vec<Vec<&str>> {
    let mut out: Vec<Vec<&str>> = vec![Vec::new()];
    for line in text.lines() {
        if line.trim().is_empty() {
            if out.last().map(|b| !b.is_empty()).unwrap_or(false) {
                out.push(Vec::new());
            }
        } else if let Some(current) = out.last_mut() {
            current.push(line.trim());
        }
    }
    out.retain(|b| !b.is_empty());
    out
}

fn join_escaped(lines: &[&str], sep: &str) -> String {
    lines
        .iter()
        .map(|l| escape_xml_text(l))
        .collect::<Vec<_>>()
        .join(sep)
}

/// CommonMark with tables, footnotes, strikethrough and heading ids.
pub fn markdown_to_html(markdown: &str) -> String {
    let options = Options::ENABLE_TABLES
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_HEADING_ATTRIBUTES;
    let parser = Parser::new_ext(markdown, options);
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}
