//! HTML input plugin: reads an HTML file plus the local files it links to
//! and lays them out as an OEB directory in the scratch space.

mod crawl;

use std::path::{Path, PathBuf};

use convert_core::book::{BookDocument, EbookFormat, ManifestData};
use convert_core::dom::Document;
use convert_core::error::Result;
use convert_core::opf;
use convert_core::plugin::{Context, CoreUsage, InputPlugin};

use crate::crawl::{Content, Crawler, Resource};

pub(crate) const PLUGIN_NAME: &str = "HTML Input";

pub struct HtmlInputPlugin;

impl InputPlugin for HtmlInputPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn supported_formats(&self) -> &[EbookFormat] {
        &[EbookFormat::Html, EbookFormat::Xhtml]
    }

    fn core_usage(&self) -> CoreUsage {
        CoreUsage::All
    }

    fn convert(
        &self,
        input: &Path,
        _format: EbookFormat,
        scratch: &Path,
        ctx: &Context<'_>,
    ) -> Result<PathBuf> {
        log::info!("Reading HTML: {}", input.display());
        let opts = ctx.options;
        let resources =
            Crawler::new(opts.input_encoding.as_deref(), opts.max_html_levels).run(input)?;
        ctx.check_cancelled()?;
        ctx.report_progress(0.6, &format!("Read {} linked files", resources.len()));

        let book = build_book(input, resources)?;
        let descriptor = opf::write_oeb_dir(&book, &scratch.join("html"))?;
        ctx.report_progress(1.0, "HTML ready");
        Ok(descriptor)
    }
}

fn build_book(input: &Path, resources: Vec<Resource>) -> Result<BookDocument> {
    let mut book = BookDocument::new();
    if let Some(Content::Document(doc)) = resources.first().map(|r| &r.content) {
        read_metadata(doc, &mut book);
    }
    if book.metadata.title().is_none() {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Unknown".to_string());
        book.metadata.set_title(stem);
    }

    for resource in resources {
        let is_document = resource.is_document();
        let data = match resource.content {
            Content::Document(doc) => ManifestData::xhtml(doc),
            Content::Stylesheet(text) => ManifestData::binary(text.into_bytes()),
            Content::Binary(bytes) => ManifestData::binary(bytes),
        };
        book.add_item(&resource.href, &resource.media_type, data)?;
        if is_document {
            book.add_to_spine(&resource.href, true)?;
        }
    }
    Ok(book)
}

/// Title, language, authors, description and keywords from the head of
/// the first document.
fn read_metadata(doc: &Document, book: &mut BookDocument) {
    if let Some(title) = doc.find_first("title") {
        let text = collapse(&doc.text_content(title));
        if !text.is_empty() {
            book.metadata.set_title(text);
        }
    }
    if let Some(lang) = doc
        .root_element()
        .and_then(|root| doc.attr(root, "lang").or_else(|| doc.attr(root, "xml:lang")))
    {
        book.metadata.set("language", lang.trim());
    }

    for meta in doc.find_all("meta") {
        let (Some(name), Some(content)) = (doc.attr(meta, "name"), doc.attr(meta, "content"))
        else {
            continue;
        };
        let content = collapse(content);
        if content.is_empty() {
            continue;
        }
        match name.to_ascii_lowercase().as_str() {
            "author" | "dc.creator" => book.metadata.add("creator", content),
            "description" | "dc.description" => book.metadata.set("description", content),
            "keywords" => {
                for tag in content.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    book.metadata.add("subject", tag);
                }
            }
            _ => {}
        }
    }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
