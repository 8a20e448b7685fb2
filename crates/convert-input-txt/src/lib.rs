//! TXT/Markdown input plugin: turns plain text or Markdown into a single
//! XHTML document with a default stylesheet, written as an OEB directory.

mod markup;

use std::path::{Path, PathBuf};

use convert_core::book::{BookDocument, EbookFormat, ManifestData};
use convert_core::dom::Document;
use convert_core::error::Result;
use convert_core::plugin::{Context, InputPlugin};
use convert_core::{href, links, opf};
use convert_utils::{encoding, mime, xml};

use crate::markup::ParagraphType;

const CONTENT_HREF: &str = "index.xhtml";
const STYLE_HREF: &str = "stylesheet.css";
const DEFAULT_CSS: &str = "body { font-family: serif; line-height: 1.4; }\n\
                           p { margin: 0 0 0.4em 0; text-indent: 1.2em; }\n\
                           pre { white-space: pre-wrap; }\n";

pub struct TxtInputPlugin;

impl InputPlugin for TxtInputPlugin {
    fn name(&self) -> &str {
        "TXT Input"
    }

    fn supported_formats(&self) -> &[EbookFormat] {
        &[EbookFormat::Txt, EbookFormat::Markdown]
    }

    fn convert(
        &self,
        input: &Path,
        format: EbookFormat,
        scratch: &Path,
        ctx: &Context<'_>,
    ) -> Result<PathBuf> {
        log::info!("Reading text: {}", input.display());
        let opts = ctx.options;
        let bytes = std::fs::read(input)?;
        let (text, detected) = encoding::decode_document(&bytes, opts.input_encoding.as_deref());
        log::debug!("Decoded {} as {}", input.display(), detected);

        let title = opts.title.clone().unwrap_or_else(|| {
            input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Unknown".to_string())
        });
        let lang = opts.language.as_deref().unwrap_or("en");

        let body = if format == EbookFormat::Markdown {
            markup::markdown_to_html(&text)
        } else {
            let kind = ParagraphType::from_option(&opts.paragraph_type, &text);
            markup::text_to_html(&text, kind)
        };
        let doc = Document::parse(&xml::xhtml11_document(&title, lang, Some(STYLE_HREF), &body))?;
        ctx.report_progress(0.5, "Text converted");

        let mut book = BookDocument::new();
        book.metadata.set_title(title.as_str());
        book.metadata.set("language", lang);
        let base_dir = input.parent().unwrap_or_else(|| Path::new("."));
        add_local_resources(&mut book, &doc, base_dir)?;
        book.add_item(
            STYLE_HREF,
            mime::CSS_MIME,
            ManifestData::binary(DEFAULT_CSS.as_bytes().to_vec()),
        )?;
        book.add_item(CONTENT_HREF, mime::XHTML_MIME, ManifestData::xhtml(doc))?;
        book.add_to_spine(CONTENT_HREF, true)?;

        let descriptor = opf::write_oeb_dir(&book, &scratch.join("txt"))?;
        ctx.report_progress(1.0, "Text ready");
        Ok(descriptor)
    }
}

/// Images and other files the text links to by relative path (Markdown
/// `![alt](path)`), copied in under the same href.
fn add_local_resources(book: &mut BookDocument, doc: &Document, base_dir: &Path) -> Result<()> {
    for raw in links::document_links(doc) {
        if raw.starts_with('#') || href::is_external(&raw) {
            continue;
        }
        let target = href::canonicalize(href::split_fragment(&raw).0);
        if target.is_empty()
            || target.starts_with("..")
            || target == CONTENT_HREF
            || target == STYLE_HREF
            || book.item(&target).is_some()
        {
            continue;
        }
        let path = opf::join_href(base_dir, &target);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let media_type = mime::mime_from_path(&path);
                book.add_item(&target, media_type, ManifestData::binary(bytes))?;
                log::debug!("Added linked file {}", target);
            }
            Err(e) => log::warn!("Linked file {} not readable: {}", raw, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convert_core::options::ConversionOptions;

    fn convert(
        name: &str,
        content: &str,
        format: EbookFormat,
        opts: &ConversionOptions,
    ) -> BookDocument {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join(name);
        std::fs::write(&input, content).unwrap();
        std::fs::write(dir.path().join("pic.png"), b"png").unwrap();
        let descriptor = TxtInputPlugin
            .convert(&input, format, &dir.path().join("scratch"), &Context::new(opts))
            .unwrap();
        let mut book = opf::read_opf(&descriptor).unwrap();
        book.parse_all().unwrap();
        book
    }

    #[test]
    fn test_plain_text() {
        let opts = ConversionOptions::default();
        let book = convert("notes.txt", "Hello <world>\n\nSecond", EbookFormat::Txt, &opts);
        assert_eq!(book.metadata.title(), Some("notes"));
        assert_eq!(book.spine_hrefs(), vec![CONTENT_HREF]);
        let doc = book.xhtml(CONTENT_HREF).unwrap();
        let paras = doc.find_all("p");
        assert_eq!(paras.len(), 2);
        assert_eq!(doc.text_content(paras[0]), "Hello <world>");
        assert!(book.item(STYLE_HREF).is_some());
    }

    #[test]
    fn test_markdown_with_image_and_title_override() {
        let opts = ConversionOptions {
            title: Some("Field Guide".to_string()),
            ..ConversionOptions::default()
        };
        let book = convert(
            "guide.md",
            "# Birds\n\n![a bird](pic.png)\n\n[web](https://example.com)",
            EbookFormat::Markdown,
            &opts,
        );
        assert_eq!(book.metadata.title(), Some("Field Guide"));
        assert!(book.item("pic.png").is_some());
        let doc = book.xhtml(CONTENT_HREF).unwrap();
        assert_eq!(doc.find_all("h1").len(), 1);
    }
}
