//! EPUB writer: assembles the OCF container from a BookDocument.

use std::borrow::Cow;
use std::path::Path;

use rayon::prelude::*;

use convert_core::book::BookDocument;
use convert_core::error::{ConvertError, Result};
use convert_core::opf;
use convert_core::plugin::Context;
use convert_utils::archive::ZipBuilder;
use convert_utils::mime;
use convert_utils::xml::XmlBuilder;

use crate::PLUGIN_NAME;

/// Directory inside the container that holds the package.
const CONTENT_DIR: &str = "OEBPS";
const EPUB_MIMETYPE: &[u8] = b"application/epub+zip";

struct Entry<'a> {
    href: &'a str,
    precompressed: bool,
    bytes: Vec<u8>,
}

/// Write `book` as an EPUB 2 file at `output_path`.
pub fn write_epub(book: &BookDocument, output_path: &Path, ctx: &Context<'_>) -> Result<()> {
    let book = with_required_metadata(book);
    let book = &*book;
    let minify = ctx.options.minify_css;

    let entries: Vec<Entry<'_>> = book
        .manifest
        .items()
        .par_iter()
        .map(|item| -> Result<Entry<'_>> {
            let mut bytes = book.serialize(&item.href)?;
            if minify && mime::is_css_mime(&item.media_type) {
                bytes = minify_css(&String::from_utf8_lossy(&bytes), &item.href).into_bytes();
            }
            Ok(Entry {
                href: &item.href,
                precompressed: mime::is_precompressed_mime(&item.media_type),
                bytes,
            })
        })
        .collect::<Result<_>>()?;
    ctx.check_cancelled()?;
    ctx.report_progress(0.5, &format!("Serialized {} items", entries.len()));

    let ncx_href = book.manifest.generate_href("toc", "ncx");
    let opf_href = book.manifest.generate_href("content", "opf");

    let mut zip = ZipBuilder::new(output_path).map_err(|e| zip_error("create", output_path, e))?;
    // The mimetype entry must come first and be stored.
    zip.add_stored("mimetype", EPUB_MIMETYPE)
        .map_err(|e| zip_error("write", "mimetype", e))?;
    zip.add_file(
        "META-INF/container.xml",
        container_xml(&format!("{}/{}", CONTENT_DIR, opf_href)).as_bytes(),
    )
    .map_err(|e| zip_error("write", "container.xml", e))?;

    for entry in &entries {
        let name = format!("{}/{}", CONTENT_DIR, entry.href);
        zip.add_entry(&name, &entry.bytes, entry.precompressed)
            .map_err(|e| zip_error("write", &name, e))?;
    }

    let opf_name = format!("{}/{}", CONTENT_DIR, opf_href);
    zip.add_file(&opf_name, opf::write_opf(book, Some(&ncx_href)).as_bytes())
        .map_err(|e| zip_error("write", &opf_name, e))?;
    let ncx_name = format!("{}/{}", CONTENT_DIR, ncx_href);
    zip.add_file(&ncx_name, opf::write_ncx(book, &ncx_href).as_bytes())
        .map_err(|e| zip_error("write", &ncx_name, e))?;

    zip.finish()
        .map_err(|e| zip_error("finalize", output_path, e))?;
    log::info!(
        "EPUB written: {} ({} items)",
        output_path.display(),
        entries.len()
    );
    Ok(())
}

fn zip_error(action: &str, what: impl AsRef<Path>, e: std::io::Error) -> ConvertError {
    ConvertError::format(
        PLUGIN_NAME,
        format!("cannot {} {}: {}", action, what.as_ref().display(), e),
    )
}

/// EPUB readers reject packages without an identifier, a title or a
/// language; fill in whichever is missing on a shallow copy.
fn with_required_metadata(book: &BookDocument) -> Cow<'_, BookDocument> {
    let missing_uid = book.uid.is_none();
    let missing_title = book.metadata.title().is_none();
    let missing_language = book.metadata.language().is_none();
    if !(missing_uid || missing_title || missing_language) {
        return Cow::Borrowed(book);
    }

    let mut book = book.clone();
    if missing_uid {
        let uid = format!("urn:uuid:{}", uuid::Uuid::new_v4());
        log::warn!("Book has no unique identifier, using {}", uid);
        book.metadata.add_identifier(uid.as_str(), Some("uuid"));
        book.uid = Some(uid);
    }
    if missing_title {
        log::warn!("Book has no title");
        book.metadata.set_title("Unknown");
    }
    if missing_language {
        book.metadata.set("language", "und");
    }
    Cow::Owned(book)
}

fn container_xml(rootfile: &str) -> String {
    let mut xml = XmlBuilder::new();
    xml.open_tag(
        "container",
        &[
            ("version", "1.0"),
            ("xmlns", "urn:oasis:names:tc:opendocument:xmlns:container"),
        ],
    )
    .open_tag("rootfiles", &[])
    .empty_tag(
        "rootfile",
        &[("full-path", rootfile), ("media-type", mime::OPF_MIME)],
    )
    .close_tag("rootfiles")
    .close_tag("container");
    xml.build()
}

/// Minify a stylesheet with lightningcss; on a parse or print failure the
/// text is kept as it was.
fn minify_css(css: &str, href: &str) -> String {
    use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};

    let mut sheet = match StyleSheet::parse(css, ParserOptions::default()) {
        Ok(sheet) => sheet,
        Err(e) => {
            log::warn!("Not minifying {}: {}", href, e);
            return css.to_string();
        }
    };
    if let Err(e) = sheet.minify(MinifyOptions::default()) {
        log::warn!("CSS minification warning for {}: {}", href, e);
    }
    let printer = PrinterOptions {
        minify: true,
        ..PrinterOptions::default()
    };
    match sheet.to_css(printer) {
        Ok(result) => {
            log::debug!(
                "Minified {} ({} -> {} bytes)",
                href,
                css.len(),
                result.code.len()
            );
            result.code
        }
        Err(e) => {
            log::warn!("Not minifying {}: {}", href, e);
            css.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convert_core::book::{ManifestData, TocEntry};
    use convert_core::dom::Document;
    use convert_core::options::ConversionOptions;
    use convert_utils::archive;
    use convert_utils::xml::xhtml11_document;

    fn make_test_book() -> BookDocument {
        let mut book = BookDocument::new();
        book.uid = Some("urn:uuid:test-uid-123".to_string());
        book.metadata.set_title("Test Book");
        book.metadata.add("creator", "Test Author");
        book.metadata.set("language", "en");

        let doc = Document::parse(&xhtml11_document(
            "One",
            "en",
            Some("style.css"),
            "<p>Hello</p>",
        ))
        .unwrap();
        book.add_item("chapter1.xhtml", mime::XHTML_MIME, ManifestData::xhtml(doc))
            .unwrap();
        book.add_item(
            "style.css",
            mime::CSS_MIME,
            ManifestData::binary(b"p {\n  color: red;\n  margin: 0px;\n}\n".to_vec()),
        )
        .unwrap();
        book.add_item(
            "images/pic.png",
            mime::PNG_MIME,
            ManifestData::binary(vec![0x89, b'P', b'N', b'G']),
        )
        .unwrap();
        book.add_to_spine("chapter1.xhtml", true).unwrap();
        book.toc.add(TocEntry::new("Chapter 1", "chapter1.xhtml"));
        book
    }

    fn write(book: &BookDocument, opts: &ConversionOptions) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.epub");
        write_epub(book, &path, &Context::new(opts)).unwrap();
        (dir, path)
    }

    #[test]
    fn test_container_xml() {
        let xml = container_xml("OEBPS/content.opf");
        assert!(xml.contains(r#"full-path="OEBPS/content.opf""#));
        assert!(xml.contains("urn:oasis:names:tc:opendocument:xmlns:container"));
    }

    #[test]
    fn test_entry_layout() {
        let (_dir, path) = write(&make_test_book(), &ConversionOptions::default());
        let names = archive::list_zip_entries(&path).unwrap();
        assert_eq!(names[0], "mimetype");
        assert_eq!(names[1], "META-INF/container.xml");
        for name in [
            "OEBPS/chapter1.xhtml",
            "OEBPS/style.css",
            "OEBPS/images/pic.png",
            "OEBPS/content.opf",
            "OEBPS/toc.ncx",
        ] {
            assert!(names.iter().any(|n| n == name), "missing {}", name);
        }
        assert_eq!(
            archive::read_zip_entry(&path, "mimetype").unwrap(),
            EPUB_MIMETYPE
        );

        let opf_text =
            String::from_utf8(archive::read_zip_entry(&path, "OEBPS/content.opf").unwrap())
                .unwrap();
        assert!(opf_text.contains("<dc:title>Test Book</dc:title>"));
        assert!(opf_text.contains(r#"href="toc.ncx""#));
        let ncx = String::from_utf8(archive::read_zip_entry(&path, "OEBPS/toc.ncx").unwrap())
            .unwrap();
        assert!(ncx.contains("Chapter 1"));
        assert!(ncx.contains(r#"playOrder="1""#));
    }

    #[test]
    fn test_css_minified_on_request() {
        let opts = ConversionOptions {
            minify_css: true,
            ..ConversionOptions::default()
        };
        let (_dir, path) = write(&make_test_book(), &opts);
        let css = String::from_utf8(archive::read_zip_entry(&path, "OEBPS/style.css").unwrap())
            .unwrap();
        assert!(!css.contains('\n'));
        assert!(css.contains("color:red"));

        let (_dir, path) = write(&make_test_book(), &ConversionOptions::default());
        let css = String::from_utf8(archive::read_zip_entry(&path, "OEBPS/style.css").unwrap())
            .unwrap();
        assert!(css.contains("color: red"));
    }

    #[test]
    fn test_missing_metadata_is_filled() {
        let mut book = make_test_book();
        book.uid = None;
        book.metadata.remove("title");
        book.metadata.remove("language");

        let filled = with_required_metadata(&book);
        let uid = filled.uid.clone().unwrap();
        assert!(uid.starts_with("urn:uuid:"));
        assert_eq!(filled.metadata.identifier(), Some(uid.as_str()));
        assert_eq!(filled.metadata.title(), Some("Unknown"));
        assert_eq!(filled.metadata.language(), Some("und"));

        let complete = make_test_book();
        assert!(matches!(with_required_metadata(&complete), Cow::Borrowed(_)));
    }

    #[test]
    fn test_invalid_css_is_kept() {
        let css = "p { color: red";
        let out = minify_css(css, "broken.css");
        assert!(out.contains("color"));
    }
}
