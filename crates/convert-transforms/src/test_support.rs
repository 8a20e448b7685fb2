//! Fixtures shared by the transform tests.

use convert_core::book::{BookDocument, ManifestData};
use convert_utils::mime::{CSS_MIME, XHTML_MIME};

/// An XHTML document with the given head and body markup.
pub fn xhtml(head: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>t</title>{}</head><body>{}</body></html>",
        head, body
    )
}

/// A book with XHTML items (added to the spine in order) and stylesheets.
pub fn book(documents: &[(&str, String)], sheets: &[(&str, &str)]) -> BookDocument {
    let mut book = BookDocument::new();
    for (href, css) in sheets {
        book.add_item(href, CSS_MIME, ManifestData::binary(css.as_bytes().to_vec()))
            .unwrap();
    }
    for (href, markup) in documents {
        book.add_item(href, XHTML_MIME, ManifestData::binary(markup.clone().into_bytes()))
            .unwrap();
        book.add_to_spine(href, true).unwrap();
    }
    book.parse_all().unwrap();
    book
}

/// Serialized text of an item.
pub fn text_of(book: &BookDocument, href: &str) -> String {
    String::from_utf8(book.serialize(href).unwrap()).unwrap()
}
