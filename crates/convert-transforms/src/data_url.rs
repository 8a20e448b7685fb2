//! DataURL resolver: moves `data:` URIs out of documents and stylesheets
//! into manifest items.

use std::collections::HashMap;

use base64::Engine;
use percent_encoding::percent_decode_str;

use convert_core::book::{BookDocument, ManifestData};
use convert_core::error::Result;
use convert_core::href;
use convert_core::links::{self, LinkAction};
use convert_core::plugin::{Context, Transform};
use convert_utils::mime;

/// Finds `data:` URIs in link attributes, inline styles, `<style>`
/// elements and stylesheets, stores each distinct payload once as a
/// manifest item and points the references at it.
pub struct DataUrl;

impl Transform for DataUrl {
    fn name(&self) -> &str {
        "DataURL"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        let targets: Vec<(String, bool)> = book
            .iter_manifest()
            .filter(|i| i.is_xhtml() || i.is_css())
            .map(|i| (i.href.clone(), i.is_xhtml()))
            .collect();

        let mut stored: HashMap<Vec<u8>, String> = HashMap::new();
        for (item_href, is_xhtml) in targets {
            ctx.check_cancelled()?;
            let mut found = if is_xhtml {
                links::document_links(&*book.xhtml(&item_href)?)
            } else {
                links::stylesheet_urls(&*book.css(&item_href)?)
            };
            found.retain(|raw| is_data_uri(raw));
            found.dedup();
            if found.is_empty() {
                continue;
            }

            let mut replacements: HashMap<String, String> = HashMap::new();
            for raw in found {
                let Some((media_type, bytes)) = decode_data_uri(&raw) else {
                    log::warn!("Leaving undecodable data URI in {}", item_href);
                    continue;
                };
                let target = match stored.get(&bytes) {
                    Some(existing) => existing.clone(),
                    None => {
                        let base = format!("{}data_url", href::dirname(&item_href));
                        let new_href = book
                            .manifest
                            .generate_href(&base, mime::extension_from_mime(&media_type));
                        book.add_item(&new_href, &media_type, ManifestData::binary(bytes.clone()))?;
                        log::debug!("Extracted data URI from {} to {}", item_href, new_href);
                        stored.insert(bytes, new_href.clone());
                        new_href
                    }
                };
                replacements.insert(raw, href::percent_encode_href(&href::relative(&item_href, &target)));
            }

            if is_xhtml {
                let doc = book.xhtml_mut(&item_href)?;
                links::rewrite_document(doc, &mut |raw| match replacements.get(raw) {
                    Some(new) => LinkAction::Replace(new.clone()),
                    None => LinkAction::Keep,
                });
            } else {
                let sheet = book.css_mut(&item_href)?;
                links::rewrite_stylesheet(sheet, &mut |raw| replacements.get(raw).cloned());
            }
        }

        if !stored.is_empty() {
            log::info!("Resolved {} data URIs into manifest items", stored.len());
        }
        Ok(())
    }
}

fn is_data_uri(raw: &str) -> bool {
    raw.trim_start()
        .get(..5)
        .is_some_and(|p| p.eq_ignore_ascii_case("data:"))
}

/// Media type and payload of a `data:` URI.
fn decode_data_uri(raw: &str) -> Option<(String, Vec<u8>)> {
    let rest = raw.trim().get(5..)?;
    let (header, payload) = rest.split_once(',')?;
    let mut params = header.split(';');
    let media_type = params
        .next()
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "text/plain".to_string());
    let is_base64 = params.any(|p| p.trim().eq_ignore_ascii_case("base64"));
    let bytes = if is_base64 {
        let cleaned: String = percent_decode_str(payload)
            .decode_utf8_lossy()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(cleaned.as_bytes())
            .ok()?
    } else {
        percent_decode_str(payload).collect()
    };
    Some((media_type, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{book, text_of, xhtml};
    use convert_core::options::ConversionOptions;

    // A 1x1 red PNG.
    const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8/5+hHgAHggJ/PchI7wAAAABJRU5ErkJggg==";

    #[test]
    fn test_extracts_and_deduplicates() {
        let body = format!(
            "<img src=\"data:image/png;base64,{0}\"/><p style=\"background: url(data:image/png;base64,{0})\">x</p>",
            PNG_B64
        );
        let mut book = book(&[("text/ch1.xhtml", xhtml("", &body))], &[]);
        let opts = ConversionOptions::default();
        DataUrl.apply(&mut book, &Context::new(&opts)).unwrap();

        let images = book.manifest.items_of_type("image/");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].href, "text/data_url.png");
        let content = text_of(&book, "text/ch1.xhtml");
        assert!(!content.contains("data:image"));
        assert!(content.contains("src=\"data_url.png\""));
        let doc = book.xhtml("text/ch1.xhtml").unwrap();
        let p = doc.find_first("p").unwrap();
        assert_eq!(doc.attr(p, "style"), Some("background: url(\"data_url.png\")"));
    }

    #[test]
    fn test_stylesheet_and_plain_payloads() {
        let mut book = book(
            &[("ch1.xhtml", xhtml("<link rel=\"stylesheet\" href=\"css/s.css\"/>", "<p>x</p>"))],
            &[("css/s.css", "p { background-image: url('data:image/svg+xml,%3Csvg%2F%3E') }")],
        );
        let opts = ConversionOptions::default();
        DataUrl.apply(&mut book, &Context::new(&opts)).unwrap();

        let svg = book.item("css/data_url.svg").unwrap();
        assert_eq!(svg.media_type, "image/svg+xml");
        assert_eq!(book.bytes("css/data_url.svg").unwrap().as_slice(), b"<svg/>");
        assert!(text_of(&book, "css/s.css").contains("url(\"data_url.svg\")"));
    }

    #[test]
    fn test_no_data_uris_unchanged() {
        let mut book = book(&[("ch1.xhtml", xhtml("", "<img src=\"image.png\"/>"))], &[]);
        let before = text_of(&book, "ch1.xhtml");
        let opts = ConversionOptions::default();
        DataUrl.apply(&mut book, &Context::new(&opts)).unwrap();
        assert_eq!(book.manifest.len(), 1);
        assert_eq!(text_of(&book, "ch1.xhtml"), before);
    }

    #[test]
    fn test_decode_data_uri() {
        assert_eq!(
            decode_data_uri("data:,Hello%20World"),
            Some(("text/plain".to_string(), b"Hello World".to_vec()))
        );
        assert_eq!(
            decode_data_uri("DATA:text/css;charset=utf-8;base64,cCB7fQ=="),
            Some(("text/css".to_string(), b"p {}".to_vec()))
        );
        assert_eq!(decode_data_uri("data:image/png;base64,@@@"), None);
        assert_eq!(decode_data_uri("data:nocomma"), None);
    }
}
