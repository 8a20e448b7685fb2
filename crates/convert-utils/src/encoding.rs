//! Character encoding detection for HTML, XML and plain text inputs.

use encoding_rs::Encoding;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

static XML_DECL_ENCODING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*<\?xml[^>]*encoding\s*=\s*["']([A-Za-z0-9._:-]+)["']"#)
        .expect("static regex")
});

static META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([A-Za-z0-9._:-]+)"#).expect("static regex")
});

/// Decode bytes to UTF-8, returning the text and the encoding used.
///
/// Order: BOM, then strict UTF-8, then Windows-1252.
pub fn decode_to_utf8(bytes: &[u8]) -> (String, &'static str) {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _, _) = encoding.decode(&bytes[bom_len..]);
        return (text.into_owned(), encoding.name());
    }

    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), "UTF-8"),
        Err(_) => {
            let (result, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            (result.into_owned(), "windows-1252")
        }
    }
}

/// Decode bytes using a specific encoding label.
pub fn decode_with_encoding(bytes: &[u8], encoding_name: &str) -> Option<String> {
    let encoding = Encoding::for_label(encoding_name.as_bytes())?;
    let (result, _, _) = encoding.decode(bytes);
    Some(result.into_owned())
}

/// Read the encoding named in an XML declaration.
pub fn detect_xml_encoding(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(512)];
    XML_DECL_ENCODING
        .captures(head)
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}

/// Read the charset from an HTML `<meta>` tag in the first kilobytes.
pub fn detect_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(4096)];
    META_CHARSET
        .captures(head)
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}

/// Decode a markup document.
///
/// A user supplied encoding wins; otherwise BOM, XML declaration and
/// `<meta charset>` are consulted before falling back to [`decode_to_utf8`].
pub fn decode_document(bytes: &[u8], user_encoding: Option<&str>) -> (String, &'static str) {
    if let Some(label) = user_encoding {
        if let Some(encoding) = Encoding::for_label(label.as_bytes()) {
            let (text, _, _) = encoding.decode(bytes);
            return (text.into_owned(), encoding.name());
        }
        log::warn!("Unknown input encoding '{}', detecting instead", label);
    }
    if Encoding::for_bom(bytes).is_some() {
        return decode_to_utf8(bytes);
    }
    let declared = detect_xml_encoding(bytes).or_else(|| detect_meta_charset(bytes));
    if let Some(encoding) = declared.and_then(|l| Encoding::for_label(l.as_bytes())) {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return (text.into_owned(), encoding.name());
        }
        log::debug!("Declared encoding {} failed, detecting", encoding.name());
    }
    decode_to_utf8(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8() {
        let (text, enc) = decode_to_utf8(b"Hello, World!");
        assert_eq!(text, "Hello, World!");
        assert_eq!(enc, "UTF-8");
    }

    #[test]
    fn test_decode_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"Hello");
        let (text, enc) = decode_to_utf8(&bytes);
        assert_eq!(text, "Hello");
        assert_eq!(enc, "UTF-8");
    }

    #[test]
    fn test_windows_1252_fallback() {
        let (text, enc) = decode_to_utf8(b"caf\xe9");
        assert_eq!(text, "café");
        assert_eq!(enc, "windows-1252");
    }

    #[test]
    fn test_detect_declarations() {
        let xml = b"<?xml version=\"1.0\" encoding=\"iso-8859-1\"?><root/>";
        assert_eq!(detect_xml_encoding(xml), Some("iso-8859-1".to_string()));

        let html = b"<html><head><meta charset=\"utf-8\"></head></html>";
        assert_eq!(detect_meta_charset(html), Some("utf-8".to_string()));
    }

    #[test]
    fn test_decode_document_prefers_user_encoding() {
        let (text, _) = decode_document(b"\xe9t\xe9", Some("latin1"));
        assert_eq!(text, "été");

        let (text, enc) = decode_document(
            b"<?xml version=\"1.0\" encoding=\"iso-8859-1\"?><p>\xe9</p>",
            None,
        );
        assert!(text.ends_with("<p>é</p>"));
        assert_eq!(enc, "windows-1252");
    }
}
