//! MIME type detection and classification for OEB resources.

use std::path::Path;

pub const XHTML_MIME: &str = "application/xhtml+xml";
pub const HTML_MIME: &str = "text/html";
pub const CSS_MIME: &str = "text/css";
pub const NCX_MIME: &str = "application/x-dtbncx+xml";
pub const OPF_MIME: &str = "application/oebps-package+xml";
pub const SVG_MIME: &str = "image/svg+xml";
pub const PNG_MIME: &str = "image/png";

/// Detect MIME type from a file extension.
///
/// OEB-specific types are resolved from a fixed table; everything else goes
/// through `mime_guess`.
pub fn mime_from_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "xhtml" | "xhtm" | "xht" => XHTML_MIME,
        "html" | "htm" | "shtml" => HTML_MIME,
        "css" => CSS_MIME,
        "ncx" => NCX_MIME,
        "opf" => OPF_MIME,
        "jpg" | "jpeg" => "image/jpeg",
        "png" => PNG_MIME,
        "gif" => "image/gif",
        "svg" => SVG_MIME,
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "wmf" => "image/x-wmf",
        "emf" => "image/x-emf",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain",
        other => mime_guess::from_ext(other)
            .first_raw()
            .unwrap_or("application/octet-stream"),
    }
}

/// Detect MIME type from a file path.
pub fn mime_from_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|e| e.to_str())
        .map(mime_from_extension)
        .unwrap_or("application/octet-stream")
}

/// Is this an (X)HTML content document type?
pub fn is_xhtml_mime(mime: &str) -> bool {
    matches!(mime, XHTML_MIME | HTML_MIME | "application/xml+xhtml")
}

pub fn is_css_mime(mime: &str) -> bool {
    mime == CSS_MIME
}

pub fn is_image_mime(mime: &str) -> bool {
    mime.starts_with("image/")
}

pub fn is_font_mime(mime: &str) -> bool {
    matches!(
        mime,
        "application/x-font-ttf"
            | "application/x-font-truetype"
            | "application/x-font-opentype"
            | "application/vnd.ms-opentype"
            | "application/font-sfnt"
            | "application/font-woff"
            | "application/font-woff2"
            | "font/ttf"
            | "font/otf"
            | "font/sfnt"
            | "font/woff"
            | "font/woff2"
    )
}

/// Payloads that gain nothing from deflate.
pub fn is_precompressed_mime(mime: &str) -> bool {
    matches!(
        mime,
        "image/png"
            | "image/jpeg"
            | "image/gif"
            | "image/webp"
            | "font/woff"
            | "font/woff2"
            | "application/font-woff"
            | "application/font-woff2"
    )
}

/// Get the standard file extension for a MIME type.
pub fn extension_from_mime(mime: &str) -> &'static str {
    match mime {
        XHTML_MIME => "xhtml",
        HTML_MIME => "html",
        CSS_MIME => "css",
        NCX_MIME => "ncx",
        "image/jpeg" | "image/jpg" => "jpg",
        PNG_MIME => "png",
        "image/gif" => "gif",
        SVG_MIME => "svg",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tif",
        "image/x-wmf" | "image/wmf" => "wmf",
        "image/x-emf" | "image/emf" => "emf",
        "font/ttf" | "application/x-font-ttf" | "application/x-font-truetype" => "ttf",
        "font/otf" | "application/x-font-opentype" | "application/vnd.ms-opentype" => "otf",
        "font/woff" | "application/font-woff" => "woff",
        "font/woff2" | "application/font-woff2" => "woff2",
        "text/plain" => "txt",
        _ => "bin",
    }
}
