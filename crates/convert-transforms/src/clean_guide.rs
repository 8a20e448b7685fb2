//! CleanGuide: normalizes guide references and detects the cover.

use convert_core::book::{BookDocument, GuideRef};
use convert_core::error::Result;
use convert_core::href;
use convert_core::plugin::{Context, Transform};

/// Guide reference types of the OPF 2 vocabulary.
const VALID_GUIDE_TYPES: &[&str] = &[
    "cover",
    "title-page",
    "toc",
    "index",
    "glossary",
    "acknowledgements",
    "bibliography",
    "colophon",
    "copyright-page",
    "dedication",
    "epigraph",
    "foreword",
    "loi",
    "lot",
    "notes",
    "preface",
    "text",
];

/// Vendor reference types that name a cover image.
const COVER_TYPE_ALIASES: &[&str] = &[
    "ms-coverimage-standard",
    "ms-titleimage-standard",
    "other.ms-coverimage-standard",
    "other.ms-titleimage-standard",
    "other.ms-coverimage",
    "coverimagestandard",
];

/// Detects the cover from vendor reference types, promotes `start` to
/// `text` and drops non-standard reference types.
pub struct CleanGuide;

impl Transform for CleanGuide {
    fn name(&self) -> &str {
        "CleanGuide"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn transactional(&self) -> bool {
        true
    }

    fn apply(&self, book: &mut BookDocument, _ctx: &Context<'_>) -> Result<()> {
        for reference in book.guide.iter_mut() {
            reference.ref_type = reference.ref_type.trim().to_ascii_lowercase();
        }

        if book.guide.get("cover").is_none() {
            let detected = COVER_TYPE_ALIASES
                .iter()
                .find_map(|alias| book.guide.get(alias))
                .map(|r| r.href.clone());
            if let Some(target) = detected {
                log::info!("Detected cover {} from vendor guide type", target);
                book.guide.add(GuideRef::new("cover", "Cover", target));
            }
        }

        // A cover reference that points at an image also names the cover
        // image in the metadata.
        if !book.metadata.contains("cover") {
            let cover_id = book
                .guide
                .get("cover")
                .and_then(|r| book.item(href::split_fragment(&r.href).0))
                .filter(|item| item.is_image())
                .map(|item| item.id.clone());
            if let Some(id) = cover_id {
                book.metadata.set("cover", id);
            }
        }

        if book.guide.get("text").is_none() {
            if let Some(start) = book.guide.get("start").cloned() {
                book.guide.add(GuideRef::new("text", start.title, start.href));
                log::debug!("Promoted guide 'start' to 'text'");
            }
        }

        let before = book.guide.len();
        book.guide.retain(|r| {
            let keep = VALID_GUIDE_TYPES.contains(&r.ref_type.as_str());
            if !keep {
                log::debug!("Removing non-standard guide type: {}", r.ref_type);
            }
            keep
        });
        let removed = before - book.guide.len();
        if removed > 0 {
            log::info!("Removed {} non-standard guide references", removed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convert_core::book::ManifestData;
    use convert_core::options::ConversionOptions;

    fn run(book: &mut BookDocument) {
        let opts = ConversionOptions::default();
        CleanGuide.apply(book, &Context::new(&opts)).unwrap();
    }

    #[test]
    fn test_cover_detection_from_ms_type() {
        let mut book = BookDocument::new();
        book.add_item("cover.jpg", "image/jpeg", ManifestData::binary(vec![0xFF, 0xD8]))
            .unwrap();
        book.guide.add(GuideRef::new(
            "other.ms-coverimage-standard",
            "Cover",
            "cover.jpg",
        ));
        run(&mut book);

        assert_eq!(book.guide.get("cover").unwrap().href, "cover.jpg");
        let id = book.item("cover.jpg").unwrap().id.clone();
        assert_eq!(book.metadata.get_first_value("cover"), Some(id.as_str()));
        assert!(book.guide.get("other.ms-coverimage-standard").is_none());
    }

    #[test]
    fn test_start_promoted_to_text() {
        let mut book = BookDocument::new();
        book.guide
            .add(GuideRef::new("start", "Begin Reading", "chapter1.xhtml"));
        run(&mut book);

        let text = book.guide.get("text").unwrap();
        assert_eq!(text.href, "chapter1.xhtml");
        assert_eq!(text.title, "Begin Reading");
        assert!(book.guide.get("start").is_none());
    }

    #[test]
    fn test_removes_nonstandard_types() {
        let mut book = BookDocument::new();
        book.guide.add(GuideRef::new("Cover", "Cover", "cover.xhtml"));
        book.guide
            .add(GuideRef::new("custom-nonsense", "Nonsense", "foo.xhtml"));
        book.guide.add(GuideRef::new("toc", "Table of Contents", "toc.xhtml"));
        run(&mut book);

        assert_eq!(book.guide.get("cover").unwrap().href, "cover.xhtml");
        assert!(book.guide.get("toc").is_some());
        assert!(book.guide.get("custom-nonsense").is_none());
        assert_eq!(book.guide.len(), 2);
        assert!(!book.metadata.contains("cover"));
    }
}
