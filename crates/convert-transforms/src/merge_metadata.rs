//! MergeMetadata: applies user metadata overrides and fills in the fields
//! every output format needs.

use std::collections::BTreeMap;

use convert_core::book::BookDocument;
use convert_core::error::Result;
use convert_core::options::ConversionOptions;
use convert_core::plugin::{Context, Transform};

const DEFAULT_TITLE: &str = "Untitled";
const DEFAULT_LANGUAGE: &str = "en";

/// Applies `title`, `authors`, `language`, `publisher` and `tags` from the
/// options, then ensures a title, a language and a unique identifier.
pub struct MergeMetadata;

impl Transform for MergeMetadata {
    fn name(&self) -> &str {
        "MergeMetadata"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn options_consumed(&self) -> &[&str] {
        &["title", "authors", "language", "publisher", "tags"]
    }

    fn transactional(&self) -> bool {
        true
    }

    fn apply(&self, book: &mut BookDocument, ctx: &Context<'_>) -> Result<()> {
        apply_overrides(book, ctx.options);

        if book.metadata.title().is_none() {
            book.metadata.set_title(DEFAULT_TITLE);
        }
        if book.metadata.language().map_or(true, |l| l.trim().is_empty()) {
            book.metadata.set("language", DEFAULT_LANGUAGE);
        }

        if book.uid.is_none() {
            match book.metadata.identifier().map(str::to_string) {
                Some(existing) => book.uid = Some(existing),
                None => {
                    let uid = format!("urn:uuid:{}", uuid::Uuid::new_v4());
                    book.metadata.add_identifier(uid.clone(), Some("uuid"));
                    book.uid = Some(uid);
                }
            }
        }

        log::info!(
            "Metadata merged: title={:?}, language={:?}",
            book.metadata.title(),
            book.metadata.language()
        );
        Ok(())
    }
}

fn apply_overrides(book: &mut BookDocument, opts: &ConversionOptions) {
    if let Some(title) = opts.title.as_deref().filter(|t| !t.trim().is_empty()) {
        book.metadata.set_title(title);
    }
    if !opts.authors.is_empty() {
        book.metadata.remove("creator");
        for author in &opts.authors {
            let mut attrs = BTreeMap::new();
            attrs.insert("role".to_string(), "aut".to_string());
            book.metadata.add_with_attrs("creator", author.trim(), attrs);
        }
    }
    if let Some(language) = opts.language.as_deref().filter(|l| !l.trim().is_empty()) {
        book.metadata.set("language", language.trim());
    }
    if let Some(publisher) = opts.publisher.as_deref().filter(|p| !p.trim().is_empty()) {
        book.metadata.set("publisher", publisher.trim());
    }
    if !opts.tags.is_empty() {
        book.metadata.remove("subject");
        for tag in &opts.tags {
            book.metadata.add("subject", tag.trim());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_metadata_fills_defaults() {
        let mut book = BookDocument::new();
        let opts = ConversionOptions::default();
        MergeMetadata.apply(&mut book, &Context::new(&opts)).unwrap();

        assert_eq!(book.metadata.title(), Some("Untitled"));
        assert_eq!(book.metadata.language(), Some("en"));
        let uid = book.uid.clone().unwrap();
        assert!(uid.starts_with("urn:uuid:"));
        assert_eq!(book.metadata.identifier(), Some(uid.as_str()));
    }

    #[test]
    fn test_merge_metadata_preserves_existing() {
        let mut book = BookDocument::new();
        book.metadata.set_title("My Book");
        book.metadata.set("language", "fr");
        book.uid = Some("existing-uid".to_string());

        let opts = ConversionOptions::default();
        MergeMetadata.apply(&mut book, &Context::new(&opts)).unwrap();

        assert_eq!(book.metadata.title(), Some("My Book"));
        assert_eq!(book.metadata.language(), Some("fr"));
        assert_eq!(book.uid.as_deref(), Some("existing-uid"));
    }

    #[test]
    fn test_existing_identifier_becomes_uid() {
        let mut book = BookDocument::new();
        book.metadata.add_identifier("9780000000000", Some("ISBN"));
        let opts = ConversionOptions::default();
        MergeMetadata.apply(&mut book, &Context::new(&opts)).unwrap();
        assert_eq!(book.uid.as_deref(), Some("9780000000000"));
    }

    #[test]
    fn test_user_overrides() {
        let mut book = BookDocument::new();
        book.metadata.set_title("Old");
        book.metadata.add("creator", "Someone Else");
        let opts = ConversionOptions {
            title: Some("New Title".to_string()),
            authors: vec!["A. Author".to_string(), "B. Author".to_string()],
            language: Some("de".to_string()),
            publisher: Some("Press".to_string()),
            tags: vec!["fiction".to_string()],
            ..ConversionOptions::default()
        };
        MergeMetadata.apply(&mut book, &Context::new(&opts)).unwrap();

        assert_eq!(book.metadata.title(), Some("New Title"));
        assert_eq!(book.metadata.authors(), vec!["A. Author", "B. Author"]);
        let first = book.metadata.get_first("creator").unwrap();
        assert_eq!(first.attributes.get("role").map(String::as_str), Some("aut"));
        assert_eq!(book.metadata.language(), Some("de"));
        assert_eq!(book.metadata.publisher(), Some("Press"));
        assert_eq!(book.metadata.get_first_value("subject"), Some("fiction"));
    }
}
