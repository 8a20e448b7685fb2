//! Conversion transforms applied between input and output.

pub mod clean_guide;
pub mod data_url;
pub mod external;
pub mod flatten_css;
pub mod generate_toc;
pub mod manifest_trimmer;
pub mod merge_metadata;
pub mod normalize_links;
pub mod rasterize;
pub mod remove_unused_css;
pub mod split;
pub mod subset_fonts;

#[cfg(test)]
mod test_support;

use convert_core::plugin::Transform;

/// Return the standard transform chain, sorted by priority.
///
/// Conditional transforms use `should_run()` to skip when not needed.
/// Order:
///  1. DataURL            (always)
///  2. CleanGuide         (always)
///  3. MergeMetadata      (always)
///  4. NormalizeLinks     (always)
///  5. GenerateTOC        (always; builds only when the TOC is empty or forced)
///  6. RasterizeImages    (always; acts on images the output cannot show)
///  7. FlattenCSS         (conditional: flatten_css)
///  8. SplitOnPageBreaks  (conditional: split_on_page_breaks)
///  9. RemoveUnusedCSS    (conditional: remove_unused_css || remove_unused_classes)
/// 10. SubsetFonts        (conditional: subset_embedded_fonts)
/// 11. ManifestTrimmer    (always)
pub fn standard_transforms() -> Vec<Box<dyn Transform>> {
    let mut chain: Vec<Box<dyn Transform>> = vec![
        Box::new(data_url::DataUrl),
        Box::new(clean_guide::CleanGuide),
        Box::new(merge_metadata::MergeMetadata),
        Box::new(normalize_links::NormalizeLinks),
        Box::new(generate_toc::GenerateToc),
        Box::new(rasterize::RasterizeImages::new()),
        Box::new(flatten_css::FlattenCss),
        Box::new(split::SplitOnPageBreaks),
        Box::new(remove_unused_css::RemoveUnusedCss),
        Box::new(subset_fonts::SubsetFonts::new()),
        Box::new(manifest_trimmer::ManifestTrimmer),
    ];
    chain.sort_by_key(|t| t.priority());
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_is_ordered_and_respects_run_after() {
        let chain = standard_transforms();
        let names: Vec<&str> = chain.iter().map(|t| t.name()).collect();
        assert_eq!(names.first(), Some(&"DataURL"));
        assert_eq!(names.last(), Some(&"ManifestTrimmer"));
        for (pos, transform) in chain.iter().enumerate() {
            for dep in transform.run_after() {
                let dep_pos = names.iter().position(|n| n == dep).unwrap();
                assert!(dep_pos < pos, "{} must follow {}", transform.name(), dep);
            }
        }
        let priorities: Vec<i32> = chain.iter().map(|t| t.priority()).collect();
        assert!(priorities.windows(2).all(|w| w[0] < w[1]));
    }
}
