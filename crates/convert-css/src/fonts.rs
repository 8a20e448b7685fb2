//! `@font-face` descriptors and CSS Fonts 3 face matching.

use std::collections::BTreeSet;
use std::fmt;

use convert_core::stylesheet::DeclarationBlock;

use crate::values::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FontStyle {
    Normal,
    Italic,
    Oblique,
}

impl FontStyle {
    pub fn parse(text: &str) -> Self {
        let lower = text.trim().to_ascii_lowercase();
        if lower.starts_with("italic") {
            FontStyle::Italic
        } else if lower.starts_with("oblique") {
            FontStyle::Oblique
        } else {
            FontStyle::Normal
        }
    }

    /// Fallback order when `self` is the desired style.
    fn preference(self) -> [FontStyle; 3] {
        match self {
            FontStyle::Italic => [FontStyle::Italic, FontStyle::Oblique, FontStyle::Normal],
            FontStyle::Oblique => [FontStyle::Oblique, FontStyle::Italic, FontStyle::Normal],
            FontStyle::Normal => [FontStyle::Normal, FontStyle::Oblique, FontStyle::Italic],
        }
    }
}

impl fmt::Display for FontStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FontStyle::Normal => "normal",
            FontStyle::Italic => "italic",
            FontStyle::Oblique => "oblique",
        })
    }
}

const STRETCHES: [&str; 9] = [
    "ultra-condensed",
    "extra-condensed",
    "condensed",
    "semi-condensed",
    "normal",
    "semi-expanded",
    "expanded",
    "extra-expanded",
    "ultra-expanded",
];

pub const NORMAL_STRETCH: u8 = 5;

/// `font-stretch` keyword as 1 (ultra-condensed) ..= 9 (ultra-expanded).
pub fn parse_stretch(text: &str) -> u8 {
    let lower = text.trim().to_ascii_lowercase();
    STRETCHES
        .iter()
        .position(|s| *s == lower)
        .map(|i| i as u8 + 1)
        .unwrap_or(NORMAL_STRETCH)
}

/// Numeric `font-weight`. `bolder` and `lighter` resolve against the
/// parent weight using the CSS Fonts 3 table.
pub fn parse_weight(text: &str, parent: u16) -> u16 {
    let lower = text.trim().to_ascii_lowercase();
    match lower.as_str() {
        "normal" => 400,
        "bold" => 700,
        "bolder" => match parent {
            0..=300 => 400,
            301..=500 => 700,
            _ => 900,
        },
        "lighter" => match parent {
            0..=500 => 100,
            501..=700 => 400,
            _ => 700,
        },
        other => other
            .parse::<f32>()
            .ok()
            .filter(|w| (1.0..=1000.0).contains(w))
            .map(|w| ((w / 100.0).round() * 100.0).clamp(100.0, 900.0) as u16)
            .unwrap_or(400),
    }
}

/// Parse a `unicode-range` descriptor into inclusive code point ranges.
/// Wildcard forms such as `U+4??` are supported.
pub fn parse_unicode_range(text: &str) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        let Some(body) = part.strip_prefix("U+").or_else(|| part.strip_prefix("u+")) else {
            continue;
        };
        let range = if let Some((lo, hi)) = body.split_once('-') {
            match (u32::from_str_radix(lo, 16), u32::from_str_radix(hi, 16)) {
                (Ok(lo), Ok(hi)) => Some((lo, hi)),
                _ => None,
            }
        } else if body.contains('?') {
            let lo = u32::from_str_radix(&body.replace('?', "0"), 16);
            let hi = u32::from_str_radix(&body.replace('?', "F"), 16);
            match (lo, hi) {
                (Ok(lo), Ok(hi)) => Some((lo, hi)),
                _ => None,
            }
        } else {
            u32::from_str_radix(body, 16).ok().map(|v| (v, v))
        };
        if let Some((lo, hi)) = range.filter(|(lo, hi)| lo <= hi) {
            ranges.push((lo, hi));
        }
    }
    ranges
}

/// Family names of a `font-family` value, lower-cased and unquoted, in
/// preference order.
pub fn family_list(value: &Value) -> Vec<String> {
    value
        .groups()
        .into_iter()
        .map(|g| g.text().trim().to_ascii_lowercase())
        .filter(|f| !f.is_empty())
        .collect()
}

/// One `@font-face` rule.
#[derive(Debug, Clone)]
pub struct FontFace {
    /// Lower-cased family names.
    pub families: Vec<String>,
    pub weight: u16,
    pub style: FontStyle,
    pub stretch: u8,
    /// Font resources named by `src: url(...)`, resolved against the sheet.
    pub src: Vec<String>,
    pub unicode_range: Vec<(u32, u32)>,
    /// Stylesheet (or document, for `<style>` blocks) declaring the rule.
    pub sheet_href: String,
    /// Characters rendered with this face, filled in by usage analysis.
    pub used_chars: BTreeSet<char>,
    pub declarations: DeclarationBlock,
}

impl FontFace {
    /// Build a face from a rule body; `None` when `font-family` is missing.
    pub fn from_declarations(block: &DeclarationBlock, sheet_href: &str) -> Option<Self> {
        let families = family_list(&Value::parse(&block.get("font-family")?.value, None));
        if families.is_empty() {
            return None;
        }
        let src = block
            .get("src")
            .map(|d| {
                Value::parse(&d.value, Some(sheet_href))
                    .groups()
                    .into_iter()
                    .filter_map(|group| {
                        group.components().into_iter().find_map(|v| match v {
                            Value::Url { href, .. } => Some(href.clone()),
                            _ => None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            families,
            weight: block
                .get("font-weight")
                .map(|d| parse_weight(&d.value, 400))
                .unwrap_or(400),
            style: block
                .get("font-style")
                .map(|d| FontStyle::parse(&d.value))
                .unwrap_or(FontStyle::Normal),
            stretch: block
                .get("font-stretch")
                .map(|d| parse_stretch(&d.value))
                .unwrap_or(NORMAL_STRETCH),
            src,
            unicode_range: block
                .get("unicode-range")
                .map(|d| parse_unicode_range(&d.value))
                .unwrap_or_default(),
            sheet_href: sheet_href.to_string(),
            used_chars: BTreeSet::new(),
            declarations: block.clone(),
        })
    }

    pub fn has_family(&self, family: &str) -> bool {
        self.families.iter().any(|f| f == family)
    }

    /// True when the face's `unicode-range` (if any) covers `c`.
    pub fn covers(&self, c: char) -> bool {
        let cp = c as u32;
        self.unicode_range.is_empty()
            || self
                .unicode_range
                .iter()
                .any(|(lo, hi)| (*lo..=*hi).contains(&cp))
    }
}

/// The properties of an element that drive face selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontRequest {
    pub families: Vec<String>,
    pub weight: u16,
    pub style: FontStyle,
    pub stretch: u8,
}

/// Pick the face used for `request`, following the CSS Fonts 3 matching
/// algorithm. Returns an index into `faces`.
pub fn match_face(faces: &[FontFace], request: &FontRequest) -> Option<usize> {
    for family in &request.families {
        let candidates: Vec<usize> = (0..faces.len())
            .filter(|&i| faces[i].has_family(family))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        let candidates = narrow_stretch(faces, candidates, request.stretch);
        let candidates = narrow_style(faces, candidates, request.style);
        return pick_weight(faces, &candidates, request.weight);
    }
    None
}

fn narrow_stretch(faces: &[FontFace], candidates: Vec<usize>, desired: u8) -> Vec<usize> {
    let available: BTreeSet<u8> = candidates.iter().map(|&i| faces[i].stretch).collect();
    let narrower = available.range(..desired).next_back().copied();
    let wider = available.range(desired + 1..).next().copied();
    let chosen = if available.contains(&desired) {
        desired
    } else if desired <= NORMAL_STRETCH {
        match narrower.or(wider) {
            Some(s) => s,
            None => return candidates,
        }
    } else {
        match wider.or(narrower) {
            Some(s) => s,
            None => return candidates,
        }
    };
    candidates
        .into_iter()
        .filter(|&i| faces[i].stretch == chosen)
        .collect()
}

fn narrow_style(faces: &[FontFace], candidates: Vec<usize>, desired: FontStyle) -> Vec<usize> {
    for style in desired.preference() {
        let matching: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| faces[i].style == style)
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    candidates
}

fn pick_weight(faces: &[FontFace], candidates: &[usize], desired: u16) -> Option<usize> {
    let with_weight = |w: u16| candidates.iter().copied().find(|&i| faces[i].weight == w);
    if let Some(i) = with_weight(desired) {
        return Some(i);
    }
    let mut weights: Vec<u16> = candidates.iter().map(|&i| faces[i].weight).collect();
    weights.sort_unstable();
    weights.dedup();
    let lighter = weights.iter().rev().copied().find(|&w| w < desired);
    let heavier = weights.iter().copied().find(|&w| w > desired);
    let order: Vec<Option<u16>> = match desired {
        400 => vec![Some(500).filter(|w| weights.contains(w)), lighter, heavier],
        // 400 is the nearest lighter weight, so it comes first.
        500 => vec![lighter, heavier],
        w if w < 400 => vec![lighter, heavier],
        _ => vec![heavier, lighter],
    };
    order.into_iter().flatten().find_map(with_weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(family: &str, weight: u16, style: FontStyle, stretch: u8) -> FontFace {
        let block = DeclarationBlock::parse(&format!(
            "font-family: \"{}\"; font-weight: {}; font-style: {}; font-stretch: {}; src: url(../fonts/{}-{}.ttf)",
            family,
            weight,
            style,
            STRETCHES[stretch as usize - 1],
            family,
            weight
        ));
        FontFace::from_declarations(&block, "styles/main.css").unwrap()
    }

    fn request(families: &[&str], weight: u16, style: FontStyle) -> FontRequest {
        FontRequest {
            families: families.iter().map(|s| s.to_string()).collect(),
            weight,
            style,
            stretch: NORMAL_STRETCH,
        }
    }

    #[test]
    fn test_descriptor_parsing() {
        let block = DeclarationBlock::parse(
            "font-family: 'My Serif'; src: local(Foo), url(../fonts/a.otf) format('opentype'); \
             font-weight: bold; unicode-range: U+0-7F, U+4??",
        );
        let f = FontFace::from_declarations(&block, "css/book.css").unwrap();
        assert_eq!(f.families, vec!["my serif"]);
        assert_eq!(f.weight, 700);
        assert_eq!(f.src, vec!["fonts/a.otf"]);
        assert_eq!(f.unicode_range, vec![(0, 0x7f), (0x400, 0x4ff)]);
        assert!(f.covers('a'));
        assert!(!f.covers('é'));

        let no_family = DeclarationBlock::parse("src: url(a.ttf)");
        assert!(FontFace::from_declarations(&no_family, "a.css").is_none());
    }

    #[test]
    fn test_weight_keywords() {
        assert_eq!(parse_weight("normal", 700), 400);
        assert_eq!(parse_weight("bolder", 400), 700);
        assert_eq!(parse_weight("lighter", 700), 400);
        assert_eq!(parse_weight("650", 400), 700);
        assert_eq!(parse_stretch("condensed"), 3);
        assert_eq!(parse_stretch("bogus"), NORMAL_STRETCH);
    }

    #[test]
    fn test_family_order_and_style_fallback() {
        let faces = vec![
            face("sans", 400, FontStyle::Normal, 5),
            face("serif", 400, FontStyle::Normal, 5),
            face("serif", 400, FontStyle::Oblique, 5),
        ];
        let r = request(&["missing", "serif", "sans"], 400, FontStyle::Italic);
        assert_eq!(match_face(&faces, &r), Some(2));
        let r = request(&["sans"], 400, FontStyle::Italic);
        assert_eq!(match_face(&faces, &r), Some(0));
        assert_eq!(match_face(&faces, &request(&["nothing"], 400, FontStyle::Normal)), None);
    }

    #[test]
    fn test_weight_bands() {
        let faces = vec![
            face("f", 300, FontStyle::Normal, 5),
            face("f", 500, FontStyle::Normal, 5),
            face("f", 700, FontStyle::Normal, 5),
        ];
        // 400 prefers 500 before lighter weights.
        assert_eq!(match_face(&faces, &request(&["f"], 400, FontStyle::Normal)), Some(1));
        // Bold requests look heavier first.
        assert_eq!(match_face(&faces, &request(&["f"], 600, FontStyle::Normal)), Some(2));
        assert_eq!(match_face(&faces, &request(&["f"], 800, FontStyle::Normal)), Some(2));
        // Light requests look lighter first.
        assert_eq!(match_face(&faces, &request(&["f"], 200, FontStyle::Normal)), Some(0));
        assert_eq!(match_face(&faces, &request(&["f"], 100, FontStyle::Normal)), Some(0));

        let faces = vec![face("g", 400, FontStyle::Normal, 5), face("g", 600, FontStyle::Normal, 5)];
        assert_eq!(match_face(&faces, &request(&["g"], 500, FontStyle::Normal)), Some(0));
    }

    #[test]
    fn test_stretch_preference() {
        let faces = vec![
            face("s", 400, FontStyle::Normal, 3),
            face("s", 400, FontStyle::Normal, 7),
        ];
        let mut r = request(&["s"], 400, FontStyle::Normal);
        r.stretch = 5;
        assert_eq!(match_face(&faces, &r), Some(0));
        r.stretch = 6;
        assert_eq!(match_face(&faces, &r), Some(1));
    }
}
