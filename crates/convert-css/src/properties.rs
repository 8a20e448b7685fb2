//! Property tables: inheritance, initial values and shorthand expansion.

use crate::values::{is_named_color, Value};

/// Properties that inherit by default (CSS 2.1 plus a few CSS 3 text
/// properties reading systems honour).
const INHERITED: &[&str] = &[
    "azimuth",
    "border-collapse",
    "border-spacing",
    "caption-side",
    "color",
    "cursor",
    "direction",
    "elevation",
    "empty-cells",
    "font-family",
    "font-size",
    "font-stretch",
    "font-style",
    "font-variant",
    "font-weight",
    "hyphens",
    "letter-spacing",
    "line-height",
    "list-style-image",
    "list-style-position",
    "list-style-type",
    "orphans",
    "quotes",
    "text-align",
    "text-indent",
    "text-transform",
    "visibility",
    "white-space",
    "widows",
    "word-spacing",
    "word-wrap",
    "writing-mode",
];

/// Initial values for properties the pipeline inspects.
const DEFAULTS: &[(&str, &str)] = &[
    ("background-attachment", "scroll"),
    ("background-color", "transparent"),
    ("background-image", "none"),
    ("background-position", "0% 0%"),
    ("background-repeat", "repeat"),
    ("border-bottom-color", "currentcolor"),
    ("border-bottom-style", "none"),
    ("border-bottom-width", "medium"),
    ("border-left-color", "currentcolor"),
    ("border-left-style", "none"),
    ("border-left-width", "medium"),
    ("border-right-color", "currentcolor"),
    ("border-right-style", "none"),
    ("border-right-width", "medium"),
    ("border-top-color", "currentcolor"),
    ("border-top-style", "none"),
    ("border-top-width", "medium"),
    ("clear", "none"),
    ("color", "black"),
    ("content", "normal"),
    ("direction", "ltr"),
    ("display", "inline"),
    ("float", "none"),
    ("font-family", "serif"),
    ("font-size", "medium"),
    ("font-stretch", "normal"),
    ("font-style", "normal"),
    ("font-variant", "normal"),
    ("font-weight", "normal"),
    ("height", "auto"),
    ("letter-spacing", "normal"),
    ("line-height", "normal"),
    ("list-style-image", "none"),
    ("list-style-position", "outside"),
    ("list-style-type", "disc"),
    ("margin-bottom", "0"),
    ("margin-left", "0"),
    ("margin-right", "0"),
    ("margin-top", "0"),
    ("max-height", "none"),
    ("max-width", "none"),
    ("min-height", "0"),
    ("min-width", "0"),
    ("orphans", "2"),
    ("padding-bottom", "0"),
    ("padding-left", "0"),
    ("padding-right", "0"),
    ("padding-top", "0"),
    ("page-break-after", "auto"),
    ("page-break-before", "auto"),
    ("page-break-inside", "auto"),
    ("quotes", "none"),
    ("text-align", "start"),
    ("text-decoration", "none"),
    ("text-indent", "0"),
    ("text-transform", "none"),
    ("vertical-align", "baseline"),
    ("visibility", "visible"),
    ("white-space", "normal"),
    ("widows", "2"),
    ("width", "auto"),
    ("word-spacing", "normal"),
];

pub fn is_inherited(property: &str) -> bool {
    INHERITED.contains(&property)
}

/// Initial value of a property; `None` for properties without an entry.
pub fn default_value(property: &str) -> Option<&'static str> {
    DEFAULTS
        .iter()
        .find(|(name, _)| *name == property)
        .map(|(_, v)| *v)
}

const SIDES: [&str; 4] = ["top", "right", "bottom", "left"];

const BORDER_STYLES: &[&str] = &[
    "none", "hidden", "dotted", "dashed", "solid", "double", "groove", "ridge", "inset", "outset",
];

const FONT_STYLES: &[&str] = &["italic", "oblique"];
const FONT_VARIANTS: &[&str] = &["small-caps"];
const FONT_WEIGHTS: &[&str] = &["bold", "bolder", "lighter"];
const FONT_STRETCHES: &[&str] = &[
    "ultra-condensed",
    "extra-condensed",
    "condensed",
    "semi-condensed",
    "semi-expanded",
    "expanded",
    "extra-expanded",
    "ultra-expanded",
];
const FONT_SIZE_KEYWORDS: &[&str] = &[
    "xx-small", "x-small", "small", "medium", "large", "x-large", "xx-large", "smaller", "larger",
];
const SYSTEM_FONTS: &[&str] = &["caption", "icon", "menu", "message-box", "small-caption", "status-bar"];

/// Expand a declaration into longhand declarations. Longhands and unknown
/// properties come back unchanged; a shorthand that cannot be parsed
/// expands to nothing and is dropped.
pub fn expand(name: &str, value: &str) -> Vec<(String, String)> {
    let value = value.trim();
    let global = matches!(
        value.to_ascii_lowercase().as_str(),
        "inherit" | "initial" | "unset"
    );
    let longhands = |names: Vec<String>| -> Vec<(String, String)> {
        names.into_iter().map(|n| (n, value.to_string())).collect()
    };

    match name {
        "margin" | "padding" => {
            let names = SIDES.iter().map(|s| format!("{}-{}", name, s)).collect();
            if global {
                return longhands(names);
            }
            expand_box(names, value)
        }
        "border-width" | "border-style" | "border-color" => {
            let suffix = &name["border-".len()..];
            let names = SIDES
                .iter()
                .map(|s| format!("border-{}-{}", s, suffix))
                .collect();
            if global {
                return longhands(names);
            }
            expand_box(names, value)
        }
        "border" => {
            let mut out = Vec::new();
            for side in SIDES {
                out.extend(expand_border_side(side, value, global));
            }
            out
        }
        "border-top" | "border-right" | "border-bottom" | "border-left" => {
            expand_border_side(&name["border-".len()..], value, global)
        }
        "font" => {
            if global {
                return longhands(
                    [
                        "font-style",
                        "font-variant",
                        "font-weight",
                        "font-stretch",
                        "font-size",
                        "line-height",
                        "font-family",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                );
            }
            expand_font(value)
        }
        "background" => {
            if global {
                return longhands(
                    [
                        "background-color",
                        "background-image",
                        "background-repeat",
                        "background-attachment",
                        "background-position",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                );
            }
            expand_background(value)
        }
        "list-style" => {
            if global {
                return longhands(
                    ["list-style-type", "list-style-position", "list-style-image"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                );
            }
            expand_list_style(value)
        }
        _ => vec![(name.to_string(), value.to_string())],
    }
}

/// Split a value into top-level space separated words, keeping quoted
/// strings and function arguments together.
pub fn split_words(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in value.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                c if c.is_whitespace() && depth == 0 => {
                    if !current.is_empty() {
                        out.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn expand_box(names: Vec<String>, value: &str) -> Vec<(String, String)> {
    let words = split_words(value);
    let pick: [usize; 4] = match words.len() {
        1 => [0, 0, 0, 0],
        2 => [0, 1, 0, 1],
        3 => [0, 1, 2, 1],
        4 => [0, 1, 2, 3],
        _ => return Vec::new(),
    };
    names
        .into_iter()
        .zip(pick)
        .map(|(n, i)| (n, words[i].clone()))
        .collect()
}

fn is_length_word(word: &str) -> bool {
    matches!(
        Value::parse(word, None),
        Value::Length(..) | Value::Percentage(_)
    ) || Value::parse(word, None).absolute_pt() == Some(0.0)
}

fn is_color_word(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    lower.starts_with('#')
        || lower.starts_with("rgb")
        || lower.starts_with("hsl")
        || is_named_color(&lower)
}

fn expand_border_side(side: &str, value: &str, global: bool) -> Vec<(String, String)> {
    let prop = |part: &str| format!("border-{}-{}", side, part);
    if global {
        return ["width", "style", "color"]
            .iter()
            .map(|p| (prop(p), value.to_string()))
            .collect();
    }
    let mut width = None;
    let mut style = None;
    let mut color = None;
    for word in split_words(value) {
        let lower = word.to_ascii_lowercase();
        if width.is_none()
            && (is_length_word(&word) || matches!(lower.as_str(), "thin" | "medium" | "thick"))
        {
            width = Some(word);
        } else if style.is_none() && BORDER_STYLES.contains(&lower.as_str()) {
            style = Some(lower);
        } else if color.is_none() && is_color_word(&word) {
            color = Some(word);
        } else {
            return Vec::new();
        }
    }
    vec![
        (prop("width"), width.unwrap_or_else(|| "medium".to_string())),
        (prop("style"), style.unwrap_or_else(|| "none".to_string())),
        (prop("color"), color.unwrap_or_else(|| "currentcolor".to_string())),
    ]
}

fn expand_font(value: &str) -> Vec<(String, String)> {
    let words = split_words(value);
    if words.len() == 1 && SYSTEM_FONTS.contains(&words[0].to_ascii_lowercase().as_str()) {
        return Vec::new();
    }
    let mut style = "normal".to_string();
    let mut variant = "normal".to_string();
    let mut weight = "normal".to_string();
    let mut stretch = "normal".to_string();
    let mut size: Option<String> = None;
    let mut line_height = "normal".to_string();
    let mut family_words: Vec<String> = Vec::new();

    let mut iter = words.into_iter().peekable();
    while let Some(word) = iter.next() {
        if size.is_some() {
            if word == "/" {
                if let Some(lh) = iter.next() {
                    line_height = lh;
                }
                continue;
            }
            if let Some(lh) = word.strip_prefix('/') {
                if family_words.is_empty() && !lh.is_empty() {
                    line_height = lh.to_string();
                    continue;
                }
            }
            family_words.push(word);
            continue;
        }
        let lower = word.to_ascii_lowercase();
        if lower == "normal" {
            continue;
        }
        if FONT_STYLES.contains(&lower.as_str()) {
            style = lower;
        } else if FONT_VARIANTS.contains(&lower.as_str()) {
            variant = lower;
        } else if FONT_WEIGHTS.contains(&lower.as_str())
            || (lower.len() == 3 && lower.ends_with("00") && lower.parse::<u16>().is_ok())
        {
            weight = lower;
        } else if FONT_STRETCHES.contains(&lower.as_str()) {
            stretch = lower;
        } else {
            let (size_part, lh) = match word.split_once('/') {
                Some((s, l)) => (s.to_string(), Some(l.to_string())),
                None => (word.clone(), None),
            };
            if is_length_word(&size_part)
                || FONT_SIZE_KEYWORDS.contains(&size_part.to_ascii_lowercase().as_str())
            {
                size = Some(size_part);
                if let Some(lh) = lh.filter(|l| !l.is_empty()) {
                    line_height = lh;
                }
            } else {
                return Vec::new();
            }
        }
    }
    let Some(size) = size else {
        return Vec::new();
    };
    if family_words.is_empty() {
        return Vec::new();
    }
    vec![
        ("font-style".to_string(), style),
        ("font-variant".to_string(), variant),
        ("font-weight".to_string(), weight),
        ("font-stretch".to_string(), stretch),
        ("font-size".to_string(), size),
        ("line-height".to_string(), line_height),
        ("font-family".to_string(), family_words.join(" ")),
    ]
}

fn expand_background(value: &str) -> Vec<(String, String)> {
    let mut color = "transparent".to_string();
    let mut image = "none".to_string();
    let mut repeat = "repeat".to_string();
    let mut attachment = "scroll".to_string();
    let mut position: Vec<String> = Vec::new();
    for word in split_words(value) {
        let lower = word.to_ascii_lowercase();
        if lower.starts_with("url(") || lower == "none" || lower.contains("gradient(") {
            image = word;
        } else if matches!(
            lower.as_str(),
            "repeat" | "repeat-x" | "repeat-y" | "no-repeat" | "space" | "round"
        ) {
            repeat = lower;
        } else if matches!(lower.as_str(), "scroll" | "fixed" | "local") {
            attachment = lower;
        } else if matches!(lower.as_str(), "left" | "right" | "top" | "bottom" | "center")
            || is_length_word(&word)
        {
            position.push(word);
        } else if is_color_word(&word) {
            color = word;
        } else {
            return Vec::new();
        }
    }
    vec![
        ("background-color".to_string(), color),
        ("background-image".to_string(), image),
        ("background-repeat".to_string(), repeat),
        ("background-attachment".to_string(), attachment),
        (
            "background-position".to_string(),
            if position.is_empty() {
                "0% 0%".to_string()
            } else {
                position.join(" ")
            },
        ),
    ]
}

fn expand_list_style(value: &str) -> Vec<(String, String)> {
    let mut kind: Option<String> = None;
    let mut position = "outside".to_string();
    let mut image = "none".to_string();
    let mut saw_none = false;
    for word in split_words(value) {
        let lower = word.to_ascii_lowercase();
        if lower.starts_with("url(") {
            image = word;
        } else if matches!(lower.as_str(), "inside" | "outside") {
            position = lower;
        } else if lower == "none" {
            saw_none = true;
        } else {
            kind = Some(lower);
        }
    }
    let kind = kind.unwrap_or_else(|| if saw_none { "none" } else { "disc" }.to_string());
    vec![
        ("list-style-type".to_string(), kind),
        ("list-style-position".to_string(), position),
        ("list-style-image".to_string(), image),
    ]
}
