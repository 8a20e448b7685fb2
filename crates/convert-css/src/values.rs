//! Typed CSS values.
//!
//! `url()` values carry the href already resolved against the stylesheet
//! that declared them, so a value can be moved to another sheet without
//! losing its target.

use std::fmt;

use convert_core::href;
use cssparser::{ParseError, Parser, ParserInput, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Px,
    Pt,
    Pc,
    In,
    Cm,
    Mm,
    Q,
    Em,
    Ex,
    Ch,
    Rem,
    Vw,
    Vh,
}

impl Unit {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "px" => Unit::Px,
            "pt" => Unit::Pt,
            "pc" => Unit::Pc,
            "in" => Unit::In,
            "cm" => Unit::Cm,
            "mm" => Unit::Mm,
            "q" => Unit::Q,
            "em" => Unit::Em,
            "ex" => Unit::Ex,
            "ch" => Unit::Ch,
            "rem" => Unit::Rem,
            "vw" => Unit::Vw,
            "vh" => Unit::Vh,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Unit::Px => "px",
            Unit::Pt => "pt",
            Unit::Pc => "pc",
            Unit::In => "in",
            Unit::Cm => "cm",
            Unit::Mm => "mm",
            Unit::Q => "q",
            Unit::Em => "em",
            Unit::Ex => "ex",
            Unit::Ch => "ch",
            Unit::Rem => "rem",
            Unit::Vw => "vw",
            Unit::Vh => "vh",
        }
    }

    /// Points per unit for absolute units.
    pub fn absolute_pt(self) -> Option<f64> {
        match self {
            Unit::Px => Some(0.75),
            Unit::Pt => Some(1.0),
            Unit::Pc => Some(12.0),
            Unit::In => Some(72.0),
            Unit::Cm => Some(72.0 / 2.54),
            Unit::Mm => Some(72.0 / 25.4),
            Unit::Q => Some(72.0 / 101.6),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Length(f32, Unit),
    Percentage(f32),
    Number(f32),
    Color(String),
    Url { href: String, fragment: Option<String> },
    Keyword(String),
    Str(String),
    /// Space separated components.
    List(Vec<Value>),
    /// Comma separated groups.
    Comma(Vec<Value>),
}

const NAMED_COLORS: &[&str] = &[
    "aqua", "black", "blue", "fuchsia", "gray", "green", "grey", "lime", "maroon", "navy",
    "olive", "orange", "purple", "red", "silver", "teal", "white", "yellow", "transparent",
    "currentcolor", "brown", "pink", "gold", "darkgray", "darkgrey", "lightgray", "lightgrey",
    "darkred", "darkblue", "darkgreen", "indigo", "violet",
];

pub fn is_named_color(word: &str) -> bool {
    NAMED_COLORS.iter().any(|c| c.eq_ignore_ascii_case(word))
}

impl Value {
    /// Parse declaration value text. `base` is the href of the sheet or
    /// document the value was declared in; relative URLs are resolved
    /// against it.
    pub fn parse(text: &str, base: Option<&str>) -> Value {
        let mut input = ParserInput::new(text);
        let mut parser = Parser::new(&mut input);
        let mut groups: Vec<Vec<Value>> = vec![Vec::new()];
        loop {
            let start = parser.position();
            let token = match parser.next() {
                Ok(t) => t.clone(),
                Err(_) => break,
            };
            let value = match token {
                Token::Comma => {
                    groups.push(Vec::new());
                    continue;
                }
                Token::Dimension { value, unit, .. } => match Unit::from_name(&unit) {
                    Some(u) => Value::Length(value, u),
                    None => Value::Keyword(parser.slice_from(start).trim().to_string()),
                },
                Token::Percentage { unit_value, .. } => Value::Percentage(unit_value * 100.0),
                Token::Number { value, .. } => Value::Number(value),
                Token::Ident(ident) => {
                    if is_named_color(&ident) {
                        Value::Color(ident.to_ascii_lowercase())
                    } else {
                        Value::Keyword(ident.to_ascii_lowercase())
                    }
                }
                Token::QuotedString(s) => Value::Str(s.to_string()),
                Token::Hash(h) | Token::IDHash(h) => Value::Color(format!("#{}", h)),
                Token::UnquotedUrl(u) => url_value(&u, base),
                Token::Function(name) => {
                    skip_block(&mut parser);
                    let raw = parser.slice_from(start).trim().to_string();
                    let lower = name.to_ascii_lowercase();
                    if lower == "url" {
                        url_value(&inner_url(&raw), base)
                    } else if matches!(lower.as_str(), "rgb" | "rgba" | "hsl" | "hsla") {
                        Value::Color(raw)
                    } else {
                        Value::Keyword(raw)
                    }
                }
                Token::Delim(c) => Value::Keyword(c.to_string()),
                Token::ParenthesisBlock | Token::SquareBracketBlock | Token::CurlyBracketBlock => {
                    skip_block(&mut parser);
                    Value::Keyword(parser.slice_from(start).trim().to_string())
                }
                _ => Value::Keyword(parser.slice_from(start).trim().to_string()),
            };
            if let Some(group) = groups.last_mut() {
                group.push(value);
            }
        }
        let mut groups: Vec<Value> = groups
            .into_iter()
            .map(|mut g| {
                if g.len() == 1 {
                    g.remove(0)
                } else {
                    Value::List(g)
                }
            })
            .collect();
        if groups.len() == 1 {
            groups.remove(0)
        } else {
            Value::Comma(groups)
        }
    }

    pub fn keyword(&self) -> Option<&str> {
        match self {
            Value::Keyword(k) => Some(k),
            _ => None,
        }
    }

    pub fn is_keyword(&self, name: &str) -> bool {
        self.keyword().is_some_and(|k| k.eq_ignore_ascii_case(name))
    }

    /// Components of a space separated list (a single value is a list of
    /// one).
    pub fn components(&self) -> Vec<&Value> {
        match self {
            Value::List(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    /// Groups of a comma separated value.
    pub fn groups(&self) -> Vec<&Value> {
        match self {
            Value::Comma(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    /// Plain text of a keyword or string, as used in `font-family` lists.
    pub fn text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Keyword(k) => k.clone(),
            Value::List(items) => items
                .iter()
                .map(|v| v.text())
                .collect::<Vec<_>>()
                .join(" "),
            other => other.to_string(),
        }
    }

    /// Absolute length in points; relative lengths need a context and
    /// return `None`.
    pub fn absolute_pt(&self) -> Option<f64> {
        match self {
            Value::Length(v, unit) => unit.absolute_pt().map(|k| *v as f64 * k),
            Value::Number(v) if *v == 0.0 => Some(0.0),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Length(v, unit) => write!(f, "{}{}", format_number(*v), unit.name()),
            Value::Percentage(v) => write!(f, "{}%", format_number(*v)),
            Value::Number(v) => write!(f, "{}", format_number(*v)),
            Value::Color(c) => f.write_str(c),
            Value::Url { href, fragment } => match fragment {
                Some(frag) => write!(f, "url(\"{}#{}\")", href, frag),
                None => write!(f, "url(\"{}\")", href),
            },
            Value::Keyword(k) => f.write_str(k),
            Value::Str(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Value::Comma(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

/// Shortest decimal form, at most three fractional digits.
pub fn format_number(v: f32) -> String {
    let rounded = (v as f64 * 1000.0).round() / 1000.0;
    if rounded == rounded.trunc() {
        format!("{}", rounded as i64)
    } else {
        format!("{}", rounded)
    }
}

fn url_value(raw: &str, base: Option<&str>) -> Value {
    let raw = raw.trim();
    if href::is_external(raw) || raw.starts_with('#') {
        return Value::Url {
            href: raw.to_string(),
            fragment: None,
        };
    }
    let resolved = match base {
        Some(base) => href::resolve(base, raw),
        None => raw.to_string(),
    };
    let (path, fragment) = href::split_fragment(&resolved);
    Value::Url {
        href: path.to_string(),
        fragment: fragment.map(str::to_string),
    }
}

/// Argument of a `url( "..." )` function as written.
fn inner_url(raw: &str) -> String {
    let inner = raw
        .trim()
        .trim_start_matches(|c: char| c != '(')
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim();
    inner.trim_matches(|c| c == '"' || c == '\'').to_string()
}

fn skip_block<'i>(parser: &mut Parser<'i, '_>) {
    let _ = parser.parse_nested_block(|inner| {
        while inner.next().is_ok() {}
        Ok::<(), ParseError<'i, ()>>(())
    });
}
