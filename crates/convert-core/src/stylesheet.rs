//! Stylesheet object model.
//!
//! Rules keep their selector and value text verbatim; interpretation
//! (selector matching, typed values) belongs to the cascade. Unknown
//! at-rules are preserved as raw text so serialization does not lose them.

use std::fmt::Write as _;

use cssparser::{
    AtRuleParser, CowRcStr, DeclarationParser, ParseError, Parser, ParserInput, ParserState,
    QualifiedRuleParser, RuleBodyItemParser, RuleBodyParser, StyleSheetParser,
};
use once_cell::sync::Lazy;
use regex::Regex;

static IMPORTANT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*!\s*important\s*$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Lower-cased property name.
    pub name: String,
    /// Raw value text without `!important`.
    pub value: String,
    pub important: bool,
}

impl Declaration {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            value: value.into(),
            important: false,
        }
    }

    pub fn important(mut self) -> Self {
        self.important = true;
        self
    }

    fn write_css(&self, out: &mut String) {
        out.push_str(&self.name);
        out.push_str(": ");
        out.push_str(&self.value);
        if self.important {
            out.push_str(" !important");
        }
    }
}

/// An ordered declaration block. Later declarations of the same property
/// win, as in CSS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclarationBlock {
    pub declarations: Vec<Declaration>,
}

impl DeclarationBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the contents of a `style` attribute or a `{ ... }` body.
    pub fn parse(text: &str) -> Self {
        let mut input = ParserInput::new(text);
        let mut parser = Parser::new(&mut input);
        Self {
            declarations: parse_declaration_list(&mut parser),
        }
    }

    /// Effective declaration for a property: last `!important` one, else
    /// last one.
    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.declarations
            .iter()
            .rev()
            .find(|d| d.name == name && d.important)
            .or_else(|| self.declarations.iter().rev().find(|d| d.name == name))
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.declarations.push(Declaration::new(name, value));
    }

    pub fn remove(&mut self, name: &str) {
        self.declarations.retain(|d| d.name != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Declaration> {
        self.declarations.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// `a: b; c: d` form used for `style` attributes.
    pub fn to_inline_css(&self) -> String {
        let mut out = String::new();
        for (i, d) in self.declarations.iter().enumerate() {
            if i > 0 {
                out.push_str("; ");
            }
            d.write_css(&mut out);
        }
        out
    }

    fn write_block(&self, out: &mut String, indent: &str) {
        out.push_str(" {\n");
        for d in &self.declarations {
            out.push_str(indent);
            out.push_str("  ");
            d.write_css(out);
            out.push_str(";\n");
        }
        out.push_str(indent);
        out.push_str("}\n");
    }
}

impl FromIterator<Declaration> for DeclarationBlock {
    fn from_iter<I: IntoIterator<Item = Declaration>>(iter: I) -> Self {
        Self {
            declarations: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleRule {
    /// Selector list text, e.g. `p.note, div > span`.
    pub selectors: String,
    pub declarations: DeclarationBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CssRule {
    Style(StyleRule),
    Import { href: String, media: String },
    Media { media: String, rules: Vec<CssRule> },
    FontFace(DeclarationBlock),
    Page {
        selector: String,
        declarations: DeclarationBlock,
    },
    /// Any other at-rule, kept verbatim.
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stylesheet {
    pub rules: Vec<CssRule>,
}

impl Stylesheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse CSS text. Malformed rules and declarations are dropped.
    pub fn parse(css: &str) -> Self {
        let mut input = ParserInput::new(css);
        let mut parser = Parser::new(&mut input);
        Self {
            rules: parse_rule_list(&mut parser),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Style rules at any `@media` depth, in source order.
    pub fn style_rules(&self) -> Vec<&StyleRule> {
        fn walk<'a>(rules: &'a [CssRule], out: &mut Vec<&'a StyleRule>) {
            for rule in rules {
                match rule {
                    CssRule::Style(r) => out.push(r),
                    CssRule::Media { rules, .. } => walk(rules, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.rules, &mut out);
        out
    }

    /// `@import` targets in order.
    pub fn imports(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules.iter().filter_map(|r| match r {
            CssRule::Import { href, media } => Some((href.as_str(), media.as_str())),
            _ => None,
        })
    }

    pub fn font_faces(&self) -> impl Iterator<Item = &DeclarationBlock> {
        self.rules.iter().filter_map(|r| match r {
            CssRule::FontFace(d) => Some(d),
            _ => None,
        })
    }

    /// Visit every declaration block in the sheet, including those nested
    /// in `@media`.
    pub fn for_each_block_mut(&mut self, mut f: impl FnMut(&mut DeclarationBlock)) {
        fn walk(rules: &mut [CssRule], f: &mut dyn FnMut(&mut DeclarationBlock)) {
            for rule in rules {
                match rule {
                    CssRule::Style(r) => f(&mut r.declarations),
                    CssRule::FontFace(d) => f(d),
                    CssRule::Page { declarations, .. } => f(declarations),
                    CssRule::Media { rules, .. } => walk(rules, f),
                    CssRule::Import { .. } | CssRule::Other(_) => {}
                }
            }
        }
        walk(&mut self.rules, &mut f);
    }

    pub fn to_css(&self) -> String {
        let mut out = String::new();
        write_rules(&self.rules, &mut out, "");
        out
    }
}

fn write_rules(rules: &[CssRule], out: &mut String, indent: &str) {
    for rule in rules {
        out.push_str(indent);
        match rule {
            CssRule::Style(r) => {
                out.push_str(&r.selectors);
                r.declarations.write_block(out, indent);
            }
            CssRule::Import { href, media } => {
                let _ = write!(out, "@import url(\"{}\")", href.replace('"', "\\\""));
                if !media.is_empty() {
                    out.push(' ');
                    out.push_str(media);
                }
                out.push_str(";\n");
            }
            CssRule::Media { media, rules } => {
                let _ = writeln!(out, "@media {} {{", media);
                let inner = format!("{}  ", indent);
                write_rules(rules, out, &inner);
                out.push_str(indent);
                out.push_str("}\n");
            }
            CssRule::FontFace(d) => {
                out.push_str("@font-face");
                d.write_block(out, indent);
            }
            CssRule::Page {
                selector,
                declarations,
            } => {
                out.push_str("@page");
                if !selector.is_empty() {
                    out.push(' ');
                    out.push_str(selector);
                }
                declarations.write_block(out, indent);
            }
            CssRule::Other(raw) => {
                out.push_str(raw);
                out.push('\n');
            }
        }
    }
}

fn parse_rule_list(parser: &mut Parser<'_, '_>) -> Vec<CssRule> {
    let mut rules = Vec::new();
    let mut rule_parser = RuleListParser { rules: &mut rules };
    for result in StyleSheetParser::new(parser, &mut rule_parser) {
        if let Err((_, slice)) = result {
            log::debug!("Dropping malformed CSS rule: {}", slice.trim());
        }
    }
    rules
}

fn parse_declaration_list(parser: &mut Parser<'_, '_>) -> Vec<Declaration> {
    let mut declarations = Vec::new();
    let mut decl_parser = DeclarationCollector {
        declarations: &mut declarations,
    };
    for result in RuleBodyParser::new(parser, &mut decl_parser) {
        if let Err((_, slice)) = result {
            log::debug!("Dropping malformed CSS declaration: {}", slice.trim());
        }
    }
    declarations
}

/// Consume the rest of `input` and return its source text.
fn remaining_text<'i>(input: &mut Parser<'i, '_>) -> &'i str {
    let start = input.position();
    while input.next_including_whitespace_and_comments().is_ok() {}
    input.slice_from(start)
}

struct RuleListParser<'a> {
    rules: &'a mut Vec<CssRule>,
}

enum AtPrelude {
    Import { href: String, media: String },
    Media(String),
    FontFace,
    Page(String),
    Other { name: String, prelude: String },
}

impl<'i> AtRuleParser<'i> for RuleListParser<'_> {
    type Prelude = AtPrelude;
    type AtRule = ();
    type Error = ();

    fn parse_prelude<'t>(
        &mut self,
        name: CowRcStr<'i>,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::Prelude, ParseError<'i, Self::Error>> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "import" => {
                let href = input.expect_url_or_string()?.as_ref().to_string();
                let media = remaining_text(input).trim().to_string();
                Ok(AtPrelude::Import { href, media })
            }
            "media" => Ok(AtPrelude::Media(remaining_text(input).trim().to_string())),
            "font-face" => Ok(AtPrelude::FontFace),
            "page" => Ok(AtPrelude::Page(remaining_text(input).trim().to_string())),
            "charset" => Err(input.new_custom_error(())),
            _ => Ok(AtPrelude::Other {
                name: name.as_ref().to_string(),
                prelude: remaining_text(input).trim().to_string(),
            }),
        }
    }

    fn rule_without_block(
        &mut self,
        prelude: Self::Prelude,
        _start: &ParserState,
    ) -> Result<Self::AtRule, ()> {
        match prelude {
            AtPrelude::Import { href, media } => {
                self.rules.push(CssRule::Import { href, media });
                Ok(())
            }
            AtPrelude::Other { name, prelude } => {
                self.rules
                    .push(CssRule::Other(format!("@{} {};", name, prelude)));
                Ok(())
            }
            _ => Err(()),
        }
    }

    fn parse_block<'t>(
        &mut self,
        prelude: Self::Prelude,
        _start: &ParserState,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::AtRule, ParseError<'i, Self::Error>> {
        let rule = match prelude {
            AtPrelude::Media(media) => CssRule::Media {
                media,
                rules: parse_rule_list(input),
            },
            AtPrelude::FontFace => CssRule::FontFace(DeclarationBlock {
                declarations: parse_declaration_list(input),
            }),
            AtPrelude::Page(selector) => CssRule::Page {
                selector,
                declarations: DeclarationBlock {
                    declarations: parse_declaration_list(input),
                },
            },
            AtPrelude::Other { name, prelude } => {
                let body = remaining_text(input).trim().to_string();
                CssRule::Other(format!("@{} {} {{ {} }}", name, prelude, body))
            }
            AtPrelude::Import { .. } => return Err(input.new_custom_error(())),
        };
        self.rules.push(rule);
        Ok(())
    }
}

impl<'i> QualifiedRuleParser<'i> for RuleListParser<'_> {
    type Prelude = String;
    type QualifiedRule = ();
    type Error = ();

    fn parse_prelude<'t>(
        &mut self,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::Prelude, ParseError<'i, Self::Error>> {
        let text = remaining_text(input).trim().to_string();
        if text.is_empty() {
            return Err(input.new_custom_error(()));
        }
        Ok(text)
    }

    fn parse_block<'t>(
        &mut self,
        prelude: Self::Prelude,
        _start: &ParserState,
        input: &mut Parser<'i, 't>,
    ) -> Result<Self::QualifiedRule, ParseError<'i, Self::Error>> {
        self.rules.push(CssRule::Style(StyleRule {
            selectors: prelude,
            declarations: DeclarationBlock {
                declarations: parse_declaration_list(input),
            },
        }));
        Ok(())
    }
}

struct DeclarationCollector<'a> {
    declarations: &'a mut Vec<Declaration>,
}

impl<'i> DeclarationParser<'i> for DeclarationCollector<'_> {
    type Declaration = ();
    type Error = ();

    fn parse_value<'t>(
        &mut self,
        name: CowRcStr<'i>,
        input: &mut Parser<'i, 't>,
        _start: &ParserState,
    ) -> Result<Self::Declaration, ParseError<'i, Self::Error>> {
        let raw = remaining_text(input).trim();
        let important = IMPORTANT.is_match(raw);
        let value = IMPORTANT.replace(raw, "").trim().to_string();
        if value.is_empty() {
            return Err(input.new_custom_error(()));
        }
        self.declarations.push(Declaration {
            name: name.to_ascii_lowercase(),
            value,
            important,
        });
        Ok(())
    }
}

impl<'i> AtRuleParser<'i> for DeclarationCollector<'_> {
    type Prelude = ();
    type AtRule = ();
    type Error = ();
}

impl<'i> QualifiedRuleParser<'i> for DeclarationCollector<'_> {
    type Prelude = ();
    type QualifiedRule = ();
    type Error = ();
}

impl<'i> RuleBodyItemParser<'i, (), ()> for DeclarationCollector<'_> {
    fn parse_declarations(&self) -> bool {
        true
    }
    fn parse_qualified(&self) -> bool {
        false
    }
}
