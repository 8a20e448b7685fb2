//! Selector compilation and matching against the arena XHTML tree.
//!
//! Pseudo-elements (`::before`, `:after`, ...) are split off the selector
//! text before compiling, so a compiled selector only ever matches real
//! elements and remembers which pseudo-element it targets.

use std::fmt;

use convert_core::dom::{Document, NodeData, NodeId};
use cssparser::{CowRcStr, ParseError, Parser as CssParser, ParserInput, SourceLocation};
use once_cell::sync::Lazy;
use regex::Regex;
use selectors::attr::{AttrSelectorOperation, CaseSensitivity, NamespaceConstraint};
use selectors::context::{MatchingContext, SelectorCaches};
use selectors::matching::ElementSelectorFlags;
use selectors::parser::{Selector, SelectorParseErrorKind};
use selectors::{OpaqueElement, SelectorImpl};

static PSEUDO_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)::?(before|after|first-letter|first-line)\s*$").expect("static regex")
});

static DYNAMIC_PSEUDO_CLASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i):(?:hover|active|focus-within|focus-visible|focus|visited|link|target)\b")
        .expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PseudoElement {
    Before,
    After,
    FirstLetter,
    FirstLine,
}

impl PseudoElement {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "before" => Some(PseudoElement::Before),
            "after" => Some(PseudoElement::After),
            "first-letter" => Some(PseudoElement::FirstLetter),
            "first-line" => Some(PseudoElement::FirstLine),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PseudoElement::Before => "before",
            PseudoElement::After => "after",
            PseudoElement::FirstLetter => "first-letter",
            PseudoElement::FirstLine => "first-line",
        }
    }
}

impl fmt::Display for PseudoElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "::{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorErrorKind {
    Empty,
    Syntax,
}

/// A selector that could not be compiled. Callers log it and skip the rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorError {
    pub kind: SelectorErrorKind,
    pub message: String,
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SelectorError {}

/// `(ids, classes/attributes/pseudo-classes, elements/pseudo-elements)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectorSpecificity {
    pub ids: u32,
    pub classes: u32,
    pub elements: u32,
}

#[derive(Debug, Clone)]
struct CompiledPart {
    selector: Selector<SimpleSelectors>,
    pseudo: Option<PseudoElement>,
    specificity: SelectorSpecificity,
}

/// A compiled selector list.
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    parts: Vec<CompiledPart>,
}

impl CompiledSelector {
    /// Every part of the list that matches `node`, with its specificity and
    /// target pseudo-element.
    pub fn matching_parts(
        &self,
        doc: &Document,
        node: NodeId,
    ) -> Vec<(SelectorSpecificity, Option<PseudoElement>)> {
        if !doc.is_element(node) {
            return Vec::new();
        }
        let element = ElementRef::new(doc, node);
        let mut caches = SelectorCaches::default();
        let mut context = MatchingContext::new(
            selectors::matching::MatchingMode::Normal,
            None,
            &mut caches,
            selectors::context::QuirksMode::NoQuirks,
            selectors::matching::NeedsSelectorFlags::No,
            selectors::matching::MatchingForInvalidation::No,
        );
        self.parts
            .iter()
            .filter(|part| {
                selectors::matching::matches_selector(&part.selector, 0, None, &element, &mut context)
            })
            .map(|part| (part.specificity, part.pseudo))
            .collect()
    }

    /// True when some part of the list matches the element (parts that
    /// target a pseudo-element count as matching their element).
    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        !self.matching_parts(doc, node).is_empty()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Compile a selector list such as `p.note, h1::before`.
pub fn compile(text: &str) -> Result<CompiledSelector, SelectorError> {
    let mut parts = Vec::new();
    for piece in split_selector_list(text) {
        let (selector_text, pseudo) = split_pseudo_element(&piece);
        let selector = parse_single(&selector_text).map_err(|message| SelectorError {
            kind: SelectorErrorKind::Syntax,
            message: format!("invalid selector '{}': {}", piece, message),
        })?;
        let packed = selector.specificity();
        let mut specificity = SelectorSpecificity {
            ids: (packed >> 20) & 0x3FF,
            classes: (packed >> 10) & 0x3FF,
            elements: packed & 0x3FF,
        };
        if pseudo.is_some() {
            specificity.elements += 1;
        }
        parts.push(CompiledPart {
            selector,
            pseudo,
            specificity,
        });
    }
    if parts.is_empty() {
        return Err(SelectorError {
            kind: SelectorErrorKind::Empty,
            message: "empty selector".to_string(),
        });
    }
    Ok(CompiledSelector { parts })
}

fn parse_single(text: &str) -> Result<Selector<SimpleSelectors>, String> {
    let mut input = ParserInput::new(text);
    let mut parser = CssParser::new(&mut input);
    let selector =
        Selector::parse(&SimpleSelectors, &mut parser).map_err(|e| format!("{:?}", e.kind))?;
    parser
        .expect_exhausted()
        .map_err(|e| format!("{:?}", e.kind))?;
    Ok(selector)
}

/// Split a selector list on top-level commas.
pub fn split_selector_list(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' | '[' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | ']' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                ',' if depth == 0 => out.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    out.push(current);
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Remove a trailing pseudo-element from a single selector. A selector
/// that was only a pseudo-element becomes `*`.
pub fn split_pseudo_element(selector: &str) -> (String, Option<PseudoElement>) {
    let Some(caps) = PSEUDO_ELEMENT.captures(selector) else {
        return (selector.trim().to_string(), None);
    };
    let pseudo = PseudoElement::from_name(&caps[1]);
    let start = caps.get(0).map_or(selector.len(), |m| m.start());
    (complete_compound(&selector[..start]), pseudo)
}

/// Drop user-action and link-state pseudo-classes so a selector can be
/// tested against a static document.
pub fn strip_dynamic_pseudo_classes(selector: &str) -> String {
    let mut out = String::with_capacity(selector.len());
    let mut last = 0;
    for m in DYNAMIC_PSEUDO_CLASS.find_iter(selector) {
        let before = &selector[..m.start()];
        if before.ends_with(':') {
            continue;
        }
        out.push_str(&selector[last..m.start()]);
        let prev = before.chars().last();
        if prev.map_or(true, |c| {
            c.is_whitespace() || matches!(c, '>' | '+' | '~' | ',' | '(')
        }) {
            out.push('*');
        }
        last = m.end();
    }
    out.push_str(&selector[last..]);
    out
}

fn complete_compound(selector: &str) -> String {
    let trimmed = selector.trim_end();
    match trimmed.chars().last() {
        None => "*".to_string(),
        Some('>' | '+' | '~') => format!("{} *", trimmed),
        Some(_) if selector.len() != trimmed.len() => format!("{} *", trimmed),
        Some(_) => trimmed.trim_start().to_string(),
    }
}

/// Every element of `doc` matched by `selector`, in document order.
pub fn select_all(doc: &Document, selector: &CompiledSelector) -> Vec<NodeId> {
    doc.elements()
        .into_iter()
        .filter(|&id| {
            selector
                .matching_parts(doc, id)
                .iter()
                .any(|(_, pseudo)| pseudo.is_none())
        })
        .collect()
}

// -- selectors glue --

/// Selector implementation for the arena tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleSelectors;

/// String type used for every identifier slot of the selector grammar.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct CssString(pub String);

impl precomputed_hash::PrecomputedHash for CssString {
    fn precomputed_hash(&self) -> u32 {
        let mut h: u32 = 0;
        for byte in self.0.bytes() {
            h = h.wrapping_mul(31).wrapping_add(byte as u32);
        }
        h
    }
}

impl cssparser::ToCss for CssString {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        dest.write_str(&self.0)
    }
}

impl From<String> for CssString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'a> From<&'a str> for CssString {
    fn from(s: &'a str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CssString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Never constructed: pseudo-elements are split off before parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NoPseudoElement {}

impl cssparser::ToCss for NoPseudoElement {
    fn to_css<W: fmt::Write>(&self, _dest: &mut W) -> fmt::Result {
        match *self {}
    }
}

impl selectors::parser::PseudoElement for NoPseudoElement {
    type Impl = SimpleSelectors;

    fn accepts_state_pseudo_classes(&self) -> bool {
        false
    }

    fn valid_after_slotted(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NonTSPseudoClass {
    Link,
    Visited,
    Hover,
    Active,
    Focus,
    Target,
}

impl selectors::parser::NonTSPseudoClass for NonTSPseudoClass {
    type Impl = SimpleSelectors;

    fn is_active_or_hover(&self) -> bool {
        matches!(self, Self::Hover | Self::Active)
    }

    fn is_user_action_state(&self) -> bool {
        matches!(self, Self::Hover | Self::Active | Self::Focus)
    }
}

impl cssparser::ToCss for NonTSPseudoClass {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        dest.write_str(match self {
            Self::Link => ":link",
            Self::Visited => ":visited",
            Self::Hover => ":hover",
            Self::Active => ":active",
            Self::Focus => ":focus",
            Self::Target => ":target",
        })
    }
}

impl<'i> selectors::parser::Parser<'i> for SimpleSelectors {
    type Impl = SimpleSelectors;
    type Error = SelectorParseErrorKind<'i>;

    fn parse_non_ts_pseudo_class(
        &self,
        location: SourceLocation,
        name: CowRcStr<'i>,
    ) -> Result<NonTSPseudoClass, ParseError<'i, Self::Error>> {
        let pc = match name.to_ascii_lowercase().as_str() {
            "link" | "any-link" => NonTSPseudoClass::Link,
            "visited" => NonTSPseudoClass::Visited,
            "hover" => NonTSPseudoClass::Hover,
            "active" => NonTSPseudoClass::Active,
            "focus" => NonTSPseudoClass::Focus,
            "target" => NonTSPseudoClass::Target,
            _ => {
                return Err(location.new_custom_error(
                    SelectorParseErrorKind::UnsupportedPseudoClassOrElement(name),
                ))
            }
        };
        Ok(pc)
    }
}

impl SelectorImpl for SimpleSelectors {
    type ExtraMatchingData<'a> = ();
    type AttrValue = CssString;
    type Identifier = CssString;
    type LocalName = CssString;
    type NamespaceUrl = CssString;
    type NamespacePrefix = CssString;
    type BorrowedLocalName = CssString;
    type BorrowedNamespaceUrl = CssString;
    type NonTSPseudoClass = NonTSPseudoClass;
    type PseudoElement = NoPseudoElement;
}

/// An element of a [`Document`] as seen by the selector engine.
#[derive(Clone, Copy)]
pub struct ElementRef<'a> {
    doc: &'a Document,
    id: NodeId,
}

impl<'a> ElementRef<'a> {
    pub fn new(doc: &'a Document, id: NodeId) -> Self {
        Self { doc, id }
    }

    fn name(&self) -> &'a str {
        self.doc.local_name(self.id).unwrap_or("")
    }

    fn wrap(&self, id: Option<NodeId>) -> Option<Self> {
        id.map(|id| Self::new(self.doc, id))
    }
}

impl fmt::Debug for ElementRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementRef")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

impl<'a> selectors::Element for ElementRef<'a> {
    type Impl = SimpleSelectors;

    fn opaque(&self) -> OpaqueElement {
        OpaqueElement::new(self.doc.node(self.id))
    }

    fn parent_element(&self) -> Option<Self> {
        let parent = self.doc.parent(self.id)?;
        self.wrap(self.doc.is_element(parent).then_some(parent))
    }

    fn parent_node_is_shadow_root(&self) -> bool {
        false
    }

    fn containing_shadow_host(&self) -> Option<Self> {
        None
    }

    fn is_pseudo_element(&self) -> bool {
        false
    }

    fn prev_sibling_element(&self) -> Option<Self> {
        self.wrap(self.doc.prev_sibling_element(self.id))
    }

    fn next_sibling_element(&self) -> Option<Self> {
        self.wrap(self.doc.next_sibling_element(self.id))
    }

    fn first_element_child(&self) -> Option<Self> {
        self.wrap(self.doc.first_element_child(self.id))
    }

    fn is_html_element_in_html_document(&self) -> bool {
        true
    }

    fn has_local_name(&self, name: &CssString) -> bool {
        self.name().eq_ignore_ascii_case(&name.0)
    }

    fn has_namespace(&self, _ns: &CssString) -> bool {
        true
    }

    fn is_same_type(&self, other: &Self) -> bool {
        self.name().eq_ignore_ascii_case(other.name())
    }

    fn attr_matches(
        &self,
        _ns: &NamespaceConstraint<&CssString>,
        local_name: &CssString,
        operation: &AttrSelectorOperation<&CssString>,
    ) -> bool {
        let Some(el) = self.doc.element(self.id) else {
            return false;
        };
        el.attrs.iter().any(|(name, value)| {
            let local = name.rsplit_once(':').map_or(name.as_str(), |(_, l)| l);
            local == local_name.0 && operation.eval_str(value)
        })
    }

    fn match_non_ts_pseudo_class(
        &self,
        pc: &NonTSPseudoClass,
        _context: &mut MatchingContext<'_, Self::Impl>,
    ) -> bool {
        match pc {
            NonTSPseudoClass::Link => self.is_link(),
            _ => false,
        }
    }

    fn match_pseudo_element(
        &self,
        _pe: &NoPseudoElement,
        _context: &mut MatchingContext<'_, Self::Impl>,
    ) -> bool {
        false
    }

    fn is_link(&self) -> bool {
        self.name().eq_ignore_ascii_case("a") && self.doc.attr(self.id, "href").is_some()
    }

    fn is_html_slot_element(&self) -> bool {
        false
    }

    fn has_id(&self, id: &CssString, case_sensitivity: CaseSensitivity) -> bool {
        self.doc
            .attr(self.id, "id")
            .is_some_and(|v| case_sensitivity.eq(v.as_bytes(), id.0.as_bytes()))
    }

    fn has_class(&self, name: &CssString, case_sensitivity: CaseSensitivity) -> bool {
        self.doc.element(self.id).is_some_and(|el| {
            el.classes()
                .any(|c| case_sensitivity.eq(c.as_bytes(), name.0.as_bytes()))
        })
    }

    fn imported_part(&self, _name: &CssString) -> Option<CssString> {
        None
    }

    fn is_part(&self, _name: &CssString) -> bool {
        false
    }

    fn is_empty(&self) -> bool {
        self.doc.children(self.id).iter().all(|&c| {
            matches!(
                self.doc.node(c).data,
                NodeData::Comment(_) | NodeData::ProcessingInstruction(_)
            )
        })
    }

    fn is_root(&self) -> bool {
        self.doc
            .parent(self.id)
            .is_some_and(|p| matches!(self.doc.node(p).data, NodeData::Document))
    }

    fn apply_selector_flags(&self, _flags: ElementSelectorFlags) {}

    fn add_element_unique_hashes(&self, _filter: &mut selectors::bloom::BloomFilter) -> bool {
        false
    }

    fn has_custom_state(&self, _name: &CssString) -> bool {
        false
    }
}
