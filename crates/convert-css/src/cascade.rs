//! Per-document style resolution.
//!
//! A [`Stylizer`] gathers every stylesheet that applies to one XHTML item
//! (user agent, linked, embedded, user and inline), expands shorthands and
//! records, for each element and pseudo-element, the winning declaration of
//! every property. Inherited and computed values are answered on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use convert_core::book::BookDocument;
use convert_core::dom::{Document, NodeData, NodeId};
use convert_core::error::Result;
use convert_core::href;
use convert_core::options::ConversionOptions;
use convert_core::stylesheet::{CssRule, DeclarationBlock, Stylesheet};
use once_cell::sync::Lazy;

use crate::fonts::{self, FontFace, FontRequest, FontStyle};
use crate::media::MediaFilter;
use crate::properties;
use crate::select::{self, CompiledSelector, PseudoElement};
use crate::values::{Unit, Value};

static USER_AGENT_SHEET: Lazy<Stylesheet> =
    Lazy::new(|| Stylesheet::parse(include_str!("ua.css")));

/// Font size used for `medium` when no profile says otherwise.
pub const DEFAULT_BASE_FONT_SIZE_PT: f64 = 12.0;

#[derive(Debug, Clone)]
pub struct CascadeOptions {
    /// User stylesheet text, applied after all author sheets.
    pub extra_css: Option<String>,
    pub media: MediaFilter,
    pub user_agent_css: bool,
    /// Size of `medium` in points.
    pub base_font_size_pt: f64,
}

impl Default for CascadeOptions {
    fn default() -> Self {
        Self {
            extra_css: None,
            media: MediaFilter::default(),
            user_agent_css: true,
            base_font_size_pt: DEFAULT_BASE_FONT_SIZE_PT,
        }
    }
}

impl CascadeOptions {
    /// `extra_css` may name a file; its contents are used when it exists.
    pub fn from_options(opts: &ConversionOptions) -> Self {
        let extra_css = opts.extra_css.as_deref().and_then(|css| {
            let path = std::path::Path::new(css.trim());
            if !css.contains('{') && path.is_file() {
                match std::fs::read_to_string(path) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        log::warn!("Could not read extra CSS from {}: {}", path.display(), e);
                        None
                    }
                }
            } else if css.trim().is_empty() {
                None
            } else {
                Some(css.to_string())
            }
        });
        let base = if opts.output_profile.fbase > 0.0 {
            opts.output_profile.fbase
        } else {
            DEFAULT_BASE_FONT_SIZE_PT
        };
        Self {
            extra_css,
            base_font_size_pt: base,
            ..Self::default()
        }
    }
}

/// Where a declaration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    UserAgent,
    Author,
    User,
    /// A `style` attribute.
    Inline,
}

/// Cascade rank of a declaration. Field order is comparison order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Specificity {
    pub important: bool,
    pub style_attr: bool,
    pub ids: u32,
    pub classes: u32,
    pub elements: u32,
    /// Position of the rule across every sheet in cascade order.
    pub rule_index: usize,
}

/// The winning declaration of one property on one element.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleDeclaration {
    pub name: String,
    /// Raw value text as declared.
    pub value: String,
    pub important: bool,
    pub origin: Origin,
    /// Href of the sheet (or document) the declaration lives in.
    pub base: String,
    pub specificity: Specificity,
}

impl StyleDeclaration {
    /// Typed value with URLs resolved against the declaring sheet.
    pub fn parsed(&self) -> Value {
        Value::parse(&self.value, Some(&self.base))
    }
}

#[derive(Debug, Clone)]
pub struct PageRule {
    pub selector: String,
    pub declarations: DeclarationBlock,
    pub base: String,
}

struct CollectedRule {
    selector: CompiledSelector,
    /// Expanded longhands: `(name, value, important)`.
    declarations: Vec<(String, String, bool)>,
    base: String,
    origin: Origin,
    index: usize,
}

type DeclarationMap = BTreeMap<String, StyleDeclaration>;

pub struct Stylizer {
    document: Arc<Document>,
    item_href: String,
    specified: HashMap<NodeId, DeclarationMap>,
    pseudo: BTreeMap<(NodeId, PseudoElement), DeclarationMap>,
    font_faces: Vec<FontFace>,
    page_rules: Vec<PageRule>,
    font_sizes: HashMap<NodeId, f64>,
    base_font_size_pt: f64,
}

impl Stylizer {
    /// Resolve the styles of the XHTML item at `item_href`.
    pub fn new(book: &BookDocument, item_href: &str, opts: &CascadeOptions) -> Result<Self> {
        let document = book.xhtml(item_href)?;
        let mut collector = Collector {
            book,
            media: &opts.media,
            rules: Vec::new(),
            font_faces: Vec::new(),
            page_rules: Vec::new(),
            in_progress: Vec::new(),
            next_index: 0,
        };

        if opts.user_agent_css {
            collector.add_sheet(&USER_AGENT_SHEET, item_href, Origin::UserAgent);
        }
        collector.add_document_sheets(&document, item_href);
        if let Some(css) = &opts.extra_css {
            let sheet = Stylesheet::parse(css);
            collector.add_sheet(&sheet, item_href, Origin::User);
        }

        let rule_count = collector.next_index;
        let Collector {
            rules,
            font_faces,
            page_rules,
            ..
        } = collector;

        let mut stylizer = Self {
            document,
            item_href: item_href.to_string(),
            specified: HashMap::new(),
            pseudo: BTreeMap::new(),
            font_faces,
            page_rules,
            font_sizes: HashMap::new(),
            base_font_size_pt: opts.base_font_size_pt,
        };
        stylizer.apply_rules(&rules, rule_count);
        stylizer.compute_font_sizes();
        log::debug!(
            "Stylized {} with {} rules over {} elements",
            item_href,
            rules.len(),
            stylizer.specified.len()
        );
        Ok(stylizer)
    }

    fn apply_rules(&mut self, rules: &[CollectedRule], inline_index: usize) {
        let doc = Arc::clone(&self.document);
        for node in doc.elements() {
            for rule in rules {
                for (spec, pseudo) in rule.selector.matching_parts(&doc, node) {
                    for (name, value, important) in &rule.declarations {
                        let declaration = StyleDeclaration {
                            name: name.clone(),
                            value: value.clone(),
                            important: *important,
                            origin: rule.origin,
                            base: rule.base.clone(),
                            specificity: Specificity {
                                important: *important,
                                style_attr: false,
                                ids: spec.ids,
                                classes: spec.classes,
                                elements: spec.elements,
                                rule_index: rule.index,
                            },
                        };
                        let map = match pseudo {
                            Some(p) => self.pseudo.entry((node, p)).or_default(),
                            None => self.specified.entry(node).or_default(),
                        };
                        keep_winner(map, declaration);
                    }
                }
            }

            if let Some(style) = doc.attr(node, "style") {
                let block = DeclarationBlock::parse(style);
                for decl in block.iter() {
                    for (name, value) in properties::expand(&decl.name, &decl.value) {
                        let declaration = StyleDeclaration {
                            name,
                            value,
                            important: decl.important,
                            origin: Origin::Inline,
                            base: self.item_href.clone(),
                            specificity: Specificity {
                                important: decl.important,
                                style_attr: true,
                                rule_index: inline_index,
                                ..Specificity::default()
                            },
                        };
                        keep_winner(self.specified.entry(node).or_default(), declaration);
                    }
                }
            }
        }
    }

    fn compute_font_sizes(&mut self) {
        let doc = Arc::clone(&self.document);
        let root_size = doc
            .root_element()
            .map(|root| self.font_size_from(root, self.base_font_size_pt, self.base_font_size_pt))
            .unwrap_or(self.base_font_size_pt);
        // Pre-order, so parents are always computed first.
        for node in doc.elements() {
            let parent_size = doc
                .parent(node)
                .and_then(|p| self.font_sizes.get(&p).copied())
                .unwrap_or(self.base_font_size_pt);
            let size = self.font_size_from(node, parent_size, root_size);
            self.font_sizes.insert(node, size);
        }
    }

    fn font_size_from(&self, node: NodeId, parent: f64, root: f64) -> f64 {
        let Some(decl) = self.specified.get(&node).and_then(|m| m.get("font-size")) else {
            return parent;
        };
        let value = decl.parsed();
        resolve_font_size(&value, parent, root, self.base_font_size_pt).unwrap_or(parent)
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn item_href(&self) -> &str {
        &self.item_href
    }

    /// Winning declarations on `node` itself, without inheritance.
    pub fn specified(&self, node: NodeId) -> Option<&BTreeMap<String, StyleDeclaration>> {
        self.specified.get(&node)
    }

    /// Winning declarations on a pseudo-element of `node`.
    pub fn pseudo_specified(
        &self,
        node: NodeId,
        pseudo: PseudoElement,
    ) -> Option<&BTreeMap<String, StyleDeclaration>> {
        self.pseudo.get(&(node, pseudo))
    }

    /// Pseudo-elements with declarations on `node`.
    pub fn pseudo_elements_of(&self, node: NodeId) -> Vec<PseudoElement> {
        self.pseudo
            .range((node, PseudoElement::Before)..=(node, PseudoElement::FirstLine))
            .map(|((_, p), _)| *p)
            .collect()
    }

    /// Value of `property` for `node`: the cascaded value, else the parent's
    /// for inherited properties, else the initial value. Properties with no
    /// known initial value come back as the keyword `initial`.
    pub fn style_of(&self, node: NodeId, property: &str) -> Value {
        self.cascaded(node, property)
            .unwrap_or_else(|| Value::Keyword("initial".to_string()))
    }

    fn cascaded(&self, node: NodeId, property: &str) -> Option<Value> {
        let parent = self.parent_element(node);
        if let Some(decl) = self.specified.get(&node).and_then(|m| m.get(property)) {
            match decl.value.trim().to_ascii_lowercase().as_str() {
                "inherit" => return self.inherited(parent, property),
                "initial" => return initial_value(property),
                "unset" if properties::is_inherited(property) => {
                    return self.inherited(parent, property)
                }
                "unset" => return initial_value(property),
                _ => return Some(decl.parsed()),
            }
        }
        if properties::is_inherited(property) {
            self.inherited(parent, property)
        } else {
            initial_value(property)
        }
    }

    fn inherited(&self, parent: Option<NodeId>, property: &str) -> Option<Value> {
        match parent {
            Some(p) => self.cascaded(p, property),
            None => initial_value(property),
        }
    }

    fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.document
            .parent(node)
            .filter(|&p| self.document.is_element(p))
    }

    /// Value of `property` on a pseudo-element; inherits from the element
    /// itself. `None` when the pseudo-element has no declarations at all.
    pub fn pseudo_style_of(
        &self,
        node: NodeId,
        pseudo: PseudoElement,
        property: &str,
    ) -> Option<Value> {
        let map = self.pseudo.get(&(node, pseudo))?;
        let decl = match map.get(property) {
            Some(decl) => decl,
            None if properties::is_inherited(property) => {
                return Some(self.style_of(node, property))
            }
            None => return initial_value(property),
        };
        match decl.value.trim().to_ascii_lowercase().as_str() {
            "inherit" => Some(self.style_of(node, property)),
            "initial" => initial_value(property),
            _ => Some(decl.parsed()),
        }
    }

    /// Computed font size of `node` in points.
    pub fn computed_font_size_pt(&self, node: NodeId) -> f64 {
        self.font_sizes
            .get(&node)
            .copied()
            .unwrap_or(self.base_font_size_pt)
    }

    pub fn base_font_size_pt(&self) -> f64 {
        self.base_font_size_pt
    }

    /// Numeric font weight of `node`, resolving `bolder`/`lighter` up the
    /// tree.
    pub fn computed_font_weight(&self, node: NodeId) -> u16 {
        let parent = self
            .parent_element(node)
            .map(|p| self.computed_font_weight(p))
            .unwrap_or(400);
        match self.specified.get(&node).and_then(|m| m.get("font-weight")) {
            Some(decl) if decl.value.trim().eq_ignore_ascii_case("inherit") => parent,
            Some(decl) => fonts::parse_weight(&decl.value, parent),
            None => parent,
        }
    }

    /// Font selection properties of `node` (or one of its pseudo-elements).
    pub fn font_request(&self, node: NodeId, pseudo: Option<PseudoElement>) -> FontRequest {
        let get = |prop: &str| match pseudo {
            Some(p) => self
                .pseudo_style_of(node, p, prop)
                .unwrap_or_else(|| self.style_of(node, prop)),
            None => self.style_of(node, prop),
        };
        let mut weight = self.computed_font_weight(node);
        if let Some(decl) = pseudo
            .and_then(|p| self.pseudo.get(&(node, p)))
            .and_then(|m| m.get("font-weight"))
        {
            weight = fonts::parse_weight(&decl.value, weight);
        }
        FontRequest {
            families: fonts::family_list(&get("font-family")),
            weight,
            style: FontStyle::parse(&get("font-style").to_string()),
            stretch: fonts::parse_stretch(&get("font-stretch").to_string()),
        }
    }

    /// `@font-face` rules in cascade order, later duplicates replacing
    /// earlier ones.
    pub fn font_faces(&self) -> &[FontFace] {
        &self.font_faces
    }

    pub fn page_rules(&self) -> &[PageRule] {
        &self.page_rules
    }
}

fn keep_winner(map: &mut DeclarationMap, declaration: StyleDeclaration) {
    match map.get(&declaration.name) {
        Some(existing) if existing.specificity > declaration.specificity => {}
        _ => {
            map.insert(declaration.name.clone(), declaration);
        }
    }
}

fn initial_value(property: &str) -> Option<Value> {
    properties::default_value(property).map(|v| Value::parse(v, None))
}

/// Font size in points for a `font-size` value, or `None` when the value is
/// not a size.
pub fn resolve_font_size(value: &Value, parent: f64, root: f64, medium: f64) -> Option<f64> {
    let size = match value {
        Value::Length(v, unit) => {
            let v = *v as f64;
            match unit {
                Unit::Em => v * parent,
                Unit::Rem => v * root,
                Unit::Ex | Unit::Ch => v * parent / 2.0,
                other => v * other.absolute_pt()?,
            }
        }
        Value::Percentage(p) => *p as f64 * parent / 100.0,
        Value::Number(n) if *n == 0.0 => 0.0,
        Value::Keyword(k) => {
            let factor = match k.as_str() {
                "xx-small" => 3.0 / 5.0,
                "x-small" => 3.0 / 4.0,
                "small" => 8.0 / 9.0,
                "medium" => 1.0,
                "large" => 6.0 / 5.0,
                "x-large" => 3.0 / 2.0,
                "xx-large" => 2.0,
                "xxx-large" => 3.0,
                "smaller" => return Some(parent / 1.2),
                "larger" => return Some(parent * 1.2),
                _ => return None,
            };
            medium * factor
        }
        _ => return None,
    };
    Some(size)
}

struct Collector<'a> {
    book: &'a BookDocument,
    media: &'a MediaFilter,
    rules: Vec<CollectedRule>,
    font_faces: Vec<FontFace>,
    page_rules: Vec<PageRule>,
    /// Sheets currently being expanded, for `@import` cycle detection.
    in_progress: Vec<String>,
    next_index: usize,
}

impl Collector<'_> {
    /// Linked and embedded sheets in document order.
    fn add_document_sheets(&mut self, doc: &Document, item_href: &str) {
        for node in doc.elements() {
            match doc.local_name(node) {
                Some("link") => {
                    let rel = doc.attr(node, "rel").unwrap_or("").to_ascii_lowercase();
                    let mut rels = rel.split_whitespace();
                    if !rels.clone().any(|r| r == "stylesheet") || rels.any(|r| r == "alternate") {
                        continue;
                    }
                    if !self.media.accepts(doc.attr(node, "media").unwrap_or("")) {
                        continue;
                    }
                    let Some(raw) = doc.attr(node, "href") else {
                        continue;
                    };
                    match self.book.resolve_link(item_href, raw) {
                        Some(target) => self.add_linked_sheet(&target),
                        None => log::warn!(
                            "Stylesheet {} linked from {} is not in the book",
                            raw,
                            item_href
                        ),
                    }
                }
                Some("style") => {
                    let kind = doc.attr(node, "type").unwrap_or("text/css");
                    if !kind.eq_ignore_ascii_case("text/css")
                        || !self.media.accepts(doc.attr(node, "media").unwrap_or(""))
                    {
                        continue;
                    }
                    let text: String = doc
                        .children(node)
                        .iter()
                        .filter_map(|&c| match &doc.node(c).data {
                            NodeData::Text(t) => Some(t.as_str()),
                            _ => None,
                        })
                        .collect();
                    let sheet = Stylesheet::parse(&text);
                    self.in_progress.push(item_href.to_string());
                    self.add_sheet(&sheet, item_href, Origin::Author);
                    self.in_progress.pop();
                }
                _ => {}
            }
        }
    }

    fn add_linked_sheet(&mut self, sheet_href: &str) {
        if self.in_progress.iter().any(|h| h == sheet_href) {
            log::warn!(
                "Import cycle: {} imports itself through {}",
                sheet_href,
                self.in_progress.join(" -> ")
            );
            return;
        }
        let sheet = match self.book.css(sheet_href) {
            Ok(sheet) => sheet,
            Err(e) => {
                log::warn!("Skipping stylesheet {}: {}", sheet_href, e);
                return;
            }
        };
        self.in_progress.push(sheet_href.to_string());
        self.add_sheet(&sheet, sheet_href, Origin::Author);
        self.in_progress.pop();
    }

    fn add_sheet(&mut self, sheet: &Stylesheet, base: &str, origin: Origin) {
        self.add_rules(&sheet.rules, base, origin);
    }

    fn add_rules(&mut self, rules: &[CssRule], base: &str, origin: Origin) {
        for rule in rules {
            match rule {
                CssRule::Import { href: raw, media } => {
                    if !self.media.accepts(media) {
                        continue;
                    }
                    if href::is_external(raw) {
                        log::debug!("Ignoring external import {}", raw);
                        continue;
                    }
                    match self.book.resolve_link(base, raw) {
                        Some(target) => self.add_linked_sheet(&target),
                        None => log::warn!("Imported stylesheet {} from {} not found", raw, base),
                    }
                }
                CssRule::Media { media, rules } => {
                    if self.media.accepts(media) {
                        self.add_rules(rules, base, origin);
                    }
                }
                CssRule::Style(style) => {
                    let index = self.next_index;
                    self.next_index += 1;
                    let selector = match select::compile(&style.selectors) {
                        Ok(s) => s,
                        Err(e) => {
                            log::warn!("Ignoring rule in {}: {}", base, e);
                            continue;
                        }
                    };
                    let declarations = style
                        .declarations
                        .iter()
                        .flat_map(|d| {
                            properties::expand(&d.name, &d.value)
                                .into_iter()
                                .map(move |(n, v)| (n, v, d.important))
                        })
                        .collect();
                    self.rules.push(CollectedRule {
                        selector,
                        declarations,
                        base: base.to_string(),
                        origin,
                        index,
                    });
                }
                CssRule::FontFace(block) => {
                    if let Some(face) = FontFace::from_declarations(block, base) {
                        self.font_faces.retain(|f| {
                            !(f.families == face.families
                                && f.weight == face.weight
                                && f.style == face.style
                                && f.stretch == face.stretch)
                        });
                        self.font_faces.push(face);
                    }
                }
                CssRule::Page {
                    selector,
                    declarations,
                } => self.page_rules.push(PageRule {
                    selector: selector.clone(),
                    declarations: declarations.clone(),
                    base: base.to_string(),
                }),
                CssRule::Other(_) => {}
            }
        }
    }
}
