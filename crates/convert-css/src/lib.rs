//! CSS cascade for OEB content documents: selector matching, typed values,
//! shorthand expansion, media filtering and `@font-face` matching.

pub mod cascade;
pub mod fonts;
pub mod media;
pub mod properties;
pub mod select;
pub mod values;

pub use cascade::{CascadeOptions, Origin, PageRule, Specificity, StyleDeclaration, Stylizer};
pub use fonts::{match_face, FontFace, FontRequest, FontStyle};
pub use media::MediaFilter;
pub use select::{compile, CompiledSelector, PseudoElement, SelectorError, SelectorErrorKind};
pub use values::{Unit, Value};
