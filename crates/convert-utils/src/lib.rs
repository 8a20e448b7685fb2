//! Shared helpers for the conversion crates: XML writing, MIME tables,
//! ZIP containers and text decoding.

pub mod archive;
pub mod encoding;
pub mod mime;
pub mod xml;
