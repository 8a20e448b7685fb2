//! Removal of the IDPF and Adobe font obfuscation schemes.
//!
//! Both schemes XOR a prefix of the font file with a key derived from the
//! publication identifier, so applying them twice restores the input.

use std::path::Path;

use sha1::{Digest, Sha1};

use convert_core::book::BookDocument;
use convert_core::error::{ConvertError, Result};
use convert_core::{href, opf};

use crate::container::EncryptedResource;

pub const IDPF_ALGORITHM: &str = "http://www.idpf.org/2008/embedding";
pub const ADOBE_ALGORITHM: &str = "http://ns.adobe.com/pdf/enc#RC";

const IDPF_PREFIX: usize = 1040;
const ADOBE_PREFIX: usize = 1024;

pub fn is_font_obfuscation(algorithm: &str) -> bool {
    algorithm == IDPF_ALGORITHM || algorithm == ADOBE_ALGORITHM
}

/// SHA-1 of the unique identifier with XML whitespace removed.
pub fn idpf_key(uid: &str) -> Vec<u8> {
    let cleaned: String = uid
        .chars()
        .filter(|c| !matches!(c, ' ' | '\t' | '\r' | '\n'))
        .collect();
    Sha1::digest(cleaned.as_bytes()).to_vec()
}

/// The 16 bytes of the first `urn:uuid:` identifier.
pub fn adobe_key<'a>(identifiers: impl IntoIterator<Item = &'a str>) -> Option<Vec<u8>> {
    identifiers.into_iter().find_map(|id| {
        let id = id.trim();
        let raw = id.strip_prefix("urn:uuid:")?;
        uuid::Uuid::parse_str(raw)
            .ok()
            .map(|u| u.as_bytes().to_vec())
    })
}

/// XOR the first `len` bytes of `data` with the repeated key.
pub fn xor_prefix(data: &mut [u8], key: &[u8], len: usize) {
    if key.is_empty() {
        return;
    }
    for (i, byte) in data.iter_mut().take(len).enumerate() {
        *byte ^= key[i % key.len()];
    }
}

/// Restore every obfuscated font below `root` in place. Any other
/// encryption algorithm means the book is DRM protected, which is a
/// format error.
pub fn deobfuscate(root: &Path, descriptor: &Path, resources: &[EncryptedResource]) -> Result<()> {
    if let Some(locked) = resources
        .iter()
        .find(|r| !is_font_obfuscation(&r.algorithm))
    {
        return Err(ConvertError::format(
            crate::PLUGIN_NAME,
            format!(
                "{} is encrypted with {}; DRM protected books cannot be converted",
                locked.uri, locked.algorithm
            ),
        ));
    }
    if resources.is_empty() {
        return Ok(());
    }

    let book = opf::read_opf(descriptor)?;
    let idpf = book.uid.as_deref().map(idpf_key);
    let adobe = adobe_key(identifiers(&book));

    for resource in resources {
        let (key, prefix) = if resource.algorithm == IDPF_ALGORITHM {
            (idpf.as_deref(), IDPF_PREFIX)
        } else {
            (adobe.as_deref(), ADOBE_PREFIX)
        };
        let Some(key) = key else {
            log::warn!(
                "No identifier to de-obfuscate {}; the font is left as is",
                resource.uri
            );
            continue;
        };
        let path = opf::join_href(root, &href::canonicalize(&resource.uri));
        let mut data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Cannot read obfuscated font {}: {}", resource.uri, e);
                continue;
            }
        };
        xor_prefix(&mut data, key, prefix);
        std::fs::write(&path, data)?;
        log::debug!("De-obfuscated {}", resource.uri);
    }
    Ok(())
}

fn identifiers(book: &BookDocument) -> Vec<&str> {
    book.metadata
        .get("identifier")
        .map(|items| items.iter().map(|i| i.value.as_str()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_is_an_involution() {
        let original: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();
        let key = idpf_key("urn:uuid:1234");
        let mut data = original.clone();
        xor_prefix(&mut data, &key, IDPF_PREFIX);
        assert_ne!(data[..IDPF_PREFIX], original[..IDPF_PREFIX]);
        assert_eq!(data[IDPF_PREFIX..], original[IDPF_PREFIX..]);
        xor_prefix(&mut data, &key, IDPF_PREFIX);
        assert_eq!(data, original);
    }

    #[test]
    fn test_idpf_key_ignores_whitespace() {
        assert_eq!(idpf_key(" urn:x \n"), idpf_key("urn:x"));
        assert_eq!(idpf_key("urn:x").len(), 20);
    }

    #[test]
    fn test_adobe_key_from_uuid_identifier() {
        let key = adobe_key(["isbn:123", "urn:uuid:00112233-4455-6677-8899-aabbccddeeff"]).unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0xff);
        assert!(adobe_key(["isbn:123"]).is_none());
    }

    #[test]
    fn test_drm_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let resources = vec![EncryptedResource {
            algorithm: "http://www.w3.org/2001/04/xmlenc#aes128-cbc".to_string(),
            uri: "OEBPS/ch1.xhtml".to_string(),
        }];
        let err = deobfuscate(dir.path(), &dir.path().join("x.opf"), &resources).unwrap_err();
        assert!(err.to_string().contains("DRM"));
    }
}
