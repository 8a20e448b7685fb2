//! OCF container metadata: `META-INF/container.xml` and
//! `META-INF/encryption.xml`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use convert_core::error::ConvertError;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("malformed {file}: {message}")]
    Xml { file: &'static str, message: String },

    #[error("{0} lists no package descriptor")]
    NoRootfile(&'static str),
}

impl From<ContainerError> for ConvertError {
    fn from(e: ContainerError) -> Self {
        ConvertError::format(crate::PLUGIN_NAME, e.to_string())
    }
}

/// One `<rootfile>` of `container.xml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rootfile {
    pub full_path: String,
    pub media_type: String,
}

/// A resource listed in `encryption.xml`, with the URI relative to the
/// container root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedResource {
    pub algorithm: String,
    pub uri: String,
}

const CONTAINER_XML: &str = "container.xml";
const ENCRYPTION_XML: &str = "encryption.xml";

/// Rootfiles in document order.
pub fn rootfiles(xml: &str) -> Result<Vec<Rootfile>, ContainerError> {
    let mut reader = Reader::from_str(xml);
    let mut found = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"rootfile" {
                    if let Some(full_path) = attr(e, b"full-path") {
                        found.push(Rootfile {
                            full_path,
                            media_type: attr(e, b"media-type").unwrap_or_default(),
                        });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ContainerError::Xml {
                    file: CONTAINER_XML,
                    message: e.to_string(),
                })
            }
            _ => {}
        }
    }
    if found.is_empty() {
        return Err(ContainerError::NoRootfile(CONTAINER_XML));
    }
    Ok(found)
}

/// Every `<EncryptedData>` entry that names both an algorithm and a
/// cipher reference.
pub fn encrypted_resources(xml: &str) -> Result<Vec<EncryptedResource>, ContainerError> {
    let mut reader = Reader::from_str(xml);
    let mut found = Vec::new();
    let mut algorithm: Option<String> = None;
    let mut uri: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"EncryptedData" => {
                    algorithm = None;
                    uri = None;
                }
                b"EncryptionMethod" => algorithm = attr(e, b"Algorithm"),
                b"CipherReference" => uri = attr(e, b"URI"),
                _ => {}
            },
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"EncryptedData" => {
                if let (Some(algorithm), Some(uri)) = (algorithm.take(), uri.take()) {
                    found.push(EncryptedResource { algorithm, uri });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ContainerError::Xml {
                    file: ENCRYPTION_XML,
                    message: e.to_string(),
                })
            }
            _ => {}
        }
    }
    Ok(found)
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rootfiles_in_order() {
        let xml = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="FOO/BAR/package.opf" media-type="application/oebps-package+xml"/>
    <rootfile full-path="other.pdf" media-type="application/pdf"/>
  </rootfiles>
</container>"#;
        let found = rootfiles(xml).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].full_path, "FOO/BAR/package.opf");
        assert_eq!(found[1].media_type, "application/pdf");
    }

    #[test]
    fn test_no_rootfile() {
        let err = rootfiles("<container><rootfiles/></container>").unwrap_err();
        assert!(matches!(err, ContainerError::NoRootfile(_)));
        let converted: ConvertError = err.into();
        assert_eq!(converted.component(), crate::PLUGIN_NAME);
    }

    #[test]
    fn test_encrypted_resources() {
        let xml = r#"<encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container"
            xmlns:enc="http://www.w3.org/2001/04/xmlenc#">
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.idpf.org/2008/embedding"/>
    <enc:CipherData><enc:CipherReference URI="OEBPS/fonts/a.otf"/></enc:CipherData>
  </enc:EncryptedData>
  <enc:EncryptedData>
    <enc:CipherData><enc:CipherReference URI="orphan.otf"/></enc:CipherData>
  </enc:EncryptedData>
</encryption>"#;
        let found = encrypted_resources(xml).unwrap();
        assert_eq!(
            found,
            vec![EncryptedResource {
                algorithm: "http://www.idpf.org/2008/embedding".to_string(),
                uri: "OEBPS/fonts/a.otf".to_string(),
            }]
        );
    }
}
