//! Content fingerprints for the analysis cache.
//!
//! A fingerprint is the lower-case hex SHA-256 of the document bytes, so the
//! same PDF hashes identically whether it arrived inline or by URL. When the
//! bytes are unavailable the literal reference string is hashed instead and
//! the fingerprint is marked degraded; degraded fingerprints never touch the
//! cache.

use sha2::{Digest, Sha256};

use crate::document::LoadedDocument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hex: String,
    pub degraded: bool,
}

impl Fingerprint {
    /// Usable as a cache key.
    pub fn is_cacheable(&self) -> bool {
        !self.degraded
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    Fingerprint {
        hex: sha256_hex(bytes),
        degraded: false,
    }
}

pub fn fingerprint_document(doc: &LoadedDocument) -> Fingerprint {
    match (&doc.bytes, doc.reference.literal()) {
        (Some(bytes), _) => fingerprint_bytes(bytes),
        (None, Some(literal)) => Fingerprint {
            hex: sha256_hex(literal.as_bytes()),
            degraded: true,
        },
        (None, None) => Fingerprint {
            hex: sha256_hex(&[]),
            degraded: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{decode_inline, DocumentRef};

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_stable_across_transport_encodings() {
        let bytes = b"%PDF-1.4 contract".to_vec();
        let uri = crate::document::encode_data_uri(&bytes);

        let direct = fingerprint_document(&LoadedDocument::from_bytes(bytes.clone()));
        let inline = fingerprint_document(&LoadedDocument {
            bytes: decode_inline(&uri).ok(),
            reference: DocumentRef::Inline(uri),
        });
        let remote = fingerprint_document(&LoadedDocument {
            reference: DocumentRef::Url("https://example.com/c.pdf".into()),
            bytes: Some(bytes),
        });

        assert_eq!(direct, inline);
        assert_eq!(direct, remote);
        assert!(direct.is_cacheable());
    }

    #[test]
    fn test_unavailable_bytes_are_degraded() {
        let fp = fingerprint_document(&LoadedDocument {
            reference: DocumentRef::Url("https://example.com/gone.pdf".into()),
            bytes: None,
        });
        assert!(fp.degraded);
        assert_eq!(fp.hex, sha256_hex(b"https://example.com/gone.pdf"));
        assert!(!fp.is_cacheable());
    }
}
