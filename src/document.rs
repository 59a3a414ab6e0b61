//! Locating and loading the contract document named in a job's input.
//!
//! A job carries its PDF either inline as a base64 data URI or as an
//! http(s) URL. [`resolve_document_ref`] picks the reference out of the
//! key/value payload and [`load_document`] turns it into bytes where
//! possible. A document whose bytes cannot be obtained is still usable by
//! OCR providers that fetch URLs themselves, but its fingerprint is
//! degraded (see [`crate::fingerprint`]).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tracing::warn;

use crate::error::CallError;
use crate::models::InputItem;

pub const PDF_DATA_URI_PREFIX: &str = "data:application/pdf;base64,";

/// Keys checked first, in order, when looking for the document.
const DOCUMENT_KEYS: &[&str] = &["document", "pdf", "file", "contract"];

/// Where a job's document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentRef {
    /// Raw bytes, e.g. a local file passed to `analyze`.
    Bytes(Vec<u8>),
    /// A `data:` URI or bare base64 string.
    Inline(String),
    /// An http(s) URL.
    Url(String),
}

impl DocumentRef {
    /// The literal the job supplied, as used for degraded fingerprints.
    pub fn literal(&self) -> Option<&str> {
        match self {
            DocumentRef::Bytes(_) => None,
            DocumentRef::Inline(s) | DocumentRef::Url(s) => Some(s),
        }
    }

    fn classify(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.starts_with("data:") {
            Some(DocumentRef::Inline(value.to_string()))
        } else if value.starts_with("http://") || value.starts_with("https://") {
            Some(DocumentRef::Url(value.to_string()))
        } else {
            None
        }
    }
}

/// Find the document reference in a job's input payload.
///
/// A value under one of the well-known keys (`document`, `pdf`, `file`,
/// `contract`, case-insensitive) wins; a non-URI value there is taken as
/// bare base64. Otherwise the first value that is a data URI or URL is
/// used.
pub fn resolve_document_ref(items: &[InputItem]) -> Option<DocumentRef> {
    for key in DOCUMENT_KEYS {
        let found = items
            .iter()
            .find(|item| item.key.eq_ignore_ascii_case(key) && !item.value.trim().is_empty());
        if let Some(item) = found {
            return Some(
                DocumentRef::classify(&item.value)
                    .unwrap_or_else(|| DocumentRef::Inline(item.value.trim().to_string())),
            );
        }
    }
    items.iter().find_map(|item| DocumentRef::classify(&item.value))
}

/// Decode a `data:` URI (or bare base64 string) into bytes.
pub fn decode_inline(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match value.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(""),
        None => value,
    };
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(cleaned)
}

pub fn encode_data_uri(bytes: &[u8]) -> String {
    format!(
        "{}{}",
        PDF_DATA_URI_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Downloads documents referenced by URL.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CallError>;
}

/// [`DocumentFetcher`] over plain HTTP GET.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CallError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;
        if !resp.status().is_success() {
            return Err(CallError::from_response("document download", resp).await);
        }
        let bytes = resp.bytes().await.map_err(|e| CallError::from_reqwest(&e))?;
        Ok(bytes.to_vec())
    }
}

/// A document reference together with its bytes, when obtainable.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub reference: DocumentRef,
    pub bytes: Option<Vec<u8>>,
}

impl LoadedDocument {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            reference: DocumentRef::Bytes(bytes.clone()),
            bytes: Some(bytes),
        }
    }

    /// The URL handed to URL-based OCR providers.
    ///
    /// Remote documents keep their URL; everything else is sent inline.
    pub fn document_url(&self) -> String {
        match (&self.reference, &self.bytes) {
            (DocumentRef::Url(url), _) => url.clone(),
            (_, Some(bytes)) => encode_data_uri(bytes),
            (DocumentRef::Inline(literal), None) => literal.clone(),
            (DocumentRef::Bytes(bytes), None) => encode_data_uri(bytes),
        }
    }
}

/// Obtain the bytes behind `reference`.
///
/// Never fails: undecodable inline data and failed downloads yield a
/// document without bytes.
pub async fn load_document(reference: DocumentRef, fetcher: &dyn DocumentFetcher) -> LoadedDocument {
    let bytes = match &reference {
        DocumentRef::Bytes(bytes) => Some(bytes.clone()),
        DocumentRef::Inline(value) => match decode_inline(value) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("inline document is not valid base64: {}", e);
                None
            }
        },
        DocumentRef::Url(url) => match fetcher.fetch(url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(url = %url, "document download failed: {}", e);
                None
            }
        },
    };
    LoadedDocument { reference, bytes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_key_wins() {
        let items = vec![
            InputItem::new("note", "https://example.com/other.pdf"),
            InputItem::new("PDF", "https://example.com/contract.pdf"),
        ];
        assert_eq!(
            resolve_document_ref(&items),
            Some(DocumentRef::Url("https://example.com/contract.pdf".into()))
        );
    }

    #[test]
    fn test_any_uri_value_is_accepted() {
        let items = vec![
            InputItem::new("language", "de"),
            InputItem::new("upload", "data:application/pdf;base64,JVBERi0="),
        ];
        assert!(matches!(
            resolve_document_ref(&items),
            Some(DocumentRef::Inline(_))
        ));
        assert_eq!(resolve_document_ref(&[InputItem::new("language", "de")]), None);
    }

    #[test]
    fn test_decode_inline_forms() {
        assert_eq!(decode_inline("data:application/pdf;base64,aGk=").unwrap(), b"hi");
        assert_eq!(decode_inline("aGk=").unwrap(), b"hi");
        assert_eq!(decode_inline("aG\nk=").unwrap(), b"hi");
        assert!(decode_inline("data:application/pdf;base64,@@@").is_err());
    }

    #[test]
    fn test_document_url() {
        let doc = LoadedDocument::from_bytes(b"hi".to_vec());
        assert_eq!(doc.document_url(), "data:application/pdf;base64,aGk=");

        let remote = LoadedDocument {
            reference: DocumentRef::Url("https://example.com/a.pdf".into()),
            bytes: Some(b"hi".to_vec()),
        };
        assert_eq!(remote.document_url(), "https://example.com/a.pdf");
    }
}
