//! Text extraction from contract PDFs.
//!
//! Provider responses are reduced at the boundary to the closed
//! [`OcrOutput`] sum type; the pipeline only ever asks it for
//! [`text`](OcrOutput::text).
//!
//! | Provider | Config | How |
//! |----------|--------|-----|
//! | [`MistralOcr`] | `ocr.provider = "mistral"` | `POST /ocr` with a `document_url` (remote URL or inline data URI) |
//! | [`LocalPdfOcr`] | `ocr.provider = "local"` | `pdf-extract` on the document bytes, off the async runtime |

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::OcrConfig;
use crate::document::LoadedDocument;
use crate::error::{CallError, ErrorKind};

/// Extracted text as the provider shaped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcrOutput {
    /// One markdown/text block per page.
    Paged(Vec<String>),
    /// A single block for the whole document.
    Flat(String),
    /// The response carried no recognizable text.
    Failure(String),
}

impl OcrOutput {
    /// Document text, or `None` if nothing non-blank was extracted.
    pub fn text(&self) -> Option<String> {
        let text = match self {
            OcrOutput::Paged(pages) => pages
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n"),
            OcrOutput::Flat(text) => text.trim().to_string(),
            OcrOutput::Failure(_) => return None,
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

const TEXT_FIELDS: &[&str] = &["markdown", "text", "content"];

fn first_text_field(value: &serde_json::Value) -> Option<&str> {
    TEXT_FIELDS
        .iter()
        .filter_map(|field| value.get(*field).and_then(|v| v.as_str()))
        .find(|s| !s.trim().is_empty())
}

/// Reduce an OCR response body to [`OcrOutput`].
///
/// Tries `pages[].markdown|text|content` first, then the same fields at
/// the top level.
pub fn adapt_response(json: &serde_json::Value) -> OcrOutput {
    if let Some(pages) = json.get("pages").and_then(|p| p.as_array()) {
        let texts: Vec<String> = pages
            .iter()
            .filter_map(first_text_field)
            .map(str::to_string)
            .collect();
        if !texts.is_empty() {
            return OcrOutput::Paged(texts);
        }
    }

    match first_text_field(json) {
        Some(text) => OcrOutput::Flat(text.to_string()),
        None => OcrOutput::Failure("OCR response contained no text".to_string()),
    }
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Model identifier, also the rate-limit key.
    fn model_name(&self) -> &str;

    async fn process_document(&self, document: &LoadedDocument) -> Result<OcrOutput, CallError>;
}

/// Mistral OCR over HTTP. Requires `MISTRAL_API_KEY`.
pub struct MistralOcr {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl MistralOcr {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let api_key = std::env::var("MISTRAL_API_KEY")
            .map_err(|_| anyhow::anyhow!("MISTRAL_API_KEY not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl OcrProvider for MistralOcr {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn process_document(&self, document: &LoadedDocument) -> Result<OcrOutput, CallError> {
        let body = serde_json::json!({
            "model": self.model,
            "document": {
                "type": "document_url",
                "document_url": document.document_url(),
            },
            "include_image_base64": false,
        });

        let response = self
            .client
            .post(format!("{}/ocr", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;

        if !response.status().is_success() {
            return Err(CallError::from_response("Mistral", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;
        Ok(adapt_response(&json))
    }
}

/// Extracts embedded PDF text locally. No network, no scanned-image OCR.
pub struct LocalPdfOcr;

#[async_trait]
impl OcrProvider for LocalPdfOcr {
    fn model_name(&self) -> &str {
        "local-pdf"
    }

    async fn process_document(&self, document: &LoadedDocument) -> Result<OcrOutput, CallError> {
        let Some(bytes) = document.bytes.clone() else {
            return Err(CallError::new(
                ErrorKind::MalformedRequest,
                "document bytes unavailable for local PDF extraction",
            ));
        };

        Ok(extract_blocking(move || pdf_extract::extract_text_from_mem(&bytes)).await)
    }
}

/// Run a local extractor off the async threads.
///
/// Extraction is deterministic, so both an error and a panic inside the
/// parser are reported as a failed extraction rather than a retryable call
/// error.
async fn extract_blocking<F, E>(extract: F) -> OcrOutput
where
    F: FnOnce() -> std::result::Result<String, E> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    match tokio::task::spawn_blocking(extract).await {
        Ok(Ok(text)) => OcrOutput::Flat(text),
        Ok(Err(e)) => OcrOutput::Failure(format!("PDF extraction failed: {}", e)),
        Err(e) => OcrOutput::Failure(format!("PDF extraction aborted: {}", e)),
    }
}

pub fn create_ocr_provider(config: &OcrConfig) -> Result<Box<dyn OcrProvider>> {
    match config.provider.as_str() {
        "mistral" => Ok(Box::new(MistralOcr::new(config)?)),
        "local" => Ok(Box::new(LocalPdfOcr)),
        other => bail!("Unknown ocr provider: {}", other),
    }
}
