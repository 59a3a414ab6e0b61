//! Contract analysis pipeline.
//!
//! ```text
//! PDF ─▶ OCR ─▶ chunk ─▶ embed (batched) ─▶ rank per chunk ─▶ batch analysis ─▶ report
//! ```
//!
//! Every external call (OCR, embeddings, chat) goes through the shared
//! [`ResilientClient`]. Chunks without a statute candidate above the floor
//! are dropped before analysis; if none remain, no chat request is made and
//! the empty-findings report is produced.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::analyzer::{BatchAnalyzer, RankedChunk};
use crate::chat::{create_chat_model, ChatModel};
use crate::chunk::Chunker;
use crate::config::Config;
use crate::document::LoadedDocument;
use crate::embedding::{create_embedder, embed_batched, Embedder};
use crate::error::CallError;
use crate::models::{Chunk, FoundClause};
use crate::ocr::{create_ocr_provider, OcrOutput, OcrProvider};
use crate::ranker::Ranker;
use crate::report::render_report;
use crate::resilient::ResilientClient;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no text extracted from PDF")]
    NoTextExtracted,
    #[error("{stage} failed: {error}")]
    Provider { stage: &'static str, error: CallError },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    fn provider(stage: &'static str) -> impl FnOnce(CallError) -> Self {
        move |error| PipelineError::Provider { stage, error }
    }

    /// The classified provider failure, if that is what this is.
    pub fn call_error(&self) -> Option<&CallError> {
        match self {
            PipelineError::Provider { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Everything one pipeline run produced; cached as a whole.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub report: String,
    pub chunks: Vec<Chunk>,
    pub embeddings: Vec<Vec<f32>>,
    pub clauses: Vec<FoundClause>,
}

/// Turns a contract document into a report.
#[async_trait]
pub trait ContractProcessor: Send + Sync {
    async fn process(&self, document: &LoadedDocument) -> Result<PipelineOutput, PipelineError>;
}

pub struct Pipeline {
    ocr: Arc<dyn OcrProvider>,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    embed_batch_size: usize,
    ranker: Ranker,
    analyzer: BatchAnalyzer,
    client: Arc<ResilientClient>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ocr: Arc<dyn OcrProvider>,
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        embed_batch_size: usize,
        ranker: Ranker,
        chat: Arc<dyn ChatModel>,
        candidates_per_chunk: usize,
        client: Arc<ResilientClient>,
    ) -> Self {
        Self {
            ocr,
            chunker,
            embedder,
            embed_batch_size,
            ranker,
            analyzer: BatchAnalyzer::new(chat, client.clone(), candidates_per_chunk),
            client,
        }
    }

    /// Build the pipeline and its providers from configuration.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn Store>,
        client: Arc<ResilientClient>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(
            Arc::from(create_ocr_provider(&config.ocr)?),
            Chunker::from_config(&config.chunking),
            Arc::from(create_embedder(&config.embedding)?),
            config.embedding.batch_size,
            Ranker::from_config(store, &config.retrieval),
            Arc::from(create_chat_model(&config.chat)?),
            config.retrieval.prompt_candidates,
            client,
        ))
    }

    async fn extract_text(&self, document: &LoadedDocument) -> Result<String, PipelineError> {
        let ocr = self.ocr.clone();
        let output = self
            .client
            .execute(ocr.model_name(), 1, || ocr.process_document(document))
            .await
            .map_err(PipelineError::provider("OCR"))?;

        if let OcrOutput::Failure(reason) = &output {
            warn!("OCR returned no usable text: {}", reason);
        }
        output.text().ok_or(PipelineError::NoTextExtracted)
    }
}

#[async_trait]
impl ContractProcessor for Pipeline {
    async fn process(&self, document: &LoadedDocument) -> Result<PipelineOutput, PipelineError> {
        let text = self.extract_text(document).await?;
        info!(chars = text.chars().count(), "extracted contract text");

        let chunks = self.chunker.chunk(&text);
        info!(chunks = chunks.len(), "chunked contract");

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = embed_batched(
            self.embedder.as_ref(),
            &self.client,
            &texts,
            self.embed_batch_size,
        )
        .await
        .map_err(PipelineError::provider("embedding"))?;

        let mut ranked = Vec::new();
        for (chunk, embedding) in chunks.iter().zip(&embeddings) {
            let candidates = self.ranker.rank(embedding).await?;
            if !candidates.is_empty() {
                ranked.push(RankedChunk {
                    chunk: chunk.clone(),
                    candidates,
                });
            }
        }
        info!(
            relevant = ranked.len(),
            total = chunks.len(),
            "ranked chunks against statute corpus"
        );

        let clauses = if ranked.is_empty() {
            Vec::new()
        } else {
            self.analyzer
                .analyze(&ranked)
                .await
                .map_err(PipelineError::provider("analysis"))?
        };

        Ok(PipelineOutput {
            report: render_report(&clauses),
            chunks,
            embeddings,
            clauses,
        })
    }
}
