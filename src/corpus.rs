//! Statute corpus loading.
//!
//! Reads parsed statute sections from JSON, embeds the ones whose text
//! changed since the last load and upserts them into the store. The
//! embedded text carries the section's position in the statute:
//!
//! ```text
//! Buch 2: Recht der Schuldverhältnisse
//! Abschnitt 8: Einzelne Schuldverhältnisse
//! §535: Inhalt und Hauptpflichten des Mietvertrags
//! (1) Durch den Mietvertrag wird der Vermieter verpflichtet, …
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::{create_embedder, embed_batched, Embedder};
use crate::fingerprint::sha256_hex;
use crate::models::StatuteSection;
use crate::resilient::ResilientClient;
use crate::store::{SqliteStore, Store};
use crate::{db, migrate};

/// One section as produced by the statute parser.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSection {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub book: Option<String>,
    #[serde(default)]
    pub book_title: Option<String>,
    #[serde(default)]
    pub division: Option<String>,
    #[serde(default)]
    pub division_title: Option<String>,
    #[serde(default)]
    pub section_title: Option<String>,
    #[serde(default)]
    pub section_title_text: Option<String>,
}

/// Either a bare array of sections or `{ "sections": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum CorpusFile {
    Sections(Vec<RawSection>),
    Wrapped { sections: Vec<RawSection> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub total: usize,
    pub embedded: usize,
    pub skipped: usize,
    pub invalid: usize,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// The text embedded for a section. Empty when the section has no title
/// and no content.
pub fn contextual_text(section: &RawSection) -> String {
    let mut parts = Vec::new();

    if let (Some(book), Some(title)) = (non_empty(&section.book), non_empty(&section.book_title)) {
        parts.push(format!("Buch {}: {}", book, title));
    }
    if let (Some(division), Some(title)) = (
        non_empty(&section.division),
        non_empty(&section.division_title),
    ) {
        parts.push(format!("Abschnitt {}: {}", division, title));
    }
    if let (Some(number), Some(text)) = (
        non_empty(&section.section_title),
        non_empty(&section.section_title_text),
    ) {
        parts.push(format!("Titel {}: {}", number, text));
    }

    let title = non_empty(&section.title).unwrap_or_default();
    let content = non_empty(&section.content);
    if title.is_empty() && content.is_none() {
        return String::new();
    }
    if let Some(number) = non_empty(&section.number) {
        parts.push(format!("§{}: {}", number, title));
    }
    if let Some(content) = content {
        parts.push(content.to_string());
    }
    parts.join("\n")
}

/// Convert a raw section, or `None` if it has no number or no text.
pub fn to_statute_section(raw: &RawSection) -> Option<StatuteSection> {
    let number = non_empty(&raw.number)?.trim_start_matches('§').trim().to_string();
    if number.is_empty() {
        return None;
    }
    let text = contextual_text(raw);
    if text.is_empty() {
        return None;
    }
    Some(StatuteSection {
        section_number: number,
        book: non_empty(&raw.book).map(String::from),
        book_title: non_empty(&raw.book_title).map(String::from),
        division: non_empty(&raw.division).map(String::from),
        division_title: non_empty(&raw.division_title).map(String::from),
        title: non_empty(&raw.title).unwrap_or_default().to_string(),
        content: non_empty(&raw.content).unwrap_or_default().to_string(),
        checksum: sha256_hex(text.as_bytes()),
        contextual_text: text,
    })
}

pub fn parse_corpus(json: &str) -> Result<Vec<RawSection>> {
    let file: CorpusFile = serde_json::from_str(json).context("invalid corpus JSON")?;
    Ok(match file {
        CorpusFile::Sections(sections) => sections,
        CorpusFile::Wrapped { sections } => sections,
    })
}

/// Embed new or changed sections and upsert them.
pub async fn load_sections(
    store: &dyn Store,
    embedder: &dyn Embedder,
    client: &ResilientClient,
    raw: &[RawSection],
    batch_size: usize,
) -> Result<LoadReport> {
    let mut report = LoadReport {
        total: raw.len(),
        ..LoadReport::default()
    };

    let existing = store.section_checksums().await?;
    let mut pending = Vec::new();
    for item in raw {
        let Some(section) = to_statute_section(item) else {
            warn!(number = ?item.number, "skipping section without number or text");
            report.invalid += 1;
            continue;
        };
        if existing.get(&section.section_number) == Some(&section.checksum) {
            report.skipped += 1;
            continue;
        }
        pending.push(section);
    }

    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|s| s.contextual_text.clone()).collect();
        let vectors = embed_batched(embedder, client, &texts, texts.len()).await?;
        for (section, vector) in batch.iter().zip(&vectors) {
            store.upsert_section(section, vector).await?;
        }
        report.embedded += batch.len();
        info!(embedded = report.embedded, pending = pending.len(), "embedded statute sections");
    }

    Ok(report)
}

/// `corpus load <file>`.
pub async fn run_corpus_load(config: &Config, path: &Path) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;
    let raw = parse_corpus(&json)?;

    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let store = SqliteStore::new(pool);

    let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
    let client = ResilientClient::from_config(&config.resilience);

    let report = load_sections(
        &store,
        embedder.as_ref(),
        &client,
        &raw,
        config.embedding.batch_size,
    )
    .await?;

    println!("corpus load");
    println!("  total:    {}", report.total);
    println!("  embedded: {}", report.embedded);
    println!("  skipped:  {}", report.skipped);
    println!("  invalid:  {}", report.invalid);

    store.pool().close().await;
    Ok(())
}
