//! Batch clause analysis.
//!
//! All chunks that matched at least one statute section go to the chat
//! model in a single structured-output request. The model answers with
//! `{"found_clauses": [{"contract_content", "analysis"}]}`; an answer that
//! does not parse is treated as "no findings". Call failures are not
//! absorbed here and fail the job.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::chat::{estimate_prompt_tokens, ChatMessage, ChatModel, StructuredSchema};
use crate::error::CallError;
use crate::models::{Chunk, FoundClause, SimilarityCandidate};
use crate::resilient::ResilientClient;

/// Characters of a section's contextual text quoted in the prompt.
const CONTEXT_EXCERPT_CHARS: usize = 300;

pub const SYSTEM_PROMPT: &str = "You are a legal expert in German rental contract law (BGB) specializing in tenant protection. \
Your task is to identify ONLY genuinely problematic clauses that violate German tenant protections or are unfair/illegal. \
\n\n\
IMPORTANT CRITERIA - Only flag clauses that are:\n\
1. ILLEGAL: Violate mandatory BGB provisions (e.g., deposits >3 months, waivers of inalienable rights, void clauses under BGB §134)\n\
2. UNFAIR: Exploitative terms that disadvantage tenants unreasonably (BGB §307)\n\
3. SCAM-LIKE: Clearly designed to extract money or rights from tenants through deception\n\
\n\
DO NOT flag:\n\
- Standard legal clauses that comply with BGB\n\
- Reasonable restrictions (e.g., normal pet policies, standard maintenance responsibilities)\n\
- Standard rental terms (rent amount, duration, notice periods within legal limits)\n\
- Clauses that are merely unfavorable but still legal\n\
- Standard boilerplate language\n\
\n\
Be conservative: Only flag clauses that are clearly problematic under German law. \
When in doubt, do not flag the clause.";

const USER_PROMPT_INSTRUCTIONS: &str = "For each chunk, carefully evaluate whether it contains genuinely problematic clauses that violate German tenant protections.

ONLY include clauses that meet these strict criteria:
- The clause clearly violates a mandatory BGB provision (e.g., illegal deposit amounts, waivers of inalienable rights)
- The clause is exploitative and unfair under BGB §307 (unfair contract terms)
- The clause is designed to circumvent tenant protections in a scam-like manner

For each problematic clause found, provide:
1. Contract content: The exact text from the contract that is problematic
2. Analysis: A clear, professional explanation that includes:
   - Which specific BGB provision(s) are violated
   - Why the clause is illegal/unfair/exploitative
   - The legal basis for why this clause would be void or unenforceable
   - What the correct legal standard should be

If a chunk contains only standard, legal clauses that comply with BGB, do NOT include it in your response.

Return an empty array if no genuinely problematic clauses are found.";

/// A chunk with the statute sections it matched.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: Chunk,
    pub candidates: Vec<SimilarityCandidate>,
}

/// JSON schema of the structured answer.
pub fn analysis_schema() -> StructuredSchema {
    StructuredSchema {
        name: "batch_clause_analysis".to_string(),
        schema: serde_json::json!({
            "type": "object",
            "properties": {
                "found_clauses": {
                    "type": "array",
                    "description": "List of found clauses with their analysis",
                    "items": {
                        "type": "object",
                        "properties": {
                            "contract_content": {
                                "type": "string",
                                "description": "The contract text where the clause was found"
                            },
                            "analysis": {
                                "type": "string",
                                "description": "Analysis explaining the clause and its relation to BGB sections"
                            }
                        },
                        "required": ["contract_content", "analysis"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["found_clauses"],
            "additionalProperties": false
        }),
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Render the user prompt for all qualifying chunks.
pub fn build_user_prompt(chunks: &[RankedChunk], candidates_per_chunk: usize) -> String {
    let mut blocks = Vec::with_capacity(chunks.len());
    for (i, ranked) in chunks.iter().enumerate() {
        let n = i + 1;
        let heading = ranked
            .chunk
            .heading
            .clone()
            .unwrap_or_else(|| format!("Section {}", n));
        let sections = ranked
            .candidates
            .iter()
            .take(candidates_per_chunk)
            .map(|c| {
                format!(
                    "  - BGB {}: {}...",
                    c.section.section_number,
                    excerpt(&c.section.contextual_text, CONTEXT_EXCERPT_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        blocks.push(format!(
            "\nChunk {} - {}:\nContract Text:\n{}\n\nRelevant BGB Sections:\n{}\n",
            n, heading, ranked.chunk.text, sections
        ));
    }

    let all_chunks = format!("\n{}{}", "=".repeat(80), blocks.join("\n"));
    format!(
        "Analyze these contract chunks against the relevant BGB sections provided:\n\n{}\n\n{}",
        all_chunks, USER_PROMPT_INSTRUCTIONS
    )
}

/// Strip a surrounding markdown code fence (```` ```json ```` or ```` ``` ````).
pub fn strip_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    found_clauses: Vec<FoundClause>,
}

/// Parse the model's answer. Any parse failure yields no findings.
pub fn parse_findings(raw: &str) -> Vec<FoundClause> {
    let body = strip_fences(raw);
    if body.is_empty() {
        warn!("empty structured answer, treating as no findings");
        return Vec::new();
    }
    match serde_json::from_str::<AnalysisResponse>(body) {
        Ok(resp) => resp.found_clauses,
        Err(e) => {
            warn!("failed to parse structured answer ({}), treating as no findings", e);
            Vec::new()
        }
    }
}

pub struct BatchAnalyzer {
    chat: Arc<dyn ChatModel>,
    client: Arc<ResilientClient>,
    candidates_per_chunk: usize,
}

impl BatchAnalyzer {
    pub fn new(chat: Arc<dyn ChatModel>, client: Arc<ResilientClient>, candidates_per_chunk: usize) -> Self {
        Self {
            chat,
            client,
            candidates_per_chunk,
        }
    }

    /// Analyze all qualifying chunks in one request.
    pub async fn analyze(&self, chunks: &[RankedChunk]) -> Result<Vec<FoundClause>, CallError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_user_prompt(chunks, self.candidates_per_chunk)),
        ];
        let schema = analysis_schema();
        let estimate = estimate_prompt_tokens(&messages);

        let raw = self
            .client
            .execute_metered(self.chat.model_name(), estimate, || {
                self.chat.complete(&messages, &schema)
            })
            .await?;

        let clauses = parse_findings(&raw);
        info!(chunks = chunks.len(), clauses = clauses.len(), "batch analysis finished");
        Ok(clauses)
    }
}
