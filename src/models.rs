//! Core data models used throughout Clause Haus.
//!
//! These types represent the jobs, cache entries, chunks and statute
//! sections that flow through the analysis pipeline and the job protocol.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle state of a [`Job`].
///
/// ```text
/// awaiting_payment ──confirm──▶ running ──▶ completed | failed
/// processing ────────────────▶ running ──▶ completed | failed
/// (cache hit at creation) ───────────────▶ completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    AwaitingPayment,
    Processing,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::AwaitingPayment => "awaiting_payment",
            JobStatus::Processing => "processing",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "awaiting_payment" => JobStatus::AwaitingPayment,
            "processing" => JobStatus::Processing,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => bail!("unknown job status '{}'", other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Payment request created, funds not yet locked.
    Pending,
    /// Funds locked; processing may start.
    Confirmed,
    /// Result submitted to the payment service.
    Completed,
    /// Result submission failed. The job itself stays completed.
    CompletionFailed,
    /// The pay-by deadline passed without funds being locked.
    Expired,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Completed => "completed",
            PaymentStatus::CompletionFailed => "completion_failed",
            PaymentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pending" => PaymentStatus::Pending,
            "confirmed" => PaymentStatus::Confirmed,
            "completed" => PaymentStatus::Completed,
            "completion_failed" => PaymentStatus::CompletionFailed,
            "expired" => PaymentStatus::Expired,
            other => bail!("unknown payment status '{}'", other),
        })
    }
}

/// One key/value pair of a job's input payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputItem {
    pub key: String,
    pub value: String,
}

impl InputItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A submitted analysis job.
///
/// Once terminal, exactly one of `result` and `error` is set; both are
/// `None` before that. Use [`Job::complete`] and [`Job::fail`] to keep it so.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub identifier_from_purchaser: Option<String>,
    pub input_data: Vec<InputItem>,
    pub status: JobStatus,
    pub payment_ref: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    /// Hex fingerprint of the input document, when it could be computed.
    pub fingerprint: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn new(
        identifier_from_purchaser: Option<String>,
        input_data: Vec<InputItem>,
        status: JobStatus,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            identifier_from_purchaser,
            input_data,
            status,
            payment_ref: None,
            payment_status: None,
            fingerprint: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn complete(&mut self, result: String) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.updated_at = now_millis();
    }

    pub fn fail(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(error);
        self.updated_at = now_millis();
    }

    /// Whether the result/error fields agree with the status.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            JobStatus::Completed => self.result.is_some() && self.error.is_none(),
            JobStatus::Failed => self.result.is_none() && self.error.is_some(),
            _ => self.result.is_none() && self.error.is_none(),
        }
    }
}

/// A span of extracted contract text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub heading: Option<String>,
    /// Paragraph number of the heading (`3`, `4.1`, `II`), when it has one.
    pub section: Option<String>,
}

/// A clause the model flagged as illegal or unfair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundClause {
    pub contract_content: String,
    pub analysis: String,
}

/// Everything computed for one document, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub job_id: Uuid,
    pub chunks: Vec<Chunk>,
    pub embeddings: Vec<Vec<f32>>,
    pub clauses: Vec<FoundClause>,
    pub report: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

/// One section of the statute reference corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatuteSection {
    /// Section number without the `§` sign, e.g. `"535"` or `"556a"`.
    pub section_number: String,
    pub book: Option<String>,
    pub book_title: Option<String>,
    pub division: Option<String>,
    pub division_title: Option<String>,
    pub title: String,
    pub content: String,
    /// The text that was embedded for this section.
    pub contextual_text: String,
    /// SHA-256 of `contextual_text`.
    pub checksum: String,
}

/// A statute section and its cosine similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityCandidate {
    pub section: StatuteSection,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            JobStatus::AwaitingPayment,
            JobStatus::Processing,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("queued".parse::<JobStatus>().is_err());
        assert_eq!(
            "completion_failed".parse::<PaymentStatus>().unwrap(),
            PaymentStatus::CompletionFailed
        );
        assert_eq!(PaymentStatus::Expired.as_str().parse::<PaymentStatus>().unwrap(), PaymentStatus::Expired);
    }

    #[test]
    fn test_terminal_fields_are_exclusive() {
        let mut job = Job::new(None, vec![], JobStatus::Processing);
        assert!(job.is_consistent());

        job.fail("boom".into());
        assert!(job.is_consistent());
        assert_eq!(job.error.as_deref(), Some("boom"));

        job.complete("report".into());
        assert!(job.is_consistent());
        assert!(job.error.is_none());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::AwaitingPayment).unwrap();
        assert_eq!(json, "\"awaiting_payment\"");
    }
}
