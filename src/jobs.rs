//! Job lifecycle.
//!
//! ```text
//! submit ─┬─ cache hit ──────────────────────────────▶ completed
//!         ├─ payment gate ─▶ awaiting_payment ─confirm─▶ running ─▶ completed | failed
//!         └─ no gate ──────▶ processing ─────────────▶ running ─▶ completed | failed
//! ```
//!
//! Job state lives only in the [`Store`]. Every transition into `running`
//! is a compare-and-set, so a duplicate confirmation cannot run a job twice.
//! Once a job is running, every outcome (document, pipeline or storage
//! error, or a panic inside the pipeline) is written back as `completed` or
//! `failed`.
//!
//! Payment events arrive as [`PaymentEvent`]s on a channel owned by the
//! service. An expired payment fails its job. The only in-memory state is
//! the registry of active payment monitors, keyed by job id; an entry is
//! removed when its job finishes or expires, or once its monitor task has
//! exited.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::ContentCache;
use crate::config::Config;
use crate::document::{
    load_document, resolve_document_ref, DocumentFetcher, HttpFetcher, LoadedDocument,
};
use crate::fingerprint::{fingerprint_document, Fingerprint};
use crate::models::{now_millis, CacheEntry, InputItem, Job, JobStatus, PaymentStatus};
use crate::payment::{
    MasumiGateway, MonitorHandle, PaymentEvent, PaymentGateway, PaymentRequest,
};
use crate::pipeline::{ContractProcessor, Pipeline};
use crate::resilient::ResilientClient;
use crate::store::{SqliteStore, Store};
use crate::{db, migrate};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("input_data contains no PDF document (use key 'document' or 'pdf' with a data URI or URL)")]
    NoDocument,
    #[error("payment request failed: {0:#}")]
    Payment(anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of a submission.
#[derive(Debug, Clone, Serialize)]
pub struct JobSubmission {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub identifier_from_purchaser: Option<String>,
    pub payment: Option<PaymentRequest>,
}

/// What a status read reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            result: job.result.clone(),
            error: job.error.clone(),
            payment_status: job.payment_status,
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    cache: ContentCache,
    processor: Arc<dyn ContractProcessor>,
    fetcher: Arc<dyn DocumentFetcher>,
    payment: Option<Arc<dyn PaymentGateway>>,
    monitors: Mutex<HashMap<Uuid, MonitorHandle>>,
    payment_events: mpsc::UnboundedSender<PaymentEvent>,
}

/// Owns the job state machine. Cheap to clone.
#[derive(Clone)]
pub struct JobService {
    inner: Arc<Inner>,
}

impl JobService {
    /// Create the service and its confirmation dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn Store>,
        processor: Arc<dyn ContractProcessor>,
        fetcher: Arc<dyn DocumentFetcher>,
        payment: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            cache: ContentCache::new(store.clone()),
            store,
            processor,
            fetcher,
            payment,
            monitors: Mutex::new(HashMap::new()),
            payment_events: tx,
        });
        spawn_dispatcher(Arc::downgrade(&inner), rx);
        Self { inner }
    }

    /// Wire the service to the configured database and providers.
    ///
    /// The payment gate is installed only when `gated` is set and a
    /// `[payment]` section exists.
    pub async fn from_config(config: &Config, gated: bool) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

        let client = Arc::new(ResilientClient::from_config(&config.resilience));
        let pipeline = Pipeline::from_config(config, store.clone(), client)?;
        let fetcher = HttpFetcher::new(Duration::from_secs(config.ocr.timeout_secs))?;

        let payment: Option<Arc<dyn PaymentGateway>> = match &config.payment {
            Some(payment) if gated => Some(Arc::new(MasumiGateway::new(payment)?)),
            _ => None,
        };

        Ok(Self::new(store, Arc::new(pipeline), Arc::new(fetcher), payment))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn is_payment_gated(&self) -> bool {
        self.inner.payment.is_some()
    }

    /// Sender for payment events, e.g. for a webhook.
    pub fn payment_events(&self) -> mpsc::UnboundedSender<PaymentEvent> {
        self.inner.payment_events.clone()
    }

    /// Number of payment monitors still running or awaiting an event.
    pub fn active_monitors(&self) -> usize {
        let mut monitors = self.monitors();
        prune_finished(&mut monitors);
        monitors.len()
    }

    fn monitors(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, MonitorHandle>> {
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_monitor(&self, job_id: Uuid) {
        let handle = self.monitors().remove(&job_id);
        if let Some(handle) = handle {
            handle.release();
        }
    }

    /// Submit a new job.
    ///
    /// A cached document completes immediately. Otherwise the job waits for
    /// payment, or starts processing in the background when no payment gate
    /// is configured.
    pub async fn submit(
        &self,
        identifier_from_purchaser: Option<String>,
        input_data: Vec<InputItem>,
    ) -> Result<JobSubmission, JobError> {
        let reference = resolve_document_ref(&input_data).ok_or(JobError::NoDocument)?;
        let document = load_document(reference, self.inner.fetcher.as_ref()).await;
        let fingerprint = fingerprint_document(&document);
        if fingerprint.degraded {
            warn!(fingerprint = %fingerprint.hex, "document bytes unavailable, caching disabled for this job");
        }

        let cached = match self.inner.cache.lookup(&fingerprint).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(fingerprint = %fingerprint.hex, "cache lookup failed, treating as miss: {:#}", e);
                None
            }
        };

        if let Some(entry) = cached {
            let mut job = Job::new(identifier_from_purchaser, input_data, JobStatus::Completed);
            job.fingerprint = Some(fingerprint.hex.clone());
            job.complete(entry.report);
            self.inner.store.insert_job(&job).await?;
            info!(job_id = %job.id, fingerprint = %fingerprint.hex, "cache hit, job completed at submission");
            return Ok(submission(&job, None));
        }

        match self.inner.payment.clone() {
            Some(gateway) => {
                self.submit_gated(gateway, identifier_from_purchaser, input_data, fingerprint)
                    .await
            }
            None => {
                let mut job = Job::new(identifier_from_purchaser, input_data, JobStatus::Processing);
                job.fingerprint = Some(fingerprint.hex.clone());
                self.inner.store.insert_job(&job).await?;
                info!(job_id = %job.id, "job created, processing without payment gate");

                let service = self.clone();
                let job_id = job.id;
                tokio::spawn(async move {
                    service
                        .execute_job(job_id, JobStatus::Processing, Some(document))
                        .await;
                });
                Ok(submission(&job, None))
            }
        }
    }

    async fn submit_gated(
        &self,
        gateway: Arc<dyn PaymentGateway>,
        identifier_from_purchaser: Option<String>,
        input_data: Vec<InputItem>,
        fingerprint: Fingerprint,
    ) -> Result<JobSubmission, JobError> {
        let request = gateway
            .create_payment_request(identifier_from_purchaser.as_deref(), &input_data)
            .await
            .map_err(JobError::Payment)?;

        let mut job = Job::new(identifier_from_purchaser, input_data, JobStatus::AwaitingPayment);
        job.fingerprint = Some(fingerprint.hex);
        job.payment_ref = Some(request.reference.clone());
        job.payment_status = Some(PaymentStatus::Pending);
        self.inner.store.insert_job(&job).await?;

        match gateway.subscribe(&request, self.payment_events()).await {
            Ok(handle) => {
                let mut monitors = self.monitors();
                prune_finished(&mut monitors);
                monitors.insert(job.id, handle);
            }
            Err(e) => {
                let message = format!("payment monitor could not be started: {:#}", e);
                error!(job_id = %job.id, payment_ref = %request.reference, "{}", message);
                job.fail(message);
                self.inner.store.update_job(&job).await?;
                return Err(JobError::Payment(e));
            }
        }

        info!(job_id = %job.id, payment_ref = %request.reference, "job awaiting payment");
        Ok(submission(&job, Some(request)))
    }

    /// Handle a payment confirmation for `reference`.
    ///
    /// Unknown references and jobs no longer awaiting payment are ignored.
    pub async fn on_payment_confirmed(&self, reference: &str) {
        let job = match self.inner.store.find_job_by_payment(reference).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(payment_ref = %reference, "confirmation for unknown payment, ignoring");
                return;
            }
            Err(e) => {
                error!(payment_ref = %reference, "could not look up job for payment: {:#}", e);
                return;
            }
        };

        if job.status != JobStatus::AwaitingPayment {
            info!(
                job_id = %job.id,
                payment_ref = %reference,
                status = %job.status,
                "confirmation for job not awaiting payment, ignoring"
            );
            return;
        }

        info!(job_id = %job.id, payment_ref = %reference, "payment confirmed");
        self.execute_job(job.id, JobStatus::AwaitingPayment, None).await;
    }

    /// Handle the pay-by deadline passing for `reference`.
    ///
    /// A job still awaiting payment is failed with payment status
    /// `expired`. A job that already left `awaiting_payment` is untouched.
    pub async fn on_payment_expired(&self, reference: &str) {
        let job = match self.inner.store.find_job_by_payment(reference).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(payment_ref = %reference, "expiry for unknown payment, ignoring");
                return;
            }
            Err(e) => {
                error!(payment_ref = %reference, "could not look up job for payment: {:#}", e);
                return;
            }
        };
        self.release_monitor(job.id);

        // Claiming the job first keeps a late confirmation from running it.
        match self
            .inner
            .store
            .transition_job(job.id, JobStatus::AwaitingPayment, JobStatus::Running)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job.id, payment_ref = %reference, "expiry for job not awaiting payment, ignoring");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, "could not claim expired job: {:#}", e);
                return;
            }
        }

        let mut job = job;
        job.payment_status = Some(PaymentStatus::Expired);
        job.fail("payment was not received before the pay-by deadline".to_string());
        if let Err(e) = self.inner.store.update_job(&job).await {
            error!(job_id = %job.id, "could not persist payment expiry: {:#}", e);
            return;
        }
        warn!(job_id = %job.id, payment_ref = %reference, "payment expired, job failed");
    }

    /// Run a job from `from` through `running` to a terminal state.
    ///
    /// `document` is reloaded from the job's input when not supplied.
    async fn execute_job(&self, job_id: Uuid, from: JobStatus, document: Option<LoadedDocument>) {
        let claimed = match self
            .inner
            .store
            .transition_job(job_id, from, JobStatus::Running)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(job_id = %job_id, "could not mark job running: {:#}", e);
                self.release_monitor(job_id);
                return;
            }
        };
        if !claimed {
            info!(job_id = %job_id, from = %from, "job already left {}, not running it", from);
            return;
        }
        info!(job_id = %job_id, "job running");

        // The pipeline runs in its own task so a panic still reaches `finish`.
        let service = self.clone();
        let task = tokio::spawn(async move { service.run(job_id, document).await });
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(anyhow!("analysis aborted: {}", e)),
        };
        self.finish(job_id, outcome).await;
        self.release_monitor(job_id);
    }

    /// Produce the report for a running job.
    async fn run(&self, job_id: Uuid, document: Option<LoadedDocument>) -> anyhow::Result<String> {
        let mut job = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {} vanished while running", job_id))?;

        if job.payment_ref.is_some() {
            job.payment_status = Some(PaymentStatus::Confirmed);
            self.inner.store.update_job(&job).await?;
        }

        let document = match document {
            Some(document) => document,
            None => {
                let reference =
                    resolve_document_ref(&job.input_data).ok_or(JobError::NoDocument)?;
                load_document(reference, self.inner.fetcher.as_ref()).await
            }
        };
        let fingerprint = fingerprint_document(&document);

        // Another job may have finished the same document meanwhile.
        if let Some(entry) = self.inner.cache.lookup(&fingerprint).await? {
            info!(job_id = %job_id, fingerprint = %fingerprint.hex, "reusing cached analysis");
            return Ok(entry.report);
        }

        let output = self.inner.processor.process(&document).await?;

        let now = now_millis();
        let entry = CacheEntry {
            fingerprint: fingerprint.hex.clone(),
            job_id,
            chunks: output.chunks,
            embeddings: output.embeddings,
            clauses: output.clauses,
            report: output.report,
            created_at: now,
            last_accessed_at: now,
        };
        let stored = self
            .inner
            .cache
            .store_if_absent(&fingerprint, entry)
            .await
            .context("failed to store analysis in cache")?;
        Ok(stored.entry.report)
    }

    /// Persist the terminal state and settle the payment.
    async fn finish(&self, job_id: Uuid, outcome: anyhow::Result<String>) {
        let mut job = match self.inner.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %job_id, "job vanished before its outcome could be recorded");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, "could not load job to record outcome: {:#}", e);
                return;
            }
        };

        match outcome {
            Ok(report) => job.complete(report),
            Err(e) => {
                error!(job_id = %job_id, "job failed: {:#}", e);
                job.fail(format!("{:#}", e));
            }
        }

        if let Err(e) = self.inner.store.update_job(&job).await {
            error!(job_id = %job_id, "could not persist job outcome: {:#}", e);
            job.fail(format!("failed to persist job result: {:#}", e));
            if let Err(e) = self.inner.store.update_job(&job).await {
                error!(job_id = %job_id, "could not persist job failure either: {:#}", e);
            }
            return;
        }

        if job.status == JobStatus::Completed {
            info!(job_id = %job_id, "job completed");
            self.settle_payment(&mut job).await;
        }
    }

    async fn settle_payment(&self, job: &mut Job) {
        let (Some(gateway), Some(reference), Some(result)) = (
            self.inner.payment.as_ref(),
            job.payment_ref.clone(),
            job.result.clone(),
        ) else {
            return;
        };

        job.payment_status = Some(match gateway.complete(&reference, &result).await {
            Ok(()) => PaymentStatus::Completed,
            Err(e) => {
                warn!(job_id = %job.id, payment_ref = %reference, "could not complete payment: {:#}", e);
                PaymentStatus::CompletionFailed
            }
        });
        if let Err(e) = self.inner.store.update_job(job).await {
            error!(job_id = %job.id, "could not persist payment status: {:#}", e);
        }
    }

    /// Current status of a job. Never waits for completion.
    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusView, JobError> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        Ok(JobStatusView::from(&job))
    }

    /// Poll until the job is terminal or `timeout` elapses.
    pub async fn wait_until_terminal(
        &self,
        job_id: Uuid,
        timeout: Duration,
    ) -> Result<JobStatusView, JobError> {
        let poll = async {
            loop {
                let view = self.status(job_id).await?;
                if view.status.is_terminal() {
                    return Ok::<_, JobError>(view);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Internal(anyhow!(
                "job {} did not finish within {:?}",
                job_id,
                timeout
            ))),
        }
    }
}

fn submission(job: &Job, payment: Option<PaymentRequest>) -> JobSubmission {
    JobSubmission {
        job_id: job.id,
        status: job.status,
        identifier_from_purchaser: job.identifier_from_purchaser.clone(),
        payment,
    }
}

fn prune_finished(monitors: &mut HashMap<Uuid, MonitorHandle>) {
    monitors.retain(|_, handle| !handle.is_finished());
}

/// Forward payment events to the service for as long as it exists.
fn spawn_dispatcher(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<PaymentEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let service = JobService { inner };
            tokio::spawn(async move {
                match event {
                    PaymentEvent::Confirmed { reference } => {
                        service.on_payment_confirmed(&reference).await
                    }
                    PaymentEvent::Expired { reference } => {
                        service.on_payment_expired(&reference).await
                    }
                }
            });
        }
    });
}
