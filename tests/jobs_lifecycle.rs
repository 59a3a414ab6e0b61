use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use clause_haus::document::{encode_data_uri, DocumentFetcher, LoadedDocument};
use clause_haus::error::{CallError, ErrorKind};
use clause_haus::fingerprint::{fingerprint_bytes, sha256_hex};
use clause_haus::jobs::{JobError, JobService, JobStatusView};
use clause_haus::models::{FoundClause, InputItem, JobStatus, PaymentStatus};
use clause_haus::payment::{MonitorHandle, PaymentEvent, PaymentGateway, PaymentRequest};
use clause_haus::pipeline::{ContractProcessor, PipelineError, PipelineOutput};
use clause_haus::report::render_report;
use clause_haus::store::{InMemoryStore, Store};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

// ============ Fakes ============

/// Counts runs; each run reports its own run number.
struct FakeProcessor {
    calls: AtomicUsize,
    delay: Duration,
    fail_with: Option<CallError>,
    panics: bool,
}

impl FakeProcessor {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_with: None,
            panics: false,
        }
    }

    fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::ok()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::ok()
        }
    }

    fn failing(error: CallError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::ok()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContractProcessor for FakeProcessor {
    async fn process(&self, _document: &LoadedDocument) -> Result<PipelineOutput, PipelineError> {
        let run = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics {
            panic!("provider response could not be interpreted");
        }
        if let Some(error) = &self.fail_with {
            return Err(PipelineError::Provider {
                stage: "analysis",
                error: error.clone(),
            });
        }
        let clauses = vec![FoundClause {
            contract_content: format!("Klausel aus Lauf {}", run),
            analysis: "Unwirksam nach §309 BGB".to_string(),
        }];
        Ok(PipelineOutput {
            report: render_report(&clauses),
            chunks: vec![],
            embeddings: vec![],
            clauses,
        })
    }
}

struct NoFetch;

#[async_trait]
impl DocumentFetcher for NoFetch {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CallError> {
        Err(CallError::new(ErrorKind::Network, format!("offline: {}", url)))
    }
}

/// Serves the same bytes for every URL.
struct FixedFetch {
    bytes: Vec<u8>,
    fetched: AtomicUsize,
}

#[async_trait]
impl DocumentFetcher for FixedFetch {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, CallError> {
        self.fetched.fetch_add(1, Ordering::SeqCst);
        Ok(self.bytes.clone())
    }
}

#[derive(Default)]
struct FakeGateway {
    fail_create: bool,
    fail_complete: bool,
    /// Monitor tasks exit right away without reporting anything.
    short_lived_monitors: bool,
    created: AtomicUsize,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<PaymentEvent>)>>,
    completed: Mutex<Vec<String>>,
}

impl FakeGateway {
    /// Simulate funds being locked for every open request.
    fn confirm_all(&self) {
        for (reference, tx) in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(PaymentEvent::Confirmed {
                reference: reference.clone(),
            });
        }
    }

    /// Simulate the pay-by deadline passing for every open request.
    fn expire_all(&self) {
        for (reference, tx) in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(PaymentEvent::Expired {
                reference: reference.clone(),
            });
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment_request(
        &self,
        _identifier_from_purchaser: Option<&str>,
        _input_data: &[InputItem],
    ) -> Result<PaymentRequest> {
        if self.fail_create {
            bail!("payment service unreachable");
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentRequest {
            reference: format!("pay-{}", n),
            pay_by_time: None,
            submit_result_time: None,
            unlock_time: None,
            external_dispute_unlock_time: None,
            amounts: vec![],
            input_hash: "hash".to_string(),
            agent_identifier: "agent-1".to_string(),
            seller_vkey: None,
        })
    }

    async fn subscribe(
        &self,
        request: &PaymentRequest,
        events: mpsc::UnboundedSender<PaymentEvent>,
    ) -> Result<MonitorHandle> {
        self.subscribers
            .lock()
            .unwrap()
            .push((request.reference.clone(), events));
        if self.short_lived_monitors {
            return Ok(MonitorHandle::new(tokio::spawn(async {})));
        }
        Ok(MonitorHandle::detached())
    }

    async fn complete(&self, reference: &str, _result: &str) -> Result<()> {
        if self.fail_complete {
            bail!("submit-result rejected");
        }
        self.completed.lock().unwrap().push(reference.to_string());
        Ok(())
    }
}

// ============ Helpers ============

fn pdf_bytes(tag: &str) -> Vec<u8> {
    format!("%PDF-1.4\n% {}\n%%EOF", tag).into_bytes()
}

fn input(bytes: &[u8]) -> Vec<InputItem> {
    vec![InputItem::new("document", encode_data_uri(bytes))]
}

fn service(processor: Arc<FakeProcessor>, gateway: Option<Arc<FakeGateway>>) -> JobService {
    service_with_fetcher(processor, Arc::new(NoFetch), gateway)
}

fn service_with_fetcher(
    processor: Arc<FakeProcessor>,
    fetcher: Arc<dyn DocumentFetcher>,
    gateway: Option<Arc<FakeGateway>>,
) -> JobService {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
    JobService::new(
        store,
        processor,
        fetcher,
        gateway.map(|g| g as Arc<dyn PaymentGateway>),
    )
}

async fn wait_for_monitors(jobs: &JobService, expected: usize) {
    for _ in 0..100 {
        if jobs.active_monitors() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(jobs.active_monitors(), expected);
}

/// Poll the job until `pred` holds.
async fn wait_for(
    jobs: &JobService,
    job_id: Uuid,
    pred: impl Fn(&JobStatusView) -> bool,
) -> JobStatusView {
    for _ in 0..250 {
        let view = jobs.status(job_id).await.unwrap();
        if pred(&view) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached for job {}", job_id);
}

// ============ Without payment gate ============

#[tokio::test]
async fn test_job_runs_to_completion() {
    let processor = Arc::new(FakeProcessor::ok());
    let jobs = service(processor.clone(), None);

    let submission = jobs
        .submit(Some("buyer-7".into()), input(&pdf_bytes("a")))
        .await
        .unwrap();
    assert_eq!(submission.status, JobStatus::Processing);
    assert_eq!(submission.identifier_from_purchaser.as_deref(), Some("buyer-7"));
    assert!(submission.payment.is_none());

    let view = jobs.wait_until_terminal(submission.job_id, WAIT).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert!(view.result.unwrap().contains("Klausel aus Lauf 1"));
    assert!(view.error.is_none());
    assert_eq!(processor.calls(), 1);

    let job = jobs.store().get_job(submission.job_id).await.unwrap().unwrap();
    assert!(job.is_consistent());
    assert_eq!(job.fingerprint, Some(fingerprint_bytes(&pdf_bytes("a")).hex));
}

#[tokio::test]
async fn test_same_document_is_analyzed_once() {
    let processor = Arc::new(FakeProcessor::ok());
    let jobs = service(processor.clone(), None);
    let bytes = pdf_bytes("lease");

    let first = jobs.submit(None, input(&bytes)).await.unwrap();
    let first = jobs.wait_until_terminal(first.job_id, WAIT).await.unwrap();

    // Bare base64 under another key is the same document.
    let bare = encode_data_uri(&bytes)
        .trim_start_matches("data:application/pdf;base64,")
        .to_string();
    let second = jobs
        .submit(None, vec![InputItem::new("pdf", bare)])
        .await
        .unwrap();
    assert_eq!(second.status, JobStatus::Completed);

    let second = jobs.status(second.job_id).await.unwrap();
    assert_eq!(second.result, first.result);
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_jobs_share_one_report() {
    let processor = Arc::new(FakeProcessor::slow(Duration::from_millis(100)));
    let jobs = service(processor.clone(), None);
    let bytes = pdf_bytes("race");

    let a = jobs.submit(None, input(&bytes)).await.unwrap();
    let b = jobs.submit(None, input(&bytes)).await.unwrap();
    assert_ne!(a.job_id, b.job_id);

    let a = jobs.wait_until_terminal(a.job_id, WAIT).await.unwrap();
    let b = jobs.wait_until_terminal(b.job_id, WAIT).await.unwrap();
    assert_eq!(a.status, JobStatus::Completed);
    assert_eq!(b.status, JobStatus::Completed);
    assert_eq!(a.result, b.result);

    let cached = jobs
        .store()
        .get_cache_entry(&fingerprint_bytes(&bytes).hex)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Some(cached.report), a.result);
}

#[tokio::test]
async fn test_provider_failure_fails_job() {
    let processor = Arc::new(FakeProcessor::failing(CallError::new(
        ErrorKind::Authentication,
        "invalid api key",
    )));
    let jobs = service(processor.clone(), None);
    let bytes = pdf_bytes("auth");

    let submission = jobs.submit(None, input(&bytes)).await.unwrap();
    let view = jobs.wait_until_terminal(submission.job_id, WAIT).await.unwrap();

    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.result.is_none());
    let error = view.error.unwrap();
    assert!(error.contains("analysis failed"), "{}", error);
    assert!(error.contains("invalid api key"), "{}", error);

    // Failures are not cached.
    assert!(jobs
        .store()
        .get_cache_entry(&fingerprint_bytes(&bytes).hex)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_pipeline_panic_fails_job() {
    let jobs = service(Arc::new(FakeProcessor::panicking()), None);

    let submission = jobs.submit(None, input(&pdf_bytes("panic"))).await.unwrap();
    let view = jobs.wait_until_terminal(submission.job_id, WAIT).await.unwrap();

    assert_eq!(view.status, JobStatus::Failed);
    let error = view.error.unwrap();
    assert!(error.contains("analysis aborted"), "{}", error);
    let job = jobs.store().get_job(submission.job_id).await.unwrap().unwrap();
    assert!(job.is_consistent());
}

#[tokio::test]
async fn test_url_and_inline_copies_share_the_cache() {
    let bytes = pdf_bytes("remote");
    let processor = Arc::new(FakeProcessor::ok());
    let fetcher = Arc::new(FixedFetch {
        bytes: bytes.clone(),
        fetched: AtomicUsize::new(0),
    });
    let jobs = service_with_fetcher(processor.clone(), fetcher.clone(), None);

    let remote = jobs
        .submit(None, vec![InputItem::new("document", "https://example.com/lease.pdf")])
        .await
        .unwrap();
    assert_eq!(remote.status, JobStatus::Processing);
    let remote = jobs.wait_until_terminal(remote.job_id, WAIT).await.unwrap();
    assert_eq!(remote.status, JobStatus::Completed);
    assert_eq!(fetcher.fetched.load(Ordering::SeqCst), 1);

    let job = jobs.store().get_job(remote.job_id).await.unwrap().unwrap();
    assert_eq!(job.fingerprint, Some(fingerprint_bytes(&bytes).hex));

    let inline = jobs.submit(None, input(&bytes)).await.unwrap();
    assert_eq!(inline.status, JobStatus::Completed);
    let inline = jobs.status(inline.job_id).await.unwrap();
    assert_eq!(inline.result, remote.result);
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn test_unreachable_url_is_analyzed_but_not_cached() {
    let url = "https://example.com/unreachable.pdf";
    let processor = Arc::new(FakeProcessor::ok());
    let jobs = service(processor.clone(), None);

    let first = jobs
        .submit(None, vec![InputItem::new("document", url)])
        .await
        .unwrap();
    let first = jobs.wait_until_terminal(first.job_id, WAIT).await.unwrap();
    assert_eq!(first.status, JobStatus::Completed);

    // The degraded fingerprint is the hash of the URL itself.
    let job = jobs.store().get_job(first.job_id).await.unwrap().unwrap();
    assert_eq!(job.fingerprint, Some(sha256_hex(url.as_bytes())));
    assert!(jobs
        .store()
        .get_cache_entry(&sha256_hex(url.as_bytes()))
        .await
        .unwrap()
        .is_none());

    let second = jobs
        .submit(None, vec![InputItem::new("document", url)])
        .await
        .unwrap();
    assert_eq!(second.status, JobStatus::Processing);
    jobs.wait_until_terminal(second.job_id, WAIT).await.unwrap();
    assert_eq!(processor.calls(), 2);
}

#[tokio::test]
async fn test_missing_document_is_rejected() {
    let jobs = service(Arc::new(FakeProcessor::ok()), None);
    let err = jobs
        .submit(None, vec![InputItem::new("note", "bitte prüfen")])
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::NoDocument));
}

#[tokio::test]
async fn test_unknown_job_status() {
    let jobs = service(Arc::new(FakeProcessor::ok()), None);
    let err = jobs.status(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));
}

// ============ With payment gate ============

#[tokio::test]
async fn test_job_waits_for_payment() {
    let processor = Arc::new(FakeProcessor::ok());
    let gateway = Arc::new(FakeGateway::default());
    let jobs = service(processor.clone(), Some(gateway.clone()));

    let submission = jobs.submit(None, input(&pdf_bytes("paid"))).await.unwrap();
    assert_eq!(submission.status, JobStatus::AwaitingPayment);
    assert_eq!(submission.payment.as_ref().unwrap().reference, "pay-0");
    assert_eq!(jobs.active_monitors(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let view = jobs.status(submission.job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::AwaitingPayment);
    assert_eq!(view.payment_status, Some(PaymentStatus::Pending));
    assert_eq!(processor.calls(), 0);

    gateway.confirm_all();

    let view = wait_for(&jobs, submission.job_id, |v| {
        v.payment_status == Some(PaymentStatus::Completed)
    })
    .await;
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(processor.calls(), 1);
    assert_eq!(*gateway.completed.lock().unwrap(), vec!["pay-0".to_string()]);

    // The monitor is released right after the outcome is recorded.
    for _ in 0..50 {
        if jobs.active_monitors() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(jobs.active_monitors(), 0);
}

#[tokio::test]
async fn test_duplicate_confirmation_runs_once() {
    let processor = Arc::new(FakeProcessor::slow(Duration::from_millis(50)));
    let gateway = Arc::new(FakeGateway::default());
    let jobs = service(processor.clone(), Some(gateway.clone()));

    let submission = jobs.submit(None, input(&pdf_bytes("dup"))).await.unwrap();

    tokio::join!(
        jobs.on_payment_confirmed("pay-0"),
        jobs.on_payment_confirmed("pay-0"),
    );
    gateway.confirm_all();

    let view = jobs.wait_until_terminal(submission.job_id, WAIT).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn test_unknown_payment_reference_is_ignored() {
    let gateway = Arc::new(FakeGateway::default());
    let jobs = service(Arc::new(FakeProcessor::ok()), Some(gateway));
    jobs.on_payment_confirmed("never-issued").await;
}

#[tokio::test]
async fn test_payment_completion_failure_keeps_result() {
    let gateway = Arc::new(FakeGateway {
        fail_complete: true,
        ..FakeGateway::default()
    });
    let jobs = service(Arc::new(FakeProcessor::ok()), Some(gateway.clone()));

    let submission = jobs.submit(None, input(&pdf_bytes("settle"))).await.unwrap();
    gateway.confirm_all();

    let view = wait_for(&jobs, submission.job_id, |v| {
        v.payment_status == Some(PaymentStatus::CompletionFailed)
    })
    .await;
    assert_eq!(view.status, JobStatus::Completed);
    assert!(view.result.is_some());
}

#[tokio::test]
async fn test_payment_request_failure_rejects_submission() {
    let gateway = Arc::new(FakeGateway {
        fail_create: true,
        ..FakeGateway::default()
    });
    let jobs = service(Arc::new(FakeProcessor::ok()), Some(gateway));

    let err = jobs.submit(None, input(&pdf_bytes("x"))).await.unwrap_err();
    assert!(matches!(err, JobError::Payment(_)));
    assert_eq!(jobs.active_monitors(), 0);
}

#[tokio::test]
async fn test_expired_payment_fails_job() {
    let processor = Arc::new(FakeProcessor::ok());
    let gateway = Arc::new(FakeGateway::default());
    let jobs = service(processor.clone(), Some(gateway.clone()));

    let submission = jobs.submit(None, input(&pdf_bytes("unpaid"))).await.unwrap();
    assert_eq!(jobs.active_monitors(), 1);

    gateway.expire_all();
    let view = wait_for(&jobs, submission.job_id, |v| v.status.is_terminal()).await;
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.payment_status, Some(PaymentStatus::Expired));
    assert!(view.error.unwrap().contains("pay-by deadline"));
    wait_for_monitors(&jobs, 0).await;

    // Funds arriving after the deadline do not run the job.
    gateway.confirm_all();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.calls(), 0);
    let view = jobs.status(submission.job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_exited_monitors_leave_the_registry() {
    let gateway = Arc::new(FakeGateway {
        short_lived_monitors: true,
        ..FakeGateway::default()
    });
    let jobs = service(Arc::new(FakeProcessor::ok()), Some(gateway));

    let mut ids = Vec::new();
    for n in 0..20 {
        let submission = jobs
            .submit(None, input(&pdf_bytes(&format!("gone-{}", n))))
            .await
            .unwrap();
        ids.push(submission.job_id);
    }

    wait_for_monitors(&jobs, 0).await;
    for id in ids {
        let view = jobs.status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::AwaitingPayment);
    }
}

#[tokio::test]
async fn test_cached_document_skips_payment() {
    let processor = Arc::new(FakeProcessor::ok());
    let gateway = Arc::new(FakeGateway::default());
    let jobs = service(processor.clone(), Some(gateway.clone()));
    let bytes = pdf_bytes("again");

    let first = jobs.submit(None, input(&bytes)).await.unwrap();
    gateway.confirm_all();
    jobs.wait_until_terminal(first.job_id, WAIT).await.unwrap();

    let second = jobs.submit(None, input(&bytes)).await.unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert!(second.payment.is_none());
    assert_eq!(gateway.created.load(Ordering::SeqCst), 1);
    assert_eq!(processor.calls(), 1);
}
