use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use clause_haus::document::{encode_data_uri, DocumentFetcher, LoadedDocument};
use clause_haus::error::{CallError, ErrorKind};
use clause_haus::jobs::JobService;
use clause_haus::pipeline::{ContractProcessor, PipelineError, PipelineOutput};
use clause_haus::report::{render_report, NO_FINDINGS_REPORT};
use clause_haus::server::{build_router, AppState};
use clause_haus::store::{InMemoryStore, Store};

struct EmptyFindings;

#[async_trait]
impl ContractProcessor for EmptyFindings {
    async fn process(&self, _document: &LoadedDocument) -> Result<PipelineOutput, PipelineError> {
        Ok(PipelineOutput {
            report: render_report(&[]),
            chunks: vec![],
            embeddings: vec![],
            clauses: vec![],
        })
    }
}

struct NoFetch;

#[async_trait]
impl DocumentFetcher for NoFetch {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, CallError> {
        Err(CallError::new(ErrorKind::Network, "offline"))
    }
}

fn app() -> Router {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::default());
    let jobs = JobService::new(store, Arc::new(EmptyFindings), Arc::new(NoFetch), None);
    build_router(AppState::new(jobs, "Preprod", Some("agent-1".to_string())))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["payment_gate"], false);
}

#[tokio::test]
async fn test_availability() {
    let app = app();
    let (status, body) = send(&app, get("/availability")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "available");
    assert_eq!(body["type"], "masumi-agent");
    assert_eq!(body["network"], "Preprod");
    assert_eq!(body["agent_identifier"], "agent-1");
}

#[tokio::test]
async fn test_input_schema() {
    let app = app();
    let (status, body) = send(&app, get("/input_schema")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["required"][0], "input_data");
    assert_eq!(body["properties"]["input_data"]["type"], "array");
}

#[tokio::test]
async fn test_status_rejects_malformed_id() {
    let app = app();
    let (status, body) = send(&app, get("/status?job_id=not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_status_unknown_job() {
    let app = app();
    let uri = format!("/status?job_id={}", uuid::Uuid::new_v4());
    let (status, body) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_start_job_requires_document() {
    let app = app();

    let (status, body) = send(&app, post_json("/start_job", serde_json::json!({"input_data": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("input_data"));

    let (status, body) = send(
        &app,
        post_json(
            "/start_job",
            serde_json::json!({"input_data": [{"key": "note", "value": "hallo"}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_start_job_and_poll_status() {
    let app = app();
    let pdf = encode_data_uri(b"%PDF-1.4\n% lease\n%%EOF");

    let (status, body) = send(
        &app,
        post_json(
            "/start_job",
            serde_json::json!({
                "identifier_from_purchaser": "buyer-1",
                "input_data": [{"key": "document", "value": pdf}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "processing");
    assert_eq!(body["identifier_from_purchaser"], "buyer-1");
    assert!(body.get("payment").is_none());
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let uri = format!("/status?job_id={}", job_id);
    let mut last = Value::Null;
    for _ in 0..100 {
        let (status, body) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "completed" {
            last = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(last["status"], "completed");
    assert_eq!(last["result"], NO_FINDINGS_REPORT);
    assert!(last.get("error").is_none());
}
