//! MIP-003 compatible HTTP server.
//!
//! Exposes the job service as a JSON API that agent marketplaces can call.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/start_job` | Submit a contract for analysis |
//! | `GET`  | `/status?job_id=` | Job status, result or error |
//! | `GET`  | `/availability` | Whether the agent accepts jobs |
//! | `GET`  | `/input_schema` | Shape of `input_data` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "job 5f0c… not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `payment_error`
//! (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::jobs::{JobError, JobService, JobStatusView};
use crate::models::{InputItem, JobStatus};
use crate::payment::{Amount, PaymentRequest};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    jobs: JobService,
    network: String,
    agent_identifier: Option<String>,
}

impl AppState {
    pub fn new(jobs: JobService, network: impl Into<String>, agent_identifier: Option<String>) -> Self {
        Self {
            jobs,
            network: network.into(),
            agent_identifier,
        }
    }

    pub fn from_config(config: &Config, jobs: JobService) -> Self {
        Self::new(
            jobs,
            config.network(),
            config.payment.as_ref().map(|p| p.agent_identifier.clone()),
        )
    }
}

/// Build the router with all routes and CORS applied.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/start_job", post(handle_start_job))
        .route("/status", get(handle_status))
        .route("/availability", get(handle_availability))
        .route("/input_schema", get(handle_input_schema))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let jobs = JobService::from_config(config, true).await?;
    if !jobs.is_payment_gated() {
        info!("no [payment] section configured, jobs start without payment");
    }
    let app = build_router(AppState::from_config(config, jobs));

    let bind_addr = config.server.bind.clone();
    println!("Clause Haus listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        let (status, code) = match &err {
            JobError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            JobError::NoDocument => (StatusCode::BAD_REQUEST, "bad_request"),
            JobError::Payment(_) => (StatusCode::BAD_GATEWAY, "payment_error"),
            JobError::Internal(e) => {
                error!("request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ POST /start_job ============

#[derive(Deserialize)]
struct StartJobRequest {
    #[serde(default)]
    identifier_from_purchaser: Option<String>,
    input_data: Vec<InputItem>,
}

/// Payment metadata in MIP-003 naming.
#[derive(Serialize)]
struct PaymentView {
    blockchain_identifier: String,
    pay_by_time: Option<String>,
    submit_result_time: Option<String>,
    unlock_time: Option<String>,
    external_dispute_unlock_time: Option<String>,
    amounts: Vec<Amount>,
    input_hash: String,
    agent_identifier: String,
    seller_vkey: Option<String>,
}

impl From<PaymentRequest> for PaymentView {
    fn from(p: PaymentRequest) -> Self {
        Self {
            blockchain_identifier: p.reference,
            pay_by_time: p.pay_by_time,
            submit_result_time: p.submit_result_time,
            unlock_time: p.unlock_time,
            external_dispute_unlock_time: p.external_dispute_unlock_time,
            amounts: p.amounts,
            input_hash: p.input_hash,
            agent_identifier: p.agent_identifier,
            seller_vkey: p.seller_vkey,
        }
    }
}

#[derive(Serialize)]
struct StartJobResponse {
    job_id: Uuid,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    identifier_from_purchaser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment: Option<PaymentView>,
}

async fn handle_start_job(
    State(state): State<AppState>,
    Json(req): Json<StartJobRequest>,
) -> Result<(StatusCode, Json<StartJobResponse>), AppError> {
    if req.input_data.is_empty() {
        return Err(bad_request("input_data must not be empty"));
    }

    let submission = state
        .jobs
        .submit(req.identifier_from_purchaser, req.input_data)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartJobResponse {
            job_id: submission.job_id,
            status: submission.status,
            identifier_from_purchaser: submission.identifier_from_purchaser,
            payment: submission.payment.map(PaymentView::from),
        }),
    ))
}

// ============ GET /status ============

#[derive(Deserialize)]
struct StatusQuery {
    job_id: String,
}

async fn handle_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<JobStatusView>, AppError> {
    let job_id = Uuid::parse_str(query.job_id.trim())
        .map_err(|_| bad_request(format!("invalid job_id: {}", query.job_id)))?;
    Ok(Json(state.jobs.status(job_id).await?))
}

// ============ GET /availability ============

#[derive(Serialize)]
struct AvailabilityResponse {
    status: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_identifier: Option<String>,
}

async fn handle_availability(State(state): State<AppState>) -> Json<AvailabilityResponse> {
    Json(AvailabilityResponse {
        status: "available",
        kind: "masumi-agent",
        network: state.network.clone(),
        agent_identifier: state.agent_identifier.clone(),
    })
}

// ============ GET /input_schema ============

/// The `input_data` shape accepted by `/start_job`.
pub fn input_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "identifier_from_purchaser": {
                "type": "string",
                "description": "Optional purchaser-chosen identifier"
            },
            "input_data": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "key": {
                            "type": "string",
                            "description": "Input key (e.g., 'document', 'pdf')"
                        },
                        "value": {
                            "type": "string",
                            "description": "PDF document as base64 data URI (data:application/pdf;base64,...) or URL"
                        }
                    },
                    "required": ["key", "value"]
                },
                "description": "Array of key-value pairs. Must include a PDF document with key 'document' or 'pdf'"
            }
        },
        "required": ["input_data"]
    })
}

async fn handle_input_schema() -> Json<serde_json::Value> {
    Json(input_schema())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    payment_gate: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        payment_gate: state.jobs.is_payment_gated(),
    })
}
