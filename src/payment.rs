//! Payment gating for jobs.
//!
//! A [`PaymentGateway`] creates a payment request for a job, watches for
//! the buyer locking funds and finally submits the job's result against
//! the payment. Confirmation or expiry is delivered as a [`PaymentEvent`]
//! on a channel the job service owns; how the gateway learns about it
//! (polling, webhook) is its own business.
//!
//! [`MasumiGateway`] talks to a Masumi payment service over HTTP and polls
//! for the `FundsLocked` on-chain state.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PaymentConfig;
use crate::fingerprint::sha256_hex;
use crate::models::InputItem;

/// How long the buyer has to pay.
const PAY_BY_WINDOW: Duration = Duration::from_secs(60 * 60);
/// How long the agent has to submit the result after payment.
const SUBMIT_RESULT_WINDOW: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Amount {
    pub amount: String,
    pub unit: String,
}

/// Metadata of a created payment request, echoed to the purchaser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRequest {
    /// Opaque payment reference (blockchain identifier).
    pub reference: String,
    pub pay_by_time: Option<String>,
    pub submit_result_time: Option<String>,
    pub unlock_time: Option<String>,
    pub external_dispute_unlock_time: Option<String>,
    pub amounts: Vec<Amount>,
    pub input_hash: String,
    pub agent_identifier: String,
    pub seller_vkey: Option<String>,
}

/// What a payment monitor reports about the payment it watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    /// Funds are locked; the job may run.
    Confirmed { reference: String },
    /// The pay-by deadline passed without funds being locked.
    Expired { reference: String },
}

impl PaymentEvent {
    pub fn reference(&self) -> &str {
        match self {
            PaymentEvent::Confirmed { reference } | PaymentEvent::Expired { reference } => reference,
        }
    }
}

/// A running confirmation monitor. Releasing (or dropping) it stops the
/// monitor task.
#[derive(Debug, Default)]
pub struct MonitorHandle {
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// A handle with no task behind it.
    pub fn detached() -> Self {
        Self { task: None }
    }

    /// Whether the monitor task has exited. A detached handle never has.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_some_and(|task| task.is_finished())
    }

    pub fn release(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_request(
        &self,
        identifier_from_purchaser: Option<&str>,
        input_data: &[InputItem],
    ) -> Result<PaymentRequest>;

    /// Start watching `request`. The monitor sends exactly one
    /// [`PaymentEvent`] on `events`: `Confirmed` once funds are locked, or
    /// `Expired` when it gives up.
    async fn subscribe(
        &self,
        request: &PaymentRequest,
        events: mpsc::UnboundedSender<PaymentEvent>,
    ) -> Result<MonitorHandle>;

    /// Submit the job result for the payment, releasing the funds.
    async fn complete(&self, reference: &str, result: &str) -> Result<()>;
}

/// Hash committed to in the payment request.
///
/// SHA-256 over the purchaser identifier and the canonical JSON of the
/// input, joined by `;`.
pub fn input_hash(identifier_from_purchaser: &str, input_data: &[InputItem]) -> String {
    let json = serde_json::to_string(input_data).unwrap_or_default();
    sha256_hex(format!("{};{}", identifier_from_purchaser, json).as_bytes())
}

/// Unix millis, either given directly or as an RFC 3339 timestamp.
fn parse_deadline_millis(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        chrono::DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|t| t.timestamp_millis())
    })
}

fn json_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Masumi payment service client. Requires `PAYMENT_API_KEY`.
pub struct MasumiGateway {
    client: reqwest::Client,
    service_url: String,
    api_key: String,
    config: PaymentConfig,
}

impl MasumiGateway {
    pub fn new(config: &PaymentConfig) -> Result<Self> {
        let api_key = std::env::var("PAYMENT_API_KEY")
            .map_err(|_| anyhow::anyhow!("PAYMENT_API_KEY not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            service_url: config.service_url.trim_end_matches('/').to_string(),
            api_key,
            config: config.clone(),
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        post_json(&self.client, &self.service_url, &self.api_key, path, body).await
    }
}

async fn post_json(
    client: &reqwest::Client,
    service_url: &str,
    api_key: &str,
    path: &str,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let resp = client
        .post(format!("{}{}", service_url, path))
        .header("token", api_key)
        .json(body)
        .send()
        .await
        .with_context(|| format!("payment service request {} failed", path))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        bail!("payment service error {} on {}: {}", status, path, text);
    }
    Ok(resp.json().await?)
}

#[async_trait]
impl PaymentGateway for MasumiGateway {
    async fn create_payment_request(
        &self,
        identifier_from_purchaser: Option<&str>,
        input_data: &[InputItem],
    ) -> Result<PaymentRequest> {
        let purchaser = match identifier_from_purchaser {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
        };
        let hash = input_hash(&purchaser, input_data);
        let now = chrono::Utc::now();
        let pay_by = now + chrono::Duration::from_std(PAY_BY_WINDOW)?;
        let submit_by = now + chrono::Duration::from_std(SUBMIT_RESULT_WINDOW)?;

        let mut body = serde_json::json!({
            "agentIdentifier": self.config.agent_identifier,
            "network": self.config.network,
            "inputHash": hash,
            "payByTime": pay_by.to_rfc3339(),
            "submitResultTime": submit_by.to_rfc3339(),
            "identifierFromPurchaser": purchaser,
        });
        if let Some(amount) = self.config.amount {
            body["RequestedFunds"] = serde_json::json!([
                {"amount": amount.to_string(), "unit": self.config.unit}
            ]);
        }

        let resp = self.post("/payment/", &body).await?;
        let data = resp.get("data").unwrap_or(&resp);
        let reference = json_string(data.get("blockchainIdentifier"))
            .context("payment service response has no blockchainIdentifier")?;

        let amounts = data
            .get("RequestedFunds")
            .and_then(|f| f.as_array())
            .map(|funds| {
                funds
                    .iter()
                    .filter_map(|f| {
                        Some(Amount {
                            amount: json_string(f.get("amount"))?,
                            unit: json_string(f.get("unit")).unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        info!(payment_ref = %reference, "payment request created");
        Ok(PaymentRequest {
            reference,
            pay_by_time: json_string(data.get("payByTime")),
            submit_result_time: json_string(data.get("submitResultTime")),
            unlock_time: json_string(data.get("unlockTime")),
            external_dispute_unlock_time: json_string(data.get("externalDisputeUnlockTime")),
            amounts,
            input_hash: json_string(data.get("inputHash")).unwrap_or(hash),
            agent_identifier: self.config.agent_identifier.clone(),
            seller_vkey: self.config.seller_vkey.clone(),
        })
    }

    async fn subscribe(
        &self,
        request: &PaymentRequest,
        events: mpsc::UnboundedSender<PaymentEvent>,
    ) -> Result<MonitorHandle> {
        let client = self.client.clone();
        let service_url = self.service_url.clone();
        let api_key = self.api_key.clone();
        let network = self.config.network.clone();
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        let reference = request.reference.clone();
        // Give up once the pay-by deadline has passed.
        let deadline_ms = request.pay_by_time.as_deref().and_then(parse_deadline_millis);

        let task = tokio::spawn(async move {
            let body = serde_json::json!({
                "blockchainIdentifier": reference,
                "network": network,
                "includeHistory": false,
            });
            loop {
                tokio::time::sleep(interval).await;

                match post_json(
                    &client,
                    &service_url,
                    &api_key,
                    "/payment/resolve-blockchain-identifier",
                    &body,
                )
                .await
                {
                    Ok(resp) => {
                        let data = resp.get("data").unwrap_or(&resp);
                        let state = json_string(data.get("onChainState"));
                        debug!(payment_ref = %reference, state = ?state, "polled payment state");
                        if state.as_deref() == Some("FundsLocked") {
                            let _ = events.send(PaymentEvent::Confirmed {
                                reference: reference.clone(),
                            });
                            return;
                        }
                    }
                    Err(e) => warn!(payment_ref = %reference, "payment status poll failed: {:#}", e),
                }

                if let Some(deadline) = deadline_ms {
                    if crate::models::now_millis() > deadline {
                        warn!(payment_ref = %reference, "pay-by deadline passed, stopping monitor");
                        let _ = events.send(PaymentEvent::Expired {
                            reference: reference.clone(),
                        });
                        return;
                    }
                }
            }
        });

        Ok(MonitorHandle::new(task))
    }

    async fn complete(&self, reference: &str, result: &str) -> Result<()> {
        let body = serde_json::json!({
            "network": self.config.network,
            "blockchainIdentifier": reference,
            "submitResultHash": sha256_hex(result.as_bytes()),
        });
        self.post("/payment/submit-result", &body).await?;
        info!(payment_ref = %reference, "result submitted to payment service");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_hash_is_stable() {
        let items = vec![InputItem::new("document", "https://example.com/a.pdf")];
        assert_eq!(input_hash("p1", &items), input_hash("p1", &items));
        assert_ne!(input_hash("p1", &items), input_hash("p2", &items));
        assert_eq!(input_hash("p1", &items).len(), 64);
    }

    #[test]
    fn test_json_string_accepts_numbers() {
        let v = serde_json::json!({"t": 1700000000000u64, "s": "x", "n": null});
        assert_eq!(json_string(v.get("t")).as_deref(), Some("1700000000000"));
        assert_eq!(json_string(v.get("s")).as_deref(), Some("x"));
        assert_eq!(json_string(v.get("n")), None);
        assert_eq!(json_string(v.get("missing")), None);
    }

    #[test]
    fn test_deadline_formats() {
        assert_eq!(parse_deadline_millis("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(
            parse_deadline_millis("2023-11-14T22:13:20+00:00"),
            Some(1_700_000_000_000)
        );
        assert_eq!(parse_deadline_millis("soon"), None);
    }

    #[tokio::test]
    async fn test_release_aborts_monitor() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        MonitorHandle::new(task).release();
        // The sender is dropped with the aborted task.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_finished_monitor_is_reported() {
        let handle = MonitorHandle::new(tokio::spawn(async {}));
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_finished());
        assert!(!MonitorHandle::detached().is_finished());
    }

    #[test]
    fn test_event_reference() {
        let confirmed = PaymentEvent::Confirmed {
            reference: "pay-1".to_string(),
        };
        let expired = PaymentEvent::Expired {
            reference: "pay-2".to_string(),
        };
        assert_eq!(confirmed.reference(), "pay-1");
        assert_eq!(expired.reference(), "pay-2");
    }
}
