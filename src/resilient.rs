//! Rate-limited, retrying wrapper for external calls.
//!
//! [`ResilientClient::execute`] guards every OCR, embedding and chat request:
//!
//! 1. **Admission control**: per rate key (usually a model name) a sliding
//!    one-minute ledger of admitted calls and their cost. A call waits until
//!    both the request count and the cost total fit under the key's
//!    [`RateLimit`], or is refused with a throttle error in fail-fast mode.
//! 2. **Retry**: failures are classified (see [`crate::error`]);
//!    retryable kinds are tried again after the provider's `retry_after`
//!    or an exponential backoff (1s, 2s, 4s, … capped), up to
//!    [`RetryPolicy::max_attempts`] attempts in total.
//!
//! The ledger is guarded by a single async mutex. Admission checks and
//! reserves in one critical section, so concurrent callers can never both
//! slip into the last free slot; the lock is never held across a sleep.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CallError;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-minute ceilings for one rate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    /// Token budget (or any other cost unit the caller estimates in).
    pub cost_per_minute: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: 5_000,
            cost_per_minute: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct LedgerEntry {
    id: u64,
    at: Instant,
    cost: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: VecDeque<LedgerEntry>,
    total_cost: u64,
}

impl Ledger {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.at) < WINDOW {
                break;
            }
            self.total_cost = self.total_cost.saturating_sub(front.cost);
            self.entries.pop_front();
        }
    }

    /// How long until a call of `cost` fits, or `None` if it fits now.
    fn wait_needed(&self, limit: RateLimit, cost: u64, now: Instant) -> Option<Duration> {
        let mut wait = Duration::ZERO;

        let rpm = limit.requests_per_minute.max(1) as usize;
        if self.entries.len() >= rpm {
            // The oldest entries must age out until one slot is free.
            let excess = self.entries.len() + 1 - rpm;
            if let Some(entry) = self.entries.get(excess - 1) {
                wait = wait.max(expiry(entry.at, now));
            }
        }

        // An oversized call is admitted once the window is empty.
        if self.total_cost + cost > limit.cost_per_minute && !self.entries.is_empty() {
            let mut freed = 0u64;
            let mut until = None;
            for entry in &self.entries {
                freed += entry.cost;
                until = Some(entry.at);
                if self.total_cost - freed + cost <= limit.cost_per_minute {
                    break;
                }
            }
            if let Some(at) = until {
                wait = wait.max(expiry(at, now));
            }
        }

        if wait.is_zero() {
            None
        } else {
            Some(wait)
        }
    }
}

fn expiry(at: Instant, now: Instant) -> Duration {
    (at + WINDOW)
        .saturating_duration_since(now)
        .max(Duration::from_millis(1))
}

/// Sliding-window admission control keyed by rate key.
#[derive(Debug)]
pub struct AdmissionControl {
    limits: HashMap<String, RateLimit>,
    default_limit: RateLimit,
    state: Mutex<AdmissionState>,
}

#[derive(Debug, Default)]
struct AdmissionState {
    next_id: u64,
    ledgers: HashMap<String, Ledger>,
}

/// A slot held in the ledger between admission and completion.
#[derive(Debug)]
pub struct Reservation {
    key: String,
    id: u64,
}

impl AdmissionControl {
    pub fn new(limits: HashMap<String, RateLimit>, default_limit: RateLimit) -> Self {
        Self {
            limits,
            default_limit,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    pub fn limit_for(&self, key: &str) -> RateLimit {
        self.limits.get(key).copied().unwrap_or(self.default_limit)
    }

    /// Wait for (or, with `fail_fast`, refuse) a slot of `cost` under `key`.
    pub async fn admit(
        &self,
        key: &str,
        cost: u64,
        fail_fast: bool,
    ) -> Result<Reservation, CallError> {
        let limit = self.limit_for(key);
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let now = Instant::now();
                let next_id = state.next_id;
                let ledger = state.ledgers.entry(key.to_string()).or_default();
                ledger.prune(now);
                match ledger.wait_needed(limit, cost, now) {
                    None => {
                        ledger.entries.push_back(LedgerEntry {
                            id: next_id,
                            at: now,
                            cost,
                        });
                        ledger.total_cost += cost;
                        state.next_id += 1;
                        return Ok(Reservation {
                            key: key.to_string(),
                            id: next_id,
                        });
                    }
                    Some(wait) => wait,
                }
            };

            if fail_fast {
                return Err(CallError::throttled(key, wait));
            }
            debug!(rate_key = key, wait_ms = wait.as_millis() as u64, "rate window full, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Record the reservation as a successful call with its final cost.
    pub async fn settle(&self, reservation: Reservation, actual_cost: u64) {
        let mut state = self.state.lock().await;
        if let Some(ledger) = state.ledgers.get_mut(&reservation.key) {
            if let Some(entry) = ledger.entries.iter_mut().find(|e| e.id == reservation.id) {
                ledger.total_cost = ledger.total_cost - entry.cost + actual_cost;
                entry.cost = actual_cost;
            }
        }
    }

    /// Drop the reservation of a call that failed.
    pub async fn release(&self, reservation: Reservation) {
        let mut state = self.state.lock().await;
        if let Some(ledger) = state.ledgers.get_mut(&reservation.key) {
            if let Some(pos) = ledger.entries.iter().position(|e| e.id == reservation.id) {
                if let Some(entry) = ledger.entries.remove(pos) {
                    ledger.total_cost = ledger.total_cost.saturating_sub(entry.cost);
                }
            }
        }
    }

    /// Calls and cost currently counted against `key`.
    pub async fn usage(&self, key: &str) -> (usize, u64) {
        let mut state = self.state.lock().await;
        match state.ledgers.get_mut(key) {
            Some(ledger) => {
                ledger.prune(Instant::now());
                (ledger.entries.len(), ledger.total_cost)
            }
            None => (0, 0),
        }
    }
}

/// Value returned by a metered operation together with its real cost.
#[derive(Debug)]
pub struct Metered<T> {
    pub value: T,
    pub actual_cost: Option<u64>,
}

impl<T> Metered<T> {
    pub fn new(value: T, actual_cost: Option<u64>) -> Self {
        Self { value, actual_cost }
    }
}

/// Shared wrapper applied to every external call.
#[derive(Debug)]
pub struct ResilientClient {
    admission: AdmissionControl,
    policy: RetryPolicy,
    fail_fast: bool,
}

impl ResilientClient {
    pub fn new(admission: AdmissionControl, policy: RetryPolicy, fail_fast: bool) -> Self {
        Self {
            admission,
            policy,
            fail_fast,
        }
    }

    pub fn from_config(config: &crate::config::ResilienceConfig) -> Self {
        Self::new(
            AdmissionControl::new(config.rate_limits(), RateLimit::default()),
            config.retry_policy(),
            config.fail_fast,
        )
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `operation` under admission control and the retry policy.
    ///
    /// The estimated cost is recorded on success.
    pub async fn execute<T, F, Fut>(
        &self,
        rate_key: &str,
        estimated_cost: u64,
        mut operation: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.execute_metered(rate_key, estimated_cost, || {
            let fut = operation();
            async move { fut.await.map(|value| Metered::new(value, None)) }
        })
        .await
    }

    /// Like [`execute`](Self::execute) for operations that report their
    /// actual cost (e.g. `usage.total_tokens`).
    pub async fn execute_metered<T, F, Fut>(
        &self,
        rate_key: &str,
        estimated_cost: u64,
        mut operation: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Metered<T>, CallError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let reservation = self
                .admission
                .admit(rate_key, estimated_cost, self.fail_fast)
                .await?;

            let err = match operation().await {
                Ok(metered) => {
                    let cost = metered.actual_cost.unwrap_or(estimated_cost);
                    self.admission.settle(reservation, cost).await;
                    return Ok(metered.value);
                }
                Err(err) => {
                    self.admission.release(reservation).await;
                    err
                }
            };

            if !err.kind.is_retryable() {
                warn!(rate_key, kind = %err.kind, "call failed, not retrying: {}", err.message);
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(rate_key, attempts = attempt, kind = %err.kind, "retries exhausted");
                return Err(err);
            }

            let delay = match err.retry_after {
                Some(stated) => stated.min(self.policy.max_delay),
                None => {
                    let delay = backoff.min(self.policy.max_delay);
                    backoff = (backoff * 2).min(self.policy.max_delay);
                    delay
                }
            };
            warn!(
                rate_key,
                attempt,
                max_attempts,
                kind = %err.kind,
                delay_ms = delay.as_millis() as u64,
                "call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
