use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{DispatchError, DispatchResult};
use super::messages::{DispatchMessage, Envelope, FetchMode, ProxySettings};
use super::transport::Transport;
use crate::audit::{AuditCategory, AuditLog, Counters};

/// Exponential backoff between send attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the pause after failed attempt `attempt` (1 based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }

    /// Pause in `[delay / 2, delay]`, so that retries of many senders spread.
    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let half = delay / 2;
        let spread = half.as_millis() as u64;
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

/// Sends worker requests with bounded retries.
///
/// Delivery is at-least-once: a message may reach a worker more than once,
/// never zero times unless the send reports an error.
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    counters: Arc<Counters>,
    audit: Arc<AuditLog>,
    proxy: Option<ProxySettings>,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        counters: Arc<Counters>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            transport,
            policy,
            counters,
            audit,
            proxy: None,
        }
    }

    /// Proxy handed to workers with every request.
    pub fn with_proxy(mut self, proxy: Option<ProxySettings>) -> Self {
        self.proxy = proxy;
        self
    }

    pub async fn notify_harvester(
        &self,
        issuer: &str,
        crl_location: &str,
        mode: FetchMode,
    ) -> DispatchResult<Uuid> {
        self.send(DispatchMessage::Harvest {
            issuer: issuer.to_string(),
            crl_location: crl_location.to_string(),
            mode,
        })
        .await
    }

    pub async fn notify_downloader(&self, issuer: &str, mode: FetchMode) -> DispatchResult<Uuid> {
        self.send(DispatchMessage::Download {
            issuer: issuer.to_string(),
            mode,
        })
        .await
    }

    pub async fn notify_cold_start(&self, crl_url: &str, cert_url: &str) -> DispatchResult<Uuid> {
        self.send(DispatchMessage::ColdStart {
            crl_url: crl_url.to_string(),
            cert_url: cert_url.to_string(),
        })
        .await
    }

    pub async fn notify_remove_ca(&self, issuer: &str) -> DispatchResult<Uuid> {
        self.send(DispatchMessage::RemoveCa {
            issuer: issuer.to_string(),
        })
        .await
    }

    /// Sends `message`, retrying transient failures with backoff.
    ///
    /// Every attempt reuses the same envelope id so workers can detect
    /// redeliveries.
    pub async fn send(&self, message: DispatchMessage) -> DispatchResult<Uuid> {
        let queue = message.queue();
        let kind = message.kind();
        let envelope = Envelope::new(message).with_proxy(self.proxy.clone());
        let max_attempts = self.policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let error = match self.transport.send(queue, &envelope).await {
                Ok(()) => {
                    self.counters.dispatch_sent();
                    debug!(%queue, kind, id = %envelope.id, attempt, "Dispatched");
                    return Ok(envelope.id);
                }
                Err(error) => error,
            };

            if !error.is_transient() || attempt >= max_attempts {
                self.counters.dispatch_failed();
                self.audit.failure(
                    AuditCategory::Dispatch,
                    format!("{kind} to {queue} failed after {attempt} attempts: {error}"),
                );
                return Err(if error.is_transient() {
                    DispatchError::Exhausted {
                        kind,
                        attempts: attempt,
                        last: Box::new(error),
                    }
                } else {
                    error
                });
            }

            let pause = self.policy.jittered(attempt);
            warn!(%queue, kind, attempt, ?pause, "Dispatch failed, retrying: {error}");
            self.counters.dispatch_retried();
            tokio::time::sleep(pause).await;
            attempt += 1;
        }
    }
}
