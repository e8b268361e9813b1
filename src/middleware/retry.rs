use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::Middleware;
use crate::message::Envelope;
use crate::router::{HandlerFunc, HandlerFuture};
use crate::types::RetryConfig;

/// Re-invokes the wrapped chain in-process after a failure.
///
/// The delay grows exponentially from `initial_interval` and is capped at
/// `max_interval`. With jitter on, each delay is scaled to 50-100% of its
/// nominal value. Once `max_retries` re-invocations have failed the last
/// error is returned.
#[derive(Debug, Clone)]
pub struct Retry {
    max_retries: u32,
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    jitter: bool,
}

impl Retry {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::from_config(&RetryConfig::default())
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            multiplier: config.multiplier,
            max_interval: Duration::from_millis(config.max_interval_ms),
            jitter: config.jitter,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before re-invocation number `retry` (0-based).
    fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let nominal = self.initial_interval.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = nominal.min(self.max_interval.as_nanos() as f64);

        // 50-100% of the capped delay
        let factor = if self.jitter {
            0.5 + rand::random::<f64>() * 0.5
        } else {
            1.0
        };
        Duration::from_nanos((capped * factor).round().max(0.0) as u64)
    }
}

impl Middleware for Retry {
    fn wrap(&self, next: HandlerFunc) -> HandlerFunc {
        let policy = Arc::new(self.clone());
        Arc::new(move |envelope: Envelope| -> HandlerFuture {
            let next = Arc::clone(&next);
            let policy = Arc::clone(&policy);
            Box::pin(async move {
                let mut retry = 0;
                loop {
                    match next(envelope.clone()).await {
                        Ok(outputs) => {
                            if retry > 0 {
                                debug!(id = %envelope.id(), retries = retry, "Handler succeeded after retry");
                            }
                            return Ok(outputs);
                        }
                        Err(e) if retry < policy.max_retries => {
                            let delay = policy.backoff(retry);
                            warn!(
                                id = %envelope.id(),
                                retry = retry + 1,
                                max_retries = policy.max_retries,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Handler failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            retry += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
        })
    }
}
