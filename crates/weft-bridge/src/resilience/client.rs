//! Circuit-breaking, retrying client over the transport.
//!
//! Every call passes the circuit breaker. Idempotent methods (and only
//! those; `generate` is explicitly excluded by the allow-list) additionally
//! get bounded, abortable, jittered retries on transient failures. Errors
//! leave here enriched with the method name and attempt count.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use weft_proto::methods::is_idempotent;

use crate::config::RetryConfig;
use crate::error::BridgeError;
use crate::resilience::circuit::CircuitBreaker;
use crate::resilience::retry::backoff_delay;
use crate::transport::{RequestOptions, Transport};

/// Transport + circuit + retry, the client every higher layer talks to.
#[derive(Clone)]
pub struct ResilientClient {
    transport: Transport,
    circuit: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

impl ResilientClient {
    pub fn new(transport: Transport, circuit: Arc<CircuitBreaker>, retry: RetryConfig) -> Self {
        Self {
            transport,
            circuit,
            retry,
        }
    }

    /// The wrapped transport, for notification subscriptions and close.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Issue a request under the circuit/retry policy.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        opts: RequestOptions,
    ) -> Result<Value, BridgeError> {
        let retriable = is_idempotent(method);
        let max_attempts = if retriable {
            1 + self.retry.max_retries
        } else {
            1
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if let Err(rejection) = self.circuit.admit() {
                // Fail fast; an open circuit is not worth burning retry
                // budget on.
                return Err(BridgeError::CircuitOpen {
                    retry_after: rejection.retry_after,
                });
            }

            match self.transport.request(method, params.clone(), opts.clone()).await {
                Ok(value) => {
                    self.circuit.record_success();
                    return Ok(value);
                }
                Err(BridgeError::Aborted) => {
                    // Cancellation is the caller's doing, not the
                    // runtime's health.
                    self.circuit.record_cancelled();
                    return Err(BridgeError::Aborted);
                }
                Err(e) => {
                    self.circuit.record_failure();
                    if attempt >= max_attempts || !e.is_transient() {
                        if attempt > 1 {
                            warn!(method, attempt, error = %e, "giving up after retries");
                        }
                        return Err(enrich(method, attempt, e));
                    }
                    let delay = backoff_delay(&self.retry, attempt);
                    debug!(method, attempt, ?delay, error = %e, "transient failure; backing off");
                    match &opts.abort {
                        Some(token) => {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = token.cancelled() => return Err(BridgeError::Aborted),
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
            }
        }
    }
}

fn enrich(method: &str, attempts: u32, source: BridgeError) -> BridgeError {
    BridgeError::Exhausted {
        method: method.to_owned(),
        attempts: attempts.max(1),
        source: Box::new(source),
    }
}
