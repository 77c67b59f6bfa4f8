//! Bounded retry with exponential backoff around one logical remote call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ErrorClass, GenerationApi, ResponseError};
use crate::config::RetryConfig;
use crate::error::GenerationError;
use crate::limiter::RateLimiter;
use crate::prompt::GenerationRequest;

/// A parsed response together with what it took to get it.
#[derive(Clone, Debug, PartialEq)]
pub struct CallSuccess<T> {
    /// Parsed response.
    pub value: T,
    /// Remote invocations made, including the successful one.
    pub attempts: u32,
    /// Wall time from the first token request to the parsed response.
    pub latency: Duration,
}

/// Terminal failure of a logical call.
#[derive(Clone, Debug, PartialEq)]
pub struct CallFailure {
    /// Why the call gave up.
    pub error: GenerationError,
    /// Remote invocations made.
    pub attempts: u32,
    /// Wall time spent, including backoff.
    pub latency: Duration,
}

enum Step {
    Retry(GenerationError),
    Fail(GenerationError),
}

/// Wraps a [`GenerationApi`] with rate limiting, error classification and retries.
pub struct RetryingClient {
    api: Arc<dyn GenerationApi>,
    limiter: Arc<RateLimiter>,
    config: RetryConfig,
}

impl std::fmt::Debug for RetryingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingClient")
            .field("limiter", &self.limiter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryingClient {
    /// Validates the retry config and wires the pieces together.
    pub fn new(
        api: Arc<dyn GenerationApi>,
        limiter: Arc<RateLimiter>,
        config: RetryConfig,
    ) -> Result<Self, GenerationError> {
        config.validate()?;
        Ok(Self {
            api,
            limiter,
            config,
        })
    }

    /// The retry settings in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Sends `request` until `parse` accepts a response or the call fails terminally.
    ///
    /// Every attempt waits for a rate limit token first. Transient failures back
    /// off and retry up to `max_attempts`; permanent ones return at once. A body
    /// that fails to parse is retried once, a second consecutive one is terminal.
    pub async fn call<T, F>(
        &self,
        request: &GenerationRequest,
        parse: F,
    ) -> Result<CallSuccess<T>, CallFailure>
    where
        F: Fn(&[u8]) -> Result<T, ResponseError>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut malformed_streak = 0u32;

        loop {
            if let Err(err) = self.limiter.acquire(self.config.acquire_timeout).await {
                return Err(CallFailure {
                    error: err,
                    attempts,
                    latency: started.elapsed(),
                });
            }
            attempts += 1;

            let step = match self.api.invoke(request).await {
                Ok(body) => match parse(&body) {
                    Ok(value) => {
                        debug!("Remote call succeeded after {} attempt(s)", attempts);
                        return Ok(CallSuccess {
                            value,
                            attempts,
                            latency: started.elapsed(),
                        });
                    }
                    Err(ResponseError::Rejected(msg)) => {
                        Step::Fail(GenerationError::Permanent(msg))
                    }
                    Err(ResponseError::Malformed(msg)) => {
                        malformed_streak += 1;
                        if malformed_streak >= 2 {
                            Step::Fail(GenerationError::MalformedResponse(msg))
                        } else {
                            Step::Retry(GenerationError::MalformedResponse(msg))
                        }
                    }
                },
                Err(err) => {
                    malformed_streak = 0;
                    match err.class() {
                        ErrorClass::Transient => {
                            Step::Retry(GenerationError::Transient(err.to_string()))
                        }
                        ErrorClass::Permanent => {
                            Step::Fail(GenerationError::Permanent(err.to_string()))
                        }
                    }
                }
            };

            let error = match step {
                Step::Fail(error) => {
                    return Err(CallFailure {
                        error,
                        attempts,
                        latency: started.elapsed(),
                    });
                }
                Step::Retry(error) if attempts >= self.config.max_attempts => {
                    warn!("Giving up after {} attempt(s): {}", attempts, error);
                    return Err(CallFailure {
                        error,
                        attempts,
                        latency: started.elapsed(),
                    });
                }
                Step::Retry(error) => error,
            };

            let delay = self.config.backoff(attempts, rand::random::<f64>());
            warn!(
                "Attempt {}/{} failed ({}), retrying in {:?}",
                attempts, self.config.max_attempts, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
