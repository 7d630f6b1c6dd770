//! Transparent retry wrapper over any provider.
//!
//! Wraps `Provider::stream` and re-issues the request on rate limits and
//! transient transport failures, emitting a [`Event::Retry`] before each
//! re-attempt. Waits respect the server-supplied `retry_after` when one was
//! parsed, capped by policy; a reset hint beyond the fail-fast threshold is
//! surfaced immediately instead of holding the UI for minutes.
//!
//! The wrapper only acts on *synchronous* failures of `stream` (that is the
//! adapter contract: anything retryable is returned before the stream
//! opens). Once a stream is open, its events are forwarded untouched and
//! mid-stream errors are not retried.

use crate::event::Event;
use crate::provider::{Capabilities, Provider};
use crate::stream::{spawn_stream, EventStream, DEFAULT_CAPACITY};
use crate::types::Request;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Backoff and attempt policy for [`RetryProvider`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,

    /// Base delay when the server supplied no hint.
    pub initial_delay: Duration,

    /// Cap applied to computed and server-supplied waits.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,

    /// Random jitter fraction (0.0 to 1.0) to avoid thundering herds.
    pub jitter_factor: f64,

    /// Server waits above this threshold fail fast instead of sleeping.
    pub fail_fast_threshold: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            fail_fast_threshold: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_fail_fast_threshold(mut self, threshold: Duration) -> Self {
        self.fail_fast_threshold = threshold;
        self
    }

    /// Exponential backoff with jitter for `attempt` (0-based), used when
    /// the error carried no server hint.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponential = base_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_ms = capped + jitter - (jitter_range / 2.0);

        Duration::from_millis(final_ms.max(0.0) as u64)
    }

    /// The wait before retrying after `err`, or `None` when the server's
    /// hint exceeds the fail-fast threshold.
    fn wait_for(&self, err: &Error, attempt: u32) -> Option<Duration> {
        match err.rate_limit_info().and_then(|info| info.retry_after) {
            Some(hint) if hint > self.fail_fast_threshold => None,
            Some(hint) => Some(hint.min(self.max_delay)),
            None => Some(self.backoff_delay(attempt)),
        }
    }
}

/// Composes retry behavior over any inner provider.
pub struct RetryProvider {
    inner: Arc<dyn Provider>,
    policy: RetryPolicy,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    pub fn with_policy(inner: Arc<dyn Provider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

fn fail_fast_error(err: Error) -> Error {
    let wait = err
        .rate_limit_info()
        .and_then(|info| info.retry_after)
        .unwrap_or_default();
    Error::rate_limit(
        format!(
            "provider asks to wait {}s before retrying; giving up rather than blocking ({err})",
            wait.as_secs()
        ),
        err.rate_limit_info().cloned().unwrap_or_default(),
    )
}

#[async_trait]
impl Provider for RetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn credential_kind(&self) -> &str {
        self.inner.credential_kind()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn stream(&self, request: Request) -> Result<EventStream> {
        let first = self.inner.stream(request.clone()).await;
        let first_err = match first {
            Ok(stream) => return Ok(stream),
            Err(e) if !e.is_retryable() || self.policy.max_attempts <= 1 => return Err(e),
            Err(e) => e,
        };
        if self.policy.wait_for(&first_err, 0).is_none() {
            return Err(fail_fast_error(first_err));
        }

        // From here on the caller owns a stream, so retries and their
        // eventual outcome are delivered through it.
        let inner = Arc::clone(&self.inner);
        let policy = self.policy.clone();
        let stream = spawn_stream(DEFAULT_CAPACITY, move |sink| async move {
            let mut last_err = first_err;

            for attempt in 1..policy.max_attempts {
                let Some(wait) = policy.wait_for(&last_err, attempt - 1) else {
                    return Err(fail_fast_error(last_err));
                };

                log::debug!(
                    "retrying after {last_err} (attempt {attempt}/{}, wait {:?})",
                    policy.max_attempts - 1,
                    wait
                );
                if !sink
                    .send(Event::Retry {
                        attempt,
                        max_attempts: policy.max_attempts - 1,
                        wait,
                    })
                    .await
                {
                    return Err(Error::Cancelled);
                }

                tokio::select! {
                    _ = sink.cancellation().cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }

                match inner.stream(request.clone()).await {
                    Ok(mut stream) => {
                        // Forward the retried stream verbatim; its events
                        // are observed strictly after the retry event.
                        loop {
                            tokio::select! {
                                _ = sink.cancellation().cancelled() => {
                                    stream.close();
                                    return Err(Error::Cancelled);
                                }
                                item = stream.recv() => match item {
                                    Some(Ok(event)) => {
                                        if !sink.send(event).await {
                                            stream.close();
                                            return Err(Error::Cancelled);
                                        }
                                    }
                                    Some(Err(e)) => return Err(e),
                                    None => return Ok(()),
                                }
                            }
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        last_err = e;
                    }
                    Err(e) => return Err(e),
                }
            }

            Err(last_err)
        });

        Ok(stream)
    }
}
