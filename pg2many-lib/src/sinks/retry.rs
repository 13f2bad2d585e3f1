//! Bounded exponential-backoff retry around a single sink

use crate::error::{CdcError, Result};
use crate::sinks::Sink;
use crate::types::Batch;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Decorator retrying a sink's writes with exponential backoff.
///
/// Attempt `i` (zero-indexed) is followed by a `backoff * 2^i` wait; the
/// wait aborts when the shutdown signal fires. At most `max_attempts`
/// inner writes are issued.
pub struct RetrySink {
    name: String,
    inner: Box<dyn Sink>,
    max_attempts: u32,
    backoff: Duration,
    shutdown: CancellationToken,
}

impl RetrySink {
    pub fn new(
        name: impl Into<String>,
        inner: Box<dyn Sink>,
        max_attempts: u32,
        backoff: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            inner,
            max_attempts: max_attempts.max(1),
            backoff: if backoff.is_zero() {
                Duration::from_millis(100)
            } else {
                backoff
            },
            shutdown,
        }
    }
}

#[async_trait]
impl Sink for RetrySink {
    async fn write(&self, batch: &Batch) -> Result<()> {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            match self.inner.write(batch).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        sink = %self.name,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "Sink write failed, retrying"
                    );
                    last_error = Some(error);
                }
            }

            // No wait after the final attempt
            if attempt + 1 == self.max_attempts {
                break;
            }

            let delay = self.backoff * 2u32.pow(attempt);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(CdcError::RetryCancelled {
                        sink: self.name.clone(),
                        source: Box::new(last_error.expect("failure recorded before wait")),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(CdcError::SinkExhausted {
            sink: self.name.clone(),
            attempts: self.max_attempts,
            source: Box::new(last_error.expect("failure recorded before exhaustion")),
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
