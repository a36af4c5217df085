use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] hyper_util::client::legacy::Error),

    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("request signing failed: {0}")]
    Signing(String),

    #[error("failed to assume role: {0}")]
    AssumeRole(String),

    #[error("stream rejected record: HTTP {status} {kind}: {message}")]
    Rejected {
        status: StatusCode,
        kind: String,
        message: String,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<SinkError>,
    },

    #[error("delivery deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

/// Destination for a serialized batch of metric records.
///
/// Returns the number of payload bytes accepted.
pub trait Sink: Send + Sync + 'static {
    fn write(&self, payload: Bytes) -> impl Future<Output = Result<usize, SinkError>> + Send + '_;
}

/// A single delivery attempt against the underlying stream. The partition
/// key is a routing hint; transports may ignore it.
pub trait Transport: Send + Sync + 'static {
    fn put_record(
        &self,
        payload: Bytes,
        partition_key: String,
    ) -> impl Future<Output = Result<(), SinkError>> + Send + '_;
}

/// Hex SHA-256 of the payload, so identical content always routes to the same shard.
pub fn partition_key(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Milliseconds for log fields, pinned at `u64::MAX` once the doubled
/// backoff outgrows it.
fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Retries a [`Transport`] with exponential backoff.
///
/// Attempt `i` (zero-based) that fails sleeps `base_backoff * 2^i` before the
/// next one. Once `max_attempts` are spent the last error is returned wrapped
/// in [`SinkError::Exhausted`]; the payload is not kept anywhere.
pub struct ReliableSink<T> {
    transport: Arc<T>,
    max_attempts: u32,
    base_backoff: Duration,
    deadline: Option<Duration>,
}

impl<T: Transport> ReliableSink<T> {
    pub fn new(transport: Arc<T>, max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            transport,
            max_attempts: max_attempts.max(1),
            base_backoff,
            deadline: None,
        }
    }

    /// Bound the whole retry loop, backoff sleeps included.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    async fn send_with_retries(&self, payload: Bytes, partition_key: String) -> Result<(), SinkError> {
        let mut backoff = self.base_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self
                .transport
                .put_record(payload.clone(), partition_key.clone())
                .await
            {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(attempt, "record delivered after retry");
                    }
                    return Ok(());
                }
                Err(e) if attempt >= self.max_attempts => {
                    return Err(SinkError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = saturating_millis(backoff),
                        "put record failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }
}

impl<T: Transport> Sink for ReliableSink<T> {
    async fn write(&self, payload: Bytes) -> Result<usize, SinkError> {
        let len = payload.len();
        let key = partition_key(&payload);

        match self.deadline {
            Some(limit) => tokio::time::timeout(limit, self.send_with_retries(payload, key))
                .await
                .map_err(|_| SinkError::DeadlineExceeded(limit))??,
            None => self.send_with_retries(payload, key).await?,
        }

        Ok(len)
    }
}
