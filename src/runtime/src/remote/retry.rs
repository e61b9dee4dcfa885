//! Bounded retry with scheme-downgrade classification.
//!
//! Transient failures are retried with a fixed delay. Two error classes
//! terminate the loop immediately and signal the caller to retry over
//! plaintext HTTP instead: the server answered a TLS client with an HTTP
//! response, or the connection was refused.

use std::future::Future;
use std::time::Duration;

use nydus_commit_core::error::{CommitError, Result};

use crate::util::error_chain;

/// Default number of attempts for a retried operation.
pub const RETRY_ATTEMPTS: usize = 3;

/// Fixed delay between attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

// The underlying transport errors are not exposed as typed kinds, so the
// classification matches on message substrings. Known fragility: keep these
// in sync with the transport stack's wording.
const ERR_HTTP_RESPONSE_TO_HTTPS: &str = "server gave http response to https client";
const ERR_CONNECTION_REFUSED: &str = "connection refused";

/// Whether `err` should be recovered by downgrading the transport to
/// plaintext HTTP rather than retried as-is.
pub fn retryable_with_http(err: &CommitError) -> bool {
    let chain = error_chain(err).to_lowercase();
    chain.contains(ERR_HTTP_RESPONSE_TO_HTTPS) || chain.contains(ERR_CONNECTION_REFUSED)
}

/// Run `op` up to `attempts` times with [`RETRY_DELAY`] between failures.
///
/// Scheme-downgrade errors and cancellation are returned immediately; the
/// caller handles the downgrade one level up.
pub async fn with_retry<T, F, Fut>(mut op: F, attempts: usize) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut remaining = attempts.max(1);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                remaining -= 1;
                if remaining == 0
                    || retryable_with_http(&err)
                    || matches!(err, CommitError::Cancelled)
                {
                    return Err(err);
                }
                tracing::warn!(error = %err, remaining, "retrying after failure");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
