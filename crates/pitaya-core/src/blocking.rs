//! Bounded execution of blocking OS calls

use crate::error::{Error, Result};
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::warn;

/// Default per-call budget
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `call` on the blocking pool, giving up after `limit`.
///
/// On expiry the call keeps running in the background and its result is
/// dropped; the caller gets [`Error::Timeout`]. Only for reads.
pub async fn run_bounded<T, F>(operation: &str, limit: Duration, call: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(call)).await {
        Ok(joined) => flatten(operation, joined),
        Err(_) => {
            warn!("{} exceeded {}ms", operation, limit.as_millis());
            Err(timeout(operation, limit))
        }
    }
}

/// Like [`run_bounded`], but an expired call is waited out before
/// [`Error::Timeout`] is returned.
///
/// Used for OS mutations: once this returns, the call is no longer running,
/// so a caller holding a lock keeps it until the OS state has settled.
pub async fn run_settled<T, F>(operation: &str, limit: Duration, call: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(call);
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(joined) => flatten(operation, joined),
        Err(_) => {
            let started = Instant::now();
            warn!(
                "{} exceeded {}ms, waiting for it to settle",
                operation,
                limit.as_millis()
            );
            match handle.await {
                Ok(Ok(_)) => warn!(
                    "{} completed {}ms past its deadline",
                    operation,
                    (limit + started.elapsed()).as_millis()
                ),
                Ok(Err(e)) => warn!("{} failed past its deadline: {}", operation, e),
                Err(e) => warn!("{} panicked past its deadline: {}", operation, e),
            }
            Err(timeout(operation, limit))
        }
    }
}

fn flatten<T>(operation: &str, joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(join_err) => Err(Error::TransientOsFailure(format!(
            "{} panicked or was cancelled: {}",
            operation, join_err
        ))),
    }
}

fn timeout(operation: &str, limit: Duration) -> Error {
    Error::Timeout {
        operation: operation.to_string(),
        limit,
    }
}
