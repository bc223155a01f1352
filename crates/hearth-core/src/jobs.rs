//! Background jobs
//!
//! Work the request path does not wait for. Every job carries its own
//! timeout so a hung provider call cannot leak an unbounded task.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Spawn `future` on the current runtime, cancelled after `timeout`.
///
/// The handle resolves to `None` when the job timed out. Returns `None`
/// (and runs nothing) when called outside a tokio runtime.
pub fn spawn_bounded<F>(name: &'static str, timeout: Duration, future: F) -> Option<JoinHandle<Option<F::Output>>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!(job = name, "No async runtime, background job skipped");
            return None;
        }
    };

    Some(handle.spawn(async move {
        let started = std::time::Instant::now();
        match tokio::time::timeout(timeout, future).await {
            Ok(output) => {
                tracing::debug!(job = name, elapsed_ms = started.elapsed().as_millis() as u64, "Background job finished");
                Some(output)
            }
            Err(_) => {
                tracing::warn!(job = name, timeout_secs = timeout.as_secs(), "Background job timed out");
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_completes_within_timeout() {
        let handle = spawn_bounded("quick", Duration::from_secs(5), async { 41 + 1 }).unwrap();
        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_job_is_cancelled() {
        let handle = spawn_bounded("hung", Duration::from_secs(30), std::future::pending::<()>()).unwrap();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[test]
    fn test_no_runtime_skips() {
        assert!(spawn_bounded("orphan", Duration::from_secs(1), async {}).is_none());
    }
}
