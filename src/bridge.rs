//! Run async operations from synchronous call sites.
//!
//! [`run_blocking`] works whether or not the caller is already inside a tokio
//! runtime:
//!
//! - **No runtime on this thread**: a current-thread runtime is built and the
//!   future is driven to completion right here.
//! - **Inside a runtime**: blocking on the future from this thread would stall
//!   (or panic) the runtime the future needs. The future is moved to a
//!   dedicated worker thread that owns its own runtime, and the caller waits
//!   on a channel with a bounded timeout.
//!
//! The worker runtime only drives the future itself. I/O resources created
//! on the caller's runtime (for example a child process spawned there) still
//! need that runtime to make progress. Long-lived I/O therefore lives on an
//! [`IoRuntime`], whose own thread keeps it moving while any caller's runtime
//! is blocked; the timeout bounds everything else.

use std::future::Future;
use std::sync::mpsc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Handle, Runtime};

/// Default wait for the worker-thread path.
pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker thread did not finish in time. The operation keeps running
    /// on the detached worker until it completes.
    #[error("async operation did not complete within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The worker thread died before producing a result.
    #[error("bridge worker thread panicked")]
    WorkerPanicked,

    /// The task was dropped because its runtime shut down.
    #[error("bridged task cancelled by runtime shutdown")]
    Cancelled,

    /// A tokio runtime could not be created.
    #[error("failed to build runtime: {reason}")]
    RuntimeBuild { reason: String },
}

fn build_runtime() -> Result<tokio::runtime::Runtime, BridgeError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BridgeError::RuntimeBuild {
            reason: e.to_string(),
        })
}

/// [`run_blocking_with_timeout`] with [`DEFAULT_BRIDGE_TIMEOUT`].
pub fn run_blocking<F>(future: F) -> Result<F::Output, BridgeError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    run_blocking_with_timeout(future, DEFAULT_BRIDGE_TIMEOUT)
}

/// Drive `future` to completion from synchronous code.
///
/// `timeout` bounds only the worker-thread path; on a thread with no runtime
/// the future runs to completion.
pub fn run_blocking_with_timeout<F>(future: F, timeout: Duration) -> Result<F::Output, BridgeError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if tokio::runtime::Handle::try_current().is_err() {
        return Ok(build_runtime()?.block_on(future));
    }

    tracing::debug!(
        timeout_secs = timeout.as_secs(),
        "runtime already active; running on a bridge worker thread"
    );

    let (tx, rx) = mpsc::sync_channel::<Result<F::Output, BridgeError>>(1);
    std::thread::Builder::new()
        .name("cowork-bridge".into())
        .spawn(move || {
            let result = build_runtime().map(|rt| rt.block_on(future));
            // The receiver is gone if the caller already timed out.
            let _ = tx.send(result);
        })
        .map_err(|e| BridgeError::RuntimeBuild {
            reason: format!("failed to spawn worker thread: {e}"),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "bridge worker timed out");
            Err(BridgeError::Timeout {
                timeout_secs: timeout.as_secs(),
            })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(BridgeError::WorkerPanicked),
    }
}

// ─── IoRuntime ───────────────────────────────────────────────────────────────

/// A single-worker runtime on its own thread for I/O that outlives any one
/// call, such as provider child processes and their pipes.
///
/// Work handed to [`run`](Self::run) is driven by that thread and can be
/// awaited from any runtime, including a current-thread runtime whose only
/// thread is parked in [`run_blocking`].
pub struct IoRuntime {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl IoRuntime {
    pub fn new(thread_name: &str) -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(thread_name)
            .enable_all()
            .build()
            .map_err(|e| BridgeError::RuntimeBuild {
                reason: e.to_string(),
            })?;
        tracing::debug!(thread = thread_name, "io runtime started");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Spawn `future` on this runtime and wait for its output.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, BridgeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future).await.map_err(|e| {
            if e.is_panic() {
                BridgeError::WorkerPanicked
            } else {
                BridgeError::Cancelled
            }
        })
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside async code.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixed_value() -> u32 {
        tokio::task::yield_now().await;
        42
    }

    #[test]
    fn test_run_blocking_without_runtime() {
        assert_eq!(run_blocking(fixed_value()).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_run_blocking_inside_current_thread_runtime() {
        // Would deadlock if the future were blocked on this runtime's thread.
        assert_eq!(run_blocking(fixed_value()).unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_blocking_inside_multi_thread_runtime() {
        assert_eq!(run_blocking(fixed_value()).unwrap(), 42);
    }

    #[test]
    fn test_both_paths_agree() {
        let direct = run_blocking(fixed_value()).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let nested = rt.block_on(async { run_blocking(fixed_value()).unwrap() });
        assert_eq!(direct, nested);
    }

    #[tokio::test]
    async fn test_worker_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            1
        };
        let err = run_blocking_with_timeout(slow, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_worker_panic_is_reported() {
        let boom = async {
            panic!("boom");
        };
        let err = run_blocking_with_timeout::<_>(boom, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, BridgeError::WorkerPanicked));
    }

    #[tokio::test]
    async fn test_io_runtime_runs_on_its_own_thread() {
        let io = IoRuntime::new("bridge-test-io").unwrap();
        let name = io
            .run(async { std::thread::current().name().map(String::from) })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("bridge-test-io"));
    }

    #[tokio::test]
    async fn test_io_runtime_progresses_while_caller_blocks() {
        // The caller's current-thread runtime is parked in run_blocking, yet
        // the timer registered on the io runtime still fires.
        let io = std::sync::Arc::new(IoRuntime::new("bridge-test-io").unwrap());
        let worker_io = io.clone();
        let out = run_blocking_with_timeout(
            async move {
                worker_io
                    .run(async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        7
                    })
                    .await
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_io_runtime_reports_panics() {
        let io = IoRuntime::new("bridge-test-io").unwrap();
        let result = io.run(async { panic!("boom") }).await;
        assert!(matches!(result, Err(BridgeError::WorkerPanicked)));
    }
}
