//! "Run a chunk, then yield" on top of the tokio runtime.
//!
//! Long passes are split into slices; between slices the running task hands control
//! back to the executor so lookups, input handling and other tasks interleave.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How a task gives way between two slices of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldPolicy {
  /// Sleep briefly so every other ready task runs first
  Idle(Duration),
  /// Re-queue at the back of the run queue without sleeping
  Immediate,
}

impl YieldPolicy {
  /// Idle scheduling when a delay is configured, zero-delay deferral otherwise.
  pub fn from_delay(delay: Duration) -> Self {
    if delay.is_zero() {
      YieldPolicy::Immediate
    } else {
      YieldPolicy::Idle(delay)
    }
  }

  /// Gives way once.
  pub async fn pause(self) {
    match self {
      YieldPolicy::Idle(delay) => tokio::time::sleep(delay).await,
      YieldPolicy::Immediate => tokio::task::yield_now().await,
    }
  }
}

/// Whether there is a runtime to post continuations to.
pub fn has_executor() -> bool {
  tokio::runtime::Handle::try_current().is_ok()
}

/// Posts a continuation to the current runtime.
/// Returns `None` when called outside a runtime so the caller can finish inline.
pub fn spawn_continuation<F>(future: F) -> Option<JoinHandle<()>>
where
  F: Future<Output = ()> + Send + 'static,
{
  match tokio::runtime::Handle::try_current() {
    Ok(handle) => Some(handle.spawn(future)),
    Err(_) => None,
  }
}
