//! Background thread that owns a copy of the folder index and computes
//! directory states for large trees.
//!
//! All communication is via channels: `WorkerRequest` in, `WorkerReply` out on a
//! reply channel that belongs to a single task. Dropping that receiver is how the
//! cache detaches from a task it no longer cares about.

use crate::error::{SelectionError, SelectionResult};
use crate::folder_index::FolderIndex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Messages the worker understands.
#[derive(Debug)]
pub enum WorkerRequest {
  /// Replace the worker's index, sent once per index build
  Init { index: Arc<FolderIndex> },
  /// Compute every directory and stream the results back
  Compute(ComputeRequest),
  /// Best effort, the token on the compute request is what actually stops it
  Cancel { task_id: u64 },
  /// Exit the worker loop
  Shutdown,
}

/// A full progressive computation request.
#[derive(Debug)]
pub struct ComputeRequest {
  pub task_id: u64,
  pub selected: Arc<HashSet<String>>,
  pub priority_paths: Vec<String>,
  pub batch_size: usize,
  pub cancel: CancellationToken,
  pub reply: mpsc::UnboundedSender<WorkerReply>,
}

/// Messages the worker sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
  /// Directory states encoded as `f`/`p`/`n`
  Batch { task_id: u64, updates: Vec<(String, char)> },
  /// Every batch of the task has been sent
  Done { task_id: u64 },
}

/// Handle to the compute thread.
/// The thread exits on `Shutdown` or when the handle is dropped.
#[derive(Debug)]
pub struct OffloadWorker {
  sender: mpsc::UnboundedSender<WorkerRequest>,
  thread: Option<thread::JoinHandle<()>>,
}

impl OffloadWorker {
  /// Starts the compute thread.
  pub fn spawn() -> SelectionResult<Self> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let thread = thread::Builder::new()
      .name("treesel-compute".to_string())
      .spawn(move || worker_loop(receiver))
      .map_err(|e| SelectionError::WorkerSpawn(e.to_string()))?;

    Ok(Self { sender, thread: Some(thread) })
  }

  /// Sends a fresh index to the worker.
  pub fn init(&self, index: Arc<FolderIndex>) -> SelectionResult<()> {
    self.send(WorkerRequest::Init { index })
  }

  /// Queues a computation.
  pub fn compute(&self, request: ComputeRequest) -> SelectionResult<()> {
    self.send(WorkerRequest::Compute(request))
  }

  pub fn cancel(&self, task_id: u64) -> SelectionResult<()> {
    self.send(WorkerRequest::Cancel { task_id })
  }

  /// Asks the thread to exit without waiting for it.
  pub fn shutdown(mut self) {
    let _ = self.sender.send(WorkerRequest::Shutdown);
    // detach, a running batch finishes on its own
    self.thread.take();
  }

  fn send(&self, request: WorkerRequest) -> SelectionResult<()> {
    self.sender.send(request).map_err(|_| SelectionError::WorkerDisconnected)
  }

  /// A handle whose thread is already gone.
  #[cfg(test)]
  pub(crate) fn disconnected() -> Self {
    let (sender, receiver) = mpsc::unbounded_channel();
    drop(receiver);
    Self { sender, thread: None }
  }
}

impl Drop for OffloadWorker {
  fn drop(&mut self) {
    let _ = self.sender.send(WorkerRequest::Shutdown);
  }
}

/// Entry point of the compute thread.
/// Loops over requests until shutdown or until every sender is gone.
fn worker_loop(mut receiver: mpsc::UnboundedReceiver<WorkerRequest>) {
  let mut index = Arc::new(FolderIndex::default());

  while let Some(request) = receiver.blocking_recv() {
    match request {
      WorkerRequest::Init { index: next } => {
        debug!(directories = next.directory_count(), "compute worker received index");
        index = next;
      }
      WorkerRequest::Compute(request) => compute(&index, request),
      WorkerRequest::Cancel { task_id } => {
        trace!(task_id, "cancel reached compute worker");
      }
      WorkerRequest::Shutdown => break,
    }
  }

  debug!("compute worker stopped");
}

/// Streams one task's batches back to its listener.
fn compute(index: &FolderIndex, request: ComputeRequest) {
  let ComputeRequest {
    task_id,
    selected,
    priority_paths,
    batch_size,
    cancel,
    reply,
  } = request;

  let order = index.order_directories(&priority_paths);
  for chunk in order.chunks(batch_size.max(1)) {
    if cancel.is_cancelled() {
      trace!(task_id, "compute worker dropped cancelled task");
      return;
    }

    let updates = chunk.iter().map(|dir| (dir.clone(), index.compute_state(dir, &selected).code())).collect();
    if reply.send(WorkerReply::Batch { task_id, updates }).is_err() {
      // listener detached
      return;
    }
  }

  let _ = reply.send(WorkerReply::Done { task_id });
}
