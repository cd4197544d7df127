use crate::config::EngineConfig;
use crate::error::SelectionResult;
use crate::folder_index::FolderIndex;
use crate::offload::{ComputeRequest, OffloadWorker, WorkerReply};
use crate::path_key;
use crate::scheduler::{self, YieldPolicy};
use crate::types::{BatchCallback, RecomputeOptions, SelectionState};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Snapshot of the recompute indicator, published on every change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecomputeProgress {
  /// Task the snapshot belongs to
  pub task_id: u64,
  /// Whether a progressive pass is running
  pub computing: bool,
  /// Completed fraction in [0, 1]
  pub fraction: f64,
}

impl Default for RecomputeProgress {
  fn default() -> Self {
    Self {
      task_id: 0,
      computing: false,
      fraction: 1.0,
    }
  }
}

/// Builds a selected-path snapshot keyed the way the cache compares paths.
pub fn selected_set<I, S>(paths: I) -> HashSet<String>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  paths.into_iter().map(|path| path_key::canonical(path.as_ref())).filter(|key| !key.is_empty()).collect()
}

/// Authoritative tri-state per directory.
/// Cheap to clone, every clone talks to the same cache.
#[derive(Clone)]
pub struct SelectionCache {
  inner: Arc<CacheInner>,
}

struct CacheInner {
  config: EngineConfig,
  state: RwLock<CacheState>,
  offload: Mutex<Option<OffloadWorker>>,
  progress_tx: watch::Sender<RecomputeProgress>,
}

struct CacheState {
  /// Canonical directory key -> computed state
  entries: HashMap<String, SelectionState>,
  index: Arc<FolderIndex>,
  selected: Arc<HashSet<String>>,
  /// Set once a progressive pass has covered every directory
  fully_computed: bool,
  computing: bool,
  progress: f64,
  /// The current task, anything tagged with an older id is discarded
  task_id: u64,
  /// Continuation or worker listener of the current task
  task: Option<JoinHandle<()>>,
  /// Cancels the worker side of the current task
  worker_cancel: Option<CancellationToken>,
}

impl CacheState {
  /// Invalidates the current task and releases its handles.
  fn supersede(&mut self) -> u64 {
    self.task_id += 1;
    if let Some(task) = self.task.take() {
      task.abort();
    }
    if let Some(token) = self.worker_cancel.take() {
      token.cancel();
    }
    self.task_id
  }

  fn snapshot(&self) -> RecomputeProgress {
    RecomputeProgress {
      task_id: self.task_id,
      computing: self.computing,
      fraction: self.progress,
    }
  }
}

impl SelectionCache {
  /// Creates an empty cache over an empty index.
  pub fn new(config: EngineConfig) -> Self {
    let (progress_tx, _) = watch::channel(RecomputeProgress::default());
    Self {
      inner: Arc::new(CacheInner {
        config,
        state: RwLock::new(CacheState {
          entries: HashMap::new(),
          index: Arc::new(FolderIndex::default()),
          selected: Arc::new(HashSet::new()),
          fully_computed: false,
          computing: false,
          progress: 1.0,
          task_id: 0,
          task: None,
          worker_cancel: None,
        }),
        offload: Mutex::new(None),
        progress_tx,
      }),
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  /// Swaps in the index of a new file listing and drops everything derived from the old one.
  pub fn rebuild(&self, index: Arc<FolderIndex>) {
    {
      let mut state = self.inner.state.write();
      state.index = index.clone();
    }
    self.clear();

    let mut offload = self.inner.offload.lock();
    if let Some(worker) = offload.as_ref() {
      if let Err(e) = worker.init(index) {
        warn!(error = %e, "compute worker rejected the new index, continuing without it");
        *offload = None;
      }
    }
  }

  /// Hands a background worker to the cache and sends it the current index.
  pub fn attach_worker(&self, worker: OffloadWorker) {
    let index = self.inner.state.read().index.clone();
    match worker.init(index) {
      Ok(()) => *self.inner.offload.lock() = Some(worker),
      Err(e) => warn!(error = %e, "compute worker failed to initialize, recompute stays on this thread"),
    }
  }

  /// Stops and drops the background worker, if any.
  pub fn detach_worker(&self) {
    if let Some(worker) = self.inner.offload.lock().take() {
      worker.shutdown();
    }
  }

  pub fn has_worker(&self) -> bool {
    self.inner.offload.lock().is_some()
  }

  pub fn index(&self) -> Arc<FolderIndex> {
    self.inner.state.read().index.clone()
  }

  /// Looks up a directory.
  /// Misses are computed on the spot only until the first full pass has finished,
  /// afterwards an unknown path is `None`.
  pub fn get(&self, path: &str) -> SelectionState {
    let key = path_key::canonical(path);
    if key.is_empty() {
      return SelectionState::None;
    }

    let (index, selected) = {
      let state = self.inner.state.read();
      if let Some(cached) = state.entries.get(&key) {
        return *cached;
      }
      if state.fully_computed {
        return SelectionState::None;
      }
      (state.index.clone(), state.selected.clone())
    };

    let computed = index.compute_state(&key, &selected);

    let mut state = self.inner.state.write();
    if !state.fully_computed && Arc::ptr_eq(&state.index, &index) {
      return *state.entries.entry(key).or_insert(computed);
    }
    computed
  }

  /// Cached value without computing anything.
  pub fn peek(&self, path: &str) -> Option<SelectionState> {
    self.inner.state.read().entries.get(&path_key::canonical(path)).copied()
  }

  /// Writes one directory state, invalid paths are logged and ignored.
  pub fn set(&self, path: &str, selection: SelectionState) {
    if let Err(e) = path_key::validate(path) {
      warn!(path, error = %e, "ignoring cache write");
      return;
    }
    self.inner.state.write().entries.insert(path_key::canonical(path), selection);
  }

  /// Applies many writes under a single lock so readers never see half of them.
  /// Invalid entries are logged and skipped, returns how many were applied.
  pub fn bulk_update<I, S>(&self, updates: I) -> usize
  where
    I: IntoIterator<Item = (S, SelectionState)>,
    S: AsRef<str>,
  {
    let valid: Vec<(String, SelectionState)> = updates
      .into_iter()
      .filter_map(|(path, selection)| {
        let path = path.as_ref();
        match path_key::validate(path) {
          Ok(()) => Some((path_key::canonical(path), selection)),
          Err(e) => {
            warn!(path, error = %e, "skipping bulk update entry");
            None
          }
        }
      })
      .collect();

    let applied = valid.len();
    self.inner.state.write().entries.extend(valid);
    applied
  }

  /// Empties the cache, re-enables on-demand compute and cancels any running pass.
  pub fn clear(&self) {
    let mut state = self.inner.state.write();
    state.entries.clear();
    state.fully_computed = false;
    let task_id = state.supersede();
    state.computing = false;
    state.progress = 1.0;
    self.inner.progress_tx.send_replace(state.snapshot());
    debug!(task_id, "selection cache cleared");
  }

  pub fn is_computing(&self) -> bool {
    self.inner.state.read().computing
  }

  pub fn progress(&self) -> f64 {
    self.inner.state.read().progress
  }

  pub fn len(&self) -> usize {
    self.inner.state.read().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Subscribes to progress snapshots.
  pub fn subscribe(&self) -> watch::Receiver<RecomputeProgress> {
    self.inner.progress_tx.subscribe()
  }

  /// Resolves once no pass is running.
  pub async fn wait_idle(&self) {
    let mut progress = self.subscribe();
    // sender lives as long as the cache, so this only ends once idle
    let _ = progress.wait_for(|snapshot| !snapshot.computing).await;
  }

  /// Replaces the selection snapshot used by later computations.
  /// Does not start a recompute by itself.
  pub fn set_selected_paths(&self, selected: Arc<HashSet<String>>) {
    self.inner.state.write().selected = selected;
  }

  pub fn selected_paths(&self) -> Arc<HashSet<String>> {
    self.inner.state.read().selected.clone()
  }

  /// Starts a progressive pass over every directory, superseding any running pass.
  /// The first batch is applied before this returns.
  pub fn start_progressive_recompute(&self, selected: Arc<HashSet<String>>, options: RecomputeOptions) -> RecomputeHandle {
    let batch_size = self.inner.config.clamp_batch_size(options.batch_size);

    let (task_id, index) = {
      let mut state = self.inner.state.write();
      let task_id = state.supersede();
      state.selected = selected.clone();
      state.computing = true;
      state.progress = 0.0;
      self.inner.progress_tx.send_replace(state.snapshot());
      (task_id, state.index.clone())
    };
    let handle = RecomputeHandle { cache: self.clone(), task_id };

    let total = index.directory_count();
    debug!(task_id, total, batch_size, "starting progressive recompute");
    if total == 0 {
      self.finish(task_id, true);
      return handle;
    }

    if total > self.inner.config.offload_threshold {
      match self.try_offload(task_id, total, &selected, &options, batch_size) {
        Ok(true) => return handle,
        Ok(false) => {}
        Err(e) => {
          warn!(task_id, error = %e, "compute worker unavailable, falling back to cooperative batches");
          self.inner.offload.lock().take();
        }
      }
    }

    let mut run = LocalRun {
      cache: self.clone(),
      task_id,
      order: index.order_directories(&options.priority_paths),
      index,
      selected,
      next: 0,
      batch_size,
      on_batch: options.on_batch,
    };

    if !run.step() {
      return handle;
    }

    if !scheduler::has_executor() {
      // no executor to yield to, nothing else would ever finish the pass
      warn!(task_id, "no async runtime, finishing recompute inline");
      while run.step() {}
      return handle;
    }

    let policy = YieldPolicy::from_delay(self.inner.config.idle_delay());
    let continuation = scheduler::spawn_continuation(async move {
      loop {
        policy.pause().await;
        if !run.step() {
          break;
        }
      }
    });
    if let Some(task) = continuation {
      self.store_task(task_id, task, None);
    }

    handle
  }

  /// Cancels whatever pass is running.
  pub fn cancel(&self) {
    self.cancel_task(self.current_task_id());
  }

  /// Sends the pass to the worker and attaches a listener for its replies.
  /// `Ok(false)` means no worker is attached.
  fn try_offload(&self, task_id: u64, total: usize, selected: &Arc<HashSet<String>>, options: &RecomputeOptions, batch_size: usize) -> SelectionResult<bool> {
    if !scheduler::has_executor() {
      return Ok(false);
    }
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    {
      let offload = self.inner.offload.lock();
      let Some(worker) = offload.as_ref() else {
        return Ok(false);
      };
      worker.compute(ComputeRequest {
        task_id,
        selected: selected.clone(),
        priority_paths: options.priority_paths.clone(),
        batch_size,
        cancel: cancel.clone(),
        reply: reply_tx,
      })?;
    }

    let cache = self.clone();
    let on_batch = options.on_batch.clone();
    let listener = scheduler::spawn_continuation(async move {
      cache.listen(task_id, total, reply_rx, on_batch).await;
    });

    match listener {
      Some(task) => {
        debug!(task_id, "recompute delegated to compute worker");
        self.store_task(task_id, task, Some(cancel));
        Ok(true)
      }
      None => {
        cancel.cancel();
        Ok(false)
      }
    }
  }

  /// Applies worker batches for one task until it is done or superseded.
  async fn listen(&self, task_id: u64, total: usize, mut replies: mpsc::UnboundedReceiver<WorkerReply>, on_batch: Option<BatchCallback>) {
    let mut applied = 0;

    while let Some(reply) = replies.recv().await {
      match reply {
        WorkerReply::Batch { task_id: reply_task, updates } => {
          if reply_task != task_id {
            trace!(task_id, reply_task, "ignoring batch for another task");
            continue;
          }
          let received = updates.len();
          let decoded = decode_batch(updates);
          applied += received;
          if !self.apply_batch(task_id, decoded, applied, total) {
            return;
          }
          if let Some(callback) = &on_batch {
            callback(received, applied);
          }
        }
        WorkerReply::Done { task_id: reply_task } => {
          if reply_task == task_id {
            self.finish(task_id, true);
            return;
          }
        }
      }
    }

    // worker went away mid-pass
    warn!(task_id, applied, total, "compute worker stopped replying");
    self.finish(task_id, false);
  }

  /// Writes one batch if `task_id` is still current.
  /// `applied` is the running total including this batch.
  fn apply_batch(&self, task_id: u64, updates: Vec<(String, SelectionState)>, applied: usize, total: usize) -> bool {
    let mut state = self.inner.state.write();
    if state.task_id != task_id {
      trace!(task_id, current = state.task_id, "discarding stale batch");
      return false;
    }

    state.entries.extend(updates);
    let fraction = if total == 0 { 1.0 } else { (applied as f64 / total as f64).min(1.0) };
    state.progress = state.progress.max(fraction);

    if applied >= total {
      state.computing = false;
      state.progress = 1.0;
      state.fully_computed = true;
      state.task = None;
      state.worker_cancel = None;
    }
    self.inner.progress_tx.send_replace(state.snapshot());
    true
  }

  /// Marks the task finished if it is still current.
  fn finish(&self, task_id: u64, completed: bool) {
    let mut state = self.inner.state.write();
    if state.task_id != task_id {
      return;
    }
    state.computing = false;
    state.progress = 1.0;
    state.fully_computed |= completed;
    state.task = None;
    state.worker_cancel = None;
    self.inner.progress_tx.send_replace(state.snapshot());
  }

  fn store_task(&self, task_id: u64, task: JoinHandle<()>, worker_cancel: Option<CancellationToken>) {
    let mut state = self.inner.state.write();
    if state.task_id != task_id || !state.computing {
      // superseded or already finished while we were spawning
      if state.task_id != task_id {
        task.abort();
        if let Some(token) = worker_cancel {
          token.cancel();
        }
      }
      return;
    }
    state.task = Some(task);
    state.worker_cancel = worker_cancel;
  }

  /// Cancels `task_id` if it is still the current task.
  fn cancel_task(&self, task_id: u64) {
    {
      let mut state = self.inner.state.write();
      if state.task_id != task_id {
        return;
      }
      state.supersede();
      state.computing = false;
      state.progress = 1.0;
      self.inner.progress_tx.send_replace(state.snapshot());
    }

    if let Some(worker) = self.inner.offload.lock().as_ref() {
      // best effort, the token already stopped the worker side
      let _ = worker.cancel(task_id);
    }
    debug!(task_id, "recompute cancelled");
  }

  fn current_task_id(&self) -> u64 {
    self.inner.state.read().task_id
  }
}

/// Turns worker codes back into states, dropping anything malformed.
fn decode_batch(updates: Vec<(String, char)>) -> Vec<(String, SelectionState)> {
  updates
    .into_iter()
    .filter_map(|(path, code)| match SelectionState::from_code(code) {
      Ok(selection) => Some((path, selection)),
      Err(e) => {
        warn!(path, error = %e, "dropping worker update");
        None
      }
    })
    .collect()
}

/// A main-thread pass, advanced one batch at a time.
struct LocalRun {
  cache: SelectionCache,
  task_id: u64,
  index: Arc<FolderIndex>,
  selected: Arc<HashSet<String>>,
  order: Vec<String>,
  next: usize,
  batch_size: usize,
  on_batch: Option<BatchCallback>,
}

impl LocalRun {
  /// Computes and applies the next batch.
  /// Returns false once the pass is complete or superseded.
  fn step(&mut self) -> bool {
    let total = self.order.len();
    let end = (self.next + self.batch_size).min(total);
    let updates: Vec<(String, SelectionState)> = self.order[self.next..end].iter().map(|dir| (dir.clone(), self.index.compute_state(dir, &self.selected))).collect();
    let batch_len = updates.len();

    if !self.cache.apply_batch(self.task_id, updates, end, total) {
      return false;
    }
    self.next = end;

    if let Some(callback) = &self.on_batch {
      callback(batch_len, end);
    }
    end < total
  }
}

/// Handle to one progressive pass.
#[derive(Clone)]
pub struct RecomputeHandle {
  cache: SelectionCache,
  task_id: u64,
}

impl RecomputeHandle {
  pub fn task_id(&self) -> u64 {
    self.task_id
  }

  /// Whether no newer pass has started and this one was not cancelled.
  pub fn is_current(&self) -> bool {
    self.cache.current_task_id() == self.task_id
  }

  /// Stops the pass. Safe to call repeatedly and after a newer pass started.
  pub fn cancel(&self) {
    self.cache.cancel_task(self.task_id);
  }
}

impl std::fmt::Debug for RecomputeHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RecomputeHandle").field("task_id", &self.task_id).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::FileRecord;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tracing_test::traced_test;

  fn tiny_batches() -> EngineConfig {
    EngineConfig {
      min_batch_size: 1,
      max_batch_size: 1,
      ..EngineConfig::default()
    }
  }

  fn sample_index() -> Arc<FolderIndex> {
    Arc::new(FolderIndex::build(&[
      FileRecord::file("/p/a.ts"),
      FileRecord::file("/p/b.ts"),
      FileRecord::binary("/p/c.bin"),
      FileRecord::file("/p/src/main.rs"),
      FileRecord::file("/p/src/lib.rs"),
      FileRecord::file("/q/readme.md"),
    ]))
  }

  fn cache_with(config: EngineConfig) -> SelectionCache {
    let cache = SelectionCache::new(config);
    cache.rebuild(sample_index());
    cache
  }

  #[test]
  fn test_get_computes_on_demand_before_first_pass() {
    let cache = cache_with(EngineConfig::default());
    cache.set_selected_paths(Arc::new(selected_set(["/p/a.ts"])));

    assert_eq!(cache.get("/p"), SelectionState::Partial);
    assert_eq!(cache.get("p"), SelectionState::Partial);
    assert_eq!(cache.peek("/p"), Some(SelectionState::Partial));
    assert_eq!(cache.get("/q"), SelectionState::None);
    assert_eq!(cache.get(""), SelectionState::None);
  }

  #[test]
  fn test_unknown_path_is_none_after_full_pass() {
    let cache = cache_with(EngineConfig::default());
    // small tree, the whole pass fits in the first synchronous batch
    cache.start_progressive_recompute(Arc::new(selected_set(["/p/a.ts"])), RecomputeOptions::default());
    assert!(!cache.is_computing());

    assert_eq!(cache.get("/nowhere"), SelectionState::None);
    assert_eq!(cache.peek("/nowhere"), None);
  }

  #[test]
  fn test_set_writes_both_variants() {
    let cache = cache_with(EngineConfig::default());
    cache.set("/p/src", SelectionState::Full);
    assert_eq!(cache.peek("p/src"), Some(SelectionState::Full));
    assert_eq!(cache.get("/p/src"), cache.get("p/src"));

    cache.set("p/src", SelectionState::None);
    assert_eq!(cache.peek("/p/src"), Some(SelectionState::None));
  }

  #[test]
  #[traced_test]
  fn test_invalid_writes_are_logged_and_ignored() {
    let cache = cache_with(EngineConfig::default());
    cache.set("", SelectionState::Full);
    assert!(cache.is_empty());

    let applied = cache.bulk_update([("/p", SelectionState::Full), ("  ", SelectionState::Partial), ("/q", SelectionState::None)]);
    assert_eq!(applied, 2);
    assert_eq!(cache.peek("/p"), Some(SelectionState::Full));
    assert_eq!(cache.peek("/q"), Some(SelectionState::None));
    assert!(logs_contain("skipping bulk update entry"));
  }

  #[test]
  fn test_clear_reenables_on_demand_compute() {
    let cache = cache_with(EngineConfig::default());
    cache.start_progressive_recompute(Arc::new(HashSet::new()), RecomputeOptions::default());
    cache.clear();

    assert!(cache.is_empty());
    assert!(!cache.is_computing());
    assert_eq!(cache.progress(), 1.0);

    cache.set_selected_paths(Arc::new(selected_set(["/q/readme.md"])));
    assert_eq!(cache.get("/q"), SelectionState::Full);
  }

  #[test]
  fn test_decode_batch_drops_unknown_codes() {
    let decoded = decode_batch(vec![("p".to_string(), 'f'), ("q".to_string(), 'z'), ("r".to_string(), 'n')]);
    assert_eq!(decoded, vec![("p".to_string(), SelectionState::Full), ("r".to_string(), SelectionState::None)]);
  }

  #[tokio::test]
  async fn test_progressive_recompute_matches_direct_compute() {
    let cache = cache_with(tiny_batches());
    let selected = Arc::new(selected_set(["/p/a.ts", "/p/b.ts", "/p/src/main.rs"]));
    let handle = cache.start_progressive_recompute(selected, RecomputeOptions::default());
    assert!(handle.is_current());
    cache.wait_idle().await;

    assert_eq!(cache.get("/p"), SelectionState::Partial);
    assert_eq!(cache.get("/p/src"), SelectionState::Partial);
    assert_eq!(cache.get("/q"), SelectionState::None);
    assert_eq!(cache.progress(), 1.0);
  }

  #[tokio::test]
  async fn test_batches_report_progress_in_order() {
    let cache = cache_with(tiny_batches());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = RecomputeOptions {
      on_batch: Some(Arc::new(move |size, total| sink.lock().push((size, total)))),
      ..RecomputeOptions::default()
    };

    let mut progress = cache.subscribe();
    cache.start_progressive_recompute(Arc::new(HashSet::new()), options);

    let mut last = 0.0;
    loop {
      let snapshot = *progress.borrow_and_update();
      assert!(snapshot.fraction >= last, "progress went backwards");
      last = snapshot.fraction;
      if !snapshot.computing {
        break;
      }
      progress.changed().await.unwrap();
    }

    assert_eq!(last, 1.0);
    assert_eq!(*seen.lock(), vec![(1, 1), (1, 2), (1, 3)]);
  }

  #[tokio::test]
  async fn test_priority_directories_are_computed_first() {
    let cache = cache_with(tiny_batches());
    let options = RecomputeOptions {
      priority_paths: vec!["/p/src".to_string()],
      ..RecomputeOptions::default()
    };
    cache.start_progressive_recompute(Arc::new(selected_set(["/p/src/lib.rs"])), options);

    // only the first batch has landed so far
    assert_eq!(cache.peek("/p/src"), Some(SelectionState::Partial));
    assert_eq!(cache.peek("/p"), None);
    cache.wait_idle().await;
    assert_eq!(cache.peek("/p"), Some(SelectionState::Partial));
  }

  #[tokio::test]
  async fn test_new_pass_supersedes_running_pass() {
    let cache = cache_with(tiny_batches());
    let first = cache.start_progressive_recompute(Arc::new(selected_set(["/p/a.ts", "/p/b.ts", "/p/src/main.rs", "/p/src/lib.rs", "/q/readme.md"])), RecomputeOptions::default());
    let second = cache.start_progressive_recompute(Arc::new(HashSet::new()), RecomputeOptions::default());

    assert!(!first.is_current());
    assert!(second.is_current());

    // a batch from the first pass arriving late must be rejected
    assert!(!cache.apply_batch(first.task_id(), vec![("q".to_string(), SelectionState::Full)], 3, 3));

    cache.wait_idle().await;
    for dir in ["/p", "/p/src", "/q"] {
      assert_eq!(cache.get(dir), SelectionState::None, "{dir} kept a value from the superseded pass");
    }
  }

  #[tokio::test]
  async fn test_cancel_forces_progress_complete() {
    let cache = cache_with(tiny_batches());
    let handle = cache.start_progressive_recompute(Arc::new(HashSet::new()), RecomputeOptions::default());
    assert!(cache.is_computing());

    handle.cancel();
    handle.cancel();
    assert!(!cache.is_computing());
    assert_eq!(cache.progress(), 1.0);
    assert!(!handle.is_current());

    // the aborted continuation never writes again
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(cache.len(), 1);
  }

  #[tokio::test]
  async fn test_cancel_of_superseded_handle_leaves_new_pass_alone() {
    let cache = cache_with(tiny_batches());
    let first = cache.start_progressive_recompute(Arc::new(HashSet::new()), RecomputeOptions::default());
    let second = cache.start_progressive_recompute(Arc::new(HashSet::new()), RecomputeOptions::default());

    first.cancel();
    assert!(second.is_current());
    assert!(cache.is_computing());
    cache.wait_idle().await;
    assert_eq!(cache.len(), 3);
  }

  #[tokio::test]
  async fn test_offloaded_pass_matches_local_pass() {
    let config = EngineConfig {
      offload_threshold: 0,
      min_batch_size: 1,
      max_batch_size: 2,
      ..EngineConfig::default()
    };
    let cache = cache_with(config);
    cache.attach_worker(OffloadWorker::spawn().unwrap());
    assert!(cache.has_worker());

    let batches = Arc::new(AtomicUsize::new(0));
    let counter = batches.clone();
    let options = RecomputeOptions {
      batch_size: Some(2),
      on_batch: Some(Arc::new(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
      })),
      ..RecomputeOptions::default()
    };
    cache.start_progressive_recompute(Arc::new(selected_set(["/p/a.ts", "/p/b.ts", "/p/src/main.rs", "/p/src/lib.rs"])), options);
    cache.wait_idle().await;

    assert_eq!(cache.get("/p"), SelectionState::Full);
    assert_eq!(cache.get("/p/src"), SelectionState::Full);
    assert_eq!(cache.get("/q"), SelectionState::None);
    assert_eq!(batches.load(Ordering::SeqCst), 2);
    cache.detach_worker();
  }

  #[tokio::test]
  async fn test_offloaded_pass_superseded_mid_flight() {
    let config = EngineConfig {
      offload_threshold: 0,
      min_batch_size: 1,
      max_batch_size: 1,
      ..EngineConfig::default()
    };
    let cache = cache_with(config);
    cache.attach_worker(OffloadWorker::spawn().unwrap());

    let first_batches = Arc::new(AtomicUsize::new(0));
    let counter = first_batches.clone();
    let first_options = RecomputeOptions {
      on_batch: Some(Arc::new(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
      })),
      ..RecomputeOptions::default()
    };
    let everything = Arc::new(selected_set(["/p/a.ts", "/p/b.ts", "/p/src/main.rs", "/p/src/lib.rs", "/q/readme.md"]));
    let first = cache.start_progressive_recompute(everything, first_options);
    // the worker is already streaming the first task's batches
    let second = cache.start_progressive_recompute(Arc::new(HashSet::new()), RecomputeOptions::default());
    assert!(!first.is_current());
    assert!(second.is_current());

    cache.wait_idle().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(first_batches.load(Ordering::SeqCst), 0);
    for dir in ["/p", "/p/src", "/q"] {
      assert_eq!(cache.peek(dir), Some(SelectionState::None), "{dir} kept a value from the superseded pass");
    }

    // a reply for the old task that was already queued is dropped by its listener
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    reply_tx.send(WorkerReply::Batch { task_id: first.task_id(), updates: vec![("p".to_string(), 'f')] }).unwrap();
    reply_tx.send(WorkerReply::Done { task_id: first.task_id() }).unwrap();
    drop(reply_tx);
    cache.listen(first.task_id(), 3, reply_rx, None).await;

    assert_eq!(cache.peek("/p"), Some(SelectionState::None));
    assert!(second.is_current());
    assert!(!cache.is_computing());
    cache.detach_worker();
  }

  #[tokio::test]
  #[traced_test]
  async fn test_dead_worker_falls_back_to_local_pass() {
    let config = EngineConfig {
      offload_threshold: 0,
      ..EngineConfig::default()
    };
    let cache = cache_with(config);
    *cache.inner.offload.lock() = Some(OffloadWorker::disconnected());

    cache.start_progressive_recompute(Arc::new(selected_set(["/q/readme.md"])), RecomputeOptions::default());
    cache.wait_idle().await;

    assert!(!cache.has_worker());
    assert_eq!(cache.get("/q"), SelectionState::Full);
    assert!(logs_contain("falling back to cooperative batches"));
  }
}
