use crate::cache::{RecomputeHandle, RecomputeProgress, SelectionCache};
use crate::config::EngineConfig;
use crate::folder_index::FolderIndex;
use crate::mutation::SelectionMutator;
use crate::offload::OffloadWorker;
use crate::overlay::OptimisticOverlay;
use crate::types::{FileRecord, MutationOutcome, SelectionReference, SelectionState};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Owns everything one file-tree session needs: index, cache, overlay,
/// mutator and the optional compute worker.
/// Build one per listing identity, call [`rebuild`](Self::rebuild) when the listing changes.
pub struct SelectionSession {
  config: EngineConfig,
  cache: SelectionCache,
  overlay: OptimisticOverlay,
  mutator: SelectionMutator,
}

impl SelectionSession {
  /// Creates a session over an empty listing.
  /// Spawns the compute worker when the config asks for it, a failed spawn is logged and ignored.
  pub fn new(config: EngineConfig) -> Self {
    let config = config.sanitized();
    let cache = SelectionCache::new(config.clone());

    if config.use_worker {
      match OffloadWorker::spawn() {
        Ok(worker) => cache.attach_worker(worker),
        Err(e) => warn!(error = %e, "could not start compute worker, recompute stays on this thread"),
      }
    }

    let overlay = OptimisticOverlay::new(config.overlay_capacity, config.overlay_ttl(), config.coalesce_window());
    let mutator = SelectionMutator::new(cache.clone());

    Self { config, cache, overlay, mutator }
  }

  /// Creates a session and indexes `files` right away.
  pub fn with_files(config: EngineConfig, files: &[FileRecord]) -> Self {
    let session = Self::new(config);
    session.rebuild(files);
    session
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Indexes a new listing and drops every state derived from the previous one.
  /// The selection list itself is kept.
  pub fn rebuild(&self, files: &[FileRecord]) {
    let index = Arc::new(FolderIndex::build(files));
    debug!(directories = index.directory_count(), files = index.file_count(), "rebuilding selection session");
    self.cache.rebuild(index);
    self.overlay.clear();
    self.cache.set_selected_paths(self.mutator.selected_snapshot());
  }

  /// Forgets computed and tentative states without touching the index.
  pub fn invalidate(&self) {
    self.cache.clear();
    self.overlay.clear();
    self.cache.set_selected_paths(self.mutator.selected_snapshot());
  }

  /// State shown for a directory: tentative value first, then the cache.
  pub fn get(&self, path: &str) -> SelectionState {
    self.overlay.get(path).unwrap_or_else(|| self.cache.get(path))
  }

  /// Optimistic folder toggle.
  pub async fn toggle_folder(&self, folder: &str, selected: bool) -> MutationOutcome {
    self.toggle_folder_with(folder, selected, true).await
  }

  /// Selects or deselects a folder's subtree.
  /// With `optimistic` set the intended state is visible before the mutation runs.
  pub async fn toggle_folder_with(&self, folder: &str, selected: bool, optimistic: bool) -> MutationOutcome {
    if !self.overlay.try_begin_folder_toggle() {
      debug!(folder, "coalesced folder toggle");
      return MutationOutcome::Coalesced;
    }

    let (total, already) = {
      let index = self.cache.index();
      let files = index.files_in_folder(folder);
      (files.len(), self.mutator.count_selected(files))
    };
    let settled = if selected { already == total } else { already == 0 };
    if total == 0 || settled {
      return MutationOutcome::Unchanged;
    }

    self.overlay.drop_settled();
    let _pending = if optimistic {
      let intended = if selected { SelectionState::Full } else { SelectionState::None };
      self.overlay.insert(folder, intended);
      self.cache.set(folder, intended);
      self.overlay.mark_pending(folder);
      Some(PendingGuard { overlay: &self.overlay, folder })
    } else {
      None
    };

    self.mutator.toggle_folder_selection(folder, selected).await
  }

  /// Flips one file.
  pub async fn toggle_file(&self, path: &str) -> MutationOutcome {
    self.overlay.drop_settled();
    self.mutator.toggle_file(path).await
  }

  /// Selects every selectable file of the displayed listing.
  pub async fn select_all(&self, displayed: &[FileRecord]) -> MutationOutcome {
    self.overlay.drop_settled();
    self.mutator.select_all_files(displayed).await
  }

  /// Deselects every file of the displayed listing.
  pub async fn deselect_all(&self, displayed: &[FileRecord]) -> MutationOutcome {
    self.overlay.drop_settled();
    self.mutator.deselect_all_files(displayed).await
  }

  /// Replaces the selection wholesale, as when restoring a saved workspace.
  pub fn replace_selection(&self, refs: Vec<SelectionReference>) -> MutationOutcome {
    self.overlay.drop_settled();
    self.mutator.replace_selection(refs)
  }

  /// Restarts the progressive pass against the current selection.
  pub fn recompute(&self) -> RecomputeHandle {
    self.mutator.recompute()
  }

  /// Directories visited first by every later pass, typically the expanded ones.
  pub fn set_priority_directories(&self, paths: Vec<String>) {
    self.mutator.set_priority_paths(paths);
  }

  pub fn selection(&self) -> Vec<SelectionReference> {
    self.mutator.selection()
  }

  /// Whether a file is in the selection, through either path variant.
  pub fn is_selected(&self, path: &str) -> bool {
    self.mutator.is_selected(path)
  }

  pub fn selected_file_count(&self) -> usize {
    self.mutator.selected_count()
  }

  pub fn is_computing(&self) -> bool {
    self.cache.is_computing()
  }

  pub fn progress(&self) -> f64 {
    self.cache.progress()
  }

  pub fn subscribe(&self) -> watch::Receiver<RecomputeProgress> {
    self.cache.subscribe()
  }

  /// Resolves once no pass is running.
  pub async fn wait_idle(&self) {
    self.cache.wait_idle().await;
  }

  pub fn cache(&self) -> &SelectionCache {
    &self.cache
  }

  pub fn overlay(&self) -> &OptimisticOverlay {
    &self.overlay
  }

  /// Cancels any pass, stops overlay timers and the compute worker.
  /// The session still answers lookups afterwards, on this thread only.
  pub fn shutdown(&self) {
    self.cache.cancel();
    self.overlay.clear();
    self.cache.detach_worker();
  }
}

impl Drop for SelectionSession {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Clears the folder's pending marker when the toggle ends, even if it was dropped midway.
struct PendingGuard<'a> {
  overlay: &'a OptimisticOverlay,
  folder: &'a str,
}

impl Drop for PendingGuard<'_> {
  fn drop(&mut self) {
    self.overlay.complete(self.folder);
  }
}
