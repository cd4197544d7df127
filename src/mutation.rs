use crate::cache::{RecomputeHandle, SelectionCache};
use crate::path_key;
use crate::scheduler::YieldPolicy;
use crate::types::{FileRecord, MutationOutcome, RecomputeOptions, SelectionReference};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// The canonical selection list plus its key set.
#[derive(Debug, Default)]
struct SelectionList {
  refs: Vec<SelectionReference>,
  /// Canonical paths of `refs`
  keys: HashSet<String>,
}

impl SelectionList {
  fn from_refs(refs: Vec<SelectionReference>) -> Self {
    let mut list = SelectionList::default();
    for reference in refs {
      let key = path_key::canonical(&reference.path);
      if !key.is_empty() && list.keys.insert(key) {
        list.refs.push(reference);
      }
    }
    list
  }
}

/// Turns gestures into edits of the canonical selection list.
/// Large edits are applied in chunks with a yield between chunks, and every
/// committed chunk restarts the progressive recompute.
pub struct SelectionMutator {
  list: RwLock<SelectionList>,
  cache: SelectionCache,
  priority_paths: RwLock<Vec<String>>,
  add_chunk_size: usize,
  remove_chunk_size: usize,
}

impl SelectionMutator {
  pub fn new(cache: SelectionCache) -> Self {
    let add_chunk_size = cache.config().add_chunk_size.max(1);
    let remove_chunk_size = cache.config().remove_chunk_size.max(1);
    Self {
      list: RwLock::new(SelectionList::default()),
      cache,
      priority_paths: RwLock::new(Vec::new()),
      add_chunk_size,
      remove_chunk_size,
    }
  }

  /// The canonical list, in selection order.
  pub fn selection(&self) -> Vec<SelectionReference> {
    self.list.read().refs.clone()
  }

  pub fn selected_count(&self) -> usize {
    self.list.read().refs.len()
  }

  pub fn is_selected(&self, path: &str) -> bool {
    self.list.read().keys.contains(&path_key::canonical(path))
  }

  /// How many of `paths` are currently selected.
  pub fn count_selected(&self, paths: &[String]) -> usize {
    let list = self.list.read();
    paths.iter().filter(|path| list.keys.contains(&path_key::canonical(path))).count()
  }

  /// Canonical keys of the current selection.
  pub fn selected_snapshot(&self) -> Arc<HashSet<String>> {
    Arc::new(self.list.read().keys.clone())
  }

  /// Directories every later recompute visits first.
  pub fn set_priority_paths(&self, paths: Vec<String>) {
    *self.priority_paths.write() = paths;
  }

  /// Restarts the progressive pass against the current selection.
  pub fn recompute(&self) -> RecomputeHandle {
    let snapshot = self.selected_snapshot();
    self.cache.set_selected_paths(snapshot.clone());
    let options = RecomputeOptions {
      priority_paths: self.priority_paths.read().clone(),
      ..RecomputeOptions::default()
    };
    self.cache.start_progressive_recompute(snapshot, options)
  }

  /// Selects or deselects every selectable file under a folder.
  pub async fn toggle_folder_selection(&self, folder: &str, selected: bool) -> MutationOutcome {
    let index = self.cache.index();
    let files = index.files_in_folder(folder).to_vec();
    if selected {
      self.add_paths(files).await
    } else {
      self.remove_paths(files).await
    }
  }

  /// Selects every selectable file of the displayed listing.
  pub async fn select_all_files(&self, displayed: &[FileRecord]) -> MutationOutcome {
    self.add_paths(selectable_paths(displayed)).await
  }

  /// Deselects every file of the displayed listing.
  pub async fn deselect_all_files(&self, displayed: &[FileRecord]) -> MutationOutcome {
    self.remove_paths(displayed.iter().filter(|record| !record.is_directory).map(|record| record.path.clone()).collect()).await
  }

  /// Flips a single file. Line ranges go with it when it is deselected.
  pub async fn toggle_file(&self, path: &str) -> MutationOutcome {
    if self.is_selected(path) {
      self.remove_paths(vec![path.to_string()]).await
    } else if self.cache.index().contains_file(path) {
      self.add_paths(vec![path.to_string()]).await
    } else {
      debug!(path, "ignoring toggle of a file that cannot be selected");
      MutationOutcome::Unchanged
    }
  }

  /// Replaces the whole list, first occurrence of a path wins.
  pub fn replace_selection(&self, refs: Vec<SelectionReference>) -> MutationOutcome {
    let next = SelectionList::from_refs(refs);
    {
      let mut list = self.list.write();
      if list.refs == next.refs {
        return MutationOutcome::Unchanged;
      }
      *list = next;
    }
    let count = self.selected_count();
    self.recompute();
    MutationOutcome::Applied(count)
  }

  /// Merges paths into the list chunk by chunk.
  pub async fn add_paths(&self, paths: Vec<String>) -> MutationOutcome {
    let additions: Vec<String> = {
      let list = self.list.read();
      let mut seen = HashSet::new();
      paths
        .into_iter()
        .filter(|path| {
          let key = path_key::canonical(path);
          !key.is_empty() && !list.keys.contains(&key) && seen.insert(key)
        })
        .collect()
    };
    if additions.is_empty() {
      return MutationOutcome::Unchanged;
    }

    let total = additions.len();
    let mut added = 0;
    for chunk in additions.chunks(self.add_chunk_size) {
      let merged = self.merge_chunk(chunk);
      if merged > 0 {
        added += merged;
        self.recompute();
      }
      YieldPolicy::Immediate.pause().await;
    }

    debug!(requested = total, added, "selection additions committed");
    if added == 0 {
      MutationOutcome::Unchanged
    } else {
      MutationOutcome::Applied(added)
    }
  }

  /// Removes paths from the list.
  /// The kept list is built across chunks and committed in one write.
  pub async fn remove_paths(&self, paths: Vec<String>) -> MutationOutcome {
    let (removal, snapshot) = {
      let list = self.list.read();
      let removal: HashSet<String> = paths.iter().map(|path| path_key::canonical(path)).filter(|key| list.keys.contains(key)).collect();
      if removal.is_empty() {
        return MutationOutcome::Unchanged;
      }
      (removal, list.refs.clone())
    };

    let mut kept = Vec::with_capacity(snapshot.len().saturating_sub(removal.len()));
    for chunk in snapshot.chunks(self.remove_chunk_size) {
      kept.extend(chunk.iter().filter(|reference| !removal.contains(&path_key::canonical(&reference.path))).cloned());
      YieldPolicy::Immediate.pause().await;
    }

    let removed = {
      let mut list = self.list.write();
      let removed = list.keys.iter().filter(|key| removal.contains(*key)).count();
      // another gesture may have removed entries while we were filtering
      kept.retain(|reference| list.keys.contains(&path_key::canonical(&reference.path)));
      let snapshot_keys: HashSet<String> = snapshot.iter().map(|reference| path_key::canonical(&reference.path)).collect();
      // keep anything another gesture added while we were filtering
      let added_meanwhile: Vec<SelectionReference> = list
        .refs
        .iter()
        .filter(|reference| {
          let key = path_key::canonical(&reference.path);
          !snapshot_keys.contains(&key) && !removal.contains(&key)
        })
        .cloned()
        .collect();
      kept.extend(added_meanwhile);
      *list = SelectionList::from_refs(kept);
      removed
    };

    debug!(removed, "selection removals committed");
    if removed == 0 {
      return MutationOutcome::Unchanged;
    }
    self.recompute();
    MutationOutcome::Applied(removed)
  }

  /// Deduplicating merge of one chunk, returns how many references were added.
  fn merge_chunk(&self, chunk: &[String]) -> usize {
    let mut list = self.list.write();
    if chunk.iter().all(|path| list.keys.contains(&path_key::canonical(path))) {
      return 0;
    }

    let mut merged = 0;
    for path in chunk {
      if list.keys.insert(path_key::canonical(path)) {
        list.refs.push(SelectionReference::new(path.clone()));
        merged += 1;
      }
    }
    merged
  }
}

/// Paths of the records that can be selected.
fn selectable_paths(records: &[FileRecord]) -> Vec<String> {
  records.iter().filter(|record| record.is_selectable()).map(|record| record.path.clone()).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::EngineConfig;
  use crate::folder_index::FolderIndex;
  use crate::types::{LineRange, SelectionState};

  fn files() -> Vec<FileRecord> {
    let mut files = vec![FileRecord::file("/p/a.ts"), FileRecord::file("/p/b.ts"), FileRecord::binary("/p/c.bin")];
    for i in 0..10 {
      files.push(FileRecord::file(format!("/big/f{i}.rs")));
    }
    files
  }

  fn mutator_with(config: EngineConfig) -> SelectionMutator {
    let cache = SelectionCache::new(config);
    cache.rebuild(Arc::new(FolderIndex::build(&files())));
    SelectionMutator::new(cache)
  }

  fn small_chunks() -> EngineConfig {
    EngineConfig {
      add_chunk_size: 3,
      remove_chunk_size: 4,
      ..EngineConfig::default()
    }
  }

  #[tokio::test]
  async fn test_toggle_folder_selects_only_selectable_files() {
    let mutator = mutator_with(EngineConfig::default());
    let outcome = mutator.toggle_folder_selection("/p", true).await;

    assert_eq!(outcome, MutationOutcome::Applied(2));
    let paths: Vec<String> = mutator.selection().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["/p/a.ts", "/p/b.ts"]);
    assert_eq!(mutator.cache.get("/p"), SelectionState::Full);
  }

  #[tokio::test]
  async fn test_settled_or_unknown_targets_do_nothing() {
    let mutator = mutator_with(EngineConfig::default());
    assert_eq!(mutator.toggle_folder_selection("/p", false).await, MutationOutcome::Unchanged);
    assert_eq!(mutator.toggle_folder_selection("/nowhere", true).await, MutationOutcome::Unchanged);
    assert!(!mutator.cache.is_computing());
    assert!(mutator.cache.is_empty());

    mutator.toggle_folder_selection("/p", true).await;
    assert_eq!(mutator.toggle_folder_selection("/p", true).await, MutationOutcome::Unchanged);
  }

  #[tokio::test]
  async fn test_chunked_additions_keep_order_and_dedupe() {
    let mutator = mutator_with(small_chunks());
    let paths: Vec<String> = (0..10).map(|i| format!("/big/f{i}.rs")).chain(["/big/f0.rs".to_string(), "big/f1.rs".to_string()]).collect();

    assert_eq!(mutator.add_paths(paths).await, MutationOutcome::Applied(10));
    let selected: Vec<String> = mutator.selection().into_iter().map(|r| r.path).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("/big/f{i}.rs")).collect();
    assert_eq!(selected, expected);

    mutator.cache.wait_idle().await;
    assert_eq!(mutator.cache.get("/big"), SelectionState::Full);
  }

  #[tokio::test]
  async fn test_chunked_removals_commit_once() {
    let mutator = mutator_with(small_chunks());
    mutator.select_all_files(&files()).await;
    assert_eq!(mutator.selected_count(), 12);

    let outcome = mutator.remove_paths((0..5).map(|i| format!("big/f{i}.rs")).collect()).await;
    assert_eq!(outcome, MutationOutcome::Applied(5));
    assert_eq!(mutator.selected_count(), 7);

    mutator.cache.wait_idle().await;
    assert_eq!(mutator.cache.get("/big"), SelectionState::Partial);
    assert_eq!(mutator.cache.get("/p"), SelectionState::Full);
  }

  #[tokio::test]
  async fn test_overlapping_removals_both_stick() {
    let config = EngineConfig {
      remove_chunk_size: 1,
      ..EngineConfig::default()
    };
    let mutator = mutator_with(config);
    mutator.add_paths(vec!["/big/f0.rs".to_string(), "/big/f1.rs".to_string(), "/big/f2.rs".to_string()]).await;

    let (first, second) = tokio::join!(mutator.remove_paths(vec!["/big/f0.rs".to_string()]), mutator.remove_paths(vec!["/big/f1.rs".to_string()]));

    assert_eq!(first, MutationOutcome::Applied(1));
    assert_eq!(second, MutationOutcome::Applied(1));
    let paths: Vec<String> = mutator.selection().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["/big/f2.rs"]);

    mutator.cache.wait_idle().await;
    assert_eq!(*mutator.cache.selected_paths(), crate::cache::selected_set(["/big/f2.rs"]));
    assert_eq!(mutator.cache.get("/big"), SelectionState::Partial);
  }

  #[tokio::test]
  async fn test_removal_racing_an_addition_keeps_the_addition() {
    let config = EngineConfig {
      remove_chunk_size: 1,
      ..EngineConfig::default()
    };
    let mutator = mutator_with(config);
    mutator.add_paths(vec!["/big/f0.rs".to_string(), "/big/f1.rs".to_string()]).await;

    let (removed, added) = tokio::join!(mutator.remove_paths(vec!["/big/f0.rs".to_string()]), mutator.add_paths(vec!["/big/f5.rs".to_string()]));

    assert_eq!(removed, MutationOutcome::Applied(1));
    assert_eq!(added, MutationOutcome::Applied(1));
    assert!(!mutator.is_selected("/big/f0.rs"));
    assert!(mutator.is_selected("/big/f1.rs"));
    assert!(mutator.is_selected("/big/f5.rs"));
  }

  #[tokio::test]
  async fn test_deselect_all_clears_displayed_files() {
    let mutator = mutator_with(small_chunks());
    mutator.select_all_files(&files()).await;
    assert_eq!(mutator.deselect_all_files(&files()).await, MutationOutcome::Applied(12));
    assert_eq!(mutator.selected_count(), 0);
    assert_eq!(mutator.deselect_all_files(&files()).await, MutationOutcome::Unchanged);
  }

  #[tokio::test]
  async fn test_toggle_file() {
    let mutator = mutator_with(EngineConfig::default());
    assert_eq!(mutator.toggle_file("/p/a.ts").await, MutationOutcome::Applied(1));
    assert!(mutator.is_selected("p/a.ts"));
    assert_eq!(mutator.cache.get("/p"), SelectionState::Partial);

    assert_eq!(mutator.toggle_file("/p/a.ts").await, MutationOutcome::Applied(1));
    assert!(!mutator.is_selected("/p/a.ts"));
    assert_eq!(mutator.toggle_file("/p/c.bin").await, MutationOutcome::Unchanged);
  }

  #[tokio::test]
  async fn test_replace_selection_keeps_line_ranges() {
    let mutator = mutator_with(EngineConfig::default());
    let refs = vec![
      SelectionReference::with_lines("/p/a.ts", vec![LineRange { start: 1, end: 4 }]),
      SelectionReference::new("p/a.ts"),
      SelectionReference::new("/p/b.ts"),
    ];
    assert_eq!(mutator.replace_selection(refs.clone()), MutationOutcome::Applied(2));
    assert_eq!(mutator.selection()[0].lines, Some(vec![LineRange { start: 1, end: 4 }]));
    assert_eq!(mutator.replace_selection(refs), MutationOutcome::Unchanged);
    assert_eq!(mutator.cache.get("/p"), SelectionState::Full);
  }
}
