use crate::path_key;
use crate::types::{FileRecord, SelectionState};
use std::collections::{HashMap, HashSet};

/// Maps every directory to the selectable files underneath it.
/// Built once per file listing and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderIndex {
  /// Canonical directory key -> descendant file paths, in listing order
  folders: HashMap<String, Vec<String>>,
  /// Canonical keys of every selectable file
  files: HashSet<String>,
}

impl FolderIndex {
  /// Builds the index from a flat listing.
  /// Directories, binary and skipped files are never registered.
  pub fn build(files: &[FileRecord]) -> Self {
    let mut folders: HashMap<String, Vec<String>> = HashMap::new();
    let mut seen = HashSet::new();

    for record in files.iter().filter(|record| record.is_selectable()) {
      let path = path_key::normalize(&record.path);
      let key = path_key::canonical_str(&path).to_string();
      if key.is_empty() || !seen.insert(key.clone()) {
        continue;
      }

      for ancestor in path_key::ancestors(&key) {
        folders.entry(ancestor.to_string()).or_default().push(path.clone());
      }
    }

    tracing::debug!(directories = folders.len(), files = seen.len(), "built folder index");

    Self { folders, files: seen }
  }

  /// Selectable files under a directory, empty for unknown paths and plain files.
  pub fn files_in_folder(&self, path: &str) -> &[String] {
    self.folders.get(&path_key::canonical(path)).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Whether the directory has at least one selectable descendant.
  pub fn contains_directory(&self, path: &str) -> bool {
    self.folders.contains_key(&path_key::canonical(path))
  }

  /// Canonical keys of all indexed directories, in no particular order.
  pub fn directories(&self) -> impl Iterator<Item = &str> {
    self.folders.keys().map(String::as_str)
  }

  pub fn directory_count(&self) -> usize {
    self.folders.len()
  }

  /// Whether the path names a selectable file.
  pub fn contains_file(&self, path: &str) -> bool {
    self.files.contains(&path_key::canonical(path))
  }

  pub fn file_count(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.folders.is_empty()
  }

  /// Derives the tri-state of one directory against a set of canonical selected paths.
  pub fn compute_state(&self, path: &str, selected: &HashSet<String>) -> SelectionState {
    let files = self.files_in_folder(path);
    let selected_count = files.iter().filter(|file| selected.contains(path_key::canonical_str(file))).count();
    SelectionState::from_counts(selected_count, files.len())
  }

  /// Orders directories for a progressive pass.
  /// Priority directories come first in the order given, the rest follow shallowest first.
  pub fn order_directories(&self, priority_paths: &[String]) -> Vec<String> {
    let mut ordered = Vec::with_capacity(self.folders.len());
    let mut taken = HashSet::new();

    for path in priority_paths {
      let key = path_key::canonical(path);
      if self.folders.contains_key(&key) && taken.insert(key.clone()) {
        ordered.push(key);
      }
    }

    let mut rest: Vec<&String> = self.folders.keys().filter(|key| !taken.contains(*key)).collect();
    rest.sort_by(|a, b| path_key::depth(a).cmp(&path_key::depth(b)).then_with(|| a.cmp(b)));
    ordered.extend(rest.into_iter().cloned());

    ordered
  }
}
