use crate::error::{SelectionError, SelectionResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Aggregate selection state of a directory.
/// Summarizes how many selectable descendant files are selected.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SelectionState {
  /// Every selectable descendant file is selected
  Full,
  /// Some, but not all, selectable descendant files are selected
  Partial,
  /// No selectable descendant file is selected (or there are none)
  #[default]
  None,
}

impl SelectionState {
  /// Derives the tri-state from a selected count and a total count.
  /// A directory with zero selectable files is always `None`.
  pub fn from_counts(selected: usize, total: usize) -> Self {
    if selected == 0 || total == 0 {
      SelectionState::None
    } else if selected >= total {
      SelectionState::Full
    } else {
      SelectionState::Partial
    }
  }

  /// Returns the single-character code used in worker batches.
  pub fn code(&self) -> char {
    match self {
      SelectionState::Full => 'f',
      SelectionState::Partial => 'p',
      SelectionState::None => 'n',
    }
  }

  /// Decodes a worker batch code back into a state.
  pub fn from_code(code: char) -> SelectionResult<Self> {
    match code {
      'f' => Ok(SelectionState::Full),
      'p' => Ok(SelectionState::Partial),
      'n' => Ok(SelectionState::None),
      other => Err(SelectionError::UnknownStateCode(other)),
    }
  }

  /// Returns the checkbox marker for the state.
  pub fn marker(&self) -> &'static str {
    match self {
      SelectionState::Full => "[x]",
      SelectionState::Partial => "[~]",
      SelectionState::None => "[ ]",
    }
  }
}

impl fmt::Display for SelectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      SelectionState::Full => "full",
      SelectionState::Partial => "partial",
      SelectionState::None => "none",
    };
    f.write_str(name)
  }
}

/// A single entry of the flat file listing handed to the engine.
/// Owned by the listing side, the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
  /// Absolute path of the file or directory
  pub path: String,
  /// True if the entry is a directory
  pub is_directory: bool,
  /// True if the file looks binary (never selectable)
  #[serde(default)]
  pub is_binary: bool,
  /// True if the listing decided to skip the file (never selectable)
  #[serde(default)]
  pub is_skipped: bool,
}

impl FileRecord {
  /// Creates a plain selectable file record.
  pub fn file(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      is_directory: false,
      is_binary: false,
      is_skipped: false,
    }
  }

  /// Creates a directory record.
  pub fn directory(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      is_directory: true,
      is_binary: false,
      is_skipped: false,
    }
  }

  /// Creates a binary file record.
  pub fn binary(path: impl Into<String>) -> Self {
    Self {
      is_binary: true,
      ..Self::file(path)
    }
  }

  /// Whether the record can ever be part of a selection.
  pub fn is_selectable(&self) -> bool {
    !self.is_directory && !self.is_binary && !self.is_skipped
  }
}

/// Inclusive line range attached to a selection reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineRange {
  pub start: usize,
  pub end: usize,
}

/// One entry of the canonical selection list.
/// Line ranges are carried along but never inspected by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionReference {
  /// Absolute path of the selected file
  pub path: String,
  /// Optional ordered line ranges, opaque here
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lines: Option<Vec<LineRange>>,
}

impl SelectionReference {
  /// Creates a whole-file reference.
  pub fn new(path: impl Into<String>) -> Self {
    Self { path: path.into(), lines: None }
  }

  /// Creates a reference restricted to line ranges.
  /// Ranges are sorted and deduplicated.
  pub fn with_lines(path: impl Into<String>, mut lines: Vec<LineRange>) -> Self {
    lines.sort();
    lines.dedup();
    Self {
      path: path.into(),
      lines: Some(lines),
    }
  }
}

/// Callback invoked after each applied recompute batch with
/// `(batch_size_applied, total_applied)`.
pub type BatchCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Options for a progressive recompute run.
#[derive(Clone, Default)]
pub struct RecomputeOptions {
  /// Directories to compute first, in the given order
  pub priority_paths: Vec<String>,
  /// Requested batch size, clamped to the configured range
  pub batch_size: Option<usize>,
  /// Reports every applied batch
  pub on_batch: Option<BatchCallback>,
}

impl fmt::Debug for RecomputeOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RecomputeOptions")
      .field("priority_paths", &self.priority_paths.len())
      .field("batch_size", &self.batch_size)
      .field("on_batch", &self.on_batch.is_some())
      .finish()
  }
}

/// Result of a selection gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
  /// The gesture changed this many selection references
  Applied(usize),
  /// Nothing to do (already settled, empty or unknown target)
  Unchanged,
  /// Dropped by the folder-toggle coalescing window
  Coalesced,
}

impl MutationOutcome {
  /// Whether the gesture touched the canonical selection list.
  pub fn is_applied(&self) -> bool {
    matches!(self, MutationOutcome::Applied(_))
  }
}
