//! Path keys shared by the index, the cache and the overlay.
//!
//! Producers may hand us `/p/a.ts`, `p/a.ts` or `\p\a.ts` for the same file. Every
//! lookup goes through [`canonical`], which folds both leading-separator variants into
//! one key, so a read or write through either variant always hits the same entry.

use crate::error::{SelectionError, SelectionResult};

const SEPARATOR: char = '/';

/// Unifies separators and drops trailing separators.
pub fn normalize(path: &str) -> String {
  let unified = path.trim().replace('\\', "/");
  let trimmed = unified.trim_end_matches(SEPARATOR);
  if trimmed.is_empty() && unified.starts_with(SEPARATOR) {
    return SEPARATOR.to_string();
  }
  trimmed.to_string()
}

/// The single storage key for both variants of a path.
pub fn canonical(path: &str) -> String {
  normalize(path).trim_start_matches(SEPARATOR).to_string()
}

/// Borrowed canonical form of an already normalized path.
pub fn canonical_str(normalized: &str) -> &str {
  normalized.trim_start_matches(SEPARATOR)
}

/// The other variant of a path: adds or removes the leading separator.
pub fn mirror(path: &str) -> String {
  let normalized = normalize(path);
  if normalized.starts_with(SEPARATOR) {
    canonical_str(&normalized).to_string()
  } else {
    format!("{SEPARATOR}{normalized}")
  }
}

/// Rejects paths that cannot name a file or directory.
pub fn validate(path: &str) -> SelectionResult<()> {
  if canonical(path).is_empty() {
    return Err(SelectionError::EmptyPath);
  }
  Ok(())
}

/// Number of path segments, used to order shallow directories first.
pub fn depth(path: &str) -> usize {
  path.split(['/', '\\']).filter(|segment| !segment.is_empty()).count()
}

/// Canonical keys of every strict ancestor directory of a canonical file key.
pub fn ancestors(canonical_file: &str) -> impl Iterator<Item = &str> {
  canonical_file
    .char_indices()
    .filter(|(_, c)| *c == SEPARATOR)
    .map(move |(i, _)| &canonical_file[..i])
    .filter(|prefix| !prefix.is_empty() && !prefix.ends_with(SEPARATOR))
}
