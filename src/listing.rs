use crate::types::FileRecord;
use anyhow::Result;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

/// Files above this size are listed but never selectable.
const MAX_FILE_SIZE: u64 = 100_000_000;

/// Bytes read when sniffing for binary content.
const SNIFF_LEN: usize = 512;

/// Scans a directory into the flat listing the selection engine indexes.
/// Walks recursively without following links, the root itself is not listed.
/// Records come back sorted by path.
pub fn scan_directory(root_path: &Path) -> Result<Vec<FileRecord>> {
  if !root_path.is_dir() {
    anyhow::bail!("Error: not a directory: {}", root_path.display());
  }

  let mut records = Vec::new();

  // skip entries we can't read (permissions issues)
  for entry in WalkDir::new(root_path).follow_links(false).min_depth(1).into_iter().filter_entry(|e| !should_skip_entry(e)).filter_map(|e| e.ok()) {
    let path = entry.path().to_string_lossy().into_owned();

    if entry.file_type().is_dir() {
      records.push(FileRecord::directory(path));
      continue;
    }

    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
    let mut record = FileRecord::file(path);
    if size > MAX_FILE_SIZE {
      record.is_skipped = true;
    } else {
      match is_binary_file(entry.path()) {
        Ok(is_binary) => record.is_binary = is_binary,
        Err(e) => {
          tracing::warn!(path = %entry.path().display(), error = %e, "unreadable file, listing it as skipped");
          record.is_skipped = true;
        }
      }
    }
    records.push(record);
  }

  records.sort_by(|a, b| a.path.cmp(&b.path));
  tracing::debug!(root = %root_path.display(), entries = records.len(), "scanned directory");

  Ok(records)
}

/// Determines if an entry should be left out of the listing.
/// Covers VCS metadata and large build/dependency directories.
fn should_skip_entry(entry: &DirEntry) -> bool {
  let file_name = entry.file_name().to_str().unwrap_or("");

  if file_name == ".git" || file_name == ".hg" || file_name == ".svn" {
    return true;
  }

  if !entry.file_type().is_dir() {
    return file_name == ".DS_Store" || file_name == "Thumbs.db";
  }

  // these typically hold thousands of generated files nobody selects
  let large_dirs_to_skip = [
    "target",
    "node_modules",
    "build",
    "dist",
    ".next",
    ".nuxt",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    "venv",
    ".venv",
    "coverage",
  ];

  large_dirs_to_skip.iter().any(|&skip_name| file_name.eq_ignore_ascii_case(skip_name))
}

/// Checks the first bytes of a file for NUL, which text files don't contain.
fn is_binary_file(path: &Path) -> io::Result<bool> {
  let mut file = File::open(path)?;
  let mut buffer = [0; SNIFF_LEN];
  let bytes_read = file.read(&mut buffer)?;
  Ok(buffer[..bytes_read].contains(&0))
}
