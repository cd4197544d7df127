//! Tri-state selection summaries for large file trees.
//!
//! A [`SelectionSession`] indexes a flat file listing, keeps a `full`/`partial`/`none`
//! state per directory and turns folder, file and select-all gestures into edits of the
//! selected-file list without blocking the caller on large trees.

pub mod cache;
pub mod config;
pub mod error;
pub mod folder_index;
pub mod listing;
pub mod mutation;
pub mod offload;
pub mod overlay;
pub mod path_key;
pub mod scheduler;
pub mod session;
pub mod types;

pub use cache::{RecomputeHandle, RecomputeProgress, SelectionCache};
pub use config::EngineConfig;
pub use error::{SelectionError, SelectionResult};
pub use folder_index::FolderIndex;
pub use session::SelectionSession;
pub use types::{FileRecord, LineRange, MutationOutcome, RecomputeOptions, SelectionReference, SelectionState};
