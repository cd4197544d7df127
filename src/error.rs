use thiserror::Error;

/// Failures inside the engine.
/// None of these cross the public lookup/mutation API, they are logged and degraded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
  #[error("path is empty")]
  EmptyPath,
  #[error("unknown selection state code '{0}'")]
  UnknownStateCode(char),
  #[error("failed to start compute worker: {0}")]
  WorkerSpawn(String),
  #[error("compute worker is no longer running")]
  WorkerDisconnected,
}

pub type SelectionResult<T> = Result<T, SelectionError>;
