use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for the selection engine.
/// None of these affect results, only latency and memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// lower bound for a recompute batch
  pub min_batch_size: usize,
  /// upper bound for a recompute batch
  pub max_batch_size: usize,
  /// batch size when the caller does not ask for one
  pub default_batch_size: usize,
  /// directory count above which recompute moves to the worker thread
  pub offload_threshold: usize,
  /// pause between main-thread batches, 0 yields without sleeping
  pub idle_delay_ms: u64,
  /// hard capacity of the optimistic overlay
  pub overlay_capacity: usize,
  /// lifetime of an optimistic entry
  pub overlay_ttl_ms: u64,
  /// repeated folder toggles inside this window are dropped
  pub coalesce_window_ms: u64,
  /// paths merged per addition chunk
  pub add_chunk_size: usize,
  /// paths filtered per removal chunk
  pub remove_chunk_size: usize,
  /// whether sessions spawn the background compute worker
  pub use_worker: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      min_batch_size: 200,
      max_batch_size: 4000,
      default_batch_size: 1000,
      offload_threshold: 8000,
      idle_delay_ms: 1,
      overlay_capacity: 100,
      overlay_ttl_ms: 1500,
      coalesce_window_ms: 150,
      add_chunk_size: 1500,
      remove_chunk_size: 2000,
      use_worker: true,
    }
  }
}

impl EngineConfig {
  /// Loads configuration from the user's config file.
  /// Creates default config if file doesn't exist.
  pub fn load() -> Result<Self> {
    let config_path = get_config_path()?;

    if config_path.exists() {
      Self::load_from(&config_path)
    } else {
      let default_config = EngineConfig::default();
      default_config.save_to(&config_path)?;
      Ok(default_config)
    }
  }

  /// Loads configuration from an explicit file.
  pub fn load_from(path: &Path) -> Result<Self> {
    let config_content = fs::read_to_string(path).with_context(|| format!("Error: failed to read config file: {}", path.display()))?;

    let config: EngineConfig = serde_json::from_str(&config_content).with_context(|| format!("Error: failed to parse config file: {}", path.display()))?;

    Ok(config.sanitized())
  }

  /// Saves the config to an explicit file, creating parent dirs.
  pub fn save_to(&self, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).with_context(|| format!("Error: failed to create config directory: {}", parent.display()))?;
    }

    let config_content = serde_json::to_string_pretty(self).context("Error: failed to serialize config")?;

    fs::write(path, config_content).with_context(|| format!("Error: failed to write config file: {}", path.display()))?;

    Ok(())
  }

  /// Repairs values that would stall or break the engine.
  pub fn sanitized(mut self) -> Self {
    let defaults = EngineConfig::default();
    if self.min_batch_size == 0 {
      self.min_batch_size = 1;
    }
    if self.max_batch_size < self.min_batch_size {
      tracing::warn!(min = self.min_batch_size, max = self.max_batch_size, "batch size range is inverted, swapping");
      std::mem::swap(&mut self.min_batch_size, &mut self.max_batch_size);
    }
    if self.default_batch_size == 0 {
      self.default_batch_size = defaults.default_batch_size;
    }
    if self.overlay_capacity == 0 {
      self.overlay_capacity = defaults.overlay_capacity;
    }
    if self.add_chunk_size == 0 {
      self.add_chunk_size = defaults.add_chunk_size;
    }
    if self.remove_chunk_size == 0 {
      self.remove_chunk_size = defaults.remove_chunk_size;
    }
    self
  }

  /// Clamps a requested batch size into the configured range.
  pub fn clamp_batch_size(&self, requested: Option<usize>) -> usize {
    requested.unwrap_or(self.default_batch_size).clamp(self.min_batch_size, self.max_batch_size)
  }

  pub fn idle_delay(&self) -> Duration {
    Duration::from_millis(self.idle_delay_ms)
  }

  pub fn overlay_ttl(&self) -> Duration {
    Duration::from_millis(self.overlay_ttl_ms)
  }

  pub fn coalesce_window(&self) -> Duration {
    Duration::from_millis(self.coalesce_window_ms)
  }
}

/// Gets the path to the treesel config file.
fn get_config_path() -> Result<PathBuf> {
  let config_dir = dirs::config_dir().context("Error: could not determine config directory")?;

  Ok(config_dir.join("treesel").join("config.json"))
}
