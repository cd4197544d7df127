use crate::path_key;
use crate::scheduler;
use crate::types::SelectionState;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Tentative folder states shown while the authoritative pass catches up.
/// Holds at most `capacity` entries, least recently written goes first.
pub struct OptimisticOverlay {
  inner: Arc<Mutex<OverlayState>>,
  capacity: usize,
  ttl: Duration,
  coalesce_window: Duration,
}

#[derive(Default)]
struct OverlayState {
  entries: HashMap<String, OverlayEntry>,
  /// Oldest write at the front
  recency: VecDeque<String>,
  /// Folders whose mutation is still running
  pending: HashSet<String>,
  last_folder_toggle: Option<Instant>,
  next_stamp: u64,
}

struct OverlayEntry {
  selection: SelectionState,
  stamp: u64,
  expiry: Option<JoinHandle<()>>,
}

impl OverlayEntry {
  fn cancel_expiry(&mut self) {
    if let Some(timer) = self.expiry.take() {
      timer.abort();
    }
  }
}

impl OverlayState {
  fn forget(&mut self, key: &str) -> Option<OverlayEntry> {
    let mut entry = self.entries.remove(key)?;
    entry.cancel_expiry();
    self.recency.retain(|queued| queued != key);
    Some(entry)
  }
}

impl OptimisticOverlay {
  pub fn new(capacity: usize, ttl: Duration, coalesce_window: Duration) -> Self {
    Self {
      inner: Arc::new(Mutex::new(OverlayState::default())),
      capacity: capacity.max(1),
      ttl,
      coalesce_window,
    }
  }

  /// Tentative state for a folder, through either path variant.
  pub fn get(&self, path: &str) -> Option<SelectionState> {
    self.inner.lock().entries.get(&path_key::canonical(path)).map(|entry| entry.selection)
  }

  /// Records a tentative state and (re)starts its expiry timer.
  pub fn insert(&self, path: &str, selection: SelectionState) {
    let key = path_key::canonical(path);
    if key.is_empty() {
      return;
    }

    let mut state = self.inner.lock();
    state.forget(&key);

    state.next_stamp += 1;
    let stamp = state.next_stamp;
    let expiry = self.schedule_expiry(key.clone(), stamp);
    state.entries.insert(key.clone(), OverlayEntry { selection, stamp, expiry });
    state.recency.push_back(key);

    while state.entries.len() > self.capacity {
      let Some(oldest) = state.recency.front().cloned() else {
        break;
      };
      trace!(path = %oldest, "evicting optimistic entry");
      state.forget(&oldest);
    }
  }

  /// Drops a tentative state right away.
  pub fn remove(&self, path: &str) {
    self.inner.lock().forget(&path_key::canonical(path));
  }

  /// Keeps the folder's entry alive past its timer until [`complete`](Self::complete).
  pub fn mark_pending(&self, path: &str) {
    self.inner.lock().pending.insert(path_key::canonical(path));
  }

  /// The mutation behind the folder finished.
  pub fn complete(&self, path: &str) {
    self.inner.lock().pending.remove(&path_key::canonical(path));
  }

  pub fn is_pending(&self, path: &str) -> bool {
    self.inner.lock().pending.contains(&path_key::canonical(path))
  }

  /// Drops the entries whose mutation already finished.
  /// A later gesture can change what they claim, the cache is authoritative for them from here on.
  pub fn drop_settled(&self) {
    let mut state = self.inner.lock();
    let settled: Vec<String> = state.entries.keys().filter(|key| !state.pending.contains(*key)).cloned().collect();
    for key in settled {
      state.forget(&key);
    }
  }

  /// Drops every entry and pending marker, stopping all timers.
  pub fn clear(&self) {
    let mut state = self.inner.lock();
    for entry in state.entries.values_mut() {
      entry.cancel_expiry();
    }
    state.entries.clear();
    state.recency.clear();
    state.pending.clear();
    state.last_folder_toggle = None;
  }

  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Admits a folder toggle unless another one started inside the coalescing window.
  pub fn try_begin_folder_toggle(&self) -> bool {
    let now = Instant::now();
    let mut state = self.inner.lock();
    if let Some(last) = state.last_folder_toggle {
      if now.duration_since(last) < self.coalesce_window {
        return false;
      }
    }
    state.last_folder_toggle = Some(now);
    true
  }

  /// Removes the entry after `ttl` unless its folder is still pending,
  /// in which case the timer keeps waiting.
  fn schedule_expiry(&self, key: String, stamp: u64) -> Option<JoinHandle<()>> {
    let inner = self.inner.clone();
    let ttl = self.ttl;
    scheduler::spawn_continuation(async move {
      loop {
        tokio::time::sleep(ttl).await;
        let mut state = inner.lock();
        if state.pending.contains(&key) {
          continue;
        }
        // a newer write owns the key now
        if state.entries.get(&key).map(|entry| entry.stamp) == Some(stamp) {
          state.entries.remove(&key);
          state.recency.retain(|queued| queued != &key);
          trace!(path = %key, "optimistic entry expired");
        }
        break;
      }
    })
  }
}

impl Drop for OptimisticOverlay {
  fn drop(&mut self) {
    self.clear();
  }
}
