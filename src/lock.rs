//! # Asymmetric Lock
//!
//! A readers-writer lock with *explicit* acquire/release, no guard objects.
//!
//! RAII guards cannot express the two hand-over-hand protocols the node core
//! relies on: the fused propagation walk releases the upstream node's lock
//! from inside the downstream queue's enqueue callback, and the transactional
//! upgrade acquires a whole set of downstream locks before releasing the
//! root. Both require a release that happens in a different scope than the
//! acquire, so the lock exposes bare `acquire`/`release` pairs instead.
//!
//! Writers are preferred: a waiting exclusive acquisition blocks new shared
//! acquisitions, so propagation bursts cannot starve state transitions.
//!
//! Every lock carries a process-unique id. [`acquire_all`] sorts a set by id
//! before acquiring, giving the deadlock-free total order the transactional
//! upgrade needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

static LOCK_IDS: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct LockState {
  readers: usize,
  writer: bool,
  writers_waiting: usize,
}

/// A shared/exclusive lock with explicit acquire and release.
pub struct AsymmetricLock {
  id: u64,
  state: Mutex<LockState>,
  cond: Condvar,
}

impl AsymmetricLock {
  pub fn new() -> Self {
    Self {
      id: LOCK_IDS.fetch_add(1, Ordering::Relaxed),
      state: Mutex::new(LockState::default()),
      cond: Condvar::new(),
    }
  }

  /// A process-unique, monotonically assigned identity.
  ///
  /// Used as the total order for set acquisition and as a stable node id.
  pub fn id(&self) -> u64 {
    self.id
  }

  fn state(&self) -> MutexGuard<'_, LockState> {
    // A panicking watcher must not poison the whole graph.
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Acquires the lock in shared mode, blocking while a writer holds it or
  /// waits for it.
  pub fn acquire(&self) {
    let mut state = self.state();
    while state.writer || state.writers_waiting > 0 {
      state = self
        .cond
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
    state.readers += 1;
    #[cfg(test)]
    held::on_acquire();
  }

  /// Releases one shared acquisition.
  pub fn release(&self) {
    let mut state = self.state();
    debug_assert!(state.readers > 0);
    state.readers = state.readers.saturating_sub(1);
    if state.readers == 0 {
      self.cond.notify_all();
    }
    #[cfg(test)]
    held::on_release();
  }

  /// Acquires the lock in exclusive mode, blocking out readers and writers.
  pub fn acquire_exclusive(&self) {
    let mut state = self.state();
    state.writers_waiting += 1;
    while state.writer || state.readers > 0 {
      state = self
        .cond
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
    state.writers_waiting -= 1;
    state.writer = true;
    #[cfg(test)]
    held::on_acquire();
  }

  /// Releases the exclusive acquisition.
  pub fn release_exclusive(&self) {
    let mut state = self.state();
    debug_assert!(state.writer);
    state.writer = false;
    self.cond.notify_all();
    #[cfg(test)]
    held::on_release();
  }

  /// Attempts a shared acquisition without blocking.
  pub fn try_acquire(&self) -> bool {
    let mut state = self.state();
    if state.writer || state.writers_waiting > 0 {
      return false;
    }
    state.readers += 1;
    #[cfg(test)]
    held::on_acquire();
    true
  }

  /// Attempts an exclusive acquisition without blocking.
  pub fn try_acquire_exclusive(&self) -> bool {
    let mut state = self.state();
    if state.writer || state.readers > 0 {
      return false;
    }
    state.writer = true;
    #[cfg(test)]
    held::on_acquire();
    true
  }
}

impl Default for AsymmetricLock {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for AsymmetricLock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AsymmetricLock").field("id", &self.id).finish()
  }
}

/// Exclusively acquires every lock in the set, in id order.
///
/// The ordering makes concurrent set acquisitions deadlock-free with respect
/// to each other. Release with [`release_all`].
pub fn acquire_all(locks: &mut [&AsymmetricLock]) {
  locks.sort_by_key(|l| l.id());
  for lock in locks.iter() {
    lock.acquire_exclusive();
  }
}

/// Releases a set previously acquired with [`acquire_all`], in reverse order.
pub fn release_all(locks: &[&AsymmetricLock]) {
  for lock in locks.iter().rev() {
    lock.release_exclusive();
  }
}
