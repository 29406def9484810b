//! # Cleanup Thread
//!
//! A process-wide worker thread for deferred cascade work.
//!
//! Connector watchers fire while a node's exclusive lock is held; running
//! their cascades (closing or erroring the peer node) inline would re-enter
//! node locks recursively. Instead the cascades are enqueued here and run on
//! a dedicated thread, outside every lock.
//!
//! The worker spawns lazily on first use and can be torn down with
//! [`shutdown`]; a later [`enqueue`] respawns it.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use tracing::{trace, warn};

type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Worker {
  sender: Option<Sender<CleanupFn>>,
  handle: Option<JoinHandle<()>>,
}

static WORKER: OnceLock<Mutex<Worker>> = OnceLock::new();

fn worker() -> MutexGuard<'static, Worker> {
  WORKER
    .get_or_init(|| Mutex::new(Worker::default()))
    .lock()
    .unwrap_or_else(PoisonError::into_inner)
}

fn spawn(worker: &mut Worker) {
  let (sender, receiver) = unbounded::<CleanupFn>();
  let handle = std::thread::Builder::new()
    .name("streamknit-cleanup".to_string())
    .spawn(move || {
      for action in receiver.iter() {
        action();
      }
    });
  match handle {
    Ok(handle) => {
      worker.sender = Some(sender);
      worker.handle = Some(handle);
    }
    Err(err) => {
      warn!("cleanup thread failed to spawn: {}", err);
    }
  }
}

/// Runs `action` on the cleanup thread.
///
/// Falls back to running inline if the thread cannot be spawned. Actions run
/// in enqueue order.
pub fn enqueue(action: impl FnOnce() + Send + 'static) {
  trace!("cleanup::enqueue()");
  let sender = {
    let mut worker = worker();
    if worker.sender.is_none() {
      spawn(&mut worker);
    }
    worker.sender.clone()
  };
  let action: CleanupFn = Box::new(action);
  match sender {
    Some(sender) => {
      if let Err(rejected) = sender.send(action) {
        (rejected.0)();
      }
    }
    None => action(),
  }
}

/// Drains the pending cleanup work and joins the worker thread.
///
/// Standard teardown for embedders; a subsequent [`enqueue`] starts a fresh
/// worker.
pub fn shutdown() {
  let (sender, handle) = {
    let mut worker = worker();
    (worker.sender.take(), worker.handle.take())
  };
  drop(sender);
  if let Some(handle) = handle {
    if handle.join().is_err() {
      warn!("cleanup thread panicked during shutdown");
    }
  }
}
