//! # Receive Results
//!
//! The async-promise half of the core: a [`ReceiveResult`] is handed back by
//! every receive operation and by propagation into a pending receive. It is
//! realized at most once, supports subscription callbacks, blocking waits,
//! and `await` through its [`std::future::Future`] implementation.
//!
//! Completion that happens inside a transaction defers the subscriber
//! callbacks to the transaction's commit, so observers never see state that a
//! rollback would retract.

use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::task::AtomicWaker;
use tracing::trace;

use crate::error::{ChannelStateError, ErrorValue};
use crate::transaction;

/// The realized value of a receive result.
pub enum ResultOutcome<T> {
  /// A message was delivered.
  Success(T),
  /// The receive failed with an error or sentinel condition.
  Failure(ErrorValue),
}

impl<T: Clone> Clone for ResultOutcome<T> {
  fn clone(&self) -> Self {
    match self {
      ResultOutcome::Success(value) => ResultOutcome::Success(value.clone()),
      ResultOutcome::Failure(err) => ResultOutcome::Failure(err.clone()),
    }
  }
}

impl<T> std::fmt::Debug for ResultOutcome<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ResultOutcome::Success(_) => write!(f, "Success(..)"),
      ResultOutcome::Failure(err) => write!(f, "Failure({})", err),
    }
  }
}

impl<T> ResultOutcome<T> {
  /// True when the outcome delivered a message.
  pub fn is_success(&self) -> bool {
    matches!(self, ResultOutcome::Success(_))
  }

  /// The delivered message, if any.
  pub fn success(&self) -> Option<&T> {
    match self {
      ResultOutcome::Success(value) => Some(value),
      ResultOutcome::Failure(_) => None,
    }
  }

  /// The failure, if any.
  pub fn failure(&self) -> Option<&ErrorValue> {
    match self {
      ResultOutcome::Success(_) => None,
      ResultOutcome::Failure(err) => Some(err),
    }
  }
}

/// Descriptive metadata attached to results produced by queue dispatch.
#[derive(Debug, Clone)]
pub struct ResultMetadata {
  /// The kind of source that realized the result.
  pub kind: &'static str,
  /// Description of the source node or queue.
  pub name: String,
  /// When the result was realized.
  pub timestamp: DateTime<Utc>,
}

type Callback<T> = Box<dyn FnOnce(&ResultOutcome<T>) + Send>;

enum Cell<T> {
  Pending(Vec<Callback<T>>),
  Realized(ResultOutcome<T>),
  Cancelled,
}

struct Shared<T> {
  cell: Mutex<Cell<T>>,
  metadata: Mutex<Option<ResultMetadata>>,
  cond: Condvar,
  waker: AtomicWaker,
}

impl<T> Shared<T> {
  fn cell(&self) -> MutexGuard<'_, Cell<T>> {
    self.cell.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// A single-shot receive result.
///
/// Cloning yields another handle to the same result.
pub struct ReceiveResult<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for ReceiveResult<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T> ReceiveResult<T> {
  /// A result that has not yet been realized.
  pub fn pending() -> Self {
    Self {
      shared: Arc::new(Shared {
        cell: Mutex::new(Cell::Pending(Vec::new())),
        metadata: Mutex::new(None),
        cond: Condvar::new(),
        waker: AtomicWaker::new(),
      }),
    }
  }

  /// An already-successful result.
  pub fn success(value: T) -> Self {
    Self::realized(ResultOutcome::Success(value))
  }

  /// An already-failed result.
  pub fn failure(err: ErrorValue) -> Self {
    Self::realized(ResultOutcome::Failure(err))
  }

  fn realized(outcome: ResultOutcome<T>) -> Self {
    Self {
      shared: Arc::new(Shared {
        cell: Mutex::new(Cell::Realized(outcome)),
        metadata: Mutex::new(None),
        cond: Condvar::new(),
        waker: AtomicWaker::new(),
      }),
    }
  }

  /// True while the result has neither been realized nor cancelled.
  pub fn is_pending(&self) -> bool {
    matches!(*self.shared.cell(), Cell::Pending(_))
  }

  /// True once the result carries an outcome.
  pub fn is_realized(&self) -> bool {
    matches!(*self.shared.cell(), Cell::Realized(_))
  }

  /// True once the result has been cancelled.
  pub fn is_cancelled(&self) -> bool {
    matches!(*self.shared.cell(), Cell::Cancelled)
  }

  /// Identity comparison: do both handles refer to the same result?
  pub fn is_same(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.shared, &other.shared)
  }

  /// Cancels a pending result. Its callbacks are dropped, never invoked.
  pub fn cancel(&self) -> bool {
    let cancelled = {
      let mut cell = self.shared.cell();
      match &mut *cell {
        Cell::Pending(_) => {
          *cell = Cell::Cancelled;
          true
        }
        _ => false,
      }
    };
    if cancelled {
      trace!("ReceiveResult::cancel()");
      self.shared.cond.notify_all();
      self.shared.waker.wake();
    }
    cancelled
  }

  /// Attaches queue-dispatch metadata to this result.
  pub(crate) fn set_queue_metadata(&self, name: &str) {
    let mut metadata = self
      .shared
      .metadata
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    *metadata = Some(ResultMetadata {
      kind: "queue",
      name: name.to_string(),
      timestamp: Utc::now(),
    });
  }

  /// Metadata attached by the realizing queue, if any.
  pub fn metadata(&self) -> Option<ResultMetadata> {
    self
      .shared
      .metadata
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

impl<T: Clone + Send + 'static> ReceiveResult<T> {
  /// Realizes the result, notifying waiters and subscribers.
  ///
  /// Returns false if the result was already realized or cancelled. Inside a
  /// transaction, subscriber callbacks run at commit rather than inline.
  pub fn try_complete(&self, outcome: ResultOutcome<T>) -> bool {
    let callbacks = {
      let mut cell = self.shared.cell();
      match &mut *cell {
        Cell::Pending(callbacks) => {
          let callbacks = std::mem::take(callbacks);
          *cell = Cell::Realized(outcome.clone());
          callbacks
        }
        _ => return false,
      }
    };
    self.shared.cond.notify_all();
    self.shared.waker.wake();
    if callbacks.is_empty() {
      return true;
    }
    transaction::defer(move || {
      for callback in callbacks {
        callback(&outcome);
      }
    });
    true
  }

  /// Realizes the result with a delivered message.
  pub fn try_success(&self, value: T) -> bool {
    self.try_complete(ResultOutcome::Success(value))
  }

  /// Realizes the result with a failure.
  pub fn try_failure(&self, err: ErrorValue) -> bool {
    self.try_complete(ResultOutcome::Failure(err))
  }

  /// Subscribes to the outcome.
  ///
  /// An already-realized result invokes the callback immediately; a
  /// cancelled result drops it.
  pub fn subscribe(&self, callback: impl FnOnce(&ResultOutcome<T>) + Send + 'static) {
    let immediate = {
      let mut cell = self.shared.cell();
      match &mut *cell {
        Cell::Pending(callbacks) => {
          callbacks.push(Box::new(callback));
          None
        }
        Cell::Realized(outcome) => Some((callback, outcome.clone())),
        Cell::Cancelled => None,
      }
    };
    if let Some((callback, outcome)) = immediate {
      callback(&outcome);
    }
  }

  /// The outcome, if realized.
  pub fn outcome(&self) -> Option<ResultOutcome<T>> {
    match &*self.shared.cell() {
      Cell::Realized(outcome) => Some(outcome.clone()),
      _ => None,
    }
  }

  /// The delivered message, if the result succeeded.
  pub fn success_value(&self) -> Option<T> {
    match &*self.shared.cell() {
      Cell::Realized(ResultOutcome::Success(value)) => Some(value.clone()),
      _ => None,
    }
  }

  /// Blocks until the result is realized or cancelled.
  ///
  /// Returns `None` when cancelled.
  pub fn wait(&self) -> Option<ResultOutcome<T>> {
    let mut cell = self.shared.cell();
    loop {
      match &*cell {
        Cell::Realized(outcome) => return Some(outcome.clone()),
        Cell::Cancelled => return None,
        Cell::Pending(_) => {
          cell = self
            .shared
            .cond
            .wait(cell)
            .unwrap_or_else(PoisonError::into_inner);
        }
      }
    }
  }

  /// Blocks until realized, cancelled, or the timeout elapses.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<ResultOutcome<T>> {
    let deadline = std::time::Instant::now() + timeout;
    let mut cell = self.shared.cell();
    loop {
      match &*cell {
        Cell::Realized(outcome) => return Some(outcome.clone()),
        Cell::Cancelled => return None,
        Cell::Pending(_) => {
          let now = std::time::Instant::now();
          if now >= deadline {
            return None;
          }
          let (guard, _) = self
            .shared
            .cond
            .wait_timeout(cell, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
          cell = guard;
        }
      }
    }
  }

  /// Blocks for the outcome and returns the delivered message, if any.
  pub fn wait_value(&self) -> Option<T> {
    self.wait().and_then(|outcome| match outcome {
      ResultOutcome::Success(value) => Some(value),
      ResultOutcome::Failure(_) => None,
    })
  }
}

impl<T: Clone + Send + 'static> std::future::Future for ReceiveResult<T> {
  type Output = Result<T, ErrorValue>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.shared.waker.register(cx.waker());
    match &*self.shared.cell() {
      Cell::Realized(ResultOutcome::Success(value)) => Poll::Ready(Ok(value.clone())),
      Cell::Realized(ResultOutcome::Failure(err)) => Poll::Ready(Err(err.clone())),
      Cell::Cancelled => Poll::Ready(Err(Arc::new(ChannelStateError::Cancelled))),
      Cell::Pending(_) => Poll::Pending,
    }
  }
}

impl<T> std::fmt::Debug for ReceiveResult<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = match &*self.shared.cell() {
      Cell::Pending(_) => "pending",
      Cell::Realized(_) => "realized",
      Cell::Cancelled => "cancelled",
    };
    f.debug_struct("ReceiveResult").field("state", &state).finish()
  }
}

/// A realized result carrying the closed sentinel.
pub fn closed_result<T>() -> ReceiveResult<T> {
  ReceiveResult::failure(Arc::new(ChannelStateError::Closed))
}

/// A realized result carrying the drained sentinel.
pub fn drained_result<T>() -> ReceiveResult<T> {
  ReceiveResult::failure(Arc::new(ChannelStateError::Drained))
}

/// A realized result carrying `err`.
pub fn error_result<T>(err: ErrorValue) -> ReceiveResult<T> {
  ReceiveResult::failure(err)
}
