//! # Message Queue
//!
//! The FIFO collaborator behind every node: unbounded buffering, pending
//! receives with optional predicates, closed/drained bookkeeping, and the
//! sentinel flavors a node installs on terminal transitions.
//!
//! The enqueue path takes an `on_complete` callback that runs while the
//! queue's mutex is still held, immediately after the message is committed.
//! Nodes pass their lock release there, which makes queue insertion atomic
//! with the node's lock window. Receiver completion always happens after the
//! mutex is dropped, so user callbacks never run under the queue lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::{ChannelStateError, ErrorValue};
use crate::result::{ReceiveResult, ResultOutcome};

/// A predicate deciding whether a pending receive accepts a message.
pub type ReceivePredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// The outcome of an enqueue.
#[derive(Debug)]
pub enum Enqueued<T> {
  /// The message was handed to a pending receive; carries the realized result.
  Dispatched(ReceiveResult<T>),
  /// The message was buffered.
  Queued,
  /// The message was offered with `persist = false` and nobody was waiting.
  Dropped,
  /// The queue no longer accepts messages.
  Closed,
}

struct PendingReceive<T> {
  predicate: Option<ReceivePredicate<T>>,
  default: Option<T>,
  result: ReceiveResult<T>,
}

struct QueueInner<T> {
  messages: VecDeque<T>,
  receivers: VecDeque<PendingReceive<T>>,
  closed: bool,
  error: Option<ErrorValue>,
  transactional: bool,
}

/// An unbounded FIFO with pending-receive dispatch.
pub struct MessageQueue<T> {
  name: String,
  inner: Mutex<QueueInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> MessageQueue<T> {
  /// An open, empty queue.
  pub fn new(name: impl Into<String>) -> Self {
    Self::with_parts(name, VecDeque::new(), false, false, None)
  }

  /// An open, empty queue with transactional semantics.
  pub fn transactional(name: impl Into<String>) -> Self {
    Self::with_parts(name, VecDeque::new(), true, false, None)
  }

  /// A queue pre-seeded with messages.
  pub fn from_messages(
    name: impl Into<String>,
    messages: Vec<T>,
    transactional: bool,
  ) -> Self {
    Self::with_parts(name, messages.into(), transactional, false, None)
  }

  /// The drained sentinel: closed and empty, every receive fails drained.
  pub fn drained(name: impl Into<String>) -> Self {
    Self::with_parts(name, VecDeque::new(), false, true, None)
  }

  /// The error sentinel: every receive fails with `err`.
  pub fn errored(name: impl Into<String>, err: ErrorValue) -> Self {
    Self::with_parts(name, VecDeque::new(), false, true, Some(err))
  }

  fn with_parts(
    name: impl Into<String>,
    messages: VecDeque<T>,
    transactional: bool,
    closed: bool,
    error: Option<ErrorValue>,
  ) -> Self {
    Self {
      name: name.into(),
      inner: Mutex::new(QueueInner {
        messages,
        receivers: VecDeque::new(),
        closed,
        error,
        transactional,
      }),
    }
  }

  fn inner(&self) -> MutexGuard<'_, QueueInner<T>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// The queue's description, inherited from its node.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Number of buffered messages.
  pub fn len(&self) -> usize {
    self.inner().messages.len()
  }

  /// True when no messages are buffered.
  pub fn is_empty(&self) -> bool {
    self.inner().messages.is_empty()
  }

  /// True once the queue stopped accepting messages.
  pub fn is_closed(&self) -> bool {
    self.inner().closed
  }

  /// True when closed, empty, and not errored.
  pub fn is_drained(&self) -> bool {
    let inner = self.inner();
    inner.closed && inner.messages.is_empty() && inner.error.is_none()
  }

  /// The error this queue failed with, if any.
  pub fn error_value(&self) -> Option<ErrorValue> {
    self.inner().error.clone()
  }

  /// Whether this queue participates in transactions.
  pub fn is_transactional(&self) -> bool {
    self.inner().transactional
  }

  /// Scans pending receivers for one that accepts `msg`.
  ///
  /// Predicate misses with a fallback value are removed and returned for
  /// completion; misses without one stay queued. Receivers whose result is no
  /// longer pending are discarded.
  fn match_receiver(
    inner: &mut QueueInner<T>,
    msg: &T,
  ) -> (Option<PendingReceive<T>>, Vec<PendingReceive<T>>) {
    let mut dispatched = None;
    let mut misses = Vec::new();
    let mut kept = VecDeque::new();
    while let Some(receiver) = inner.receivers.pop_front() {
      if !receiver.result.is_pending() {
        continue;
      }
      if dispatched.is_some() {
        kept.push_back(receiver);
        continue;
      }
      let accepts = receiver
        .predicate
        .as_ref()
        .map(|predicate| predicate(msg))
        .unwrap_or(true);
      if accepts {
        dispatched = Some(receiver);
      } else if receiver.default.is_some() {
        misses.push(receiver);
      } else {
        kept.push_back(receiver);
      }
    }
    inner.receivers = kept;
    (dispatched, misses)
  }

  /// Offers `msg` to the queue.
  ///
  /// `on_complete` runs under the queue mutex as soon as the message has been
  /// committed (dispatched or buffered or rejected); callers hand their lock
  /// release here. With `persist = false` the message is offered to pending
  /// receivers but never buffered.
  pub fn enqueue<F: FnOnce()>(&self, msg: T, persist: bool, on_complete: F) -> Enqueued<T> {
    self.enqueue_dyn(msg, persist, Box::new(on_complete))
  }

  /// Non-generic recursion target for [`Self::enqueue`]; keeps the retry
  /// loop from re-instantiating a new generic closure type on every
  /// cancellation race, which would otherwise blow the recursion limit.
  fn enqueue_dyn<'a>(&self, msg: T, persist: bool, on_complete: Box<dyn FnOnce() + 'a>) -> Enqueued<T> {
    let (pending, misses, mut leftover) = {
      let mut inner = self.inner();
      if inner.closed || inner.error.is_some() {
        on_complete();
        return Enqueued::Closed;
      }
      let (dispatched, misses) = Self::match_receiver(&mut inner, &msg);
      let mut leftover = Some(msg);
      if dispatched.is_none() {
        if persist {
          if let Some(msg) = leftover.take() {
            inner.messages.push_back(msg);
          }
        }
      }
      on_complete();
      (dispatched, misses, leftover)
    };
    for miss in misses {
      let PendingReceive {
        default, result, ..
      } = miss;
      if let Some(default) = default {
        result.try_success(default);
      }
    }
    match pending {
      Some(receiver) => match leftover.take() {
        Some(msg) => {
          if receiver.result.try_success(msg.clone()) {
            Enqueued::Dispatched(receiver.result)
          } else {
            // Lost a cancellation race after the scan; go around again.
            self.enqueue_dyn(msg, persist, Box::new(|| {}))
          }
        }
        None => Enqueued::Dropped,
      },
      None => {
        if persist {
          Enqueued::Queued
        } else {
          Enqueued::Dropped
        }
      }
    }
  }

  /// Takes or registers a receive.
  ///
  /// With a message available: a passing (or absent) predicate consumes it; a
  /// failing predicate realizes the fallback value without consuming. With no
  /// message: a closed queue fails drained (or with its error), otherwise the
  /// receive is parked until a message arrives.
  ///
  /// A caller-supplied `result` is realized instead of a fresh one.
  pub fn receive(
    &self,
    predicate: Option<ReceivePredicate<T>>,
    default: Option<T>,
    result: Option<ReceiveResult<T>>,
  ) -> ReceiveResult<T> {
    trace!("MessageQueue::receive() `{}`", self.name);
    let result = result.unwrap_or_else(ReceiveResult::pending);
    let mut inner = self.inner();
    if let Some(err) = inner.error.clone() {
      drop(inner);
      result.try_failure(err);
      return result;
    }
    let front_accepts = inner.messages.front().map(|msg| {
      predicate
        .as_ref()
        .map(|predicate| predicate(msg))
        .unwrap_or(true)
    });
    match front_accepts {
      Some(true) => {
        let msg = inner.messages.pop_front();
        drop(inner);
        if let Some(msg) = msg {
          result.try_success(msg);
        }
      }
      Some(false) => {
        drop(inner);
        match default {
          Some(default) => {
            result.try_success(default);
          }
          None => {
            result.try_failure(Arc::new(ChannelStateError::Rejected));
          }
        }
      }
      None => {
        if inner.closed {
          drop(inner);
          result.try_failure(Arc::new(ChannelStateError::Drained));
        } else {
          inner.receivers.push_back(PendingReceive {
            predicate,
            default,
            result: result.clone(),
          });
        }
      }
    }
    result
  }

  /// Removes and returns every buffered message.
  pub fn drain(&self) -> Vec<T> {
    let mut inner = self.inner();
    std::mem::take(&mut inner.messages).into_iter().collect()
  }

  /// Stops accepting messages.
  ///
  /// If the queue is already empty, parked receives fail drained.
  pub fn close(&self) {
    let pending = {
      let mut inner = self.inner();
      if inner.closed {
        return;
      }
      inner.closed = true;
      if inner.messages.is_empty() {
        inner.receivers.drain(..).collect::<Vec<_>>()
      } else {
        Vec::new()
      }
    };
    trace!("MessageQueue::close() `{}`", self.name);
    for receiver in pending {
      receiver
        .result
        .try_failure(Arc::new(ChannelStateError::Drained));
    }
  }

  /// Fails the queue: buffered messages are discarded and every parked and
  /// future receive fails with `err`.
  pub fn error(&self, err: ErrorValue) {
    let pending = {
      let mut inner = self.inner();
      if inner.error.is_some() {
        return;
      }
      inner.closed = true;
      inner.error = Some(err.clone());
      inner.messages.clear();
      inner.receivers.drain(..).collect::<Vec<_>>()
    };
    trace!("MessageQueue::error() `{}`", self.name);
    for receiver in pending {
      receiver.result.try_failure(err.clone());
    }
  }

  /// Cancels a parked receive. The result's callbacks are never invoked.
  pub fn cancel_receive(&self, result: &ReceiveResult<T>) -> bool {
    let removed = {
      let mut inner = self.inner();
      let position = inner
        .receivers
        .iter()
        .position(|receiver| receiver.result.is_same(result));
      position.map(|index| inner.receivers.remove(index))
    };
    let _ = removed;
    result.cancel()
  }

  /// Offers `msg` to pending receivers, handing it to `fallback` when nobody
  /// takes it. Used to drain an existing queue into a freshly linked edge.
  pub fn dispatch_message(&self, msg: T, fallback: impl FnOnce(T)) {
    let (pending, misses) = {
      let mut inner = self.inner();
      Self::match_receiver(&mut inner, &msg)
    };
    for miss in misses {
      let PendingReceive {
        default, result, ..
      } = miss;
      if let Some(default) = default {
        result.try_success(default);
      }
    }
    match pending {
      Some(receiver) => {
        if !receiver.result.try_success(msg.clone()) {
          fallback(msg);
        }
      }
      None => fallback(msg),
    }
  }

  /// A copy of this queue with transactional semantics.
  ///
  /// Buffered messages are copied; parked receives stay with the original
  /// queue, which remains cancellable through it.
  pub fn transactional_copy(&self) -> Self {
    let inner = self.inner();
    Self {
      name: self.name.clone(),
      inner: Mutex::new(QueueInner {
        messages: inner.messages.clone(),
        receivers: VecDeque::new(),
        closed: inner.closed,
        error: inner.error.clone(),
        transactional: true,
      }),
    }
  }
}

impl<T> std::fmt::Debug for MessageQueue<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    f.debug_struct("MessageQueue")
      .field("name", &self.name)
      .field("len", &inner.messages.len())
      .field("receivers", &inner.receivers.len())
      .field("closed", &inner.closed)
      .field("errored", &inner.error.is_some())
      .finish()
  }
}

/// Dispatches the outcome of a synchronous receive for callers that only
/// care about delivered values.
pub fn delivered_value<T: Clone>(outcome: &ResultOutcome<T>) -> Option<T> {
  outcome.success().cloned()
}
