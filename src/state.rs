//! # Node State
//!
//! The mode state machine and the immutable per-node state snapshot.
//!
//! A [`NodeState`] is never mutated in place: every transition builds a new
//! snapshot and installs it with a single pointer swap under the node's
//! exclusive lock. Readers load the current snapshot without locking and see
//! either the old state or the new one, never a partial transition.

use std::sync::Arc;

use crate::error::ErrorValue;
use crate::node::Node;
use crate::queue::MessageQueue;

/// The lifecycle mode of a node.
///
/// Modes move monotonically toward a terminal state (`Drained` or `Error`),
/// with two sanctioned reversals: `consume`/`unconsume` between `Open` and
/// `Consumed`, and `unconsume` landing on `Closed` when the queue was closed
/// while consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
  /// Accepting messages and downstream links.
  Open,
  /// The queue has been handed to a clone; queue operations are forwarded.
  Split,
  /// A single designated consumer receives every message through the queue.
  Consumed,
  /// No further messages accepted; the queue may still hold messages.
  Closed,
  /// Closed and fully consumed. Terminal.
  Drained,
  /// Failed with an error value. Terminal.
  Error,
}

impl Mode {
  /// True for `Drained` and `Error`, the two modes a node can never leave.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Mode::Drained | Mode::Error)
  }

  /// True when messages flow through downstream edges in this mode.
  pub fn is_propagating(&self) -> bool {
    matches!(self, Mode::Open | Mode::Split)
  }
}

/// An immutable snapshot of a node's state.
///
/// Replaced as a whole on every transition; see the module docs.
pub struct NodeState<T> {
  pub(crate) mode: Mode,
  pub(crate) downstream_count: usize,
  pub(crate) split: Option<Arc<Node<T>>>,
  pub(crate) error: Option<ErrorValue>,
  pub(crate) queue: Option<Arc<MessageQueue<T>>>,
  pub(crate) read: bool,
  pub(crate) transactional: bool,
  pub(crate) permanent: bool,
}

impl<T> NodeState<T> {
  /// A fresh `Open` state with no queue and no downstream edges.
  pub(crate) fn open(permanent: bool, transactional: bool) -> Self {
    Self {
      mode: Mode::Open,
      downstream_count: 0,
      split: None,
      error: None,
      queue: None,
      read: false,
      transactional,
      permanent,
    }
  }

  /// The current lifecycle mode.
  pub fn mode(&self) -> Mode {
    self.mode
  }

  /// Number of non-sneaky downstream edges.
  pub fn downstream_count(&self) -> usize {
    self.downstream_count
  }

  /// The clone holding this node's queue, when `mode == Split`.
  pub fn split(&self) -> Option<&Arc<Node<T>>> {
    self.split.as_ref()
  }

  /// The error value, when `mode == Error`.
  pub fn error(&self) -> Option<&ErrorValue> {
    self.error.as_ref()
  }

  /// The node's queue. `None` until a consumer or buffering demanded one.
  pub fn queue(&self) -> Option<&Arc<MessageQueue<T>>> {
    self.queue.as_ref()
  }

  /// True once a consumer demanded that a queue be materialized.
  pub fn is_read(&self) -> bool {
    self.read
  }

  /// Whether queues materialized for this node use transactional semantics.
  pub fn is_transactional(&self) -> bool {
    self.transactional
  }

  /// Permanent nodes ignore `close` and `error` unless forced.
  pub fn is_permanent(&self) -> bool {
    self.permanent
  }

  /// The stored error value, falling back to the closed sentinel.
  ///
  /// `mode == Error` guarantees the error is present; the fallback keeps the
  /// accessor total without panicking.
  pub(crate) fn error_value(&self) -> ErrorValue {
    self
      .error
      .clone()
      .unwrap_or_else(|| Arc::new(crate::error::ChannelStateError::Closed))
  }
}

// Snapshots are cloned to derive the successor state; the payload type does
// not need to be cloneable for that, so this cannot be a derive.
impl<T> Clone for NodeState<T> {
  fn clone(&self) -> Self {
    Self {
      mode: self.mode,
      downstream_count: self.downstream_count,
      split: self.split.clone(),
      error: self.error.clone(),
      queue: self.queue.clone(),
      read: self.read,
      transactional: self.transactional,
      permanent: self.permanent,
    }
  }
}

impl<T> std::fmt::Debug for NodeState<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NodeState")
      .field("mode", &self.mode)
      .field("downstream_count", &self.downstream_count)
      .field("split", &self.split.is_some())
      .field("error", &self.error)
      .field("queue", &self.queue.is_some())
      .field("read", &self.read)
      .field("transactional", &self.transactional)
      .field("permanent", &self.permanent)
      .finish()
  }
}
