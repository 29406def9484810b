//! # Error Types
//!
//! This module defines the error surface of the propagation core. Two kinds of
//! failure flow through a graph:
//!
//! - **User error values**: arbitrary errors produced by operators or injected
//!   via [`crate::node::Node::error`]. These travel through node states, queues,
//!   and receive results as the shared [`ErrorValue`] handle.
//! - **Library errors**: misuse of the node API itself ([`NodeError`]) and the
//!   sentinel conditions a queue can report ([`ChannelStateError`]).

use std::sync::Arc;

use thiserror::Error;

/// A shared, cloneable error value.
///
/// Error values cross thread boundaries (queue sentinels, watcher callbacks,
/// receive results), so they are reference-counted rather than boxed.
pub type ErrorValue = Arc<dyn std::error::Error + Send + Sync>;

/// Wraps a concrete error into the shared [`ErrorValue`] handle.
pub fn error_value<E>(err: E) -> ErrorValue
where
  E: std::error::Error + Send + Sync + 'static,
{
  Arc::new(err)
}

/// Errors raised by the node API.
#[derive(Debug, Error)]
pub enum NodeError {
  /// `receive` was called with a name that is already bound to something that
  /// is not a pending receive result.
  #[error("callback name `{name}` on node `{node}` is already bound to a non-result value")]
  InvalidCallbackName {
    /// Description of the node the receive was registered on.
    node: String,
    /// The conflicting callback name.
    name: String,
  },

  /// `cancel` was invoked inside a transaction. Cancellation is an I/O-like
  /// side effect and must run outside any transactional context.
  #[error("cancellation of `{0}` is not permitted inside a transaction")]
  CancelInsideTransaction(String),
}

/// Sentinel conditions reported by queues and receive results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelStateError {
  /// The channel no longer accepts messages.
  #[error("channel is closed")]
  Closed,

  /// The channel is closed and every buffered message has been consumed.
  #[error("channel is drained")]
  Drained,

  /// The pending receive was cancelled before a message arrived.
  #[error("receive was cancelled")]
  Cancelled,

  /// A predicate receive rejected the available message and no fallback
  /// value was supplied.
  #[error("message rejected by receive predicate")]
  Rejected,
}

/// Returns true when `err` is the given [`ChannelStateError`] sentinel.
pub fn is_channel_state(err: &ErrorValue, kind: ChannelStateError) -> bool {
  err
    .downcast_ref::<ChannelStateError>()
    .map(|e| *e == kind)
    .unwrap_or(false)
}
