//! # Edges and Propagators
//!
//! A [`Propagator`] is anything that can accept a propagated message; a node
//! is one kind, and closure-backed sinks ([`FnPropagator`]) are another. An
//! [`Edge`] is a directed link from a node to a propagator.
//!
//! Sneaky edges exist for bookkeeping: they receive fan-out traffic but do
//! not count toward the downstream count, so they never affect grounding or
//! the zero-edge buffering logic.

use std::sync::Arc;

use crate::node::{Node, Propagation};

/// A target capable of accepting propagated messages.
pub trait Propagator<T>: Send + Sync {
  /// An opaque label for diagnostics.
  fn description(&self) -> &str;

  /// Accepts a message, optionally applying the target's own transform.
  fn propagate(&self, msg: T, transform: bool) -> Propagation<T>;

  /// A snapshot of this target's downstream edges.
  fn downstream(&self) -> Vec<Edge<T>>;

  /// Upgrades the target (and its downstream closure) to transactional mode.
  fn transactional(&self) -> bool;

  /// Downcast hook for the fused single-edge propagation path.
  fn as_node(&self) -> Option<&Node<T>> {
    None
  }
}

/// A directed link to a downstream propagator.
pub struct Edge<T> {
  next: Arc<dyn Propagator<T>>,
  description: String,
  sneaky: bool,
}

impl<T> Edge<T> {
  /// A regular edge that counts toward the downstream count.
  pub fn new(description: impl Into<String>, next: Arc<dyn Propagator<T>>) -> Self {
    Self {
      next,
      description: description.into(),
      sneaky: false,
    }
  }

  /// Marks this edge as sneaky bookkeeping.
  #[must_use]
  pub fn sneaky(mut self) -> Self {
    self.sneaky = true;
    self
  }

  /// The downstream target.
  pub fn next_propagator(&self) -> Arc<dyn Propagator<T>> {
    self.next.clone()
  }

  /// Borrow of the downstream target.
  pub fn next(&self) -> &Arc<dyn Propagator<T>> {
    &self.next
  }

  /// The edge's label.
  pub fn description(&self) -> &str {
    &self.description
  }

  /// Whether the edge is invisible to count- and grounding-based decisions.
  pub fn is_sneaky(&self) -> bool {
    self.sneaky
  }

  /// Identity comparison: same target, same flags.
  pub fn is_same(&self, other: &Edge<T>) -> bool {
    Arc::ptr_eq(&self.next, &other.next)
      && self.sneaky == other.sneaky
      && self.description == other.description
  }
}

impl<T> Clone for Edge<T> {
  fn clone(&self) -> Self {
    Self {
      next: self.next.clone(),
      description: self.description.clone(),
      sneaky: self.sneaky,
    }
  }
}

impl<T> std::fmt::Debug for Edge<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Edge")
      .field("description", &self.description)
      .field("next", &self.next.description())
      .field("sneaky", &self.sneaky)
      .finish()
  }
}

/// A terminal propagator backed by a closure.
///
/// Useful as the consumer installed by `consume` and as a sink at the edge of
/// a graph. The closure's return value becomes the propagation outcome.
pub struct FnPropagator<T, F> {
  description: String,
  callback: F,
  _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, F> FnPropagator<T, F>
where
  F: Fn(T) -> Propagation<T> + Send + Sync,
{
  pub fn new(description: impl Into<String>, callback: F) -> Self {
    Self {
      description: description.into(),
      callback,
      _marker: std::marker::PhantomData,
    }
  }
}

impl<T, F> Propagator<T> for FnPropagator<T, F>
where
  T: Send + Sync,
  F: Fn(T) -> Propagation<T> + Send + Sync,
{
  fn description(&self) -> &str {
    &self.description
  }

  fn propagate(&self, msg: T, _transform: bool) -> Propagation<T> {
    (self.callback)(msg)
  }

  fn downstream(&self) -> Vec<Edge<T>> {
    Vec::new()
  }

  fn transactional(&self) -> bool {
    true
  }
}
