//! # Propagation Node
//!
//! The thread-safe vertex of a dataflow graph. A node accepts a message from
//! upstream, optionally transforms it through its operator, and propagates the
//! result downstream:
//!
//! - with **zero** downstream edges the message is buffered in the node's
//!   queue (or discarded when the node is grounded);
//! - with **one** downstream edge the message is forwarded inline, walking
//!   through subsequent single-edge nodes in a fused loop that holds at most
//!   one node lock at a time;
//! - with **several** downstream edges the message fans out to every edge and
//!   the per-edge outcomes are collected.
//!
//! ## Locking
//!
//! Every node owns an [`AsymmetricLock`]. State transitions, linking, and
//! queue materialization run under the exclusive mode; propagation takes the
//! shared mode only for the enqueue window, handing the release into the
//! queue's enqueue callback so insertion is atomic with the lock window.
//! State snapshots themselves are read lock-free through an atomic pointer
//! swap, so mode checks on fast paths never contend.
//!
//! ## Watchers and cancellations
//!
//! State-change watchers observe `(mode, downstream count, error)` in a total
//! order per node, with adjacent duplicates suppressed. Named cancellations
//! reverse a prior registration: a link, a pending receive, or a watcher.
//! Both sets are cleared once a terminal mode (drained or error) has been
//! delivered.
//!
//! Watcher callbacks run while the node's exclusive lock is held; anything
//! that needs to take node locks again must go through
//! [`crate::cleanup::enqueue`], which is exactly what the connectors do.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use arc_swap::ArcSwap;
use tracing::{debug, trace, warn};

use crate::connect::join;
use crate::edge::{Edge, Propagator};
use crate::error::{ErrorValue, NodeError};
use crate::lock::{self, AsymmetricLock};
use crate::queue::{Enqueued, MessageQueue, ReceivePredicate};
use crate::result::{ReceiveResult, ResultOutcome};
use crate::state::{Mode, NodeState};
use crate::transaction;

static WATCHER_IDS: AtomicU64 = AtomicU64::new(0);

/// A node's message transform.
///
/// `Ok(Some(_))` passes the transformed message on, `Ok(None)` filters it
/// out, and `Err(_)` transitions the node to the error mode.
pub type Operator<T> = Arc<dyn Fn(T) -> Result<Option<T>, ErrorValue> + Send + Sync>;

/// Callback invoked around a link attempt with its success flag.
pub type LinkCallback = Box<dyn FnOnce(bool) + Send>;

/// The thunk returned by [`Node::consume`]; invoking it unconsumes the node.
pub type ConsumeCancellation = Box<dyn FnOnce() -> bool + Send>;

type WatcherCallback = Box<dyn Fn(Mode, usize, Option<ErrorValue>) + Send>;

struct WatcherEntry {
  id: u64,
  callback: WatcherCallback,
  last: Option<(Mode, usize)>,
}

enum Cancellation<T> {
  Thunk(Box<dyn FnOnce() + Send>),
  Receive(ReceiveResult<T>),
}

/// How a delivered message reached its destination.
pub enum Delivery<T> {
  /// Buffered in a queue (or offered on the fast path with nobody waiting).
  Queued,
  /// Handed directly to a pending receive; carries the realized result.
  Received(ReceiveResult<T>),
}

/// The outcome of a propagation.
pub enum Propagation<T> {
  /// The message was accepted.
  Delivered(Delivery<T>),
  /// The node is grounded and had no consumer; the message was discarded.
  Grounded,
  /// The node's operator filtered the message out.
  Filtered,
  /// The node (or the hop that stopped the message) is closed or drained.
  Closed,
  /// The node is in the error mode.
  Error(ErrorValue),
  /// Fan-out outcomes, one per non-sneaky edge.
  Fanout(Vec<Propagation<T>>),
}

impl<T> Propagation<T> {
  /// True when the message was accepted somewhere downstream.
  pub fn is_delivered(&self) -> bool {
    matches!(self, Propagation::Delivered(_))
  }

  pub fn is_grounded(&self) -> bool {
    matches!(self, Propagation::Grounded)
  }

  pub fn is_filtered(&self) -> bool {
    matches!(self, Propagation::Filtered)
  }

  pub fn is_closed(&self) -> bool {
    matches!(self, Propagation::Closed)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, Propagation::Error(_))
  }

  /// The error value, when the outcome is `Error`.
  pub fn error(&self) -> Option<&ErrorValue> {
    match self {
      Propagation::Error(err) => Some(err),
      _ => None,
    }
  }

  /// The realized receive result, when the message was dispatched into one.
  pub fn received(&self) -> Option<&ReceiveResult<T>> {
    match self {
      Propagation::Delivered(Delivery::Received(result)) => Some(result),
      _ => None,
    }
  }

  /// The per-edge outcomes, when the message fanned out.
  pub fn fanout(&self) -> Option<&[Propagation<T>]> {
    match self {
      Propagation::Fanout(outcomes) => Some(outcomes),
      _ => None,
    }
  }
}

impl<T> std::fmt::Debug for Propagation<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Propagation::Delivered(Delivery::Queued) => write!(f, "Delivered(Queued)"),
      Propagation::Delivered(Delivery::Received(_)) => write!(f, "Delivered(Received)"),
      Propagation::Grounded => write!(f, "Grounded"),
      Propagation::Filtered => write!(f, "Filtered"),
      Propagation::Closed => write!(f, "Closed"),
      Propagation::Error(err) => write!(f, "Error({})", err),
      Propagation::Fanout(outcomes) => f.debug_list().entries(outcomes.iter()).finish(),
    }
  }
}

/// One step of the fused single-edge walk.
enum Step<T> {
  /// Keep walking: the transformed message and the next hop.
  Continue(T, Arc<dyn Propagator<T>>),
  /// The hop is not eligible for fusion; re-enter the regular path.
  Fallback(T),
  /// The walk terminated with an outcome.
  Done(Propagation<T>),
}

/// A thread-safe vertex in a directed graph of message propagators.
pub struct Node<T> {
  weak: Weak<Node<T>>,
  description: String,
  operator: Option<Operator<T>>,
  grounded: bool,
  lock: AsymmetricLock,
  state: ArcSwap<NodeState<T>>,
  edges: RwLock<Arc<Vec<Edge<T>>>>,
  watchers: Mutex<Vec<WatcherEntry>>,
  cancellations: Mutex<HashMap<String, Cancellation<T>>>,
}

/// Configures and builds a [`Node`].
pub struct NodeBuilder<T> {
  description: String,
  operator: Option<Operator<T>>,
  grounded: bool,
  permanent: bool,
  transactional: bool,
  messages: Vec<T>,
}

impl<T: Clone + Send + Sync + 'static> NodeBuilder<T> {
  pub fn new() -> Self {
    Self {
      description: "node".to_string(),
      operator: None,
      grounded: false,
      permanent: false,
      transactional: false,
      messages: Vec::new(),
    }
  }

  /// Sets the node's description.
  #[must_use]
  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Sets the node's message transform.
  #[must_use]
  pub fn with_operator(
    mut self,
    operator: impl Fn(T) -> Result<Option<T>, ErrorValue> + Send + Sync + 'static,
  ) -> Self {
    self.operator = Some(Arc::new(operator));
    self
  }

  /// Grounded nodes discard messages arriving with no downstream consumer.
  #[must_use]
  pub fn grounded(mut self) -> Self {
    self.grounded = true;
    self
  }

  /// Permanent nodes ignore `close` and `error` unless forced.
  #[must_use]
  pub fn permanent(mut self) -> Self {
    self.permanent = true;
    self
  }

  /// Queues materialized for this node use transactional semantics.
  #[must_use]
  pub fn transactional(mut self) -> Self {
    self.transactional = true;
    self
  }

  /// Pre-seeds the node's queue with messages.
  #[must_use]
  pub fn with_messages(mut self, messages: Vec<T>) -> Self {
    self.messages = messages;
    self
  }

  pub fn build(self) -> Arc<Node<T>> {
    let mut state = NodeState::open(self.permanent, self.transactional);
    if !self.messages.is_empty() {
      state.queue = Some(Arc::new(MessageQueue::from_messages(
        &self.description,
        self.messages,
        self.transactional,
      )));
    }
    Arc::new_cyclic(|weak| Node {
      weak: weak.clone(),
      description: self.description,
      operator: self.operator,
      grounded: self.grounded,
      lock: AsymmetricLock::new(),
      state: ArcSwap::from_pointee(state),
      edges: RwLock::new(Arc::new(Vec::new())),
      watchers: Mutex::new(Vec::new()),
      cancellations: Mutex::new(HashMap::new()),
    })
  }
}

impl<T: Clone + Send + Sync + 'static> Default for NodeBuilder<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Clones a node's collaborators into a fresh node sharing its state.
///
/// The clone gets its own lock and empty edge/watcher/cancellation sets, and
/// no operator: the original applies its transform before forwarding, so the
/// clone must pass messages through untouched.
pub fn split_node<T: Clone + Send + Sync + 'static>(node: &Node<T>) -> Arc<Node<T>> {
  let state = node.state_snapshot();
  let mut cloned = (*state).clone();
  cloned.split = None;
  Arc::new_cyclic(|weak| Node {
    weak: weak.clone(),
    description: node.description.clone(),
    operator: None,
    grounded: node.grounded,
    lock: AsymmetricLock::new(),
    state: ArcSwap::from_pointee(cloned),
    edges: RwLock::new(Arc::new(Vec::new())),
    watchers: Mutex::new(Vec::new()),
    cancellations: Mutex::new(HashMap::new()),
  })
}

impl<T: Clone + Send + Sync + 'static> Node<T> {
  /// A plain open node with no operator.
  pub fn new(description: impl Into<String>) -> Arc<Self> {
    NodeBuilder::new().with_description(description).build()
  }

  pub fn builder() -> NodeBuilder<T> {
    NodeBuilder::new()
  }

  /// The node's opaque label.
  pub fn description(&self) -> &str {
    &self.description
  }

  /// A stable process-unique identity, also the lock-ordering key.
  pub fn id(&self) -> u64 {
    self.lock.id()
  }

  /// The current state snapshot.
  pub fn state(&self) -> Arc<NodeState<T>> {
    self.state_snapshot()
  }

  /// The node's queue, following the split clone when present.
  pub fn queue(&self) -> Option<Arc<MessageQueue<T>>> {
    let state = self.state_snapshot();
    match state.split() {
      Some(split) => split.queue(),
      None => state.queue.clone(),
    }
  }

  /// Number of messages currently buffered.
  pub fn queue_len(&self) -> usize {
    self.queue().map(|queue| queue.len()).unwrap_or(0)
  }

  /// Whether this node discards messages when nobody consumes them.
  pub fn is_grounded(&self) -> bool {
    self.grounded
  }

  /// True once the node stopped accepting messages.
  pub fn is_closed(&self) -> bool {
    matches!(
      self.state_snapshot().mode,
      Mode::Closed | Mode::Drained | Mode::Error
    )
  }

  pub fn is_drained(&self) -> bool {
    self.state_snapshot().mode == Mode::Drained
  }

  pub fn is_split(&self) -> bool {
    self.state_snapshot().mode == Mode::Split
  }

  pub fn is_consumed(&self) -> bool {
    self.state_snapshot().mode == Mode::Consumed
  }

  /// The error this node failed with, if any.
  pub fn error_value(&self) -> Option<ErrorValue> {
    self.state_snapshot().error.clone()
  }

  /// A snapshot of the downstream edges.
  pub fn downstream(&self) -> Vec<Edge<T>> {
    (*self.edges_snapshot()).clone()
  }

  // Lock capability: the node exposes its asymmetric lock by delegating.

  /// Acquires this node's lock in shared mode.
  pub fn acquire(&self) {
    self.lock.acquire()
  }

  /// Releases one shared acquisition.
  pub fn release(&self) {
    self.lock.release()
  }

  /// Acquires this node's lock in exclusive mode.
  pub fn acquire_exclusive(&self) {
    self.lock.acquire_exclusive()
  }

  /// Releases the exclusive acquisition.
  pub fn release_exclusive(&self) {
    self.lock.release_exclusive()
  }

  pub fn try_acquire(&self) -> bool {
    self.lock.try_acquire()
  }

  pub fn try_acquire_exclusive(&self) -> bool {
    self.lock.try_acquire_exclusive()
  }

  pub(crate) fn node_lock(&self) -> &AsymmetricLock {
    &self.lock
  }

  fn arc(&self) -> Arc<Self> {
    match self.weak.upgrade() {
      Some(node) => node,
      // &self proves an owner exists; upgrade can only fail mid-teardown.
      None => unreachable!("node accessed during teardown"),
    }
  }

  fn state_snapshot(&self) -> Arc<NodeState<T>> {
    self.state.load_full()
  }

  fn store_state(&self, state: NodeState<T>) {
    self.state.store(Arc::new(state));
  }

  fn edges_snapshot(&self) -> Arc<Vec<Edge<T>>> {
    self
      .edges
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn set_edges(&self, edges: Vec<Edge<T>>) {
    *self.edges.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(edges);
  }

  fn push_edge(&self, edge: Edge<T>) {
    let mut guard = self.edges.write().unwrap_or_else(PoisonError::into_inner);
    let mut next = (**guard).clone();
    next.push(edge);
    *guard = Arc::new(next);
  }

  fn remove_edge(&self, edge: &Edge<T>) -> bool {
    let mut guard = self.edges.write().unwrap_or_else(PoisonError::into_inner);
    match guard.iter().position(|candidate| candidate.is_same(edge)) {
      Some(index) => {
        let mut next = (**guard).clone();
        next.remove(index);
        *guard = Arc::new(next);
        true
      }
      None => false,
    }
  }

  fn watchers_guard(&self) -> MutexGuard<'_, Vec<WatcherEntry>> {
    self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn cancellations_guard(&self) -> MutexGuard<'_, HashMap<String, Cancellation<T>>> {
    self
      .cancellations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn invoke_watcher(
    &self,
    entry: &mut WatcherEntry,
    mode: Mode,
    count: usize,
    err: Option<ErrorValue>,
  ) {
    if entry.last == Some((mode, count)) {
      return;
    }
    entry.last = Some((mode, count));
    let callback = &entry.callback;
    if catch_unwind(AssertUnwindSafe(|| callback(mode, count, err))).is_err() {
      warn!("state watcher panicked on node `{}`", self.description);
    }
  }

  /// Delivers a transition to every watcher; terminal transitions clear the
  /// watcher and cancellation sets afterwards. Caller holds the exclusive
  /// lock.
  fn notify_watchers_locked(&self, mode: Mode, count: usize, err: Option<ErrorValue>) {
    {
      let mut watchers = self.watchers_guard();
      for entry in watchers.iter_mut() {
        self.invoke_watcher(entry, mode, count, err.clone());
      }
    }
    if mode.is_terminal() {
      self.watchers_guard().clear();
      self.cancellations_guard().clear();
    }
  }

  fn apply_operator(&self, msg: T) -> Result<Option<T>, ErrorValue> {
    match &self.operator {
      Some(operator) => operator(msg),
      None => Ok(Some(msg)),
    }
  }

  /// Materializes the queue if `state` has none, under the held exclusive
  /// lock. `mark_read` records that a consumer demanded it.
  fn ensure_queue_locked(&self, state: &NodeState<T>, mark_read: bool) -> Arc<MessageQueue<T>> {
    if let Some(queue) = state.queue() {
      if mark_read && !state.read {
        let mut next = state.clone();
        next.read = true;
        self.store_state(next);
      }
      return queue.clone();
    }
    let queue = Arc::new(if state.transactional {
      MessageQueue::transactional(&self.description)
    } else {
      MessageQueue::new(&self.description)
    });
    let mut next = state.clone();
    next.queue = Some(queue.clone());
    next.read = next.read || mark_read;
    self.store_state(next);
    queue
  }

  fn materialize_queue(&self) {
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if state.queue.is_none() && matches!(state.mode, Mode::Open | Mode::Consumed) {
      self.ensure_queue_locked(&state, false);
    }
    self.lock.release_exclusive();
  }

  /// Closed and fully consumed: install the drained mode. Caller holds the
  /// exclusive lock.
  fn drained_transition_locked(&self) {
    let state = self.state_snapshot();
    if state.mode != Mode::Closed {
      return;
    }
    let drained = state.queue().map(|queue| queue.is_drained()).unwrap_or(true);
    if !drained {
      return;
    }
    let mut next = (*state).clone();
    next.mode = Mode::Drained;
    next.downstream_count = 0;
    next.queue = Some(Arc::new(MessageQueue::drained(&self.description)));
    self.store_state(next);
    debug!("Node `{}` drained", self.description);
    self.notify_watchers_locked(Mode::Drained, 0, None);
  }

  fn finish_enqueue(&self, outcome: Enqueued<T>, tag: bool) -> Propagation<T> {
    match outcome {
      Enqueued::Dispatched(result) => {
        if tag {
          result.set_queue_metadata(&self.description);
        }
        Propagation::Delivered(Delivery::Received(result))
      }
      Enqueued::Queued | Enqueued::Dropped => Propagation::Delivered(Delivery::Queued),
      Enqueued::Closed => Propagation::Closed,
    }
  }

  /// Propagates a message into this node.
  ///
  /// With `transform` set, the node's operator is applied first: a filtered
  /// message returns [`Propagation::Filtered`], an operator failure
  /// transitions the node to the error mode and returns the error outcome.
  pub fn propagate(&self, msg: T, transform: bool) -> Propagation<T> {
    trace!("Node::propagate() `{}`", self.description);
    let msg = if transform {
      match self.apply_operator(msg) {
        Ok(Some(msg)) => msg,
        Ok(None) => return Propagation::Filtered,
        Err(err) => {
          self.error(err.clone(), false);
          return Propagation::Error(err);
        }
      }
    } else {
      msg
    };
    self.propagate_ready(msg)
  }

  /// Propagation after the operator has run.
  fn propagate_ready(&self, msg: T) -> Propagation<T> {
    loop {
      self.lock.acquire();
      let state = self.state_snapshot();
      match state.mode {
        Mode::Closed | Mode::Drained => {
          self.lock.release();
          return Propagation::Closed;
        }
        Mode::Error => {
          let err = state.error_value();
          self.lock.release();
          return Propagation::Error(err);
        }
        Mode::Consumed => match state.queue() {
          Some(queue) => {
            let outcome = queue.enqueue(msg, true, || self.lock.release());
            return self.finish_enqueue(outcome, false);
          }
          None => {
            self.lock.release();
            self.materialize_queue();
            continue;
          }
        },
        Mode::Open | Mode::Split => {
          if self.grounded && state.downstream_count == 0 {
            self.lock.release();
            return Propagation::Grounded;
          }
          match state.downstream_count {
            0 => {
              if let Some(split) = state.split() {
                let split = split.clone();
                self.lock.release();
                return split.propagate(msg, false);
              }
              match state.queue() {
                Some(queue) => {
                  let persist = !self.grounded;
                  let outcome = queue.enqueue(msg, persist, || self.lock.release());
                  return self.finish_enqueue(outcome, true);
                }
                None => {
                  self.lock.release();
                  self.materialize_queue();
                  continue;
                }
              }
            }
            1 => {
              let edges = self.edges_snapshot();
              let next = edges
                .iter()
                .find(|edge| !edge.is_sneaky())
                .map(|edge| edge.next_propagator());
              let Some(next) = next else {
                self.lock.release();
                debug_assert!(false, "downstream count and edge set out of sync");
                return Propagation::Closed;
              };
              match state.queue() {
                Some(queue) => {
                  let _ = queue.enqueue(msg.clone(), false, || self.lock.release());
                }
                None => self.lock.release(),
              }
              return Self::fused_walk(msg, next);
            }
            _ => {
              let edges = self.edges_snapshot();
              match state.queue() {
                Some(queue) => {
                  let _ = queue.enqueue(msg.clone(), false, || self.lock.release());
                }
                None => self.lock.release(),
              }
              let mut results = Vec::with_capacity(state.downstream_count);
              for edge in edges.iter() {
                match edge.next().propagate(msg.clone(), true) {
                  Propagation::Error(err) => {
                    self.error(err.clone(), false);
                    return Propagation::Error(err);
                  }
                  outcome => {
                    if !edge.is_sneaky() {
                      results.push(outcome);
                    }
                  }
                }
              }
              return Propagation::Fanout(results);
            }
          }
        }
      }
    }
  }

  /// The fused single-edge fast path.
  ///
  /// Walks a chain of open/split single-edge nodes without recursing. At any
  /// instant at most one node lock is held: the upstream lock is released
  /// inside the enqueue callback before the next hop's lock is acquired. A
  /// hop that is not an eligible node falls back to the regular propagate
  /// path with the transform already applied.
  fn fused_walk(mut msg: T, mut target: Arc<dyn Propagator<T>>) -> Propagation<T> {
    loop {
      let step = match target.as_node() {
        None => return target.propagate(msg, true),
        Some(node) => node.fused_step(msg),
      };
      match step {
        Step::Continue(next_msg, next_target) => {
          msg = next_msg;
          target = next_target;
        }
        Step::Fallback(next_msg) => return target.propagate(next_msg, false),
        Step::Done(outcome) => return outcome,
      }
    }
  }

  /// One hop of the fused walk: transform, lock, examine, enqueue, hand over.
  fn fused_step(&self, msg: T) -> Step<T> {
    let msg = match self.apply_operator(msg) {
      Ok(Some(msg)) => msg,
      Ok(None) => return Step::Done(Propagation::Filtered),
      Err(err) => {
        self.error(err.clone(), false);
        return Step::Done(Propagation::Error(err));
      }
    };
    self.lock.acquire();
    let state = self.state_snapshot();
    match state.mode {
      Mode::Closed | Mode::Drained => {
        self.lock.release();
        Step::Done(Propagation::Closed)
      }
      Mode::Error => {
        let err = state.error_value();
        self.lock.release();
        Step::Done(Propagation::Error(err))
      }
      Mode::Open | Mode::Split if state.downstream_count == 1 => {
        let edges = self.edges_snapshot();
        let next = edges
          .iter()
          .find(|edge| !edge.is_sneaky())
          .map(|edge| edge.next_propagator());
        match next {
          Some(next) => {
            match state.queue() {
              Some(queue) => {
                let _ = queue.enqueue(msg.clone(), false, || self.lock.release());
              }
              None => self.lock.release(),
            }
            Step::Continue(msg, next)
          }
          None => {
            self.lock.release();
            Step::Fallback(msg)
          }
        }
      }
      _ => {
        self.lock.release();
        Step::Fallback(msg)
      }
    }
  }

  /// Installs a downstream edge under `name`.
  ///
  /// `pre` runs with the success flag before the cancellation is registered,
  /// `post` after the lock is released. Linking a closed node drains its
  /// queue into the new edge and transitions to drained; linking a drained,
  /// errored, or consumed node fails, as does reusing a registered name.
  pub fn link(
    &self,
    name: &str,
    edge: Edge<T>,
    mut pre: Option<LinkCallback>,
    post: Option<LinkCallback>,
  ) -> bool {
    trace!("Node::link() `{}` <- `{}`", self.description, name);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    let target = edge.next_propagator();
    let sneaky = edge.is_sneaky();
    let mut success = false;
    let mut upgrade_target = false;
    let mut drain_into: Option<(Arc<MessageQueue<T>>, Edge<T>)> = None;
    let name_taken = self.cancellations_guard().contains_key(name);
    if !name_taken {
      match state.mode {
        Mode::Open | Mode::Split => {
          success = true;
          let old_count = state.downstream_count;
          let new_count = old_count + usize::from(!sneaky);
          self.push_edge(edge.clone());
          let queue = if state.read && state.queue.is_none() {
            Some(Arc::new(if state.transactional {
              MessageQueue::transactional(&self.description)
            } else {
              MessageQueue::new(&self.description)
            }))
          } else {
            state.queue.clone()
          };
          if state.transactional {
            upgrade_target = true;
          }
          if old_count == 0 && new_count == 1 {
            if let Some(queue) = &queue {
              drain_into = Some((queue.clone(), edge.clone()));
            }
          }
          let mut next = (*state).clone();
          next.downstream_count = new_count;
          next.queue = queue;
          self.store_state(next);
          if let Some(pre) = pre.take() {
            pre(true);
          }
          let this = self.arc();
          let cancel_edge = edge.clone();
          self.cancellations_guard().insert(
            name.to_string(),
            Cancellation::Thunk(Box::new(move || {
              this.unlink(&cancel_edge);
            })),
          );
          if new_count <= 1 {
            self.notify_watchers_locked(state.mode, new_count, None);
          }
        }
        Mode::Closed => {
          // A newly linked consumer drains the closed queue into itself.
          success = true;
          if let Some(pre) = pre.take() {
            pre(true);
          }
          if let Some(queue) = state.queue() {
            drain_into = Some((queue.clone(), edge.clone()));
          }
          let mut next = (*state).clone();
          next.mode = Mode::Drained;
          next.downstream_count = 0;
          next.queue = Some(Arc::new(MessageQueue::drained(&self.description)));
          self.store_state(next);
          debug!("Node `{}` closed -> drained on link", self.description);
          self.notify_watchers_locked(Mode::Drained, 0, None);
        }
        _ => {}
      }
    }
    if !success {
      if let Some(pre) = pre.take() {
        pre(false);
      }
    }
    self.lock.release_exclusive();
    if upgrade_target {
      target.transactional();
    }
    if let Some((queue, edge)) = drain_into {
      for msg in queue.drain() {
        queue.dispatch_message(msg, |msg| {
          edge.next().propagate(msg, true);
        });
      }
    }
    if let Some(post) = post {
      post(success);
    }
    success
  }

  /// Removes a downstream edge.
  ///
  /// Unlinking the last counted edge closes the node, unless it is permanent,
  /// in which case it stays open with a fresh queue. Unlinking an edge that
  /// is not present is a no-op returning false.
  pub fn unlink(&self, edge: &Edge<T>) -> bool {
    trace!("Node::unlink() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if !state.mode.is_propagating() {
      self.lock.release_exclusive();
      return false;
    }
    if !self.remove_edge(edge) {
      self.lock.release_exclusive();
      return false;
    }
    let sneaky = edge.is_sneaky();
    let new_count = if sneaky {
      state.downstream_count
    } else {
      state.downstream_count.saturating_sub(1)
    };
    if !sneaky && new_count == 0 {
      if state.permanent {
        let mut next = (*state).clone();
        next.downstream_count = 0;
        next.queue = Some(Arc::new(if state.transactional {
          MessageQueue::transactional(&self.description)
        } else {
          MessageQueue::new(&self.description)
        }));
        self.store_state(next);
        self.notify_watchers_locked(state.mode, 0, None);
      } else {
        self.close_locked(&state);
      }
    } else {
      let mut next = (*state).clone();
      next.downstream_count = new_count;
      self.store_state(next);
      if new_count <= 1 {
        self.notify_watchers_locked(state.mode, new_count, None);
      }
    }
    self.lock.release_exclusive();
    true
  }

  /// Installs `edge` as the sole consumer of this node.
  ///
  /// Succeeds on an open node with no downstream edges, transitioning it to
  /// the consumed mode; every message then flows into the queue for the
  /// consumer. Returns a thunk that unconsumes. Already-terminal nodes
  /// re-succeed idempotently with a no-op thunk.
  pub fn consume(&self, edge: Edge<T>) -> Option<ConsumeCancellation> {
    trace!("Node::consume() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if let Some(split) = state.split() {
      let split = split.clone();
      self.lock.release_exclusive();
      return split.consume(edge);
    }
    match state.mode {
      Mode::Drained | Mode::Error => {
        self.lock.release_exclusive();
        Some(Box::new(|| false))
      }
      Mode::Open if state.downstream_count == 0 => {
        self.ensure_queue_locked(&state, true);
        self.set_edges(vec![edge.clone()]);
        let refreshed = self.state_snapshot();
        let mut next = (*refreshed).clone();
        next.mode = Mode::Consumed;
        next.downstream_count = 1;
        self.store_state(next);
        self.notify_watchers_locked(Mode::Consumed, 1, None);
        let upgrade = state.transactional;
        self.lock.release_exclusive();
        if upgrade {
          edge.next().transactional();
        }
        let this = self.arc();
        Some(Box::new(move || this.unconsume(&edge)))
      }
      _ => {
        self.lock.release_exclusive();
        None
      }
    }
  }

  /// Releases the consumer installed by [`Node::consume`].
  ///
  /// The node returns to open, or to closed when its queue was closed while
  /// consumed.
  pub fn unconsume(&self, edge: &Edge<T>) -> bool {
    trace!("Node::unconsume() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if state.mode != Mode::Consumed {
      self.lock.release_exclusive();
      return false;
    }
    let edges = self.edges_snapshot();
    let matches = edges
      .first()
      .map(|candidate| candidate.is_same(edge))
      .unwrap_or(false);
    if !matches {
      self.lock.release_exclusive();
      return false;
    }
    self.set_edges(Vec::new());
    let closed = state
      .queue()
      .map(|queue| queue.is_closed())
      .unwrap_or(false);
    let mut next = (*state).clone();
    next.mode = if closed { Mode::Closed } else { Mode::Open };
    next.downstream_count = 0;
    let mode = next.mode;
    self.store_state(next);
    self.notify_watchers_locked(mode, 0, None);
    self.lock.release_exclusive();
    true
  }

  /// Hands this node's queue and downstream to a clone and enters the split
  /// mode; queue operations are forwarded to the clone from then on.
  ///
  /// The clone inherits the current state, edges, watchers, and
  /// cancellations; a synthetic edge keeps messages flowing from the
  /// original into it. Splitting an already-split node returns the existing
  /// clone; splitting a terminal node returns the node itself.
  pub fn split(&self) -> Arc<Node<T>> {
    trace!("Node::split() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if let Some(existing) = state.split() {
      let existing = existing.clone();
      self.lock.release_exclusive();
      return existing;
    }
    if state.mode.is_terminal() {
      self.lock.release_exclusive();
      return self.arc();
    }
    let clone = split_node(self);
    {
      let mut mine = self.edges.write().unwrap_or_else(PoisonError::into_inner);
      let mut theirs = clone.edges.write().unwrap_or_else(PoisonError::into_inner);
      *theirs = std::mem::take(&mut *mine);
    }
    {
      let mut mine = self.watchers_guard();
      let mut theirs = clone.watchers_guard();
      theirs.append(&mut mine);
    }
    {
      let mut mine = self.cancellations_guard();
      let mut theirs = clone.cancellations_guard();
      theirs.extend(mine.drain());
    }
    let mut next = (*state).clone();
    next.mode = Mode::Split;
    next.split = Some(clone.clone());
    next.queue = None;
    next.downstream_count = 0;
    self.store_state(next);
    debug!("Node `{}` split", self.description);
    self.lock.release_exclusive();
    join(&self.arc(), &clone);
    clone
  }

  /// Stops accepting messages.
  ///
  /// Clears the edges, closes the queue, and transitions to drained (empty
  /// queue) or closed (messages still buffered). Permanent nodes ignore the
  /// call unless `force` is set; terminal and split nodes return false.
  pub fn close(&self, force: bool) -> bool {
    trace!("Node::close() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    let blocked = matches!(
      state.mode,
      Mode::Closed | Mode::Drained | Mode::Error | Mode::Split
    ) || (state.permanent && !force);
    if blocked {
      self.lock.release_exclusive();
      return false;
    }
    let closed = self.close_locked(&state);
    self.lock.release_exclusive();
    closed
  }

  /// The closing transition proper. Caller holds the exclusive lock and has
  /// already validated the mode.
  fn close_locked(&self, state: &NodeState<T>) -> bool {
    self.set_edges(Vec::new());
    let mut next = state.clone();
    next.downstream_count = 0;
    next.split = None;
    match state.queue() {
      Some(queue) => {
        queue.close();
        if queue.is_drained() {
          next.mode = Mode::Drained;
          next.queue = Some(Arc::new(MessageQueue::drained(&self.description)));
        } else {
          next.mode = Mode::Closed;
        }
      }
      None => {
        next.mode = Mode::Drained;
        next.queue = Some(Arc::new(MessageQueue::drained(&self.description)));
      }
    }
    let mode = next.mode;
    self.store_state(next);
    debug!("Node `{}` -> {:?}", self.description, mode);
    self.notify_watchers_locked(mode, 0, None);
    true
  }

  /// Fails the node with `err`.
  ///
  /// The queue is failed and replaced with the error sentinel, edges,
  /// watchers, and cancellations are cleared, and watchers observe the error
  /// mode. Permanent nodes and closed nodes resist unless `force` is set;
  /// terminal nodes return false.
  pub fn error(&self, err: ErrorValue, force: bool) -> bool {
    trace!("Node::error() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    let blocked = state.mode.is_terminal()
      || (state.permanent && !force)
      || (state.mode == Mode::Closed && !force);
    if blocked {
      self.lock.release_exclusive();
      return false;
    }
    if let Some(queue) = state.queue() {
      queue.error(err.clone());
    }
    self.set_edges(Vec::new());
    let mut next = (*state).clone();
    next.mode = Mode::Error;
    next.downstream_count = 0;
    next.split = None;
    next.error = Some(err.clone());
    next.queue = Some(Arc::new(MessageQueue::errored(&self.description, err.clone())));
    self.store_state(next);
    debug!("Node `{}` -> Error: {}", self.description, err);
    self.notify_watchers_locked(Mode::Error, 0, Some(err));
    self.lock.release_exclusive();
    true
  }

  /// Registers a cancellable receive under `name`.
  ///
  /// A name already bound to a pending receive re-succeeds idempotently with
  /// that result; a name bound to anything else fails. The callback observes
  /// the outcome; a later [`Node::cancel`] with the same name prevents it
  /// from ever being invoked.
  pub fn receive(
    &self,
    name: Option<&str>,
    callback: impl FnOnce(&ResultOutcome<T>) + Send + 'static,
  ) -> Result<ReceiveResult<T>, NodeError> {
    trace!("Node::receive() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if let Some(split) = state.split() {
      let split = split.clone();
      self.lock.release_exclusive();
      return split.receive(name, callback);
    }
    if let Some(name) = name {
      let existing = {
        let guard = self.cancellations_guard();
        match guard.get(name) {
          Some(Cancellation::Receive(result)) => Some(Ok(result.clone())),
          Some(Cancellation::Thunk(_)) => Some(Err(NodeError::InvalidCallbackName {
            node: self.description.clone(),
            name: name.to_string(),
          })),
          None => None,
        }
      };
      if let Some(outcome) = existing {
        self.lock.release_exclusive();
        return outcome;
      }
    }
    let queue = self.ensure_queue_locked(&state, true);
    let result = queue.receive(None, None, None);
    if result
      .outcome()
      .map(|outcome| outcome.is_success())
      .unwrap_or(false)
    {
      self.drained_transition_locked();
    }
    if result.is_pending() {
      if let Some(name) = name {
        self
          .cancellations_guard()
          .insert(name.to_string(), Cancellation::Receive(result.clone()));
        let this = self.arc();
        let key = name.to_string();
        let tracked = result.clone();
        result.subscribe(move |_| this.remove_receive_cancellation(&key, &tracked));
      }
    }
    self.lock.release_exclusive();
    result.subscribe(callback);
    Ok(result)
  }

  /// Completion handler for named receives: drops the cancellation entry once
  /// the result realizes. Goes through the map mutex alone; taking the node
  /// lock here would deadlock against the completing enqueue.
  fn remove_receive_cancellation(&self, name: &str, result: &ReceiveResult<T>) {
    let mut guard = self.cancellations_guard();
    if let Some(Cancellation::Receive(existing)) = guard.get(name) {
      if existing.is_same(result) {
        guard.remove(name);
      }
    }
  }

  /// An uncancellable read from the node's queue.
  pub fn read(&self) -> ReceiveResult<T> {
    self.read_with(None, None, None)
  }

  /// An uncancellable read with the full receive surface: an optional
  /// predicate, the value realized on a predicate miss, and an optional
  /// caller-supplied result to realize.
  pub fn read_with(
    &self,
    predicate: Option<ReceivePredicate<T>>,
    default: Option<T>,
    result: Option<ReceiveResult<T>>,
  ) -> ReceiveResult<T> {
    trace!("Node::read() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if let Some(split) = state.split() {
      let split = split.clone();
      self.lock.release_exclusive();
      return split.read_with(predicate, default, result);
    }
    let queue = self.ensure_queue_locked(&state, true);
    let result = queue.receive(predicate, default, result);
    if result
      .outcome()
      .map(|outcome| outcome.is_success())
      .unwrap_or(false)
    {
      self.drained_transition_locked();
    }
    self.lock.release_exclusive();
    result
  }

  /// Takes the next message only if it satisfies `predicate`, realizing
  /// `default` otherwise without consuming.
  pub fn receive_when(
    &self,
    predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    default: T,
  ) -> ReceiveResult<T> {
    self.read_with(Some(Arc::new(predicate)), Some(default), None)
  }

  /// Atomically removes and returns every buffered message, running the
  /// drained check.
  pub fn drain(&self) -> Vec<T> {
    trace!("Node::drain() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if let Some(split) = state.split() {
      let split = split.clone();
      self.lock.release_exclusive();
      return split.drain();
    }
    let drained = state.queue().map(|queue| queue.drain()).unwrap_or_default();
    self.drained_transition_locked();
    self.lock.release_exclusive();
    drained
  }

  /// Upgrades this node and its downstream closure to transactional mode.
  ///
  /// Hand-over-hand: the node is held exclusively while the downstream node
  /// set is acquired (in id order), released only after the set is held, and
  /// the upgrade then recurses into each member. Already-transactional nodes
  /// are a no-op returning true.
  pub fn transactional(&self) -> bool {
    trace!("Node::transactional() `{}`", self.description);
    self.lock.acquire_exclusive();
    self.transactional_locked()
  }

  /// The upgrade body; enters with the exclusive lock held and releases it.
  fn transactional_locked(&self) -> bool {
    let state = self.state_snapshot();
    if state.transactional {
      self.lock.release_exclusive();
      return true;
    }
    let mut next = (*state).clone();
    next.transactional = true;
    next.queue = state.queue().map(|queue| Arc::new(queue.transactional_copy()));
    self.store_state(next);
    let edges = self.edges_snapshot();
    let mut nodes: Vec<&Node<T>> = Vec::new();
    let mut other_targets: Vec<Arc<dyn Propagator<T>>> = Vec::new();
    for edge in edges.iter() {
      match edge.next().as_node() {
        Some(node) => nodes.push(node),
        None => other_targets.push(edge.next_propagator()),
      }
    }
    nodes.sort_by_key(|node| node.id());
    nodes.dedup_by_key(|node| node.id());
    {
      let mut locks: Vec<&AsymmetricLock> = nodes.iter().map(|node| node.node_lock()).collect();
      lock::acquire_all(&mut locks);
    }
    self.lock.release_exclusive();
    for node in &nodes {
      node.transactional_locked();
    }
    for target in other_targets {
      target.transactional();
    }
    true
  }

  /// Invokes and removes the cancellation registered under `name`.
  ///
  /// A pending receive is cancelled through the queue; a registration thunk
  /// (link, watcher) is invoked. Rejected inside a transaction.
  pub fn cancel(&self, name: &str) -> Result<bool, NodeError> {
    trace!("Node::cancel() `{}` `{}`", self.description, name);
    if transaction::in_transaction() {
      return Err(NodeError::CancelInsideTransaction(name.to_string()));
    }
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    if let Some(split) = state.split() {
      let split = split.clone();
      self.lock.release_exclusive();
      return split.cancel(name);
    }
    let entry = self.cancellations_guard().remove(name);
    let queue = state.queue.clone();
    self.lock.release_exclusive();
    match entry {
      Some(Cancellation::Thunk(thunk)) => {
        thunk();
        Ok(true)
      }
      Some(Cancellation::Receive(result)) => {
        match queue {
          Some(queue) => {
            queue.cancel_receive(&result);
          }
          None => {
            result.cancel();
          }
        }
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Registers a state-change watcher, optionally cancellable under `name`.
  ///
  /// The callback is invoked immediately with the current state, then once
  /// per transition; exceptions are swallowed. On a terminal node the
  /// callback fires once and nothing is registered.
  pub fn on_state_changed(
    &self,
    name: Option<&str>,
    callback: impl Fn(Mode, usize, Option<ErrorValue>) + Send + 'static,
  ) -> bool {
    trace!("Node::on_state_changed() `{}`", self.description);
    self.lock.acquire_exclusive();
    let state = self.state_snapshot();
    let mode = state.mode;
    let count = state.downstream_count;
    let err = state.error.clone();
    if mode.is_terminal() {
      self.lock.release_exclusive();
      if catch_unwind(AssertUnwindSafe(|| callback(mode, count, err))).is_err() {
        warn!("state watcher panicked on node `{}`", self.description);
      }
      return false;
    }
    let id = WATCHER_IDS.fetch_add(1, Ordering::Relaxed);
    let mut entry = WatcherEntry {
      id,
      callback: Box::new(callback),
      last: None,
    };
    self.invoke_watcher(&mut entry, mode, count, err);
    self.watchers_guard().push(entry);
    if let Some(name) = name {
      let this = self.arc();
      self.cancellations_guard().insert(
        name.to_string(),
        Cancellation::Thunk(Box::new(move || this.remove_watcher(id))),
      );
    }
    self.lock.release_exclusive();
    true
  }

  fn remove_watcher(&self, id: u64) {
    self.lock.acquire_exclusive();
    self.watchers_guard().retain(|entry| entry.id != id);
    self.lock.release_exclusive();
  }
}

impl<T: Clone + Send + Sync + 'static> Propagator<T> for Node<T> {
  fn description(&self) -> &str {
    Node::description(self)
  }

  fn propagate(&self, msg: T, transform: bool) -> Propagation<T> {
    Node::propagate(self, msg, transform)
  }

  fn downstream(&self) -> Vec<Edge<T>> {
    Node::downstream(self)
  }

  fn transactional(&self) -> bool {
    Node::transactional(self)
  }

  fn as_node(&self) -> Option<&Node<T>> {
    Some(self)
  }
}

impl<T> std::fmt::Debug for Node<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.state.load();
    f.debug_struct("Node")
      .field("description", &self.description)
      .field("mode", &state.mode)
      .field("downstream_count", &state.downstream_count)
      .finish()
  }
}
