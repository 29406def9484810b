//! # Node Test Suite
//!
//! Covers the mode state machine, propagation across the zero/one/many edge
//! paths, the fused single-edge walk (with lock tracing), linking and
//! unlinking, consume/unconsume, split, close/error, receives, cancellation,
//! watchers, and the transactional upgrade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::edge::{Edge, FnPropagator};
use crate::error::{error_value, ErrorValue, NodeError};
use crate::lock::held;
use crate::node::{Delivery, Node, NodeBuilder, Propagation};
use crate::state::Mode;
use crate::transaction;

#[derive(Debug)]
struct Boom;

impl std::fmt::Display for Boom {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "boom")
  }
}

impl std::error::Error for Boom {}

fn sink_edge(description: &str, collected: &Arc<Mutex<Vec<i64>>>) -> Edge<i64> {
  let collected = collected.clone();
  Edge::new(
    description,
    Arc::new(FnPropagator::new(description, move |msg: i64| {
      collected.lock().unwrap().push(msg);
      Propagation::Delivered(Delivery::Queued)
    })),
  )
}

#[test]
fn test_builder_defaults() {
  let node: Arc<Node<i64>> = NodeBuilder::new().with_description("n").build();
  assert_eq!(node.description(), "n");
  let state = node.state();
  assert_eq!(state.mode(), Mode::Open);
  assert_eq!(state.downstream_count(), 0);
  assert!(state.queue().is_none());
  assert!(!node.is_closed());
  assert!(!node.is_grounded());
}

#[test]
fn test_propagate_with_no_edges_buffers() {
  let node: Arc<Node<i64>> = Node::new("n");
  let outcome = node.propagate(5, true);
  assert!(outcome.is_delivered());
  assert_eq!(node.queue_len(), 1);
  assert_eq!(node.read().wait_value(), Some(5));
}

#[test]
fn test_propagate_dispatch_tags_metadata() {
  let node: Arc<Node<i64>> = Node::new("metered");
  let pending = node.receive(None, |_| {}).expect("receive");
  assert!(pending.is_pending());
  let outcome = node.propagate(5, true);
  let result = outcome.received().expect("dispatched into the pending receive");
  assert!(result.is_same(&pending));
  let metadata = result.metadata().expect("tagged");
  assert_eq!(metadata.kind, "queue");
  assert_eq!(metadata.name, "metered");
}

#[test]
fn test_grounded_node_discards() {
  let node: Arc<Node<i64>> = NodeBuilder::new().grounded().build();
  let outcome = node.propagate(5, true);
  assert!(outcome.is_grounded());
  assert_eq!(node.queue_len(), 0);
}

#[test]
fn test_operator_transforms() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = NodeBuilder::new()
    .with_operator(|x: i64| Ok(Some(x * 2)))
    .build();
  assert!(node.link("sink", sink_edge("sink", &collected), None, None));
  assert!(node.propagate(21, true).is_delivered());
  assert_eq!(collected.lock().unwrap().as_slice(), &[42]);
}

#[test]
fn test_operator_filter_sentinel() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = NodeBuilder::new()
    .with_operator(|x: i64| if x % 2 == 0 { Ok(Some(x)) } else { Ok(None) })
    .build();
  assert!(node.link("sink", sink_edge("sink", &collected), None, None));
  let outcomes: Vec<_> = [1, 2, 3, 4]
    .into_iter()
    .map(|msg| node.propagate(msg, true))
    .collect();
  assert!(outcomes[0].is_filtered());
  assert!(outcomes[1].is_delivered());
  assert!(outcomes[2].is_filtered());
  assert!(outcomes[3].is_delivered());
  assert_eq!(collected.lock().unwrap().as_slice(), &[2, 4]);
}

#[test]
fn test_operator_failure_errors_the_node() {
  let node: Arc<Node<i64>> = NodeBuilder::new()
    .with_operator(|_: i64| Err(error_value(Boom)))
    .build();
  let outcome = node.propagate(1, true);
  assert!(outcome.is_error());
  assert_eq!(node.state().mode(), Mode::Error);
  assert_eq!(node.error_value().expect("error").to_string(), "boom");

  // Terminal stickiness: propagation keeps failing, linking is refused.
  assert!(node.propagate(2, true).is_error());
  let collected = Arc::new(Mutex::new(Vec::new()));
  assert!(!node.link("late", sink_edge("late", &collected), None, None));
}

#[test]
fn test_link_rejects_duplicate_names() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = Node::new("n");
  assert!(node.link("a", sink_edge("first", &collected), None, None));
  assert!(!node.link("a", sink_edge("second", &collected), None, None));
  assert_eq!(node.state().downstream_count(), 1);
  assert_eq!(node.downstream().len(), 1);
}

#[test]
fn test_link_invokes_pre_and_post() {
  let calls = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = Node::new("n");
  let collected = Arc::new(Mutex::new(Vec::new()));
  let pre_calls = calls.clone();
  let post_calls = calls.clone();
  node.link(
    "a",
    sink_edge("sink", &collected),
    Some(Box::new(move |ok| pre_calls.lock().unwrap().push(("pre", ok)))),
    Some(Box::new(move |ok| post_calls.lock().unwrap().push(("post", ok)))),
  );
  assert_eq!(
    calls.lock().unwrap().as_slice(),
    &[("pre", true), ("post", true)]
  );
}

#[test]
fn test_link_drains_buffered_messages_into_first_edge() {
  let node: Arc<Node<i64>> = NodeBuilder::new().with_messages(vec![1, 2]).build();
  // Demand a read so the queue is observed before the link.
  assert_eq!(node.queue_len(), 2);
  let collected = Arc::new(Mutex::new(Vec::new()));
  assert!(node.link("sink", sink_edge("sink", &collected), None, None));
  assert_eq!(collected.lock().unwrap().as_slice(), &[1, 2]);
  assert_eq!(node.queue_len(), 0);
}

#[test]
fn test_unlink_returns_state() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = Node::new("n");
  let keep = sink_edge("keep", &collected);
  let gone = sink_edge("gone", &collected);
  assert!(node.link("keep", keep.clone(), None, None));
  assert!(node.link("gone", gone.clone(), None, None));
  assert_eq!(node.state().downstream_count(), 2);

  assert!(node.unlink(&gone));
  assert_eq!(node.state().downstream_count(), 1);
  assert_eq!(node.state().mode(), Mode::Open);

  // Unlinking an edge that is not a member is a no-op.
  assert!(!node.unlink(&gone));
  assert_eq!(node.state().downstream_count(), 1);
}

#[test]
fn test_unlink_last_edge_closes_node() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = Node::new("n");
  let edge = sink_edge("sink", &collected);
  assert!(node.link("sink", edge.clone(), None, None));
  assert!(node.unlink(&edge));
  assert!(node.state().mode().is_terminal());
}

#[test]
fn test_unlink_last_edge_on_permanent_node_stays_open() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = NodeBuilder::new().permanent().build();
  let edge = sink_edge("sink", &collected);
  assert!(node.link("sink", edge.clone(), None, None));
  assert!(node.unlink(&edge));
  let state = node.state();
  assert_eq!(state.mode(), Mode::Open);
  assert!(state.queue().is_some());
}

#[test]
fn test_cancel_reverses_link() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = NodeBuilder::new().permanent().build();
  assert!(node.link("reg", sink_edge("sink", &collected), None, None));
  assert_eq!(node.state().downstream_count(), 1);
  assert_eq!(node.cancel("reg").expect("outside transaction"), true);
  assert_eq!(node.state().downstream_count(), 0);
  assert_eq!(node.cancel("reg").expect("outside transaction"), false);
}

#[test]
fn test_cancel_inside_transaction_is_rejected() {
  let node: Arc<Node<i64>> = Node::new("n");
  transaction::with_transaction(|| {
    let err = node.cancel("anything").expect_err("guarded");
    assert!(matches!(err, NodeError::CancelInsideTransaction(_)));
  });
}

#[test]
fn test_solo_enqueue_then_consume() {
  let node: Arc<Node<i64>> = NodeBuilder::new()
    .with_operator(|x: i64| Ok(Some(x)))
    .with_messages(vec![1, 2, 3])
    .build();
  assert_eq!(node.state().mode(), Mode::Open);

  let collected = Arc::new(Mutex::new(Vec::new()));
  let cancel = node.consume(sink_edge("consumer", &collected)).expect("consumable");
  assert_eq!(node.state().mode(), Mode::Consumed);
  assert_eq!(node.state().downstream_count(), 1);

  assert_eq!(node.read().wait_value(), Some(1));
  assert_eq!(node.read().wait_value(), Some(2));
  assert_eq!(node.read().wait_value(), Some(3));

  assert!(cancel());
  assert_eq!(node.state().mode(), Mode::Open);
  assert_eq!(node.state().downstream_count(), 0);
}

#[test]
fn test_consume_rejected_with_downstream_edges() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = Node::new("n");
  assert!(node.link("sink", sink_edge("sink", &collected), None, None));
  assert!(node.consume(sink_edge("consumer", &collected)).is_none());
}

#[test]
fn test_consume_on_terminal_node_is_idempotent() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = Node::new("n");
  assert!(node.close(false));
  assert!(node.is_drained());
  let cancel = node.consume(sink_edge("consumer", &collected)).expect("idempotent");
  assert!(!cancel());
}

#[test]
fn test_consumed_propagation_flows_into_queue() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = Node::new("n");
  let _cancel = node.consume(sink_edge("consumer", &collected)).expect("consumable");
  assert!(node.propagate(7, true).is_delivered());
  assert_eq!(node.queue_len(), 1);
  assert_eq!(node.read().wait_value(), Some(7));
}

#[test]
fn test_close_then_drain_transition() {
  let node: Arc<Node<i64>> = NodeBuilder::new().with_messages(vec![1, 2, 3]).build();
  let collected = Arc::new(Mutex::new(Vec::new()));
  let _cancel = node.consume(sink_edge("consumer", &collected)).expect("consumable");

  assert!(node.close(false));
  assert_eq!(node.state().mode(), Mode::Closed);
  assert!(node.propagate(4, true).is_closed());

  assert_eq!(node.read().wait_value(), Some(1));
  assert_eq!(node.read().wait_value(), Some(2));
  assert_eq!(node.read().wait_value(), Some(3));
  assert_eq!(node.state().mode(), Mode::Drained);

  // Double close: true then false.
  assert!(!node.close(false));
}

#[test]
fn test_close_permanent_requires_force() {
  let node: Arc<Node<i64>> = NodeBuilder::new().permanent().build();
  assert!(!node.close(false));
  assert_eq!(node.state().mode(), Mode::Open);
  assert!(node.close(true));
  assert!(node.state().mode().is_terminal());
}

#[test]
fn test_error_replaces_queue_and_clears_everything() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = NodeBuilder::new().with_messages(vec![1]).build();
  assert!(node.link("sink", sink_edge("sink", &collected), None, None));
  assert!(node.error(error_value(Boom), false));

  let state = node.state();
  assert_eq!(state.mode(), Mode::Error);
  assert_eq!(state.downstream_count(), 0);
  assert!(node.downstream().is_empty());
  assert_eq!(node.queue_len(), 0);
  assert!(node.propagate(2, true).is_error());
  assert!(!node.error(error_value(Boom), false));
}

#[test]
fn test_fanout_collects_non_sneaky_results() {
  let node: Arc<Node<i64>> = Node::new("fan");
  let left = Arc::new(Mutex::new(Vec::new()));
  let right = Arc::new(Mutex::new(Vec::new()));
  let audit = Arc::new(Mutex::new(Vec::new()));
  assert!(node.link("left", sink_edge("left", &left), None, None));
  assert!(node.link("right", sink_edge("right", &right), None, None));
  assert!(node.link("audit", sink_edge("audit", &audit).sneaky(), None, None));
  assert_eq!(node.state().downstream_count(), 2);

  let outcome = node.propagate(8, true);
  let results = outcome.fanout().expect("fanout");
  assert_eq!(results.len(), 2);
  assert!(results.iter().all(Propagation::is_delivered));
  assert_eq!(left.lock().unwrap().as_slice(), &[8]);
  assert_eq!(right.lock().unwrap().as_slice(), &[8]);
  // Sneaky edges see the traffic; their outcomes are just not reported.
  assert_eq!(audit.lock().unwrap().as_slice(), &[8]);
}

#[test]
fn test_fanout_downstream_error_transitions_source() {
  let node: Arc<Node<i64>> = Node::new("fan");
  let collected = Arc::new(Mutex::new(Vec::new()));
  let failing: Arc<Node<i64>> = NodeBuilder::new()
    .with_operator(|_: i64| Err(error_value(Boom)))
    .build();
  assert!(node.link("ok", sink_edge("ok", &collected), None, None));
  assert!(node.link("bad", Edge::new("bad", failing.clone()), None, None));

  let outcome = node.propagate(1, true);
  assert!(outcome.is_error());
  assert_eq!(node.state().mode(), Mode::Error);
  assert_eq!(failing.state().mode(), Mode::Error);
}

#[test]
fn test_fused_chain_delivers_and_holds_one_lock() {
  let a: Arc<Node<i64>> = NodeBuilder::new()
    .with_description("a")
    .with_operator(|x: i64| Ok(Some(x)))
    .build();
  let b: Arc<Node<i64>> = NodeBuilder::new()
    .with_description("b")
    .with_operator(|x: i64| Ok(Some(x)))
    .build();
  let c: Arc<Node<i64>> = NodeBuilder::new()
    .with_description("c")
    .with_operator(|x: i64| Ok(Some(x)))
    .build();
  assert!(a.link("b", Edge::new("b", b.clone()), None, None));
  assert!(b.link("c", Edge::new("c", c.clone()), None, None));

  held::reset();
  let outcome = a.propagate(42, true);
  assert!(outcome.is_delivered());
  assert_eq!(held::current(), 0);
  assert!(held::max_held() <= 1, "fused walk overlapped node locks");

  assert_eq!(c.read().wait_value(), Some(42));
}

#[test]
fn test_fused_chain_applies_each_operator() {
  let a: Arc<Node<i64>> = NodeBuilder::new().with_operator(|x: i64| Ok(Some(x + 1))).build();
  let b: Arc<Node<i64>> = NodeBuilder::new().with_operator(|x: i64| Ok(Some(x * 10))).build();
  let c: Arc<Node<i64>> = Node::new("c");
  assert!(a.link("b", Edge::new("b", b.clone()), None, None));
  assert!(b.link("c", Edge::new("c", c.clone()), None, None));
  assert!(a.propagate(4, true).is_delivered());
  assert_eq!(c.read().wait_value(), Some(50));
}

#[test]
fn test_fused_chain_stops_at_closed_hop() {
  let a: Arc<Node<i64>> = Node::new("a");
  let b: Arc<Node<i64>> = Node::new("b");
  assert!(a.link("b", Edge::new("b", b.clone()), None, None));
  assert!(b.close(false));
  assert!(a.propagate(1, true).is_closed());
}

#[test]
fn test_single_edge_skips_sneaky_only_delivery() {
  let node: Arc<Node<i64>> = Node::new("n");
  let main = Arc::new(Mutex::new(Vec::new()));
  let audit = Arc::new(Mutex::new(Vec::new()));
  assert!(node.link("main", sink_edge("main", &main), None, None));
  assert!(node.link("audit", sink_edge("audit", &audit).sneaky(), None, None));
  assert_eq!(node.state().downstream_count(), 1);

  assert!(node.propagate(3, true).is_delivered());
  assert_eq!(main.lock().unwrap().as_slice(), &[3]);
  assert!(audit.lock().unwrap().is_empty());
}

#[test]
fn test_named_receive_is_idempotent() {
  let node: Arc<Node<i64>> = Node::new("n");
  let first = node.receive(Some("r"), |_| {}).expect("registered");
  let second = node.receive(Some("r"), |_| {}).expect("idempotent");
  assert!(first.is_same(&second));
}

#[test]
fn test_receive_name_bound_to_link_fails() {
  let collected = Arc::new(Mutex::new(Vec::new()));
  let node: Arc<Node<i64>> = NodeBuilder::new().permanent().build();
  assert!(node.link("reg", sink_edge("sink", &collected), None, None));
  let err = node.receive(Some("reg"), |_| {}).expect_err("conflict");
  assert!(matches!(err, NodeError::InvalidCallbackName { .. }));
}

#[test]
fn test_cancelled_receive_never_fires() {
  let node: Arc<Node<i64>> = Node::new("n");
  let invoked = Arc::new(AtomicUsize::new(0));
  let count = invoked.clone();
  let result = node
    .receive(Some("r"), move |_| {
      count.fetch_add(1, Ordering::SeqCst);
    })
    .expect("registered");
  assert!(result.is_pending());
  assert_eq!(node.cancel("r").expect("outside transaction"), true);

  assert!(node.propagate(1, true).is_delivered());
  assert_eq!(invoked.load(Ordering::SeqCst), 0);
  // The message survived for the next consumer.
  assert_eq!(node.queue_len(), 1);
}

#[test]
fn test_receive_completion_unregisters_name() {
  let node: Arc<Node<i64>> = Node::new("n");
  let result = node.receive(Some("r"), |_| {}).expect("registered");
  assert!(node.propagate(1, true).is_delivered());
  assert_eq!(result.success_value(), Some(1));
  // The name is free again once the receive realized.
  assert_eq!(node.cancel("r").expect("outside transaction"), false);
  let fresh = node.receive(Some("r"), |_| {}).expect("re-registered");
  assert!(!fresh.is_same(&result));
}

#[test]
fn test_receive_when_predicate() {
  let node: Arc<Node<i64>> = NodeBuilder::new().with_messages(vec![5]).build();
  let miss = node.receive_when(|msg| *msg % 2 == 0, -1);
  assert_eq!(miss.wait_value(), Some(-1));
  assert_eq!(node.queue_len(), 1);
  let hit = node.receive_when(|msg| *msg % 2 == 1, -1);
  assert_eq!(hit.wait_value(), Some(5));
}

#[test]
fn test_drain_returns_buffered_messages() {
  let node: Arc<Node<i64>> = NodeBuilder::new().with_messages(vec![1, 2, 3]).build();
  assert_eq!(node.drain(), vec![1, 2, 3]);
  assert!(node.drain().is_empty());
}

#[test]
fn test_watcher_sees_transitions_in_order() {
  let node: Arc<Node<i64>> = Node::new("n");
  let seen: Arc<Mutex<Vec<(Mode, usize)>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = seen.clone();
  assert!(node.on_state_changed(None, move |mode, count, _err| {
    sink.lock().unwrap().push((mode, count));
  }));

  let collected = Arc::new(Mutex::new(Vec::new()));
  let edge = sink_edge("sink", &collected);
  assert!(node.link("sink", edge.clone(), None, None));
  assert!(node.unlink(&edge));

  let observed = seen.lock().unwrap().clone();
  assert_eq!(
    observed,
    vec![(Mode::Open, 0), (Mode::Open, 1), (Mode::Drained, 0)]
  );
  // No adjacent duplicates by construction.
  for pair in observed.windows(2) {
    assert_ne!(pair[0], pair[1]);
  }
}

#[test]
fn test_watcher_on_terminal_node_fires_once_without_registering() {
  let node: Arc<Node<i64>> = Node::new("n");
  assert!(node.close(false));
  let seen = Arc::new(AtomicUsize::new(0));
  let sink = seen.clone();
  let registered = node.on_state_changed(None, move |mode, _count, _err| {
    assert_eq!(mode, Mode::Drained);
    sink.fetch_add(1, Ordering::SeqCst);
  });
  assert!(!registered);
  assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_watcher_panic_is_swallowed() {
  let node: Arc<Node<i64>> = Node::new("n");
  assert!(node.on_state_changed(None, |_mode, count, _err| {
    if count > 0 {
      panic!("watcher bug");
    }
  }));
  let collected = Arc::new(Mutex::new(Vec::new()));
  // The panicking watcher must not poison the node.
  assert!(node.link("sink", sink_edge("sink", &collected), None, None));
  assert_eq!(node.state().downstream_count(), 1);
}

#[test]
fn test_watcher_cancellation() {
  let node: Arc<Node<i64>> = Node::new("n");
  let seen = Arc::new(AtomicUsize::new(0));
  let sink = seen.clone();
  assert!(node.on_state_changed(Some("w"), move |_mode, _count, _err| {
    sink.fetch_add(1, Ordering::SeqCst);
  }));
  assert_eq!(seen.load(Ordering::SeqCst), 1);
  assert_eq!(node.cancel("w").expect("outside transaction"), true);

  let collected = Arc::new(Mutex::new(Vec::new()));
  assert!(node.link("sink", sink_edge("sink", &collected), None, None));
  assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_split_forwards_queue_operations() {
  let node: Arc<Node<i64>> = NodeBuilder::new().with_messages(vec![1, 2]).build();
  let clone = node.split();
  assert_eq!(node.state().mode(), Mode::Split);
  assert!(node.state().queue().is_none());
  assert_eq!(clone.state().mode(), Mode::Open);

  // Queue operations land on the clone.
  assert_eq!(node.queue_len(), 2);
  assert_eq!(node.read().wait_value(), Some(1));
  assert_eq!(clone.read().wait_value(), Some(2));

  // New messages flow through the synthetic edge into the clone.
  assert!(node.propagate(3, true).is_delivered());
  assert_eq!(node.read().wait_value(), Some(3));
}

#[test]
fn test_split_is_idempotent() {
  let node: Arc<Node<i64>> = Node::new("n");
  let first = node.split();
  let second = node.split();
  assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_split_does_not_reapply_operator() {
  let node: Arc<Node<i64>> = NodeBuilder::new()
    .with_operator(|x: i64| Ok(Some(x * 2)))
    .build();
  let _clone = node.split();
  assert!(node.propagate(4, true).is_delivered());
  assert_eq!(node.read().wait_value(), Some(8));
}

#[test]
fn test_transactional_upgrade_cascades_downstream() {
  let a: Arc<Node<i64>> = Node::new("a");
  let b: Arc<Node<i64>> = Node::new("b");
  let c: Arc<Node<i64>> = Node::new("c");
  assert!(a.link("b", Edge::new("b", b.clone()), None, None));
  assert!(b.link("c", Edge::new("c", c.clone()), None, None));

  assert!(a.transactional());
  assert!(a.state().is_transactional());
  assert!(b.state().is_transactional());
  assert!(c.state().is_transactional());

  // Idempotent on an already-transactional node.
  assert!(a.transactional());
}

#[test]
fn test_transactional_link_upgrades_new_target() {
  let a: Arc<Node<i64>> = NodeBuilder::new().transactional().build();
  let b: Arc<Node<i64>> = Node::new("b");
  assert!(a.link("b", Edge::new("b", b.clone()), None, None));
  assert!(b.state().is_transactional());
}

#[test]
fn test_queue_capability() {
  let node: Arc<Node<i64>> = NodeBuilder::new().with_messages(vec![1, 2, 3]).build();
  assert_eq!(node.queue_len(), 3);
  let queue = node.queue().expect("materialized");
  assert_eq!(queue.len(), 3);
}

#[test]
fn test_lock_capability_delegates() {
  let node: Arc<Node<i64>> = Node::new("n");
  node.acquire();
  assert!(!node.try_acquire_exclusive());
  node.release();
  node.acquire_exclusive();
  assert!(!node.try_acquire());
  node.release_exclusive();
}

#[test]
fn test_error_value_helper() {
  let err: ErrorValue = error_value(Boom);
  assert_eq!(err.to_string(), "boom");
}
