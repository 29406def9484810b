//! # Transaction Context
//!
//! A thread-local transactional scope with commit-time deferral.
//!
//! Mutating side effects that happen while a transaction is active (cascade
//! cancellations, receive-result callbacks) must not observe intermediate
//! state, so they are deferred and drained when the enclosing transaction
//! commits. [`crate::node::Node::cancel`] refuses to run at all inside a
//! transaction.

use std::cell::RefCell;

type Deferred = Box<dyn FnOnce()>;

thread_local! {
  static FRAMES: RefCell<Vec<Vec<Deferred>>> = const { RefCell::new(Vec::new()) };
}

/// True while the current thread is inside [`with_transaction`].
pub fn in_transaction() -> bool {
  FRAMES.with(|frames| !frames.borrow().is_empty())
}

/// Runs `action` now, or at commit of the innermost enclosing transaction.
pub fn defer(action: impl FnOnce() + 'static) {
  let deferred = FRAMES.with(|frames| {
    let mut frames = frames.borrow_mut();
    match frames.last_mut() {
      Some(frame) => {
        frame.push(Box::new(action));
        None
      }
      None => Some(action),
    }
  });
  if let Some(action) = deferred {
    action();
  }
}

/// Runs `body` inside a transaction frame.
///
/// Actions deferred by `body` run after it returns, in registration order.
/// If `body` panics, the frame's deferred actions are discarded.
pub fn with_transaction<R>(body: impl FnOnce() -> R) -> R {
  FRAMES.with(|frames| frames.borrow_mut().push(Vec::new()));
  let guard = FrameGuard;
  let result = body();
  drop(guard);
  result
}

struct FrameGuard;

impl Drop for FrameGuard {
  fn drop(&mut self) {
    let frame = FRAMES.with(|frames| frames.borrow_mut().pop());
    if std::thread::panicking() {
      return;
    }
    if let Some(frame) = frame {
      for action in frame {
        action();
      }
    }
  }
}
