//! # Connectors
//!
//! `connect`, `siphon`, and `join` compose [`Node::link`] with state-change
//! watchers so that lifecycle events cascade through a connection:
//!
//! - the **upstream** watcher lives on the downstream node: when it closes or
//!   drains, the source's registration toward it is cancelled (unlinking the
//!   edge, and closing the source once its last edge goes); when it errors, a
//!   `join` propagates the error upstream while a `siphon` merely cancels;
//! - the **downstream** watcher lives on the source (join only): draining
//!   closes the downstream node, erroring errors it;
//! - a **siphon cleanup** watcher on the source unregisters the upstream
//!   watcher once the source reaches a terminal mode.
//!
//! Watchers fire under the node's exclusive lock, so every cascade is
//! deferred through [`crate::cleanup::enqueue`] to avoid recursive locking.

use std::sync::Arc;

use tracing::trace;

use crate::cleanup;
use crate::edge::Edge;
use crate::node::{LinkCallback, Node};
use crate::state::Mode;

/// Links `src` to `dst` and wires the cascading watchers.
///
/// `upstream` cascades `dst`'s lifecycle back into `src`; `downstream`
/// cascades `src`'s terminal modes into `dst`. `pre` and `post` are passed
/// through to [`Node::link`].
pub fn connect<T: Clone + Send + Sync + 'static>(
  src: &Arc<Node<T>>,
  dst: &Arc<Node<T>>,
  upstream: bool,
  downstream: bool,
  pre: Option<LinkCallback>,
  post: Option<LinkCallback>,
) -> bool {
  let kind = if downstream { "join" } else { "siphon" };
  trace!("connect() `{}` -{}-> `{}`", src.description(), kind, dst.description());
  let link_name = format!("{}:{}", kind, dst.id());
  let registration = link_name.clone();
  let edge = Edge::new(kind, dst.clone());
  let src_post = src.clone();
  let dst_post = dst.clone();
  let wired_post: LinkCallback = Box::new(move |success| {
    if success {
      let up_name = format!("upstream:{}", src_post.id());
      if upstream {
        let watched_src = src_post.clone();
        let cancel_name = registration.clone();
        dst_post.on_state_changed(Some(&up_name), move |mode, _count, err| match mode {
          Mode::Closed | Mode::Drained => {
            let src = watched_src.clone();
            let name = cancel_name.clone();
            cleanup::enqueue(move || {
              let _ = src.cancel(&name);
            });
          }
          Mode::Error => {
            if downstream {
              if let Some(err) = err {
                let src = watched_src.clone();
                cleanup::enqueue(move || {
                  src.error(err, false);
                });
              }
            } else {
              let src = watched_src.clone();
              let name = cancel_name.clone();
              cleanup::enqueue(move || {
                let _ = src.cancel(&name);
              });
            }
          }
          _ => {}
        });
      }
      if downstream {
        let watched_dst = dst_post.clone();
        src_post.on_state_changed(None, move |mode, _count, err| match mode {
          Mode::Drained => {
            let dst = watched_dst.clone();
            cleanup::enqueue(move || {
              dst.close(false);
            });
          }
          Mode::Error => {
            if let Some(err) = err {
              let dst = watched_dst.clone();
              cleanup::enqueue(move || {
                dst.error(err, false);
              });
            }
          }
          _ => {}
        });
      } else if upstream {
        // Once the siphon source dies, the upstream watcher on dst would
        // otherwise dangle until dst's own terminal transition.
        let watched_dst = dst_post.clone();
        src_post.on_state_changed(None, move |mode, _count, _err| {
          if mode.is_terminal() {
            let dst = watched_dst.clone();
            let name = up_name.clone();
            cleanup::enqueue(move || {
              let _ = dst.cancel(&name);
            });
          }
        });
      }
    }
    if let Some(post) = post {
      post(success);
    }
  });
  src.link(&link_name, edge, pre, Some(wired_post))
}

/// Connects `src` to `dst` with upstream cascading only: closing or erroring
/// `dst` unwinds the link (and closes `src` once its last edge is gone), but
/// `src`'s lifecycle does not touch `dst`.
pub fn siphon<T: Clone + Send + Sync + 'static>(src: &Arc<Node<T>>, dst: &Arc<Node<T>>) -> bool {
  connect(src, dst, true, false, None, None)
}

/// Connects `src` to `dst` with cascading in both directions: drain and error
/// flow downstream, closure and error flow back upstream.
pub fn join<T: Clone + Send + Sync + 'static>(src: &Arc<Node<T>>, dst: &Arc<Node<T>>) -> bool {
  connect(src, dst, true, true, None, None)
}
