//! Hierarchical cancellation tokens.
//!
//! A token cancels itself and every child derived from it; children never
//! cancel their parent. Runs, stages and units each hold one level of the tree.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

struct Inner {
    state: watch::Sender<bool>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new(cancelled: bool) -> Self {
        let (state, _) = watch::channel(cancelled);
        Self {
            state,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        if self.state.send_replace(true) {
            return;
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cloneable cancellation handle.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(false)),
        }
    }

    /// Derive a child token. A child of an already-cancelled token starts cancelled.
    pub fn child(&self) -> CancelToken {
        let mut children = self.inner.children.lock();
        let cancelled = *self.inner.state.borrow();
        let child = Arc::new(Inner::new(cancelled));
        if !cancelled {
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        CancelToken { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.state.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
