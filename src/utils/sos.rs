//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! Every background loop (relay connections, signaling reconnect, queued-send
//! retry tick, per-peer link event pumps) holds one of these and exits once
//! it is cancelled. Child signals let a single peer or session be stopped
//! without touching the rest of the process, while cancelling a parent stops
//! all of its children.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<SharedState>>>,
}

impl SharedState {
    fn cancel(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();

        let children = match self.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a signal that is cancelled together with `self`.
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut guard = match self.internal.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.cancelled() {
            child.internal.closing.store(true, Ordering::Release);
        } else {
            guard.retain(|w| w.strong_count() > 0);
            guard.push(Arc::downgrade(&child.internal));
        }
        child
    }

    /// Signal cancellation to all waiters and children.
    pub fn cancel(&self) {
        self.internal.cancel();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not lost.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first,
    /// `None` if cancellation is signaled first.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.wait() => None,
            res = fut => Some(res),
        }
    }
}
