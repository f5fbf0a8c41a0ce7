//! Composite cancellation handles
//!
//! Every subscribing operation takes a parent [`Subscription`] and returns a
//! child. Cancelling any handle cancels everything opened beneath it: the
//! recursive chain-follow links, per-contact name watchers and per-group
//! detail watchers.

use tokio_util::sync::CancellationToken;

/// Handle that tears down a tree of live subscriptions.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    /// A new root handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle cancelled together with `self`, but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this handle (or any ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
