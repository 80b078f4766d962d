//! Change notification fan-out.
//!
//! The actor hands every visible change to the [`SubscriptionManager`], which
//! queues one job per subscriber on that subscriber's [`CallbackQueue`].

mod manager;
mod queue;

pub use manager::{SubscriptionManager, SyncCallback, UpdateCallback};
pub use queue::CallbackQueue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    manager: Weak<SubscriptionManager>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(id: String, manager: &Arc<SubscriptionManager>) -> Self {
        Self {
            id,
            manager: Arc::downgrade(manager),
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop receiving notifications. Safe to call more than once, and after
    /// the object has been removed.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(&self.id);
        }
    }

    /// Keep the subscription alive for as long as the runtime exists.
    pub fn detach(self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}
