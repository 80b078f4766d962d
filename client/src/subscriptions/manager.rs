//! Subscription registry.
//!
//! Tracks live subscriptions and fans change notifications out to their
//! callback queues.

use std::sync::Arc;

use converge_engine::{ObjectId, ObjectUpdate, SyncState};
use dashmap::DashMap;

use super::CallbackQueue;

/// Callback for changes to one object.
pub type UpdateCallback = Arc<dyn Fn(ObjectUpdate) + Send + Sync>;

/// Callback for sync state transitions.
pub type SyncCallback = Arc<dyn Fn(SyncState) + Send + Sync>;

/// What a subscription listens to.
#[derive(Clone)]
enum Listener {
    Object {
        object_id: ObjectId,
        callback: UpdateCallback,
    },
    Sync(SyncCallback),
}

struct Registration {
    listener: Listener,
    queue: CallbackQueue,
}

/// Manages active subscriptions.
///
/// Thread-safe and can be shared between the actor and handles via `Arc`.
#[derive(Default)]
pub struct SubscriptionManager {
    /// All active subscriptions, keyed by subscription ID.
    subscriptions: DashMap<String, Registration>,
    /// Index of object subscriptions by object id.
    by_object: DashMap<ObjectId, Vec<String>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            by_object: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a callback for changes to `object_id`.
    ///
    /// Returns the subscription ID.
    pub fn subscribe(
        &self,
        object_id: impl Into<ObjectId>,
        callback: UpdateCallback,
        queue: CallbackQueue,
    ) -> String {
        let sub_id = uuid::Uuid::new_v4().to_string();
        let object_id = object_id.into();

        self.by_object
            .entry(object_id.clone())
            .or_default()
            .push(sub_id.clone());
        self.subscriptions.insert(
            sub_id.clone(),
            Registration {
                listener: Listener::Object {
                    object_id: object_id.clone(),
                    callback,
                },
                queue,
            },
        );

        tracing::debug!(sub_id = %sub_id, object_id = %object_id, "Subscription registered");
        sub_id
    }

    /// Register a callback for sync state transitions.
    pub fn subscribe_sync(&self, callback: SyncCallback, queue: CallbackQueue) -> String {
        let sub_id = uuid::Uuid::new_v4().to_string();
        self.subscriptions.insert(
            sub_id.clone(),
            Registration {
                listener: Listener::Sync(callback),
                queue,
            },
        );
        tracing::debug!(sub_id = %sub_id, "Sync event subscription registered");
        sub_id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, sub_id: &str) -> bool {
        let Some((_, registration)) = self.subscriptions.remove(sub_id) else {
            return false;
        };

        if let Listener::Object { object_id, .. } = &registration.listener {
            if let Some(mut sub_ids) = self.by_object.get_mut(object_id) {
                sub_ids.retain(|id| id != sub_id);
                if sub_ids.is_empty() {
                    drop(sub_ids);
                    self.by_object.remove(object_id);
                }
            }
        }

        tracing::debug!(sub_id = %sub_id, "Subscription removed");
        true
    }

    /// Queue `update` for every subscriber of `object_id`.
    ///
    /// Returns the number of callbacks dispatched.
    pub fn notify(&self, object_id: &str, update: &ObjectUpdate) -> usize {
        let sub_ids = match self.by_object.get(object_id) {
            Some(ids) => ids.clone(),
            None => return 0,
        };

        let mut dispatched = 0;
        for sub_id in sub_ids {
            let Some(registration) = self.subscriptions.get(&sub_id) else {
                continue;
            };
            if let Listener::Object { callback, .. } = &registration.listener {
                let callback = callback.clone();
                let update = update.clone();
                if registration.queue.dispatch(move || callback(update)) {
                    dispatched += 1;
                }
            }
        }

        tracing::trace!(object_id = %object_id, dispatched, "Dispatched object update");
        dispatched
    }

    /// Queue a sync state transition for every sync subscriber.
    pub fn notify_sync(&self, state: SyncState) -> usize {
        let mut dispatched = 0;
        for entry in self.subscriptions.iter() {
            let registration = entry.value();
            if let Listener::Sync(callback) = &registration.listener {
                let callback = callback.clone();
                if registration.queue.dispatch(move || callback(state)) {
                    dispatched += 1;
                }
            }
        }
        dispatched
    }

    /// Drop every subscription to an object that left the pool.
    ///
    /// Returns the number of subscriptions removed.
    pub fn remove_object(&self, object_id: &str) -> usize {
        let Some((_, sub_ids)) = self.by_object.remove(object_id) else {
            return 0;
        };
        for sub_id in &sub_ids {
            self.subscriptions.remove(sub_id);
        }

        tracing::debug!(object_id = %object_id, count = sub_ids.len(), "Dropped subscriptions of removed object");
        sub_ids.len()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of subscriptions to one object.
    pub fn object_subscription_count(&self, object_id: &str) -> usize {
        self.by_object
            .get(object_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}
