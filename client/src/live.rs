//! User-facing handles to replicated objects.
//!
//! Handles are lightweight: an object id plus the shared runtime. Reads take
//! the coordinator's read lock and return the current, possibly optimistic,
//! state; they never fail. Writes go through the actor and resolve once the
//! server has echoed them back.

use std::fmt;
use std::sync::Arc;

use converge_engine::{ObjectId, ObjectKind, ObjectUpdate, ObjectValue};

use crate::actor::WriteRequest;
use crate::error::Result;
use crate::objects::Inner;
use crate::subscriptions::{CallbackQueue, Subscription};

/// A value read from or written to a [`LiveMap`].
#[derive(Debug, Clone, PartialEq)]
pub enum LiveMapValue {
    /// A primitive value
    Value(ObjectValue),
    Map(LiveMap),
    Counter(LiveCounter),
}

impl LiveMapValue {
    fn from_object_value(inner: &Arc<Inner>, value: ObjectValue) -> Self {
        let ObjectValue::Reference(object_id) = value else {
            return LiveMapValue::Value(value);
        };
        match ObjectKind::from_object_id(&object_id) {
            Ok(ObjectKind::Map) => LiveMapValue::Map(LiveMap::new(inner.clone(), object_id)),
            Ok(ObjectKind::Counter) => {
                LiveMapValue::Counter(LiveCounter::new(inner.clone(), object_id))
            }
            Err(_) => LiveMapValue::Value(ObjectValue::Reference(object_id)),
        }
    }

    pub(crate) fn into_object_value(self) -> ObjectValue {
        match self {
            LiveMapValue::Value(value) => value,
            LiveMapValue::Map(map) => ObjectValue::Reference(map.object_id),
            LiveMapValue::Counter(counter) => ObjectValue::Reference(counter.object_id),
        }
    }

    pub fn as_value(&self) -> Option<&ObjectValue> {
        match self {
            LiveMapValue::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&LiveMap> {
        match self {
            LiveMapValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<&LiveCounter> {
        match self {
            LiveMapValue::Counter(counter) => Some(counter),
            _ => None,
        }
    }
}

impl From<ObjectValue> for LiveMapValue {
    fn from(value: ObjectValue) -> Self {
        LiveMapValue::Value(value)
    }
}

impl From<LiveMap> for LiveMapValue {
    fn from(map: LiveMap) -> Self {
        LiveMapValue::Map(map)
    }
}

impl From<LiveCounter> for LiveMapValue {
    fn from(counter: LiveCounter) -> Self {
        LiveMapValue::Counter(counter)
    }
}

macro_rules! primitive_into_live_value {
    ($($t:ty),*) => {
        $(
            impl From<$t> for LiveMapValue {
                fn from(value: $t) -> Self {
                    LiveMapValue::Value(ObjectValue::from(value))
                }
            }
        )*
    };
}

primitive_into_live_value!(&str, String, f64, bool, Vec<u8>, serde_json::Value);

// ============================================================================
// LiveMap
// ============================================================================

/// A replicated map.
#[derive(Clone)]
pub struct LiveMap {
    inner: Arc<Inner>,
    object_id: ObjectId,
}

impl LiveMap {
    pub(crate) fn new(inner: Arc<Inner>, object_id: ObjectId) -> Self {
        Self { inner, object_id }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// The value under `key`, or `None` if absent, removed, or a reference to
    /// an object that no longer exists.
    pub fn get(&self, key: &str) -> Option<LiveMapValue> {
        let value = self
            .inner
            .read(|c| c.pool().map_get(&self.object_id, key))
            .ok()
            .flatten()?;
        Some(LiveMapValue::from_object_value(&self.inner, value))
    }

    /// A snapshot of the live entries, ordered by key.
    pub fn entries(&self) -> Vec<(String, LiveMapValue)> {
        self.inner
            .read(|c| c.pool().map_entries(&self.object_id))
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, LiveMapValue::from_object_value(&self.inner, value)))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|(key, _)| key).collect()
    }

    pub fn values(&self) -> Vec<LiveMapValue> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    /// Number of live entries.
    pub fn size(&self) -> usize {
        self.inner
            .read(|c| c.pool().map_entries(&self.object_id).map(|e| e.len()))
            .unwrap_or(0)
    }

    pub async fn set(&self, key: &str, value: impl Into<LiveMapValue>) -> Result<()> {
        self.inner
            .write(
                "set map key",
                WriteRequest::MapSet {
                    object_id: self.object_id.clone(),
                    key: key.to_string(),
                    value: value.into().into_object_value(),
                },
            )
            .await
            .map(|_| ())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.inner
            .write(
                "remove map key",
                WriteRequest::MapRemove {
                    object_id: self.object_id.clone(),
                    key: key.to_string(),
                },
            )
            .await
            .map(|_| ())
    }

    /// Receive this map's updates on the runtime's default callback queue.
    pub fn subscribe(&self, callback: impl Fn(ObjectUpdate) + Send + Sync + 'static) -> Subscription {
        self.inner
            .subscribe(&self.object_id, &self.inner.callbacks, callback)
    }

    /// Receive this map's updates on `queue`.
    pub fn subscribe_on(
        &self,
        queue: &CallbackQueue,
        callback: impl Fn(ObjectUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.subscribe(&self.object_id, queue, callback)
    }
}

impl PartialEq for LiveMap {
    fn eq(&self, other: &Self) -> bool {
        self.object_id == other.object_id && Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LiveMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LiveMap").field(&self.object_id).finish()
    }
}

// ============================================================================
// LiveCounter
// ============================================================================

/// A replicated counter.
#[derive(Clone)]
pub struct LiveCounter {
    inner: Arc<Inner>,
    object_id: ObjectId,
}

impl LiveCounter {
    pub(crate) fn new(inner: Arc<Inner>, object_id: ObjectId) -> Self {
        Self { inner, object_id }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Current value; 0 once the counter is deleted.
    pub fn value(&self) -> f64 {
        self.inner
            .read(|c| c.pool().counter_value(&self.object_id))
            .unwrap_or(0.0)
    }

    pub async fn increment(&self, amount: f64) -> Result<()> {
        self.inner
            .write(
                "increment counter",
                WriteRequest::CounterInc {
                    object_id: self.object_id.clone(),
                    amount,
                },
            )
            .await
            .map(|_| ())
    }

    pub async fn decrement(&self, amount: f64) -> Result<()> {
        self.increment(-amount).await
    }

    pub fn subscribe(&self, callback: impl Fn(ObjectUpdate) + Send + Sync + 'static) -> Subscription {
        self.inner
            .subscribe(&self.object_id, &self.inner.callbacks, callback)
    }

    pub fn subscribe_on(
        &self,
        queue: &CallbackQueue,
        callback: impl Fn(ObjectUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.subscribe(&self.object_id, queue, callback)
    }
}

impl PartialEq for LiveCounter {
    fn eq(&self, other: &Self) -> bool {
        self.object_id == other.object_id && Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LiveCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LiveCounter").field(&self.object_id).finish()
    }
}
