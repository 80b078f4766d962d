//! Entry point of the objects runtime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use converge_engine::{
    ObjectId, ObjectKind, ObjectMessage, ObjectValue, SimpleClock, SyncCoordinator, SyncState,
    ROOT_OBJECT_ID,
};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};

use crate::actor::{Actor, Command, SharedCoordinator, WriteRequest};
use crate::channel::{AttachmentState, CoreChannel};
use crate::clock::{ServerClock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::live::{LiveCounter, LiveMap, LiveMapValue};
use crate::subscriptions::{CallbackQueue, Subscription, SubscriptionManager};

/// State shared by [`RealtimeObjects`] and every live handle.
pub(crate) struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    coordinator: SharedCoordinator,
    sync_state: watch::Receiver<SyncState>,
    channel: Arc<dyn CoreChannel>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    pub(crate) callbacks: CallbackQueue,
    server_clock: ServerClock,
}

impl Inner {
    fn ensure_attached(&self, operation: &'static str) -> Result<()> {
        match self.channel.state() {
            AttachmentState::Attached => Ok(()),
            state => Err(Error::NotAttached { operation, state }),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }

    /// Schedule a local write on the actor and wait for its confirmation.
    pub(crate) async fn write(
        &self,
        operation: &'static str,
        request: WriteRequest,
    ) -> Result<ObjectId> {
        self.ensure_attached(operation)?;
        let (reply, confirmed) = oneshot::channel();
        self.send(Command::Write { request, reply })?;
        confirmed.await.map_err(|_| Error::Closed)?
    }

    /// Run a read against the current pool.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&SyncCoordinator) -> T) -> T {
        f(&self.coordinator.read())
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        object_id: &str,
        queue: &CallbackQueue,
        callback: impl Fn(converge_engine::ObjectUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self
            .subscriptions
            .subscribe(object_id, Arc::new(callback), queue.clone());
        Subscription::new(id, &self.subscriptions)
    }
}

/// The replicated objects of one channel.
///
/// Cheap to clone. The internal actor runs until the last clone and the last
/// live handle are dropped.
#[derive(Clone)]
pub struct RealtimeObjects {
    inner: Arc<Inner>,
}

impl RealtimeObjects {
    /// Start the runtime for `channel`. Must be called within a tokio runtime.
    pub fn new(channel: Arc<dyn CoreChannel>, config: Config) -> Self {
        Self::with_clock(channel, config, Arc::new(SystemClock))
    }

    /// Start the runtime with a custom local clock.
    pub fn with_clock(
        channel: Arc<dyn CoreChannel>,
        config: Config,
        clock: Arc<dyn SimpleClock>,
    ) -> Self {
        let coordinator = Arc::new(RwLock::new(SyncCoordinator::new(config.client_id.clone())));
        let subscriptions = SubscriptionManager::new_shared();
        let (commands, receiver) = mpsc::unbounded_channel();
        let (sync_tx, sync_state) = watch::channel(SyncState::Idle);

        let actor = Actor::new(
            coordinator.clone(),
            channel.clone(),
            subscriptions.clone(),
            clock.clone(),
            receiver,
            sync_tx,
            config.gc_interval,
            config.gc_grace_period,
        );
        tokio::spawn(actor.run());
        tracing::info!(client_id = %config.client_id, "Objects runtime started");

        Self {
            inner: Arc::new(Inner {
                commands,
                coordinator,
                sync_state,
                channel,
                subscriptions,
                callbacks: CallbackQueue::new(),
                server_clock: ServerClock::new(clock),
            }),
        }
    }

    // ========================================================================
    // Transport inputs
    // ========================================================================

    /// Incremental operation messages received on the channel.
    pub fn handle_object_messages(&self, messages: Vec<ObjectMessage>) -> Result<()> {
        self.inner.send(Command::ObjectMessages(messages))
    }

    /// Sync messages received on the channel, with the carrying protocol
    /// message's channel serial.
    pub fn handle_object_sync_messages(
        &self,
        messages: Vec<ObjectMessage>,
        channel_serial: Option<String>,
    ) -> Result<()> {
        self.inner.send(Command::SyncMessages {
            messages,
            channel_serial,
        })
    }

    /// The channel attached. `has_objects` is false when the server holds no
    /// objects for the channel and no sync will follow.
    pub fn handle_attached(&self, has_objects: bool) -> Result<()> {
        self.inner.send(Command::Attached { has_objects })
    }

    /// Apply the tombstone grace period advertised by the server.
    pub fn set_gc_grace_period(&self, period: Duration) -> Result<()> {
        self.inner.send(Command::SetGcGracePeriod(period))
    }

    // ========================================================================
    // User API
    // ========================================================================

    pub fn sync_state(&self) -> SyncState {
        *self.inner.sync_state.borrow()
    }

    /// The root map, once the first sync has completed.
    pub async fn get_root(&self) -> Result<LiveMap> {
        match self.inner.channel.state() {
            state @ (AttachmentState::Detached | AttachmentState::Failed) => {
                return Err(Error::NotAttached {
                    operation: "get root",
                    state,
                })
            }
            _ => {}
        }

        let mut sync_state = self.inner.sync_state.clone();
        sync_state
            .wait_for(|state| *state == SyncState::Synced)
            .await
            .map_err(|_| Error::Closed)?;
        Ok(LiveMap::new(self.inner.clone(), ROOT_OBJECT_ID.to_string()))
    }

    /// Create a map holding `entries`. Resolves once the server confirms it.
    pub async fn create_map(&self, entries: BTreeMap<String, LiveMapValue>) -> Result<LiveMap> {
        const OPERATION: &str = "create map";
        self.inner.ensure_attached(OPERATION)?;
        let server_time = self.server_time().await?;

        let entries: BTreeMap<String, ObjectValue> = entries
            .into_iter()
            .map(|(key, value)| (key, value.into_object_value()))
            .collect();
        let object_id = self
            .inner
            .write(
                OPERATION,
                WriteRequest::CreateMap {
                    entries,
                    nonce: nonce(),
                    server_time,
                },
            )
            .await?;
        Ok(LiveMap::new(self.inner.clone(), object_id))
    }

    /// Create a counter starting at `count`. Resolves once the server confirms it.
    pub async fn create_counter(&self, count: f64) -> Result<LiveCounter> {
        const OPERATION: &str = "create counter";
        self.inner.ensure_attached(OPERATION)?;
        let server_time = self.server_time().await?;

        let object_id = self
            .inner
            .write(
                OPERATION,
                WriteRequest::CreateCounter {
                    count,
                    nonce: nonce(),
                    server_time,
                },
            )
            .await?;
        Ok(LiveCounter::new(self.inner.clone(), object_id))
    }

    /// A handle to an object already in the pool.
    pub fn object(&self, object_id: &str) -> Option<LiveMapValue> {
        if !self.inner.read(|c| c.pool().contains(object_id)) {
            return None;
        }
        match ObjectKind::from_object_id(object_id).ok()? {
            ObjectKind::Map => Some(LiveMapValue::Map(LiveMap::new(
                self.inner.clone(),
                object_id.to_string(),
            ))),
            ObjectKind::Counter => Some(LiveMapValue::Counter(LiveCounter::new(
                self.inner.clone(),
                object_id.to_string(),
            ))),
        }
    }

    /// Listen for `Syncing` and `Synced` transitions.
    pub fn on_sync_event(
        &self,
        callback: impl Fn(SyncState) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self
            .inner
            .subscriptions
            .subscribe_sync(Arc::new(callback), self.inner.callbacks.clone());
        Subscription::new(id, &self.inner.subscriptions)
    }

    /// Number of live subscriptions, sync listeners included.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.subscription_count()
    }

    async fn server_time(&self) -> Result<converge_engine::Timestamp> {
        self.inner
            .server_clock
            .server_time(self.inner.channel.as_ref())
            .await
            .map_err(Error::ServerTime)
    }
}

impl std::fmt::Debug for RealtimeObjects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeObjects")
            .field("sync_state", &self.sync_state())
            .finish()
    }
}

fn nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
