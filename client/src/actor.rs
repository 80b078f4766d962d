//! The objects actor.
//!
//! A single tokio task owns every mutation of the [`SyncCoordinator`]. Wire
//! messages, attach signals, local writes, publish completions and the GC
//! ticker are all serialized through it. Readers share the coordinator behind
//! a read lock that the actor only write-locks for the duration of one
//! synchronous engine call.
//!
//! The actor never awaits IO and never runs user code: publishes are spawned,
//! and notifications are queued on callback queues.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use converge_engine::{
    Effects, LocalWrite, MessageId, ObjectId, ObjectMessage, ObjectValue, OutboundObjectMessage,
    SimpleClock, SyncCoordinator, SyncState, Timestamp,
};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::channel::{AttachmentState, ChannelError, CoreChannel};
use crate::config::GracePeriod;
use crate::error::{Error, Result};
use crate::subscriptions::SubscriptionManager;

/// Coordinator shared between the actor and readers.
pub(crate) type SharedCoordinator = Arc<RwLock<SyncCoordinator>>;

/// Reply channel of a local write; resolves with the written object's id.
pub(crate) type WriteReply = oneshot::Sender<Result<ObjectId>>;

/// A local mutation requested through a handle.
#[derive(Debug, Clone)]
pub(crate) enum WriteRequest {
    MapSet {
        object_id: ObjectId,
        key: String,
        value: ObjectValue,
    },
    MapRemove {
        object_id: ObjectId,
        key: String,
    },
    CounterInc {
        object_id: ObjectId,
        amount: f64,
    },
    CreateMap {
        entries: BTreeMap<String, ObjectValue>,
        nonce: String,
        server_time: Timestamp,
    },
    CreateCounter {
        count: f64,
        nonce: String,
        server_time: Timestamp,
    },
}

pub(crate) enum Command {
    ObjectMessages(Vec<ObjectMessage>),
    SyncMessages {
        messages: Vec<ObjectMessage>,
        channel_serial: Option<String>,
    },
    Attached {
        has_objects: bool,
    },
    Write {
        request: WriteRequest,
        reply: WriteReply,
    },
    SetGcGracePeriod(Duration),
}

/// Outcome of a spawned publish.
struct Published {
    message_ids: Vec<MessageId>,
    result: std::result::Result<(), ChannelError>,
}

/// A caller waiting for its write to be confirmed.
struct Waiter {
    object_id: ObjectId,
    outstanding: HashSet<MessageId>,
    reply: WriteReply,
}

pub(crate) struct Actor {
    coordinator: SharedCoordinator,
    channel: Arc<dyn CoreChannel>,
    subscriptions: Arc<SubscriptionManager>,
    clock: Arc<dyn SimpleClock>,
    commands: mpsc::UnboundedReceiver<Command>,
    published_tx: mpsc::UnboundedSender<Published>,
    published_rx: mpsc::UnboundedReceiver<Published>,
    attachment: watch::Receiver<AttachmentState>,
    watching_attachment: bool,
    sync_state: watch::Sender<SyncState>,
    gc_interval: Duration,
    gc_grace_period: GracePeriod,
    waiters: HashMap<u64, Waiter>,
    by_message: HashMap<MessageId, u64>,
    next_waiter: u64,
}

impl Actor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        coordinator: SharedCoordinator,
        channel: Arc<dyn CoreChannel>,
        subscriptions: Arc<SubscriptionManager>,
        clock: Arc<dyn SimpleClock>,
        commands: mpsc::UnboundedReceiver<Command>,
        sync_state: watch::Sender<SyncState>,
        gc_interval: Duration,
        gc_grace_period: GracePeriod,
    ) -> Self {
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        let attachment = channel.watch_state();
        Self {
            coordinator,
            channel,
            subscriptions,
            clock,
            commands,
            published_tx,
            published_rx,
            attachment,
            watching_attachment: true,
            sync_state,
            gc_interval,
            gc_grace_period,
            waiters: HashMap::new(),
            by_message: HashMap::new(),
            next_waiter: 0,
        }
    }

    /// Run until every command sender is dropped.
    pub(crate) async fn run(mut self) {
        let mut gc = tokio::time::interval(self.gc_interval.max(Duration::from_millis(1)));
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        gc.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(published) = self.published_rx.recv() => self.handle_published(published),
                changed = self.attachment.changed(), if self.watching_attachment => {
                    if changed.is_err() {
                        debug!("Channel state stream closed");
                        self.watching_attachment = false;
                        continue;
                    }
                    let state = *self.attachment.borrow_and_update();
                    self.handle_attachment(state);
                }
                _ = gc.tick() => self.collect_garbage(),
            }
        }

        self.fail_all_waiters(Error::Closed);
        info!("Objects actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        let now = self.clock.now();
        match command {
            Command::ObjectMessages(messages) => {
                let effects = self.coordinator.write().handle_operations(messages, now);
                self.apply(effects);
                self.collect_garbage();
            }
            Command::SyncMessages {
                messages,
                channel_serial,
            } => {
                let effects = self.coordinator.write().handle_sync_messages(
                    messages,
                    channel_serial.as_deref(),
                    now,
                );
                self.apply(effects);
                self.collect_garbage();
            }
            Command::Attached { has_objects } => {
                debug!(has_objects, "Channel attached");
                let effects = self.coordinator.write().start_sync(has_objects, now);
                self.apply(effects);
            }
            Command::Write { request, reply } => self.handle_write(request, reply, now),
            Command::SetGcGracePeriod(period) => {
                if self.gc_grace_period.update(period) {
                    let grace_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
                    info!(grace_ms, "GC grace period updated");
                }
            }
        }
    }

    fn handle_attachment(&mut self, state: AttachmentState) {
        debug!(state = %state, "Channel state changed");
        if state == AttachmentState::Attached {
            return;
        }
        if self.coordinator.read().state() == SyncState::Idle {
            return;
        }
        let effects = self.coordinator.write().detach();
        self.apply(effects);
    }

    fn handle_write(&mut self, request: WriteRequest, reply: WriteReply, now: Timestamp) {
        let result = {
            let mut coordinator = self.coordinator.write();
            match request {
                WriteRequest::MapSet {
                    object_id,
                    key,
                    value,
                } => coordinator.local_map_set(&object_id, &key, value, now),
                WriteRequest::MapRemove { object_id, key } => {
                    coordinator.local_map_remove(&object_id, &key, now)
                }
                WriteRequest::CounterInc { object_id, amount } => {
                    coordinator.local_counter_inc(&object_id, amount, now)
                }
                WriteRequest::CreateMap {
                    entries,
                    nonce,
                    server_time,
                } => coordinator.local_create_map(entries, &nonce, server_time, now),
                WriteRequest::CreateCounter {
                    count,
                    nonce,
                    server_time,
                } => coordinator.local_create_counter(count, &nonce, server_time, now),
            }
        };

        let LocalWrite {
            object_id,
            message_ids,
            outbound,
            updates,
        } = match result {
            Ok(write) => write,
            Err(e) => {
                debug!(error = %e, "Local write rejected");
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        for (id, update) in &updates {
            self.subscriptions.notify(id, update);
        }

        let waiter_id = self.next_waiter;
        self.next_waiter += 1;
        for message_id in &message_ids {
            self.by_message.insert(message_id.clone(), waiter_id);
        }
        self.waiters.insert(
            waiter_id,
            Waiter {
                object_id,
                outstanding: message_ids.into_iter().collect(),
                reply,
            },
        );

        self.publish(outbound);
    }

    /// Deliver the consequences of one coordinator step.
    fn apply(&mut self, effects: Effects) {
        let Effects {
            updates,
            removed,
            confirmed,
            failed,
            outbound,
            state_changes,
            resync_requested,
        } = effects;

        for (object_id, update) in &updates {
            self.subscriptions.notify(object_id, update);
        }
        for object_id in &removed {
            self.subscriptions.remove_object(object_id);
        }
        for message_id in &confirmed {
            self.confirm(message_id);
        }
        if !failed.is_empty() {
            let state = *self.attachment.borrow();
            for message_id in &failed {
                self.fail(
                    message_id,
                    Error::NotAttached {
                        operation: "complete write",
                        state,
                    },
                );
            }
        }
        self.publish(outbound);

        for state in state_changes {
            // The watch has no receivers only while the runtime is shutting down.
            let _ = self.sync_state.send(state);
            if state != SyncState::Idle {
                self.subscriptions.notify_sync(state);
            }
        }

        if resync_requested {
            let channel = self.channel.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.request_resync().await {
                    warn!(error = %e, "Resync request failed");
                }
            });
        }
    }

    fn publish(&self, outbound: Vec<OutboundObjectMessage>) {
        if outbound.is_empty() {
            return;
        }
        let message_ids: Vec<MessageId> = outbound.iter().map(|m| m.id.clone()).collect();
        debug!(count = message_ids.len(), "Publishing object messages");

        let channel = self.channel.clone();
        let done = self.published_tx.clone();
        tokio::spawn(async move {
            let result = channel.publish(outbound).await;
            let _ = done.send(Published {
                message_ids,
                result,
            });
        });
    }

    fn handle_published(&mut self, published: Published) {
        match published.result {
            Ok(()) => debug!(count = published.message_ids.len(), "Publish acknowledged"),
            Err(e) => {
                warn!(error = %e, count = published.message_ids.len(), "Publish rejected");
                self.coordinator.write().publish_failed(&published.message_ids);
                for message_id in &published.message_ids {
                    self.fail(message_id, Error::PublishFailed(e.clone()));
                }
            }
        }
    }

    fn collect_garbage(&mut self) {
        let grace = u64::try_from(self.gc_grace_period.duration().as_millis()).unwrap_or(u64::MAX);
        let effects = self.coordinator.write().collect_garbage(self.clock.now(), grace);
        if !effects.removed.is_empty() {
            info!(removed = effects.removed.len(), "Garbage collected objects");
        }
        self.apply(effects);
    }

    fn confirm(&mut self, message_id: &MessageId) {
        let Some(waiter_id) = self.by_message.remove(message_id) else {
            return;
        };
        let done = match self.waiters.get_mut(&waiter_id) {
            Some(waiter) => {
                waiter.outstanding.remove(message_id);
                waiter.outstanding.is_empty()
            }
            None => false,
        };
        if done {
            if let Some(waiter) = self.waiters.remove(&waiter_id) {
                let _ = waiter.reply.send(Ok(waiter.object_id));
            }
        }
    }

    fn fail(&mut self, message_id: &MessageId, error: Error) {
        let Some(waiter_id) = self.by_message.remove(message_id) else {
            return;
        };
        if let Some(waiter) = self.waiters.remove(&waiter_id) {
            for other in &waiter.outstanding {
                self.by_message.remove(other);
            }
            let _ = waiter.reply.send(Err(error));
        }
    }

    fn fail_all_waiters(&mut self, error: Error) {
        self.by_message.clear();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.reply.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use converge_engine::{ManualClock, ROOT_OBJECT_ID};
    use parking_lot::Mutex;

    struct Recorder {
        published: Mutex<Vec<OutboundObjectMessage>>,
        state: watch::Sender<AttachmentState>,
    }

    #[async_trait]
    impl CoreChannel for Recorder {
        async fn publish(
            &self,
            messages: Vec<OutboundObjectMessage>,
        ) -> std::result::Result<(), ChannelError> {
            self.published.lock().extend(messages);
            Ok(())
        }

        fn watch_state(&self) -> watch::Receiver<AttachmentState> {
            self.state.subscribe()
        }

        async fn fetch_server_time(&self) -> std::result::Result<Timestamp, ChannelError> {
            Ok(0)
        }
    }

    struct Harness {
        commands: mpsc::UnboundedSender<Command>,
        coordinator: SharedCoordinator,
        channel: Arc<Recorder>,
        sync_state: watch::Receiver<SyncState>,
    }

    fn spawn() -> Harness {
        let (state, _) = watch::channel(AttachmentState::Attached);
        let channel = Arc::new(Recorder {
            published: Mutex::new(Vec::new()),
            state,
        });
        let coordinator = Arc::new(RwLock::new(SyncCoordinator::new("test")));
        let (commands, rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_state) = watch::channel(SyncState::Idle);
        let actor = Actor::new(
            coordinator.clone(),
            channel.clone(),
            SubscriptionManager::new_shared(),
            Arc::new(ManualClock::new(0)),
            rx,
            sync_tx,
            Duration::from_secs(3600),
            GracePeriod::Fixed(Duration::from_secs(60)),
        );
        tokio::spawn(actor.run());
        Harness {
            commands,
            coordinator,
            channel,
            sync_state,
        }
    }

    #[tokio::test]
    async fn attach_without_objects_reaches_synced() {
        let mut h = spawn();
        h.commands
            .send(Command::Attached { has_objects: false })
            .unwrap();
        h.sync_state
            .wait_for(|s| *s == SyncState::Synced)
            .await
            .unwrap();
        assert!(h.coordinator.read().is_synced());
    }

    #[tokio::test]
    async fn write_resolves_on_echo() {
        let mut h = spawn();
        h.commands
            .send(Command::Attached { has_objects: false })
            .unwrap();
        h.sync_state
            .wait_for(|s| *s == SyncState::Synced)
            .await
            .unwrap();

        let (reply, wait) = oneshot::channel();
        h.commands
            .send(Command::Write {
                request: WriteRequest::MapSet {
                    object_id: ROOT_OBJECT_ID.to_string(),
                    key: "k".to_string(),
                    value: ObjectValue::Bool(true),
                },
                reply,
            })
            .unwrap();

        let echo = loop {
            if let Some(message) = h.channel.published.lock().first().cloned() {
                break message;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(echo.id, "test:1");

        h.commands
            .send(Command::ObjectMessages(vec![ObjectMessage::operation(
                echo.operation,
                "01",
                "site",
            )
            .with_id(echo.id)]))
            .unwrap();
        assert_eq!(wait.await.unwrap().unwrap(), ROOT_OBJECT_ID);
    }

    #[tokio::test]
    async fn rejected_write_resolves_immediately() {
        let h = spawn();
        let (reply, wait) = oneshot::channel();
        h.commands
            .send(Command::Write {
                request: WriteRequest::CounterInc {
                    object_id: ROOT_OBJECT_ID.to_string(),
                    amount: 1.0,
                },
                reply,
            })
            .unwrap();
        assert!(matches!(wait.await.unwrap(), Err(Error::Engine(_))));
    }

    #[tokio::test]
    async fn detach_fails_waiting_writes() {
        let mut h = spawn();
        h.commands
            .send(Command::Attached { has_objects: false })
            .unwrap();
        h.sync_state
            .wait_for(|s| *s == SyncState::Synced)
            .await
            .unwrap();

        let (reply, wait) = oneshot::channel();
        h.commands
            .send(Command::Write {
                request: WriteRequest::MapRemove {
                    object_id: ROOT_OBJECT_ID.to_string(),
                    key: "k".to_string(),
                },
                reply,
            })
            .unwrap();
        while h.channel.published.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        h.channel.state.send_replace(AttachmentState::Detached);

        assert!(matches!(
            wait.await.unwrap(),
            Err(Error::NotAttached {
                state: AttachmentState::Detached,
                ..
            })
        ));
        h.sync_state
            .wait_for(|s| *s == SyncState::Idle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pending_writes_fail_on_shutdown() {
        let h = spawn();
        h.commands
            .send(Command::Attached { has_objects: true })
            .unwrap();
        let (reply, wait) = oneshot::channel();
        h.commands
            .send(Command::Write {
                request: WriteRequest::MapSet {
                    object_id: ROOT_OBJECT_ID.to_string(),
                    key: "k".to_string(),
                    value: ObjectValue::from("v"),
                },
                reply,
            })
            .unwrap();
        drop(h.commands);
        assert_eq!(wait.await.unwrap(), Err(Error::Closed));
    }
}
