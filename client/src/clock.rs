//! Wall-clock and server-time sources.

use std::sync::Arc;

use converge_engine::{SimpleClock, Timestamp};
use parking_lot::Mutex;

use crate::channel::{ChannelError, CoreChannel};

/// The local system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SimpleClock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// Server time, derived from the local clock plus an offset measured once
/// against the channel.
pub struct ServerClock {
    local: Arc<dyn SimpleClock>,
    offset: Mutex<Option<i64>>,
}

impl ServerClock {
    pub fn new(local: Arc<dyn SimpleClock>) -> Self {
        Self {
            local,
            offset: Mutex::new(None),
        }
    }

    /// Current server time. The first call asks the channel.
    pub async fn server_time(&self, channel: &dyn CoreChannel) -> Result<Timestamp, ChannelError> {
        if let Some(offset) = *self.offset.lock() {
            return Ok(self.shifted(offset));
        }

        let local = self.local.now();
        let server = channel.fetch_server_time().await?;
        let offset = server as i64 - local as i64;
        *self.offset.lock() = Some(offset);
        tracing::debug!(offset_ms = offset, "Measured server clock offset");
        Ok(server)
    }

    /// Forget the measured offset.
    pub fn reset(&self) {
        *self.offset.lock() = None;
    }

    fn shifted(&self, offset: i64) -> Timestamp {
        (self.local.now() as i64 + offset).max(0) as Timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AttachmentState;
    use async_trait::async_trait;
    use converge_engine::{ManualClock, OutboundObjectMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    struct TimeOnly {
        server_now: Timestamp,
        calls: AtomicUsize,
        state: watch::Sender<AttachmentState>,
    }

    #[async_trait]
    impl CoreChannel for TimeOnly {
        async fn publish(&self, _: Vec<OutboundObjectMessage>) -> Result<(), ChannelError> {
            Ok(())
        }

        fn watch_state(&self) -> watch::Receiver<AttachmentState> {
            self.state.subscribe()
        }

        async fn fetch_server_time(&self) -> Result<Timestamp, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.server_now)
        }
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn server_time_is_fetched_once() {
        let local = Arc::new(ManualClock::new(1_000));
        let clock = ServerClock::new(local.clone());
        let (state, _) = watch::channel(AttachmentState::Attached);
        let channel = TimeOnly {
            server_now: 5_000,
            calls: AtomicUsize::new(0),
            state,
        };

        assert_eq!(clock.server_time(&channel).await.unwrap(), 5_000);
        local.advance(250);
        assert_eq!(clock.server_time(&channel).await.unwrap(), 5_250);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);

        clock.reset();
        clock.server_time(&channel).await.unwrap();
        assert_eq!(channel.calls.load(Ordering::SeqCst), 2);
    }
}
