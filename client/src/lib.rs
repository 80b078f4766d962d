//! # Converge Client
//!
//! The async runtime around [`converge_engine`]: a single-writer actor that
//! owns the replicated objects of one channel, handles for reading and writing
//! them, and subscriber notification on callback queues.
//!
//! The transport is not part of this crate. Plug it in by implementing
//! [`CoreChannel`] and forwarding the channel's object messages to
//! [`RealtimeObjects`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use converge_client::{Config, CoreChannel, RealtimeObjects};
//!
//! async fn run(channel: Arc<dyn CoreChannel>) -> converge_client::Result<()> {
//!     let objects = RealtimeObjects::new(channel, Config::load()?);
//!
//!     // The transport reports the attach and forwards object messages.
//!     objects.handle_attached(false)?;
//!
//!     let root = objects.get_root().await?;
//!     let _sub = root.subscribe(|update| println!("root changed: {update:?}"));
//!
//!     let visits = objects.create_counter(0.0).await?;
//!     root.set("visits", visits.clone()).await?;
//!     visits.increment(1.0).await?;
//!     Ok(())
//! }
//! ```

mod actor;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod live;
pub mod objects;
pub mod subscriptions;

pub use channel::{AttachmentState, ChannelError, CoreChannel};
pub use clock::{ServerClock, SystemClock};
pub use config::{Config, ConfigError, GracePeriod};
pub use error::{Error, Result};
pub use live::{LiveCounter, LiveMap, LiveMapValue};
pub use objects::RealtimeObjects;
pub use subscriptions::{CallbackQueue, Subscription, SubscriptionManager};

pub use converge_engine::{ObjectMessage, ObjectUpdate, ObjectValue, SyncState};
