//! # Converge Engine
//!
//! A deterministic CRDT object engine for realtime channels.
//!
//! This crate holds the replicated data structures and the synchronization
//! state machine that keep a set of shared maps and counters convergent across
//! every client attached to a channel. It has no knowledge of sockets, tasks or
//! timers: callers feed it decoded wire messages and the current time, and it
//! returns the resulting state changes.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never publishes, sleeps or spawns
//! - **Deterministic**: the same messages in any delivery order converge to the same state
//! - **Forward compatible**: unknown wire enum values are carried, not rejected
//! - **Arena owned**: objects reference each other only by id, through the [`ObjectsPool`]
//!
//! ## Core Concepts
//!
//! ### Objects
//!
//! The pool holds two kinds of replicated objects:
//! - [`ReplicatedMap`] - per-key last-writer-wins map with tombstones
//! - [`ReplicatedCounter`] - numeric accumulator applying each increment exactly once
//!
//! Every pool contains a root map with id [`ROOT_OBJECT_ID`] that is never removed.
//!
//! ### Timeserials
//!
//! Conflicts are resolved by the server-assigned [`Timeserial`] carried on each
//! operation, never by wall-clock time.
//!
//! ### Synchronization
//!
//! The [`SyncCoordinator`] moves through `Idle -> Syncing -> Synced`. While a
//! snapshot is being received, incremental operations are buffered; once the
//! snapshot completes the pool is rebuilt in one pass and the buffer replayed.
//!
//! ### Optimistic writes
//!
//! Local writes are recorded in a pending ledger and overlaid on confirmed
//! state for reads until the server echo of the same message id arrives.
//!
//! ## Quick Start
//!
//! ```rust
//! use converge_engine::{
//!     ObjectMessage, ObjectOperation, ObjectValue, SyncCoordinator, ROOT_OBJECT_ID,
//! };
//!
//! let mut coordinator = SyncCoordinator::new("client-1");
//!
//! // An attach with no objects leaves an empty, synced root map.
//! coordinator.start_sync(false, 0);
//! assert!(coordinator.is_synced());
//!
//! // Apply a remote MAP_SET on the root.
//! let message = ObjectMessage::operation(
//!     ObjectOperation::map_set(ROOT_OBJECT_ID, "x", &ObjectValue::Number(1.0)),
//!     "01726585978590-000@site1:0",
//!     "site1",
//! );
//! coordinator.handle_operations(vec![message], 0);
//!
//! let value = coordinator.pool().map_get(ROOT_OBJECT_ID, "x").unwrap();
//! assert_eq!(value, Some(ObjectValue::Number(1.0)));
//! ```

pub mod clock;
pub mod counter;
pub mod error;
pub mod map;
pub mod object;
pub mod operation;
pub mod pool;
pub mod reconcile;
pub mod snapshot;
pub mod sync;
pub mod value;
pub mod wire;

// Re-export main types at crate root
pub use clock::{LocalClock, ManualClock, SimpleClock, Timeserial};
pub use counter::{CounterUpdate, ReplicatedCounter};
pub use error::{Error, Result};
pub use map::{KeyChange, MapEntry, MapUpdate, ReplicatedMap};
pub use object::{ObjectMeta, ObjectUpdate};
pub use operation::{InboundOperation, Operation};
pub use pool::{Entry, ObjectsPool, PoolChanges};
pub use reconcile::{PendingLedger, PendingOp, PendingState};
pub use snapshot::{SyncSequence, SyncedObject};
pub use sync::{Effects, LocalWrite, SyncCoordinator, SyncState};
pub use value::{generate_object_id, ObjectKind, ObjectValue};
pub use wire::{
    CounterOp, MapOp, MapSemantics, ObjectData, ObjectMessage, ObjectOperation, ObjectState,
    OperationAction, OutboundObjectMessage, SyncCursor, WireCounter, WireEnum, WireMap,
    WireMapEntry,
};

/// Id of the root map present in every pool.
pub const ROOT_OBJECT_ID: &str = "root";

/// Type aliases for clarity
pub type ObjectId = String;
pub type SiteCode = String;
pub type MessageId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
