//! Offline write queue with batched flushing and conflict reconciliation
//!
//! Writes are queued locally whatever the connectivity, delivered to the
//! remote in ordered batches when a trigger fires, and routed to manual
//! resolution when the remote copy moved on in the meantime.

pub mod config;
pub mod conflict;
pub mod flush;
pub mod invalidation;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod remote;
pub mod session;
pub mod test_utils;
pub mod trigger;

pub use config::Config;
pub use conflict::{ConflictRecord, ConflictResolution};
pub use flush::{FlushOutcome, SyncPhase, SyncStatus};
pub use logging::{init_logging, LogLevel};
pub use queue::{EntityKind, EntityRef, ItemType, QueueItem, WriteIntent};
pub use session::SyncSession;
