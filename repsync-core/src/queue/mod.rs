/*
    Queue subsystem - Durable offline write queue

    Holds write intents recorded while the backing service may be
    unreachable, in the order they were made.
*/

pub mod enqueuer;
pub mod errors;
pub mod item;
pub mod store;

pub use enqueuer::Enqueuer;
pub use errors::{StoreError, StoreResult};
pub use item::{EntityKind, EntityRef, ItemType, QueueItem, WriteIntent};
pub use store::{FileBackend, MemoryBackend, QueueBackend, QueueStore};
