/*
    Flush subsystem - Draining the queue to the remote

    - engine: the single-flight flush pass
    - status: phase and counters exposed to observers
*/

pub mod engine;
pub mod errors;
pub mod status;

pub use engine::{
    ExhaustedItem, FlushConfig, FlushEngine, FlushOutcome, FlushReport, EXHAUSTED_LOG_CAPACITY,
};
pub use errors::{FlushError, FlushResult};
pub use status::{SyncPhase, SyncStatus, SyncStatusTracker};
