/*
    Conflict subsystem - Divergent remote versions and their resolution

    Components:
    - ConflictRecord / merge: what diverged and how two versions combine
    - ConflictDetector: inspects rejected batches, blocks affected entities
    - ConflictResolver: applies the user's choices
*/

pub mod detector;
pub mod errors;
pub mod record;
pub mod resolver;

pub use detector::{ConflictDetector, Detection};
pub use errors::{ConflictError, ConflictResult};
pub use record::{merge, ConflictRecord, ConflictResolution};
pub use resolver::{ConflictResolver, ResolutionReport};
