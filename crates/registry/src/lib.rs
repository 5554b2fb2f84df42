//! Durable reference registry for gleaner.
//!
//! Maintains the `key -> ref_count` map that decides GC candidacy:
//! - Atomic per-key increments and decrements with underflow detection
//! - Transactional delta batches committed together with the CDC checkpoint
//! - Scan-based rebuild that replaces counts for observed keys
//! - Registry statistics for the metrics surface

pub mod error;
pub mod models;
pub mod store;

pub use error::{RegistryError, RegistryResult};
pub use models::{Checkpoint, DeltaOp, RefDelta, RefEntry, RegistryStats};
pub use store::SqliteRegistry;
