//! Garbage collection engine for gleaner.
//!
//! Drives one complete pass from candidate discovery to verified,
//! backed-up deletion:
//! - Streaming bucket listing with retention and exclusion gates
//! - Registry filter and live database re-verification per candidate
//! - Backup-then-delete ordering with a bounded worker pool
//! - Point-in-time restore from the vault
//! - Daily schedule helper and metrics aggregation

pub mod cycle;
pub mod error;
pub mod metrics;
pub mod restore;
pub mod schedule;

pub use cycle::{GcEngine, HealthReport};
pub use error::{EngineResult, GcError};
pub use metrics::GcMetrics;
pub use schedule::next_run_at;
