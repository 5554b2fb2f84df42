//! Change-data-capture ingestion for gleaner.
//!
//! Streams row changes on watched `(table, column)` pairs out of the source
//! database and folds them into the reference registry:
//! - Decode rules turning INSERT/UPDATE/DELETE row images into ±1 deltas
//! - A batching ingester with checkpoint-transactional applies and
//!   exponential reconnect backoff
//! - Sources: Postgres logical replication slot, MySQL row-based binlog
//! - The live database verifier used by the GC cycle's re-verification step

pub mod error;
pub mod events;
pub mod ingest;
pub mod mysql;
pub mod postgres;
pub mod source;
pub mod verify;

pub use error::{CdcError, CdcResult};
pub use events::{EventSlice, RowEvent, RowOp, decode_event};
pub use ingest::CdcIngester;
pub use mysql::MySqlSource;
pub use postgres::{PostgresSource, slot_name};
pub use source::CdcSource;
pub use verify::{ReferenceVerifier, SqlVerifier, rebuild_from_scan};
