//! The pluggable CDC source seam.

use crate::error::CdcResult;
use crate::events::EventSlice;
use async_trait::async_trait;

/// A stream of decoded row events with resumable positions.
///
/// Implementations exist for Postgres logical replication and MySQL binlog;
/// tests use an in-memory source.
#[async_trait]
pub trait CdcSource: Send {
    /// Stable stream name, used as the checkpoint key in the registry.
    fn stream_name(&self) -> &str;

    /// Open the stream.
    ///
    /// `from` is the last committed checkpoint cursor; `None` means no
    /// checkpoint exists and the stream opens at its current end (no
    /// historical backfill).
    async fn connect(&mut self, from: Option<&str>) -> CdcResult<()>;

    /// Fetch the next slice of stream progress, possibly empty.
    ///
    /// Implementations may sleep briefly when the stream is idle; they must
    /// not block indefinitely so the ingester can flush time-based batches.
    async fn next_events(&mut self) -> CdcResult<EventSlice>;

    /// Acknowledge everything up to `cursor` as durably applied.
    ///
    /// Postgres advances the replication slot so the server may release WAL;
    /// MySQL has nothing to acknowledge.
    async fn acknowledge(&mut self, cursor: &str) -> CdcResult<()>;
}
