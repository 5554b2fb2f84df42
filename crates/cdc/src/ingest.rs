//! The batching CDC ingester.

use crate::error::{CdcError, CdcResult};
use crate::events::decode_event;
use crate::source::CdcSource;
use gleaner_core::config::WatchedTables;
use gleaner_registry::{Checkpoint, RefDelta, SqliteRegistry};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Flush once this many deltas have accumulated.
const MAX_BATCH_DELTAS: usize = 5_000;

/// Flush once the oldest pending delta is this old.
const MAX_BATCH_AGE: Duration = Duration::from_millis(500);

/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Folds a CDC source into the reference registry.
///
/// Deltas are applied in stream order through [`SqliteRegistry::apply_batch`],
/// which commits each batch together with its checkpoint. The ingester never
/// aborts on transient errors; it reconnects from the last committed
/// checkpoint with exponential backoff.
pub struct CdcIngester {
    registry: Arc<SqliteRegistry>,
    tables: WatchedTables,
    source: Box<dyn CdcSource>,
    next_seq: i64,
    committed_cursor: Option<String>,
    made_progress: bool,
}

impl CdcIngester {
    pub fn new(
        registry: Arc<SqliteRegistry>,
        tables: WatchedTables,
        source: Box<dyn CdcSource>,
    ) -> Self {
        Self {
            registry,
            tables,
            source,
            next_seq: 1,
            committed_cursor: None,
            made_progress: false,
        }
    }

    /// Read the persisted checkpoint and open the stream there.
    ///
    /// Fatal configuration errors (missing slot, bad DSN) surface here so
    /// initialization can fail fast; `run` only ever sees a connected source
    /// on its first pass.
    pub async fn connect(&mut self) -> CdcResult<()> {
        let checkpoint = self
            .registry
            .checkpoint(self.source.stream_name())
            .await?;

        match &checkpoint {
            Some(cp) => {
                tracing::info!(
                    stream = %self.source.stream_name(),
                    cursor = %cp.cursor,
                    seq = cp.seq,
                    "resuming CDC stream from checkpoint"
                );
                self.next_seq = cp.seq + 1;
                self.committed_cursor = Some(cp.cursor.clone());
            }
            None => {
                tracing::info!(
                    stream = %self.source.stream_name(),
                    "no CDC checkpoint, starting at current end of stream"
                );
            }
        }

        self.source
            .connect(checkpoint.as_ref().map(|cp| cp.cursor.as_str()))
            .await
    }

    /// Consume the stream until cancellation.
    ///
    /// The final pending batch is flushed and checkpointed before returning,
    /// so shutdown loses nothing that was already read.
    pub async fn run(mut self, token: CancellationToken) {
        let mut backoff = BACKOFF_INITIAL;

        loop {
            match self.consume(&token).await {
                Ok(()) => {
                    tracing::info!(stream = %self.source.stream_name(), "CDC ingester stopped");
                    return;
                }
                Err(e) if e.is_fatal() => {
                    // Liveness surfaces through /health; the process stays up.
                    tracing::error!(
                        stream = %self.source.stream_name(),
                        error = %e,
                        "fatal CDC error, ingester halted"
                    );
                    return;
                }
                Err(e) => {
                    if self.made_progress {
                        backoff = BACKOFF_INITIAL;
                        self.made_progress = false;
                    }
                    tracing::warn!(
                        stream = %self.source.stream_name(),
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "CDC stream error, reconnecting"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);

                    if let Err(e) = self.connect().await {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "fatal CDC error during reconnect");
                            return;
                        }
                        tracing::warn!(error = %e, "CDC reconnect failed, will retry");
                    }
                }
            }
        }
    }

    /// One connected session: read, batch, flush until error or cancellation.
    async fn consume(&mut self, token: &CancellationToken) -> CdcResult<()> {
        let mut pending: Vec<RefDelta> = Vec::new();
        let mut last_cursor: Option<String> = None;
        let mut flush_at: Option<Instant> = None;

        loop {
            let deadline = flush_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    self.flush(&mut pending, &mut last_cursor).await?;
                    return Ok(());
                }

                _ = tokio::time::sleep_until(deadline), if flush_at.is_some() => {
                    self.flush(&mut pending, &mut last_cursor).await?;
                    flush_at = None;
                }

                slice = self.source.next_events() => {
                    let slice = slice?;
                    if let Some(cursor) = slice.cursor {
                        last_cursor = Some(cursor);
                    }
                    for event in &slice.events {
                        pending.extend(decode_event(&self.tables, event));
                    }

                    if pending.len() >= MAX_BATCH_DELTAS {
                        self.flush(&mut pending, &mut last_cursor).await?;
                        flush_at = None;
                    } else if flush_at.is_none()
                        && last_cursor.is_some()
                        && (!pending.is_empty() || last_cursor != self.committed_cursor)
                    {
                        // Start the age timer on the first unflushed work;
                        // cursor-only batches still persist the checkpoint so
                        // the server can release upstream log segments.
                        flush_at = Some(Instant::now() + MAX_BATCH_AGE);
                    }
                }
            }
        }
    }

    /// Apply pending deltas and the checkpoint in one transaction, then
    /// acknowledge the position to the source.
    async fn flush(
        &mut self,
        pending: &mut Vec<RefDelta>,
        last_cursor: &mut Option<String>,
    ) -> CdcResult<()> {
        let Some(cursor) = last_cursor.clone() else {
            return Ok(());
        };
        if pending.is_empty() && Some(&cursor) == self.committed_cursor.as_ref() {
            return Ok(());
        }

        let checkpoint = Checkpoint {
            stream: self.source.stream_name().to_string(),
            cursor: cursor.clone(),
            seq: self.next_seq,
            updated_at: OffsetDateTime::now_utc(),
        };

        let deltas = std::mem::take(pending);
        self.registry.apply_batch(&deltas, &checkpoint).await?;
        self.next_seq += 1;
        self.committed_cursor = Some(cursor.clone());
        self.made_progress = true;

        tracing::debug!(
            stream = %checkpoint.stream,
            cursor = %checkpoint.cursor,
            seq = checkpoint.seq,
            deltas = deltas.len(),
            "CDC batch applied"
        );

        // The registry transaction is the durability point; acknowledgement
        // only lets the server discard log. A crash between the two replays
        // into the duplicate-swallowing path.
        self.source.acknowledge(&cursor).await?;
        Ok(())
    }
}
