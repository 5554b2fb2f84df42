//! Postgres CDC source over a logical replication slot.
//!
//! The slot is polled with `pg_logical_slot_peek_changes` using the
//! `test_decoding` text format and advanced with
//! `pg_replication_slot_advance` only after the registry transaction for the
//! batch has committed. Peek-before-apply, advance-after: a crash between the
//! two replays the batch, which the registry absorbs as duplicates.
//!
//! Requirements on the server side:
//! - `wal_level = logical`
//! - a pre-created slot (a missing slot is a fatal configuration error)
//! - `REPLICA IDENTITY FULL` on watched tables, so UPDATE and DELETE events
//!   carry the full old row image the decode rules need.

use crate::error::{CdcError, CdcResult};
use crate::events::{EventSlice, RowEvent, RowOp};
use crate::source::CdcSource;
use async_trait::async_trait;
use gleaner_core::config::WatchedTables;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::BTreeMap;
use std::time::Duration;

/// Changes fetched per poll.
const PEEK_LIMIT: i32 = 500;

/// Idle sleep when the slot has nothing new.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(100);

/// Derive the replication slot name for a bucket.
///
/// Deterministic per bucket so a restarted process reattaches to its own slot.
pub fn slot_name(bucket: &str) -> String {
    let sanitized: String = bucket
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("gleaner_{sanitized}")
}

/// Logical-replication CDC source.
pub struct PostgresSource {
    pool: PgPool,
    slot: String,
    tables: WatchedTables,
    /// Highest LSN handed to the ingester this session. Peeks do not consume,
    /// so without this every poll before the acknowledge would re-deliver the
    /// same changes.
    delivered: Option<u64>,
}

impl PostgresSource {
    /// Connect a pool to the DSN and bind to the given slot.
    pub async fn connect_url(url: &str, slot: String, tables: WatchedTables) -> CdcResult<Self> {
        let pool = PgPoolOptions::new().max_connections(2).connect(url).await?;
        Ok(Self::new(pool, slot, tables))
    }

    pub fn new(pool: PgPool, slot: String, tables: WatchedTables) -> Self {
        Self {
            pool,
            slot,
            tables,
            delivered: None,
        }
    }

    async fn slot_exists(&self) -> CdcResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
        )
        .bind(&self.slot)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Advance the slot to `target` if it is ahead of the confirmed position.
    async fn advance_to(&self, target: &str) -> CdcResult<()> {
        let ahead: Option<bool> = sqlx::query_scalar(
            "SELECT $2::pg_lsn > confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = $1",
        )
        .bind(&self.slot)
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;

        if ahead == Some(true) {
            sqlx::query("SELECT pg_replication_slot_advance($1, $2::pg_lsn)")
                .bind(&self.slot)
                .bind(target)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CdcSource for PostgresSource {
    fn stream_name(&self) -> &str {
        &self.slot
    }

    async fn connect(&mut self, from: Option<&str>) -> CdcResult<()> {
        if !self.slot_exists().await? {
            return Err(CdcError::MissingSlot(self.slot.clone()));
        }

        match from {
            // Re-align the server with the committed checkpoint in case the
            // previous run crashed after apply but before acknowledge.
            Some(cursor) => {
                self.advance_to(cursor).await?;
                self.delivered = Some(parse_lsn(cursor)?);
            }
            // No checkpoint: skip any backlog and start at the current end.
            None => {
                let current: String = sqlx::query_scalar("SELECT pg_current_wal_lsn()::text")
                    .fetch_one(&self.pool)
                    .await?;
                self.advance_to(&current).await?;
                self.delivered = Some(parse_lsn(&current)?);
            }
        }
        Ok(())
    }

    async fn next_events(&mut self) -> CdcResult<EventSlice> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2)",
        )
        .bind(&self.slot)
        .bind(PEEK_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            tokio::time::sleep(IDLE_POLL_DELAY).await;
            return Ok(EventSlice::default());
        }

        let mut slice = EventSlice::default();
        let mut any_new = false;
        for (lsn, data) in rows {
            let position = parse_lsn(&lsn)?;
            if self.delivered.is_some_and(|d| position <= d) {
                continue; // already handed out, waiting on acknowledge
            }
            any_new = true;
            self.delivered = Some(position);

            match parse_change(&data) {
                Ok(Some(event)) => {
                    if self.tables.contains_key(&event.table) {
                        slice.events.push(event);
                    }
                }
                Ok(None) => {} // BEGIN/COMMIT and friends
                Err(e) => {
                    // Schema drift or an unexpected tuple format; skip the
                    // change rather than wedging the stream on it.
                    tracing::warn!(lsn = %lsn, error = %e, "undecodable logical change skipped");
                }
            }
            slice.cursor = Some(lsn);
        }

        if !any_new {
            tokio::time::sleep(IDLE_POLL_DELAY).await;
        }
        Ok(slice)
    }

    async fn acknowledge(&mut self, cursor: &str) -> CdcResult<()> {
        self.advance_to(cursor).await
    }
}

/// Parse a textual LSN (`X/Y` in hex) into its 64-bit position.
fn parse_lsn(lsn: &str) -> CdcResult<u64> {
    let (hi, lo) = lsn
        .split_once('/')
        .ok_or_else(|| CdcError::Decode(format!("malformed LSN: {lsn:?}")))?;
    let hi = u64::from_str_radix(hi, 16)
        .map_err(|_| CdcError::Decode(format!("malformed LSN: {lsn:?}")))?;
    let lo = u64::from_str_radix(lo, 16)
        .map_err(|_| CdcError::Decode(format!("malformed LSN: {lsn:?}")))?;
    Ok((hi << 32) | lo)
}

/// Parse one `test_decoding` change line into a row event.
///
/// Returns `Ok(None)` for transaction control lines (`BEGIN`, `COMMIT`).
fn parse_change(data: &str) -> CdcResult<Option<RowEvent>> {
    let Some(rest) = data.strip_prefix("table ") else {
        return Ok(None);
    };

    let (qualified, rest) = rest
        .split_once(": ")
        .ok_or_else(|| CdcError::Decode(format!("missing table separator: {data:?}")))?;
    let table = qualified
        .rsplit_once('.')
        .map(|(_, t)| t)
        .unwrap_or(qualified)
        .trim_matches('"')
        .to_string();

    let (op, tuples) = if let Some(t) = rest.strip_prefix("INSERT: ") {
        (RowOp::Insert, t)
    } else if let Some(t) = rest.strip_prefix("UPDATE: ") {
        (RowOp::Update, t)
    } else if let Some(t) = rest.strip_prefix("DELETE: ") {
        (RowOp::Delete, t)
    } else {
        return Ok(None);
    };

    let (old, new) = match op {
        RowOp::Insert => (BTreeMap::new(), parse_columns(tuples)?),
        RowOp::Delete => (parse_columns(tuples)?, BTreeMap::new()),
        RowOp::Update => {
            // With REPLICA IDENTITY FULL the old image arrives as
            // `old-key: <cols> new-tuple: <cols>`; without it there is no old
            // image and the update cannot be decoded into balanced deltas.
            if let Some(rest) = tuples.strip_prefix("old-key: ") {
                let (old_part, new_part) = rest.split_once(" new-tuple: ").ok_or_else(|| {
                    CdcError::Decode(format!("update without new-tuple section: {data:?}"))
                })?;
                (parse_columns(old_part)?, parse_columns(new_part)?)
            } else {
                return Err(CdcError::Decode(
                    "update without old row image (set REPLICA IDENTITY FULL on watched tables)"
                        .to_string(),
                ));
            }
        }
    };

    Ok(Some(RowEvent {
        table,
        op,
        old,
        new,
    }))
}

/// Parse a `test_decoding` tuple: `name[type]:value` items separated by spaces.
///
/// Values are either single-quoted strings (with `''` escapes) or bare tokens;
/// a bare `null` is SQL NULL.
fn parse_columns(tuple: &str) -> CdcResult<BTreeMap<String, Option<String>>> {
    let mut columns = BTreeMap::new();
    let bytes = tuple.as_bytes();
    let mut pos = 0usize;

    while pos < bytes.len() {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let name_start = pos;
        while pos < bytes.len() && bytes[pos] != b'[' {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(CdcError::Decode(format!("truncated column name: {tuple:?}")));
        }
        let name = tuple[name_start..pos].trim_matches('"').to_string();

        // Skip the bracketed type.
        while pos < bytes.len() && bytes[pos] != b']' {
            pos += 1;
        }
        pos += 1;
        if pos >= bytes.len() || bytes[pos] != b':' {
            return Err(CdcError::Decode(format!("missing value separator: {tuple:?}")));
        }
        pos += 1;

        let value = if pos < bytes.len() && bytes[pos] == b'\'' {
            pos += 1;
            let mut out = String::new();
            loop {
                if pos >= bytes.len() {
                    return Err(CdcError::Decode(format!("unterminated string: {tuple:?}")));
                }
                if bytes[pos] == b'\'' {
                    if pos + 1 < bytes.len() && bytes[pos + 1] == b'\'' {
                        out.push('\'');
                        pos += 2;
                        continue;
                    }
                    pos += 1;
                    break;
                }
                let ch_start = pos;
                pos += 1;
                while pos < bytes.len() && (bytes[pos] & 0xC0) == 0x80 {
                    pos += 1;
                }
                out.push_str(&tuple[ch_start..pos]);
            }
            Some(out)
        } else {
            let token_start = pos;
            while pos < bytes.len() && bytes[pos] != b' ' {
                pos += 1;
            }
            let token = &tuple[token_start..pos];
            if token == "null" {
                None
            } else {
                Some(token.to_string())
            }
        };

        columns.insert(name, value);
    }

    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_name_is_deterministic_and_sanitized() {
        assert_eq!(slot_name("app-uploads"), "gleaner_app_uploads");
        assert_eq!(slot_name("app-uploads"), slot_name("app-uploads"));
    }

    #[test]
    fn lsn_parsing_orders_correctly() {
        assert!(parse_lsn("0/1A2B3C").unwrap() < parse_lsn("0/1A2B3D").unwrap());
        assert!(parse_lsn("0/FFFFFFFF").unwrap() < parse_lsn("1/0").unwrap());
        assert!(parse_lsn("garbage").is_err());
    }

    #[test]
    fn parse_insert_line() {
        let event = parse_change(
            "table public.users: INSERT: id[integer]:1 avatar_url[character varying]:'avatars/alice.jpg'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.table, "users");
        assert_eq!(event.op, RowOp::Insert);
        assert_eq!(
            event.new.get("avatar_url").unwrap().as_deref(),
            Some("avatars/alice.jpg")
        );
        assert_eq!(event.new.get("id").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn parse_delete_line() {
        let event = parse_change("table public.users: DELETE: id[integer]:7 avatar_url[text]:'a.jpg'")
            .unwrap()
            .unwrap();
        assert_eq!(event.op, RowOp::Delete);
        assert_eq!(event.old.get("avatar_url").unwrap().as_deref(), Some("a.jpg"));
        assert!(event.new.is_empty());
    }

    #[test]
    fn parse_update_with_full_identity() {
        let event = parse_change(
            "table public.users: UPDATE: old-key: id[integer]:1 avatar_url[text]:'old.jpg' new-tuple: id[integer]:1 avatar_url[text]:'new.jpg'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.op, RowOp::Update);
        assert_eq!(event.old.get("avatar_url").unwrap().as_deref(), Some("old.jpg"));
        assert_eq!(event.new.get("avatar_url").unwrap().as_deref(), Some("new.jpg"));
    }

    #[test]
    fn parse_update_without_old_image_errors() {
        let err = parse_change("table public.users: UPDATE: id[integer]:1 avatar_url[text]:'x'")
            .unwrap_err();
        assert!(err.to_string().contains("REPLICA IDENTITY FULL"));
    }

    #[test]
    fn parse_null_and_quoted_values() {
        let event = parse_change(
            "table public.users: INSERT: avatar_url[text]:null note[text]:'it''s fine' count[integer]:42",
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.new.get("avatar_url").unwrap(), &None);
        assert_eq!(event.new.get("note").unwrap().as_deref(), Some("it's fine"));
        assert_eq!(event.new.get("count").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn transaction_control_lines_are_skipped() {
        assert!(parse_change("BEGIN 1234").unwrap().is_none());
        assert!(parse_change("COMMIT 1234").unwrap().is_none());
    }

    #[test]
    fn schema_qualified_and_quoted_tables() {
        let event = parse_change("table myschema.\"Orders\": INSERT: id[integer]:1")
            .unwrap()
            .unwrap();
        assert_eq!(event.table, "Orders");
    }
}
