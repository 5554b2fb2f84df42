//! MySQL CDC source over the row-based binlog.
//!
//! Connects as a replica (`COM_BINLOG_DUMP`) from the checkpointed
//! `file:pos:server_id` position, or from `SHOW MASTER STATUS` when no
//! checkpoint exists. Server rotation (`RotateEvent`, new file at pos 4) is
//! followed without loss.
//!
//! Server-side requirements:
//! - `binlog_format = ROW`, `binlog_row_image = FULL`, `log_bin = ON`
//! - REPLICATION SLAVE and REPLICATION CLIENT privileges for the DSN user
//!
//! Row events carry column ordinals, not names; the watched-column mapping is
//! resolved from `information_schema.columns` at connect time. A watched
//! column dropped after connect simply stops matching (schema drift is logged
//! by the decoder, not fatal).

use crate::error::{CdcError, CdcResult};
use crate::events::{EventSlice, RowEvent, RowOp};
use crate::source::CdcSource;
use async_trait::async_trait;
use futures::StreamExt;
use gleaner_core::config::WatchedTables;
use mysql_async::binlog::events::{EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// How long one poll waits for a binlog event before reporting idle.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Maximum events drained per poll.
const POLL_BATCH: usize = 500;

/// Row-based binlog CDC source.
pub struct MySqlSource {
    url: String,
    server_id: u32,
    tables: WatchedTables,
    /// Ordinal-indexed column names per watched table.
    columns: HashMap<String, Vec<String>>,
    stream: Option<BinlogStream>,
    file: String,
    pos: u64,
    stream_name: String,
}

impl MySqlSource {
    pub fn new(url: String, server_id: u32, tables: WatchedTables) -> Self {
        Self {
            url,
            server_id,
            tables,
            columns: HashMap::new(),
            stream: None,
            file: String::new(),
            pos: 0,
            stream_name: format!("mysql_binlog_{server_id}"),
        }
    }

    fn cursor(&self) -> String {
        format!("{}:{}:{}", self.file, self.pos, self.server_id)
    }

    fn parse_cursor(cursor: &str) -> CdcResult<(String, u64)> {
        let mut parts = cursor.rsplitn(3, ':');
        let _server_id = parts.next();
        let pos = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| CdcError::Decode(format!("malformed binlog cursor: {cursor:?}")))?;
        let file = parts
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| CdcError::Decode(format!("malformed binlog cursor: {cursor:?}")))?;
        Ok((file.to_string(), pos))
    }

    /// Resolve ordinal-to-name column mappings for the watched tables.
    async fn load_column_maps(&mut self, conn: &mut Conn) -> CdcResult<()> {
        self.columns.clear();
        for table in self.tables.keys() {
            let names: Vec<String> = conn
                .exec(
                    "SELECT column_name FROM information_schema.columns \
                     WHERE table_schema = DATABASE() AND table_name = ? \
                     ORDER BY ordinal_position",
                    (table,),
                )
                .await?;
            if names.is_empty() {
                tracing::warn!(table = %table, "watched table not found in information_schema");
            }
            self.columns.insert(table.clone(), names);
        }
        Ok(())
    }

    /// Decode one row image into a column map using the ordinal mapping.
    fn row_to_columns(&self, table: &str, row: &BinlogRow) -> BTreeMap<String, Option<String>> {
        let mut columns = BTreeMap::new();
        let Some(names) = self.columns.get(table) else {
            return columns;
        };
        for (ordinal, name) in names.iter().enumerate() {
            let value = row.as_ref(ordinal).and_then(binlog_value_to_string);
            columns.insert(name.clone(), value);
        }
        columns
    }

    /// Fold one rows-event into decoded row events.
    fn decode_rows_event(
        &self,
        table: &str,
        rows_event: &RowsEventData<'_>,
        tme: &mysql_async::binlog::events::TableMapEvent<'_>,
        out: &mut Vec<RowEvent>,
    ) -> CdcResult<()> {
        let op = match rows_event {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => RowOp::Insert,
            RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => {
                RowOp::Update
            }
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                RowOp::Delete
            }
            _ => return Ok(()),
        };

        for row in rows_event.rows(tme) {
            let (before, after) =
                row.map_err(|e| CdcError::Decode(format!("binlog row decode: {e}")))?;

            let old = before
                .map(|row| self.row_to_columns(table, &row))
                .unwrap_or_default();
            let new = after
                .map(|row| self.row_to_columns(table, &row))
                .unwrap_or_default();

            out.push(RowEvent {
                table: table.to_string(),
                op,
                old,
                new,
            });
        }
        Ok(())
    }
}

/// Render a binlog value as the string image the decode rules compare.
fn binlog_value_to_string(value: &BinlogValue<'_>) -> Option<String> {
    match value {
        BinlogValue::Value(Value::NULL) => None,
        BinlogValue::Value(Value::Bytes(bytes)) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        BinlogValue::Value(Value::Int(i)) => Some(i.to_string()),
        BinlogValue::Value(Value::UInt(u)) => Some(u.to_string()),
        BinlogValue::Value(Value::Float(f)) => Some(f.to_string()),
        BinlogValue::Value(Value::Double(d)) => Some(d.to_string()),
        BinlogValue::Value(other) => Some(format!("{other:?}")),
        // JSON columns never hold bare object keys.
        BinlogValue::Jsonb(_) | BinlogValue::JsonDiff(_) => None,
    }
}

#[async_trait]
impl CdcSource for MySqlSource {
    fn stream_name(&self) -> &str {
        &self.stream_name
    }

    async fn connect(&mut self, from: Option<&str>) -> CdcResult<()> {
        let opts = Opts::from_url(&self.url)
            .map_err(|e| CdcError::Config(format!("invalid MySQL DSN: {e}")))?;

        // One short-lived connection for metadata, one consumed by the dump.
        let mut meta_conn = Conn::new(opts.clone()).await?;
        self.load_column_maps(&mut meta_conn).await?;

        let (file, pos) = match from {
            Some(cursor) => Self::parse_cursor(cursor)?,
            None => {
                let row: Option<mysql_async::Row> =
                    meta_conn.query_first("SHOW MASTER STATUS").await?;
                let row = row.ok_or_else(|| {
                    CdcError::Config(
                        "SHOW MASTER STATUS returned nothing; is binary logging enabled?"
                            .to_string(),
                    )
                })?;
                let file: String = row.get(0).ok_or_else(|| {
                    CdcError::Decode("SHOW MASTER STATUS missing file column".to_string())
                })?;
                let pos: u64 = row.get(1).ok_or_else(|| {
                    CdcError::Decode("SHOW MASTER STATUS missing position column".to_string())
                })?;
                (file, pos)
            }
        };
        meta_conn.disconnect().await?;

        let dump_conn = Conn::new(opts).await?;
        let stream = dump_conn
            .get_binlog_stream(
                BinlogStreamRequest::new(self.server_id)
                    .with_filename(file.as_bytes())
                    .with_pos(pos),
            )
            .await?;

        tracing::info!(
            file = %file,
            pos = pos,
            server_id = self.server_id,
            "binlog stream opened"
        );

        self.file = file;
        self.pos = pos;
        self.stream = Some(stream);
        Ok(())
    }

    async fn next_events(&mut self) -> CdcResult<EventSlice> {
        // Take the stream out so position bookkeeping on self and table-map
        // lookups on the stream can proceed independently. On error the
        // stream stays out and the reconnect path rebuilds it.
        let Some(mut stream) = self.stream.take() else {
            return Err(CdcError::Stream("binlog stream not connected".to_string()));
        };

        let mut slice = EventSlice::default();

        for _ in 0..POLL_BATCH {
            let event = match tokio::time::timeout(POLL_TIMEOUT, stream.next()).await {
                Err(_) => break, // idle
                Ok(None) => return Err(CdcError::Stream("binlog stream ended".to_string())),
                Ok(Some(event)) => event?,
            };

            let log_pos = event.header().log_pos() as u64;

            let data = match event.read_data() {
                Ok(Some(data)) => data,
                Ok(None) => {
                    if log_pos > 0 {
                        self.pos = log_pos;
                        slice.cursor = Some(self.cursor());
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable binlog event skipped");
                    continue;
                }
            };

            match data {
                EventData::RotateEvent(rotate) => {
                    // New file, typically pos 4; also sent as a fake event on
                    // connect. Following it keeps the cursor loss-free across
                    // server-side rotation.
                    self.file = rotate.name().to_string();
                    self.pos = rotate.position();
                    slice.cursor = Some(self.cursor());
                }
                EventData::RowsEvent(rows_event) => {
                    let table_id = rows_event.table_id();
                    if let Some(tme) = stream.get_tme(table_id) {
                        let table = tme.table_name().to_string();
                        if self.tables.contains_key(&table) {
                            // Decode against a borrowed tme, then update
                            // position bookkeeping.
                            let mut events = Vec::new();
                            self.decode_rows_event(&table, &rows_event, tme, &mut events)?;
                            slice.events.extend(events);
                        }
                    }
                    if log_pos > 0 {
                        self.pos = log_pos;
                    }
                    slice.cursor = Some(self.cursor());
                }
                _ => {
                    if log_pos > 0 {
                        self.pos = log_pos;
                        slice.cursor = Some(self.cursor());
                    }
                }
            }
        }

        self.stream = Some(stream);
        Ok(slice)
    }

    async fn acknowledge(&mut self, _cursor: &str) -> CdcResult<()> {
        // The binlog has no consumer acknowledgement; retention is governed
        // by the server's expire_logs configuration.
        Ok(())
    }
}
