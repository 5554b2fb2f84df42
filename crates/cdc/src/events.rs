//! Row events and the delta decode rules.

use gleaner_core::config::WatchedTables;
use gleaner_registry::RefDelta;
use std::collections::BTreeMap;

/// Row-level operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// One decoded row change from the replication stream.
///
/// Column maps hold the decoded string image of each column; `None` marks a
/// SQL NULL. For inserts `old` is empty, for deletes `new` is empty.
#[derive(Clone, Debug)]
pub struct RowEvent {
    pub table: String,
    pub op: RowOp,
    pub old: BTreeMap<String, Option<String>>,
    pub new: BTreeMap<String, Option<String>>,
}

/// A slice of stream progress: decoded events plus the position reached.
///
/// `cursor` covers everything read this poll, including changes on unwatched
/// tables that decoded to nothing, so the checkpoint keeps advancing (and the
/// server keeps releasing log) even when watched tables are quiet.
#[derive(Clone, Debug, Default)]
pub struct EventSlice {
    pub events: Vec<RowEvent>,
    /// Position after the last change read; `None` when nothing was read.
    pub cursor: Option<String>,
}

fn non_empty<'a>(
    columns: &'a BTreeMap<String, Option<String>>,
    name: &str,
) -> Option<&'a str> {
    columns
        .get(name)
        .and_then(|v| v.as_deref())
        .filter(|v| !v.is_empty())
}

/// Decode a row event into registry deltas per the watched columns.
///
/// - INSERT: `+1` for each watched column whose new value is non-empty.
/// - DELETE: `-1` for each watched column whose old value is non-empty.
/// - UPDATE: for each watched column with `old != new`, `-1` on the old value
///   then `+1` on the new value (order preserved within the row).
///
/// Events on tables outside the watched set decode to nothing.
pub fn decode_event(tables: &WatchedTables, event: &RowEvent) -> Vec<RefDelta> {
    let Some(columns) = tables.get(&event.table) else {
        return Vec::new();
    };

    let mut deltas = Vec::new();
    for column in columns {
        let (table, column) = (event.table.as_str(), column.as_str());
        match event.op {
            RowOp::Insert => {
                if let Some(value) = non_empty(&event.new, column) {
                    deltas.push(RefDelta::increment(value, table, column));
                }
            }
            RowOp::Delete => {
                if let Some(value) = non_empty(&event.old, column) {
                    deltas.push(RefDelta::decrement(value, table, column));
                }
            }
            RowOp::Update => {
                let old = non_empty(&event.old, column);
                let new = non_empty(&event.new, column);
                if old == new {
                    continue;
                }
                if let Some(old) = old {
                    deltas.push(RefDelta::decrement(old, table, column));
                }
                if let Some(new) = new {
                    deltas.push(RefDelta::increment(new, table, column));
                }
            }
        }
    }
    deltas
}
