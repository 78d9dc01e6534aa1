//! Canonical row events carried on the message bus
//!
//! Every binlog row change and every init-load row is converted into a
//! [`RowEvent`] before it leaves the worker that produced it. Target workers
//! only ever see this canonical form.

use serde::{Deserialize, Serialize};

/// Ordered column-name → value map for a single row.
///
/// `serde_json`'s map preserves insertion order (the `preserve_order`
/// feature), which keeps generated column lists stable.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Kinds of row events flowing through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// Bulk backfill row emitted by an init-load worker. Same shape as Insert.
    Init,
}

impl EventKind {
    /// Label used for metrics and structured logs
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Init => "init",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position within the source's binary log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub pos: u64,
}

/// A single row change in canonical form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowEvent {
    pub kind: EventKind,
    pub source_name: String,
    pub schema: String,
    pub table: String,
    /// Row image for INSERT/DELETE/INIT
    #[serde(default)]
    pub values: Option<Row>,
    /// Before image for UPDATE
    #[serde(default)]
    pub before_values: Option<Row>,
    /// After image for UPDATE
    #[serde(default)]
    pub after_values: Option<Row>,
    #[serde(default)]
    pub binlog_position: Option<BinlogPosition>,
    #[serde(default)]
    pub server_id: Option<u32>,
    /// Binlog header timestamp (unix seconds), if any
    #[serde(default)]
    pub timestamp: Option<u32>,
    /// Short id for log correlation
    pub event_id: String,
}

/// 8-char display form of a fresh UUID, enough to correlate log lines
fn next_event_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

impl RowEvent {
    pub fn insert(source_name: &str, schema: &str, table: &str, values: Row) -> Self {
        Self::single(EventKind::Insert, source_name, schema, table, values)
    }

    pub fn delete(source_name: &str, schema: &str, table: &str, values: Row) -> Self {
        Self::single(EventKind::Delete, source_name, schema, table, values)
    }

    pub fn init(source_name: &str, schema: &str, table: &str, values: Row) -> Self {
        Self::single(EventKind::Init, source_name, schema, table, values)
    }

    pub fn update(
        source_name: &str,
        schema: &str,
        table: &str,
        before_values: Row,
        after_values: Row,
    ) -> Self {
        Self {
            kind: EventKind::Update,
            source_name: source_name.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            values: None,
            before_values: Some(before_values),
            after_values: Some(after_values),
            binlog_position: None,
            server_id: None,
            timestamp: None,
            event_id: next_event_id(),
        }
    }

    fn single(kind: EventKind, source_name: &str, schema: &str, table: &str, values: Row) -> Self {
        Self {
            kind,
            source_name: source_name.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            values: Some(values),
            before_values: None,
            after_values: None,
            binlog_position: None,
            server_id: None,
            timestamp: None,
            event_id: next_event_id(),
        }
    }

    pub fn with_position(mut self, file: &str, pos: u64) -> Self {
        self.binlog_position = Some(BinlogPosition {
            file: file.to_string(),
            pos,
        });
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Row image the mapping filter is evaluated against.
    ///
    /// For UPDATE this is the after image; everything else carries a single
    /// image in `values`.
    pub fn filter_image(&self) -> Option<&Row> {
        match self.kind {
            EventKind::Update => self.after_values.as_ref(),
            _ => self.values.as_ref(),
        }
    }
}
