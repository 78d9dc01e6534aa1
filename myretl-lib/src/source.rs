//! Source worker: tails one MySQL binlog and publishes row events
//!
//! Each configured source gets one worker that owns a binlog replication
//! session. Row events are translated into the canonical [`RowEvent`] form and
//! fanned out once per matching mapping rule, each publish tagged with that
//! rule's target routing key. The worker neither filters nor transforms —
//! that work belongs to the target side.
//!
//! State machine: `Connecting → Streaming → (Reconnecting ↔ Streaming) →
//! Stopped | Failed`. Connection failures back off exponentially (capped at
//! 30s); five consecutive failures mark the worker `Failed`, which the
//! supervisor escalates to a global shutdown.

use crate::bus::{Message, MessageBus};
use crate::config::{DatabaseConfig, MappingRule, ReplicationConfig};
use crate::connection::opts_for;
use crate::error::{EtlError, EtlResult};
use crate::events::RowEvent;
use crate::monitoring::metrics::SOURCE_CONNECTION_STATUS;
use crate::retry::{is_connection_error, ConnectRetryConfig};
use crate::sql::value_to_json;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData, TableMapEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a blocked binlog read may run before the shutdown flag is
/// re-checked. Binlog heartbeats normally return control sooner.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum spacing between bus-overflow warnings per source
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Source worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceState {
    Connecting = 0,
    Streaming = 1,
    Reconnecting = 2,
    Stopped = 3,
    Failed = 4,
}

impl SourceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SourceState::Connecting,
            1 => SourceState::Streaming,
            2 => SourceState::Reconnecting,
            4 => SourceState::Failed,
            _ => SourceState::Stopped,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            SourceState::Connecting | SourceState::Streaming | SourceState::Reconnecting
        )
    }
}

/// Everything needed to (re)spawn a source worker
#[derive(Clone)]
pub struct SourceSpec {
    pub name: String,
    pub config: DatabaseConfig,
    pub replication: ReplicationConfig,
    /// Mapping rules fed by this source
    pub rules: Vec<Arc<MappingRule>>,
}

/// Handle to a running source worker
pub struct SourceWorker {
    pub name: String,
    state: Arc<AtomicU8>,
    events_processed: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl SourceWorker {
    pub fn spawn(spec: SourceSpec, bus: Arc<MessageBus>, token: CancellationToken) -> Self {
        let name = spec.name.clone();
        let state = Arc::new(AtomicU8::new(SourceState::Connecting as u8));
        let events_processed = Arc::new(AtomicU64::new(0));

        let runtime = SourceRuntime {
            spec,
            bus,
            token,
            state: Arc::clone(&state),
            events_processed: Arc::clone(&events_processed),
            schema_cache: HashMap::new(),
            last_drop_warn: None,
        };

        let handle = tokio::spawn(async move { runtime.run().await });

        Self {
            name,
            state,
            events_processed,
            handle,
        }
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running() && !self.handle.is_finished()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(source = %self.name, "source worker task panicked: {e}");
        }
    }
}

enum StreamExit {
    Shutdown,
}

struct SourceRuntime {
    spec: SourceSpec,
    bus: Arc<MessageBus>,
    token: CancellationToken,
    state: Arc<AtomicU8>,
    events_processed: Arc<AtomicU64>,
    /// (schema, table) → ordered column names, from information_schema
    schema_cache: HashMap<(String, String), Vec<String>>,
    last_drop_warn: Option<Instant>,
}

impl SourceRuntime {
    fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Relaxed);
        SOURCE_CONNECTION_STATUS
            .with_label_values(&[&self.spec.name])
            .set(if state == SourceState::Streaming { 1.0 } else { 0.0 });
    }

    /// Routing index: (schema, table) → rules
    fn build_routes(&self) -> HashMap<(String, String), Vec<Arc<MappingRule>>> {
        let mut routes: HashMap<(String, String), Vec<Arc<MappingRule>>> = HashMap::new();
        for rule in &self.spec.rules {
            routes
                .entry((rule.schema.clone(), rule.table.clone()))
                .or_default()
                .push(Arc::clone(rule));
        }
        routes
    }

    async fn run(mut self) {
        let name = self.spec.name.clone();
        info!(source = %name, server_id = self.spec.replication.server_id, "source worker starting");

        let routes = self.build_routes();
        let retry = ConnectRetryConfig::default();
        let mut backoff = retry.to_backoff();
        let mut consecutive_failures = 0u32;

        loop {
            if self.token.is_cancelled() {
                self.set_state(SourceState::Stopped);
                break;
            }

            self.set_state(if consecutive_failures == 0 {
                SourceState::Connecting
            } else {
                SourceState::Reconnecting
            });

            match self.open_stream().await {
                Ok((stream, meta, file, pos)) => {
                    consecutive_failures = 0;
                    backoff.reset();
                    self.set_state(SourceState::Streaming);
                    info!(source = %name, binlog_file = %file, binlog_pos = pos, "streaming binlog events");

                    match self.stream_events(stream, meta, file, pos, &routes).await {
                        Ok(StreamExit::Shutdown) => {
                            self.set_state(SourceState::Stopped);
                            break;
                        }
                        Err(e) if is_connection_error(&e) => {
                            warn!(source = %name, error = %e, "binlog stream lost, reconnecting");
                            self.set_state(SourceState::Reconnecting);
                        }
                        Err(e) => {
                            error!(source = %name, error = %e, "binlog stream error, reconnecting");
                            self.set_state(SourceState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= retry.max_attempts {
                        error!(
                            source = %name,
                            attempts = consecutive_failures,
                            error = %e,
                            "giving up connecting to source"
                        );
                        self.set_state(SourceState::Failed);
                        break;
                    }
                    let delay = backoff.next_backoff().unwrap_or(retry.max_delay);
                    warn!(
                        source = %name,
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "source connect failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.token.cancelled() => {
                            self.set_state(SourceState::Stopped);
                            return;
                        }
                    }
                }
            }
        }

        info!(source = %name, events = self.events_processed.load(Ordering::Relaxed), "source worker finished");
    }

    /// Open the metadata connection, resolve the starting position, and open
    /// the binlog stream.
    async fn open_stream(&self) -> EtlResult<(BinlogStream, Conn, String, u64)> {
        let opts = opts_for(&self.spec.config);
        let mut meta = Conn::new(opts.clone()).await?;

        let (file, pos) = match &self.spec.replication.log_file {
            Some(file) => (file.clone(), self.spec.replication.log_pos),
            None => master_status(&mut meta).await?,
        };

        let conn = Conn::new(opts).await?;
        let request = BinlogStreamRequest::new(self.spec.replication.server_id)
            .with_filename(file.as_bytes())
            .with_pos(pos);
        let stream = conn.get_binlog_stream(request).await?;

        Ok((stream, meta, file, pos))
    }

    async fn stream_events(
        &mut self,
        mut stream: BinlogStream,
        mut meta: Conn,
        mut current_file: String,
        mut current_pos: u64,
        routes: &HashMap<(String, String), Vec<Arc<MappingRule>>>,
    ) -> EtlResult<StreamExit> {
        loop {
            // Shutdown flag is observed at every event boundary; the read
            // timeout bounds how long an idle stream can defer that check.
            if self.token.is_cancelled() {
                return Ok(StreamExit::Shutdown);
            }

            let event = match tokio::time::timeout(IDLE_READ_TIMEOUT, stream.next()).await {
                Err(_) => continue,
                Ok(None) => return Err(EtlError::replication("binlog stream closed by server")),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(event))) => event,
            };

            let header = event.header();
            if header.log_pos() > 0 {
                current_pos = u64::from(header.log_pos());
            }
            let timestamp = header.timestamp();

            let data = match event.read_data() {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    warn!(source = %self.spec.name, error = %e, "undecodable binlog event skipped");
                    continue;
                }
            };

            match data {
                EventData::RotateEvent(rotate) => {
                    current_file = rotate.name().to_string();
                    current_pos = rotate.position();
                    debug!(source = %self.spec.name, binlog_file = %current_file, "binlog rotated");
                }
                EventData::RowsEvent(rows) => {
                    let Some(tme) = stream.get_tme(rows.table_id()) else {
                        continue;
                    };
                    let schema = tme.database_name().to_string();
                    let table = tme.table_name().to_string();
                    let Some(rules) = routes.get(&(schema.clone(), table.clone())) else {
                        continue;
                    };

                    let columns = match self.columns_for(&mut meta, &schema, &table).await {
                        Ok(columns) => columns,
                        Err(e) => {
                            warn!(
                                source = %self.spec.name,
                                schema = %schema,
                                table = %table,
                                error = %e,
                                "cannot resolve column names, skipping rows event"
                            );
                            continue;
                        }
                    };

                    let events = decode_rows_event(
                        &self.spec.name,
                        &schema,
                        &table,
                        &rows,
                        tme,
                        &columns,
                    );

                    for mut event in events {
                        event = event
                            .with_position(&current_file, current_pos)
                            .with_server_id(self.spec.replication.server_id)
                            .with_timestamp(timestamp);
                        self.fan_out(rules, event);
                    }
                }
                _ => {}
            }
        }
    }

    /// Publish one event per matching mapping rule, each with its own routing
    /// key. The bus never blocks; drops are counted and logged with rate
    /// limiting.
    fn fan_out(&mut self, rules: &[Arc<MappingRule>], event: RowEvent) {
        for rule in rules {
            let message = Message::event(
                &self.spec.name,
                &rule.target_name,
                &rule.key,
                event.clone(),
            );
            let outcome = self.bus.publish(message);
            if outcome.is_dropped() {
                let now = Instant::now();
                let should_warn = self
                    .last_drop_warn
                    .map(|at| now.duration_since(at) >= DROP_WARN_INTERVAL)
                    .unwrap_or(true);
                if should_warn {
                    self.last_drop_warn = Some(now);
                    warn!(
                        source = %self.spec.name,
                        target = %rule.target_name,
                        dropped_total = self.bus.stats().dropped(),
                        "bus full, dropping row events"
                    );
                }
            }
        }
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Binlog row events carry no column names; they come from
    /// information_schema, cached per (schema, table).
    async fn columns_for(
        &mut self,
        meta: &mut Conn,
        schema: &str,
        table: &str,
    ) -> EtlResult<Vec<String>> {
        let key = (schema.to_string(), table.to_string());
        if let Some(columns) = self.schema_cache.get(&key) {
            return Ok(columns.clone());
        }
        let columns: Vec<String> = meta
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await?;
        if columns.is_empty() {
            return Err(EtlError::schema(format!(
                "table {schema}.{table} has no columns in information_schema"
            )));
        }
        self.schema_cache.insert(key, columns.clone());
        Ok(columns)
    }
}

/// Read the current binlog file and position
async fn master_status(conn: &mut Conn) -> EtlResult<(String, u64)> {
    let row: Option<mysql_async::Row> = conn.query_first("SHOW MASTER STATUS").await?;
    let row = row.ok_or_else(|| {
        EtlError::replication("SHOW MASTER STATUS returned nothing; is binlog enabled?")
    })?;
    let file: String = row
        .get(0)
        .ok_or_else(|| EtlError::replication("master status is missing the binlog file"))?;
    let pos: u64 = row
        .get(1)
        .ok_or_else(|| EtlError::replication("master status is missing the binlog position"))?;
    Ok((file, pos))
}

/// Translate one binlog rows event into canonical row events
fn decode_rows_event(
    source_name: &str,
    schema: &str,
    table: &str,
    rows: &RowsEventData<'_>,
    tme: &TableMapEvent<'_>,
    columns: &[String],
) -> Vec<RowEvent> {
    let mut events = Vec::new();

    match rows {
        RowsEventData::WriteRowsEvent(_)
        | RowsEventData::WriteRowsEventV1(_)
        | RowsEventData::UpdateRowsEvent(_)
        | RowsEventData::UpdateRowsEventV1(_)
        | RowsEventData::DeleteRowsEvent(_)
        | RowsEventData::DeleteRowsEventV1(_) => {}
        _ => return events,
    }

    for row in rows.rows(tme) {
        let (before, after) = match row {
            Ok(pair) => pair,
            Err(e) => {
                warn!(source = source_name, schema, table, error = %e, "undecodable row skipped");
                continue;
            }
        };

        let event = match (before, after) {
            (None, Some(after)) => Some(RowEvent::insert(
                source_name,
                schema,
                table,
                binlog_row_to_json(after, columns),
            )),
            (Some(before), Some(after)) => Some(RowEvent::update(
                source_name,
                schema,
                table,
                binlog_row_to_json(before, columns),
                binlog_row_to_json(after, columns),
            )),
            (Some(before), None) => Some(RowEvent::delete(
                source_name,
                schema,
                table,
                binlog_row_to_json(before, columns),
            )),
            (None, None) => None,
        };

        if let Some(event) = event {
            events.push(event);
        }
    }

    events
}

/// Convert a decoded binlog row into the canonical JSON row form
fn binlog_row_to_json(mut row: BinlogRow, columns: &[String]) -> crate::events::Row {
    let mut out = crate::events::Row::new();
    for index in 0..row.len() {
        let name = columns
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("col_{index}"));
        let value = match row.take(index) {
            Some(BinlogValue::Value(value)) => value_to_json(value),
            // JSON columns and partial JSON diffs are not decoded
            Some(_) => serde_json::Value::Null,
            None => serde_json::Value::Null,
        };
        out.insert(name, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            SourceState::Connecting,
            SourceState::Streaming,
            SourceState::Reconnecting,
            SourceState::Stopped,
            SourceState::Failed,
        ] {
            assert_eq!(SourceState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_running_states() {
        assert!(SourceState::Connecting.is_running());
        assert!(SourceState::Streaming.is_running());
        assert!(SourceState::Reconnecting.is_running());
        assert!(!SourceState::Stopped.is_running());
        assert!(!SourceState::Failed.is_running());
    }
}
