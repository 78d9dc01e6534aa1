//! Init-load worker: one-shot bulk backfill for an empty target table
//!
//! One worker runs per mapping rule with an `init_query`. If the target table
//! already has rows the worker exits without doing anything; otherwise it
//! streams the query from the source and emits INIT events through the same
//! bus as binlog events. Backpressure is cooperative: when the bus drop
//! counter rises, the worker pauses until drops stabilise and re-publishes.

use crate::bus::{Message, MessageBus};
use crate::config::{DatabaseConfig, MappingRule};
use crate::connection::{opts_for, ConnectionPool};
use crate::error::{EtlError, EtlResult};
use crate::events::{Row, RowEvent};
use crate::monitoring::metrics::{ERRORS_TOTAL, INIT_ROWS_TOTAL};
use crate::sql::{build_emptiness_probe, value_to_json};
use futures_util::TryStreamExt;
use mysql_async::prelude::*;
use mysql_async::Conn;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to wait between drop-counter samples while backing off
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(200);

pub struct InitLoadContext {
    pub rule: Arc<MappingRule>,
    pub source_config: DatabaseConfig,
    /// Pool connection name used for the target emptiness probe
    pub probe_name: String,
    pub pool: Arc<ConnectionPool>,
    pub bus: Arc<MessageBus>,
    pub token: CancellationToken,
}

/// Handle to a running init-load worker
pub struct InitLoadWorker {
    pub mapping_key: String,
    running: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
    rows_published: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl InitLoadWorker {
    pub fn spawn(ctx: InitLoadContext) -> Self {
        let mapping_key = ctx.rule.key.clone();
        let running = Arc::new(AtomicBool::new(true));
        let completed = Arc::new(AtomicBool::new(false));
        let rows_published = Arc::new(AtomicU64::new(0));

        let runtime = InitLoadRuntime {
            ctx,
            running: Arc::clone(&running),
            completed: Arc::clone(&completed),
            rows_published: Arc::clone(&rows_published),
        };
        let handle = tokio::spawn(async move { runtime.run().await });

        Self {
            mapping_key,
            running,
            completed,
            rows_published,
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed) && !self.handle.is_finished()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn rows_published(&self) -> u64 {
        self.rows_published.load(Ordering::Relaxed)
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(mapping = %self.mapping_key, "init-load task panicked: {e}");
        }
    }
}

struct InitLoadRuntime {
    ctx: InitLoadContext,
    running: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
    rows_published: Arc<AtomicU64>,
}

impl InitLoadRuntime {
    async fn run(self) {
        let key = self.ctx.rule.key.clone();
        match self.load().await {
            Ok(rows) => {
                self.completed.store(true, Ordering::Relaxed);
                info!(mapping = %key, rows, "init load finished");
            }
            Err(e) => {
                error!(mapping = %key, error = %e, "init load failed");
                ERRORS_TOTAL
                    .with_label_values(&[e.kind(), "init_load"])
                    .inc();
            }
        }
        self.running.store(false, Ordering::Relaxed);
    }

    async fn load(&self) -> EtlResult<u64> {
        let rule = &self.ctx.rule;
        let query = rule
            .init_query
            .as_deref()
            .ok_or_else(|| EtlError::config(format!("mapping '{}' has no init_query", rule.key)))?;

        // A non-empty target means a previous run already populated it.
        let probe = build_emptiness_probe(&rule.target_table);
        match self.ctx.pool.query_has_rows(&self.ctx.probe_name, &probe).await {
            Ok(true) => {
                info!(
                    mapping = %rule.key,
                    target_table = %rule.target_table,
                    "target table not empty, skipping init load"
                );
                return Ok(0);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    mapping = %rule.key,
                    error = %e,
                    "emptiness probe failed, proceeding with init load"
                );
            }
        }

        info!(mapping = %rule.key, source = %rule.source_name, "starting init load");

        let mut conn = Conn::new(opts_for(&self.ctx.source_config)).await?;
        let mut published = 0u64;

        {
            let mut result = conn.query_iter(query).await?;
            let mut stream = result
                .stream::<mysql_async::Row>()
                .await?
                .ok_or_else(|| EtlError::generic("init query returned no result set"))?;

            while let Some(row) = stream.try_next().await? {
                if self.ctx.token.is_cancelled() {
                    info!(mapping = %rule.key, "shutdown requested, stopping init load");
                    return Ok(published);
                }

                let row = mysql_row_to_json(row);
                let event = RowEvent::init(&rule.source_name, &rule.schema, &rule.table, row);
                self.publish_with_backpressure(event).await?;

                published += 1;
                self.rows_published.store(published, Ordering::Relaxed);
                INIT_ROWS_TOTAL.with_label_values(&[&rule.key]).inc();
            }
        }

        conn.disconnect().await?;
        Ok(published)
    }

    /// Publish one INIT event, pausing while the bus is saturated.
    ///
    /// Drops are detected through the shared drop counter; each pause lasts
    /// until the counter stops moving, then the event is re-published.
    async fn publish_with_backpressure(&self, event: RowEvent) -> EtlResult<()> {
        let rule = &self.ctx.rule;
        let stats = self.ctx.bus.stats();

        loop {
            let message =
                Message::event(&rule.source_name, &rule.target_name, &rule.key, event.clone());
            if !self.ctx.bus.publish(message).is_dropped() {
                return Ok(());
            }

            debug!(mapping = %rule.key, "bus saturated, pausing init load");
            let mut last_dropped = stats.dropped();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(BACKPRESSURE_PAUSE) => {}
                    _ = self.ctx.token.cancelled() => {
                        return Err(EtlError::bus("shutdown while waiting for bus capacity"));
                    }
                }
                let dropped = stats.dropped();
                if dropped == last_dropped {
                    break;
                }
                last_dropped = dropped;
            }
        }
    }
}

/// Convert a result-set row into the canonical JSON row form
fn mysql_row_to_json(row: mysql_async::Row) -> Row {
    let names: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().into_owned())
        .collect();
    let values = row.unwrap();

    let mut out = Row::new();
    for (name, value) in names.into_iter().zip(values.into_iter()) {
        out.insert(name, value_to_json(value));
    }
    out
}
