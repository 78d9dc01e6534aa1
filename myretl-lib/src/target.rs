//! Target worker: consumes routed events and applies them to one target DB
//!
//! A target worker is the only writer for its target connection, which is
//! what delivers per-table ordering without locks: events for the same
//! primary key are applied in arrival order because they flow through one
//! queue into one single-threaded consumer.
//!
//! Processing per event: ensure the connection is live, evaluate the
//! mapping's filter, apply column transforms, then either accumulate the row
//! for a batch upsert (INSERT/UPDATE/INIT) or flush and delete (DELETE).
//! A ticker fires time-based flushes so quiet tables still drain within the
//! flush interval.

use crate::batch::{BatchAccumulator, BatchSlot};
use crate::bus::{BusSubscriber, ControlSignal, Message, MessagePayload};
use crate::config::MappingRule;
use crate::connection::ConnectionPool;
use crate::error::EtlResult;
use crate::events::{EventKind, Row, RowEvent};
use crate::monitoring::metrics::{
    BATCH_FLUSHES_TOTAL, BATCH_FLUSH_ROWS, ERRORS_TOTAL, EVENTS_FILTERED_TOTAL,
    EVENTS_PROCESSED_TOTAL,
};
use crate::sql;
use crate::transform::TransformRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cap on the best-effort final flush during shutdown
const SHUTDOWN_FLUSH_CAP: Duration = Duration::from_secs(5);

/// Why an event did not produce a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The mapping filter rejected the row
    Filtered,
    /// The event was missing the row image its kind requires
    NoImage,
}

/// Decision for one routed event
#[derive(Debug)]
pub enum EventAction {
    Skip(SkipReason),
    /// Accumulate the transformed row for a batch upsert
    Upsert(Row),
    /// Flush the rule's batch, then delete by primary key
    Delete(Row),
    /// UPDATE whose before-image passed the filter but whose after-image does
    /// not: the row left the filtered set and is removed from the target
    DeleteFiltered(Row),
}

/// Pure per-event decision: filter, transform, classify.
///
/// This is the entire write-side semantics of a target worker minus I/O,
/// which keeps it testable without a server.
pub fn plan_event(
    rule: &MappingRule,
    event: &RowEvent,
    registry: &TransformRegistry,
) -> EtlResult<EventAction> {
    let source_table = format!("{}.{}", event.schema, event.table);

    match event.kind {
        EventKind::Insert | EventKind::Init => {
            let Some(values) = &event.values else {
                return Ok(EventAction::Skip(SkipReason::NoImage));
            };
            if let Some(filter) = &rule.filter {
                if !filter.matches(values) {
                    return Ok(EventAction::Skip(SkipReason::Filtered));
                }
            }
            let row = registry.apply_columns(values, &rule.columns, &source_table)?;
            Ok(EventAction::Upsert(row))
        }
        EventKind::Update => {
            let Some(after) = &event.after_values else {
                return Ok(EventAction::Skip(SkipReason::NoImage));
            };
            if let Some(filter) = &rule.filter {
                let after_passes = filter.matches(after);
                let before_passed = event
                    .before_values
                    .as_ref()
                    .map(|before| filter.matches(before))
                    .unwrap_or(false);
                if !after_passes {
                    if before_passed {
                        // Row moved out of the filtered set
                        let before = event.before_values.as_ref().expect("checked above");
                        let row = registry.apply_columns(before, &rule.columns, &source_table)?;
                        return Ok(EventAction::DeleteFiltered(row));
                    }
                    return Ok(EventAction::Skip(SkipReason::Filtered));
                }
            }
            let row = registry.apply_columns(after, &rule.columns, &source_table)?;
            Ok(EventAction::Upsert(row))
        }
        EventKind::Delete => {
            let Some(values) = &event.values else {
                return Ok(EventAction::Skip(SkipReason::NoImage));
            };
            if let Some(filter) = &rule.filter {
                if !filter.matches(values) {
                    return Ok(EventAction::Skip(SkipReason::Filtered));
                }
            }
            let row = registry.apply_columns(values, &rule.columns, &source_table)?;
            Ok(EventAction::Delete(row))
        }
    }
}

/// Counters shared with the supervisor's health loop
#[derive(Debug, Default)]
pub struct TargetStats {
    pub events_processed: AtomicU64,
    pub events_filtered: AtomicU64,
    pub errors: AtomicU64,
    pub flushes: AtomicU64,
    pub rows_written: AtomicU64,
}

/// Everything a target worker needs at spawn time
pub struct TargetContext {
    pub name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub pool: Arc<ConnectionPool>,
    pub registry: Arc<TransformRegistry>,
    /// Mapping rules addressed to this target, by mapping key
    pub rules: HashMap<String, Arc<MappingRule>>,
    pub subscriber: BusSubscriber,
    pub token: CancellationToken,
}

/// Handle to a running target worker
pub struct TargetWorker {
    pub name: String,
    stats: Arc<TargetStats>,
    handle: JoinHandle<()>,
}

impl TargetWorker {
    pub fn spawn(ctx: TargetContext) -> Self {
        let TargetContext {
            name,
            batch_size,
            flush_interval,
            pool,
            registry,
            rules,
            subscriber,
            token,
        } = ctx;

        let stats = Arc::new(TargetStats::default());
        let runner = TargetRunner {
            name: name.clone(),
            batch_size: batch_size.max(1),
            flush_interval,
            pool,
            registry,
            rules,
            token,
            stats: Arc::clone(&stats),
            accumulator: BatchAccumulator::new(),
        };
        let handle = tokio::spawn(async move { runner.run(subscriber).await });
        Self {
            name,
            stats,
            handle,
        }
    }

    pub fn stats(&self) -> Arc<TargetStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(target_name = %self.name, "target worker task panicked: {e}");
        }
    }
}

struct TargetRunner {
    name: String,
    batch_size: usize,
    flush_interval: Duration,
    pool: Arc<ConnectionPool>,
    registry: Arc<TransformRegistry>,
    rules: HashMap<String, Arc<MappingRule>>,
    token: CancellationToken,
    stats: Arc<TargetStats>,
    accumulator: BatchAccumulator,
}

impl TargetRunner {
    async fn run(mut self, mut subscriber: BusSubscriber) {
        info!(
            target_name = %self.name,
            batch_size = self.batch_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            rules = self.rules.len(),
            "target worker starting"
        );

        let token = self.token.clone();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!(target_name = %self.name, "target worker received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.flush_due().await;
                }

                message = subscriber.recv() => {
                    match message {
                        None => {
                            info!(target_name = %self.name, "bus channel closed");
                            break;
                        }
                        Some(message) => {
                            if !self.handle_message(message).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Best-effort final flush, capped so shutdown stays bounded
        let slots = self.accumulator.take_all();
        if !slots.is_empty() {
            let pending: usize = slots.iter().map(BatchSlot::len).sum();
            info!(target_name = %self.name, pending, "flushing remaining batches before exit");
            let drain = async {
                for slot in slots {
                    self.flush_slot(slot, "shutdown").await;
                }
            };
            if tokio::time::timeout(SHUTDOWN_FLUSH_CAP, drain).await.is_err() {
                warn!(
                    target_name = %self.name,
                    "final flush exceeded its deadline, remaining rows dropped"
                );
            }
        }

        info!(
            target_name = %self.name,
            events = self.stats.events_processed.load(Ordering::Relaxed),
            "target worker finished"
        );
    }

    /// Returns false when the worker should exit
    async fn handle_message(&mut self, message: Message) -> bool {
        match message.payload {
            MessagePayload::Control(ControlSignal::Shutdown) => {
                info!(target_name = %self.name, from = %message.source, "shutdown message received");
                false
            }
            MessagePayload::Control(ControlSignal::Healthcheck) => {
                if let Err(e) = self.pool.ensure(&self.name).await {
                    warn!(target_name = %self.name, error = %e, "healthcheck ping failed");
                }
                true
            }
            MessagePayload::Event { mapping_key, event } => {
                self.handle_event(&mapping_key, event).await;
                true
            }
        }
    }

    async fn handle_event(&mut self, mapping_key: &str, event: RowEvent) {
        let Some(rule) = self.rules.get(mapping_key).cloned() else {
            warn!(
                target_name = %self.name,
                mapping_key,
                "event for unknown mapping rule dropped"
            );
            return;
        };

        // A dead connection is re-established here once; if the target is
        // still unreachable the flush path retries with its own policy.
        if let Err(e) = self.pool.ensure(&self.name).await {
            warn!(target_name = %self.name, error = %e, "target connection unavailable");
        }

        let action = match plan_event(&rule, &event, &self.registry) {
            Ok(action) => action,
            Err(e) => {
                warn!(
                    target_name = %self.name,
                    event_id = %event.event_id,
                    table = %event.table,
                    error = %e,
                    "event dropped"
                );
                ERRORS_TOTAL
                    .with_label_values(&[e.kind(), "target_worker"])
                    .inc();
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match action {
            EventAction::Skip(SkipReason::Filtered) => {
                debug!(
                    target_name = %self.name,
                    event_id = %event.event_id,
                    "event filtered out"
                );
                EVENTS_FILTERED_TOTAL.with_label_values(&[&self.name]).inc();
                self.stats.events_filtered.fetch_add(1, Ordering::Relaxed);
            }
            EventAction::Skip(SkipReason::NoImage) => {
                warn!(
                    target_name = %self.name,
                    event_id = %event.event_id,
                    kind = %event.kind,
                    "event without a row image dropped"
                );
                ERRORS_TOTAL
                    .with_label_values(&["schema", "target_worker"])
                    .inc();
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
            EventAction::Upsert(row) => {
                let size = self.accumulator.push(&rule, row);
                self.count_event(&event);
                if size >= self.batch_size {
                    self.flush_rule(&rule.key, "size").await;
                }
            }
            EventAction::Delete(row) | EventAction::DeleteFiltered(row) => {
                // Deletes are a barrier: pending upserts for the rule are
                // applied first so ordering per primary key holds.
                self.flush_rule(&rule.key, "delete").await;
                self.execute_delete(&rule, &row).await;
                self.count_event(&event);
            }
        }
    }

    fn count_event(&self, event: &RowEvent) {
        EVENTS_PROCESSED_TOTAL
            .with_label_values(&[event.kind.as_str(), &self.name])
            .inc();
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn execute_delete(&self, rule: &MappingRule, row: &Row) {
        let Some(pk_value) = row.get(&rule.primary_key) else {
            warn!(
                target_name = %self.name,
                mapping = %rule.key,
                primary_key = %rule.primary_key,
                "delete without a primary key value dropped"
            );
            ERRORS_TOTAL
                .with_label_values(&["schema", "target_worker"])
                .inc();
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let (sql, params) = sql::build_delete(&rule.target_table, &rule.primary_key, pk_value);
        match self.pool.execute_with_retry(&self.name, &sql, params).await {
            Ok(affected) => {
                debug!(
                    target_name = %self.name,
                    table = %rule.target_table,
                    affected,
                    "delete applied"
                );
            }
            Err(e) => {
                error!(
                    target_name = %self.name,
                    table = %rule.target_table,
                    error = %e,
                    "delete failed"
                );
                ERRORS_TOTAL
                    .with_label_values(&[e.kind(), "target_worker"])
                    .inc();
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn flush_rule(&mut self, mapping_key: &str, reason: &str) {
        if let Some(slot) = self.accumulator.take(mapping_key) {
            self.flush_slot(slot, reason).await;
        }
    }

    async fn flush_due(&mut self) {
        for slot in self.accumulator.take_due(self.flush_interval) {
            self.flush_slot(slot, "age").await;
        }
    }

    /// Write one batch slot as a single multi-row upsert.
    ///
    /// Failures after the retry policy drop the batch: per-event errors never
    /// halt the worker, they are logged and counted.
    async fn flush_slot(&self, slot: BatchSlot, reason: &str) {
        let rows = slot.len();
        let (sql, params) =
            match sql::build_batch_upsert(&slot.target_table, slot.rows(), &slot.primary_key) {
                Ok(built) => built,
                Err(e) => {
                    warn!(target_name = %self.name, error = %e, "unbuildable batch dropped");
                    return;
                }
            };

        match self.pool.execute_with_retry(&self.name, &sql, params).await {
            Ok(affected) => {
                debug!(
                    target_name = %self.name,
                    table = %slot.target_table,
                    rows,
                    affected,
                    reason,
                    "batch flushed"
                );
                BATCH_FLUSHES_TOTAL
                    .with_label_values(&[&self.name, reason])
                    .inc();
                BATCH_FLUSH_ROWS
                    .with_label_values(&[&self.name])
                    .observe(rows as f64);
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .rows_written
                    .fetch_add(rows as u64, Ordering::Relaxed);
            }
            Err(e) => {
                error!(
                    target_name = %self.name,
                    table = %slot.target_table,
                    rows,
                    error = %e,
                    "batch flush failed, dropping batch"
                );
                ERRORS_TOTAL
                    .with_label_values(&[e.kind(), "target_worker"])
                    .inc();
                self.stats.errors.fetch_add(rows as u64, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnSpec;
    use crate::filter::Predicate;
    use serde_json::json;

    fn copy_spec(column: &str) -> ColumnSpec {
        ColumnSpec {
            column: column.to_string(),
            primary_key: false,
            transform: None,
            value: None,
        }
    }

    fn rule(filter: Option<serde_json::Value>) -> MappingRule {
        MappingRule {
            key: "source1.users".to_string(),
            source_name: "source1".to_string(),
            table: "users".to_string(),
            schema: "shop".to_string(),
            target_name: "target1".to_string(),
            target_table: "users".to_string(),
            primary_key: "id".to_string(),
            columns: vec![
                ("id".to_string(), copy_spec("id")),
                ("status".to_string(), copy_spec("status")),
            ],
            filter: filter.map(|f| Predicate::parse(&f).unwrap()),
            init_query: None,
        }
    }

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        let mut r = Row::new();
        for (k, v) in pairs {
            r.insert(k.to_string(), v.clone());
        }
        r
    }

    #[test]
    fn test_insert_passes_filter() {
        let registry = TransformRegistry::with_builtins();
        let r = rule(Some(json!({"status": {"eq": "active"}})));
        let event = RowEvent::insert(
            "source1",
            "shop",
            "users",
            row(&[("id", json!(1)), ("status", json!("active"))]),
        );
        match plan_event(&r, &event, &registry).unwrap() {
            EventAction::Upsert(out) => assert_eq!(out.get("id"), Some(&json!(1))),
            other => panic!("expected upsert, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_filtered_out() {
        let registry = TransformRegistry::with_builtins();
        let r = rule(Some(json!({"status": {"eq": "active"}})));
        let event = RowEvent::insert(
            "source1",
            "shop",
            "users",
            row(&[("id", json!(1)), ("status", json!("blocked"))]),
        );
        assert!(matches!(
            plan_event(&r, &event, &registry).unwrap(),
            EventAction::Skip(SkipReason::Filtered)
        ));
    }

    #[test]
    fn test_update_leaving_filter_window_deletes() {
        let registry = TransformRegistry::with_builtins();
        let r = rule(Some(json!({"status": {"eq": "active"}})));
        let event = RowEvent::update(
            "source1",
            "shop",
            "users",
            row(&[("id", json!(1)), ("status", json!("active"))]),
            row(&[("id", json!(1)), ("status", json!("blocked"))]),
        );
        assert!(matches!(
            plan_event(&r, &event, &registry).unwrap(),
            EventAction::DeleteFiltered(_)
        ));
    }

    #[test]
    fn test_update_never_in_filter_window_skips() {
        let registry = TransformRegistry::with_builtins();
        let r = rule(Some(json!({"status": {"eq": "active"}})));
        let event = RowEvent::update(
            "source1",
            "shop",
            "users",
            row(&[("id", json!(1)), ("status", json!("blocked"))]),
            row(&[("id", json!(1)), ("status", json!("archived"))]),
        );
        assert!(matches!(
            plan_event(&r, &event, &registry).unwrap(),
            EventAction::Skip(SkipReason::Filtered)
        ));
    }

    #[test]
    fn test_delete_maps_to_delete_action() {
        let registry = TransformRegistry::with_builtins();
        let r = rule(None);
        let event = RowEvent::delete(
            "source1",
            "shop",
            "users",
            row(&[("id", json!(9)), ("status", json!("active"))]),
        );
        match plan_event(&r, &event, &registry).unwrap() {
            EventAction::Delete(out) => assert_eq!(out.get("id"), Some(&json!(9))),
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn test_init_behaves_like_insert() {
        let registry = TransformRegistry::with_builtins();
        let r = rule(None);
        let event = RowEvent::init(
            "source1",
            "shop",
            "users",
            row(&[("id", json!(5)), ("status", json!("active"))]),
        );
        assert!(matches!(
            plan_event(&r, &event, &registry).unwrap(),
            EventAction::Upsert(_)
        ));
    }

    #[test]
    fn test_missing_image_skips() {
        let registry = TransformRegistry::with_builtins();
        let r = rule(None);
        let mut event = RowEvent::insert("source1", "shop", "users", Row::new());
        event.values = None;
        assert!(matches!(
            plan_event(&r, &event, &registry).unwrap(),
            EventAction::Skip(SkipReason::NoImage)
        ));
    }
}
