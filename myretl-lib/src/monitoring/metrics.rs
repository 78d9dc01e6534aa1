//! Metrics collection for the replication pipeline
//!
//! Counters and gauges for event throughput, bus pressure, batch flushes and
//! connection health, collected into a dedicated Prometheus registry.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Registry,
};
use tracing::debug;

lazy_static! {
    /// Global metrics registry for all pipeline metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // Event throughput
    // =========================================================================

    /// Row events applied, by kind and target
    pub static ref EVENTS_PROCESSED_TOTAL: CounterVec = register_counter_vec!(
        "myretl_events_processed_total",
        "Row events applied to targets",
        &["event_type", "target"]
    ).expect("metric can be created");

    /// Row events dropped by a mapping filter
    pub static ref EVENTS_FILTERED_TOTAL: CounterVec = register_counter_vec!(
        "myretl_events_filtered_total",
        "Row events dropped by mapping filters",
        &["target"]
    ).expect("metric can be created");

    /// Errors by kind and component
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "myretl_errors_total",
        "Total number of errors by type",
        &["error_type", "component"]
    ).expect("metric can be created");

    // =========================================================================
    // Message bus
    // =========================================================================

    /// Messages accepted onto subscriber queues
    pub static ref BUS_PUBLISHED_TOTAL: Counter = register_counter!(
        "myretl_bus_published_total",
        "Messages accepted onto bus subscriber queues"
    ).expect("metric can be created");

    /// Messages dropped because a subscriber queue was full
    pub static ref BUS_DROPPED_TOTAL: Counter = register_counter!(
        "myretl_bus_dropped_total",
        "Messages dropped because a bus subscriber queue was full"
    ).expect("metric can be created");

    /// Current number of undelivered messages across all subscribers
    pub static ref BUS_QUEUE_DEPTH: Gauge = register_gauge!(
        "myretl_bus_queue_depth",
        "Undelivered messages across all bus subscriber queues"
    ).expect("metric can be created");

    /// Peak bus depth since startup
    pub static ref BUS_QUEUE_PEAK: Gauge = register_gauge!(
        "myretl_bus_queue_peak",
        "Peak undelivered message count since startup"
    ).expect("metric can be created");

    // =========================================================================
    // Target batching
    // =========================================================================

    /// Batch flushes, by target and trigger (size, age, delete, shutdown)
    pub static ref BATCH_FLUSHES_TOTAL: CounterVec = register_counter_vec!(
        "myretl_batch_flushes_total",
        "Batch flushes by target and trigger",
        &["target", "reason"]
    ).expect("metric can be created");

    /// Rows per batch flush
    pub static ref BATCH_FLUSH_ROWS: HistogramVec = register_histogram_vec!(
        "myretl_batch_flush_rows",
        "Rows written per batch flush",
        &["target"]
    ).expect("metric can be created");

    // =========================================================================
    // Connections and workers
    // =========================================================================

    /// Source binlog stream status (1 = streaming, 0 = down)
    pub static ref SOURCE_CONNECTION_STATUS: GaugeVec = register_gauge_vec!(
        "myretl_source_connection_status",
        "Binlog stream status per source",
        &["source"]
    ).expect("metric can be created");

    /// Target connection status (1 = healthy, 0 = down)
    pub static ref TARGET_CONNECTION_STATUS: GaugeVec = register_gauge_vec!(
        "myretl_target_connection_status",
        "Connection status per target",
        &["target"]
    ).expect("metric can be created");

    /// Rows published by init-load workers
    pub static ref INIT_ROWS_TOTAL: CounterVec = register_counter_vec!(
        "myretl_init_rows_total",
        "Rows published by init-load workers",
        &["mapping"]
    ).expect("metric can be created");

    // =========================================================================
    // Application
    // =========================================================================

    /// Application uptime
    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "myretl_uptime_seconds",
        "Application uptime in seconds"
    ).expect("metric can be created");

    /// Build information
    pub static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "myretl_build_info",
        "Build information",
        &["version"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY
        .register(Box::new(EVENTS_PROCESSED_TOTAL.clone()))
        .map_err(|e| format!("Failed to register EVENTS_PROCESSED_TOTAL: {e}"))?;

    REGISTRY
        .register(Box::new(EVENTS_FILTERED_TOTAL.clone()))
        .map_err(|e| format!("Failed to register EVENTS_FILTERED_TOTAL: {e}"))?;

    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .map_err(|e| format!("Failed to register ERRORS_TOTAL: {e}"))?;

    REGISTRY
        .register(Box::new(BUS_PUBLISHED_TOTAL.clone()))
        .map_err(|e| format!("Failed to register BUS_PUBLISHED_TOTAL: {e}"))?;

    REGISTRY
        .register(Box::new(BUS_DROPPED_TOTAL.clone()))
        .map_err(|e| format!("Failed to register BUS_DROPPED_TOTAL: {e}"))?;

    REGISTRY
        .register(Box::new(BUS_QUEUE_DEPTH.clone()))
        .map_err(|e| format!("Failed to register BUS_QUEUE_DEPTH: {e}"))?;

    REGISTRY
        .register(Box::new(BUS_QUEUE_PEAK.clone()))
        .map_err(|e| format!("Failed to register BUS_QUEUE_PEAK: {e}"))?;

    REGISTRY
        .register(Box::new(BATCH_FLUSHES_TOTAL.clone()))
        .map_err(|e| format!("Failed to register BATCH_FLUSHES_TOTAL: {e}"))?;

    REGISTRY
        .register(Box::new(BATCH_FLUSH_ROWS.clone()))
        .map_err(|e| format!("Failed to register BATCH_FLUSH_ROWS: {e}"))?;

    REGISTRY
        .register(Box::new(SOURCE_CONNECTION_STATUS.clone()))
        .map_err(|e| format!("Failed to register SOURCE_CONNECTION_STATUS: {e}"))?;

    REGISTRY
        .register(Box::new(TARGET_CONNECTION_STATUS.clone()))
        .map_err(|e| format!("Failed to register TARGET_CONNECTION_STATUS: {e}"))?;

    REGISTRY
        .register(Box::new(INIT_ROWS_TOTAL.clone()))
        .map_err(|e| format!("Failed to register INIT_ROWS_TOTAL: {e}"))?;

    REGISTRY
        .register(Box::new(UPTIME_SECONDS.clone()))
        .map_err(|e| format!("Failed to register UPTIME_SECONDS: {e}"))?;

    REGISTRY
        .register(Box::new(BUILD_INFO.clone()))
        .map_err(|e| format!("Failed to register BUILD_INFO: {e}"))?;

    debug!("All metrics registered successfully");
    Ok(())
}

/// Gather all metrics from the global registry in Prometheus text format
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let metric_families = REGISTRY.gather();
    let encoder = prometheus::TextEncoder::new();
    let mut output = Vec::new();
    encoder.encode(&metric_families, &mut output)?;
    Ok(String::from_utf8(output)?)
}

/// Copy the bus counters into their gauges/counters. Called from the
/// supervisor's health loop.
pub fn update_bus_metrics(snapshot: &crate::bus::BusStatsSnapshot) {
    BUS_QUEUE_DEPTH.set(snapshot.depth as f64);
    BUS_QUEUE_PEAK.set(snapshot.peak as f64);
    let published = BUS_PUBLISHED_TOTAL.get();
    if (snapshot.published as f64) > published {
        BUS_PUBLISHED_TOTAL.inc_by(snapshot.published as f64 - published);
    }
    let dropped = BUS_DROPPED_TOTAL.get();
    if (snapshot.dropped as f64) > dropped {
        BUS_DROPPED_TOTAL.inc_by(snapshot.dropped as f64 - dropped);
    }
}
