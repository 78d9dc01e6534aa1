//! Monitoring: Prometheus metrics, health reports, HTTP exposition

pub mod health;
pub mod metrics;
pub mod metrics_server;

pub use health::{HealthComponents, HealthLevel, HealthReport, InitLoadHealth, QueueHealth, WorkerHealth};
pub use metrics::{gather_metrics, init_metrics, update_bus_metrics};
pub use metrics_server::{create_metrics_server, MetricsServer, MetricsServerConfig, SharedHealth};
