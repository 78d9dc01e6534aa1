//! # MySQL Replication ETL Library
//!
//! Core library for `myretl`: a change-data-capture pipeline that tails
//! MySQL row-based binary logs from one or more sources, transforms and
//! filters each row change, and applies it to one or more target MySQL
//! databases as batched, idempotent upserts. Empty target tables can be
//! backfilled once through configurable init queries.
//!
//! ## Architecture
//!
//! Workers communicate through a bounded in-process [`bus::MessageBus`]:
//!
//! - one [`source::SourceWorker`] per source tails the binlog and publishes
//!   canonical [`events::RowEvent`]s, fanned out per mapping rule
//! - one [`target::TargetWorker`] per target consumes its routed events,
//!   applies filters and transforms, and flushes per-table batches
//! - one [`init_load::InitLoadWorker`] per init-enabled mapping bulk-loads
//!   empty target tables through the same bus
//! - the [`supervisor::Supervisor`] owns startup order, the health loop and
//!   shutdown orchestration
//!
//! Delivery is at-least-once with last-writer-wins per primary key; upserts
//! make replays idempotent.

// Core modules
pub mod app;
pub mod config;
pub mod error;
pub mod events;

// Shared infrastructure
pub mod bus;
pub mod connection;
pub mod retry;
pub mod sql;

// Row processing
pub mod batch;
pub mod filter;
pub mod transform;

// Workers
pub mod init_load;
pub mod source;
pub mod supervisor;
pub mod target;

// Monitoring and metrics
pub mod monitoring;

// Public API exports
pub use app::{test_connections, ConnectionTestResult, EtlApp, RunOutcome};
pub use bus::{Message, MessageBus};
pub use config::{DatabaseConfig, EtlConfig, MappingRule, ReplicationConfig, TargetConfig};
pub use error::{EtlError, EtlResult};
pub use events::{EventKind, Row, RowEvent};
pub use filter::Predicate;
pub use supervisor::Supervisor;
pub use transform::{TransformModuleEntry, TransformRegistry, TRANSFORM_MODULE_ENTRY};
