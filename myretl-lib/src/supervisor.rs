//! Supervisor: lifecycle, health monitoring, shutdown orchestration
//!
//! Startup order matters: target workers first (they must be ready to
//! consume), then one-shot init loads, then source workers. A periodic
//! health loop pings target connections (reconnecting the ones that died),
//! restarts source workers that stopped unexpectedly, and escalates sources
//! that exhausted their connect retries into a global shutdown.

use crate::bus::{BusStatsSnapshot, MessageBus};
use crate::config::{EtlConfig, MappingRule};
use crate::connection::ConnectionPool;
use crate::error::{EtlError, EtlResult};
use crate::init_load::{InitLoadContext, InitLoadWorker};
use crate::monitoring::health::{
    HealthComponents, HealthReport, InitLoadHealth, QueueHealth, WorkerHealth,
};
use crate::monitoring::metrics::{
    update_bus_metrics, BUILD_INFO, TARGET_CONNECTION_STATUS, UPTIME_SECONDS,
};
use crate::monitoring::SharedHealth;
use crate::retry::RetryPolicy;
use crate::source::{SourceSpec, SourceState, SourceWorker};
use crate::target::{TargetContext, TargetWorker};
use crate::transform::TransformRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Health loop period
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Gap between noticing a stopped source and restarting it
const RESTART_GAP: Duration = Duration::from_secs(2);

/// Upper bound for joining workers during shutdown
const JOIN_TIMEOUT: Duration = Duration::from_secs(15);

struct SourceSlot {
    spec: SourceSpec,
    worker: SourceWorker,
}

/// Point-in-time view of the pipeline, logged by `--monitor`
#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    pub sources_running: usize,
    pub sources_total: usize,
    pub targets_running: usize,
    pub targets_total: usize,
    pub init_completed: usize,
    pub init_total: usize,
    pub bus: BusStatsSnapshot,
}

struct SupervisorInner {
    config: Arc<EtlConfig>,
    rules: Vec<Arc<MappingRule>>,
    registry: Arc<TransformRegistry>,
    pool: Arc<ConnectionPool>,
    bus: Arc<MessageBus>,
    token: CancellationToken,
    health: SharedHealth,
    started_at: Instant,
    targets: Mutex<Vec<TargetWorker>>,
    sources: Mutex<HashMap<String, SourceSlot>>,
    init_loads: Mutex<Vec<InitLoadWorker>>,
}

/// Owns every worker and the shared infrastructure they run on
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
    health_handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(config: EtlConfig, registry: TransformRegistry) -> EtlResult<Self> {
        let rules = config.resolve_mappings(&registry)?;
        let bus = Arc::new(MessageBus::new());
        let pool = Arc::new(ConnectionPool::new(RetryPolicy::default()));

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                config: Arc::new(config),
                rules,
                registry: Arc::new(registry),
                pool,
                bus,
                token: CancellationToken::new(),
                health: Arc::new(RwLock::new(HealthReport::starting())),
                started_at: Instant::now(),
                targets: Mutex::new(Vec::new()),
                sources: Mutex::new(HashMap::new()),
                init_loads: Mutex::new(Vec::new()),
            }),
            health_handle: None,
        })
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn health(&self) -> SharedHealth {
        Arc::clone(&self.inner.health)
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.inner.bus)
    }

    pub fn rules(&self) -> &[Arc<MappingRule>] {
        &self.inner.rules
    }

    /// Start everything: targets, init loads, sources, health loop.
    ///
    /// Target connections are established eagerly so an unreachable target
    /// fails startup instead of failing the first batch.
    pub async fn start(&mut self, version: &str) -> EtlResult<()> {
        BUILD_INFO.with_label_values(&[version]).set(1.0);

        {
            let inner = &self.inner;

            // Register pool connections: one per target plus one probe per
            // init-load mapping (connections stay single-owner per worker).
            for (name, target) in &inner.config.targets {
                inner.pool.register(name, target.database.clone()).await;
            }
            for rule in inner.rules.iter().filter(|r| r.init_query.is_some()) {
                let target = inner.config.get_target_config(&rule.target_name)?;
                inner
                    .pool
                    .register(&probe_name(&rule.key), target.database.clone())
                    .await;
            }

            for name in inner.config.targets.keys() {
                inner.pool.ensure(name).await.map_err(|e| {
                    EtlError::connectivity(format!(
                        "target '{name}' is unreachable at startup: {e}"
                    ))
                })?;
            }
        }

        self.start_targets().await;
        self.start_init_loads().await?;
        self.start_sources().await;

        let health_inner = Arc::clone(&self.inner);
        self.health_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                tokio::select! {
                    _ = health_inner.token.cancelled() => break,
                    _ = ticker.tick() => health_inner.health_tick().await,
                }
            }
        }));

        info!(
            sources = self.inner.config.sources.len(),
            targets = self.inner.config.targets.len(),
            mappings = self.inner.rules.len(),
            "supervisor started"
        );
        Ok(())
    }

    async fn start_targets(&self) {
        let inner = &self.inner;
        let mut targets = inner.targets.lock().await;

        let mut names: Vec<&String> = inner.config.targets.keys().collect();
        names.sort();
        for name in names {
            let target = &inner.config.targets[name];
            let rules: HashMap<String, Arc<MappingRule>> = inner
                .rules
                .iter()
                .filter(|r| &r.target_name == name)
                .map(|r| (r.key.clone(), Arc::clone(r)))
                .collect();

            let ctx = TargetContext {
                name: name.clone(),
                batch_size: target.batch_size.max(1),
                flush_interval: target.flush_interval(),
                pool: Arc::clone(&inner.pool),
                registry: Arc::clone(&inner.registry),
                rules,
                subscriber: inner.bus.subscribe(name),
                token: inner.token.clone(),
            };
            targets.push(TargetWorker::spawn(ctx));
        }
    }

    async fn start_init_loads(&self) -> EtlResult<()> {
        let inner = &self.inner;
        let mut init_loads = inner.init_loads.lock().await;

        for rule in inner.rules.iter().filter(|r| r.init_query.is_some()) {
            let source_config = inner.config.get_source_config(&rule.source_name)?.clone();
            let ctx = InitLoadContext {
                rule: Arc::clone(rule),
                source_config,
                probe_name: probe_name(&rule.key),
                pool: Arc::clone(&inner.pool),
                bus: Arc::clone(&inner.bus),
                token: inner.token.clone(),
            };
            init_loads.push(InitLoadWorker::spawn(ctx));
        }
        Ok(())
    }

    async fn start_sources(&self) {
        let inner = &self.inner;
        let mut sources = inner.sources.lock().await;

        let mut names: Vec<&String> = inner.config.sources.keys().collect();
        names.sort();
        for name in names {
            let rules: Vec<Arc<MappingRule>> = inner
                .rules
                .iter()
                .filter(|r| &r.source_name == name)
                .cloned()
                .collect();
            if rules.is_empty() {
                warn!(source = %name, "source has no mapping rules, not starting a worker");
                continue;
            }
            let spec = SourceSpec {
                name: name.clone(),
                config: inner.config.sources[name].clone(),
                replication: inner.config.replication.clone(),
                rules,
            };
            let worker =
                SourceWorker::spawn(spec.clone(), Arc::clone(&inner.bus), inner.token.clone());
            sources.insert(name.clone(), SourceSlot { spec, worker });
        }
    }

    /// Current pipeline snapshot for the `--monitor` loop
    pub async fn snapshot(&self) -> SupervisorSnapshot {
        let inner = &self.inner;
        let sources = inner.sources.lock().await;
        let targets = inner.targets.lock().await;
        let init_loads = inner.init_loads.lock().await;

        SupervisorSnapshot {
            sources_running: sources.values().filter(|s| s.worker.is_running()).count(),
            sources_total: sources.len(),
            targets_running: targets.iter().filter(|t| t.is_running()).count(),
            targets_total: targets.len(),
            init_completed: init_loads.iter().filter(|w| w.is_completed()).count(),
            init_total: init_loads.len(),
            bus: inner.bus.stats().snapshot(),
        }
    }

    /// Cancel, broadcast the poison pill, join every worker, close connections
    pub async fn shutdown(&mut self) {
        info!("supervisor shutting down");
        self.inner.token.cancel();
        self.inner.bus.publish_shutdown("supervisor");

        if let Some(handle) = self.health_handle.take() {
            let _ = handle.await;
        }
        let inner = &self.inner;

        // Sources first so no new events enter the bus, then init loads,
        // then targets (which flush their remaining batches).
        let sources: Vec<SourceWorker> = {
            let mut map = inner.sources.lock().await;
            map.drain().map(|(_, slot)| slot.worker).collect()
        };
        join_all("source", sources.into_iter().map(|w| w.join())).await;

        let init_loads: Vec<InitLoadWorker> = {
            let mut list = inner.init_loads.lock().await;
            list.drain(..).collect()
        };
        join_all("init-load", init_loads.into_iter().map(|w| w.join())).await;

        let targets: Vec<TargetWorker> = {
            let mut list = inner.targets.lock().await;
            list.drain(..).collect()
        };
        join_all("target", targets.into_iter().map(|w| w.join())).await;

        inner.pool.close_all().await;
        info!("supervisor shutdown complete");
    }
}

impl SupervisorInner {
    /// One pass of the 30s health loop
    async fn health_tick(&self) {
        // Target connections: ping, reconnect the dead ones
        let mut targets_running = 0usize;
        let target_names: Vec<String> = self.config.targets.keys().cloned().collect();
        for name in &target_names {
            let healthy = self.pool.is_healthy(name).await;
            if healthy {
                targets_running += 1;
            } else {
                warn!(target_name = %name, "target connection down, reconnecting");
                match self.pool.reconnect(name).await {
                    Ok(()) => {
                        targets_running += 1;
                        info!(target_name = %name, "target connection restored");
                    }
                    Err(e) => {
                        error!(target_name = %name, error = %e, "target reconnect failed");
                    }
                }
            }
            TARGET_CONNECTION_STATUS
                .with_label_values(&[name])
                .set(if healthy { 1.0 } else { 0.0 });
        }

        // Source workers: restart stopped ones, escalate failed ones
        let mut sources_running = 0usize;
        let mut sources_total = 0usize;
        {
            let mut sources = self.sources.lock().await;
            for (name, slot) in sources.iter_mut() {
                sources_total += 1;
                match slot.worker.state() {
                    state if state.is_running() => sources_running += 1,
                    SourceState::Failed => {
                        error!(
                            source = %name,
                            "source exhausted its connect retries, initiating shutdown"
                        );
                        self.token.cancel();
                    }
                    _ => {
                        if self.token.is_cancelled() {
                            continue;
                        }
                        warn!(source = %name, gap_secs = RESTART_GAP.as_secs(), "restarting stopped source worker");
                        tokio::time::sleep(RESTART_GAP).await;
                        let fresh = SourceWorker::spawn(
                            slot.spec.clone(),
                            Arc::clone(&self.bus),
                            self.token.clone(),
                        );
                        let old = std::mem::replace(&mut slot.worker, fresh);
                        old.join().await;
                        sources_running += 1;
                    }
                }
            }
        }

        // Init loads
        let (init_completed, init_running, init_total) = {
            let init_loads = self.init_loads.lock().await;
            (
                init_loads.iter().filter(|w| w.is_completed()).count(),
                init_loads.iter().filter(|w| w.is_running()).count(),
                init_loads.len(),
            )
        };

        let bus_stats = self.bus.stats().snapshot();
        update_bus_metrics(&bus_stats);
        let uptime = self.started_at.elapsed().as_secs();
        UPTIME_SECONDS.set(uptime as f64);

        let targets_total = target_names.len();
        let report = HealthReport::assemble(
            uptime,
            HealthComponents {
                sources: WorkerHealth::of(sources_running, sources_total),
                targets: WorkerHealth::of(targets_running, targets_total),
                init_loads: InitLoadHealth::of(init_completed, init_running, init_total),
                message_bus: QueueHealth::of(bus_stats.depth, self.bus.capacity(), bus_stats.dropped),
            },
        );
        *self.health.write().expect("health report poisoned") = report;
    }
}

fn probe_name(mapping_key: &str) -> String {
    format!("init_probe_{mapping_key}")
}

async fn join_all(kind: &str, workers: impl Iterator<Item = impl std::future::Future<Output = ()>>) {
    let joins = futures_util::future::join_all(workers);
    if tokio::time::timeout(JOIN_TIMEOUT, joins).await.is_err() {
        warn!(kind, "workers did not finish within the join timeout");
    }
}
