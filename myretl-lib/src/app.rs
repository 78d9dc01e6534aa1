//! High-level application runner
//!
//! Wires configuration, transform registry, supervisor, optional metrics
//! server and signal handling into the two operations the CLI exposes:
//! running the pipeline and testing every configured connection.

use crate::config::EtlConfig;
use crate::connection::opts_for;
use crate::error::EtlResult;
use crate::monitoring::metrics_server::create_metrics_server;
use crate::monitoring::metrics::init_metrics;
use crate::supervisor::Supervisor;
use crate::transform::TransformRegistry;
use mysql_async::prelude::*;
use mysql_async::Conn;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How the run loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The pipeline shut itself down (fatal worker error or bus close)
    Completed,
    /// SIGINT/SIGTERM requested the shutdown
    Interrupted,
}

/// The assembled ETL application
pub struct EtlApp {
    config: EtlConfig,
    supervisor: Supervisor,
}

impl EtlApp {
    pub fn new(config: EtlConfig, registry: TransformRegistry) -> EtlResult<Self> {
        let supervisor = Supervisor::new(config.clone(), registry)?;
        Ok(Self { config, supervisor })
    }

    /// Run the pipeline until a shutdown signal or a fatal error.
    ///
    /// `monitor_interval` enables the periodic stats log line.
    pub async fn run(
        &mut self,
        version: &str,
        monitor_interval: Option<Duration>,
    ) -> EtlResult<RunOutcome> {
        if let Err(e) = init_metrics() {
            // Re-registration only happens in embedded/test scenarios
            warn!("metrics registration incomplete: {e}");
        }

        let token = self.supervisor.token();

        if let Some(port) = self.config.effective_metrics_port() {
            info!(port, "starting metrics server");
            let server = create_metrics_server(port, self.supervisor.health());
            let server_token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = server.start(server_token).await {
                    warn!("metrics server stopped: {e}");
                }
            });
        }

        self.supervisor.start(version).await?;

        let shutdown = setup_shutdown_handler(token.clone());
        tokio::pin!(shutdown);

        let mut monitor_ticker = monitor_interval.map(tokio::time::interval);
        if let Some(ticker) = monitor_ticker.as_mut() {
            ticker.tick().await; // the first tick fires immediately
        }

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("shutdown initiated from within the pipeline");
                    break RunOutcome::Completed;
                }
                _ = &mut shutdown => {
                    break RunOutcome::Interrupted;
                }
                _ = async {
                    monitor_ticker.as_mut().expect("guarded by condition").tick().await
                }, if monitor_ticker.is_some() => {
                    let snapshot = self.supervisor.snapshot().await;
                    info!(
                        sources = format!("{}/{}", snapshot.sources_running, snapshot.sources_total),
                        targets = format!("{}/{}", snapshot.targets_running, snapshot.targets_total),
                        init_loads = format!("{}/{}", snapshot.init_completed, snapshot.init_total),
                        bus_published = snapshot.bus.published,
                        bus_dropped = snapshot.bus.dropped,
                        bus_depth = snapshot.bus.depth,
                        "pipeline status"
                    );
                }
            }
        };

        self.supervisor.shutdown().await;
        Ok(outcome)
    }
}

/// Result of probing one configured connection
#[derive(Debug)]
pub struct ConnectionTestResult {
    pub name: String,
    pub kind: &'static str,
    pub error: Option<String>,
}

impl ConnectionTestResult {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Open and ping every configured source and target once.
///
/// Used by the CLI `test` verb; every failure is reported by name.
pub async fn test_connections(config: &EtlConfig) -> Vec<ConnectionTestResult> {
    let mut results = Vec::new();

    let mut sources: Vec<&String> = config.sources.keys().collect();
    sources.sort();
    for name in sources {
        results.push(probe(name, "source", &config.sources[name]).await);
    }

    let mut targets: Vec<&String> = config.targets.keys().collect();
    targets.sort();
    for name in targets {
        results.push(probe(name, "target", &config.targets[name].database).await);
    }

    results
}

async fn probe(
    name: &str,
    kind: &'static str,
    db: &crate::config::DatabaseConfig,
) -> ConnectionTestResult {
    let outcome = async {
        let mut conn = Conn::new(opts_for(db)).await?;
        conn.ping().await?;
        conn.disconnect().await?;
        Ok::<(), crate::error::EtlError>(())
    }
    .await;

    ConnectionTestResult {
        name: name.to_string(),
        kind,
        error: outcome.err().map(|e| e.to_string()),
    }
}

/// Resolve SIGTERM/SIGINT into a future that completes on the first signal
async fn setup_shutdown_handler(shutdown_token: CancellationToken) {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("cannot install SIGTERM listener");
        let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("cannot install SIGINT listener");

        let signal = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        info!(signal, "shutdown signal received, stopping pipeline");
        shutdown_token.cancel();
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("cannot install ctrl-c listener");
        info!(signal = "ctrl-c", "shutdown signal received, stopping pipeline");
        shutdown_token.cancel();
    }
}
