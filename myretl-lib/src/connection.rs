//! Named MySQL connection pool
//!
//! One handle per configured connection name, guarded by a single mutex
//! around the name→handle map. Each handle carries at most one live
//! connection; reconnecting replaces it atomically. Operations take the
//! connection out of the handle for their duration so the map lock is never
//! held across I/O.

use crate::config::DatabaseConfig;
use crate::error::{EtlError, EtlResult};
use crate::retry::{is_connection_error, RetryPolicy};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RW_TIMEOUT_SECS: u32 = 30;
const SESSION_IDLE_TIMEOUT_SECS: u32 = 8 * 60 * 60;

/// Pings more frequent than this are skipped; a healthy connection that was
/// pinged moments ago does not need another round trip per event.
const PING_MEMO: Duration = Duration::from_secs(5);

struct ConnectionHandle {
    config: DatabaseConfig,
    conn: Option<Conn>,
    last_ping: Option<Instant>,
}

/// Build connection options for a configured database
pub fn opts_for(config: &DatabaseConfig) -> Opts {
    let init = vec![
        format!("SET NAMES {}", config.charset),
        "SET SESSION autocommit = 1".to_string(),
        format!("SET SESSION wait_timeout = {SESSION_IDLE_TIMEOUT_SECS}"),
        format!("SET SESSION interactive_timeout = {SESSION_IDLE_TIMEOUT_SECS}"),
        format!("SET SESSION net_read_timeout = {RW_TIMEOUT_SECS}"),
        format!("SET SESSION net_write_timeout = {RW_TIMEOUT_SECS}"),
    ];
    let builder = OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.user.clone()))
        .pass(Some(config.password.clone()))
        .db_name(Some(config.database.clone()))
        .tcp_connect_timeout(Some(CONNECT_TIMEOUT))
        .init(init);
    Opts::from(builder)
}

/// Named, retrying connection pool
pub struct ConnectionPool {
    handles: Mutex<HashMap<String, ConnectionHandle>>,
    retry: RetryPolicy,
}

impl ConnectionPool {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// Register a name without connecting; the first operation connects lazily
    pub async fn register(&self, name: &str, config: DatabaseConfig) {
        let mut handles = self.handles.lock().await;
        handles.insert(
            name.to_string(),
            ConnectionHandle {
                config,
                conn: None,
                last_ping: None,
            },
        );
    }

    pub async fn registered_names(&self) -> Vec<String> {
        let handles = self.handles.lock().await;
        let mut names: Vec<String> = handles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Take the connection (if any) out of a handle, leaving the handle in place
    async fn take(&self, name: &str) -> EtlResult<(DatabaseConfig, Option<Conn>)> {
        let mut handles = self.handles.lock().await;
        let handle = handles
            .get_mut(name)
            .ok_or_else(|| EtlError::config(format!("connection '{name}' is not registered")))?;
        Ok((handle.config.clone(), handle.conn.take()))
    }

    async fn put(&self, name: &str, conn: Conn, pinged: bool) {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get_mut(name) {
            if handle.conn.is_some() {
                // A replacement raced us; keep the handle's connection and let
                // this one drop.
                warn!(connection = name, "duplicate live connection discarded");
                return;
            }
            handle.conn = Some(conn);
            if pinged {
                handle.last_ping = Some(Instant::now());
            }
        }
    }

    async fn last_ping(&self, name: &str) -> Option<Instant> {
        let handles = self.handles.lock().await;
        handles.get(name).and_then(|h| h.last_ping)
    }

    async fn connect(&self, name: &str, config: &DatabaseConfig) -> EtlResult<Conn> {
        debug!(connection = name, host = %config.host, port = config.port, "opening MySQL connection");
        let conn = Conn::new(opts_for(config)).await?;
        info!(connection = name, db = %config.database, "MySQL connection established");
        Ok(conn)
    }

    /// Make sure the named connection is live: connect when absent, ping when
    /// the memo has expired, reconnect once when the ping fails.
    pub async fn ensure(&self, name: &str) -> EtlResult<()> {
        let (config, conn) = self.take(name).await?;
        match conn {
            Some(mut conn) => {
                let fresh = self
                    .last_ping(name)
                    .await
                    .map(|at| at.elapsed() < PING_MEMO)
                    .unwrap_or(false);
                if fresh {
                    self.put(name, conn, false).await;
                    return Ok(());
                }
                match conn.ping().await {
                    Ok(()) => {
                        self.put(name, conn, true).await;
                        Ok(())
                    }
                    Err(e) => {
                        warn!(connection = name, error = %e, "ping failed, reconnecting");
                        drop(conn);
                        let fresh_conn = self.connect(name, &config).await?;
                        self.put(name, fresh_conn, true).await;
                        Ok(())
                    }
                }
            }
            None => {
                let conn = self.connect(name, &config).await?;
                self.put(name, conn, true).await;
                Ok(())
            }
        }
    }

    /// Ping without reconnecting. Absent or failing connections report false.
    pub async fn is_healthy(&self, name: &str) -> bool {
        let Ok((_, conn)) = self.take(name).await else {
            return false;
        };
        match conn {
            Some(mut conn) => match conn.ping().await {
                Ok(()) => {
                    self.put(name, conn, true).await;
                    true
                }
                Err(e) => {
                    debug!(connection = name, error = %e, "health ping failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Drop any existing connection and open a fresh one
    pub async fn reconnect(&self, name: &str) -> EtlResult<()> {
        let (config, conn) = self.take(name).await?;
        if let Some(conn) = conn {
            let _ = conn.disconnect().await;
        }
        let fresh = self.connect(name, &config).await?;
        self.put(name, fresh, true).await;
        Ok(())
    }

    pub async fn close(&self, name: &str) -> EtlResult<()> {
        let (_, conn) = self.take(name).await?;
        if let Some(conn) = conn {
            conn.disconnect().await?;
            info!(connection = name, "MySQL connection closed");
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for name in self.registered_names().await {
            if let Err(e) = self.close(&name).await {
                warn!(connection = %name, error = %e, "error closing connection");
            }
        }
    }

    /// Execute a write statement once, returning affected rows
    pub async fn execute(&self, name: &str, sql: &str, params: Vec<Value>) -> EtlResult<u64> {
        let (config, conn) = self.take(name).await?;
        let mut conn = match conn {
            Some(conn) => conn,
            None => self.connect(name, &config).await?,
        };
        match conn.exec_drop(sql, params).await {
            Ok(()) => {
                let affected = conn.affected_rows();
                self.put(name, conn, false).await;
                Ok(affected)
            }
            // The connection may be poisoned mid-statement; drop it and let
            // the retry path reconnect.
            Err(e) => Err(e.into()),
        }
    }

    /// Execute a write with the pool's retry policy: connection-class errors
    /// recreate the named connection and retry with `attempt × 1s` backoff;
    /// anything else surfaces immediately.
    pub async fn execute_with_retry(
        &self,
        name: &str,
        sql: &str,
        params: Vec<Value>,
    ) -> EtlResult<u64> {
        let mut attempt = 1u32;
        loop {
            match self.execute(name, sql, params.clone()).await {
                Ok(affected) => return Ok(affected),
                Err(e) if is_connection_error(&e) && attempt < self.retry.max_attempts => {
                    warn!(
                        connection = name,
                        attempt,
                        error = %e,
                        "write failed with connection error, reconnecting and retrying"
                    );
                    if let Err(re) = self.reconnect(name).await {
                        warn!(connection = name, error = %re, "reconnect attempt failed");
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a query and report whether it produced at least one row
    pub async fn query_has_rows(&self, name: &str, sql: &str) -> EtlResult<bool> {
        let (config, conn) = self.take(name).await?;
        let mut conn = match conn {
            Some(conn) => conn,
            None => self.connect(name, &config).await?,
        };
        match conn.query_first::<mysql_async::Row, _>(sql).await {
            Ok(row) => {
                self.put(name, conn, false).await;
                Ok(row.is_some())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "etl".to_string(),
            password: "secret".to_string(),
            database: "warehouse".to_string(),
            charset: "utf8mb4".to_string(),
        }
    }

    #[test]
    fn test_opts_carry_connection_parameters() {
        let opts = opts_for(&config());
        assert_eq!(opts.ip_or_hostname(), "127.0.0.1");
        assert_eq!(opts.tcp_port(), 3306);
        assert_eq!(opts.user(), Some("etl"));
        assert_eq!(opts.db_name(), Some("warehouse"));
        assert_eq!(opts.tcp_connect_timeout(), Some(CONNECT_TIMEOUT));
        assert!(opts.init().iter().any(|s| s.contains("utf8mb4")));
        assert!(opts.init().iter().any(|s| s.contains("wait_timeout = 28800")));
    }

    #[tokio::test]
    async fn test_unregistered_name_is_an_error() {
        let pool = ConnectionPool::new(RetryPolicy::default());
        let err = pool.ensure("nope").await.unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
        assert!(!pool.is_healthy("nope").await);
    }

    #[tokio::test]
    async fn test_registered_names_sorted() {
        let pool = ConnectionPool::new(RetryPolicy::default());
        pool.register("b_target", config()).await;
        pool.register("a_target", config()).await;
        assert_eq!(pool.registered_names().await, vec!["a_target", "b_target"]);
    }

    #[tokio::test]
    async fn test_unconnected_handle_is_unhealthy() {
        let pool = ConnectionPool::new(RetryPolicy::default());
        pool.register("t", config()).await;
        // No live connection yet and is_healthy must not create one
        assert!(!pool.is_healthy("t").await);
    }
}
