use thiserror::Error;

/// Comprehensive error types for ETL pipeline operations
#[derive(Error, Debug)]
pub enum EtlError {
    /// MySQL driver errors (source or target)
    #[error("MySQL error: {0}")]
    Database(#[from] mysql_async::Error),

    /// Connection-state errors raised by the pipeline itself
    #[error("Connection error: {0}")]
    Connectivity(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Binlog replication stream errors
    #[error("Replication error: {0}")]
    Replication(String),

    /// Target schema mismatch errors
    #[error("Schema error: {0}")]
    Schema(String),

    /// Transform evaluation errors
    #[error("Transform error: {0}")]
    Transform(String),

    /// Filter evaluation errors
    #[error("Filter error: {0}")]
    Filter(String),

    /// Message bus errors
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic errors
    #[error("ETL error: {0}")]
    Generic(String),
}

impl EtlError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        EtlError::Config(msg.into())
    }

    /// Create a new connection-state error
    pub fn connectivity<S: Into<String>>(msg: S) -> Self {
        EtlError::Connectivity(msg.into())
    }

    /// Create a new replication error
    pub fn replication<S: Into<String>>(msg: S) -> Self {
        EtlError::Replication(msg.into())
    }

    /// Create a new schema error
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        EtlError::Schema(msg.into())
    }

    /// Create a new transform error
    pub fn transform<S: Into<String>>(msg: S) -> Self {
        EtlError::Transform(msg.into())
    }

    /// Create a new filter error
    pub fn filter<S: Into<String>>(msg: S) -> Self {
        EtlError::Filter(msg.into())
    }

    /// Create a new message bus error
    pub fn bus<S: Into<String>>(msg: S) -> Self {
        EtlError::Bus(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        EtlError::Timeout(msg.into())
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        EtlError::Generic(msg.into())
    }

    /// Metric label for the error kind, used by the error counters
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::Database(_) => "database",
            EtlError::Connectivity(_) => "connectivity",
            EtlError::Config(_) => "config",
            EtlError::Replication(_) => "replication",
            EtlError::Schema(_) => "schema",
            EtlError::Transform(_) => "transform",
            EtlError::Filter(_) => "filter",
            EtlError::Bus(_) => "bus",
            EtlError::Serialization(_) => "serialization",
            EtlError::Io(_) => "io",
            EtlError::Timeout(_) => "timeout",
            EtlError::Generic(_) => "generic",
        }
    }
}

/// Result type for ETL operations
pub type EtlResult<T> = std::result::Result<T, EtlError>;
