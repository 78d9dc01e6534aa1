//! Retry policies and MySQL error classification
//!
//! Two distinct policies live here: the write retry used by target workers
//! (fixed attempt count, linear backoff, reconnect between attempts) and the
//! exponential backoff used by source workers while (re)connecting to a
//! binlog stream.

use crate::error::EtlError;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;

/// Retry policy for write operations executed through the connection pool
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt: `attempt × base_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.max(1)
    }
}

/// Backoff configuration for source connect/reconnect cycles
#[derive(Debug, Clone)]
pub struct ConnectRetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ConnectRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ConnectRetryConfig {
    /// Create an exponential backoff policy from this configuration
    pub fn to_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

/// Server error codes that indicate the connection itself is unusable
const CONNECTION_SERVER_CODES: &[u16] = &[
    1053, // ER_SERVER_SHUTDOWN
    1152, // ER_ABORTING_CONNECTION
    1184, // ER_NEW_ABORTING_CONNECTION
    2006, // CR_SERVER_GONE_ERROR
    2013, // CR_SERVER_LOST
];

/// Classify an error as connection-class: close and recreate the named
/// connection, then retry. Anything else surfaces to the caller unretried.
pub fn is_connection_error(error: &EtlError) -> bool {
    match error {
        EtlError::Connectivity(_) => true,
        EtlError::Io(_) => true,
        EtlError::Database(inner) => match inner {
            mysql_async::Error::Io(_) => true,
            // Bad packet sequence, unexpected packet, connection closed
            mysql_async::Error::Driver(_) => true,
            mysql_async::Error::Server(server) => {
                CONNECTION_SERVER_CODES.contains(&server.code)
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_retry_delays_scale_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
        // Attempt numbering starts at 1
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_connect_backoff_caps_at_max_delay() {
        let config = ConnectRetryConfig::default();
        let mut backoff = config.to_backoff();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next_backoff().expect("no elapsed-time limit");
        }
        assert!(last <= config.max_delay);
        assert!(last >= Duration::from_secs(29));
    }

    #[test]
    fn test_classification() {
        assert!(is_connection_error(&EtlError::connectivity("gone")));
        assert!(is_connection_error(&EtlError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe"
        ))));
        assert!(!is_connection_error(&EtlError::config("bad mapping")));
        assert!(!is_connection_error(&EtlError::schema("missing column")));
    }
}
