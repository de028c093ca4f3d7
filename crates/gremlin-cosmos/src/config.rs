//! Connection, pool and retry configuration.

use std::time::Duration;

/// Configuration for one WebSocket connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// `ws://` or `wss://` endpoint URL.
    pub url: String,

    // Timeouts
    /// Timeout for the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Deadline for writing one frame.
    pub write_timeout: Duration,
    /// Maximum silence on the read side, keepalive pongs included.
    pub read_timeout: Duration,

    // Buffers
    /// Read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Maximum accepted message size in bytes.
    pub max_message_size: usize,

    // Keepalive
    /// Interval between keepalive pings.
    pub ping_interval: Duration,

    // Request handling
    /// Capacity of the outbound request queue.
    pub write_queue_capacity: usize,
    /// Maximum number of requests awaiting a response on this connection.
    pub max_pending_requests: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
            read_buffer_size: 8 * 1024,
            write_buffer_size: 8 * 1024,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            ping_interval: Duration::from_secs(30),
            write_queue_capacity: 64,
            max_pending_requests: 1024,
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the write deadline.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the read deadline.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the read buffer size.
    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the write buffer size.
    #[must_use]
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the outbound queue capacity.
    #[must_use]
    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    /// Set the maximum pending requests.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Validate the configuration.
    ///
    /// The URL scheme is checked separately when the transport is built.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        if self.handshake_timeout.is_zero() {
            return Err("Handshake timeout must be > 0".to_string());
        }
        if self.write_timeout.is_zero() {
            return Err("Write timeout must be > 0".to_string());
        }
        if self.ping_interval.is_zero() {
            return Err("Ping interval must be > 0".to_string());
        }
        if self.read_timeout <= self.ping_interval {
            return Err("Read timeout must be greater than the ping interval".to_string());
        }
        if self.read_buffer_size == 0 {
            return Err("Read buffer size must be > 0".to_string());
        }
        if self.write_buffer_size == 0 {
            return Err("Write buffer size must be > 0".to_string());
        }
        if self.max_message_size == 0 {
            return Err("Max message size must be > 0".to_string());
        }
        if self.write_queue_capacity == 0 {
            return Err("Write queue capacity must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        Ok(())
    }
}

/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum number of leased connections.
    pub max_active: usize,
    /// How long an idle connection is kept; zero disables expiry.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 10,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration.
    pub fn new(max_active: usize, idle_timeout: Duration) -> Self {
        Self {
            max_active,
            idle_timeout,
        }
    }

    /// Set the capacity bound.
    #[must_use]
    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_active == 0 {
            return Err("Max active connections must be > 0".to_string());
        }
        Ok(())
    }
}

/// Automatic retry behaviour of the caller-facing API.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Additional attempts after the first; zero disables retrying.
    pub max_retries: u32,
    /// Backoff used when the server does not suggest one.
    pub backoff_initial_delay: Duration,
    /// Upper bound of the default backoff.
    pub backoff_max_delay: Duration,
    /// Multiplier of the default backoff.
    pub backoff_factor: f64,
    /// Jitter factor (0.0-1.0) of the default backoff.
    pub backoff_jitter: f64,
    /// Cap applied to server-suggested retry-after values.
    pub max_retry_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_initial_delay: Duration::from_millis(100),
            backoff_max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            backoff_jitter: 0.1,
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Retry up to `max_retries` times with default backoff.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the default backoff bounds.
    #[must_use]
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial_delay = initial;
        self.backoff_max_delay = max;
        self
    }

    /// Set the default backoff multiplier.
    #[must_use]
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the default backoff jitter.
    #[must_use]
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    /// Cap server-suggested retry-after values.
    #[must_use]
    pub fn max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = max;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_initial_delay.is_zero() {
            return Err("Initial retry backoff must be > 0".to_string());
        }
        if self.backoff_max_delay < self.backoff_initial_delay {
            return Err("Max retry backoff must be >= initial retry backoff".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err("Backoff jitter must be between 0.0 and 1.0".to_string());
        }
        if self.max_retry_after.is_zero() && self.max_retries > 0 {
            return Err("Max retry-after must be > 0 when retries are enabled".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert!(config.url.is_empty());
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.write_timeout, Duration::from_secs(15));
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.write_buffer_size, 8192);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.max_pending_requests, 1024);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ConnectionConfig::new("wss://example.gremlin.cosmos.azure.com:443/")
            .ping_interval(Duration::from_secs(15))
            .read_timeout(Duration::from_secs(45))
            .read_buffer_size(4096)
            .max_pending_requests(16);

        assert_eq!(config.url, "wss://example.gremlin.cosmos.azure.com:443/");
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.read_timeout, Duration::from_secs(45));
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.max_pending_requests, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_url() {
        let result = ConnectionConfig::default().validate();
        assert_eq!(result.unwrap_err(), "URL cannot be empty");
    }

    #[test]
    fn test_validation_zero_buffer() {
        let config = ConnectionConfig::new("ws://localhost:8182").write_buffer_size(0);
        assert_eq!(config.validate().unwrap_err(), "Write buffer size must be > 0");
    }

    #[test]
    fn test_validation_read_timeout_below_ping() {
        let config = ConnectionConfig::new("ws://localhost:8182")
            .ping_interval(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(10));
        assert_eq!(
            config.validate().unwrap_err(),
            "Read timeout must be greater than the ping interval"
        );
    }

    #[test]
    fn test_pool_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        assert_eq!(
            PoolConfig::new(0, Duration::ZERO).validate().unwrap_err(),
            "Max active connections must be > 0"
        );
    }

    #[test]
    fn test_retry_validation() {
        assert!(RetryConfig::new(3).validate().is_ok());
        assert_eq!(
            RetryConfig::new(3).backoff_factor(0.5).validate().unwrap_err(),
            "Backoff factor must be >= 1.0"
        );
        assert_eq!(
            RetryConfig::new(3)
                .backoff(Duration::from_secs(2), Duration::from_secs(1))
                .validate()
                .unwrap_err(),
            "Max retry backoff must be >= initial retry backoff"
        );
        assert!(RetryConfig::new(3).backoff_jitter(1.5).validate().is_err());
        assert!(
            RetryConfig::new(1)
                .max_retry_after(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
