//! Startup configuration for the consumer and the supplier.
//!
//! Values come from command-line flags or the environment (see `cli`) and
//! are validated once before anything connects.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::DEFAULT_CAPACITY;

/// Default queue name.
pub const DEFAULT_QUEUE_NAME: &str = "data-egress";

/// Default supplier listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Time allowed for connecting to the queue and the store at startup.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Consumer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Queue connection URL (`redis://...`).
    pub queue_url: String,
    /// Queue name.
    pub queue_name: String,
    /// Backpressure channel capacity.
    pub max_concurrent_count: usize,
    /// Optional store URL (`sqlite://...`). Enables task state updates.
    pub collection_url: Option<String>,
    /// Startup connection timeout.
    pub init_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            max_concurrent_count: DEFAULT_CAPACITY,
            collection_url: None,
            init_timeout: INIT_TIMEOUT,
        }
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the channel capacity.
    pub fn with_max_concurrent_count(mut self, count: usize) -> Self {
        self.max_concurrent_count = count;
        self
    }

    /// Builder method to set the store URL.
    pub fn with_collection_url(mut self, url: impl Into<String>) -> Self {
        self.collection_url = Some(url.into());
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an empty URL or queue name, or a zero
    /// capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("QUEUE_URL", &self.queue_url)?;
        require_non_empty("QUEUE_NAME", &self.queue_name)?;

        if self.max_concurrent_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_COUNT",
                reason: "must be greater than 0".to_string(),
            });
        }

        if let Some(url) = &self.collection_url {
            require_non_empty("COLLECTION_URL", url)?;
        }

        Ok(())
    }
}

/// Supplier configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SupplierConfig {
    /// Queue connection URL (`redis://...`).
    pub queue_url: String,
    /// Queue name.
    pub queue_name: String,
    /// Store URL (`sqlite://...`).
    pub collection_url: String,
    /// HTTP listen address.
    pub listen_addr: String,
    /// Startup connection timeout.
    pub init_timeout: Duration,
}

impl SupplierConfig {
    pub fn new(queue_url: impl Into<String>, collection_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            collection_url: collection_url.into(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            init_timeout: INIT_TIMEOUT,
        }
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the listen address.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Parsed listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                key: "LISTEN_ADDR",
                reason: e.to_string(),
            })
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an empty URL or queue name, or an
    /// unparsable listen address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("QUEUE_URL", &self.queue_url)?;
        require_non_empty("QUEUE_NAME", &self.queue_name)?;
        require_non_empty("COLLECTION_URL", &self.collection_url)?;
        self.socket_addr()?;
        Ok(())
    }
}

fn require_non_empty(key: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingValue(key));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::new("redis://localhost:6379");
        assert_eq!(config.queue_name, "data-egress");
        assert_eq!(config.max_concurrent_count, 30);
        assert_eq!(config.init_timeout, Duration::from_secs(15));
        assert!(config.collection_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_rejects_zero_capacity() {
        let config = ConsumerConfig::new("redis://localhost").with_max_concurrent_count(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_COUNT",
                ..
            })
        ));
    }

    #[test]
    fn test_consumer_rejects_empty_urls() {
        assert!(matches!(
            ConsumerConfig::new("  ").validate(),
            Err(ConfigError::MissingValue("QUEUE_URL"))
        ));
        assert!(matches!(
            ConsumerConfig::new("redis://localhost")
                .with_collection_url("")
                .validate(),
            Err(ConfigError::MissingValue("COLLECTION_URL"))
        ));
    }

    #[test]
    fn test_supplier_listen_addr() {
        let config = SupplierConfig::new("redis://localhost", "sqlite://tasks.db");
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
        assert!(config.validate().is_ok());

        let bad = config.with_listen_addr("not an address");
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidValue {
                key: "LISTEN_ADDR",
                ..
            })
        ));
    }

    #[test]
    fn test_supplier_requires_collection() {
        let config = SupplierConfig::new("redis://localhost", "");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingValue("COLLECTION_URL"))
        ));
    }
}
