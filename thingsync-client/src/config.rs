//! Client configuration
//!
//! [`ClientConfig`] can be built in code (defaults, presets, `with_*`
//! builders) or loaded from an optional `config/thingsync.toml` file and
//! `THINGSYNC_*` environment variables. Durations are given in milliseconds
//! when loaded.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::error::{ClientError, Result};

/// Configuration for a [`Client`](crate::Client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Identifier presented to the broker
    /// Default: "thingsync-client"
    pub client_id: String,

    /// Worker threads of the task scheduler
    /// Default: 4
    pub num_client_threads: usize,

    /// Timeout for establishing a connection. The client never enforces it;
    /// transports read it through [`TransportEvents::config`](crate::TransportEvents::config).
    /// Default: 30 seconds
    pub connection_timeout: Duration,

    /// Deadline for broker acknowledgements of internal operations
    /// (resubscription, device subscriptions). Zero means no deadline.
    /// Default: 3 seconds
    pub server_ack_timeout: Duration,

    /// Keep-alive interval. Only transports read it, through
    /// [`TransportEvents::config`](crate::TransportEvents::config).
    /// Default: 600 seconds
    pub keep_alive_interval: Duration,

    /// Delay before the first reconnect attempt
    /// Default: 3 seconds
    pub base_retry_delay: Duration,

    /// Upper bound for reconnect delays
    /// Default: 30 seconds
    pub max_retry_delay: Duration,

    /// Reconnect attempts before the session is closed
    /// Default: 5
    pub max_connection_retries: u32,

    /// Publishes held while connecting or reconnecting
    /// Default: 64
    pub max_offline_queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: "thingsync-client".to_string(),
            num_client_threads: 4,
            connection_timeout: Duration::from_secs(30),
            server_ack_timeout: Duration::from_secs(3),
            keep_alive_interval: Duration::from_secs(600),
            base_retry_delay: Duration::from_secs(3),
            max_retry_delay: Duration::from_secs(30),
            max_connection_retries: 5,
            max_offline_queue_size: 64,
        }
    }
}

impl ClientConfig {
    /// Default configuration with the given client id
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Short timeouts and retry delays, suited to in-process transports and tests
    pub fn fast_retry(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            num_client_threads: 2,
            connection_timeout: Duration::from_secs(2),
            server_ack_timeout: Duration::from_millis(500),
            base_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(100),
            ..Default::default()
        }
    }

    /// Small footprint for constrained devices
    pub fn constrained(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            num_client_threads: 1,
            max_offline_queue_size: 8,
            ..Default::default()
        }
    }

    pub fn with_client_threads(mut self, threads: usize) -> Self {
        self.num_client_threads = threads;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_server_ack_timeout(mut self, timeout: Duration) -> Self {
        self.server_ack_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_retry_delay = base;
        self.max_retry_delay = max;
        self
    }

    pub fn with_max_connection_retries(mut self, retries: u32) -> Self {
        self.max_connection_retries = retries;
        self
    }

    pub fn with_offline_queue_size(mut self, size: usize) -> Self {
        self.max_offline_queue_size = size;
        self
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(ClientError::Configuration(
                "Client id must not be empty".to_string(),
            ));
        }

        if self.num_client_threads == 0 {
            return Err(ClientError::Configuration(
                "Client thread count must be greater than 0".to_string(),
            ));
        }

        if self.base_retry_delay > self.max_retry_delay {
            return Err(ClientError::Configuration(
                "Invalid retry delays: base must not exceed max".to_string(),
            ));
        }

        Ok(())
    }

    /// Load from `config/thingsync.{toml}` (optional) and `THINGSYNC_*` variables
    pub fn load() -> Result<Self> {
        Self::load_with(
            Config::builder().add_source(File::with_name("config/thingsync").required(false)),
        )
    }

    /// Load from an explicit file (required) and `THINGSYNC_*` variables
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(Config::builder().add_source(File::from(path.as_ref()).required(true)))
    }

    fn load_with(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let settings = builder
            .add_source(
                Environment::with_prefix("THINGSYNC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ClientError::Configuration(format!("failed to read configuration: {}", e)))?;

        let partial: PartialClientConfig = settings
            .try_deserialize()
            .map_err(|e| ClientError::Configuration(format!("invalid configuration: {}", e)))?;

        let config = partial.merge_over(Self::default());
        config.validate()?;
        Ok(config)
    }
}

/// Loaded values; anything missing falls back to the default
#[derive(Debug, Default, Deserialize)]
struct PartialClientConfig {
    client_id: Option<String>,
    num_client_threads: Option<usize>,
    connection_timeout_ms: Option<u64>,
    server_ack_timeout_ms: Option<u64>,
    keep_alive_interval_ms: Option<u64>,
    base_retry_delay_ms: Option<u64>,
    max_retry_delay_ms: Option<u64>,
    max_connection_retries: Option<u32>,
    max_offline_queue_size: Option<usize>,
}

impl PartialClientConfig {
    fn merge_over(self, default: ClientConfig) -> ClientConfig {
        let millis = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };

        ClientConfig {
            client_id: self.client_id.unwrap_or(default.client_id),
            num_client_threads: self.num_client_threads.unwrap_or(default.num_client_threads),
            connection_timeout: millis(self.connection_timeout_ms, default.connection_timeout),
            server_ack_timeout: millis(self.server_ack_timeout_ms, default.server_ack_timeout),
            keep_alive_interval: millis(self.keep_alive_interval_ms, default.keep_alive_interval),
            base_retry_delay: millis(self.base_retry_delay_ms, default.base_retry_delay),
            max_retry_delay: millis(self.max_retry_delay_ms, default.max_retry_delay),
            max_connection_retries: self
                .max_connection_retries
                .unwrap_or(default.max_connection_retries),
            max_offline_queue_size: self
                .max_offline_queue_size
                .unwrap_or(default.max_offline_queue_size),
        }
    }
}
