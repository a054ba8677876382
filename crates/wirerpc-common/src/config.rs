//! Client and server configuration.
//!
//! Both structs deserialize from JSON with every field optional, so a config
//! file only needs to name what differs from the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::error::{Result, WireRpcError};

/// Payload encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    #[default]
    Binary,
    Json,
    Postcard,
}

/// Provider selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceKind {
    Random,
    #[default]
    RoundRobin,
}

/// How outbound frames reach the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    /// Write and flush every call immediately
    Single,
    /// Queue calls and flush them in batches
    #[default]
    Batch,
}

/// Where the provider list comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverKind {
    /// Providers are passed in directly
    #[default]
    Static,
    /// Providers come from an externally supplied `Discover` implementation
    External(String),
}

/// Client configuration.
///
/// # Default Configuration
///
/// - `timeout_ms`: 3000
/// - `connections_per_provider`: 1
/// - `server_error_threshold`: 10
/// - `load_balance`: round robin
/// - `sender`: batch, 64 calls per pass, 4 passes, queue of 1024
/// - sweep every 100ms with a 10ms budget
///
/// # Example
///
/// ```
/// use wirerpc_common::{ClientConfig, SenderKind};
///
/// let config = ClientConfig::new("payments", "checkout")
///     .with_timeout_ms(500)
///     .with_sender(SenderKind::Single);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service group the client belongs to
    pub group: String,
    /// Application name of the remote service
    pub app: String,
    pub serializer: SerializerKind,
    /// Global call timeout, overridable per call
    pub timeout_ms: u64,
    /// Number of multiplexed connections opened per provider
    pub connections_per_provider: usize,
    /// Errors tolerated per provider before its connections go unhealthy.
    ///
    /// Split evenly across the provider's connections, see
    /// [`connect_error_threshold`](Self::connect_error_threshold).
    pub server_error_threshold: u32,
    pub load_balance: LoadBalanceKind,
    pub discover: DiscoverKind,
    pub sender: SenderKind,
    /// Calls drained per flush pass (batch sender)
    pub batch_size: usize,
    /// Flush passes per scheduled flush (batch sender)
    pub batch_passes: usize,
    /// Capacity of the outbound queue (batch sender)
    pub queue_capacity: usize,
    /// Interval of the expiry sweep
    pub sweep_interval_ms: u64,
    /// Time budget of a single expiry sweep
    pub sweep_budget_ms: u64,
    /// Time budget of the expiry sweep run before draining on close
    pub close_sweep_budget_ms: u64,
    pub connect_timeout_ms: u64,
    /// Delay before a closed connection to a live provider is dialed again
    pub reconnect_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            app: "default".to_string(),
            serializer: SerializerKind::default(),
            timeout_ms: 3000,
            connections_per_provider: 1,
            server_error_threshold: 10,
            load_balance: LoadBalanceKind::default(),
            discover: DiscoverKind::default(),
            sender: SenderKind::default(),
            batch_size: 64,
            batch_passes: 4,
            queue_capacity: 1024,
            sweep_interval_ms: 100,
            sweep_budget_ms: 10,
            close_sweep_budget_ms: 10,
            connect_timeout_ms: 3000,
            reconnect_delay_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn new(group: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            app: app.into(),
            ..Self::default()
        }
    }

    /// Loads a JSON config file and validates it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_sender(mut self, sender: SenderKind) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_load_balance(mut self, load_balance: LoadBalanceKind) -> Self {
        self.load_balance = load_balance;
        self
    }

    pub fn with_connections_per_provider(mut self, connections: usize) -> Self {
        self.connections_per_provider = connections;
        self
    }

    pub fn with_batch(mut self, batch_size: usize, batch_passes: usize, queue_capacity: usize) -> Self {
        self.batch_size = batch_size;
        self.batch_passes = batch_passes;
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_sweep(mut self, interval_ms: u64, budget_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self.sweep_budget_ms = budget_ms;
        self
    }

    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Consecutive failures a single connection may see before it is
    /// considered unhealthy: the provider-wide threshold split across its
    /// connections, never below one.
    pub fn connect_error_threshold(&self) -> u32 {
        let per_provider = self.connections_per_provider.max(1) as u32;
        (self.server_error_threshold / per_provider).max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn sweep_budget(&self) -> Duration {
        Duration::from_millis(self.sweep_budget_ms)
    }

    pub fn close_sweep_budget(&self) -> Duration {
        Duration::from_millis(self.close_sweep_budget_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connections_per_provider == 0 {
            return Err(WireRpcError::Config(
                "connections_per_provider must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(WireRpcError::Config("timeout_ms must be positive".to_string()));
        }
        if self.sender == SenderKind::Batch
            && (self.batch_size == 0 || self.batch_passes == 0 || self.queue_capacity == 0)
        {
            return Err(WireRpcError::Config(
                "batch_size, batch_passes and queue_capacity must be positive".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(WireRpcError::Config("sweep_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to, e.g. "0.0.0.0:7000"
    pub bind: String,
    pub group: String,
    pub app: String,
    pub serializer: SerializerKind,
    /// Selection weight announced to the registry, in [0, 100]
    pub weight: i32,
    /// Requests processed concurrently per connection
    pub max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7000".to_string(),
            group: "default".to_string(),
            app: "default".to_string(),
            serializer: SerializerKind::default(),
            weight: 100,
            max_in_flight: 1024,
        }
    }
}

impl ServerConfig {
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0..=100).contains(&self.weight) {
            return Err(WireRpcError::Config(format!(
                "weight must be in [0, 100], got {}",
                self.weight
            )));
        }
        if self.max_in_flight == 0 {
            return Err(WireRpcError::Config("max_in_flight must be positive".to_string()));
        }
        Ok(())
    }
}
