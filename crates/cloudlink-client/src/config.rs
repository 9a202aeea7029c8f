//! # Client Configuration
//!
//! Configuration for the dispatch engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CLOUDLINK_SERVER_URL=https://iot.example.com                       │
//! │     CLOUDLINK_POLLING_INTERVAL_MS=5000                                 │
//! │                                                                         │
//! │  2. TOML Config File (caller-provided path)                            │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     message queue 1000, storage queue 50, poll 3000ms, batch 100       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [server]
//! url = "https://iot.example.com"
//! endpoint_id = "0-AB-44-55"
//!
//! [queue]
//! message_capacity = 1000
//! storage_capacity = 50
//!
//! [polling]
//! interval_ms = 3000    # floored at 1000 regardless of configuration
//! max_batch = 100       # messages per connection
//! long_polling = true
//!
//! [transport]
//! connect_timeout_secs = 15
//! receive_timeout_secs = 100    # long-poll hold time
//! request_buffer_bytes = 4192   # long-poll accept-byte negotiation
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::{ClientError, ClientResult};

// =============================================================================
// Constants
// =============================================================================

/// Global floor on the polling interval; configured values below this are
/// clamped up so a misconfigured device cannot hammer the endpoint.
pub const MIN_POLLING_INTERVAL_MS: u64 = 1000;

/// Default device polling interval.
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 3000;

/// Default outbound message queue capacity.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 1000;

/// Default storage transfer queue capacity.
pub const DEFAULT_STORAGE_CAPACITY: usize = 50;

/// Default maximum messages per connection batch.
pub const DEFAULT_MAX_BATCH: usize = 100;

/// Default long-poll accept-byte budget offered to the server.
pub const DEFAULT_REQUEST_BUFFER_BYTES: usize = 4192;

// =============================================================================
// Sections
// =============================================================================

/// Cloud endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the cloud messaging endpoint.
    pub url: String,

    /// Endpoint id assigned to this client after activation.
    #[serde(default)]
    pub endpoint_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            url: String::new(),
            endpoint_id: String::new(),
        }
    }
}

/// Queue capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued outbound messages.
    #[serde(default = "default_message_capacity")]
    pub message_capacity: usize,

    /// Maximum queued storage transfers.
    #[serde(default = "default_storage_capacity")]
    pub storage_capacity: usize,
}

fn default_message_capacity() -> usize {
    DEFAULT_MESSAGE_CAPACITY
}

fn default_storage_capacity() -> usize {
    DEFAULT_STORAGE_CAPACITY
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            message_capacity: default_message_capacity(),
            storage_capacity: default_storage_capacity(),
        }
    }
}

/// Scheduler polling behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval between scheduler sweeps, milliseconds. Subject to the
    /// global floor.
    #[serde(default = "default_polling_interval")]
    pub interval_ms: u64,

    /// Maximum messages per connection batch.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Whether the server supports held-open receive calls.
    #[serde(default = "default_long_polling")]
    pub long_polling: bool,
}

fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL_MS
}

fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH
}

fn default_long_polling() -> bool {
    true
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval_ms: default_polling_interval(),
            max_batch: default_max_batch(),
            long_polling: default_long_polling(),
        }
    }
}

/// Timeouts and buffer sizes for the transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bound on every ordinary send/receive call, seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Bound on a long-poll receive call, seconds. Deliberately longer
    /// than the connect timeout so the server can hold the request open.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,

    /// Accept-byte budget offered during long-poll negotiation.
    #[serde(default = "default_request_buffer")]
    pub request_buffer_bytes: usize,
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_receive_timeout() -> u64 {
    100
}

fn default_request_buffer() -> usize {
    DEFAULT_REQUEST_BUFFER_BYTES
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout_secs: default_connect_timeout(),
            receive_timeout_secs: default_receive_timeout(),
            request_buffer_bytes: default_request_buffer(),
        }
    }
}

// =============================================================================
// Client Config
// =============================================================================

/// Complete configuration for one client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl ClientConfig {
    /// Parses a TOML document and applies environment overrides.
    pub fn from_toml(toml_text: &str) -> ClientResult<Self> {
        let mut config: ClientConfig = toml::from_str(toml_text)?;
        config.apply_env();
        Ok(config)
    }

    /// Applies `CLOUDLINK_*` environment overrides on top of the parsed
    /// values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CLOUDLINK_SERVER_URL") {
            self.server.url = url;
        }
        if let Ok(endpoint_id) = std::env::var("CLOUDLINK_ENDPOINT_ID") {
            self.server.endpoint_id = endpoint_id;
        }
        if let Ok(value) = std::env::var("CLOUDLINK_POLLING_INTERVAL_MS") {
            match value.parse() {
                Ok(interval) => self.polling.interval_ms = interval,
                Err(_) => warn!(value = %value, "Ignoring non-numeric CLOUDLINK_POLLING_INTERVAL_MS"),
            }
        }
        if let Ok(value) = std::env::var("CLOUDLINK_MAX_BATCH") {
            match value.parse() {
                Ok(max_batch) => self.polling.max_batch = max_batch,
                Err(_) => warn!(value = %value, "Ignoring non-numeric CLOUDLINK_MAX_BATCH"),
            }
        }
        if let Ok(value) = std::env::var("CLOUDLINK_LONG_POLLING") {
            self.polling.long_polling = value != "false" && value != "0";
        }
    }

    /// Validates the configuration before a dispatcher is built from it.
    pub fn validate(&self) -> ClientResult<()> {
        if self.server.url.trim().is_empty() {
            return Err(ClientError::InvalidConfig("server.url is required".into()));
        }
        url::Url::parse(&self.server.url)?;

        if self.queue.message_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "queue.message_capacity must be at least 1".into(),
            ));
        }
        if self.queue.storage_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "queue.storage_capacity must be at least 1".into(),
            ));
        }
        if self.polling.max_batch == 0 {
            return Err(ClientError::InvalidConfig(
                "polling.max_batch must be at least 1".into(),
            ));
        }
        if self.transport.receive_timeout_secs < self.transport.connect_timeout_secs {
            return Err(ClientError::InvalidConfig(
                "transport.receive_timeout_secs must not be shorter than connect_timeout_secs"
                    .into(),
            ));
        }
        Ok(())
    }

    /// The effective sweep interval: configured value clamped to the
    /// global floor.
    pub fn effective_polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms.max(MIN_POLLING_INTERVAL_MS))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.connect_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.receive_timeout_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
