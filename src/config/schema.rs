//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a messenger.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for a messenger instance.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MessengerConfig {
    /// Who this messenger is.
    pub identity: IdentityConfig,

    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Reconnect backoff.
    pub backoff: BackoffConfig,

    /// Dispatch queue tuning and budget.
    pub dispatch: DispatchConfig,

    /// Wire integrity checks and limits.
    pub wire: WireConfig,

    /// Policy for peer types without an explicit entry.
    pub default_policy: PolicyConfig,

    /// Per peer type policies, keyed by type name (`osd`, `client`, ...).
    pub policies: BTreeMap<String, PolicyConfig>,

    /// Fault and delay injection for testing.
    pub inject: InjectConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Entity identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Entity name, e.g. "osd.0". An ordinal of `?` means unassigned.
    pub name: String,

    /// Address nonce. 0 picks a random nonce at startup.
    pub nonce: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "client.?".to_string(),
            nonce: 0,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Accept incoming sessions. Pure clients leave this off.
    pub enabled: bool,

    /// Bind address (e.g., "0.0.0.0:6800").
    pub bind_address: String,

    /// Maximum concurrently accepted streams (backpressure).
    pub max_connections: usize,

    /// Disable Nagle on every stream.
    pub nodelay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:6800".to_string(),
            max_connections: 10_000,
            nodelay: true,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP connect timeout in milliseconds.
    pub connect_ms: u64,

    /// Whole-handshake timeout in milliseconds.
    pub handshake_ms: u64,

    /// Peer liveness: a stream with no inbound bytes for this long faults.
    pub read_secs: u64,

    /// How long a socket that lost a connect race waits to be replaced
    /// before it tries again.
    pub wait_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            handshake_ms: 10_000,
            read_secs: 900,
            wait_ms: 10_000,
        }
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay after a failed reconnect, in milliseconds.
    pub initial_ms: u64,

    /// Upper bound for the doubling delay, in milliseconds.
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 200,
            max_ms: 15_000,
        }
    }
}

/// Dispatch queue tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Token cap for each priority level.
    pub max_tokens_per_priority: u64,

    /// Smallest cost charged for one message.
    pub min_cost: u64,

    /// Bytes of received messages allowed to wait for dispatch. 0 disables.
    pub throttle_bytes: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_priority: 16_777_216,
            min_cost: 65_536,
            throttle_bytes: 100 << 20,
        }
    }
}

/// Wire integrity settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WireConfig {
    /// Verify the header CRC on receive.
    pub crc_header: bool,

    /// Compute data CRCs on send and verify payload CRCs on receive.
    pub crc_data: bool,

    /// Largest accepted message payload in bytes.
    pub max_message_bytes: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            crc_header: true,
            crc_data: true,
            max_message_bytes: 256 << 20,
        }
    }
}

/// Named connection policy presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Lossless, reconnecting, reset-checking.
    #[default]
    Standard,
    LossyClient,
    LosslessPeer,
    LosslessPeerReuse,
    LosslessClient,
    StatefulServer,
    StatelessServer,
}

/// Policy for one peer type.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PolicyConfig {
    pub kind: PolicyKind,

    /// Byte budget for messages received from this peer type. 0 disables.
    pub throttle_bytes: u64,

    /// Message count budget for this peer type. 0 disables.
    pub throttle_messages: u64,

    /// Feature bits a peer must advertise.
    pub features_required: u64,
}

/// Fault and delay injection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InjectConfig {
    /// Fail a stream on average once every N reads or writes. 0 disables.
    pub socket_failures: u32,

    /// Peer types whose inbound messages go through delayed delivery.
    pub delay_types: Vec<String>,

    /// Longest injected delay in milliseconds.
    pub delay_max_ms: u64,

    /// Probability that a given message is delayed.
    pub delay_probability: f64,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            socket_failures: 0,
            delay_types: Vec::new(),
            delay_max_ms: 0,
            delay_probability: 0.0,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or filter directives.
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
