//! Channel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// How local connections share the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    /// Concurrent local connections, each with its own connection id
    #[default]
    Multiplexed,
    /// One local connection at a time on connection id 0
    Single,
}

/// Tunables for one forwarding channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Largest data payload requested during the handshake
    pub max_frame_size: usize,
    /// Maximum unacknowledged bytes in flight
    pub max_window: usize,
    /// How often the retransmission scan runs
    pub retransmit_interval: Duration,
    /// Initial retransmission timeout per fragment
    pub retransmit_timeout: Duration,
    /// Cap for the per-fragment exponential backoff
    pub max_retransmit_backoff: Duration,
    /// Retransmissions allowed per fragment before the channel fails
    pub max_retries: u32,
    /// Longest time with unacknowledged data and no ack progress
    pub max_stall: Duration,
    /// Bytes of out-of-order data buffered before the channel fails
    pub inbound_buffer_limit: usize,
    /// Delay before acknowledging in-order data
    pub ack_delay: Duration,
    pub handshake_timeout: Duration,
    /// How long a graceful shutdown waits for outstanding acknowledgments
    pub shutdown_grace: Duration,
    /// Schema versions offered during the handshake
    pub schema_versions: Vec<u32>,
    pub mode: ForwardingMode,
    /// Capacity of the bounded queues between tasks
    pub queue_depth: usize,
    /// Agent side: how long dialing the target may take
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024,
            max_window: 256 * 1024,
            retransmit_interval: Duration::from_millis(200),
            retransmit_timeout: Duration::from_secs(1),
            max_retransmit_backoff: Duration::from_secs(8),
            max_retries: 8,
            max_stall: Duration::from_secs(60),
            inbound_buffer_limit: 1024 * 1024,
            ack_delay: Duration::from_millis(20),
            handshake_timeout: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(5),
            schema_versions: relayport_proto::SUPPORTED_SCHEMA_VERSIONS.to_vec(),
            mode: ForwardingMode::Multiplexed,
            queue_depth: 64,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ChannelConfig {
    pub fn with_mode(mut self, mode: ForwardingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_window(mut self, max_frame_size: usize, max_window: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self.max_window = max_window;
        self
    }

    pub fn with_retransmit(mut self, interval: Duration, timeout: Duration) -> Self {
        self.retransmit_interval = interval;
        self.retransmit_timeout = timeout;
        self
    }

    /// Check the invariants the engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_frame = relayport_proto::Segment::HEADER_SIZE + 1;
        if self.max_frame_size < min_frame {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be at least {} bytes",
                min_frame
            )));
        }
        if self.max_frame_size > relayport_proto::MAX_FRAME_SIZE as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size exceeds the protocol ceiling of {} bytes",
                relayport_proto::MAX_FRAME_SIZE
            )));
        }
        if self.max_window < self.max_frame_size {
            return Err(ConfigError::Invalid(format!(
                "max_window ({}) must be at least max_frame_size ({})",
                self.max_window, self.max_frame_size
            )));
        }
        if self.inbound_buffer_limit == 0 {
            return Err(ConfigError::Invalid(
                "inbound_buffer_limit must be non-zero".to_string(),
            ));
        }
        if self.retransmit_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "retransmit_interval must be non-zero".to_string(),
            ));
        }
        if self.retransmit_timeout < self.retransmit_interval {
            return Err(ConfigError::Invalid(
                "retransmit_timeout must not be shorter than retransmit_interval".to_string(),
            ));
        }
        if self.max_retransmit_backoff < self.retransmit_timeout {
            return Err(ConfigError::Invalid(
                "max_retransmit_backoff must not be shorter than retransmit_timeout".to_string(),
            ));
        }
        if self.schema_versions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one schema version must be offered".to_string(),
            ));
        }
        if let Some(v) = self
            .schema_versions
            .iter()
            .find(|v| !relayport_proto::is_supported_schema(**v))
        {
            return Err(ConfigError::Invalid(format!(
                "schema version {} is not supported",
                v
            )));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "queue_depth must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
