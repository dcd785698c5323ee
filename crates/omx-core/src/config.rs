//! Session and registry configuration.

use std::time::Duration;

use omx_proto::{MAX_FRAME_SIZE, MessageHeader};

/// Limits applied to every session of a service.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `connect` waits for the broker's response.
    pub handshake_timeout: Duration,
    /// Largest frame (header included) `write` transmits; longer payloads
    /// are truncated.
    pub max_frame_size: usize,
}

impl SessionConfig {
    /// Payload bytes that fit in one frame.
    pub fn max_payload(&self) -> usize {
        self.max_frame_size.saturating_sub(MessageHeader::SIZE)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { handshake_timeout: Duration::from_secs(5), max_frame_size: MAX_FRAME_SIZE }
    }
}

/// Service registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Number of minor identities available to services.
    pub max_services: usize,
    /// Configuration handed to every service's sessions.
    pub session: SessionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_services: 8, session: SessionConfig::default() }
    }
}
