//! Mesh node configuration.

use crate::{
    DEFAULT_MESH_TTL, DEFAULT_SERVICE_NAME, MAX_DEDUPLICATION_CACHE_SIZE,
    MESSAGE_DEDUPLICATION_WINDOW, PEER_ANNOUNCE_INTERVAL, PEER_HEALTH_CHECK_INTERVAL,
    PEER_STALE_TIMEOUT,
};
use std::time::Duration;
use uuid::Uuid;

/// Configuration for one mesh node.
///
/// Only `username` has no sensible default; everything else falls back to
/// the wire-compatible tunables in the crate root.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Display name shown to other nodes (required)
    pub username: String,

    /// Stable peer identity; a fresh v4 UUID when omitted
    pub peer_id: String,

    /// Service name used for discovery and advertising
    pub service_name: String,

    /// Hop budget for locally originated messages
    pub default_ttl: u32,

    /// Connect to discovered peers automatically
    pub auto_connect: bool,

    /// Start advertising on every adapter at startup
    pub auto_advertise: bool,

    /// Period of the self-announce broadcast
    pub announce_interval: Duration,

    /// Period of the peer health scan
    pub health_check_interval: Duration,

    /// Silence threshold after which a peer goes stale
    pub stale_timeout: Duration,

    /// Period and window of dedup cache cleanup
    pub dedup_window: Duration,

    /// Hard cap on dedup cache entries
    pub dedup_capacity: usize,
}

impl NodeConfig {
    /// Configuration for `username` with every default in place.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            peer_id: Uuid::new_v4().to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            default_ttl: DEFAULT_MESH_TTL,
            auto_connect: true,
            auto_advertise: true,
            announce_interval: PEER_ANNOUNCE_INTERVAL,
            health_check_interval: PEER_HEALTH_CHECK_INTERVAL,
            stale_timeout: PEER_STALE_TIMEOUT,
            dedup_window: MESSAGE_DEDUPLICATION_WINDOW,
            dedup_capacity: MAX_DEDUPLICATION_CACHE_SIZE,
        }
    }

    /// Pin the peer id instead of generating one.
    #[must_use]
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = peer_id.into();
        self
    }

    /// Override the discovery service name.
    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Override the default TTL for originated messages.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: u32) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Toggle auto-connect to discovered peers.
    #[must_use]
    pub fn with_auto_connect(mut self, on: bool) -> Self {
        self.auto_connect = on;
        self
    }

    /// Toggle advertising at startup.
    #[must_use]
    pub fn with_auto_advertise(mut self, on: bool) -> Self {
        self.auto_advertise = on;
        self
    }

    /// Override the announce period (tests compress this).
    #[must_use]
    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }
}
