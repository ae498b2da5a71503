//! Transport adapter contract for the skein mesh overlay.
//!
//! This module defines the `TransportAdapter` trait that abstracts over
//! different one-hop transports (TCP sockets, small-MTU message passing,
//! in-process hubs, ...). The mesh layer drives every transport through this
//! contract and never observes the differences between them.
//!
//! An adapter owes the mesh three things:
//! - a way to learn nearby peers (`start_discovery` / `start_advertising`),
//! - a bidirectional text channel per connected peer (`connect` / `send`),
//! - an event stream reporting discoveries, state changes and inbound text.
//!
//! Contract guarantees the mesh relies on:
//! - the `peer_id` surfaced in inbound events equals the id previously
//!   reported as connected,
//! - `send` is FIFO per peer,
//! - disconnect-then-discovered is a valid re-learn sequence,
//! - text payloads are delivered whole (any chunking/reassembly happens
//!   below this line).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use tokio::sync::broadcast;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Adapter is not available on this platform/hardware
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Adapter has been disposed
    #[error("Transport is closed")]
    Closed,

    /// Connection establishment failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation targets a peer without an established channel
    #[error("Peer not connected: {0}")]
    NotConnected(String),

    /// Operation targets a peer this adapter has never discovered
    #[error("Peer unknown to this transport: {0}")]
    UnknownPeer(String),

    /// Malformed handshake or frame from the remote side
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Tag identifying which kind of link a peer was learned on.
///
/// These tags are wire-stable: they appear inside serialized peer
/// descriptors exchanged between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    /// Wi-Fi Aware data path
    WifiAware,
    /// Wi-Fi Direct group link
    WifiDirect,
    /// Bluetooth Low Energy
    Ble,
    /// Plain LAN socket
    Lan,
    /// WebRTC data channel
    Webrtc,
    /// Unidentified link
    #[default]
    Unknown,
}

/// Connection state of a peer as observed by a transport or the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    /// Learned via discovery, no channel yet
    Discovered,
    /// Channel establishment in progress
    Connecting,
    /// Bidirectional channel established
    Connected,
    /// Channel established but lossy/slow
    Degraded,
    /// Channel torn down
    Disconnected,
    /// No proof of life within the stale window
    Stale,
}

/// Peer descriptor as reported by a transport adapter.
///
/// This is the adapter-level view of a peer: identity, display name and
/// whatever addressing the transport needs to reach it. The mesh layer
/// enriches it into a routing-table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    /// Globally unique peer id (opaque string, typically a UUID)
    pub id: String,

    /// Display name, never used for identity
    pub username: String,

    /// Which kind of link this peer was learned on
    #[serde(default)]
    pub transport_type: TransportType,

    /// Transport-specific address, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Transport-specific port, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Opaque adapter/application metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DiscoveredPeer {
    /// Minimal descriptor with just identity and display name.
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            transport_type: TransportType::Unknown,
            address: None,
            port: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the transport tag.
    #[must_use]
    pub fn with_transport(mut self, transport_type: TransportType) -> Self {
        self.transport_type = transport_type;
        self
    }

    /// Set the transport address/port.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = Some(address.into());
        self.port = Some(port);
        self
    }
}

/// Events emitted by a transport adapter.
///
/// The three §4.3 observable streams, multiplexed on one broadcast channel:
/// discoveries, state changes, and inbound text.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A nearby peer was learned via discovery.
    PeerDiscovered(DiscoveredPeer),

    /// A previously known peer changed state.
    PeerStateChanged {
        /// Which peer
        peer_id: String,
        /// Its new state
        state: PeerState,
    },

    /// A whole text payload arrived from a connected peer.
    MessageReceived {
        /// Which connected peer sent it
        peer_id: String,
        /// The payload, delivered whole
        text: String,
    },
}

/// Capability contract every transport must satisfy.
///
/// All methods take `&self`; adapters keep their mutable state behind
/// interior locks so the mesh can hold them as `Arc<dyn TransportAdapter>`.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Short tag naming this adapter in logs (e.g. `"tcp"`, `"memory"`).
    fn name(&self) -> &str;

    /// Which kind of links this adapter produces.
    fn transport_type(&self) -> TransportType;

    /// Platform/hardware probe. Called once before `initialize`.
    fn is_available(&self) -> bool;

    /// Idempotent one-time setup (bind sockets, spawn accept loops, ...).
    async fn initialize(&self) -> TransportResult<()>;

    /// Begin passive learning of nearby peers for `service_name`.
    async fn start_discovery(&self, service_name: &str) -> TransportResult<()>;

    /// Stop passive learning.
    async fn stop_discovery(&self) -> TransportResult<()>;

    /// Make ourselves findable as `local_peer` under `service_name`.
    async fn start_advertising(
        &self,
        local_peer: &DiscoveredPeer,
        service_name: &str,
    ) -> TransportResult<()>;

    /// Stop being findable.
    async fn stop_advertising(&self) -> TransportResult<()>;

    /// Establish a bidirectional text channel to a discovered peer.
    ///
    /// Returns the connected peer's descriptor. Connecting to an already
    /// connected peer is idempotent and returns the existing descriptor.
    async fn connect(&self, peer_id: &str) -> TransportResult<DiscoveredPeer>;

    /// Tear the channel down. Emits `PeerStateChanged(Disconnected)`.
    async fn disconnect(&self, peer_id: &str) -> TransportResult<()>;

    /// Best-effort whole-text delivery to a connected peer. FIFO per peer.
    async fn send(&self, peer_id: &str, text: &str) -> TransportResult<()>;

    /// Release every resource. The adapter is unusable afterwards.
    async fn dispose(&self) -> TransportResult<()>;

    /// Subscribe to this adapter's event stream.
    ///
    /// Multiple subscribers are admissible; events are broadcast.
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;

    /// Snapshot of peers currently holding an established channel.
    fn connected_peers(&self) -> Vec<DiscoveredPeer>;

    /// Snapshot of peers learned via discovery (connected or not).
    fn discovered_peers(&self) -> Vec<DiscoveredPeer>;

    /// Whether `peer_id` currently holds an established channel.
    fn is_connected(&self, peer_id: &str) -> bool {
        self.connected_peers().iter().any(|p| p.id == peer_id)
    }
}
