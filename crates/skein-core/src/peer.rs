//! Peer routing-table entries.
//!
//! A [`Peer`] is the mesh-level view of a node: the adapter-level
//! descriptor enriched with routing state (hop count, next hop, liveness).
//! Identity is the `id` string alone; every other field is mutable state.
//!
//! Invariant: `hop_count == 0` if and only if `next_hop_peer_id` is `None`.
//! Direct peers are reached on a one-hop link; indirect peers are reached
//! by first sending to their next hop.

use serde::{Deserialize, Serialize};
use skein_transport::{DiscoveredPeer, PeerState, TransportType};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A peer as known to the routing layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Globally unique identity (opaque string, typically a UUID)
    pub id: String,

    /// Display name, never used for identity
    pub username: String,

    /// Which kind of link this peer was learned on
    #[serde(default)]
    pub transport_type: TransportType,

    /// Connection state
    pub state: PeerState,

    /// Transport-specific address, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Transport-specific port, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Last proof of life, epoch milliseconds
    pub last_seen_at: u64,

    /// Distance in forwarding hops; 0 means directly connected
    #[serde(default)]
    pub hop_count: u32,

    /// Direct peer this one is reachable through; `None` iff direct
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_peer_id: Option<String>,

    /// Opaque application metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Peer {
    /// A directly connected peer entry from an adapter descriptor.
    pub fn direct(descriptor: &DiscoveredPeer) -> Self {
        Self {
            id: descriptor.id.clone(),
            username: descriptor.username.clone(),
            transport_type: descriptor.transport_type,
            state: PeerState::Connected,
            address: descriptor.address.clone(),
            port: descriptor.port,
            last_seen_at: now_ms(),
            hop_count: 0,
            next_hop_peer_id: None,
            metadata: descriptor.metadata.clone(),
        }
    }

    /// The local node's self-description for announcements.
    pub fn local(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            transport_type: TransportType::Unknown,
            state: PeerState::Connected,
            address: None,
            port: None,
            last_seen_at: now_ms(),
            hop_count: 0,
            next_hop_peer_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Whether this peer sits on a one-hop link.
    pub fn is_direct(&self) -> bool {
        self.hop_count == 0
    }
}
