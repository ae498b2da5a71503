//! # skein-core
//!
//! Core of the skein peer-to-peer mesh overlay: a transport-agnostic layer
//! that discovers peers, maintains routing state, forwards messages across
//! multiple hops with loop prevention, and delivers messages destined for
//! the local node.
//!
//! Three subsystems compose the core:
//! - [`Router`] — routing table, dedup cache, TTL-bounded forwarding,
//!   peer-health tracking,
//! - [`MeshNode`] — fan-out over transport adapters, auto-connect policy,
//!   the periodic announce protocol, dispatch of control messages,
//! - [`wire`] — single-line JSON framing on every adapter byte-pipe.
//!
//! Transports plug in through `skein_transport::TransportAdapter`; the
//! mesh never observes which radio or socket carries a link.
//!
//! ```no_run
//! use skein_core::{MeshNode, NodeConfig};
//! use skein_transport::{DiscoveredPeer, MemoryAdapter, MemoryHub};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = MemoryHub::new();
//!     let config = NodeConfig::new("alice");
//!     let descriptor = DiscoveredPeer::new(&config.peer_id, &config.username);
//!     let node = MeshNode::new(config);
//!     node.add_adapter(Arc::new(MemoryAdapter::new(hub, descriptor)))
//!         .await?;
//!     node.start().await?;
//!
//!     let mut messages = node.on_message();
//!     node.broadcast("hello mesh", vec![], Default::default(), None)?;
//!     if let Ok(message) = messages.recv().await {
//!         println!("got {}", message.id);
//!     }
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dedup;
pub mod error;
pub mod message;
pub mod node;
pub mod peer;
pub mod router;
pub mod wire;

pub use error::{MeshError, Result};
pub use message::{
    DataPayload, FileChunkPayload, FileCompletePayload, FileInfo, Message, MessageType,
    PeerAnnounce, PongPayload,
};
pub use node::{FileProgressEvent, MeshNode, NodeConfig, PeerEvent};
pub use peer::Peer;
pub use router::{Delivery, OutboundSend, Router, RouterStats};
pub use skein_transport::{PeerState, TransportType};

use std::time::Duration;

/// Hop budget for locally originated messages.
pub const DEFAULT_MESH_TTL: u32 = 5;

/// Hard ceiling on any message's hop budget.
pub const MAX_MESH_TTL: u32 = 15;

/// Period of the peer health scan.
pub const PEER_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Silence threshold after which a peer is marked stale.
pub const PEER_STALE_TIMEOUT: Duration = Duration::from_secs(90);

/// Period of the self-announce broadcast.
pub const PEER_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(15);

/// Window inside which a message id counts as already seen.
pub const MESSAGE_DEDUPLICATION_WINDOW: Duration = Duration::from_secs(300);

/// Hard cap on dedup cache entries.
pub const MAX_DEDUPLICATION_CACHE_SIZE: usize = 10_000;

/// Chunk size hosts advertise for file transfers.
pub const DEFAULT_FILE_CHUNK_SIZE: u32 = 65_536;

/// Concurrent file transfers allowed per peer.
pub const MAX_CONCURRENT_FILE_TRANSFERS: usize = 3;

/// Service name nodes discover and advertise under by default.
pub const DEFAULT_SERVICE_NAME: &str = "flutter_p2p_mesh";
