//! # skein-transport
//!
//! Transport adapter contract for the skein mesh overlay, plus reference
//! adapters.
//!
//! The mesh layer is polymorphic over one-hop transports: anything that can
//! discover nearby peers and move whole text payloads between them can join
//! the mesh by implementing [`TransportAdapter`]. This crate ships:
//!
//! - [`tcp::TcpAdapter`] — direct-socket mode: line-delimited text over TCP
//!   with a JSON hello handshake and seed-list discovery,
//! - [`chunked::ChunkedAdapter`] — message-passing mode: wraps any adapter
//!   behind a small MTU with transparent `CHUNK:index:total:` framing,
//! - [`memory::MemoryAdapter`] — in-process hub transport for tests and
//!   multi-node demos.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod chunked;
pub mod memory;
pub mod tcp;

pub use adapter::{
    AdapterEvent, DiscoveredPeer, PeerState, TransportAdapter, TransportError, TransportResult,
    TransportType,
};
pub use chunked::{ChunkedAdapter, DEFAULT_MESSAGE_MTU};
pub use memory::{MemoryAdapter, MemoryHub};
pub use tcp::{TcpAdapter, TcpAdapterConfig};
