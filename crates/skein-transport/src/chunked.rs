//! Small-MTU message-passing mode.
//!
//! Some transports cap each send at a tiny MTU (Wi-Fi Aware follow-up
//! messages sit around 255 bytes). `ChunkedAdapter` wraps any inner adapter
//! and hides that limit: outbound payloads larger than the MTU are split
//! into `CHUNK:index:total:` framed pieces, inbound pieces are reassembled
//! in FIFO order and surfaced as one whole text. Layers above never observe
//! the difference.
//!
//! Reassembly leans on the per-peer FIFO guarantee of the adapter contract:
//! one in-progress assembly per peer is enough, and any out-of-sequence
//! piece voids the whole assembly.

use crate::adapter::{
    AdapterEvent, DiscoveredPeer, PeerState, TransportAdapter, TransportError, TransportResult,
    TransportType,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// MTU of the Wi-Fi Aware style message path.
pub const DEFAULT_MESSAGE_MTU: usize = 255;

const CHUNK_PREFIX: &str = "CHUNK:";
/// Worst-case header: `CHUNK:` + 4-digit index + `:` + 4-digit total + `:`.
const CHUNK_OVERHEAD: usize = 16;

/// Split `text` into char-safe pieces of at most `capacity` bytes.
fn split_char_safe(text: &str, capacity: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = capacity.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (piece, tail) = rest.split_at(end);
        pieces.push(piece);
        rest = tail;
    }
    pieces
}

/// Frame `text` into MTU-bounded chunks. Texts that already fit are
/// returned unframed.
fn encode_chunks(text: &str, mtu: usize) -> Vec<String> {
    if text.len() <= mtu {
        return vec![text.to_string()];
    }
    let capacity = mtu.saturating_sub(CHUNK_OVERHEAD).max(1);
    let pieces = split_char_safe(text, capacity);
    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| format!("{CHUNK_PREFIX}{index}:{total}:{piece}"))
        .collect()
}

/// Parsed `CHUNK:index:total:payload` frame.
struct ChunkFrame<'a> {
    index: usize,
    total: usize,
    payload: &'a str,
}

fn parse_chunk(text: &str) -> Option<ChunkFrame<'_>> {
    let rest = text.strip_prefix(CHUNK_PREFIX)?;
    let mut parts = rest.splitn(3, ':');
    let index = parts.next()?.parse().ok()?;
    let total = parts.next()?.parse().ok()?;
    let payload = parts.next()?;
    if total == 0 || index >= total {
        return None;
    }
    Some(ChunkFrame {
        index,
        total,
        payload,
    })
}

/// One in-flight reassembly per peer.
struct Assembly {
    total: usize,
    received: usize,
    buffer: String,
}

/// Adapter wrapper that transparently chunks over a bounded-MTU transport.
pub struct ChunkedAdapter {
    inner: Arc<dyn TransportAdapter>,
    mtu: usize,
    name: String,
    events: broadcast::Sender<AdapterEvent>,
    assemblies: Arc<Mutex<HashMap<String, Assembly>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChunkedAdapter {
    /// Wrap `inner`, enforcing `mtu` bytes per underlying send.
    pub fn new(inner: Arc<dyn TransportAdapter>, mtu: usize) -> Self {
        let name = format!("{}-chunked", inner.name());
        let (events, _) = broadcast::channel(1024);
        Self {
            inner,
            mtu,
            name,
            events,
            assemblies: Arc::new(Mutex::new(HashMap::new())),
            pump: Mutex::new(None),
        }
    }

    /// Wrap `inner` with the default message-path MTU.
    pub fn with_default_mtu(inner: Arc<dyn TransportAdapter>) -> Self {
        Self::new(inner, DEFAULT_MESSAGE_MTU)
    }

    /// Feed one inbound text through the reassembler; returns a completed
    /// whole text when an assembly closes.
    fn accept(
        assemblies: &Mutex<HashMap<String, Assembly>>,
        peer_id: &str,
        text: String,
    ) -> Option<String> {
        let Some(frame) = parse_chunk(&text) else {
            // Unframed text below the MTU passes straight through.
            return Some(text);
        };

        let mut assemblies = assemblies.lock().expect("assembly lock poisoned");
        if frame.index == 0 {
            if assemblies.remove(peer_id).is_some() {
                tracing::warn!(peer = peer_id, "dropping incomplete chunk assembly");
            }
            assemblies.insert(
                peer_id.to_string(),
                Assembly {
                    total: frame.total,
                    received: 0,
                    buffer: String::new(),
                },
            );
        }

        let Some(assembly) = assemblies.get_mut(peer_id) else {
            tracing::warn!(peer = peer_id, index = frame.index, "chunk without assembly");
            return None;
        };
        if frame.index != assembly.received || frame.total != assembly.total {
            tracing::warn!(
                peer = peer_id,
                expected = assembly.received,
                got = frame.index,
                "out-of-sequence chunk, voiding assembly"
            );
            assemblies.remove(peer_id);
            return None;
        }

        assembly.buffer.push_str(frame.payload);
        assembly.received += 1;
        if assembly.received == assembly.total {
            return assemblies.remove(peer_id).map(|done| done.buffer);
        }
        None
    }
}

#[async_trait]
impl TransportAdapter for ChunkedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn transport_type(&self) -> TransportType {
        self.inner.transport_type()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn initialize(&self) -> TransportResult<()> {
        self.inner.initialize().await?;

        let mut pump = self.pump.lock().expect("pump lock poisoned");
        if pump.is_some() {
            return Ok(());
        }

        let mut inner_rx = self.inner.subscribe();
        let events = self.events.clone();
        let assemblies = Arc::clone(&self.assemblies);
        *pump = Some(tokio::spawn(async move {
            loop {
                match inner_rx.recv().await {
                    Ok(AdapterEvent::MessageReceived { peer_id, text }) => {
                        if let Some(whole) = Self::accept(&assemblies, &peer_id, text) {
                            let _ = events.send(AdapterEvent::MessageReceived {
                                peer_id,
                                text: whole,
                            });
                        }
                    }
                    Ok(event) => {
                        if let AdapterEvent::PeerStateChanged {
                            peer_id,
                            state: PeerState::Disconnected,
                        } = &event
                        {
                            assemblies
                                .lock()
                                .expect("assembly lock poisoned")
                                .remove(peer_id);
                        }
                        let _ = events.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "chunk pump lagged behind inner adapter");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        Ok(())
    }

    async fn start_discovery(&self, service_name: &str) -> TransportResult<()> {
        self.inner.start_discovery(service_name).await
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        self.inner.stop_discovery().await
    }

    async fn start_advertising(
        &self,
        local_peer: &DiscoveredPeer,
        service_name: &str,
    ) -> TransportResult<()> {
        self.inner.start_advertising(local_peer, service_name).await
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        self.inner.stop_advertising().await
    }

    async fn connect(&self, peer_id: &str) -> TransportResult<DiscoveredPeer> {
        self.inner.connect(peer_id).await
    }

    async fn disconnect(&self, peer_id: &str) -> TransportResult<()> {
        self.inner.disconnect(peer_id).await
    }

    async fn send(&self, peer_id: &str, text: &str) -> TransportResult<()> {
        for chunk in encode_chunks(text, self.mtu) {
            if chunk.len() > self.mtu {
                return Err(TransportError::Protocol(format!(
                    "chunk exceeds MTU ({} > {})",
                    chunk.len(),
                    self.mtu
                )));
            }
            self.inner.send(peer_id, &chunk).await?;
        }
        Ok(())
    }

    async fn dispose(&self) -> TransportResult<()> {
        if let Some(pump) = self.pump.lock().expect("pump lock poisoned").take() {
            pump.abort();
        }
        self.inner.dispose().await
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    fn connected_peers(&self) -> Vec<DiscoveredPeer> {
        self.inner.connected_peers()
    }

    fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.inner.discovered_peers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAdapter, MemoryHub};

    #[test]
    fn test_short_text_unframed() {
        let chunks = encode_chunks("hello", 255);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn test_long_text_framed_within_mtu() {
        let text = "x".repeat(1000);
        let chunks = encode_chunks(&text, 255);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 255);
            assert!(chunk.starts_with("CHUNK:"));
        }
    }

    #[test]
    fn test_chunk_headers_sequential() {
        let text = "y".repeat(600);
        let chunks = encode_chunks(&text, 255);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            let frame = parse_chunk(chunk).unwrap();
            assert_eq!(frame.index, i);
            assert_eq!(frame.total, total);
        }
    }

    #[test]
    fn test_encode_decode_reassembles() {
        let text = "päylöad-".repeat(200);
        let assemblies = Mutex::new(HashMap::new());
        let mut out = None;
        for chunk in encode_chunks(&text, 255) {
            out = ChunkedAdapter::accept(&assemblies, "p1", chunk);
        }
        assert_eq!(out.as_deref(), Some(text.as_str()));
    }

    #[test]
    fn test_multibyte_boundary_split() {
        // 3-byte chars must never be split mid-codepoint.
        let text = "€".repeat(500);
        for chunk in encode_chunks(&text, 100) {
            assert!(chunk.len() <= 100);
            let frame = parse_chunk(&chunk).unwrap();
            assert!(frame.payload.chars().all(|c| c == '€'));
        }
    }

    #[test]
    fn test_out_of_sequence_voids_assembly() {
        let assemblies = Mutex::new(HashMap::new());
        assert!(ChunkedAdapter::accept(&assemblies, "p1", "CHUNK:0:3:aa".into()).is_none());
        // Skip index 1 entirely.
        assert!(ChunkedAdapter::accept(&assemblies, "p1", "CHUNK:2:3:cc".into()).is_none());
        assert!(assemblies.lock().unwrap().is_empty());
    }

    #[test]
    fn test_plain_text_passes_through() {
        let assemblies = Mutex::new(HashMap::new());
        let out = ChunkedAdapter::accept(&assemblies, "p1", "just a line".into());
        assert_eq!(out.as_deref(), Some("just a line"));
    }

    #[test]
    fn test_malformed_chunk_header_treated_as_text() {
        // Non-numeric index fails the frame parse and rides through whole.
        let assemblies = Mutex::new(HashMap::new());
        let out = ChunkedAdapter::accept(&assemblies, "p1", "CHUNK:x:y:z".into());
        assert_eq!(out.as_deref(), Some("CHUNK:x:y:z"));
    }

    #[tokio::test]
    async fn test_end_to_end_over_memory_hub() {
        let hub = MemoryHub::new();
        let a = ChunkedAdapter::new(
            Arc::new(MemoryAdapter::new(
                Arc::clone(&hub),
                DiscoveredPeer::new("a", "alice"),
            )),
            64,
        );
        let b = ChunkedAdapter::new(
            Arc::new(MemoryAdapter::new(
                Arc::clone(&hub),
                DiscoveredPeer::new("b", "bob"),
            )),
            64,
        );
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        a.connect("b").await.unwrap();

        let mut b_events = b.subscribe();
        let text = "0123456789".repeat(40);
        a.send("b", &text).await.unwrap();

        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), b_events.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            if let AdapterEvent::MessageReceived { peer_id, text: got } = event {
                assert_eq!(peer_id, "a");
                assert_eq!(got, text);
                break;
            }
        }
    }
}
