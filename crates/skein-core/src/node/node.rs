//! Mesh node orchestrator.
//!
//! The node composes one [`Router`] with any number of transport adapters
//! and mediates between the two: adapter events feed the router, router
//! decisions fan back out onto adapters, timers drive the announce
//! protocol and the health/dedup sweeps. The router owns routing state,
//! the node owns adapter handles; neither touches the other's half.

use crate::error::{MeshError, Result};
use crate::message::{
    DataPayload, FileChunkPayload, FileCompletePayload, FileInfo, Message, MessageType,
    PeerAnnounce,
};
use crate::node::config::NodeConfig;
use crate::peer::Peer;
use crate::router::{OutboundSend, Router, RouterStats};
use crate::wire;
use dashmap::DashMap;
use skein_transport::{AdapterEvent, DiscoveredPeer, PeerState, TransportAdapter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 1024;

/// Outward peer stream events: router updates and removals, merged.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer was installed, refreshed or changed state
    Updated(Peer),

    /// A peer left the table
    Removed(String),
}

/// Progress of an inbound file transfer, counted from `fileChunk` and
/// `fileComplete` messages. Chunk assembly happens above this layer.
#[derive(Debug, Clone)]
pub struct FileProgressEvent {
    /// Peer the chunks come from
    pub peer_id: String,

    /// Which file
    pub file_id: String,

    /// Chunks seen so far
    pub received_chunks: u32,

    /// Total chunks the sender declared
    pub total_chunks: u32,

    /// Whether the sender declared the transfer complete
    pub complete: bool,
}

struct NodeInner {
    config: NodeConfig,
    router: Router,
    /// Adapters registered before start.
    candidates: Mutex<Vec<Arc<dyn TransportAdapter>>>,
    /// Adapters that probed available and initialized.
    active: Mutex<Vec<Arc<dyn TransportAdapter>>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundSend>>>,
    message_tx: broadcast::Sender<Message>,
    peer_tx: broadcast::Sender<PeerEvent>,
    file_progress_tx: broadcast::Sender<FileProgressEvent>,
    /// file_id -> (received, total)
    file_progress: DashMap<String, (u32, u32)>,
}

/// A mesh overlay node.
///
/// Clone-cheap handle; all state lives behind one `Arc`.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

impl MeshNode {
    /// Build a node from `config`. Adapters are registered with
    /// [`MeshNode::add_adapter`] before [`MeshNode::start`].
    pub fn new(config: NodeConfig) -> Self {
        let (router, outbound_rx) = Router::new(
            config.peer_id.clone(),
            config.username.clone(),
            config.stale_timeout.as_millis() as u64,
            config.dedup_capacity,
            config.dedup_window.as_millis() as u64,
        );
        let (message_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (peer_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (file_progress_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(NodeInner {
                config,
                router,
                candidates: Mutex::new(Vec::new()),
                active: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                outbound_rx: Mutex::new(Some(outbound_rx)),
                message_tx,
                peer_tx,
                file_progress_tx,
                file_progress: DashMap::new(),
            }),
        }
    }

    /// The local peer id.
    pub fn peer_id(&self) -> &str {
        &self.inner.config.peer_id
    }

    /// The local display name.
    pub fn username(&self) -> &str {
        &self.inner.config.username
    }

    /// Whether `start` has run and `stop` has not.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The router owning this node's routing state. Its raw streams
    /// (deliveries, peer updates, removals) are part of the public surface.
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Register a transport adapter. Only callable before `start`.
    pub async fn add_adapter(&self, adapter: Arc<dyn TransportAdapter>) -> Result<()> {
        if self.is_running() {
            return Err(MeshError::invalid_state(
                "adapters can only be added before start",
            ));
        }
        self.inner.candidates.lock().await.push(adapter);
        Ok(())
    }

    /// Start the node: probe and initialize adapters, subscribe to their
    /// streams, begin discovery (and advertising when configured), spawn
    /// the announce/health/dedup timers and the outbound send pump.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MeshError::invalid_state("node already running"));
        }

        tracing::info!(
            peer = %self.inner.config.peer_id,
            username = %self.inner.config.username,
            "starting mesh node"
        );

        let local_descriptor =
            DiscoveredPeer::new(&self.inner.config.peer_id, &self.inner.config.username);
        let candidates: Vec<Arc<dyn TransportAdapter>> =
            self.inner.candidates.lock().await.clone();
        let mut tasks = Vec::new();
        let mut active = Vec::new();

        for adapter in candidates {
            if !adapter.is_available() {
                tracing::info!(adapter = adapter.name(), "transport unavailable, skipping");
                continue;
            }
            if let Err(e) = adapter.initialize().await {
                tracing::warn!(adapter = adapter.name(), error = %e, "initialize failed");
                continue;
            }

            // Subscribe before discovery so no event slips past.
            let events = adapter.subscribe();
            tasks.push(tokio::spawn(Self::adapter_pump(
                self.clone(),
                Arc::clone(&adapter),
                events,
            )));

            if let Err(e) = adapter.start_discovery(&self.inner.config.service_name).await {
                tracing::warn!(adapter = adapter.name(), error = %e, "discovery failed to start");
            }
            if self.inner.config.auto_advertise {
                if let Err(e) = adapter
                    .start_advertising(&local_descriptor, &self.inner.config.service_name)
                    .await
                {
                    tracing::warn!(adapter = adapter.name(), error = %e, "advertising failed to start");
                }
            }
            active.push(adapter);
        }
        *self.inner.active.lock().await = active;

        // Link-layer send pump draining the router's outbound queue.
        let outbound_rx = match self.inner.outbound_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                // One node, one lifecycle: the send queue was consumed by a
                // previous start.
                self.inner.running.store(false, Ordering::SeqCst);
                for task in tasks {
                    task.abort();
                }
                return Err(MeshError::invalid_state("node cannot be restarted"));
            }
        };
        tasks.push(tokio::spawn(Self::outbound_pump(self.clone(), outbound_rx)));

        // Delivery dispatch by message type.
        tasks.push(tokio::spawn(Self::dispatch_pump(
            self.clone(),
            self.inner.router.subscribe_delivery(),
        )));

        // Merge router peer streams onto the outward stream.
        tasks.push(tokio::spawn(Self::peer_event_pump(
            self.clone(),
            self.inner.router.subscribe_peer_updates(),
            self.inner.router.subscribe_peer_removed(),
        )));

        // Periodic self-announce.
        {
            let node = self.clone();
            let period = self.inner.config.announce_interval;
            tasks.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(period);
                timer.tick().await; // first tick fires immediately; skip it
                loop {
                    timer.tick().await;
                    node.announce_once();
                }
            }));
        }

        // Peer health scan.
        {
            let node = self.clone();
            let period = self.inner.config.health_check_interval;
            tasks.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(period);
                timer.tick().await;
                loop {
                    timer.tick().await;
                    node.inner.router.health_tick();
                }
            }));
        }

        // Dedup cache sweep.
        {
            let node = self.clone();
            let period = self.inner.config.dedup_window;
            tasks.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(period);
                timer.tick().await;
                loop {
                    timer.tick().await;
                    node.inner.router.dedup_cleanup_tick();
                }
            }));
        }

        *self.inner.tasks.lock().await = tasks;
        tracing::info!(peer = %self.inner.config.peer_id, "mesh node started");
        Ok(())
    }

    /// Stop the node: cancel timers and pumps, wind down every adapter
    /// (tolerant of individual failures), leave the streams to close.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MeshError::invalid_state("node not running"));
        }

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }

        let adapters: Vec<Arc<dyn TransportAdapter>> =
            self.inner.active.lock().await.drain(..).collect();
        for adapter in adapters {
            if let Err(e) = adapter.stop_discovery().await {
                tracing::warn!(adapter = adapter.name(), error = %e, "stop_discovery failed");
            }
            if let Err(e) = adapter.stop_advertising().await {
                tracing::warn!(adapter = adapter.name(), error = %e, "stop_advertising failed");
            }
            if let Err(e) = adapter.dispose().await {
                tracing::warn!(adapter = adapter.name(), error = %e, "dispose failed");
            }
        }

        tracing::info!(peer = %self.inner.config.peer_id, "mesh node stopped");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.is_running() {
            return Err(MeshError::NotInitialized);
        }
        Ok(())
    }

    /// Broadcast a `data` message to every reachable node.
    pub fn broadcast(
        &self,
        text: impl Into<String>,
        files: Vec<FileInfo>,
        custom_data: HashMap<String, serde_json::Value>,
        ttl: Option<u32>,
    ) -> Result<Message> {
        self.send_data(Vec::new(), text.into(), files, custom_data, ttl)
    }

    /// Send a `data` message to a set of peers.
    pub fn send_to(
        &self,
        peer_ids: Vec<String>,
        text: impl Into<String>,
        files: Vec<FileInfo>,
        custom_data: HashMap<String, serde_json::Value>,
        ttl: Option<u32>,
    ) -> Result<Message> {
        if peer_ids.is_empty() {
            return Err(MeshError::invalid_state("send_to requires target ids"));
        }
        if !peer_ids.iter().any(|id| self.inner.router.get_peer(id).is_some()) {
            return Err(MeshError::PeerNotFound(peer_ids[0].clone()));
        }
        self.send_data(peer_ids, text.into(), files, custom_data, ttl)
    }

    /// Send a `data` message to one peer.
    pub fn send_to_peer(
        &self,
        peer_id: &str,
        text: impl Into<String>,
        files: Vec<FileInfo>,
        custom_data: HashMap<String, serde_json::Value>,
        ttl: Option<u32>,
    ) -> Result<Message> {
        self.send_to(vec![peer_id.to_string()], text, files, custom_data, ttl)
    }

    fn send_data(
        &self,
        target_ids: Vec<String>,
        text: String,
        files: Vec<FileInfo>,
        custom_data: HashMap<String, serde_json::Value>,
        ttl: Option<u32>,
    ) -> Result<Message> {
        self.ensure_running()?;
        let payload = DataPayload {
            text,
            files,
            custom_data,
        };
        let message = Message::data(
            &self.inner.config.peer_id,
            &self.inner.config.username,
            target_ids,
            &payload,
            ttl.unwrap_or(self.inner.config.default_ttl),
        );
        self.inner.router.send_message(&message)?;
        Ok(message)
    }

    /// Originate a `ping` at `peer_id`; returns the ping's message id.
    /// The remote node answers with a `pong` carrying that id.
    pub fn ping(&self, peer_id: &str) -> Result<String> {
        self.ensure_running()?;
        if self.inner.router.get_peer(peer_id).is_none() {
            return Err(MeshError::PeerNotFound(peer_id.to_string()));
        }
        let ping = Message::ping(
            &self.inner.config.peer_id,
            &self.inner.config.username,
            peer_id,
            self.inner.config.default_ttl,
        );
        self.inner.router.send_message(&ping)?;
        Ok(ping.id)
    }

    /// Explicitly connect to a discovered peer on whichever adapter
    /// knows it.
    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<Peer> {
        self.ensure_running()?;
        let adapters: Vec<Arc<dyn TransportAdapter>> =
            self.inner.active.lock().await.clone();
        let adapter = adapters
            .into_iter()
            .find(|a| a.discovered_peers().iter().any(|p| p.id == peer_id))
            .ok_or_else(|| MeshError::PeerNotFound(peer_id.to_string()))?;

        let descriptor = adapter.connect(peer_id).await?;
        self.inner.router.add_direct_peer(&descriptor);
        Ok(Peer::direct(&descriptor))
    }

    /// Tear down the link to a direct peer.
    pub async fn disconnect_peer(&self, peer_id: &str) -> Result<()> {
        self.ensure_running()?;
        let adapters: Vec<Arc<dyn TransportAdapter>> =
            self.inner.active.lock().await.clone();
        let adapter = adapters
            .into_iter()
            .find(|a| a.is_connected(peer_id))
            .ok_or_else(|| MeshError::PeerNotFound(peer_id.to_string()))?;

        adapter.disconnect(peer_id).await?;
        self.inner.router.remove_direct_peer(peer_id);
        Ok(())
    }

    /// Every known peer.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.router.peers()
    }

    /// The one-hop subset.
    pub fn direct_peers(&self) -> Vec<Peer> {
        self.inner.router.direct_peers()
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.inner.router.peer_count()
    }

    /// Look up one peer.
    pub fn get_peer(&self, peer_id: &str) -> Option<Peer> {
        self.inner.router.get_peer(peer_id)
    }

    /// Router lifetime counters.
    pub fn stats(&self) -> RouterStats {
        self.inner.router.stats()
    }

    /// Subscribe to application (`data`) messages delivered to this node.
    pub fn on_message(&self) -> broadcast::Receiver<Message> {
        self.inner.message_tx.subscribe()
    }

    /// Subscribe to peer updates and removals.
    pub fn on_peer_update(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.peer_tx.subscribe()
    }

    /// Subscribe to inbound file-transfer progress.
    pub fn on_file_progress(&self) -> broadcast::Receiver<FileProgressEvent> {
        self.inner.file_progress_tx.subscribe()
    }

    /// Build and broadcast one self-announce.
    fn announce_once(&self) {
        let announce = self.inner.router.build_announce();
        let message = Message::announce(
            &self.inner.config.peer_id,
            &self.inner.config.username,
            &announce,
            self.inner.config.default_ttl,
        );
        match self.inner.router.send_message(&message) {
            Ok(sent) => tracing::trace!(peers = announce.known_peers.len(), sent, "announced"),
            Err(e) => tracing::debug!(error = %e, "announce not sent"),
        }
    }

    /// Consume one adapter's event stream for the node's lifetime.
    async fn adapter_pump(
        node: MeshNode,
        adapter: Arc<dyn TransportAdapter>,
        mut events: broadcast::Receiver<AdapterEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(AdapterEvent::PeerDiscovered(descriptor)) => {
                    node.on_peer_discovered(&adapter, descriptor).await;
                }
                Ok(AdapterEvent::PeerStateChanged { peer_id, state }) => {
                    node.on_peer_state_changed(&adapter, &peer_id, state);
                }
                Ok(AdapterEvent::MessageReceived { peer_id, text }) => {
                    node.on_inbound_text(&peer_id, &text);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        adapter = adapter.name(),
                        missed,
                        "adapter event stream lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn on_peer_discovered(
        &self,
        adapter: &Arc<dyn TransportAdapter>,
        descriptor: DiscoveredPeer,
    ) {
        tracing::debug!(
            adapter = adapter.name(),
            peer = %descriptor.id,
            "peer discovered"
        );
        if !self.inner.config.auto_connect
            || descriptor.id == self.inner.config.peer_id
            || self
                .inner
                .router
                .get_peer(&descriptor.id)
                .map(|p| p.is_direct())
                .unwrap_or(false)
        {
            return;
        }
        match adapter.connect(&descriptor.id).await {
            Ok(connected) => {
                self.inner.router.add_direct_peer(&connected);
            }
            Err(e) => {
                tracing::warn!(peer = %descriptor.id, error = %e, "auto-connect failed");
            }
        }
    }

    fn on_peer_state_changed(
        &self,
        adapter: &Arc<dyn TransportAdapter>,
        peer_id: &str,
        state: PeerState,
    ) {
        match state {
            PeerState::Connected => {
                let already_direct = self
                    .inner
                    .router
                    .get_peer(peer_id)
                    .map(|p| p.is_direct())
                    .unwrap_or(false);
                if already_direct {
                    return;
                }
                let descriptor = adapter
                    .connected_peers()
                    .into_iter()
                    .find(|p| p.id == peer_id)
                    .unwrap_or_else(|| DiscoveredPeer::new(peer_id, peer_id));
                self.inner.router.add_direct_peer(&descriptor);
            }
            PeerState::Disconnected => {
                self.inner.router.remove_direct_peer(peer_id);
            }
            other => {
                self.inner.router.set_peer_state(peer_id, other);
            }
        }
    }

    /// Decode one inbound frame and run it through the router. Malformed
    /// frames are dropped without disturbing other peers' flows.
    fn on_inbound_text(&self, from_peer_id: &str, text: &str) {
        match wire::decode_message(text) {
            Ok(message) => {
                self.inner
                    .router
                    .process_incoming_message(&message, from_peer_id);
            }
            Err(e) => {
                tracing::debug!(from = from_peer_id, error = %e, "discarding malformed frame");
            }
        }
    }

    /// Drain the router's link-send queue onto transports.
    async fn outbound_pump(node: MeshNode, mut rx: mpsc::UnboundedReceiver<OutboundSend>) {
        while let Some(OutboundSend { next_hop, message }) = rx.recv().await {
            if let Err(e) = node.send_on_link(&next_hop, &message).await {
                // Per-recipient failure: logged, never fatal to the node.
                tracing::warn!(peer = %next_hop, id = %message.id, error = %e, "link send failed");
            }
        }
    }

    /// Encode a message and push it to the first adapter holding the
    /// direct peer.
    async fn send_on_link(&self, next_hop: &str, message: &Message) -> Result<()> {
        let line = wire::encode_message(message)?;
        let adapters: Vec<Arc<dyn TransportAdapter>> =
            self.inner.active.lock().await.clone();
        let adapter = adapters
            .into_iter()
            .find(|a| a.is_connected(next_hop))
            .ok_or_else(|| MeshError::TransportUnavailable(next_hop.to_string()))?;
        adapter.send(next_hop, &line).await?;
        Ok(())
    }

    /// Dispatch locally delivered messages by type.
    async fn dispatch_pump(
        node: MeshNode,
        mut deliveries: broadcast::Receiver<crate::router::Delivery>,
    ) {
        loop {
            match deliveries.recv().await {
                Ok(delivery) => node.dispatch_delivery(delivery),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "delivery stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn dispatch_delivery(&self, delivery: crate::router::Delivery) {
        let message = delivery.message;
        match message.message_type {
            MessageType::Data => {
                let _ = self.inner.message_tx.send(message);
            }
            MessageType::PeerAnnounce => match message.decode_payload::<PeerAnnounce>() {
                Ok(announce) => {
                    self.inner
                        .router
                        .handle_peer_announce(&announce, &delivery.received_from);
                }
                Err(e) => {
                    tracing::debug!(from = %message.source_id, error = %e, "bad announce payload");
                }
            },
            MessageType::Ping => {
                let pong = Message::pong(
                    &self.inner.config.peer_id,
                    &self.inner.config.username,
                    &message,
                    self.inner.config.default_ttl,
                );
                if let Err(e) = self.inner.router.send_message(&pong) {
                    tracing::debug!(to = %message.source_id, error = %e, "pong not sent");
                }
            }
            MessageType::FileChunk => match message.decode_payload::<FileChunkPayload>() {
                Ok(chunk) => self.record_file_progress(
                    &message.source_id,
                    &chunk.file_id,
                    chunk.total_chunks,
                    false,
                ),
                Err(e) => {
                    tracing::debug!(from = %message.source_id, error = %e, "bad chunk payload");
                }
            },
            MessageType::FileComplete => match message.decode_payload::<FileCompletePayload>() {
                Ok(done) => {
                    self.record_file_progress(&message.source_id, &done.file_id, 0, true)
                }
                Err(e) => {
                    tracing::debug!(from = %message.source_id, error = %e, "bad completion payload");
                }
            },
            // Pongs are observable on the router delivery stream; every
            // reserved tag is ignored here and forwarded by the router
            // when addressed elsewhere.
            _ => {
                tracing::trace!(kind = ?message.message_type, "ignoring delivery");
            }
        }
    }

    fn record_file_progress(&self, peer_id: &str, file_id: &str, total: u32, complete: bool) {
        let (received, total_chunks) = if complete {
            let (received, known_total) = self
                .inner
                .file_progress
                .remove(file_id)
                .map(|(_, counts)| counts)
                .unwrap_or((0, 0));
            (received, known_total)
        } else {
            let mut entry = self
                .inner
                .file_progress
                .entry(file_id.to_string())
                .or_insert((0, total));
            entry.0 += 1;
            entry.1 = entry.1.max(total);
            *entry
        };
        let _ = self.inner.file_progress_tx.send(FileProgressEvent {
            peer_id: peer_id.to_string(),
            file_id: file_id.to_string(),
            received_chunks: received,
            total_chunks,
            complete,
        });
    }

    /// Re-emit router peer updates and removals on the outward stream.
    async fn peer_event_pump(
        node: MeshNode,
        mut updates: broadcast::Receiver<Peer>,
        mut removals: broadcast::Receiver<String>,
    ) {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(peer) => {
                        let _ = node.inner.peer_tx.send(PeerEvent::Updated(peer));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "peer update stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                removal = removals.recv() => match removal {
                    Ok(peer_id) => {
                        let _ = node.inner.peer_tx.send(PeerEvent::Removed(peer_id));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "peer removal stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_transport::{MemoryAdapter, MemoryHub};
    use std::time::Duration;

    fn node_with_memory(
        hub: &Arc<MemoryHub>,
        id: &str,
    ) -> (MeshNode, Arc<dyn TransportAdapter>) {
        let config = NodeConfig::new(format!("user-{id}"))
            .with_peer_id(id)
            .with_announce_interval(Duration::from_millis(50));
        let node = MeshNode::new(config);
        let adapter: Arc<dyn TransportAdapter> = Arc::new(MemoryAdapter::new(
            Arc::clone(hub),
            DiscoveredPeer::new(id, format!("user-{id}")),
        ));
        (node, adapter)
    }

    async fn start_node(hub: &Arc<MemoryHub>, id: &str) -> MeshNode {
        let (node, adapter) = node_with_memory(hub, id);
        node.add_adapter(adapter).await.unwrap();
        node.start().await.unwrap();
        node
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let hub = MemoryHub::new();
        let (node, adapter) = node_with_memory(&hub, "a");
        node.add_adapter(adapter).await.unwrap();

        assert!(!node.is_running());
        assert!(matches!(
            node.broadcast("x", vec![], HashMap::new(), None),
            Err(MeshError::NotInitialized)
        ));

        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.start().await.is_err());

        node.stop().await.unwrap();
        assert!(!node.is_running());
        assert!(node.stop().await.is_err());
        assert!(matches!(
            node.broadcast("x", vec![], HashMap::new(), None),
            Err(MeshError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_add_adapter_after_start_rejected() {
        let hub = MemoryHub::new();
        let (node, adapter) = node_with_memory(&hub, "a");
        node.add_adapter(adapter).await.unwrap();
        node.start().await.unwrap();

        let (_, late) = node_with_memory(&hub, "z");
        assert!(node.add_adapter(late).await.is_err());
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_connect_builds_direct_link() {
        let hub = MemoryHub::new();
        let a = start_node(&hub, "a").await;
        let b = start_node(&hub, "b").await;

        wait_until("a direct-connects b", || {
            a.get_peer("b").map(|p| p.is_direct()).unwrap_or(false)
        })
        .await;
        wait_until("b direct-connects a", || {
            b.get_peer("a").map(|p| p.is_direct()).unwrap_or(false)
        })
        .await;

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_delivers_data() {
        let hub = MemoryHub::new();
        let a = start_node(&hub, "a").await;
        let b = start_node(&hub, "b").await;
        wait_until("link up", || b.get_peer("a").is_some()).await;

        let mut b_messages = b.on_message();
        let sent = a.broadcast("hello mesh", vec![], HashMap::new(), None).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), b_messages.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        assert_eq!(got.id, sent.id);
        assert_eq!(got.source_id, "a");
        assert_eq!(
            got.decode_payload::<DataPayload>().unwrap().text,
            "hello mesh"
        );

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let a = start_node(&hub, "a").await;
        assert!(matches!(
            a.send_to_peer("ghost", "x", vec![], HashMap::new(), None),
            Err(MeshError::PeerNotFound(_))
        ));
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_ignored() {
        let hub = MemoryHub::new();
        let a = start_node(&hub, "a").await;
        let b = start_node(&hub, "b").await;
        wait_until("link up", || a.get_peer("b").is_some() && b.get_peer("a").is_some()).await;

        // Push garbage straight through b's adapter; a must keep working.
        let b_adapters = b.inner.active.lock().await.clone();
        b_adapters[0].send("a", "{{{ not json").await.unwrap();

        let mut a_messages = a.on_message();
        let _ = b.broadcast("still alive", vec![], HashMap::new(), None).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), a_messages.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        assert_eq!(
            got.decode_payload::<DataPayload>().unwrap().text,
            "still alive"
        );

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_peer_removes_route() {
        let hub = MemoryHub::new();
        let a = start_node(&hub, "a").await;
        let b = start_node(&hub, "b").await;
        wait_until("link up", || a.get_peer("b").is_some()).await;

        a.disconnect_peer("b").await.unwrap();
        assert!(a.get_peer("b").is_none());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_progress_counting() {
        let hub = MemoryHub::new();
        let a = start_node(&hub, "a").await;
        let b = start_node(&hub, "b").await;
        wait_until("link up", || a.get_peer("b").is_some()).await;

        let mut progress = b.on_file_progress();

        // Hand-rolled fileChunk messages from a to b.
        for index in 0..2u32 {
            let payload = FileChunkPayload::from_bytes("f1", index, 2, &[1, 2, 3]);
            let mut msg = Message::data(
                "a",
                "user-a",
                vec!["b".to_string()],
                &DataPayload::default(),
                3,
            );
            msg.message_type = MessageType::FileChunk;
            msg.payload = serde_json::to_value(&payload).ok();
            a.router().send_message(&msg).unwrap();
        }

        let first = tokio::time::timeout(Duration::from_secs(5), progress.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        assert_eq!(first.file_id, "f1");
        assert_eq!(first.received_chunks, 1);
        assert_eq!(first.total_chunks, 2);
        assert!(!first.complete);

        let second = tokio::time::timeout(Duration::from_secs(5), progress.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        assert_eq!(second.received_chunks, 2);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
