//! Direct-socket transport over TCP.
//!
//! The direct-socket mode of the adapter contract: `connect` yields a
//! byte stream, and each mesh payload travels as one newline-terminated
//! line of text. Discovery works against a configured seed list — each
//! seed is probed with a one-line JSON hello naming the service and our
//! descriptor; the listener answers with its own descriptor while
//! advertising is on.
//!
//! The hello protocol carries an intent tag so one listener serves both
//! flows: `probe` exchanges descriptors and closes, `connect` keeps the
//! socket as the peer's byte channel.

use crate::adapter::{
    AdapterEvent, DiscoveredPeer, PeerState, TransportAdapter, TransportError, TransportResult,
    TransportType,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 1024;
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// TCP adapter configuration.
#[derive(Debug, Clone)]
pub struct TcpAdapterConfig {
    /// Address the listener binds to (port 0 auto-selects).
    pub listen_addr: SocketAddr,

    /// Addresses probed during discovery.
    pub seeds: Vec<SocketAddr>,
}

impl Default for TcpAdapterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".parse().expect("static addr"),
            seeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum HelloIntent {
    Probe,
    Connect,
}

/// One-line JSON handshake exchanged on every new socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    service: String,
    intent: HelloIntent,
    peer: DiscoveredPeer,
}

struct Connection {
    peer: DiscoveredPeer,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
}

struct TcpState {
    local: DiscoveredPeer,
    service: Option<String>,
    discovered: HashMap<String, (DiscoveredPeer, SocketAddr)>,
    connections: HashMap<String, Connection>,
    listener_task: Option<JoinHandle<()>>,
    probe_task: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<TcpState>,
    events: broadcast::Sender<AdapterEvent>,
    seeds: Vec<SocketAddr>,
    listen_addr: SocketAddr,
    advertising: AtomicBool,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

/// Line-delimited TCP transport adapter.
pub struct TcpAdapter {
    shared: Arc<Shared>,
}

async fn write_line(writer: &tokio::sync::Mutex<OwnedWriteHalf>, line: &str) -> TransportResult<()> {
    let mut guard = writer.lock().await;
    guard.write_all(line.as_bytes()).await?;
    guard.write_all(b"\n").await?;
    guard.flush().await?;
    Ok(())
}

async fn read_hello(reader: &mut BufReader<OwnedReadHalf>) -> TransportResult<Hello> {
    let mut line = String::new();
    let n = tokio::time::timeout(HELLO_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| TransportError::ConnectionFailed("hello timed out".to_string()))??;
    if n == 0 {
        return Err(TransportError::ConnectionFailed(
            "connection closed during hello".to_string(),
        ));
    }
    serde_json::from_str(line.trim_end())
        .map_err(|e| TransportError::Protocol(format!("malformed hello: {e}")))
}

impl Shared {
    fn local_descriptor(&self) -> DiscoveredPeer {
        self.state.lock().expect("tcp state poisoned").local.clone()
    }

    fn service(&self) -> Option<String> {
        self.state.lock().expect("tcp state poisoned").service.clone()
    }

    /// Register an established socket as a peer channel and start its read
    /// loop. Emits the connected state change.
    ///
    /// Takes the buffered read half as-is so frames that arrived right
    /// behind the hello are not lost.
    fn adopt_connection(
        shared: &Arc<Shared>,
        peer: DiscoveredPeer,
        read_half: BufReader<OwnedReadHalf>,
        write_half: OwnedWriteHalf,
    ) {
        let peer_id = peer.id.clone();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));

        let reader = {
            let shared = Arc::clone(shared);
            let peer_id = peer_id.clone();
            tokio::spawn(async move {
                let mut lines = read_half.lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let _ = shared.events.send(AdapterEvent::MessageReceived {
                                peer_id: peer_id.clone(),
                                text: line,
                            });
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(peer = %peer_id, error = %e, "read loop ended");
                            break;
                        }
                    }
                }
                shared.drop_connection(&peer_id, true);
            })
        };

        let mut state = shared.state.lock().expect("tcp state poisoned");
        if let Some(stale) = state.connections.insert(
            peer_id.clone(),
            Connection {
                peer,
                writer,
                reader,
            },
        ) {
            stale.reader.abort();
        }
        drop(state);

        let _ = shared.events.send(AdapterEvent::PeerStateChanged {
            peer_id,
            state: PeerState::Connected,
        });
    }

    /// Remove a connection; `notify` emits the disconnected state change.
    fn drop_connection(&self, peer_id: &str, notify: bool) {
        let removed = {
            let mut state = self.state.lock().expect("tcp state poisoned");
            state.connections.remove(peer_id)
        };
        if let Some(connection) = removed {
            connection.reader.abort();
            if notify {
                let _ = self.events.send(AdapterEvent::PeerStateChanged {
                    peer_id: peer_id.to_string(),
                    state: PeerState::Disconnected,
                });
            }
        }
    }

    /// Record a freshly learned peer; emits discovery on first sighting or
    /// descriptor change.
    ///
    /// The descriptor's own listen address wins over the observed socket
    /// address, so inbound-learned peers stay reachable for connect-back.
    fn record_discovered(&self, peer: DiscoveredPeer, observed: SocketAddr) {
        let addr = match (&peer.address, peer.port) {
            (Some(address), Some(port)) => format!("{address}:{port}")
                .parse()
                .unwrap_or(observed),
            _ => observed,
        };
        let mut state = self.state.lock().expect("tcp state poisoned");
        if peer.id == state.local.id {
            return;
        }
        let fresh = match state.discovered.get(&peer.id) {
            Some((known, known_addr)) => known != &peer || known_addr != &addr,
            None => true,
        };
        state.discovered.insert(peer.id.clone(), (peer.clone(), addr));
        drop(state);
        if fresh {
            let _ = self.events.send(AdapterEvent::PeerDiscovered(peer));
        }
    }

    async fn handle_inbound(shared: Arc<Shared>, stream: TcpStream, remote: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer = tokio::sync::Mutex::new(write_half);

        let hello = match read_hello(&mut reader).await {
            Ok(hello) => hello,
            Err(e) => {
                tracing::debug!(%remote, error = %e, "rejecting inbound socket");
                return;
            }
        };

        if !shared.advertising.load(Ordering::SeqCst) {
            tracing::debug!(%remote, "inbound hello while not advertising, closing");
            return;
        }
        if let Some(service) = shared.service() {
            if hello.service != service {
                tracing::debug!(%remote, theirs = %hello.service, "service mismatch, closing");
                return;
            }
        }

        let reply = Hello {
            service: hello.service.clone(),
            intent: hello.intent,
            peer: shared.local_descriptor(),
        };
        let reply_line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode hello reply");
                return;
            }
        };
        if let Err(e) = write_line(&writer, &reply_line).await {
            tracing::debug!(%remote, error = %e, "failed to answer hello");
            return;
        }

        match hello.intent {
            HelloIntent::Probe => {
                // Descriptor exchange only; learn them too, then drop.
                shared.record_discovered(hello.peer, remote);
            }
            HelloIntent::Connect => {
                let peer = hello.peer.clone();
                shared.record_discovered(hello.peer, remote);
                Shared::adopt_connection(&shared, peer, reader, writer.into_inner());
            }
        }
    }

    async fn probe_seed(shared: &Arc<Shared>, seed: SocketAddr, service: &str) {
        let stream = match TcpStream::connect(seed).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::trace!(%seed, error = %e, "seed unreachable");
                return;
            }
        };
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer = tokio::sync::Mutex::new(write_half);

        let hello = Hello {
            service: service.to_string(),
            intent: HelloIntent::Probe,
            peer: shared.local_descriptor(),
        };
        let line = match serde_json::to_string(&hello) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode probe hello");
                return;
            }
        };
        if write_line(&writer, &line).await.is_err() {
            return;
        }
        match read_hello(&mut reader).await {
            Ok(reply) => shared.record_discovered(reply.peer, seed),
            Err(e) => tracing::trace!(%seed, error = %e, "probe got no hello back"),
        }
    }
}

impl TcpAdapter {
    /// Create a TCP adapter for `local` with the given listen/seed config.
    ///
    /// The local descriptor is stamped with the bound address once
    /// `initialize` has run, so remote sides learn where to connect back.
    pub fn new(local: DiscoveredPeer, config: TcpAdapterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let local = local.with_transport(TransportType::Lan);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TcpState {
                    local,
                    service: None,
                    discovered: HashMap::new(),
                    connections: HashMap::new(),
                    listener_task: None,
                    probe_task: None,
                }),
                events,
                seeds: config.seeds,
                listen_addr: config.listen_addr,
                advertising: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The address the listener actually bound (valid after `initialize`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.shared.state.lock().expect("tcp state poisoned");
        match (&state.local.address, state.local.port) {
            (Some(addr), Some(port)) => format!("{addr}:{port}").parse().ok(),
            _ => None,
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for TcpAdapter {
    fn name(&self) -> &str {
        "tcp"
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Lan
    }

    fn is_available(&self) -> bool {
        !self.shared.disposed.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> TransportResult<()> {
        self.ensure_open()?;
        if self.shared.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = TcpListener::bind(self.shared.listen_addr).await?;
        let bound = listener.local_addr()?;
        tracing::info!(%bound, "tcp adapter listening");

        {
            let mut state = self.shared.state.lock().expect("tcp state poisoned");
            state.local = state
                .local
                .clone()
                .with_address(bound.ip().to_string(), bound.port());
        }

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(Shared::handle_inbound(shared, stream, remote));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept failed");
                    }
                }
            }
        });
        self.shared
            .state
            .lock()
            .expect("tcp state poisoned")
            .listener_task = Some(task);
        Ok(())
    }

    async fn start_discovery(&self, service_name: &str) -> TransportResult<()> {
        self.ensure_open()?;
        let service = service_name.to_string();
        {
            let mut state = self.shared.state.lock().expect("tcp state poisoned");
            state.service = Some(service.clone());
            if state.probe_task.is_some() {
                return Ok(());
            }
        }

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                for seed in shared.seeds.clone() {
                    Shared::probe_seed(&shared, seed, &service).await;
                }
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        });
        self.shared
            .state
            .lock()
            .expect("tcp state poisoned")
            .probe_task = Some(task);
        Ok(())
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        let task = {
            let mut state = self.shared.state.lock().expect("tcp state poisoned");
            state.probe_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    async fn start_advertising(
        &self,
        local_peer: &DiscoveredPeer,
        service_name: &str,
    ) -> TransportResult<()> {
        self.ensure_open()?;
        {
            let mut state = self.shared.state.lock().expect("tcp state poisoned");
            // Keep the bound address; identity and metadata come from the caller.
            let (address, port) = (state.local.address.clone(), state.local.port);
            let mut local = local_peer.clone().with_transport(TransportType::Lan);
            local.address = address;
            local.port = port;
            state.local = local;
            state.service = Some(service_name.to_string());
        }
        self.shared.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        self.shared.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, peer_id: &str) -> TransportResult<DiscoveredPeer> {
        self.ensure_open()?;

        let (target, service) = {
            let state = self.shared.state.lock().expect("tcp state poisoned");
            if let Some(connection) = state.connections.get(peer_id) {
                return Ok(connection.peer.clone());
            }
            let (_, addr) = state
                .discovered
                .get(peer_id)
                .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;
            (
                *addr,
                state.service.clone().unwrap_or_default(),
            )
        };

        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer = tokio::sync::Mutex::new(write_half);

        let hello = Hello {
            service,
            intent: HelloIntent::Connect,
            peer: self.shared.local_descriptor(),
        };
        let line = serde_json::to_string(&hello)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        write_line(&writer, &line).await?;

        let reply = read_hello(&mut reader).await?;
        if reply.peer.id != peer_id {
            return Err(TransportError::Protocol(format!(
                "connected to {} but expected {}",
                reply.peer.id, peer_id
            )));
        }

        let peer = reply.peer.clone();
        Shared::adopt_connection(&self.shared, peer.clone(), reader, writer.into_inner());
        Ok(peer)
    }

    async fn disconnect(&self, peer_id: &str) -> TransportResult<()> {
        self.ensure_open()?;
        let known = {
            let state = self.shared.state.lock().expect("tcp state poisoned");
            state.connections.contains_key(peer_id)
        };
        if !known {
            return Err(TransportError::NotConnected(peer_id.to_string()));
        }
        self.shared.drop_connection(peer_id, true);
        Ok(())
    }

    async fn send(&self, peer_id: &str, text: &str) -> TransportResult<()> {
        self.ensure_open()?;
        let writer = {
            let state = self.shared.state.lock().expect("tcp state poisoned");
            state
                .connections
                .get(peer_id)
                .map(|c| Arc::clone(&c.writer))
                .ok_or_else(|| TransportError::NotConnected(peer_id.to_string()))?
        };
        write_line(&writer, text).await
    }

    async fn dispose(&self) -> TransportResult<()> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (listener, probe, peers) = {
            let mut state = self.shared.state.lock().expect("tcp state poisoned");
            (
                state.listener_task.take(),
                state.probe_task.take(),
                state.connections.keys().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(task) = listener {
            task.abort();
        }
        if let Some(task) = probe {
            task.abort();
        }
        for peer_id in peers {
            self.shared.drop_connection(&peer_id, false);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.shared.events.subscribe()
    }

    fn connected_peers(&self) -> Vec<DiscoveredPeer> {
        let state = self.shared.state.lock().expect("tcp state poisoned");
        state.connections.values().map(|c| c.peer.clone()).collect()
    }

    fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        let state = self.shared.state.lock().expect("tcp state poisoned");
        state
            .discovered
            .values()
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(id: &str, seeds: Vec<SocketAddr>) -> TcpAdapter {
        TcpAdapter::new(
            DiscoveredPeer::new(id, format!("user-{id}")),
            TcpAdapterConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                seeds,
            },
        )
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_probe_discovers_advertiser() {
        let b = adapter("b", vec![]);
        b.initialize().await.unwrap();
        b.start_advertising(&DiscoveredPeer::new("b", "bob"), "svc")
            .await
            .unwrap();
        let b_addr = b.local_addr().unwrap();

        let a = adapter("a", vec![b_addr]);
        a.initialize().await.unwrap();
        a.start_discovery("svc").await.unwrap();

        wait_for("discovery of b", || {
            a.discovered_peers().iter().any(|p| p.id == "b")
        })
        .await;

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_exchange_lines() {
        let b = adapter("b", vec![]);
        b.initialize().await.unwrap();
        b.start_advertising(&DiscoveredPeer::new("b", "bob"), "svc")
            .await
            .unwrap();
        let b_addr = b.local_addr().unwrap();

        let a = adapter("a", vec![b_addr]);
        a.initialize().await.unwrap();
        a.start_advertising(&DiscoveredPeer::new("a", "alice"), "svc")
            .await
            .unwrap();
        a.start_discovery("svc").await.unwrap();
        wait_for("discovery of b", || {
            a.discovered_peers().iter().any(|p| p.id == "b")
        })
        .await;

        let mut b_events = b.subscribe();
        let connected = a.connect("b").await.unwrap();
        assert_eq!(connected.id, "b");
        wait_for("b sees a connected", || b.is_connected("a")).await;

        a.send("b", "line one").await.unwrap();
        a.send("b", "line two").await.unwrap();

        let mut got = Vec::new();
        while got.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(5), b_events.recv())
                .await
                .expect("timed out")
                .expect("events closed")
            {
                AdapterEvent::MessageReceived { peer_id, text } => {
                    assert_eq!(peer_id, "a");
                    got.push(text);
                }
                _ => {}
            }
        }
        assert_eq!(got, vec!["line one".to_string(), "line two".to_string()]);

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_unknown_peer_fails() {
        let a = adapter("a", vec![]);
        a.initialize().await.unwrap();
        let err = a.connect("ghost").await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
        a.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remote() {
        let b = adapter("b", vec![]);
        b.initialize().await.unwrap();
        b.start_advertising(&DiscoveredPeer::new("b", "bob"), "svc")
            .await
            .unwrap();
        let b_addr = b.local_addr().unwrap();

        let a = adapter("a", vec![b_addr]);
        a.initialize().await.unwrap();
        a.start_discovery("svc").await.unwrap();
        wait_for("discovery of b", || {
            a.discovered_peers().iter().any(|p| p.id == "b")
        })
        .await;
        a.connect("b").await.unwrap();
        wait_for("b sees a connected", || b.is_connected("a")).await;

        a.disconnect("b").await.unwrap();
        wait_for("b sees a gone", || !b.is_connected("a")).await;

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_not_advertising_rejects_connect() {
        let b = adapter("b", vec![]);
        b.initialize().await.unwrap();
        // b never starts advertising; its listener drops hellos.
        let b_addr: SocketAddr = {
            // Re-derive the bound port from the state populated by initialize.
            b.local_addr().unwrap()
        };

        let a = adapter("a", vec![b_addr]);
        a.initialize().await.unwrap();
        a.start_discovery("svc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a.discovered_peers().is_empty());

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }
}
