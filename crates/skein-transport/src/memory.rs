//! In-process transport backed by a shared hub.
//!
//! `MemoryAdapter` satisfies the full adapter contract without touching the
//! network: every adapter registers with a `MemoryHub`, and the hub routes
//! text between members over in-process channels. The hub carries an
//! explicit link topology so tests can wire lines, triangles and diamonds
//! (`A—B—C` and friends) and the demo CLI can run several nodes in one
//! process.

use crate::adapter::{
    AdapterEvent, DiscoveredPeer, PeerState, TransportAdapter, TransportError, TransportResult,
    TransportType,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Normalized undirected pair key.
fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

struct Member {
    descriptor: DiscoveredPeer,
    events: broadcast::Sender<AdapterEvent>,
    advertising: bool,
    discovering: bool,
}

struct HubInner {
    members: HashMap<String, Member>,
    /// Undirected adjacency. `None` means every member pair is linked.
    links: Option<HashSet<(String, String)>>,
    connections: HashSet<(String, String)>,
}

/// Shared in-process switchboard for [`MemoryAdapter`]s.
pub struct MemoryHub {
    inner: Mutex<HubInner>,
}

impl MemoryHub {
    /// Hub in which every registered member can reach every other.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                members: HashMap::new(),
                links: None,
                connections: HashSet::new(),
            }),
        })
    }

    /// Hub with an explicit link topology; members only see peers they are
    /// linked to via [`MemoryHub::link`].
    pub fn with_links() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                members: HashMap::new(),
                links: Some(HashSet::new()),
                connections: HashSet::new(),
            }),
        })
    }

    /// Declare that `a` and `b` are physically adjacent.
    pub fn link(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(links) = inner.links.as_mut() {
            links.insert(pair(a, b));
        }
    }

    fn linked(inner: &HubInner, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        match &inner.links {
            None => true,
            Some(links) => links.contains(&pair(a, b)),
        }
    }

    fn register(&self, descriptor: DiscoveredPeer, events: broadcast::Sender<AdapterEvent>) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.members.insert(
            descriptor.id.clone(),
            Member {
                descriptor,
                events,
                advertising: false,
                discovering: false,
            },
        );
    }

    fn unregister(&self, id: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let dropped: Vec<(String, String)> = inner
            .connections
            .iter()
            .filter(|(a, b)| a == id || b == id)
            .cloned()
            .collect();
        for key in &dropped {
            inner.connections.remove(key);
        }
        inner.members.remove(id);

        // Tell surviving ends their channel is gone.
        for (a, b) in dropped {
            let other = if a == id { b } else { a };
            if let Some(member) = inner.members.get(&other) {
                let _ = member.events.send(AdapterEvent::PeerStateChanged {
                    peer_id: id.to_string(),
                    state: PeerState::Disconnected,
                });
            }
        }
    }

    fn set_discovering(&self, id: &str, on: bool) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(member) = inner.members.get_mut(id) {
            member.discovering = on;
        }
        if !on {
            return;
        }
        // Surface every linked advertiser that is already out there.
        let visible: Vec<DiscoveredPeer> = inner
            .members
            .values()
            .filter(|m| m.advertising && Self::linked(&inner, id, &m.descriptor.id))
            .map(|m| m.descriptor.clone())
            .collect();
        if let Some(member) = inner.members.get(id) {
            for peer in visible {
                let _ = member.events.send(AdapterEvent::PeerDiscovered(peer));
            }
        }
    }

    fn set_advertising(&self, id: &str, on: bool, descriptor: Option<DiscoveredPeer>) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(member) = inner.members.get_mut(id) {
            member.advertising = on;
            if let Some(descriptor) = descriptor {
                member.descriptor = descriptor;
            }
        }
        if !on {
            return;
        }
        // Push ourselves to every linked member already listening.
        let announced = match inner.members.get(id) {
            Some(m) => m.descriptor.clone(),
            None => return,
        };
        for member in inner.members.values() {
            if member.discovering && Self::linked(&inner, id, &member.descriptor.id) {
                let _ = member
                    .events
                    .send(AdapterEvent::PeerDiscovered(announced.clone()));
            }
        }
    }

    fn connect(&self, from: &str, to: &str) -> TransportResult<DiscoveredPeer> {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if !inner.members.contains_key(to) {
            return Err(TransportError::UnknownPeer(to.to_string()));
        }
        if !Self::linked(&inner, from, to) {
            return Err(TransportError::ConnectionFailed(format!(
                "{from} and {to} are not adjacent"
            )));
        }
        let key = pair(from, to);
        let already = !inner.connections.insert(key);
        let descriptor = inner.members[to].descriptor.clone();
        if !already {
            if let Some(member) = inner.members.get(from) {
                let _ = member.events.send(AdapterEvent::PeerStateChanged {
                    peer_id: to.to_string(),
                    state: PeerState::Connected,
                });
            }
            if let Some(member) = inner.members.get(to) {
                let _ = member.events.send(AdapterEvent::PeerStateChanged {
                    peer_id: from.to_string(),
                    state: PeerState::Connected,
                });
            }
        }
        Ok(descriptor)
    }

    fn disconnect(&self, from: &str, to: &str) -> TransportResult<()> {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if !inner.connections.remove(&pair(from, to)) {
            return Err(TransportError::NotConnected(to.to_string()));
        }
        if let Some(member) = inner.members.get(from) {
            let _ = member.events.send(AdapterEvent::PeerStateChanged {
                peer_id: to.to_string(),
                state: PeerState::Disconnected,
            });
        }
        if let Some(member) = inner.members.get(to) {
            let _ = member.events.send(AdapterEvent::PeerStateChanged {
                peer_id: from.to_string(),
                state: PeerState::Disconnected,
            });
        }
        Ok(())
    }

    fn send(&self, from: &str, to: &str, text: &str) -> TransportResult<()> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        if !inner.connections.contains(&pair(from, to)) {
            return Err(TransportError::NotConnected(to.to_string()));
        }
        let member = inner
            .members
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        let _ = member.events.send(AdapterEvent::MessageReceived {
            peer_id: from.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn connected_of(&self, id: &str) -> Vec<DiscoveredPeer> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        inner
            .connections
            .iter()
            .filter_map(|(a, b)| {
                let other = if a == id {
                    b
                } else if b == id {
                    a
                } else {
                    return None;
                };
                inner.members.get(other).map(|m| m.descriptor.clone())
            })
            .collect()
    }

    fn visible_to(&self, id: &str) -> Vec<DiscoveredPeer> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        inner
            .members
            .values()
            .filter(|m| {
                m.descriptor.id != id
                    && Self::linked(&inner, id, &m.descriptor.id)
                    && (m.advertising
                        || inner.connections.contains(&pair(id, &m.descriptor.id)))
            })
            .map(|m| m.descriptor.clone())
            .collect()
    }
}

/// Transport adapter speaking through a [`MemoryHub`].
pub struct MemoryAdapter {
    local: DiscoveredPeer,
    hub: Arc<MemoryHub>,
    events: broadcast::Sender<AdapterEvent>,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

impl MemoryAdapter {
    /// Create an adapter for `local` attached to `hub`.
    ///
    /// The descriptor's transport tag is forced to `Unknown` unless set;
    /// hub members keep whatever tag the caller chose.
    pub fn new(hub: Arc<MemoryHub>, local: DiscoveredPeer) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local,
            hub,
            events,
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    fn transport_type(&self) -> TransportType {
        self.local.transport_type
    }

    fn is_available(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> TransportResult<()> {
        self.ensure_open()?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.hub.register(self.local.clone(), self.events.clone());
        tracing::debug!(peer = %self.local.id, "memory adapter registered with hub");
        Ok(())
    }

    async fn start_discovery(&self, _service_name: &str) -> TransportResult<()> {
        self.ensure_open()?;
        self.hub.set_discovering(&self.local.id, true);
        Ok(())
    }

    async fn stop_discovery(&self) -> TransportResult<()> {
        self.hub.set_discovering(&self.local.id, false);
        Ok(())
    }

    async fn start_advertising(
        &self,
        local_peer: &DiscoveredPeer,
        _service_name: &str,
    ) -> TransportResult<()> {
        self.ensure_open()?;
        self.hub
            .set_advertising(&self.local.id, true, Some(local_peer.clone()));
        Ok(())
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        self.hub.set_advertising(&self.local.id, false, None);
        Ok(())
    }

    async fn connect(&self, peer_id: &str) -> TransportResult<DiscoveredPeer> {
        self.ensure_open()?;
        self.hub.connect(&self.local.id, peer_id)
    }

    async fn disconnect(&self, peer_id: &str) -> TransportResult<()> {
        self.ensure_open()?;
        self.hub.disconnect(&self.local.id, peer_id)
    }

    async fn send(&self, peer_id: &str, text: &str) -> TransportResult<()> {
        self.ensure_open()?;
        self.hub.send(&self.local.id, peer_id, text)
    }

    async fn dispose(&self) -> TransportResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.hub.unregister(&self.local.id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    fn connected_peers(&self) -> Vec<DiscoveredPeer> {
        self.hub.connected_of(&self.local.id)
    }

    fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.hub.visible_to(&self.local.id)
    }
}
