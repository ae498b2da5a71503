//! Multi-hop message router.
//!
//! The router is the single owner of routing state: the peer table, the
//! direct-peer set and the dedup cache live behind one lock and mutate
//! together. Everything it decides leaves through channels — deliveries,
//! peer updates and removals on broadcast streams, link-layer sends on an
//! unbounded queue the mesh node drains. No router operation suspends;
//! observers are notified after the state mutation commits.

use crate::dedup::SeenCache;
use crate::error::MeshError;
use crate::message::{Message, PeerAnnounce};
use crate::peer::{now_ms, Peer};
use skein_transport::{DiscoveredPeer, PeerState};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

const EVENT_CAPACITY: usize = 1024;

/// A message the router accepted for the local node.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The delivered message
    pub message: Message,

    /// Direct peer the frame arrived from (needed to install announce
    /// routes and to split the forwarding horizon)
    pub received_from: String,
}

/// One link-layer send the router asks the mesh node to perform.
#[derive(Debug, Clone)]
pub struct OutboundSend {
    /// Direct peer to hand the frame to
    pub next_hop: String,

    /// The message to encode and send
    pub message: Message,
}

/// Counters over the router's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    /// Messages accepted by the inbound pipeline
    pub processed: u64,

    /// Messages dropped by the dedup cache
    pub duplicates: u64,

    /// Messages published on the local delivery stream
    pub delivered: u64,

    /// Link-layer forwards requested
    pub forwarded: u64,

    /// Peer announces folded into the table
    pub announces: u64,
}

#[derive(Default)]
struct StatCells {
    processed: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    forwarded: AtomicU64,
    announces: AtomicU64,
}

struct RouterState {
    peers: HashMap<String, Peer>,
    direct: HashSet<String>,
    seen: SeenCache,
}

/// Routing table, dedup cache and forwarding logic for one node.
pub struct Router {
    local_id: String,
    local_username: String,
    stale_timeout_ms: u64,
    state: Mutex<RouterState>,
    delivery_tx: broadcast::Sender<Delivery>,
    peer_update_tx: broadcast::Sender<Peer>,
    peer_removed_tx: broadcast::Sender<String>,
    outbound_tx: mpsc::UnboundedSender<OutboundSend>,
    stats: StatCells,
}

/// Resolve the direct peer a frame for `target` must be handed to.
fn resolve_next_hop(state: &RouterState, target: &str) -> Option<String> {
    if state.direct.contains(target) {
        return Some(target.to_string());
    }
    state.peers.get(target)?.next_hop_peer_id.clone()
}

/// Refresh a peer's liveness; a stale peer returns to connected on any
/// proof of life. Returns the updated peer when observers need telling.
fn refresh_peer(state: &mut RouterState, peer_id: &str, now: u64) -> Option<Peer> {
    let peer = state.peers.get_mut(peer_id)?;
    peer.last_seen_at = now;
    if peer.state == PeerState::Stale {
        peer.state = PeerState::Connected;
        return Some(peer.clone());
    }
    None
}

impl Router {
    /// Create a router for the node `local_id`/`local_username`.
    ///
    /// Returns the router plus the receiving end of its outbound send
    /// queue; the mesh node drains that queue onto transports.
    pub fn new(
        local_id: impl Into<String>,
        local_username: impl Into<String>,
        stale_timeout_ms: u64,
        dedup_capacity: usize,
        dedup_window_ms: u64,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundSend>) {
        let (delivery_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (peer_update_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (peer_removed_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                local_id: local_id.into(),
                local_username: local_username.into(),
                stale_timeout_ms,
                state: Mutex::new(RouterState {
                    peers: HashMap::new(),
                    direct: HashSet::new(),
                    seen: SeenCache::new(dedup_capacity, dedup_window_ms),
                }),
                delivery_tx,
                peer_update_tx,
                peer_removed_tx,
                outbound_tx,
                stats: StatCells::default(),
            },
            outbound_rx,
        )
    }

    /// The local node's peer id.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Subscribe to messages accepted for the local node.
    pub fn subscribe_delivery(&self) -> broadcast::Receiver<Delivery> {
        self.delivery_tx.subscribe()
    }

    /// Subscribe to peer installs, refreshes and state transitions.
    pub fn subscribe_peer_updates(&self) -> broadcast::Receiver<Peer> {
        self.peer_update_tx.subscribe()
    }

    /// Subscribe to peer evictions (one event per removed id).
    pub fn subscribe_peer_removed(&self) -> broadcast::Receiver<String> {
        self.peer_removed_tx.subscribe()
    }

    /// Register a one-hop peer. The entry lands in both the full table and
    /// the direct set at hop 0 with no next hop.
    pub fn add_direct_peer(&self, descriptor: &DiscoveredPeer) {
        let peer = Peer::direct(descriptor);
        {
            let mut state = self.state.lock().expect("router state poisoned");
            state.direct.insert(peer.id.clone());
            state.peers.insert(peer.id.clone(), peer.clone());
        }
        tracing::debug!(peer = %peer.id, "direct peer added");
        let _ = self.peer_update_tx.send(peer);
    }

    /// Drop a one-hop peer, cascading to every peer routed through it.
    ///
    /// Second-level indirect peers are re-learned from the remaining
    /// direct peers' next announces. Returns the removed ids.
    pub fn remove_direct_peer(&self, peer_id: &str) -> Vec<String> {
        let removed: Vec<String> = {
            let mut state = self.state.lock().expect("router state poisoned");
            state.direct.remove(peer_id);
            let doomed: Vec<String> = state
                .peers
                .values()
                .filter(|p| {
                    p.id == peer_id || p.next_hop_peer_id.as_deref() == Some(peer_id)
                })
                .map(|p| p.id.clone())
                .collect();
            for id in &doomed {
                state.peers.remove(id);
                state.direct.remove(id);
            }
            doomed
        };
        for id in &removed {
            tracing::debug!(peer = %id, via = %peer_id, "peer evicted");
            let _ = self.peer_removed_tx.send(id.clone());
        }
        removed
    }

    /// Fold a received announce into the table.
    ///
    /// `received_from` is the direct peer the announce arrived through and
    /// becomes the next hop for every route it installs. A route is
    /// installed only when strictly shorter than what the table holds;
    /// equal cost never replaces (no route flapping).
    pub fn handle_peer_announce(&self, announce: &PeerAnnounce, received_from: &str) {
        let now = now_ms();
        let mut updates: Vec<Peer> = Vec::new();
        {
            let mut state = self.state.lock().expect("router state poisoned");

            if let Some(revived) = refresh_peer(&mut state, &announce.peer.id, now) {
                updates.push(revived);
            }

            for known in std::iter::once(&announce.peer).chain(announce.known_peers.iter()) {
                if known.id == self.local_id {
                    continue;
                }
                let candidate_hops = known.hop_count.saturating_add(1);
                let better = match state.peers.get(&known.id) {
                    None => true,
                    Some(existing) => existing.hop_count > candidate_hops,
                };
                if !better {
                    continue;
                }
                let installed = Peer {
                    id: known.id.clone(),
                    username: known.username.clone(),
                    transport_type: known.transport_type,
                    state: PeerState::Connected,
                    address: known.address.clone(),
                    port: known.port,
                    last_seen_at: now,
                    hop_count: candidate_hops,
                    next_hop_peer_id: Some(received_from.to_string()),
                    metadata: known.metadata.clone(),
                };
                tracing::debug!(
                    peer = %installed.id,
                    hops = candidate_hops,
                    via = received_from,
                    "route installed"
                );
                state.peers.insert(installed.id.clone(), installed.clone());
                updates.push(installed);
            }
        }
        self.stats.announces.fetch_add(1, Ordering::Relaxed);
        for peer in updates {
            let _ = self.peer_update_tx.send(peer);
        }
    }

    /// Run a message that arrived from `received_from` through the inbound
    /// pipeline: dedup, liveness refresh, local delivery, forwarding.
    ///
    /// Returns `false` when the dedup cache dropped the message.
    pub fn process_incoming_message(&self, message: &Message, received_from: &str) -> bool {
        let now = now_ms();
        let mut updates: Vec<Peer> = Vec::new();
        let (is_for_us, forwards) = {
            let mut state = self.state.lock().expect("router state poisoned");

            if !state.seen.insert(&message.id, now) {
                tracing::trace!(id = %message.id, "duplicate dropped");
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return false;
            }

            if let Some(revived) = refresh_peer(&mut state, &message.source_id, now) {
                updates.push(revived);
            }

            let is_for_us = message.is_broadcast()
                || message.target_ids.iter().any(|t| t == &self.local_id);

            let mut forwards: Vec<OutboundSend> = Vec::new();
            if let Some(forwarded) = message.forwarded() {
                if forwarded.is_broadcast() {
                    // Horizon split: never back out the link it came in on.
                    for direct_id in &state.direct {
                        if direct_id != received_from {
                            forwards.push(OutboundSend {
                                next_hop: direct_id.clone(),
                                message: forwarded.clone(),
                            });
                        }
                    }
                } else {
                    let mut next_hops: HashSet<String> = HashSet::new();
                    for target in &forwarded.target_ids {
                        if target == &self.local_id {
                            continue;
                        }
                        match resolve_next_hop(&state, target) {
                            Some(next_hop) if next_hop != received_from => {
                                next_hops.insert(next_hop);
                            }
                            Some(_) => {
                                tracing::trace!(%target, "skipping bounce-back forward");
                            }
                            None => {
                                tracing::debug!(%target, "no route, dropping forward");
                            }
                        }
                    }
                    for next_hop in next_hops {
                        forwards.push(OutboundSend {
                            next_hop,
                            message: forwarded.clone(),
                        });
                    }
                }
            }
            (is_for_us, forwards)
        };

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        for peer in updates {
            let _ = self.peer_update_tx.send(peer);
        }
        if is_for_us {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            let _ = self.delivery_tx.send(Delivery {
                message: message.clone(),
                received_from: received_from.to_string(),
            });
        }
        for send in forwards {
            self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            let _ = self.outbound_tx.send(send);
        }
        true
    }

    /// Send a locally originated message.
    ///
    /// The id is pre-marked as seen so echoes die on arrival. Broadcast
    /// goes to every direct peer; targeted sends resolve next hops and
    /// fail with [`MeshError::RoutingUnavailable`] only when not a single
    /// target resolved (partial resolution is best-effort success).
    pub fn send_message(&self, message: &Message) -> Result<usize, MeshError> {
        let now = now_ms();
        let recipients: Vec<String> = {
            let mut state = self.state.lock().expect("router state poisoned");
            state.seen.insert(&message.id, now);

            if message.is_broadcast() {
                state.direct.iter().cloned().collect()
            } else {
                let mut next_hops: HashSet<String> = HashSet::new();
                for target in &message.target_ids {
                    if target == &self.local_id {
                        continue;
                    }
                    match resolve_next_hop(&state, target) {
                        Some(next_hop) => {
                            next_hops.insert(next_hop);
                        }
                        None => {
                            tracing::debug!(%target, "unroutable send target");
                        }
                    }
                }
                next_hops.into_iter().collect()
            }
        };

        if recipients.is_empty() {
            if message.is_broadcast() {
                tracing::debug!(id = %message.id, "broadcast with no direct peers");
                return Ok(0);
            }
            return Err(MeshError::RoutingUnavailable);
        }

        let count = recipients.len();
        for next_hop in recipients {
            let _ = self.outbound_tx.send(OutboundSend {
                next_hop,
                message: message.clone(),
            });
        }
        Ok(count)
    }

    /// Build the periodic self-announce: the local peer at hop 0 plus
    /// every non-local table entry at its current hop count.
    pub fn build_announce(&self) -> PeerAnnounce {
        let state = self.state.lock().expect("router state poisoned");
        PeerAnnounce {
            peer: Peer::local(&self.local_id, &self.local_username),
            known_peers: state.peers.values().cloned().collect(),
        }
    }

    /// Overwrite a known peer's connection state (adapter passthrough for
    /// transitions the router does not own, e.g. degraded links).
    pub fn set_peer_state(&self, peer_id: &str, new_state: PeerState) -> Option<Peer> {
        let changed = {
            let mut state = self.state.lock().expect("router state poisoned");
            let peer = state.peers.get_mut(peer_id)?;
            if peer.state == new_state {
                return None;
            }
            peer.state = new_state;
            peer.clone()
        };
        let _ = self.peer_update_tx.send(changed.clone());
        Some(changed)
    }

    /// Mark peers silent past the stale timeout. They stay in the table
    /// and revive on any later proof of life.
    pub fn health_tick(&self) {
        self.health_tick_at(now_ms());
    }

    pub(crate) fn health_tick_at(&self, now: u64) {
        let cutoff = now.saturating_sub(self.stale_timeout_ms);
        let mut went_stale: Vec<Peer> = Vec::new();
        {
            let mut state = self.state.lock().expect("router state poisoned");
            for peer in state.peers.values_mut() {
                if peer.last_seen_at < cutoff && peer.state != PeerState::Stale {
                    peer.state = PeerState::Stale;
                    went_stale.push(peer.clone());
                }
            }
        }
        for peer in went_stale {
            tracing::debug!(peer = %peer.id, "peer went stale");
            let _ = self.peer_update_tx.send(peer);
        }
    }

    /// Evict dedup entries older than the window.
    pub fn dedup_cleanup_tick(&self) {
        self.dedup_cleanup_tick_at(now_ms());
    }

    pub(crate) fn dedup_cleanup_tick_at(&self, now: u64) {
        let mut state = self.state.lock().expect("router state poisoned");
        state.seen.evict_expired(now);
    }

    /// Every known peer.
    pub fn peers(&self) -> Vec<Peer> {
        let state = self.state.lock().expect("router state poisoned");
        state.peers.values().cloned().collect()
    }

    /// The one-hop subset.
    pub fn direct_peers(&self) -> Vec<Peer> {
        let state = self.state.lock().expect("router state poisoned");
        state
            .direct
            .iter()
            .filter_map(|id| state.peers.get(id).cloned())
            .collect()
    }

    /// Look up one peer.
    pub fn get_peer(&self, peer_id: &str) -> Option<Peer> {
        let state = self.state.lock().expect("router state poisoned");
        state.peers.get(peer_id).cloned()
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        let state = self.state.lock().expect("router state poisoned");
        state.peers.len()
    }

    /// The direct peer a frame for `target` would be handed to.
    pub fn next_hop(&self, target: &str) -> Option<String> {
        let state = self.state.lock().expect("router state poisoned");
        resolve_next_hop(&state, target)
    }

    /// Lifetime counters snapshot.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            processed: self.stats.processed.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            announces: self.stats.announces.load(Ordering::Relaxed),
        }
    }

    /// Current dedup cache occupancy.
    pub fn seen_cache_len(&self) -> usize {
        let state = self.state.lock().expect("router state poisoned");
        state.seen.len()
    }
}
