// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::conn_pool::Dialer;
use crate::connection::Connection;
use crate::dht::Dht;
use crate::message;
use crate::node::Node;

/// Error string gossip reports for an already-seen payload; the receive
/// pipeline swallows it and stops further dispatch.
pub const OLD_MESSAGE: &str = "old message";

const SEEN_CACHE_CAPACITY: usize = 10_000;

/// Flood-broadcast neighborhood as the swarm consumes it.
#[async_trait]
pub trait Gossip: Send + Sync {
    /// Select and connect the initial neighbor set. Called once, after
    /// bootstrap when bootstrap is enabled.
    async fn start(&self) -> anyhow::Result<()>;

    async fn register_peer(&self, node: Node, conn: Arc<dyn Connection>);

    async fn disconnect(&self, conn: Arc<dyn Connection>);

    /// The neighbor with this hex public key, if any.
    async fn peer(&self, pubkey: &str) -> Option<(Node, Arc<dyn Connection>)>;

    /// Relay an already-signed marshaled message to every neighbor.
    /// Duplicate payloads fail with [`OLD_MESSAGE`].
    async fn broadcast(&self, data: Vec<u8>) -> anyhow::Result<()>;
}

struct GossipPeer {
    node: Node,
    conn: Arc<dyn Connection>,
}

/// Production [`Gossip`]: neighbors picked at random from the DHT, one
/// session-encrypted copy of each broadcast per neighbor, and a bounded
/// seen-hash cache for duplicate suppression.
pub struct Neighborhood {
    config: SwarmConfig,
    dht: Arc<dyn Dht>,
    dialer: Arc<dyn Dialer>,
    peers: AsyncMutex<HashMap<String, GossipPeer>>,
    seen: StdMutex<SeenCache>,
}

impl Neighborhood {
    pub fn new(config: SwarmConfig, dht: Arc<dyn Dht>, dialer: Arc<dyn Dialer>) -> Arc<Self> {
        Arc::new(Self {
            config,
            dht,
            dialer,
            peers: AsyncMutex::new(HashMap::new()),
            seen: StdMutex::new(SeenCache::new(SEEN_CACHE_CAPACITY)),
        })
    }
}

#[async_trait]
impl Gossip for Neighborhood {
    async fn start(&self) -> anyhow::Result<()> {
        let wanted = self.config.random_connections;
        let candidates = self.dht.select_peers(wanted).await;
        let mut connected = 0usize;
        for node in candidates {
            let already = {
                let peers = self.peers.lock().await;
                peers.contains_key(&node.public_key().to_string())
            };
            if already {
                connected += 1;
                continue;
            }
            match self
                .dialer
                .get_connection(node.address(), node.public_key())
                .await
            {
                Ok(conn) => {
                    self.register_peer(node, conn).await;
                    connected += 1;
                }
                Err(err) => {
                    warn!(peer = %node, %err, "failed to connect gossip neighbor");
                }
            }
        }
        // Starting under-connected is survivable: inbound connections keep
        // registering neighbors after start.
        if connected < wanted {
            warn!(connected, wanted, "gossip neighborhood under-connected");
        }
        info!(neighbors = connected, "gossip neighborhood started");
        Ok(())
    }

    async fn register_peer(&self, node: Node, conn: Arc<dyn Connection>) {
        debug!(peer = %node, "registering gossip peer");
        self.peers
            .lock()
            .await
            .insert(node.public_key().to_string(), GossipPeer { node, conn });
    }

    async fn disconnect(&self, conn: Arc<dyn Connection>) {
        let mut peers = self.peers.lock().await;
        peers.retain(|_, peer| peer.conn.id() != conn.id());
    }

    async fn peer(&self, pubkey: &str) -> Option<(Node, Arc<dyn Connection>)> {
        let peers = self.peers.lock().await;
        peers
            .get(pubkey)
            .map(|peer| (peer.node.clone(), peer.conn.clone()))
    }

    async fn broadcast(&self, data: Vec<u8>) -> anyhow::Result<()> {
        {
            let mut seen = self.seen.lock().expect("seen cache poisoned");
            if !seen.insert(*blake3::hash(&data).as_bytes()) {
                anyhow::bail!(OLD_MESSAGE);
            }
        }

        let targets: Vec<(Node, Arc<dyn Connection>)> = {
            let peers = self.peers.lock().await;
            peers
                .values()
                .map(|peer| (peer.node.clone(), peer.conn.clone()))
                .collect()
        };

        for (node, conn) in targets {
            let Some(session) = conn.session() else {
                warn!(peer = %node, "gossip peer has no session, skipping");
                continue;
            };
            // Same critical-section discipline as the direct send path: an
            // encrypted-but-untransmitted message desyncs the cipher chain,
            // so a failure after encrypt closes the connection.
            let guard = session.encrypt_guard().await;
            match message::prepare_message(session.as_ref(), &data) {
                Ok(wire) => {
                    if let Err(err) = conn.send(&wire).await {
                        drop(guard);
                        warn!(peer = %node, %err, "gossip send failed, closing connection");
                        conn.close().await;
                    }
                }
                Err(err) => {
                    drop(guard);
                    warn!(peer = %node, %err, "gossip encrypt failed, closing connection");
                    conn.close().await;
                }
            }
        }
        Ok(())
    }
}

/// Insert-only set with FIFO eviction once `capacity` hashes are tracked.
struct SeenCache {
    capacity: usize,
    set: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the hash was already present.
    fn insert(&mut self, hash: [u8; 32]) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}
