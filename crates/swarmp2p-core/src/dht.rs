// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::config::SwarmConfig;
use crate::identity::LocalNode;
use crate::message;
use crate::node::{Node, PublicKey};
use crate::service::{Service, ServiceMessage};
use crate::timesync;

/// Internal protocol the swarm registers for routing-table queries.
pub const FIND_NODE_PROTOCOL: &str = "/dht/1.0/find-node/";

/// Bucket capacity.
pub const K: usize = 20;
/// Lookup concurrency.
pub const ALPHA: usize = 3;

const FIND_NODE_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_LOOKUP_ROUNDS: usize = 8;

/// Peer discovery as the swarm consumes it. Production is [`KadDht`]; tests
/// substitute fixed-table doubles.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Populate the routing table from the configured seed nodes.
    async fn bootstrap(&self) -> anyhow::Result<()>;

    /// Resolve a hex public key to a node, issuing network queries when the
    /// local table has no answer. Blocking and potentially slow.
    async fn lookup(&self, peer_pubkey: &str) -> anyhow::Result<Node>;

    /// Record that `node` was heard from.
    async fn update(&self, node: Node);

    /// Up to `count` random dialable nodes, for neighbor selection.
    async fn select_peers(&self, count: usize) -> Vec<Node>;

    async fn size(&self) -> usize;

    fn close(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct NodeInfo {
    #[serde(with = "serde_bytes")]
    pubkey: Vec<u8>,
    address: String,
}

impl NodeInfo {
    fn from_node(node: &Node) -> Self {
        Self {
            pubkey: node.public_key().as_bytes().to_vec(),
            address: node.address().to_string(),
        }
    }

    fn into_node(self) -> anyhow::Result<Node> {
        Ok(Node::new(PublicKey::from_bytes(&self.pubkey)?, self.address))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
enum FindNodeMessage {
    Request {
        req_id: u64,
        #[serde(with = "serde_bytes")]
        target: Vec<u8>,
    },
    Response {
        req_id: u64,
        closest: Vec<NodeInfo>,
    },
}

/// Kademlia-style discovery over the swarm's internal find-node protocol.
pub struct KadDht {
    local: Arc<LocalNode>,
    config: SwarmConfig,
    table: StdMutex<RoutingTable>,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Vec<Node>>>>,
    req_seq: AtomicU64,
    service: OnceLock<Weak<dyn Service>>,
    closed: watch::Sender<bool>,
}

impl KadDht {
    pub fn new(local: Arc<LocalNode>, config: SwarmConfig) -> Arc<Self> {
        let table = RoutingTable::new(local.public_key());
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            local,
            config,
            table: StdMutex::new(table),
            pending: StdMutex::new(HashMap::new()),
            req_seq: AtomicU64::new(0),
            service: OnceLock::new(),
            closed,
        })
    }

    /// Attach the message service and start answering find-node requests
    /// from `incoming`. Called once by the swarm after construction.
    pub fn wire(
        self: &Arc<Self>,
        service: Weak<dyn Service>,
        mut incoming: mpsc::Receiver<ServiceMessage>,
    ) {
        if self.service.set(service).is_err() {
            warn!("dht already wired to a service");
            return;
        }
        let dht = self.clone();
        tokio::spawn(async move {
            let mut closed = dht.closed.subscribe();
            loop {
                tokio::select! {
                    msg = incoming.recv() => match msg {
                        Some(msg) => dht.handle_protocol_message(msg).await,
                        None => break,
                    },
                    _ = closed.changed() => break,
                }
            }
            debug!("find-node responder stopped");
        });
    }

    fn service(&self) -> anyhow::Result<Arc<dyn Service>> {
        self.service
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow::anyhow!("dht is not attached to a running swarm"))
    }

    async fn handle_protocol_message(&self, msg: ServiceMessage) {
        let decoded: FindNodeMessage = match message::decode(msg.data()) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(sender = %msg.sender(), %err, "undecodable find-node message");
                return;
            }
        };
        match decoded {
            FindNodeMessage::Request { req_id, target } => {
                let closest = {
                    let table = self.table.lock().expect("routing table poisoned");
                    table.closest(&target, K)
                };
                let response = FindNodeMessage::Response {
                    req_id,
                    closest: closest.iter().map(NodeInfo::from_node).collect(),
                };
                let encoded = match message::encode(&response) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        warn!(%err, "failed to encode find-node response");
                        return;
                    }
                };
                let service = match self.service() {
                    Ok(service) => service,
                    Err(_) => return,
                };
                let sender = msg.sender().public_key().to_string();
                if let Err(err) = service
                    .send_message(&sender, FIND_NODE_PROTOCOL, encoded)
                    .await
                {
                    debug!(%sender, %err, "failed to answer find-node request");
                }
            }
            FindNodeMessage::Response { req_id, closest } => {
                let waiter = self
                    .pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&req_id);
                let Some(waiter) = waiter else {
                    debug!(req_id, "find-node response without a pending request");
                    return;
                };
                let nodes = closest
                    .into_iter()
                    .filter_map(|info| info.into_node().ok())
                    .collect();
                let _ = waiter.send(nodes);
            }
        }
    }

    /// One find-node request against `peer`, returning the nodes it reported.
    async fn query(&self, peer: &Node, target: &[u8; 32]) -> anyhow::Result<Vec<Node>> {
        let service = self.service()?;
        let req_id = self.req_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(req_id, tx);

        let request = message::encode(&FindNodeMessage::Request {
            req_id,
            target: target.to_vec(),
        })?;
        let sent = service
            .send_message(&peer.public_key().to_string(), FIND_NODE_PROTOCOL, request)
            .await;
        if let Err(err) = sent {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&req_id);
            return Err(err);
        }

        match tokio::time::timeout(FIND_NODE_TIMEOUT, rx).await {
            Ok(Ok(nodes)) => Ok(nodes),
            _ => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&req_id);
                anyhow::bail!("find-node request to {} timed out", peer.public_key())
            }
        }
    }

    /// Iterative lookup: repeatedly query the closest not-yet-queried nodes
    /// for `target`, merging every learned node into the table, until the
    /// target is known, the candidates are exhausted, or the round limit is
    /// hit.
    async fn iterative_find(&self, target: PublicKey) -> Option<Node> {
        let mut queried: HashSet<PublicKey> = HashSet::new();
        for _ in 0..MAX_LOOKUP_ROUNDS {
            let batch: Vec<Node> = {
                let table = self.table.lock().expect("routing table poisoned");
                table
                    .closest(target.as_bytes(), K)
                    .into_iter()
                    .filter(|n| {
                        n.public_key() != self.local.public_key()
                            && !queried.contains(&n.public_key())
                    })
                    .take(ALPHA)
                    .collect()
            };
            if batch.is_empty() {
                break;
            }
            for peer in &batch {
                queried.insert(peer.public_key());
            }

            let answers = join_all(
                batch
                    .iter()
                    .map(|peer| self.query(peer, target.as_bytes())),
            )
            .await;

            for answer in answers {
                let Ok(nodes) = answer else { continue };
                for node in nodes {
                    if node.public_key() == self.local.public_key() {
                        continue;
                    }
                    self.table
                        .lock()
                        .expect("routing table poisoned")
                        .update(node, timesync::now_unix());
                }
            }

            let hit = {
                let table = self.table.lock().expect("routing table poisoned");
                table.get(target)
            };
            if hit.is_some() {
                return hit;
            }
        }
        None
    }
}

#[async_trait]
impl Dht for KadDht {
    async fn bootstrap(&self) -> anyhow::Result<()> {
        let mut seeds = Vec::new();
        for entry in &self.config.bootstrap_nodes {
            let node = Node::from_string(entry)?;
            if node.public_key() != self.local.public_key() {
                seeds.push(node);
            }
        }
        if seeds.is_empty() {
            anyhow::bail!("no bootstrap nodes configured");
        }
        for seed in seeds {
            self.update(seed).await;
        }

        // Searching for our own identity walks the seeds and fills the
        // table with whatever they know; the target itself is never found.
        let _ = self.iterative_find(self.local.public_key()).await;

        if self.size().await == 0 {
            anyhow::bail!("bootstrap yielded no peers");
        }
        Ok(())
    }

    async fn lookup(&self, peer_pubkey: &str) -> anyhow::Result<Node> {
        let target = PublicKey::from_hex(peer_pubkey)?;
        let hit = {
            let table = self.table.lock().expect("routing table poisoned");
            table.get(target)
        };
        if let Some(node) = hit {
            return Ok(node);
        }
        self.iterative_find(target)
            .await
            .ok_or_else(|| anyhow::anyhow!("failed to find {peer_pubkey} in the network"))
    }

    async fn update(&self, node: Node) {
        if node.public_key() == self.local.public_key() {
            return;
        }
        self.table
            .lock()
            .expect("routing table poisoned")
            .update(node, timesync::now_unix());
    }

    async fn select_peers(&self, count: usize) -> Vec<Node> {
        self.table
            .lock()
            .expect("routing table poisoned")
            .sample_dialable(count)
    }

    async fn size(&self) -> usize {
        self.table.lock().expect("routing table poisoned").len()
    }

    fn close(&self) {
        let _ = self.closed.send(true);
    }
}

struct NodeRecord {
    node: Node,
    last_seen: i64,
}

/// XOR-metric routing table: 256 buckets indexed by the leading-zero count
/// of the distance, each bounded by [`K`] with least-recently-seen eviction.
pub(crate) struct RoutingTable {
    local: PublicKey,
    buckets: Vec<Vec<PublicKey>>,
    records: HashMap<PublicKey, NodeRecord>,
}

impl RoutingTable {
    pub(crate) fn new(local: PublicKey) -> Self {
        Self {
            local,
            buckets: vec![Vec::new(); 256],
            records: HashMap::new(),
        }
    }

    pub(crate) fn update(&mut self, node: Node, now: i64) {
        let key = node.public_key();
        let Some(bucket_idx) = bucket_index(&self.local, &key) else {
            return; // self
        };

        if let Some(existing) = self.records.get_mut(&key) {
            existing.last_seen = now;
            // A fresh address wins; an empty one never clobbers a known one.
            if !node.address().is_empty() {
                existing.node = node;
            }
            return;
        }

        let bucket = &mut self.buckets[bucket_idx];
        if bucket.len() >= K {
            let stale_idx = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, id)| {
                    self.records
                        .get(*id)
                        .map(|record| record.last_seen)
                        .unwrap_or(i64::MIN)
                })
                .map(|(idx, _)| idx)
                .expect("full bucket has entries");
            let stale = bucket.swap_remove(stale_idx);
            self.records.remove(&stale);
        }
        bucket.push(key);
        self.records.insert(key, NodeRecord { node, last_seen: now });
    }

    pub(crate) fn get(&self, key: PublicKey) -> Option<Node> {
        self.records.get(&key).map(|record| record.node.clone())
    }

    pub(crate) fn closest(&self, target: &[u8], limit: usize) -> Vec<Node> {
        let mut target_arr = [0u8; 32];
        let len = target.len().min(32);
        target_arr[..len].copy_from_slice(&target[..len]);

        let mut nodes: Vec<&NodeRecord> = self.records.values().collect();
        nodes.sort_by(|a, b| {
            xor_distance(a.node.public_key().as_bytes(), &target_arr)
                .cmp(&xor_distance(b.node.public_key().as_bytes(), &target_arr))
        });
        nodes
            .into_iter()
            .take(limit.min(K))
            .map(|record| record.node.clone())
            .collect()
    }

    pub(crate) fn sample_dialable(&self, count: usize) -> Vec<Node> {
        use rand::seq::SliceRandom;
        let mut nodes: Vec<Node> = self
            .records
            .values()
            .filter(|record| !record.node.address().is_empty())
            .map(|record| record.node.clone())
            .collect();
        nodes.shuffle(&mut rand::thread_rng());
        nodes.truncate(count);
        nodes
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Position of the first differing bit between `local` and `key`, or `None`
/// when they are equal.
fn bucket_index(local: &PublicKey, key: &PublicKey) -> Option<usize> {
    for (byte_idx, (a, b)) in local
        .as_bytes()
        .iter()
        .zip(key.as_bytes().iter())
        .enumerate()
    {
        let diff = a ^ b;
        if diff != 0 {
            return Some(byte_idx * 8 + diff.leading_zeros() as usize);
        }
    }
    None
}

fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (idx, byte) in out.iter_mut().enumerate() {
        *byte = a[idx] ^ b[idx];
    }
    out
}
