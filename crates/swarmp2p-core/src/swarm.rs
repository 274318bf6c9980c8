// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conn_pool::ConnectionPool;
use crate::connection::Connection;
use crate::dht::{Dht, KadDht, FIND_NODE_PROTOCOL};
use crate::gossip::{Gossip, Neighborhood, OLD_MESSAGE};
use crate::identity::{self, LocalNode};
use crate::message::{self, CommonMessageData, ProtocolMessage};
use crate::net::{IncomingMessageEvent, Net};
use crate::node::{Node, PublicKey};
use crate::service::{Service, ServiceMessage, PROTOCOL_HANDLER_CAPACITY};
use crate::timesync;

/// Receive-path and send-path failures with a defined reaction. Every
/// receive-path kind closes the connection it occurred on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwarmError {
    #[error("bad message format, failed to decode envelope")]
    BadFormat1,
    #[error("bad message format, failed to decode protocol message")]
    BadFormat2,
    #[error("received out of sync message")]
    OutOfSync,
    #[error("no payload in message")]
    NoPayload,
    #[error("cannot decrypt message payload with session key")]
    FailDecrypt,
    #[error("failed to verify the message author")]
    AuthAuthor,
    #[error("message was signed with a wrong public key")]
    NotFromPeer,
    #[error("connection is missing a session")]
    NoSession,
    #[error("received message for an unsupported protocol")]
    NoProtocol,
}

/// Completion state of the bootstrap and gossip-start one-shots.
#[derive(Debug, Clone)]
enum TaskState {
    Pending,
    Done,
    Failed(String),
}

/// The swarm wires the transport, connection pool, DHT and gossip
/// neighborhood into one message-oriented service: authenticated encrypted
/// sends, the receive pipeline, flood broadcast, and the event loops tying
/// their lifecycles together.
pub struct Swarm {
    config: Config,
    local: Arc<LocalNode>,
    started: AtomicBool,
    protocol_handlers: RwLock<HashMap<String, mpsc::Sender<ServiceMessage>>>,
    network: Arc<Net>,
    cpool: Arc<ConnectionPool>,
    dht: Arc<dyn Dht>,
    gossip: Arc<dyn Gossip>,
    shutdown: watch::Sender<bool>,
    boot_state: watch::Sender<TaskState>,
    gossip_state: watch::Sender<TaskState>,
}

impl Swarm {
    /// Build a swarm that is not yet started: load or create the identity,
    /// bind the TCP port, and assemble the pool, DHT and gossip around the
    /// transport. `new_identity` forces a fresh keypair; `persist` writes
    /// the identity under `config.data_dir`.
    pub async fn new(
        config: Config,
        new_identity: bool,
        persist: bool,
    ) -> anyhow::Result<Arc<Self>> {
        let signing_key = identity::load_or_create_key(&config.data_dir, new_identity, persist)?;
        let listener = TcpListener::bind(("0.0.0.0", config.tcp_port)).await?;
        let port = listener.local_addr()?.port();
        let local = Arc::new(LocalNode::new(signing_key, format!("0.0.0.0:{port}")));

        let network = Net::new(local.clone(), listener)?;
        let cpool = ConnectionPool::new(network.clone(), local.public_key());
        let dht = KadDht::new(local.clone(), config.swarm.clone());
        let gossip = Neighborhood::new(config.swarm.clone(), dht.clone(), cpool.clone());

        let swarm = Self::assemble(config, local, network, cpool, dht.clone(), gossip);

        // The DHT answers and issues find-node requests through the swarm
        // itself, over an internal protocol registered up front.
        let find_node_chan = swarm.register_protocol(FIND_NODE_PROTOCOL).await;
        let service: Arc<dyn Service> = swarm.clone();
        dht.wire(Arc::downgrade(&service), find_node_chan);

        Ok(swarm)
    }

    fn assemble(
        config: Config,
        local: Arc<LocalNode>,
        network: Arc<Net>,
        cpool: Arc<ConnectionPool>,
        dht: Arc<dyn Dht>,
        gossip: Arc<dyn Gossip>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let (boot_state, _) = watch::channel(TaskState::Pending);
        let (gossip_state, _) = watch::channel(TaskState::Pending);
        Arc::new(Self {
            config,
            local,
            started: AtomicBool::new(false),
            protocol_handlers: RwLock::new(HashMap::new()),
            network,
            cpool,
            dht,
            gossip,
            shutdown,
            boot_state,
            gossip_state,
        })
    }

    pub fn local_node(&self) -> Arc<LocalNode> {
        self.local.clone()
    }

    /// Start every loop of the p2p layer. Fails when called twice.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("swarm already running");
        }
        debug!(local = %self.local.node(), "starting the p2p layer");

        // Event loop over connection lifecycle, then one worker per
        // incoming queue, then the transport starts accepting.
        let new_conns = self.network.subscribe_new_remote_connections();
        let closing = self.cpool.closing_connections()?;
        let events_swarm = self.clone();
        tokio::spawn(async move {
            events_swarm
                .handle_new_connection_events(new_conns, closing)
                .await;
        });

        for mut queue in self.network.incoming_messages()? {
            let swarm = self.clone();
            tokio::spawn(async move {
                let mut shutdown = swarm.shutdown.subscribe();
                loop {
                    tokio::select! {
                        event = queue.recv() => match event {
                            Some(event) => swarm.process_message(event).await,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            });
        }

        self.network.start_accepting()?;

        let drift_swarm = self.clone();
        tokio::spawn(async move {
            drift_swarm.check_time_drifts().await;
        });

        if self.config.swarm.bootstrap {
            let swarm = self.clone();
            tokio::spawn(async move {
                let began = std::time::Instant::now();
                match swarm.dht.bootstrap().await {
                    Ok(()) => {
                        let peers = swarm.dht.size().await;
                        info!(
                            peers = peers,
                            took = ?began.elapsed(),
                            "dht bootstrapped"
                        );
                        let _ = swarm.boot_state.send(TaskState::Done);
                    }
                    Err(err) => {
                        error!(%err, "failed to bootstrap");
                        let _ = swarm.boot_state.send(TaskState::Failed(err.to_string()));
                        swarm.shutdown().await;
                    }
                }
            });
        }

        if self.config.swarm.gossip {
            let swarm = self.clone();
            tokio::spawn(async move {
                if swarm.config.swarm.bootstrap {
                    // Gossip peer selection needs the routing table, so its
                    // start gates on bootstrap completion.
                    if let Err(err) = swarm.wait_for_boot().await {
                        warn!(%err, "starting gossip after failed bootstrap");
                    }
                }
                match swarm.gossip.start().await {
                    Ok(()) => {
                        let _ = swarm.gossip_state.send(TaskState::Done);
                    }
                    Err(err) => {
                        error!(%err, "failed to start gossip");
                        let _ = swarm.gossip_state.send(TaskState::Failed(err.to_string()));
                        swarm.shutdown().await;
                    }
                }
            });
        }

        Ok(())
    }

    /// Stop all loops, close the DHT and shut the transport down. Safe to
    /// call without `start`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.dht.close();
        // Re-observe the signal so the broadcast is ordered before the
        // transport teardown below.
        let observed = *self.shutdown.subscribe().borrow();
        debug_assert!(observed);
        self.network.shutdown();
    }

    /// Block until bootstrap completed, returning its stored error if any.
    pub async fn wait_for_boot(&self) -> anyhow::Result<()> {
        let mut state = self.boot_state.subscribe();
        let resolved = state
            .wait_for(|s| !matches!(s, TaskState::Pending))
            .await
            .map(|s| s.clone())
            .map_err(|_| anyhow::anyhow!("swarm dropped before bootstrap resolved"))?;
        match resolved {
            TaskState::Failed(err) => anyhow::bail!(err),
            _ => Ok(()),
        }
    }

    /// Block until the gossip neighborhood started, returning its stored
    /// error if any.
    pub async fn wait_for_gossip(&self) -> anyhow::Result<()> {
        let mut state = self.gossip_state.subscribe();
        let resolved = state
            .wait_for(|s| !matches!(s, TaskState::Pending))
            .await
            .map(|s| s.clone())
            .map_err(|_| anyhow::anyhow!("swarm dropped before gossip resolved"))?;
        match resolved {
            TaskState::Failed(err) => anyhow::bail!(err),
            _ => Ok(()),
        }
    }

    /// Install a handler channel for `protocol`; the last registration for
    /// a name wins.
    pub async fn register_protocol(&self, protocol: &str) -> mpsc::Receiver<ServiceMessage> {
        let (tx, rx) = mpsc::channel(PROTOCOL_HANDLER_CAPACITY);
        self.protocol_handlers
            .write()
            .await
            .insert(protocol.to_string(), tx);
        rx
    }

    /// Authenticated, encrypted, best-effort send: resolve the peer, reuse
    /// or open a connection, and transmit one signed message. A transport
    /// failure is retried once against a fresh connection.
    pub async fn send_message(
        &self,
        peer_pubkey: &str,
        protocol: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        if peer_pubkey == self.local.public_key().to_string() {
            anyhow::bail!("cannot send to self");
        }
        debug!(peer = %peer_pubkey, protocol, "sending message");

        let mut retried = false;
        loop {
            let (peer, conn) = self.resolve_peer(peer_pubkey).await?;
            let session = conn
                .session()
                .ok_or_else(|| anyhow::anyhow!("no valid session with {peer_pubkey}"))?;

            let mut msg = ProtocolMessage {
                metadata: Some(message::new_metadata(
                    self.local.public_key(),
                    protocol,
                    false,
                    &self.config.client_version,
                )),
                payload: payload.clone(),
            };
            message::sign_message(&self.local, &mut msg)?;
            let signed = message::encode(&msg)?;

            // The cipher advances on every encryption, so encrypt and send
            // must form one critical section; see `Session`.
            let guard = session.encrypt_guard().await;
            let wire = match message::prepare_message(session.as_ref(), &signed) {
                Ok(wire) => wire,
                Err(err) => {
                    drop(guard);
                    // The counter may already have advanced for a message
                    // that will never arrive; the receiver could not decrypt
                    // anything after it, so the connection must die.
                    error!(%err, "prepare message failed, closing the connection");
                    conn.close().await;
                    anyhow::bail!("failed to encrypt payload: {err}");
                }
            };
            let sent = conn.send(&wire).await;
            drop(guard);

            match sent {
                Ok(()) => return Ok(()),
                Err(err) if !retried => {
                    retried = true;
                    info!(peer = %peer_pubkey, %err, "send failed, retrying once");
                    // The registered connection may have been replaced
                    // underneath us; make sure a live one exists, then loop.
                    self.cpool
                        .get_connection(peer.address(), peer.public_key())
                        .await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Find a node and connection for `peer_pubkey`: the gossip neighbor
    /// set first (once gossip finished starting), then an existing pooled
    /// connection, then a DHT lookup plus dial.
    async fn resolve_peer(
        &self,
        peer_pubkey: &str,
    ) -> anyhow::Result<(Node, Arc<dyn Connection>)> {
        if self.config.swarm.gossip {
            // Non-blocking probe; never consult gossip before it started.
            let gossip_ready = matches!(&*self.gossip_state.borrow(), TaskState::Done);
            if gossip_ready {
                if let Some((node, conn)) = self.gossip.peer(peer_pubkey).await {
                    return Ok((node, conn));
                }
            }
        }

        let pubkey = PublicKey::from_hex(peer_pubkey)?;
        if let Ok(conn) = self.cpool.try_existing(pubkey).await {
            return Ok((Node::new(pubkey, ""), conn));
        }

        let peer = self.dht.lookup(peer_pubkey).await?;
        let conn = self
            .cpool
            .get_connection(peer.address(), peer.public_key())
            .await
            .map_err(|err| {
                warn!(peer = %peer_pubkey, %err, "no valid connection");
                err
            })?;
        Ok((peer, conn))
    }

    /// Sign `payload` as a gossip message and flood it to the neighborhood.
    pub async fn broadcast(&self, protocol: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        info!(protocol, "broadcasting protocol message");
        let mut msg = ProtocolMessage {
            metadata: Some(message::new_metadata(
                self.local.public_key(),
                protocol,
                true,
                &self.config.client_version,
            )),
            payload,
        };
        message::sign_message(&self.local, &mut msg)?;
        self.gossip.broadcast(message::encode(&msg)?).await
    }

    /// An existing pooled connection to `pubkey`; never dials.
    pub async fn peer(&self, pubkey: &str) -> anyhow::Result<Arc<dyn Connection>> {
        self.cpool
            .try_existing(PublicKey::from_hex(pubkey)?)
            .await
    }

    pub(crate) async fn process_message(&self, event: IncomingMessageEvent) {
        if *self.shutdown.borrow() {
            return;
        }
        if let Err(err) = self.on_remote_client_message(&event).await {
            error!(
                remote = %event.conn.remote_public_key(),
                %err,
                "error reading message, closing connection"
            );
            event.conn.close().await;
        }
    }

    /// The receive pipeline: envelope parse, drift check, decrypt, author
    /// verification, gossip relay, protocol dispatch. Every error closes
    /// the connection the message arrived on.
    pub(crate) async fn on_remote_client_message(
        &self,
        event: &IncomingMessageEvent,
    ) -> Result<(), SwarmError> {
        let envelope: CommonMessageData =
            message::decode(&event.message).map_err(|_| SwarmError::BadFormat1)?;

        if !timesync::check_message_drift(
            envelope.timestamp,
            self.config.time.max_allowed_message_drift,
        ) {
            return Err(SwarmError::OutOfSync);
        }

        if envelope.payload.is_empty() {
            return Err(SwarmError::NoPayload);
        }

        let session = event.conn.session().ok_or(SwarmError::NoSession)?;
        let decrypted = session
            .decrypt(&envelope.payload)
            .map_err(|_| SwarmError::FailDecrypt)?;

        let inner: ProtocolMessage =
            message::decode(&decrypted).map_err(|_| SwarmError::BadFormat2)?;
        // A message that decrypted but carries no metadata is defective.
        let Some(metadata) = inner.metadata.as_ref() else {
            return Err(SwarmError::BadFormat2);
        };

        // The session already authenticated the adjacent peer; this
        // authenticates the (possibly relayed) author.
        message::auth_author(&inner).map_err(|_| SwarmError::AuthAuthor)?;

        if !metadata.gossip
            && metadata.auth_pubkey.as_slice() != event.conn.remote_public_key().as_bytes()
        {
            return Err(SwarmError::NotFromPeer);
        }

        let author =
            PublicKey::from_bytes(&metadata.auth_pubkey).map_err(|_| SwarmError::AuthAuthor)?;
        let sender = Node::new(author, "");
        debug!(%sender, protocol = %metadata.protocol, "authorized protocol message");

        // We just heard from this authenticated identity.
        self.dht.update(sender.clone()).await;

        if metadata.gossip {
            // Relay valid gossip whether or not the protocol is known
            // locally; duplicates end the pipeline successfully.
            match self.gossip.broadcast(decrypted.clone()).await {
                Ok(()) => {}
                Err(err) if err.to_string() == OLD_MESSAGE => return Ok(()),
                Err(err) => warn!(%err, "gossip relay failed"),
            }
        }

        let handler = {
            let handlers = self.protocol_handlers.read().await;
            handlers.get(&metadata.protocol).cloned()
        };
        let Some(handler) = handler else {
            error!(protocol = %metadata.protocol, "message for unregistered protocol");
            return Err(SwarmError::NoProtocol);
        };

        // Blocks when the handler is backed up; backpressure is intended.
        handler
            .send(ServiceMessage::new(sender, inner.payload))
            .await
            .map_err(|_| SwarmError::NoProtocol)?;
        Ok(())
    }

    /// React to connection lifecycle events until shutdown: new remote
    /// connections feed the DHT and the gossip neighborhood, closing ones
    /// leave the neighborhood.
    async fn handle_new_connection_events(
        self: Arc<Self>,
        mut new_conns: mpsc::Receiver<crate::net::NewConnectionEvent>,
        mut closing: mpsc::Receiver<Arc<dyn Connection>>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                event = new_conns.recv() => match event {
                    Some(event) => {
                        let swarm = self.clone();
                        tokio::spawn(async move {
                            swarm.dht.update(event.node.clone()).await;
                            swarm.gossip.register_peer(event.node, event.conn).await;
                        });
                    }
                    None => break,
                },
                closed = closing.recv() => match closed {
                    Some(conn) => {
                        let swarm = self.clone();
                        tokio::spawn(async move {
                            swarm.gossip.disconnect(conn).await;
                        });
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("connection event loop stopped");
    }

    /// Periodically verify the local clock against NTP; a drifting clock
    /// invalidates every timestamp check, so the swarm shuts down.
    async fn check_time_drifts(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.time.ntp_refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate first tick
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = timesync::check_system_clock_drift(&self.config.time).await {
                        error!(%err, "system clock could not be validated");
                        self.shutdown().await;
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[async_trait]
impl Service for Swarm {
    fn local_node(&self) -> Arc<LocalNode> {
        self.local.clone()
    }

    async fn register_protocol(&self, protocol: &str) -> mpsc::Receiver<ServiceMessage> {
        Swarm::register_protocol(self, protocol).await
    }

    async fn send_message(
        &self,
        peer_pubkey: &str,
        protocol: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        Swarm::send_message(self, peer_pubkey, protocol, payload).await
    }

    async fn broadcast(&self, protocol: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        Swarm::broadcast(self, protocol, payload).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::gossip::Gossip;
    use crate::testing::{ConnectionMock, SessionMock};

    const EXAMPLE_PROTOCOL: &str = "EX";
    const EXAMPLE_PAYLOAD: &[u8] = b"Example";

    fn test_config() -> Config {
        Config {
            tcp_port: 0,
            data_dir: std::env::temp_dir().join("swarmp2p-test"),
            ..Config::default()
        }
    }

    async fn p2p_instance() -> Arc<Swarm> {
        Swarm::new(test_config(), true, false)
            .await
            .expect("create swarm")
    }

    fn signed_example(
        author: &LocalNode,
        protocol: &str,
        gossip: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut msg = ProtocolMessage {
            metadata: Some(message::new_metadata(
                author.public_key(),
                protocol,
                gossip,
                crate::config::CLIENT_VERSION,
            )),
            payload: payload.to_vec(),
        };
        message::sign_message(author, &mut msg).expect("sign");
        message::encode(&msg).expect("encode")
    }

    fn envelope_bytes(payload: &[u8], timestamp: i64) -> Vec<u8> {
        message::encode(&CommonMessageData {
            session_id: b"test".to_vec(),
            payload: payload.to_vec(),
            timestamp,
        })
        .expect("encode envelope")
    }

    fn test_identity(seed: u64) -> LocalNode {
        use ed25519_dalek::SigningKey;
        use rand::{rngs::StdRng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        LocalNode::new(SigningKey::generate(&mut rng), "0.0.0.0:0")
    }

    #[tokio::test]
    async fn start_is_one_shot() {
        let swarm = p2p_instance().await;
        swarm.start().expect("first start");
        let err = swarm.start().expect_err("second start must fail");
        assert!(err.to_string().contains("swarm already running"));
        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_without_start_is_safe() {
        let swarm = p2p_instance().await;
        swarm.shutdown().await;
        assert!(*swarm.shutdown.subscribe().borrow());
    }

    #[tokio::test]
    async fn protocols_can_register_before_start() {
        let swarm = p2p_instance().await;
        let _chan = swarm.register_protocol("Anton").await;
        let handlers = swarm.protocol_handlers.read().await;
        assert!(handlers.contains_key("Anton"));
        // The swarm registers its internal find-node protocol on its own.
        assert!(handlers.contains_key(FIND_NODE_PROTOCOL));
        drop(handlers);
        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn process_message_closes_connection_on_error() {
        let swarm = p2p_instance().await;
        let remote = test_identity(1);
        let conn = Arc::new(ConnectionMock::new(remote.public_key()));
        swarm
            .process_message(IncomingMessageEvent {
                conn: conn.clone(),
                message: b"0".to_vec(),
            })
            .await;
        assert!(conn.closed());
        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn receive_pipeline_rejects_each_malformed_stage() {
        let swarm = p2p_instance().await;
        let id = test_identity(2);
        let conn = Arc::new(ConnectionMock::without_session(id.public_key()));
        let drift = swarm.config.time.max_allowed_message_drift.as_secs() as i64;

        let event = |message: Vec<u8>| IncomingMessageEvent {
            conn: conn.clone(),
            message,
        };

        // Undecodable envelope.
        let err = swarm
            .on_remote_client_message(&event(b"badbadformat".to_vec()))
            .await
            .expect_err("garbage must fail");
        assert_eq!(err, SwarmError::BadFormat1);

        // Timestamp outside the drift window.
        let err = swarm
            .on_remote_client_message(&event(envelope_bytes(
                b"test",
                timesync::now_unix() + drift + 60,
            )))
            .await
            .expect_err("future timestamp must fail");
        assert_eq!(err, SwarmError::OutOfSync);

        // Empty payload.
        let err = swarm
            .on_remote_client_message(&event(envelope_bytes(b"", timesync::now_unix())))
            .await
            .expect_err("empty payload must fail");
        assert_eq!(err, SwarmError::NoPayload);

        // No session on the connection.
        let err = swarm
            .on_remote_client_message(&event(envelope_bytes(b"test", timesync::now_unix())))
            .await
            .expect_err("missing session must fail");
        assert_eq!(err, SwarmError::NoSession);

        // Session that cannot decrypt.
        let session = Arc::new(SessionMock::new());
        session.set_decrypt(Err("fail"));
        conn.set_session(session.clone());
        let err = swarm
            .on_remote_client_message(&event(envelope_bytes(b"test", timesync::now_unix())))
            .await
            .expect_err("failed decrypt must fail");
        assert_eq!(err, SwarmError::FailDecrypt);

        // Decrypts, but the plaintext is not a protocol message.
        session.set_decrypt(Ok(b"wont_format_to_protocol_message".to_vec()));
        let err = swarm
            .on_remote_client_message(&event(envelope_bytes(b"test", timesync::now_unix())))
            .await
            .expect_err("undecodable inner must fail");
        assert_eq!(err, SwarmError::BadFormat2);

        // Well-formed inner message that was never signed.
        let unsigned = message::encode(&ProtocolMessage {
            metadata: Some(message::new_metadata(
                id.public_key(),
                EXAMPLE_PROTOCOL,
                false,
                crate::config::CLIENT_VERSION,
            )),
            payload: EXAMPLE_PAYLOAD.to_vec(),
        })
        .expect("encode unsigned");
        session.set_decrypt(Ok(unsigned));
        let err = swarm
            .on_remote_client_message(&event(envelope_bytes(b"test", timesync::now_unix())))
            .await
            .expect_err("unsigned author must fail");
        assert_eq!(err, SwarmError::AuthAuthor);

        // Properly signed, but nothing registered the protocol.
        session.set_decrypt(Ok(signed_example(&id, EXAMPLE_PROTOCOL, false, EXAMPLE_PAYLOAD)));
        let err = swarm
            .on_remote_client_message(&event(envelope_bytes(b"test", timesync::now_unix())))
            .await
            .expect_err("unknown protocol must fail");
        assert_eq!(err, SwarmError::NoProtocol);

        // With a handler installed the same message goes through.
        let mut chan = swarm.register_protocol(EXAMPLE_PROTOCOL).await;
        swarm
            .on_remote_client_message(&event(envelope_bytes(b"test", timesync::now_unix())))
            .await
            .expect("valid message");
        let delivered = chan.recv().await.expect("delivered");
        assert_eq!(delivered.sender().public_key(), id.public_key());
        assert_eq!(delivered.data(), EXAMPLE_PAYLOAD);

        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn direct_message_from_wrong_signer_is_rejected() {
        let swarm = p2p_instance().await;
        let adjacent = test_identity(3);
        let author = test_identity(4);

        let conn = Arc::new(ConnectionMock::new(adjacent.public_key()));
        let session = Arc::new(SessionMock::new());
        session.set_decrypt(Ok(signed_example(
            &author,
            EXAMPLE_PROTOCOL,
            false,
            EXAMPLE_PAYLOAD,
        )));
        conn.set_session(session);

        let err = swarm
            .on_remote_client_message(&IncomingMessageEvent {
                conn: conn.clone(),
                message: envelope_bytes(b"test", timesync::now_unix()),
            })
            .await
            .expect_err("direct message from non-adjacent author must fail");
        assert_eq!(err, SwarmError::NotFromPeer);
        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn gossip_message_is_relayed_then_deduplicated() {
        let swarm = p2p_instance().await;
        let adjacent = test_identity(5);
        let author = test_identity(6); // relayed: author is not the peer

        let conn = Arc::new(ConnectionMock::new(adjacent.public_key()));
        let session = Arc::new(SessionMock::new());
        let gossip_inner = signed_example(&author, EXAMPLE_PROTOCOL, true, EXAMPLE_PAYLOAD);
        session.set_decrypt(Ok(gossip_inner));
        conn.set_session(session);

        let mut chan = swarm.register_protocol(EXAMPLE_PROTOCOL).await;
        let event = IncomingMessageEvent {
            conn: conn.clone(),
            message: envelope_bytes(b"test", timesync::now_unix()),
        };

        // First arrival relays and dispatches.
        swarm
            .on_remote_client_message(&event)
            .await
            .expect("first gossip arrival");
        let delivered = chan.recv().await.expect("delivered");
        assert_eq!(delivered.sender().public_key(), author.public_key());

        // Second arrival is an old message: success, but no dispatch.
        swarm
            .on_remote_client_message(&event)
            .await
            .expect("duplicate swallowed");
        assert!(
            tokio::time::timeout(Duration::from_millis(200), chan.recv())
                .await
                .is_err(),
            "duplicate must not be dispatched"
        );
        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn gossip_for_unknown_protocol_still_errors_locally() {
        let swarm = p2p_instance().await;
        let adjacent = test_identity(7);
        let author = test_identity(8);

        let conn = Arc::new(ConnectionMock::new(adjacent.public_key()));
        let session = Arc::new(SessionMock::new());
        session.set_decrypt(Ok(signed_example(
            &author,
            "DOES_NOT_EXIST",
            true,
            EXAMPLE_PAYLOAD,
        )));
        conn.set_session(session);

        let err = swarm
            .on_remote_client_message(&IncomingMessageEvent {
                conn: conn.clone(),
                message: envelope_bytes(b"test", timesync::now_unix()),
            })
            .await
            .expect_err("unknown protocol still errors after relay");
        assert_eq!(err, SwarmError::NoProtocol);
        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_self_is_rejected() {
        let swarm = p2p_instance().await;
        let err = swarm
            .send_message(
                &swarm.local_node().public_key().to_string(),
                EXAMPLE_PROTOCOL,
                EXAMPLE_PAYLOAD.to_vec(),
            )
            .await
            .expect_err("self send must fail");
        assert!(err.to_string().contains("cannot send to self"));
        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let swarm = p2p_instance().await;
        swarm.start().expect("start");
        let stranger = test_identity(9);
        let err = swarm
            .send_message(
                &stranger.public_key().to_string(),
                EXAMPLE_PROTOCOL,
                EXAMPLE_PAYLOAD.to_vec(),
            )
            .await
            .expect_err("unknown peer must fail");
        assert!(err.to_string().contains("failed to find"));
        swarm.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn round_trip_between_two_swarms() {
        let p1 = p2p_instance().await;
        let p2 = p2p_instance().await;
        p1.start().expect("start p1");
        p2.start().expect("start p2");

        let mut chan1 = p1.register_protocol(EXAMPLE_PROTOCOL).await;
        let mut chan2 = p2.register_protocol(EXAMPLE_PROTOCOL).await;

        let p1_node = Node::new(
            p1.local_node().public_key(),
            format!("127.0.0.1:{}", p1.network.local_addr().port()),
        );
        let p2_node = Node::new(
            p2.local_node().public_key(),
            format!("127.0.0.1:{}", p2.network.local_addr().port()),
        );
        p2.dht.update(p1_node).await;
        p1.dht.update(p2_node).await;

        p2.send_message(
            &p1.local_node().public_key().to_string(),
            EXAMPLE_PROTOCOL,
            b"hello".to_vec(),
        )
        .await
        .expect("send p2 -> p1");

        let delivered = tokio::time::timeout(Duration::from_secs(5), chan1.recv())
            .await
            .expect("delivery in time")
            .expect("message");
        assert_eq!(delivered.data(), b"hello");
        assert_eq!(
            delivered.sender().public_key(),
            p2.local_node().public_key()
        );

        p1.send_message(
            &p2.local_node().public_key().to_string(),
            EXAMPLE_PROTOCOL,
            b"hello back".to_vec(),
        )
        .await
        .expect("send p1 -> p2");

        let delivered = tokio::time::timeout(Duration::from_secs(5), chan2.recv())
            .await
            .expect("delivery in time")
            .expect("message");
        assert_eq!(delivered.data(), b"hello back");
        assert_eq!(
            delivered.sender().public_key(),
            p1.local_node().public_key()
        );

        p1.shutdown().await;
        p2.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_sends_keep_the_cipher_chain_intact() {
        let p1 = p2p_instance().await;
        let p2 = p2p_instance().await;
        p1.start().expect("start p1");
        p2.start().expect("start p2");

        let mut chan1 = p1.register_protocol(EXAMPLE_PROTOCOL).await;
        let p1_node = Node::new(
            p1.local_node().public_key(),
            format!("127.0.0.1:{}", p1.network.local_addr().port()),
        );
        p2.dht.update(p1_node).await;

        let target = p1.local_node().public_key().to_string();
        let mut senders = Vec::new();
        for task in 0..10u8 {
            let p2 = p2.clone();
            let target = target.clone();
            senders.push(tokio::spawn(async move {
                for i in 0..5u8 {
                    p2.send_message(&target, EXAMPLE_PROTOCOL, vec![task, i])
                        .await
                        .expect("concurrent send");
                }
            }));
        }
        for sender in senders {
            sender.await.expect("sender task");
        }

        // All 50 messages decrypt and arrive; an unserialized cipher chain
        // would have broken the stream after the first interleaving.
        for _ in 0..50 {
            let delivered = tokio::time::timeout(Duration::from_secs(5), chan1.recv())
                .await
                .expect("delivery in time")
                .expect("message");
            assert_eq!(delivered.data().len(), 2);
        }

        p1.shutdown().await;
        p2.shutdown().await;
    }

    // -- lifecycle gating with scripted dht/gossip -----------------------

    struct ScriptedDht {
        boot_result: Option<String>,
        boot_finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Dht for ScriptedDht {
        async fn bootstrap(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.boot_finished.store(true, Ordering::SeqCst);
            match &self.boot_result {
                None => Ok(()),
                Some(err) => anyhow::bail!(err.clone()),
            }
        }

        async fn lookup(&self, peer_pubkey: &str) -> anyhow::Result<Node> {
            anyhow::bail!("failed to find {peer_pubkey} in the network")
        }

        async fn update(&self, _node: Node) {}

        async fn select_peers(&self, _count: usize) -> Vec<Node> {
            vec![]
        }

        async fn size(&self) -> usize {
            0
        }

        fn close(&self) {}
    }

    struct ScriptedGossip {
        boot_finished: Arc<AtomicBool>,
        started_after_boot: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Gossip for ScriptedGossip {
        async fn start(&self) -> anyhow::Result<()> {
            self.started_after_boot
                .store(self.boot_finished.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }

        async fn register_peer(&self, _node: Node, _conn: Arc<dyn Connection>) {}

        async fn disconnect(&self, _conn: Arc<dyn Connection>) {}

        async fn peer(&self, _pubkey: &str) -> Option<(Node, Arc<dyn Connection>)> {
            None
        }

        async fn broadcast(&self, _data: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn scripted_swarm(
        config: Config,
        dht: Arc<dyn Dht>,
        gossip: Arc<dyn Gossip>,
    ) -> Arc<Swarm> {
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let local = Arc::new(LocalNode::new(
            SigningKey::generate(&mut OsRng),
            format!("127.0.0.1:{port}"),
        ));
        let network = Net::new(local.clone(), listener).expect("net");
        let cpool = ConnectionPool::new(network.clone(), local.public_key());
        Swarm::assemble(config, local, network, cpool, dht, gossip)
    }

    #[tokio::test]
    async fn gossip_start_waits_for_bootstrap() {
        let boot_finished = Arc::new(AtomicBool::new(false));
        let started_after_boot = Arc::new(AtomicBool::new(false));
        let mut config = test_config();
        config.swarm.bootstrap = true;
        config.swarm.gossip = true;

        let swarm = scripted_swarm(
            config,
            Arc::new(ScriptedDht {
                boot_result: None,
                boot_finished: boot_finished.clone(),
            }),
            Arc::new(ScriptedGossip {
                boot_finished: boot_finished.clone(),
                started_after_boot: started_after_boot.clone(),
            }),
        )
        .await;

        swarm.start().expect("start");
        swarm.wait_for_boot().await.expect("boot");
        swarm.wait_for_gossip().await.expect("gossip");
        assert!(started_after_boot.load(Ordering::SeqCst));
        swarm.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_failure_stores_error_and_shuts_down() {
        let mut config = test_config();
        config.swarm.bootstrap = true;

        let swarm = scripted_swarm(
            config,
            Arc::new(ScriptedDht {
                boot_result: Some("seed nodes unreachable".to_string()),
                boot_finished: Arc::new(AtomicBool::new(false)),
            }),
            Arc::new(ScriptedGossip {
                boot_finished: Arc::new(AtomicBool::new(false)),
                started_after_boot: Arc::new(AtomicBool::new(false)),
            }),
        )
        .await;

        swarm.start().expect("start");
        let err = swarm.wait_for_boot().await.expect_err("boot must fail");
        assert!(err.to_string().contains("seed nodes unreachable"));

        // A failed bootstrap takes the whole swarm down.
        let mut shutdown = swarm.shutdown.subscribe();
        tokio::time::timeout(Duration::from_secs(5), shutdown.wait_for(|v| *v))
            .await
            .expect("shutdown in time")
            .expect("observed");
    }

    struct RecordingGossip {
        broadcasts: StdMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Gossip for RecordingGossip {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn register_peer(&self, _node: Node, _conn: Arc<dyn Connection>) {}

        async fn disconnect(&self, _conn: Arc<dyn Connection>) {}

        async fn peer(&self, _pubkey: &str) -> Option<(Node, Arc<dyn Connection>)> {
            None
        }

        async fn broadcast(&self, data: Vec<u8>) -> anyhow::Result<()> {
            self.broadcasts.lock().expect("broadcasts lock").push(data);
            Ok(())
        }
    }

    #[tokio::test]
    async fn broadcast_hands_a_signed_gossip_message_to_the_neighborhood() {
        let gossip = Arc::new(RecordingGossip {
            broadcasts: StdMutex::new(Vec::new()),
        });
        let swarm = scripted_swarm(
            test_config(),
            Arc::new(ScriptedDht {
                boot_result: None,
                boot_finished: Arc::new(AtomicBool::new(false)),
            }),
            gossip.clone(),
        )
        .await;

        swarm
            .broadcast("TOPIC", b"flood me".to_vec())
            .await
            .expect("broadcast");

        let recorded = gossip.broadcasts.lock().expect("broadcasts lock").clone();
        assert_eq!(recorded.len(), 1);
        let msg: ProtocolMessage = message::decode(&recorded[0]).expect("decode");
        let metadata = msg.metadata.as_ref().expect("metadata");
        assert!(metadata.gossip);
        assert_eq!(metadata.protocol, "TOPIC");
        assert_eq!(msg.payload, b"flood me");
        message::auth_author(&msg).expect("broadcast is signed");
        swarm.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrapped_network_delivers_between_random_pairs() {
        const NODES: usize = 10;

        // One bootnode everyone seeds from.
        let bootnode = p2p_instance().await;
        bootnode.start().expect("start bootnode");
        let boot_entry = format!(
            "{}@127.0.0.1:{}",
            bootnode.local_node().public_key(),
            bootnode.network.local_addr().port()
        );

        let mut swarms = Vec::new();
        for _ in 0..NODES {
            let mut config = test_config();
            config.swarm.bootstrap = true;
            config.swarm.random_connections = 3;
            config.swarm.bootstrap_nodes = vec![boot_entry.clone()];
            let swarm = Swarm::new(config, true, false).await.expect("create");
            swarm.start().expect("start");
            swarms.push(swarm);
        }
        for swarm in &swarms {
            tokio::time::timeout(Duration::from_secs(30), swarm.wait_for_boot())
                .await
                .expect("boot in time")
                .expect("boot ok");
        }

        let mut channels = Vec::new();
        for swarm in &swarms {
            channels.push(swarm.register_protocol(EXAMPLE_PROTOCOL).await);
        }

        use rand::Rng;
        let mut rng = rand::thread_rng();
        for round in 0..10u8 {
            let from = rng.gen_range(0..NODES);
            let mut to = rng.gen_range(0..NODES);
            while to == from {
                to = rng.gen_range(0..NODES);
            }

            swarms[from]
                .send_message(
                    &swarms[to].local_node().public_key().to_string(),
                    EXAMPLE_PROTOCOL,
                    vec![round],
                )
                .await
                .expect("send between bootstrapped nodes");

            let delivered = tokio::time::timeout(Duration::from_secs(5), channels[to].recv())
                .await
                .expect("delivery in time")
                .expect("message");
            assert_eq!(delivered.data(), [round]);
            assert_eq!(
                delivered.sender().public_key(),
                swarms[from].local_node().public_key()
            );
        }

        for swarm in swarms {
            swarm.shutdown().await;
        }
        bootnode.shutdown().await;
    }
}
