// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::connection::{Connection, NetConnection};
use crate::identity::LocalNode;
use crate::node::{Node, PublicKey};
use crate::transport::{self, MAX_MESSAGE_BYTES};

/// Incoming messages are sharded into this many queues by remote identity,
/// so per-peer ordering survives while unrelated peers proceed in parallel.
pub const INCOMING_QUEUE_COUNT: usize = 4;

const QUEUE_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// An authenticated remote peer opened a connection to us.
pub struct NewConnectionEvent {
    pub node: Node,
    pub conn: Arc<dyn Connection>,
}

/// A framed message arrived on a connection.
pub struct IncomingMessageEvent {
    pub conn: Arc<dyn Connection>,
    pub message: Vec<u8>,
}

/// The TCP transport: listener, dialer, per-connection read loops, and the
/// sharded incoming-message queues. Connection lifecycle events fan out to
/// any number of subscribers.
pub struct Net {
    local: Arc<LocalNode>,
    listen_addr: SocketAddr,
    listener: StdMutex<Option<TcpListener>>,
    conn_seq: AtomicU64,
    queue_txs: Vec<mpsc::Sender<IncomingMessageEvent>>,
    queue_rxs: StdMutex<Option<Vec<mpsc::Receiver<IncomingMessageEvent>>>>,
    new_conn_subs: StdMutex<Vec<mpsc::Sender<NewConnectionEvent>>>,
    closing_subs: StdMutex<Vec<mpsc::Sender<Arc<dyn Connection>>>>,
    shutdown: watch::Sender<bool>,
}

impl Net {
    /// Wrap an already-bound listener. Accepting starts only when
    /// [`Net::start_accepting`] is called, after subscribers are attached.
    pub fn new(local: Arc<LocalNode>, listener: TcpListener) -> anyhow::Result<Arc<Self>> {
        let listen_addr = listener.local_addr()?;
        let mut queue_txs = Vec::with_capacity(INCOMING_QUEUE_COUNT);
        let mut queue_rxs = Vec::with_capacity(INCOMING_QUEUE_COUNT);
        for _ in 0..INCOMING_QUEUE_COUNT {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            queue_txs.push(tx);
            queue_rxs.push(rx);
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            local,
            listen_addr,
            listener: StdMutex::new(Some(listener)),
            conn_seq: AtomicU64::new(0),
            queue_txs,
            queue_rxs: StdMutex::new(Some(queue_rxs)),
            new_conn_subs: StdMutex::new(Vec::new()),
            closing_subs: StdMutex::new(Vec::new()),
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn subscribe_new_remote_connections(&self) -> mpsc::Receiver<NewConnectionEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.new_conn_subs
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    pub fn subscribe_closing_connections(&self) -> mpsc::Receiver<Arc<dyn Connection>> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.closing_subs
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// The sharded incoming-message queues. Can only be taken once; the
    /// swarm runs one worker per queue.
    pub fn incoming_messages(&self) -> anyhow::Result<Vec<mpsc::Receiver<IncomingMessageEvent>>> {
        self.queue_rxs
            .lock()
            .expect("queue list poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("incoming message queues already taken"))
    }

    /// Spawn the accept loop on the listener bound at construction.
    pub fn start_accepting(self: &Arc<Self>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("listener poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("transport is already accepting"))?;
        let net = self.clone();
        tokio::spawn(async move {
            let mut shutdown = net.shutdown.subscribe();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let net = net.clone();
                            tokio::spawn(async move {
                                if let Err(err) = net.handle_inbound(stream).await {
                                    debug!(%addr, %err, "inbound connection failed");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(%err, "accept failed");
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("accept loop stopped");
        });
        Ok(())
    }

    /// Dial `address` and authenticate the peer as `expected`.
    pub async fn dial(
        self: &Arc<Self>,
        address: &str,
        expected: PublicKey,
    ) -> anyhow::Result<Arc<dyn Connection>> {
        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| anyhow::anyhow!("dial to {address} timed out"))??;
        let outcome = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            transport::handshake_initiator(&mut stream, &self.local, Some(expected)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("handshake with {address} timed out"))??;

        let (conn, reader) = self.new_connection(stream, outcome.remote, outcome.session);
        self.spawn_read_loop(conn.clone(), reader);
        Ok(conn)
    }

    /// Signal every loop to stop; read loops close their connections on the
    /// way out.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn handle_inbound(self: &Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let outcome = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            transport::handshake_responder(&mut stream, &self.local),
        )
        .await
        .map_err(|_| anyhow::anyhow!("inbound handshake timed out"))??;

        let node = outcome.remote.clone();
        let (conn, reader) = self.new_connection(stream, outcome.remote, outcome.session);
        debug!(remote = %node, "new remote connection");
        // Announce the connection before the first frame can be read, so
        // subscribers learn it no later than its first message.
        self.publish_new_connection(NewConnectionEvent {
            node,
            conn: conn.clone(),
        })
        .await;
        self.spawn_read_loop(conn, reader);
        Ok(())
    }

    fn new_connection(
        &self,
        stream: TcpStream,
        remote: Node,
        session: Arc<crate::session::NetworkSession>,
    ) -> (Arc<NetConnection>, OwnedReadHalf) {
        let (reader, writer) = stream.into_split();
        let id = self.conn_seq.fetch_add(1, Ordering::SeqCst);
        (
            Arc::new(NetConnection::new(id, remote, session, writer)),
            reader,
        )
    }

    fn spawn_read_loop(self: &Arc<Self>, conn: Arc<NetConnection>, reader: OwnedReadHalf) {
        let net = self.clone();
        tokio::spawn(async move {
            net.read_loop(conn, reader).await;
        });
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<NetConnection>, mut reader: OwnedReadHalf) {
        let shard = queue_shard(conn.remote_public_key());
        let queue = self.queue_txs[shard].clone();
        let notify = conn.close_notified();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                framed = transport::read_frame(&mut reader, MAX_MESSAGE_BYTES) => match framed {
                    Ok(message) => {
                        let event = IncomingMessageEvent {
                            conn: conn.clone() as Arc<dyn Connection>,
                            message,
                        };
                        // Blocks when the queue is full; transport-level
                        // backpressure toward this peer is intended.
                        if queue.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(conn = conn.id(), %err, "read loop ended");
                        break;
                    }
                },
                _ = notify.notified() => break,
                _ = shutdown.changed() => break,
            }
        }
        conn.close().await;
        self.publish_closing(conn as Arc<dyn Connection>).await;
    }

    async fn publish_new_connection(&self, event: NewConnectionEvent) {
        let subs = self
            .new_conn_subs
            .lock()
            .expect("subscriber list poisoned")
            .clone();
        for sub in subs {
            let _ = sub
                .send(NewConnectionEvent {
                    node: event.node.clone(),
                    conn: event.conn.clone(),
                })
                .await;
        }
    }

    async fn publish_closing(&self, conn: Arc<dyn Connection>) {
        let subs = self
            .closing_subs
            .lock()
            .expect("subscriber list poisoned")
            .clone();
        for sub in subs {
            let _ = sub.send(conn.clone()).await;
        }
    }
}

fn queue_shard(key: PublicKey) -> usize {
    let bytes = key.as_bytes();
    let head = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
    (head % INCOMING_QUEUE_COUNT as u64) as usize
}
