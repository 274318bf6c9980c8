// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// Test doubles for the swarm's capability traits.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use crate::conn_pool::Dialer;
use crate::connection::Connection;
use crate::dht::Dht;
use crate::node::{Node, PublicKey};
use crate::session::Session;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

static MOCK_CONN_SEQ: AtomicU64 = AtomicU64::new(1 << 32);

/// Session whose decrypt/encrypt outcomes are scripted by the test.
pub(crate) struct SessionMock {
    decrypt: StdMutex<Result<Vec<u8>, String>>,
    encrypt: StdMutex<Result<Option<Vec<u8>>, String>>,
    guard: Arc<AsyncMutex<()>>,
}

impl SessionMock {
    pub(crate) fn new() -> Self {
        Self {
            decrypt: StdMutex::new(Err("decrypt not scripted".to_string())),
            // None = echo the plaintext back.
            encrypt: StdMutex::new(Ok(None)),
            guard: Arc::new(AsyncMutex::new(())),
        }
    }

    pub(crate) fn set_decrypt(&self, result: Result<Vec<u8>, &str>) {
        *self.decrypt.lock().expect("decrypt lock") = result.map_err(str::to_string);
    }

    pub(crate) fn set_encrypt_error(&self, err: &str) {
        *self.encrypt.lock().expect("encrypt lock") = Err(err.to_string());
    }
}

#[async_trait]
impl Session for SessionMock {
    fn id(&self) -> Vec<u8> {
        b"mock-session".to_vec()
    }

    async fn encrypt_guard(&self) -> OwnedMutexGuard<()> {
        self.guard.clone().lock_owned().await
    }

    fn encrypt(&self, plain: &[u8]) -> anyhow::Result<Vec<u8>> {
        match &*self.encrypt.lock().expect("encrypt lock") {
            Ok(Some(fixed)) => Ok(fixed.clone()),
            Ok(None) => Ok(plain.to_vec()),
            Err(err) => Err(anyhow::anyhow!("{err}")),
        }
    }

    fn decrypt(&self, _cipher: &[u8]) -> anyhow::Result<Vec<u8>> {
        match &*self.decrypt.lock().expect("decrypt lock") {
            Ok(plain) => Ok(plain.clone()),
            Err(err) => Err(anyhow::anyhow!("{err}")),
        }
    }
}

/// Connection with a scriptable session that records what was sent.
pub(crate) struct ConnectionMock {
    id: u64,
    remote: PublicKey,
    session: StdMutex<Option<Arc<dyn Session>>>,
    closed: AtomicBool,
    sent: StdMutex<Vec<Vec<u8>>>,
}

impl ConnectionMock {
    pub(crate) fn new(remote: PublicKey) -> Self {
        Self {
            id: MOCK_CONN_SEQ.fetch_add(1, Ordering::SeqCst),
            remote,
            session: StdMutex::new(Some(Arc::new(SessionMock::new()))),
            closed: AtomicBool::new(false),
            sent: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn without_session(remote: PublicKey) -> Self {
        let conn = Self::new(remote);
        *conn.session.lock().expect("session lock") = None;
        conn
    }

    pub(crate) fn set_session(&self, session: Arc<dyn Session>) {
        *self.session.lock().expect("session lock") = Some(session);
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for ConnectionMock {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_public_key(&self) -> PublicKey {
        self.remote
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.lock().expect("session lock").clone()
    }

    fn is_closed(&self) -> bool {
        self.closed()
    }

    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        if self.closed() {
            anyhow::bail!("connection is closed");
        }
        self.sent.lock().expect("sent lock").push(data.to_vec());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// DHT double with a fixed peer list and call recording.
#[derive(Default)]
pub(crate) struct NullDht {
    pub(crate) peers: StdMutex<Vec<Node>>,
    pub(crate) updates: StdMutex<Vec<Node>>,
}

#[async_trait]
impl Dht for NullDht {
    async fn bootstrap(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn lookup(&self, peer_pubkey: &str) -> anyhow::Result<Node> {
        let peers = self.peers.lock().expect("peers lock");
        peers
            .iter()
            .find(|n| n.public_key().to_string() == peer_pubkey)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to find {peer_pubkey} in the network"))
    }

    async fn update(&self, node: Node) {
        self.updates.lock().expect("updates lock").push(node);
    }

    async fn select_peers(&self, count: usize) -> Vec<Node> {
        let peers = self.peers.lock().expect("peers lock");
        peers.iter().take(count).cloned().collect()
    }

    async fn size(&self) -> usize {
        self.peers.lock().expect("peers lock").len()
    }

    fn close(&self) {}
}

/// Dialer double that refuses every dial.
pub(crate) struct NullDialer;

#[async_trait]
impl Dialer for NullDialer {
    async fn get_connection(
        &self,
        _address: &str,
        remote: PublicKey,
    ) -> anyhow::Result<Arc<dyn Connection>> {
        anyhow::bail!("no connection to {remote} in this test")
    }
}
