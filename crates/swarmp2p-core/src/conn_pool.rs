// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use crate::connection::Connection;
use crate::net::Net;
use crate::node::PublicKey;

const CLOSING_CAPACITY: usize = 64;

/// Something that can produce an authenticated connection to a peer.
/// The pool is the production implementation; test doubles stand in for it
/// where only connection supply matters.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn get_connection(
        &self,
        address: &str,
        remote: PublicKey,
    ) -> anyhow::Result<Arc<dyn Connection>>;
}

/// Deduplicates connections per remote identity.
///
/// Outbound connections enter the map through [`ConnectionPool::get_connection`];
/// inbound ones through the subscription on the transport's
/// new-remote-connection events. Closing events evict the map and are
/// forwarded to the swarm's event loop.
pub struct ConnectionPool {
    local: PublicKey,
    net: Arc<Net>,
    conns: AsyncMutex<HashMap<PublicKey, Arc<dyn Connection>>>,
    // Per-peer dial locks so concurrent sends to one peer dial only once.
    dialing: AsyncMutex<HashMap<PublicKey, Arc<AsyncMutex<()>>>>,
    closing_tx: mpsc::Sender<Arc<dyn Connection>>,
    closing_rx: StdMutex<Option<mpsc::Receiver<Arc<dyn Connection>>>>,
}

impl ConnectionPool {
    pub fn new(net: Arc<Net>, local: PublicKey) -> Arc<Self> {
        let (closing_tx, closing_rx) = mpsc::channel(CLOSING_CAPACITY);
        let pool = Arc::new(Self {
            local,
            net: net.clone(),
            conns: AsyncMutex::new(HashMap::new()),
            dialing: AsyncMutex::new(HashMap::new()),
            closing_tx,
            closing_rx: StdMutex::new(Some(closing_rx)),
        });

        let mut new_conns = net.subscribe_new_remote_connections();
        let mut closing = net.subscribe_closing_connections();
        let tracker = pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = new_conns.recv() => match event {
                        Some(event) => {
                            let key = event.node.public_key();
                            tracker.conns.lock().await.insert(key, event.conn);
                        }
                        None => break,
                    },
                    closed = closing.recv() => match closed {
                        Some(conn) => {
                            let key = conn.remote_public_key();
                            let mut conns = tracker.conns.lock().await;
                            // Only evict if the closed handle is still the
                            // registered one; it may have been replaced.
                            if conns.get(&key).map(|c| c.id()) == Some(conn.id()) {
                                conns.remove(&key);
                            }
                            drop(conns);
                            let _ = tracker.closing_tx.send(conn).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("connection pool event task stopped");
        });

        pool
    }

    /// Closing events, to be taken once by the swarm's event loop.
    pub fn closing_connections(&self) -> anyhow::Result<mpsc::Receiver<Arc<dyn Connection>>> {
        self.closing_rx
            .lock()
            .expect("closing receiver poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("closing connections already taken"))
    }

    /// A live existing connection to `remote`, or an error when none is
    /// registered; never dials.
    pub async fn try_existing(&self, remote: PublicKey) -> anyhow::Result<Arc<dyn Connection>> {
        let conns = self.conns.lock().await;
        match conns.get(&remote) {
            Some(conn) if !conn.is_closed() => Ok(conn.clone()),
            _ => anyhow::bail!("no existing connection to {remote}"),
        }
    }

    /// Reuse the registered connection to `remote` or dial `address`.
    /// Concurrent callers for the same peer share one dial.
    pub async fn get_connection(
        &self,
        address: &str,
        remote: PublicKey,
    ) -> anyhow::Result<Arc<dyn Connection>> {
        if remote == self.local {
            anyhow::bail!("cannot open a connection to the local node");
        }
        if let Ok(conn) = self.try_existing(remote).await {
            return Ok(conn);
        }

        let dial_lock = {
            let mut dialing = self.dialing.lock().await;
            dialing
                .entry(remote)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _dialing = dial_lock.lock().await;

        // A concurrent dial may have finished while we waited for the lock.
        if let Ok(conn) = self.try_existing(remote).await {
            return Ok(conn);
        }
        if address.is_empty() {
            anyhow::bail!("no known address for {remote}");
        }

        let conn = self.net.dial(address, remote).await?;
        self.conns.lock().await.insert(remote, conn.clone());
        debug!(%remote, %address, "dialed new connection");
        Ok(conn)
    }
}

#[async_trait]
impl Dialer for ConnectionPool {
    async fn get_connection(
        &self,
        address: &str,
        remote: PublicKey,
    ) -> anyhow::Result<Arc<dyn Connection>> {
        ConnectionPool::get_connection(self, address, remote).await
    }
}
