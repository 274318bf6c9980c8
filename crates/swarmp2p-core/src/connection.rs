// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::debug;

use crate::node::{Node, PublicKey};
use crate::session::Session;
use crate::transport;

/// A live, authenticated link to a remote peer, owned by the connection
/// pool. Everything the swarm needs from a connection; production is
/// [`NetConnection`], tests substitute their own.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;

    fn remote_public_key(&self) -> PublicKey;

    fn session(&self) -> Option<Arc<dyn Session>>;

    fn is_closed(&self) -> bool;

    /// Frame and transmit `data`. Fails once the connection is closed.
    async fn send(&self, data: &[u8]) -> anyhow::Result<()>;

    /// Close the connection. Idempotent; the read loop observes the close
    /// and emits the closing event.
    async fn close(&self);
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("is_closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Production connection over an owned TCP write half. The read half lives
/// in the per-connection read loop inside [`crate::net::Net`].
pub struct NetConnection {
    id: u64,
    remote: Node,
    session: Arc<dyn Session>,
    writer: AsyncMutex<OwnedWriteHalf>,
    closed: AtomicBool,
    close_notify: Arc<Notify>,
}

impl NetConnection {
    pub(crate) fn new(
        id: u64,
        remote: Node,
        session: Arc<dyn Session>,
        writer: OwnedWriteHalf,
    ) -> Self {
        Self {
            id,
            remote,
            session,
            writer: AsyncMutex::new(writer),
            closed: AtomicBool::new(false),
            close_notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn remote_node(&self) -> &Node {
        &self.remote
    }

    /// Notified once when the connection transitions to closed; used by the
    /// read loop to stop waiting on the socket.
    pub(crate) fn close_notified(&self) -> Arc<Notify> {
        self.close_notify.clone()
    }
}

#[async_trait]
impl Connection for NetConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_public_key(&self) -> PublicKey {
        self.remote.public_key()
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        Some(self.session.clone())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("connection is closed");
        }
        let mut writer = self.writer.lock().await;
        transport::write_frame(&mut *writer, data).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(conn = self.id, remote = %self.remote, "closing connection");
        // notify_one stores a permit, so the read loop observes the close
        // even if it is not parked on the notify yet.
        self.close_notify.notify_one();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
