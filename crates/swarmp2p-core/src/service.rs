// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::LocalNode;
use crate::node::Node;

/// Bound of every protocol handler channel; a full channel stalls the
/// connection's receive worker, which is the intended backpressure point.
pub const PROTOCOL_HANDLER_CAPACITY: usize = 100;

/// An authenticated message delivered to a protocol handler.
#[derive(Debug, Clone)]
pub struct ServiceMessage {
    sender: Node,
    data: Vec<u8>,
}

impl ServiceMessage {
    pub fn new(sender: Node, data: Vec<u8>) -> Self {
        Self { sender, data }
    }

    pub fn sender(&self) -> &Node {
        &self.sender
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// The message-oriented surface higher-level protocols are written against.
/// The swarm is the production implementation; the in-memory
/// [`crate::simulator`] provides the same surface without sockets.
#[async_trait]
pub trait Service: Send + Sync {
    fn local_node(&self) -> Arc<LocalNode>;

    /// Install a handler channel for `protocol` and return its receive end.
    /// Re-registering a name replaces the previous channel.
    async fn register_protocol(&self, protocol: &str) -> mpsc::Receiver<ServiceMessage>;

    /// Best-effort authenticated send of `payload` to the peer addressed by
    /// the hex `peer_pubkey`.
    async fn send_message(
        &self,
        peer_pubkey: &str,
        protocol: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()>;

    /// Sign `payload` and flood it through the gossip neighborhood.
    async fn broadcast(&self, protocol: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}
