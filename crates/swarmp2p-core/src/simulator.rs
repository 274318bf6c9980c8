// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory [`Service`] implementation: any number of simulated nodes
//! exchanging messages without sockets, for protocol-level tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::mpsc;

use crate::identity::LocalNode;
use crate::service::{Service, ServiceMessage, PROTOCOL_HANDLER_CAPACITY};

type HandlerKey = (String, String); // (node pubkey hex, protocol)

#[derive(Default)]
struct SimState {
    handlers: HashMap<HandlerKey, mpsc::Sender<ServiceMessage>>,
}

/// A virtual network of [`SimNode`]s sharing one handler table.
#[derive(Default)]
pub struct Simulator {
    state: Arc<StdMutex<SimState>>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_node(&self) -> Arc<SimNode> {
        let mut rng = OsRng;
        let local = Arc::new(LocalNode::new(SigningKey::generate(&mut rng), ""));
        Arc::new(SimNode {
            local,
            state: self.state.clone(),
        })
    }
}

/// One simulated node; implements the same [`Service`] surface the swarm
/// does, minus signing, encryption and transport.
pub struct SimNode {
    local: Arc<LocalNode>,
    state: Arc<StdMutex<SimState>>,
}

#[async_trait]
impl Service for SimNode {
    fn local_node(&self) -> Arc<LocalNode> {
        self.local.clone()
    }

    async fn register_protocol(&self, protocol: &str) -> mpsc::Receiver<ServiceMessage> {
        let (tx, rx) = mpsc::channel(PROTOCOL_HANDLER_CAPACITY);
        self.state
            .lock()
            .expect("sim state poisoned")
            .handlers
            .insert(
                (self.local.public_key().to_string(), protocol.to_string()),
                tx,
            );
        rx
    }

    async fn send_message(
        &self,
        peer_pubkey: &str,
        protocol: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        let handler = {
            let state = self.state.lock().expect("sim state poisoned");
            state
                .handlers
                .get(&(peer_pubkey.to_string(), protocol.to_string()))
                .cloned()
        };
        let Some(handler) = handler else {
            anyhow::bail!("no simulated handler for {protocol} at {peer_pubkey}");
        };
        handler
            .send(ServiceMessage::new(self.local.node().clone(), payload))
            .await
            .map_err(|_| anyhow::anyhow!("simulated peer dropped its handler"))
    }

    async fn broadcast(&self, protocol: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let own = self.local.public_key().to_string();
        let handlers: Vec<mpsc::Sender<ServiceMessage>> = {
            let state = self.state.lock().expect("sim state poisoned");
            state
                .handlers
                .iter()
                .filter(|((pubkey, proto), _)| proto == protocol && *pubkey != own)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for handler in handlers {
            let _ = handler
                .send(ServiceMessage::new(self.local.node().clone(), payload.clone()))
                .await;
        }
        Ok(())
    }
}
