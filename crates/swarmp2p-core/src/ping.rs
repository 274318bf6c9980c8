// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal request/response protocol on top of [`Service`], answering pings
//! from a canned response table. Doubles as the reference for building
//! application protocols over the swarm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::message;
use crate::service::{Service, ServiceMessage};

pub const PING_PROTOCOL: &str = "/ping/1.0/";

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum PingMessage {
    Request { req_id: u64, text: String },
    Response { req_id: u64, text: String },
}

pub struct Ping {
    service: Arc<dyn Service>,
    responses: StdMutex<HashMap<String, String>>,
    pending: StdMutex<HashMap<u64, oneshot::Sender<String>>>,
    req_seq: AtomicU64,
}

impl Ping {
    /// Register the ping protocol on `service` and start answering requests.
    pub async fn new(service: Arc<dyn Service>) -> Arc<Self> {
        let incoming = service.register_protocol(PING_PROTOCOL).await;
        let mut responses = HashMap::new();
        responses.insert("hello".to_string(), "hello to you too".to_string());
        let ping = Arc::new(Self {
            service,
            responses: StdMutex::new(responses),
            pending: StdMutex::new(HashMap::new()),
            req_seq: AtomicU64::new(0),
        });
        let handler = ping.clone();
        tokio::spawn(async move {
            handler.handle_incoming(incoming).await;
        });
        ping
    }

    /// Install the answer returned for pings carrying `text`.
    pub fn add_response(&self, text: &str, response: &str) {
        self.responses
            .lock()
            .expect("responses poisoned")
            .insert(text.to_string(), response.to_string());
    }

    /// Send `text` to `peer_pubkey` and wait for its canned answer.
    pub async fn ping(&self, peer_pubkey: &str, text: &str) -> anyhow::Result<String> {
        let req_id = self.req_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending poisoned")
            .insert(req_id, tx);

        let request = message::encode(&PingMessage::Request {
            req_id,
            text: text.to_string(),
        })?;
        if let Err(err) = self
            .service
            .send_message(peer_pubkey, PING_PROTOCOL, request)
            .await
        {
            self.pending.lock().expect("pending poisoned").remove(&req_id);
            return Err(err);
        }

        match tokio::time::timeout(PING_TIMEOUT, rx).await {
            Ok(Ok(text)) => Ok(text),
            _ => {
                self.pending.lock().expect("pending poisoned").remove(&req_id);
                anyhow::bail!("ping to {peer_pubkey} timed out")
            }
        }
    }

    async fn handle_incoming(self: Arc<Self>, mut incoming: mpsc::Receiver<ServiceMessage>) {
        while let Some(msg) = incoming.recv().await {
            let decoded: PingMessage = match message::decode(msg.data()) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(sender = %msg.sender(), %err, "undecodable ping message");
                    continue;
                }
            };
            match decoded {
                PingMessage::Request { req_id, text } => {
                    debug!(sender = %msg.sender(), %text, "answering ping");
                    let answer = self
                        .responses
                        .lock()
                        .expect("responses poisoned")
                        .get(&text)
                        .cloned()
                        .unwrap_or_default();
                    let response = match message::encode(&PingMessage::Response {
                        req_id,
                        text: answer,
                    }) {
                        Ok(response) => response,
                        Err(err) => {
                            warn!(%err, "failed to encode ping response");
                            continue;
                        }
                    };
                    let target = msg.sender().public_key().to_string();
                    if let Err(err) = self
                        .service
                        .send_message(&target, PING_PROTOCOL, response)
                        .await
                    {
                        warn!(peer = %target, %err, "failed to answer ping");
                    }
                }
                PingMessage::Response { req_id, text } => {
                    let waiter = self
                        .pending
                        .lock()
                        .expect("pending poisoned")
                        .remove(&req_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(text);
                        }
                        None => debug!(req_id, "ping response without a pending request"),
                    }
                }
            }
        }
    }
}
