// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-connection symmetric cryptographic state.
///
/// The cipher is strictly sequential in each direction: every `encrypt`
/// advances the sender counter and every successful `decrypt` advances the
/// receiver counter, so ciphertexts must hit the wire in exactly the order
/// they were produced. Callers must hold the guard returned by
/// [`Session::encrypt_guard`] across both the encryption and the transport
/// send; a ciphertext that was produced but never transmitted leaves the
/// remote counter behind forever, and the only safe recovery is closing the
/// connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Opaque session identifier carried in outer envelopes for diagnostics.
    fn id(&self) -> Vec<u8>;

    /// Acquire the mutual-exclusion guard serializing encrypt+send pairs.
    async fn encrypt_guard(&self) -> OwnedMutexGuard<()>;

    fn encrypt(&self, plain: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn decrypt(&self, cipher: &[u8]) -> anyhow::Result<Vec<u8>>;
}

// Nonce domain separation between the two directions of a connection.
const INITIATOR_PREFIX: u8 = 0x01;
const RESPONDER_PREFIX: u8 = 0x02;

const KEY_CONTEXT: &str = "swarmp2p-session-key-v1";
const ID_CONTEXT: &str = "swarmp2p-session-id-v1";

/// Production [`Session`] over ChaCha20-Poly1305 with counter nonces.
pub struct NetworkSession {
    id: Vec<u8>,
    cipher: ChaCha20Poly1305,
    tx_prefix: u8,
    rx_prefix: u8,
    tx_counter: StdMutex<u64>,
    rx_counter: StdMutex<u64>,
    guard: Arc<AsyncMutex<()>>,
}

impl std::fmt::Debug for NetworkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSession")
            .field("id", &self.id)
            .field("tx_prefix", &self.tx_prefix)
            .field("rx_prefix", &self.rx_prefix)
            .finish_non_exhaustive()
    }
}

impl NetworkSession {
    /// Build both directions of a session from the handshake secret.
    /// The initiator and the responder derive identical keys but opposite
    /// nonce prefixes.
    pub fn from_secret(secret: &[u8; 32], initiator: bool) -> Self {
        let key_bytes = blake3::derive_key(KEY_CONTEXT, secret);
        let id = blake3::derive_key(ID_CONTEXT, secret)[..16].to_vec();
        let (tx_prefix, rx_prefix) = if initiator {
            (INITIATOR_PREFIX, RESPONDER_PREFIX)
        } else {
            (RESPONDER_PREFIX, INITIATOR_PREFIX)
        };
        Self {
            id,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key_bytes)),
            tx_prefix,
            rx_prefix,
            tx_counter: StdMutex::new(0),
            rx_counter: StdMutex::new(0),
            guard: Arc::new(AsyncMutex::new(())),
        }
    }

    fn nonce(prefix: u8, counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = prefix;
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        nonce
    }
}

#[async_trait]
impl Session for NetworkSession {
    fn id(&self) -> Vec<u8> {
        self.id.clone()
    }

    async fn encrypt_guard(&self) -> OwnedMutexGuard<()> {
        self.guard.clone().lock_owned().await
    }

    fn encrypt(&self, plain: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut counter = self.tx_counter.lock().expect("tx counter poisoned");
        let nonce = Self::nonce(self.tx_prefix, *counter);
        let out = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| anyhow::anyhow!("session encrypt failed"))?;
        // The counter advances even if the caller never transmits the
        // ciphertext; that caller must then close the connection.
        *counter = counter.wrapping_add(1);
        Ok(out)
    }

    fn decrypt(&self, cipher: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut counter = self.rx_counter.lock().expect("rx counter poisoned");
        let nonce = Self::nonce(self.rx_prefix, *counter);
        let out = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), cipher)
            .map_err(|_| anyhow::anyhow!("session decrypt failed"))?;
        *counter = counter.wrapping_add(1);
        Ok(out)
    }
}
