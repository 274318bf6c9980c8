// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fs;
use std::path::Path;

use anyhow::Context;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::node::{Node, PublicKey};

const NODE_KEY_FILE: &str = "node_key";

/// This process's identity: its [`Node`] plus the Ed25519 signing key.
/// Constructed once per swarm and never transmitted.
pub struct LocalNode {
    node: Node,
    signing_key: SigningKey,
}

impl LocalNode {
    pub fn new(signing_key: SigningKey, address: impl Into<String>) -> Self {
        let public_key: PublicKey = signing_key.verifying_key().into();
        Self {
            node: Node::new(public_key, address),
            signing_key,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn public_key(&self) -> PublicKey {
        self.node.public_key()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

/// Load the node key from `<data_dir>/node_key`, or generate one.
///
/// With `new_identity` a fresh key is generated even when one exists on disk.
/// With `persist` the key in use is written back (hex) so the identity
/// survives restarts.
pub fn load_or_create_key(
    data_dir: &Path,
    new_identity: bool,
    persist: bool,
) -> anyhow::Result<SigningKey> {
    let key_path = data_dir.join(NODE_KEY_FILE);

    if !new_identity && key_path.exists() {
        let encoded = fs::read_to_string(&key_path)
            .with_context(|| format!("failed to read {}", key_path.display()))?;
        let bytes = hex::decode(encoded.trim()).context("node key file is not valid hex")?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("node key must be 32 bytes"))?;
        return Ok(SigningKey::from_bytes(&arr));
    }

    let mut rng = OsRng;
    let key = SigningKey::generate(&mut rng);
    if persist {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        fs::write(&key_path, hex::encode(key.to_bytes()))
            .with_context(|| format!("failed to write {}", key_path.display()))?;
    }
    Ok(key)
}
