// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;
use std::hash::{Hash, Hasher};

use ed25519_dalek::VerifyingKey;

/// A node's long-lived Ed25519 identity. The hex encoding of the raw key
/// bytes is the canonical string form used everywhere a peer is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
        // Reject byte strings that are not valid Ed25519 points.
        VerifyingKey::from_bytes(&arr)?;
        Ok(Self(arr))
    }

    pub fn from_hex(input: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(input)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn verifying_key(&self) -> anyhow::Result<VerifyingKey> {
        Ok(VerifyingKey::from_bytes(&self.0)?)
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// An identity plus an optional transport endpoint.
///
/// The address is empty when the node was learned from authenticated inbound
/// traffic and a live connection already exists, so it never needs dialing.
/// Two nodes are equal when their public keys are equal; the address does not
/// participate in identity.
#[derive(Debug, Clone)]
pub struct Node {
    public_key: PublicKey,
    address: String,
}

impl Node {
    pub fn new(public_key: PublicKey, address: impl Into<String>) -> Self {
        Self {
            public_key,
            address: address.into(),
        }
    }

    /// Parse the `<hex pubkey>@<host:port>` form used in bootstrap lists.
    pub fn from_string(input: &str) -> anyhow::Result<Self> {
        let (key_part, addr_part) = input
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("node string must be <pubkey>@<host:port>"))?;
        if addr_part.is_empty() {
            anyhow::bail!("node string is missing an address");
        }
        Ok(Self::new(PublicKey::from_hex(key_part)?, addr_part))
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The `<hex pubkey>@<host:port>` form, the inverse of [`Node::from_string`].
    pub fn to_connect_string(&self) -> String {
        format!("{}@{}", self.public_key, self.address)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public_key.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.public_key)
    }
}
