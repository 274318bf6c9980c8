// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use ed25519_dalek::{Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::identity::LocalNode;
use crate::node::PublicKey;
use crate::session::Session;
use crate::timesync;

/// Outer envelope as it travels on the wire. `payload` is the encrypted
/// inner [`ProtocolMessage`]; `timestamp` is the sender's wall clock in
/// seconds and is checked against the receiver's drift window before any
/// decryption happens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommonMessageData {
    #[serde(with = "serde_bytes")]
    pub session_id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolMessageMetadata {
    #[serde(with = "serde_bytes")]
    pub auth_pubkey: Vec<u8>,
    pub protocol: String,
    pub timestamp: i64,
    pub client_version: String,
    pub gossip: bool,
    /// Hex-encoded detached signature over the message with this field empty.
    pub auth_sign: String,
}

/// Inner message, only visible after session decryption. `metadata` is
/// optional at the codec level so a defective message surfaces as a decode
/// problem instead of a panic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolMessage {
    #[serde(default)]
    pub metadata: Option<ProtocolMessageMetadata>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

pub fn new_metadata(
    author: PublicKey,
    protocol: &str,
    gossip: bool,
    client_version: &str,
) -> ProtocolMessageMetadata {
    ProtocolMessageMetadata {
        auth_pubkey: author.as_bytes().to_vec(),
        protocol: protocol.to_string(),
        timestamp: timesync::now_unix(),
        client_version: client_version.to_string(),
        gossip,
        auth_sign: String::new(),
    }
}

pub fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_cbor::to_vec(value)?)
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> anyhow::Result<T> {
    Ok(serde_cbor::from_slice(bytes)?)
}

/// Sign `msg` with the author's key, storing the hex signature in
/// `metadata.auth_sign`. The signature covers the canonical encoding of the
/// message with `auth_sign` cleared.
pub fn sign_message(local: &LocalNode, msg: &mut ProtocolMessage) -> anyhow::Result<()> {
    let metadata = msg
        .metadata
        .as_mut()
        .ok_or_else(|| anyhow::anyhow!("cannot sign a message without metadata"))?;
    metadata.auth_sign = String::new();
    let signable = encode(msg)?;
    let signature = local.signing_key().sign(&signable);
    let metadata = msg.metadata.as_mut().expect("metadata checked above");
    metadata.auth_sign = hex::encode(signature.to_bytes());
    Ok(())
}

/// Verify the author signature of `msg` against `metadata.auth_pubkey`.
pub fn auth_author(msg: &ProtocolMessage) -> anyhow::Result<()> {
    let metadata = msg
        .metadata
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("message has no metadata"))?;
    let sig_bytes = hex::decode(&metadata.auth_sign)?;
    let sig_arr: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("author signature must be 64 bytes"))?;
    let author = PublicKey::from_bytes(&metadata.auth_pubkey)?;

    let mut unsigned = msg.clone();
    unsigned
        .metadata
        .as_mut()
        .expect("metadata checked above")
        .auth_sign = String::new();
    let signable = encode(&unsigned)?;

    author
        .verifying_key()?
        .verify(&signable, &Signature::from_bytes(&sig_arr))
        .map_err(|_| anyhow::anyhow!("author signature does not verify"))?;
    Ok(())
}

/// Session-encrypt an already-signed inner message and wrap it in the outer
/// envelope. The caller must hold the session's encrypt guard across this
/// call and the subsequent transport send; see [`Session`].
pub fn prepare_message(session: &dyn Session, data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let encrypted = session.encrypt(data)?;
    let envelope = CommonMessageData {
        session_id: session.id(),
        payload: encrypted,
        timestamp: timesync::now_unix(),
    };
    encode(&envelope)
}
