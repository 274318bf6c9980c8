// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::Arc;

use anyhow::Context;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::identity::LocalNode;
use crate::node::{Node, PublicKey};
use crate::session::NetworkSession;
use crate::timesync;

pub const HANDSHAKE_MAX_BYTES: usize = 16 * 1024;
pub const HANDSHAKE_MAX_CLOCK_SKEW_SECS: u64 = 5 * 60;

/// Largest framed message accepted after the handshake.
pub const MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;

const SECRET_CONTEXT: &str = "swarmp2p-handshake-secret-v1";

/// What a completed handshake yields: the authenticated remote node (with
/// the listen address it advertised) and the shared session.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub remote: Node,
    pub session: Arc<NetworkSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandshakeHello {
    node_pubkey: [u8; 32],
    /// Address the sender accepts dials on, so the accepting side can store
    /// a dialable endpoint for this identity.
    listen_addr: String,
    nonce: [u8; 32],
    echoed_nonce: Option<[u8; 32]>,
    timestamp_unix_secs: u64,
    /// Ephemeral X25519 public key; the session secret comes from DH over
    /// these, so long-term key compromise does not expose past sessions.
    ephemeral_pubkey: [u8; 32],
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

/// Fields covered by the hello signature, in wire order.
#[derive(Serialize)]
struct HelloSigningTuple<'a>(
    [u8; 32],         // node_pubkey
    &'a str,          // listen_addr
    [u8; 32],         // nonce
    Option<[u8; 32]>, // echoed_nonce
    u64,              // timestamp_unix_secs
    [u8; 32],         // ephemeral_pubkey
);

pub fn generate_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Initiator side of the 3-message handshake:
///
/// 1. hello → our identity, nonce and ephemeral key.
/// 2. hello ← remote identity; must echo our nonce.
/// 3. ack   → echoes the remote nonce, proving we observed message 2.
pub async fn handshake_initiator<S>(
    io: &mut S,
    local: &LocalNode,
    expected_remote: Option<PublicKey>,
) -> anyhow::Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let eph_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let eph_pubkey = X25519PublicKey::from(&eph_secret).to_bytes();
    let local_nonce = generate_nonce();

    let hello = signed_hello(local, local_nonce, None, eph_pubkey)?;
    write_hello(io, &hello).await?;

    let remote_hello = read_hello(io).await?;
    verify_hello(&remote_hello)?;
    if remote_hello.echoed_nonce != Some(local_nonce) {
        anyhow::bail!("remote hello does not bind initiator nonce");
    }
    if let Some(expected) = expected_remote {
        if remote_hello.node_pubkey != *expected.as_bytes() {
            anyhow::bail!("remote pubkey mismatch");
        }
    }

    let ack = signed_hello(local, local_nonce, Some(remote_hello.nonce), eph_pubkey)?;
    write_hello(io, &ack).await?;

    let shared = eph_secret.diffie_hellman(&X25519PublicKey::from(remote_hello.ephemeral_pubkey));
    let secret = derive_secret(shared.as_bytes(), &local_nonce, &remote_hello.nonce);
    Ok(HandshakeOutcome {
        remote: Node::new(
            PublicKey::from_bytes(&remote_hello.node_pubkey)?,
            remote_hello.listen_addr,
        ),
        session: Arc::new(NetworkSession::from_secret(&secret, true)),
    })
}

/// Responder side: read the initiator hello, answer with ours echoing its
/// nonce, then require an ack that binds our nonce to the same identity.
pub async fn handshake_responder<S>(io: &mut S, local: &LocalNode) -> anyhow::Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let eph_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let eph_pubkey = X25519PublicKey::from(&eph_secret).to_bytes();
    let local_nonce = generate_nonce();

    let remote_hello = read_hello(io).await?;
    verify_hello(&remote_hello)?;

    let hello = signed_hello(local, local_nonce, Some(remote_hello.nonce), eph_pubkey)?;
    write_hello(io, &hello).await?;

    let ack = read_hello(io).await?;
    verify_hello(&ack)?;
    if ack.node_pubkey != remote_hello.node_pubkey {
        anyhow::bail!("handshake ack pubkey does not match the initial hello");
    }
    if ack.echoed_nonce != Some(local_nonce) {
        anyhow::bail!("handshake ack does not bind responder nonce");
    }

    let shared = eph_secret.diffie_hellman(&X25519PublicKey::from(remote_hello.ephemeral_pubkey));
    let secret = derive_secret(shared.as_bytes(), &remote_hello.nonce, &local_nonce);
    Ok(HandshakeOutcome {
        remote: Node::new(
            PublicKey::from_bytes(&remote_hello.node_pubkey)?,
            remote_hello.listen_addr,
        ),
        session: Arc::new(NetworkSession::from_secret(&secret, false)),
    })
}

/// Session secret from the raw DH output, bound to both nonces so every
/// handshake yields a unique key.
fn derive_secret(
    dh_shared: &[u8; 32],
    initiator_nonce: &[u8; 32],
    responder_nonce: &[u8; 32],
) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(dh_shared);
    ikm.extend_from_slice(initiator_nonce);
    ikm.extend_from_slice(responder_nonce);
    blake3::derive_key(SECRET_CONTEXT, &ikm)
}

fn signed_hello(
    local: &LocalNode,
    nonce: [u8; 32],
    echoed_nonce: Option<[u8; 32]>,
    ephemeral_pubkey: [u8; 32],
) -> anyhow::Result<HandshakeHello> {
    signed_hello_at(
        local,
        nonce,
        echoed_nonce,
        timesync::now_unix() as u64,
        ephemeral_pubkey,
    )
}

fn signed_hello_at(
    local: &LocalNode,
    nonce: [u8; 32],
    echoed_nonce: Option<[u8; 32]>,
    timestamp_unix_secs: u64,
    ephemeral_pubkey: [u8; 32],
) -> anyhow::Result<HandshakeHello> {
    let node_pubkey = *local.public_key().as_bytes();
    let listen_addr = local.node().address().to_string();
    let signable = serde_cbor::to_vec(&HelloSigningTuple(
        node_pubkey,
        &listen_addr,
        nonce,
        echoed_nonce,
        timestamp_unix_secs,
        ephemeral_pubkey,
    ))?;
    let signature = local.signing_key().sign(&signable);
    Ok(HandshakeHello {
        node_pubkey,
        listen_addr,
        nonce,
        echoed_nonce,
        timestamp_unix_secs,
        ephemeral_pubkey,
        signature: signature.to_bytes().to_vec(),
    })
}

fn verify_hello(hello: &HandshakeHello) -> anyhow::Result<()> {
    let sig_arr: [u8; 64] = hello
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("handshake signature must be 64 bytes"))?;
    let skew = (timesync::now_unix() as u64).abs_diff(hello.timestamp_unix_secs);
    if skew > HANDSHAKE_MAX_CLOCK_SKEW_SECS {
        anyhow::bail!("handshake timestamp outside allowed clock skew");
    }
    let signable = serde_cbor::to_vec(&HelloSigningTuple(
        hello.node_pubkey,
        &hello.listen_addr,
        hello.nonce,
        hello.echoed_nonce,
        hello.timestamp_unix_secs,
        hello.ephemeral_pubkey,
    ))?;
    VerifyingKey::from_bytes(&hello.node_pubkey)?
        .verify(&signable, &Signature::from_bytes(&sig_arr))
        .map_err(|_| anyhow::anyhow!("handshake signature does not verify"))?;
    Ok(())
}

async fn write_hello<S>(io: &mut S, hello: &HandshakeHello) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = serde_cbor::to_vec(hello)?;
    if bytes.len() > HANDSHAKE_MAX_BYTES {
        anyhow::bail!("handshake exceeds max size");
    }
    write_frame(io, &bytes).await
}

async fn read_hello<S>(io: &mut S) -> anyhow::Result<HandshakeHello>
where
    S: AsyncRead + Unpin,
{
    let bytes = read_frame(io, HANDSHAKE_MAX_BYTES).await?;
    Ok(serde_cbor::from_slice(&bytes)?)
}

/// Write a length-prefixed frame: 4-byte big-endian length, then the bytes.
pub async fn write_frame<S>(io: &mut S, data: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).context("frame too large for u32 length prefix")?;
    io.write_u32(len).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame, rejecting anything over `max_len`.
pub async fn read_frame<S>(io: &mut S, max_len: usize) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = io.read_u32().await? as usize;
    if len > max_len {
        anyhow::bail!("frame exceeds max size");
    }
    let mut data = vec![0u8; len];
    io.read_exact(&mut data).await?;
    Ok(data)
}
