// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tracing::warn;

use crate::config::TimeConfig;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Whether `timestamp` (sender wall clock, seconds) falls within the allowed
/// drift window around the local clock.
pub fn check_message_drift(timestamp: i64, max_drift: Duration) -> bool {
    let now = now_unix();
    now.abs_diff(timestamp) <= max_drift.as_secs()
}

/// Compare the local clock against the configured NTP servers.
///
/// Servers are tried in order and the first response wins. Returns the
/// measured offset, or an error when the offset exceeds
/// `config.max_clock_drift` or no server answered. A node whose clock has
/// drifted cannot validate message timestamps and must shut down.
pub async fn check_system_clock_drift(config: &TimeConfig) -> anyhow::Result<Duration> {
    for server in &config.ntp_servers {
        match query_ntp_offset(server, config.ntp_timeout).await {
            Ok(offset) => {
                if offset > config.max_clock_drift {
                    anyhow::bail!(
                        "system clock drifts {:?} from ntp time reported by {server}",
                        offset
                    );
                }
                return Ok(offset);
            }
            Err(err) => {
                warn!(%server, %err, "ntp query failed, trying next server");
            }
        }
    }
    anyhow::bail!("no ntp server responded")
}

/// Single SNTP v4 exchange returning the absolute offset between the local
/// clock and the server's transmit timestamp.
async fn query_ntp_offset(server: &str, timeout: Duration) -> anyhow::Result<Duration> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;

    // LI=0, VN=4, Mode=3 (client); the rest of the request is zero.
    let mut packet = [0u8; 48];
    packet[0] = 0x23;
    socket.send(&packet).await?;

    let mut response = [0u8; 48];
    let len = tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| anyhow::anyhow!("ntp response timed out"))??;
    if len < 48 {
        anyhow::bail!("short ntp response ({len} bytes)");
    }

    // Transmit timestamp: seconds since 1900 plus a 32-bit fraction.
    let secs = u32::from_be_bytes(response[40..44].try_into().expect("4 bytes")) as u64;
    let frac = u32::from_be_bytes(response[44..48].try_into().expect("4 bytes")) as u64;
    if secs < NTP_UNIX_OFFSET {
        anyhow::bail!("ntp response predates the unix epoch");
    }
    let remote_nanos =
        (secs - NTP_UNIX_OFFSET) as u128 * 1_000_000_000 + (frac * 1_000_000_000 >> 32) as u128;
    let local_nanos = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();

    let diff = remote_nanos.abs_diff(local_nanos);
    Ok(Duration::from_nanos(diff.min(u64::MAX as u128) as u64))
}
