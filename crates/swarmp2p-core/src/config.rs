// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;
use std::time::Duration;

/// Version string advertised in every signed protocol message.
pub const CLIENT_VERSION: &str = concat!("swarmp2p/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on. `0` picks an ephemeral port.
    pub tcp_port: u16,
    /// Directory holding the persisted node identity.
    pub data_dir: PathBuf,
    pub client_version: String,
    pub swarm: SwarmConfig,
    pub time: TimeConfig,
}

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Populate the routing table from `bootstrap_nodes` on start.
    pub bootstrap: bool,
    /// Join the gossip neighborhood once bootstrap (if enabled) completes.
    pub gossip: bool,
    /// Seed nodes in `<hex pubkey>@<host:port>` form.
    pub bootstrap_nodes: Vec<String>,
    /// Target number of gossip neighbors.
    pub random_connections: usize,
}

#[derive(Debug, Clone)]
pub struct TimeConfig {
    /// Envelopes timestamped outside `[now - drift, now + drift]` are rejected.
    pub max_allowed_message_drift: Duration,
    /// How often the local clock is checked against NTP.
    pub ntp_refresh_interval: Duration,
    /// Largest tolerated offset between the local clock and NTP time.
    pub max_clock_drift: Duration,
    pub ntp_servers: Vec<String>,
    pub ntp_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: 7513,
            data_dir: PathBuf::from(".swarmp2p"),
            client_version: CLIENT_VERSION.to_string(),
            swarm: SwarmConfig::default(),
            time: TimeConfig::default(),
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            gossip: false,
            bootstrap_nodes: vec![],
            random_connections: 8,
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            max_allowed_message_drift: Duration::from_secs(10 * 60),
            ntp_refresh_interval: Duration::from_secs(30 * 60),
            max_clock_drift: Duration::from_secs(10),
            ntp_servers: vec![
                "0.pool.ntp.org:123".to_string(),
                "1.pool.ntp.org:123".to_string(),
                "time.google.com:123".to_string(),
            ],
            ntp_timeout: Duration::from_secs(5),
        }
    }
}
