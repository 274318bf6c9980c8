// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use swarmp2p_core::{Config, Ping, Swarm};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarmp2p")]
#[command(about = "swarmp2p reference CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an identity keypair and print it.
    GenIdentity,
    /// Run a node until interrupted.
    Start {
        #[arg(long, default_value_t = 7513)]
        tcp_port: u16,
        #[arg(long, default_value = ".swarmp2p")]
        data_dir: PathBuf,
        /// Seed nodes in <hex pubkey>@<host:port> form.
        #[arg(long = "bootstrap-node", value_name = "PUBKEY@HOST:PORT", num_args = 0..)]
        bootstrap_nodes: Vec<String>,
        /// Join the gossip neighborhood after bootstrap.
        #[arg(long, default_value_t = false)]
        gossip: bool,
        #[arg(long, default_value_t = 8)]
        random_connections: usize,
        /// Generate a fresh identity instead of loading the persisted one.
        #[arg(long, default_value_t = false)]
        new_identity: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::GenIdentity => {
            let mut rng = OsRng;
            let key = SigningKey::generate(&mut rng);
            println!("private_key: {}", hex::encode(key.to_bytes()));
            println!(
                "public_key: {}",
                hex::encode(key.verifying_key().to_bytes())
            );
        }
        Command::Start {
            tcp_port,
            data_dir,
            bootstrap_nodes,
            gossip,
            random_connections,
            new_identity,
        } => {
            let mut config = Config {
                tcp_port,
                data_dir,
                ..Config::default()
            };
            config.swarm.bootstrap = !bootstrap_nodes.is_empty();
            config.swarm.bootstrap_nodes = bootstrap_nodes;
            config.swarm.gossip = gossip;
            config.swarm.random_connections = random_connections;

            let swarm = Swarm::new(config, new_identity, true).await?;
            swarm.start()?;
            let _ping = Ping::new(swarm.clone()).await;

            let local = swarm.local_node();
            info!(
                node = %local.node().to_connect_string(),
                "node started, press ctrl-c to stop"
            );

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            swarm.shutdown().await;
        }
    }
    Ok(())
}
