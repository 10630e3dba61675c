/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

mod clock;
mod config;
mod dispatcher;
mod error;
mod fanout;
mod forwarding;
mod heartbeat;
mod heartbeat_loop;
mod local_site;
mod metrics;
mod node_watcher;
mod peer;
mod periodic;
mod registry;
mod remote_conn;
mod signer;
mod transport;
mod types;

use std::env;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::config::{load_yaml, Settings};
use crate::local_site::LocalSite;
use crate::node_watcher::StaticNodeWatcher;

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(level.to_string()))
        .init();
}

#[tokio::main]
async fn main() {
    let config_path = env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let settings: Settings = load_yaml(&config_path).unwrap_or_else(|err| {
        eprintln!("unable to load {config_path}: {err}");
        std::process::exit(1);
    });

    init_logging(&settings.log_level);
    tracing::info!(domain = %settings.domain_name, listen = %settings.listen_addr, "starting reverse tunnel registry");

    // The node watcher, peer dialer, proxy signer and the SSH listener
    // itself are external collaborators per this crate's scope (auth,
    // discovery storage, TLS/mTLS handshake) - wired here with a minimal
    // in-memory watcher so the core runs standalone; a full deployment
    // supplies real implementations of the same traits.
    let node_watcher = Arc::new(StaticNodeWatcher::default());
    let clock = Arc::new(SystemClock);

    let site = LocalSite::new(settings, node_watcher, None, None, clock);
    site.spawn_periodic_tasks("this-proxy");

    tracing::info!("local site ready; awaiting agent control connections");
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    site.shutdown();
}
