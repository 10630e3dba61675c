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

//! `LocalSite` ties the registry, dispatcher and periodic tasks together
//! into the single entity a reverse-tunnel registry needs. Grounded in
//! `newLocalSite`/`localSite` in original_source, minus everything that
//! struct does for remote-site routing (out of scope per §1).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::Settings;
use crate::dispatcher::{Dialed, Dispatcher};
use crate::error::Result;
use crate::fanout;
use crate::heartbeat_loop::{self, HeartbeatLoopConfig, Ping};
use crate::metrics::Metrics;
use crate::node_watcher::NodeWatcher;
use crate::peer::PeerDialer;
use crate::periodic::{self, PeriodicConfig};
use crate::registry::Registry;
use crate::remote_conn::RemoteConn;
use crate::signer::ProxySigner;
use crate::transport::ControlTransport;
use crate::types::{DialParams, Proxy, TunnelType};

pub struct LocalSite {
    pub domain_name: String,
    pub auth_servers: Vec<String>,
    pub settings: Settings,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    node_watcher: Arc<dyn NodeWatcher>,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalSite {
    pub fn new(
        settings: Settings,
        node_watcher: Arc<dyn NodeWatcher>,
        peer_dialer: Option<Arc<dyn PeerDialer>>,
        proxy_signer: Option<Arc<dyn ProxySigner>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), peer_dialer, proxy_signer));
        let (shutdown_tx, _rx) = watch::channel(false);

        Arc::new(LocalSite {
            domain_name: settings.domain_name.clone(),
            auth_servers: settings.auth_servers.clone(),
            settings,
            registry,
            dispatcher,
            metrics,
            clock,
            node_watcher,
            shutdown_tx,
        })
    }

    /// Registers a newly connected agent and spawns its heartbeat loop.
    /// Returns the record so the caller (the SSH listener) can associate it
    /// with the accepted connection.
    pub fn accept_agent(
        self: &Arc<Self>,
        node_id: impl Into<String>,
        tunnel_type: TunnelType,
        proxy_name: impl Into<String>,
        transport: Arc<dyn ControlTransport>,
        pings: mpsc::Receiver<Ping>,
    ) -> Arc<RemoteConn> {
        let (conn, new_proxies_rx) = self.registry.register(
            node_id,
            tunnel_type,
            proxy_name,
            self.domain_name.clone(),
            self.settings.offline_threshold(),
            transport,
        );

        let cfg = HeartbeatLoopConfig {
            conn: conn.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            proxy_sync_interval: self.settings.proxy_sync_interval(),
            silence_check_interval: silence_check_interval(self.settings.offline_threshold()),
            missed_heartbeat_threshold: self.settings.missed_heartbeat_threshold,
            pings,
            new_proxies: new_proxies_rx,
            shutdown: self.shutdown_tx.subscribe(),
            initial_proxies: Arc::new(Vec::new()),
        };
        tokio::spawn(heartbeat_loop::run(cfg));
        conn
    }

    pub async fn dial(&self, params: DialParams) -> Result<Dialed> {
        self.dispatcher.dial(params).await
    }

    pub fn fan_out_proxies(&self, proxies: Vec<Proxy>) {
        fanout::fan_out_proxies(&self.registry, proxies)
    }

    pub async fn advise_reconnect(&self, cancel: CancellationToken) {
        fanout::advise_reconnect(&self.registry, cancel).await
    }

    /// Spawns the node-watcher-relative missing-tunnel-stats task (§4.6).
    pub fn spawn_periodic_tasks(self: &Arc<Self>, this_proxy_id: impl Into<String>) {
        let cfg = PeriodicConfig {
            registry: self.registry.clone(),
            node_watcher: self.node_watcher.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            this_proxy_id: this_proxy_id.into(),
            announce_ttl: self.settings.announce_ttl(),
            interval: self.settings.periodic_function_interval(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        tokio::spawn(periodic::run(cfg));
    }

    /// Signals every heartbeat loop and the periodic task to stop. Does not
    /// wait for them to finish; callers that need that should await the
    /// `JoinHandle`s returned from spawning.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The silence-detection tick should be frequent enough that the observed
/// offline duration doesn't overshoot the threshold by more than a small
/// margin, without spinning on every connection; a quarter of the offline
/// threshold, floored at 100ms, matches the granularity the re-armable
/// timer design note asks for.
fn silence_check_interval(offline_threshold: Duration) -> Duration {
    (offline_threshold / 4).max(Duration::from_millis(100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::node_watcher::StaticNodeWatcher;
    use crate::registry::tests::NullTransport;

    fn test_settings() -> Settings {
        let yaml = r#"
domain_name: example.teleport.sh
auth_servers:
  - 127.0.0.1:3025
offline_threshold_secs: 1
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn accept_agent_registers_and_dial_finds_it_after_ready() {
        let site = LocalSite::new(
            test_settings(),
            Arc::new(StaticNodeWatcher::default()),
            None,
            None,
            Arc::new(FakeClock::new()),
        );

        let (ping_tx, ping_rx) = mpsc::channel(4);
        let conn = site.accept_agent(
            "node-a",
            TunnelType::Node,
            "proxy1",
            Arc::new(NullTransport::default()),
            ping_rx,
        );

        ping_tx.send(Ping(None)).await.unwrap();
        // give the spawned loop a moment to process the ping
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.heartbeat.is_ready());

        let dialed = site
            .dial(DialParams {
                server_id: "node-a".to_string(),
                conn_type: TunnelType::Node,
                from: None,
                to: None,
                original_client_dst_addr: None,
                teleport_version: "14.0.0".to_string(),
                principals: vec![],
                from_peer_proxy: false,
                proxy_ids: vec![],
            })
            .await
            .unwrap();
        assert_eq!(dialed.strategy, crate::types::DialStrategy::Tunnel);
    }
}
