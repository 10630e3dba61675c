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

//! The missing-tunnel-stats periodic task, grounded in `periodicFunctions`/
//! `sshTunnelStats` in original_source. Proxy-to-proxy resync itself lives
//! per connection inside the heartbeat loop (§4.6's other half); this module
//! is only the node-watcher-relative gauge.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::node_watcher::{NodeWatcher, WatchedNode};
use crate::registry::Registry;
use crate::types::TunnelType;

const MAX_LOGGED_EXAMPLES: usize = 10;

pub struct PeriodicConfig {
    pub registry: Arc<Registry>,
    pub node_watcher: Arc<dyn NodeWatcher>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    pub this_proxy_id: String,
    pub announce_ttl: Duration,
    pub interval: Duration,
    pub shutdown: watch::Receiver<bool>,
}

pub async fn run(mut cfg: PeriodicConfig) {
    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = cfg.shutdown.changed() => {
                if changed.is_err() || *cfg.shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                check_missing_tunnels(&cfg).await;
            }
        }
    }
}

/// A node is expected on this proxy when recording-at-proxy peering is in
/// use and its advertised `proxy_ids` either names us or is empty (meaning
/// "any proxy will do").
fn expected_on_this_proxy(node: &WatchedNode, this_proxy_id: &str) -> bool {
    node.proxy_ids.is_empty() || node.proxy_ids.iter().any(|id| id == this_proxy_id)
}

async fn check_missing_tunnels(cfg: &PeriodicConfig) {
    let now = cfg.clock.now_millis();
    let stale_before = now - cfg.announce_ttl.as_millis() as i64;

    let nodes = cfg.node_watcher.nodes().await;
    let missing: Vec<String> = nodes
        .into_iter()
        .filter(|n| n.uses_tunnel)
        .filter(|n| n.expiry_millis > stale_before)
        .filter(|n| expected_on_this_proxy(n, &cfg.this_proxy_id))
        .filter(|n| !cfg.registry.contains_key(&n.name, TunnelType::Node))
        .map(|n| n.name)
        .collect();

    cfg.metrics.set_missing_ssh_tunnels(missing.len() as i64);
    if !missing.is_empty() {
        let examples: Vec<&String> = missing.iter().take(MAX_LOGGED_EXAMPLES).collect();
        tracing::warn!(
            count = missing.len(),
            examples = ?examples,
            "nodes advertising tunnel use with no registered reverse tunnel"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::node_watcher::StaticNodeWatcher;
    use crate::registry::tests::register_test_conn;
    use std::sync::Arc;

    fn node(name: &str, expiry: i64, uses_tunnel: bool, proxy_ids: Vec<String>) -> WatchedNode {
        WatchedNode {
            name: name.to_string(),
            cluster: "cluster1".to_string(),
            expiry_millis: expiry,
            uses_tunnel,
            proxy_ids,
        }
    }

    fn base_cfg(registry: Arc<Registry>, nodes: Vec<WatchedNode>, clock: Arc<FakeClock>) -> (PeriodicConfig, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let cfg = PeriodicConfig {
            registry,
            node_watcher: Arc::new(StaticNodeWatcher::new(nodes)),
            metrics: Arc::new(Metrics::new()),
            clock: clock as Arc<dyn Clock>,
            this_proxy_id: "proxy1".to_string(),
            announce_ttl: Duration::from_secs(600),
            interval: Duration::from_secs(1),
            shutdown: rx,
        };
        (cfg, tx)
    }

    #[tokio::test]
    async fn counts_node_with_no_registered_tunnel_as_missing() {
        let registry = Arc::new(Registry::new());
        let clock = Arc::new(FakeClock::new());
        clock.set_millis(1_000_000);
        let (cfg, _tx) = base_cfg(
            registry,
            vec![node("node-a", 2_000_000, true, vec![])],
            clock,
        );

        check_missing_tunnels(&cfg).await;
        assert_eq!(cfg.metrics.missing_ssh_tunnels(), 1);
    }

    #[tokio::test]
    async fn registered_tunnel_is_not_counted_missing() {
        let registry = Arc::new(Registry::new());
        register_test_conn(&registry, "node-a", TunnelType::Node);
        let clock = Arc::new(FakeClock::new());
        clock.set_millis(1_000_000);
        let (cfg, _tx) = base_cfg(
            registry,
            vec![node("node-a", 2_000_000, true, vec![])],
            clock,
        );

        check_missing_tunnels(&cfg).await;
        assert_eq!(cfg.metrics.missing_ssh_tunnels(), 0);
    }

    #[tokio::test]
    async fn expired_announcement_is_ignored() {
        let registry = Arc::new(Registry::new());
        let clock = Arc::new(FakeClock::new());
        clock.set_millis(1_000_000);
        let (cfg, _tx) = base_cfg(
            registry,
            vec![node("node-a", 100, true, vec![])],
            clock,
        );

        check_missing_tunnels(&cfg).await;
        assert_eq!(cfg.metrics.missing_ssh_tunnels(), 0);
    }

    #[tokio::test]
    async fn peering_aware_node_not_assigned_to_us_is_ignored() {
        let registry = Arc::new(Registry::new());
        let clock = Arc::new(FakeClock::new());
        clock.set_millis(1_000_000);
        let (cfg, _tx) = base_cfg(
            registry,
            vec![node("node-a", 2_000_000, true, vec!["proxy2".to_string()])],
            clock,
        );

        check_missing_tunnels(&cfg).await;
        assert_eq!(cfg.metrics.missing_ssh_tunnels(), 0);
    }
}
