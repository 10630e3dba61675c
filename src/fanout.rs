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

//! Proxy-list fan-out and advisory reconnect, grounded in `fanOutProxies`/
//! `adviseReconnect` in original_source.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::Registry;
use crate::types::Proxy;

/// Pushes `proxies` to every registered connection's `new_proxies` channel.
/// Each send is non-blocking drop-oldest (`watch::Sender::send`), so a slow
/// or stuck agent never stalls the others; the registry lock is held only
/// long enough to iterate and enqueue.
pub fn fan_out_proxies(registry: &Registry, proxies: Vec<Proxy>) {
    let shared = Arc::new(proxies);
    registry.for_each(|conn| conn.update_proxies(shared.clone()));
}

/// Sends a `reconnect` global request to every live agent in parallel and
/// waits for all of them, or for `cancel` to fire, whichever is first.
/// Individual reconnect failures are logged and otherwise ignored: this is
/// advisory, not a guaranteed handoff.
pub async fn advise_reconnect(registry: &Registry, cancel: CancellationToken) {
    let mut conns = Vec::new();
    registry.for_each(|conn| conns.push(conn.clone()));

    let all_done = async {
        let mut tasks = Vec::with_capacity(conns.len());
        for conn in conns {
            tasks.push(tokio::spawn(async move {
                if let Err(err) = conn.transport.send_reconnect().await {
                    tracing::debug!(node_id = %conn.node_id, error = %err, "advisory reconnect failed");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    };

    tokio::select! {
        _ = all_done => {}
        _ = cancel.cancelled() => {
            tracing::info!("advise_reconnect cancelled before all agents acknowledged");
        }
    }
}

/// Convenience wrapper used where callers want a fixed grace period rather
/// than an externally-owned cancellation token.
pub async fn advise_reconnect_with_timeout(registry: &Registry, grace: Duration) {
    let cancel = CancellationToken::new();
    let guard = cancel.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        guard.cancel();
    });
    advise_reconnect(registry, cancel).await;
    timer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::NullTransport;
    use crate::types::TunnelType;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn fan_out_reaches_every_connection() {
        let registry = Registry::new();
        let (conn_a, mut rx_a) = registry.register(
            "node-a",
            TunnelType::Node,
            "proxy1",
            "cluster1",
            StdDuration::from_secs(60),
            Arc::new(NullTransport::default()),
        );
        let (conn_b, mut rx_b) = registry.register(
            "node-b",
            TunnelType::Kube,
            "proxy1",
            "cluster1",
            StdDuration::from_secs(60),
            Arc::new(NullTransport::default()),
        );
        let _ = &conn_a;
        let _ = &conn_b;

        fan_out_proxies(
            &registry,
            vec![Proxy {
                name: "p1".to_string(),
                address: "10.0.0.1:3080".to_string(),
                version: "14.0.0".to_string(),
            }],
        );

        rx_a.changed().await.unwrap();
        rx_b.changed().await.unwrap();
        assert_eq!(rx_a.borrow().len(), 1);
        assert_eq!(rx_b.borrow().len(), 1);
    }

    #[tokio::test]
    async fn fan_out_is_drop_oldest_under_a_slow_consumer() {
        let registry = Registry::new();
        let (_conn, mut rx) = registry.register(
            "node-a",
            TunnelType::Node,
            "proxy1",
            "cluster1",
            StdDuration::from_secs(60),
            Arc::new(NullTransport::default()),
        );

        for i in 0..5 {
            fan_out_proxies(
                &registry,
                vec![Proxy {
                    name: format!("p{i}"),
                    address: "10.0.0.1:3080".to_string(),
                    version: "14.0.0".to_string(),
                }],
            );
        }

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow()[0].name, "p4");
    }

    #[tokio::test]
    async fn advise_reconnect_completes_without_cancellation() {
        let registry = Registry::new();
        let (_conn, _rx) = registry.register(
            "node-a",
            TunnelType::Node,
            "proxy1",
            "cluster1",
            StdDuration::from_secs(60),
            Arc::new(NullTransport::default()),
        );

        advise_reconnect(&registry, CancellationToken::new()).await;
    }
}
