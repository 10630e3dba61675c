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

//! The per-connection heartbeat loop, grounded in `handleHeartbeat` in
//! original_source. One of these is spawned for every `RemoteConn` the
//! registry creates and owns its liveness transitions end to end.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::remote_conn::RemoteConn;
use crate::types::{DiscoveryRequest, Proxy};

/// A decoded `ping` global request. The original encodes the sender's UTC
/// timestamp in the payload; an agent that omits it still counts as a
/// liveness signal, just without a round-trip measurement.
#[derive(Debug, Clone, Copy)]
pub struct Ping(pub Option<i64>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceAction {
    Continue,
    Terminate,
}

/// Pure silence-detection step, separated from the async loop so it can be
/// driven directly in tests with a [`crate::clock::FakeClock`] instead of
/// needing `tokio::time::pause`. Mirrors the `offline_for >= offline_threshold
/// * missed_heartbeat_threshold` check in `handleHeartbeat`.
pub fn evaluate_silence(
    now_millis: i64,
    conn: &RemoteConn,
    missed_heartbeat_threshold: u32,
) -> SilenceAction {
    if !conn.heartbeat.is_ready() {
        return SilenceAction::Continue;
    }
    let offline_threshold_millis = conn.offline_threshold.as_millis() as i64;
    if !conn.heartbeat.is_offline_for(now_millis, offline_threshold_millis) {
        return SilenceAction::Continue;
    }
    conn.heartbeat.mark_invalid();

    let terminate_after = offline_threshold_millis.saturating_mul(missed_heartbeat_threshold as i64);
    if conn.heartbeat.is_offline_for(now_millis, terminate_after) {
        SilenceAction::Terminate
    } else {
        SilenceAction::Continue
    }
}

pub struct HeartbeatLoopConfig {
    pub conn: Arc<RemoteConn>,
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    pub proxy_sync_interval: Duration,
    pub silence_check_interval: Duration,
    pub missed_heartbeat_threshold: u32,
    pub pings: mpsc::Receiver<Ping>,
    pub new_proxies: watch::Receiver<Arc<Vec<Proxy>>>,
    pub shutdown: watch::Receiver<bool>,
    pub initial_proxies: Arc<Vec<Proxy>>,
}

/// Runs until the agent's ping channel closes, the silence timeout fires, a
/// discovery send fails, or shutdown is signalled. Always terminates through
/// [`terminate`], which unregisters and closes the transport exactly once.
pub async fn run(mut cfg: HeartbeatLoopConfig) {
    let mut current_proxies = cfg.initial_proxies.clone();

    let mut sync_ticker = tokio::time::interval(cfg.proxy_sync_interval);
    sync_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut silence_ticker = tokio::time::interval(cfg.silence_check_interval);
    silence_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = cfg.shutdown.changed() => {
                if changed.is_err() || *cfg.shutdown.borrow() {
                    break;
                }
            }

            maybe_ping = cfg.pings.recv() => {
                match maybe_ping {
                    Some(ping) => handle_ping(&cfg, ping, &current_proxies).await,
                    None => break,
                }
            }

            changed = cfg.new_proxies.changed() => {
                if changed.is_err() {
                    break;
                }
                current_proxies = cfg.new_proxies.borrow_and_update().clone();
                if !push_discovery(&cfg, &current_proxies).await {
                    break;
                }
            }

            _ = sync_ticker.tick() => {
                if !push_discovery(&cfg, &current_proxies).await {
                    break;
                }
            }

            _ = silence_ticker.tick() => {
                if evaluate_silence(cfg.clock.now_millis(), &cfg.conn, cfg.missed_heartbeat_threshold)
                    == SilenceAction::Terminate
                {
                    break;
                }
            }
        }
    }

    terminate(&cfg).await;
}

async fn handle_ping(cfg: &HeartbeatLoopConfig, ping: Ping, current_proxies: &Arc<Vec<Proxy>>) {
    let was_ready = cfg.conn.heartbeat.is_ready();
    cfg.conn.heartbeat.set_last_heartbeat(cfg.clock.now_millis());
    cfg.conn.heartbeat.mark_valid();

    if let Ping(Some(sent_at)) = ping {
        let roundtrip = (cfg.clock.now_millis() - sent_at).max(0);
        tracing::debug!(node_id = %cfg.conn.node_id, roundtrip_ms = roundtrip, "ping roundtrip");
    }

    if !was_ready {
        cfg.conn.heartbeat.mark_ready();
        cfg.metrics.inc_reverse_tunnel(cfg.conn.tunnel_type);
        let _ = push_discovery(cfg, current_proxies).await;
    }
}

/// Sends the current proxy list over the control channel. Returns `false`
/// (and marks the connection invalid) on send failure, signalling the caller
/// to tear the loop down.
async fn push_discovery(cfg: &HeartbeatLoopConfig, proxies: &Arc<Vec<Proxy>>) -> bool {
    let req = DiscoveryRequest {
        proxies: proxies.as_ref().clone(),
    };
    match cfg.conn.transport.send_discovery_request(&req).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(node_id = %cfg.conn.node_id, error = %err, "discovery push failed");
            cfg.conn.heartbeat.mark_invalid();
            false
        }
    }
}

async fn terminate(cfg: &HeartbeatLoopConfig) {
    cfg.registry.unregister(&cfg.conn);
    cfg.conn.close_or_defer().await;
    if cfg.conn.heartbeat.is_ready() {
        cfg.metrics.dec_reverse_tunnel(cfg.conn.tunnel_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::NullTransport;
    use crate::types::TunnelType;

    fn conn_with(offline_threshold: Duration) -> Arc<RemoteConn> {
        let (conn, _rx) = RemoteConn::new(crate::remote_conn::RemoteConnConfig {
            node_id: "node-a".to_string(),
            tunnel_type: TunnelType::Node,
            proxy_name: "proxy1".to_string(),
            cluster_name: "cluster1".to_string(),
            offline_threshold,
            transport: Arc::new(NullTransport::default()),
        });
        conn
    }

    #[test]
    fn silence_ignored_before_ready() {
        let conn = conn_with(Duration::from_secs(60));
        assert_eq!(evaluate_silence(1_000_000, &conn, 3), SilenceAction::Continue);
    }

    #[test]
    fn silence_marks_invalid_but_continues_below_missed_threshold() {
        let conn = conn_with(Duration::from_secs(60));
        conn.heartbeat.mark_ready();
        conn.heartbeat.set_last_heartbeat(0);

        let action = evaluate_silence(70_000, &conn, 3);
        assert_eq!(action, SilenceAction::Continue);
        assert!(!conn.heartbeat.is_valid());
    }

    #[test]
    fn silence_terminates_at_missed_threshold() {
        let conn = conn_with(Duration::from_secs(60));
        conn.heartbeat.mark_ready();
        conn.heartbeat.set_last_heartbeat(0);

        let action = evaluate_silence(180_001, &conn, 3);
        assert_eq!(action, SilenceAction::Terminate);
    }

    #[test]
    fn fresh_heartbeat_clears_silence() {
        let conn = conn_with(Duration::from_secs(60));
        conn.heartbeat.mark_ready();
        conn.heartbeat.set_last_heartbeat(100_000);

        assert_eq!(evaluate_silence(110_000, &conn, 3), SilenceAction::Continue);
        assert!(conn.heartbeat.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_ready_then_timeout_terminates_and_unregisters() {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new());
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);

        let (conn, new_proxies_rx) = registry.register(
            "node-a",
            TunnelType::Node,
            "proxy1",
            "cluster1",
            Duration::from_millis(50),
            Arc::new(NullTransport::default()),
        );

        let (ping_tx, ping_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let cfg = HeartbeatLoopConfig {
            conn: conn.clone(),
            registry: registry.clone(),
            metrics: metrics.clone(),
            clock,
            proxy_sync_interval: Duration::from_secs(3600),
            silence_check_interval: Duration::from_millis(10),
            missed_heartbeat_threshold: 3,
            pings: ping_rx,
            new_proxies: new_proxies_rx,
            shutdown: shutdown_rx,
            initial_proxies: Arc::new(Vec::new()),
        };

        let handle = tokio::spawn(run(cfg));

        ping_tx.send(Ping(None)).await.unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(conn.heartbeat.is_ready());
        assert_eq!(metrics.reverse_tunnel_count(TunnelType::Node), 1);

        drop(ping_tx);
        tokio::time::advance(Duration::from_millis(200)).await;
        handle.await.unwrap();

        assert_eq!(registry.size(), 0);
        assert_eq!(metrics.reverse_tunnel_count(TunnelType::Node), 0);
    }
}
