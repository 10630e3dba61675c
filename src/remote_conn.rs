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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::heartbeat::HeartbeatState;
use crate::transport::ControlTransport;
use crate::types::{Proxy, TunnelType};

/// A single agent control connection, indexed in the registry by
/// `(node_id, tunnel_type)`. The registry owns this record; a heartbeat
/// loop holds a borrowed `Arc` and drives `heartbeat` but never owns it.
pub struct RemoteConn {
    pub node_id: String,
    pub tunnel_type: TunnelType,
    pub proxy_name: String,
    pub cluster_name: String,
    pub offline_threshold: Duration,
    pub heartbeat: HeartbeatState,
    pub transport: Arc<dyn ControlTransport>,
    new_proxies_tx: watch::Sender<Arc<Vec<Proxy>>>,
    /// Set when the owning heartbeat loop wants this connection closed but
    /// found `active_sessions > 0`; the last session to drop performs the
    /// close instead.
    pending_close: AtomicBool,
}

pub struct RemoteConnConfig {
    pub node_id: String,
    pub tunnel_type: TunnelType,
    pub proxy_name: String,
    pub cluster_name: String,
    pub offline_threshold: Duration,
    pub transport: Arc<dyn ControlTransport>,
}

impl RemoteConn {
    /// Creates a new record plus the receiving half of its `new_proxies`
    /// channel, which the caller (the registry) hands to the spawned
    /// heartbeat loop. The channel is a `watch`: exactly the "drop-oldest
    /// bounded channel of size 1, only the latest list matters" semantics
    /// design, with no hand-rolled drain-then-push dance.
    pub fn new(config: RemoteConnConfig) -> (Arc<RemoteConn>, watch::Receiver<Arc<Vec<Proxy>>>) {
        let (tx, rx) = watch::channel(Arc::new(Vec::new()));
        let conn = Arc::new(RemoteConn {
            node_id: config.node_id,
            tunnel_type: config.tunnel_type,
            proxy_name: config.proxy_name,
            cluster_name: config.cluster_name,
            offline_threshold: config.offline_threshold,
            heartbeat: HeartbeatState::new(),
            transport: config.transport,
            new_proxies_tx: tx,
            pending_close: AtomicBool::new(false),
        });
        (conn, rx)
    }

    /// Non-blocking replace of the pending proxy list. `watch::Sender::send`
    /// never blocks on a slow consumer and always keeps only the latest
    /// value, which is exactly what fan-out needs.
    pub fn update_proxies(&self, proxies: Arc<Vec<Proxy>>) {
        let _ = self.new_proxies_tx.send(proxies);
    }

    pub fn remote_addr(&self) -> String {
        self.transport.remote_addr()
    }

    /// `true` once a removal has been requested but deferred because
    /// sessions were still active on this connection.
    pub fn is_pending_close(&self) -> bool {
        self.pending_close.load(Ordering::Acquire)
    }

    pub fn mark_pending_close(&self) {
        self.pending_close.store(true, Ordering::Release);
    }

    /// Closes now if no sessions are active, otherwise defers to the last
    /// session's drop. Mirrors the registry-removal invariant.
    pub async fn close_or_defer(self: &Arc<Self>) {
        if self.heartbeat.active_sessions() == 0 {
            self.close().await;
        } else {
            self.mark_pending_close();
        }
    }

    /// Close the transport, suppressing the benign "already closed" errors
    /// that races during teardown routinely produce.
    pub async fn close(&self) {
        if let Err(err) = self.transport.close().await {
            if !crate::error::is_benign_close_error(&err) {
                tracing::warn!(node_id = %self.node_id, error = %err, "failed to close remote connection");
            }
        }
    }
}
