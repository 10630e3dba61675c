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

//! The live-agent registry: a map from `(server_id, tunnel_type)` to an
//! ordered list of connections, oldest to newest. Grounded in
//! `core/src/pool/pool.rs`'s `ConnectionPool`/`ConnectionNode` shape (an
//! outer map of groups, each group holding the connections for that key),
//! collapsed to a single mutex instead of that file's `RwLock<map> +
//! per-node Mutex` split, since fine-grained per-key locking has not shown
//! to help at observed fan-in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::remote_conn::{RemoteConn, RemoteConnConfig};
use crate::transport::ControlTransport;
use crate::types::{ConnKey, Proxy, TunnelType};

#[derive(Default)]
pub struct Registry {
    conns: Mutex<HashMap<ConnKey, Vec<Arc<RemoteConn>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a new record with `ready=false`, `valid=true`,
    /// `last_heartbeat=0`, `active_sessions=0` and appends it to its key's
    /// list. Returns the record and the receiving half of its
    /// `new_proxies` channel for the caller to hand to the spawned
    /// heartbeat loop.
    pub fn register(
        &self,
        node_id: impl Into<String>,
        tunnel_type: TunnelType,
        proxy_name: impl Into<String>,
        cluster_name: impl Into<String>,
        offline_threshold: Duration,
        transport: Arc<dyn ControlTransport>,
    ) -> (Arc<RemoteConn>, watch::Receiver<Arc<Vec<Proxy>>>) {
        let node_id = node_id.into();
        let (conn, rx) = RemoteConn::new(RemoteConnConfig {
            node_id: node_id.clone(),
            tunnel_type,
            proxy_name: proxy_name.into(),
            cluster_name: cluster_name.into(),
            offline_threshold,
            transport,
        });

        let key = ConnKey::new(node_id, tunnel_type);
        self.conns.lock().entry(key).or_default().push(conn.clone());
        (conn, rx)
    }

    /// Removes `conn` from its key's list by identity. If the list becomes
    /// empty the key is dropped from the map entirely.
    pub fn unregister(&self, conn: &Arc<RemoteConn>) {
        let key = ConnKey::new(conn.node_id.clone(), conn.tunnel_type);
        let mut conns = self.conns.lock();
        if let Some(list) = conns.get_mut(&key) {
            list.retain(|c| !Arc::ptr_eq(c, conn));
            if list.is_empty() {
                conns.remove(&key);
            }
        }
    }

    /// Picks a connection for `(server_id, conn_type)`: the newest ready
    /// connection that is also valid, or failing that the newest ready
    /// connection (whether valid or not), or `NotFound` if none are ready.
    pub fn select(&self, server_id: &str, conn_type: TunnelType) -> Result<Arc<RemoteConn>> {
        let key = ConnKey::new(server_id.to_string(), conn_type);
        let conns = self.conns.lock();
        let list = conns
            .get(&key)
            .ok_or_else(|| Error::not_found(format!("no {conn_type} reverse tunnel for {server_id} found")))?;

        let mut newest_invalid: Option<Arc<RemoteConn>> = None;
        for conn in list.iter().rev() {
            if !conn.heartbeat.is_ready() {
                continue;
            }
            if conn.heartbeat.is_valid() {
                return Ok(conn.clone());
            }
            if newest_invalid.is_none() {
                newest_invalid = Some(conn.clone());
            }
        }

        newest_invalid.ok_or_else(|| {
            Error::not_found(format!("{conn_type} is offline: no active {server_id} tunnels found"))
        })
    }

    /// Read-only iteration over every registered connection, used by
    /// fan-out and advisory reconnect. Must stay cheap: the lock is held for
    /// the whole call, so `f` may only enqueue to bounded channels, never do
    /// I/O.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<RemoteConn>)) {
        let conns = self.conns.lock();
        for list in conns.values() {
            for conn in list {
                f(conn);
            }
        }
    }

    /// Number of distinct `(server_id, tunnel_type)` keys with at least one
    /// live connection.
    pub fn size(&self) -> usize {
        self.conns.lock().len()
    }

    /// Whether any connection (ready or not) is registered under this key.
    /// Used by the periodic tunnel-stats task, which cares about existence
    /// rather than selectability.
    pub fn contains_key(&self, server_id: &str, tunnel_type: TunnelType) -> bool {
        let key = ConnKey::new(server_id.to_string(), tunnel_type);
        self.conns.lock().contains_key(&key)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Result as CoreResult;
    use crate::transport::TunnelChannel;
    use crate::types::DialReq;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncRead, AsyncWrite};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A transport stub that never actually opens a channel; used where the
    /// test only cares about registry bookkeeping.
    pub struct NullTransport {
        pub dial_calls: AtomicUsize,
        pub dial_error: Option<String>,
    }

    impl Default for NullTransport {
        fn default() -> Self {
            NullTransport {
                dial_calls: AtomicUsize::new(0),
                dial_error: None,
            }
        }
    }

    struct NullChannel;
    impl AsyncRead for NullChannel {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
    impl AsyncWrite for NullChannel {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
    impl TunnelChannel for NullChannel {}

    #[async_trait]
    impl ControlTransport for NullTransport {
        async fn dial_transport(&self, _req: &DialReq) -> CoreResult<Box<dyn TunnelChannel>> {
            self.dial_calls.fetch_add(1, Ordering::SeqCst);
            match &self.dial_error {
                Some(msg) => Err(Error::connection_problem(msg.clone())),
                None => Ok(Box::new(NullChannel)),
            }
        }

        async fn send_discovery_request(
            &self,
            _req: &crate::types::DiscoveryRequest,
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn send_reconnect(&self) -> CoreResult<()> {
            Ok(())
        }

        async fn close(&self) -> std::io::Result<()> {
            Ok(())
        }

        fn remote_addr(&self) -> String {
            "127.0.0.1:0".to_string()
        }
    }

    pub fn register_test_conn(
        registry: &Registry,
        node_id: &str,
        tunnel_type: TunnelType,
    ) -> Arc<RemoteConn> {
        let (conn, _rx) = registry.register(
            node_id,
            tunnel_type,
            "proxy1",
            "cluster1",
            Duration::from_secs(60),
            Arc::new(NullTransport::default()),
        );
        conn
    }

    #[test]
    fn register_then_select_requires_ready() {
        let registry = Registry::new();
        let conn = register_test_conn(&registry, "node-a", TunnelType::Node);
        assert!(registry.select("node-a", TunnelType::Node).is_err());

        conn.heartbeat.mark_ready();
        let selected = registry.select("node-a", TunnelType::Node).unwrap();
        assert!(Arc::ptr_eq(&selected, &conn));
    }

    #[test]
    fn select_prefers_newest_valid_over_older_valid() {
        let registry = Registry::new();
        let older = register_test_conn(&registry, "node-a", TunnelType::Node);
        older.heartbeat.mark_ready();
        let newer = register_test_conn(&registry, "node-a", TunnelType::Node);
        newer.heartbeat.mark_ready();

        let selected = registry.select("node-a", TunnelType::Node).unwrap();
        assert!(Arc::ptr_eq(&selected, &newer));
    }

    #[test]
    fn select_falls_back_to_newest_ready_invalid() {
        let registry = Registry::new();
        let invalid = register_test_conn(&registry, "node-a", TunnelType::Node);
        invalid.heartbeat.mark_ready();
        invalid.heartbeat.mark_invalid();

        let selected = registry.select("node-a", TunnelType::Node).unwrap();
        assert!(Arc::ptr_eq(&selected, &invalid));
    }

    #[test]
    fn select_with_zero_ready_is_not_found() {
        let registry = Registry::new();
        register_test_conn(&registry, "node-a", TunnelType::Node);
        let err = registry.select("node-a", TunnelType::Node).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn unregister_removes_empty_key() {
        let registry = Registry::new();
        let conn = register_test_conn(&registry, "node-a", TunnelType::Node);
        assert_eq!(registry.size(), 1);
        registry.unregister(&conn);
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn unregister_does_not_duplicate_across_keys() {
        let registry = Registry::new();
        let a = register_test_conn(&registry, "node-a", TunnelType::Node);
        let _b = register_test_conn(&registry, "node-a", TunnelType::Kube);
        assert_eq!(registry.size(), 2);
        registry.unregister(&a);
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn contains_key_is_true_regardless_of_readiness() {
        let registry = Registry::new();
        register_test_conn(&registry, "node-a", TunnelType::Node);
        assert!(registry.contains_key("node-a", TunnelType::Node));
        assert!(!registry.contains_key("node-a", TunnelType::Kube));
        assert!(!registry.contains_key("node-b", TunnelType::Node));
    }

    #[test]
    fn for_each_visits_every_connection_across_keys() {
        let registry = Registry::new();
        register_test_conn(&registry, "node-a", TunnelType::Node);
        register_test_conn(&registry, "node-b", TunnelType::Kube);

        let mut seen = Vec::new();
        registry.for_each(|c| seen.push(c.node_id.clone()));
        seen.sort();
        assert_eq!(seen, vec!["node-a".to_string(), "node-b".to_string()]);
    }
}
