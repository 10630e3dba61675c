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

//! Seam for node discovery, grounded in original_source's
//! `services.NodeWatcher`. Enumerating registered servers and their
//! advertised TTL/proxy-IDs is out of scope for the core (§1); this trait
//! is the boundary the periodic tunnel-stats task (§4.6) calls through.

use async_trait::async_trait;

/// A server registered with the cluster that is expected to maintain a
/// reverse tunnel.
#[derive(Debug, Clone)]
pub struct WatchedNode {
    pub name: String,
    pub cluster: String,
    pub expiry_millis: i64,
    pub uses_tunnel: bool,
    pub proxy_ids: Vec<String>,
}

#[async_trait]
pub trait NodeWatcher: Send + Sync {
    async fn nodes(&self) -> Vec<WatchedNode>;
}

/// A fixed in-memory watcher, useful for tests and for standalone
/// deployments without a real discovery backend.
#[derive(Default)]
pub struct StaticNodeWatcher {
    nodes: Vec<WatchedNode>,
}

impl StaticNodeWatcher {
    pub fn new(nodes: Vec<WatchedNode>) -> Self {
        StaticNodeWatcher { nodes }
    }
}

#[async_trait]
impl NodeWatcher for StaticNodeWatcher {
    async fn nodes(&self) -> Vec<WatchedNode> {
        self.nodes.clone()
    }
}
