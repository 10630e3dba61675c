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

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Sentinel destination meaning "this server can only be reached over a tunnel".
pub const LOCAL_NODE: &str = "@local-node";
/// Sentinel destination meaning "dial the remote cluster's auth server".
pub const REMOTE_AUTH_SERVER: &str = "@remote-auth-server";

/// Minimum caller version that propagates the original client address through
/// a signed PROXY header. Callers older than this are never sent one.
pub const MIN_IP_PROPAGATION_VERSION: &str = "13.0.0";

/// Kept only for wire compatibility with pre-13.0 agents; see DESIGN.md open
/// question on KubeSNIPrefix.
pub const KUBE_SNI_PREFIX: &str = "kube-teleport-proxy-alpn.";

pub const TELEPORT_AUTH_SNI_PREFIX: &str = "teleport-auth@";
pub const TELEPORT_REVERSETUNNEL_ALPN: &str = "teleport-reversetunnel";

pub const TRANSPORT_CHANNEL_NAME: &str = "teleport-transport";
pub const TRANSPORT_DIAL_REQUEST: &str = "teleport-transport-dial";
pub const DISCOVERY_REQUEST: &str = "discovery-request";
pub const PING_REQUEST: &str = "ping";
pub const RECONNECT_REQUEST: &str = "reconnect";

/// The `(server_id, tunnel_type)` key every agent control connection is
/// registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnKey {
    pub server_id: String,
    pub tunnel_type: TunnelType,
}

impl ConnKey {
    pub fn new(server_id: impl Into<String>, tunnel_type: TunnelType) -> Self {
        ConnKey {
            server_id: server_id.into(),
            tunnel_type,
        }
    }
}

/// The kind of remote endpoint a tunnel (or direct dial) terminates at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelType {
    Node,
    Kube,
    App,
    Database,
    DatabaseService,
    Proxy,
    WindowsDesktop,
}

impl TunnelType {
    /// Well-known keep-alive type tags used on the wire.
    pub fn tag(self) -> &'static str {
        match self {
            TunnelType::Node => "node",
            TunnelType::App => "app",
            TunnelType::Database => "db",
            TunnelType::DatabaseService => "db_service",
            TunnelType::Kube => "kube",
            TunnelType::Proxy => "proxy",
            TunnelType::WindowsDesktop => "windows_desktop_service",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The strategy a successful dial was served through, used for metrics and
/// for deciding whether to attempt a fallback strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStrategy {
    Tunnel,
    Peer,
    PeerTunnel,
    Direct,
}

impl DialStrategy {
    pub fn label(self) -> &'static str {
        match self {
            DialStrategy::Tunnel => "tunnel",
            DialStrategy::Peer => "peer",
            DialStrategy::PeerTunnel => "peer-tunnel",
            DialStrategy::Direct => "direct",
        }
    }
}

/// A proxy in the cluster's proxy list, as announced via discovery requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub name: String,
    pub address: String,
    pub version: String,
}

/// Caller-supplied parameters for a single dial attempt.
#[derive(Clone)]
pub struct DialParams {
    pub server_id: String,
    pub conn_type: TunnelType,
    pub from: Option<SocketAddr>,
    pub to: Option<String>,
    pub original_client_dst_addr: Option<SocketAddr>,
    pub teleport_version: String,
    pub principals: Vec<String>,
    pub from_peer_proxy: bool,
    pub proxy_ids: Vec<String>,
}

impl DialParams {
    /// `true` when `to` is absent or the tunnel-only sentinel.
    pub fn to_is_tunnel_only(&self) -> bool {
        match &self.to {
            None => true,
            Some(addr) => addr.is_empty() || addr == LOCAL_NODE,
        }
    }
}

/// The projection of [`DialParams`] actually sent over an agent's control
/// channel to open a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialReq {
    pub server_id: String,
    pub conn_type: TunnelType,
    pub address: String,
    pub client_src_addr: String,
    pub client_dst_addr: String,
    pub teleport_version: String,
}

impl DialReq {
    pub fn from_params(params: &DialParams) -> Self {
        DialReq {
            server_id: params.server_id.clone(),
            conn_type: params.conn_type,
            address: params.to.clone().unwrap_or_default(),
            client_src_addr: params
                .from
                .map(|a| a.to_string())
                .unwrap_or_default(),
            client_dst_addr: params
                .original_client_dst_addr
                .map(|a| a.to_string())
                .unwrap_or_default(),
            teleport_version: params.teleport_version.clone(),
        }
    }
}

/// Sent proxy -> agent on the `discovery-request` global request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub proxies: Vec<Proxy>,
}
