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

//! Seam for proxy peering, grounded in original_source's `peer.Client`.
//! A sibling proxy in the same cluster may be able to route to an agent
//! this proxy cannot see; the dispatcher asks a `PeerDialer` to try before
//! falling back to a direct dial.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::types::{DialParams, TunnelType};

pub trait PeerConn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerConn for T {}

#[async_trait]
pub trait PeerDialer: Send + Sync {
    /// Ask a sibling proxy (selected from `proxy_ids`, or any if empty) to
    /// dial `server_id` on this proxy's behalf.
    async fn dial_node(
        &self,
        proxy_ids: &[String],
        server_id: &str,
        from: Option<std::net::SocketAddr>,
        to: Option<&str>,
        conn_type: TunnelType,
    ) -> Result<Box<dyn PeerConn>>;
}

/// Whether the dispatcher should attempt peer dialing for this dial: a
/// peer dialer is configured, the caller isn't itself a peer proxy relaying
/// the request, and the connection type is routable over peering.
pub fn should_try_peer_proxy(has_peer_dialer: bool, params: &DialParams) -> bool {
    has_peer_dialer && !params.from_peer_proxy && params.conn_type != TunnelType::Proxy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params(conn_type: TunnelType, from_peer_proxy: bool) -> DialParams {
        DialParams {
            server_id: "node-a".to_string(),
            conn_type,
            from: None,
            to: None,
            original_client_dst_addr: None,
            teleport_version: "14.0.0".to_string(),
            principals: vec![],
            from_peer_proxy,
            proxy_ids: vec![],
        }
    }

    #[test]
    fn skipped_without_dialer() {
        assert!(!should_try_peer_proxy(false, &base_params(TunnelType::Node, false)));
    }

    #[test]
    fn skipped_when_from_peer_proxy() {
        assert!(!should_try_peer_proxy(true, &base_params(TunnelType::Node, true)));
    }

    #[test]
    fn skipped_for_proxy_tunnel_type() {
        assert!(!should_try_peer_proxy(true, &base_params(TunnelType::Proxy, false)));
    }

    #[test]
    fn allowed_otherwise() {
        assert!(should_try_peer_proxy(true, &base_params(TunnelType::Node, false)));
    }
}
