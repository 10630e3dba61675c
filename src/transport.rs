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

//! The seam between the registry/dispatcher core and the actual SSH
//! transport. §1 of the design treats "TLS/SSH transport setup" as an
//! external collaborator assumed to deliver framed SSH channels and
//! requests to the core; [`ControlTransport`] is that boundary. A production
//! binary backs it with a `russh::client::Handle`-based implementation; the
//! test suite backs it with an in-memory fake (see `registry::tests`).

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::types::{DialReq, DiscoveryRequest};

/// A single opened SSH channel, once the dial handshake has succeeded,
/// behaves like any other bidirectional byte stream.
pub trait TunnelChannel: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelChannel for T {}

/// An agent's long-lived SSH control connection, as seen by the core. Wraps
/// whatever SSH client library actually owns the socket.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Open the `teleport-transport` channel, send the single
    /// `teleport-transport-dial` request, and hand back the channel as a
    /// bytestream once the agent replies with success.
    async fn dial_transport(&self, req: &DialReq) -> Result<Box<dyn TunnelChannel>>;

    /// Send a `discovery-request` global request carrying the current proxy
    /// list.
    async fn send_discovery_request(&self, req: &DiscoveryRequest) -> Result<()>;

    /// Send a `reconnect` global request (no payload, no reply expected).
    async fn send_reconnect(&self) -> Result<()>;

    /// Close the underlying SSH connection. Implementations must treat
    /// "already closed" as success.
    async fn close(&self) -> std::io::Result<()>;

    /// Address of the agent, for logging.
    fn remote_addr(&self) -> String;
}
