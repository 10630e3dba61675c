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

//! Recording-at-proxy dial-with-agent, grounded in `dialWithAgent` and
//! `certificateCache`/`getHostCertificate` in original_source. The user's
//! SSH agent, the target resolution, the host-certificate signing, and the
//! in-process forwarding server are all modeled as seams: this module owns
//! only the orchestration and the signing cache's at-most-one-concurrent-
//! sign-per-key guarantee.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use ahash::RandomState;
use async_trait::async_trait;
use scc::HashMap as ConcurrentHashMap;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::transport::TunnelChannel;
use crate::types::{DialParams, DialStrategy, TunnelType};

/// An opaque handle to the caller's user-SSH-agent, obtained through
/// [`UserAgentProvider`]. The forwarding server is configured with it but
/// this crate never inspects its contents.
pub trait UserAgentHandle: Send + Sync {}

#[async_trait]
pub trait UserAgentProvider: Send + Sync {
    async fn get_user_agent(&self, principals: &[String]) -> Result<Box<dyn UserAgentHandle>>;
}

#[derive(Debug, Clone)]
pub struct HostCertificate {
    pub cert_bytes: Vec<u8>,
}

#[async_trait]
pub trait HostCertSigner: Send + Sync {
    async fn sign(&self, address: &str, principals: &[String]) -> Result<HostCertificate>;
}

/// Parameters the in-process forwarding server is constructed with. Ciphers/
/// KEX/MACs and the lock watcher are owned by the `ForwardingServerFactory`
/// implementation, not threaded through here, since they're fixed per
/// deployment rather than per dial.
pub struct ForwardingServerParams {
    pub user_agent: Box<dyn UserAgentHandle>,
    pub target: Pin<Box<dyn TunnelChannel>>,
    pub host_cert: HostCertificate,
    pub principals: Vec<String>,
}

/// Starts the splicing SSH server and returns the loopback address to dial
/// into it. Grounded in `newForwardingServer`/srv.Start in original_source,
/// which this crate treats as an external collaborator per §1.
#[async_trait]
pub trait ForwardingServerFactory: Send + Sync {
    async fn start(&self, params: ForwardingServerParams) -> Result<SocketAddr>;
}

/// Keyed by `(address, principals)`; deduplicates concurrent signs for the
/// same key by having every caller await the same `OnceCell`.
#[derive(Default)]
pub struct HostCertCache {
    cells: ConcurrentHashMap<(String, Vec<String>), Arc<OnceCell<HostCertificate>>, RandomState>,
}

impl HostCertCache {
    pub fn new() -> Self {
        HostCertCache {
            cells: ConcurrentHashMap::with_hasher(RandomState::new()),
        }
    }

    pub async fn get_or_sign(
        &self,
        address: &str,
        principals: &[String],
        signer: &dyn HostCertSigner,
    ) -> Result<HostCertificate> {
        let key = (address.to_string(), principals.to_vec());
        let cell = match self.cells.entry_async(key).await {
            scc::hash_map::Entry::Occupied(entry) => entry.get().clone(),
            scc::hash_map::Entry::Vacant(entry) => {
                let cell = Arc::new(OnceCell::new());
                entry.insert_entry(cell.clone());
                cell
            }
        };
        cell.get_or_try_init(|| signer.sign(address, principals))
            .await
            .map(|cert| cert.clone())
    }
}

pub struct ForwardingDialer {
    dispatcher: Arc<Dispatcher>,
    user_agents: Arc<dyn UserAgentProvider>,
    cert_cache: Arc<HostCertCache>,
    cert_signer: Arc<dyn HostCertSigner>,
    server_factory: Arc<dyn ForwardingServerFactory>,
}

impl ForwardingDialer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        user_agents: Arc<dyn UserAgentProvider>,
        cert_cache: Arc<HostCertCache>,
        cert_signer: Arc<dyn HostCertSigner>,
        server_factory: Arc<dyn ForwardingServerFactory>,
    ) -> Self {
        ForwardingDialer {
            dispatcher,
            user_agents,
            cert_cache,
            cert_signer,
            server_factory,
        }
    }

    /// Resolves the target over the regular dispatcher, wraps it in an
    /// in-process SSH forwarding server, and returns a loopback connection
    /// to that server. Every acquired resource is released on any error
    /// path simply by Rust's ownership rules: `?` drops `user_agent` and
    /// `target` as soon as they go out of scope.
    pub async fn dial_with_agent(&self, params: DialParams) -> Result<crate::dispatcher::Dialed> {
        if params.conn_type != TunnelType::Node {
            return Err(Error::bad_parameter(
                "recording-at-proxy dial is only valid for node tunnels",
            ));
        }

        let user_agent = self.user_agents.get_user_agent(&params.principals).await?;
        let address = params.to.clone().unwrap_or_default();
        let target = self.dispatcher.dial(params.clone()).await?;

        let host_cert = self
            .cert_cache
            .get_or_sign(&address, &params.principals, self.cert_signer.as_ref())
            .await?;

        let loopback_addr = self
            .server_factory
            .start(ForwardingServerParams {
                user_agent,
                target: target.conn,
                host_cert,
                principals: params.principals,
            })
            .await?;

        let loopback = TcpStream::connect(loopback_addr)
            .await
            .map_err(|err| Error::connection_problem(format!("failed to dial forwarding server: {err}")))?;

        Ok(crate::dispatcher::Dialed {
            conn: Box::pin(loopback),
            strategy: DialStrategy::Tunnel,
        })
    }
}
