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

//! The dial dispatcher, grounded in `getConn`/`chanTransportConn`/
//! `sessionTrackingConn` in original_source. Tries the tunnel registry, then
//! optionally a peer proxy, then a direct TCP dial, in that order, composing
//! errors across the attempted strategies.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::metrics::DialTimer;
use crate::peer::{should_try_peer_proxy, PeerDialer};
use crate::registry::Registry;
use crate::remote_conn::RemoteConn;
use crate::signer::{should_send_signed_proxy_header, ProxySigner};
use crate::transport::TunnelChannel;
use crate::types::{DialParams, DialReq, DialStrategy, TunnelType, LOCAL_NODE};

const DEFAULT_DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    registry: Arc<Registry>,
    peer_dialer: Option<Arc<dyn PeerDialer>>,
    proxy_signer: Option<Arc<dyn ProxySigner>>,
    direct_dial_timeout: Duration,
    check_peer_version: bool,
}

/// A successfully established dial, tagged with the strategy that produced
/// it for logging and the latency histogram.
pub struct Dialed {
    pub conn: Pin<Box<dyn TunnelChannel>>,
    pub strategy: DialStrategy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        peer_dialer: Option<Arc<dyn PeerDialer>>,
        proxy_signer: Option<Arc<dyn ProxySigner>>,
    ) -> Self {
        Dispatcher {
            registry,
            peer_dialer,
            proxy_signer,
            direct_dial_timeout: DEFAULT_DIRECT_DIAL_TIMEOUT,
            check_peer_version: true,
        }
    }

    pub fn with_direct_dial_timeout(mut self, timeout: Duration) -> Self {
        self.direct_dial_timeout = timeout;
        self
    }

    pub async fn dial(&self, params: DialParams) -> Result<Dialed> {
        let timer = DialTimer::start();
        let mut causes: Vec<Error> = Vec::new();
        let mut last_strategy = "none";

        match self.registry.select(&params.server_id, params.conn_type) {
            Ok(conn) => {
                last_strategy = "tunnel";
                return match self.dial_tunnel(&conn, &params).await {
                    Ok(mut conn_stream) => {
                        self.maybe_sign_header(&mut conn_stream, &params, true).await?;
                        timer.record(DialStrategy::Tunnel.label());
                        Ok(Dialed {
                            conn: conn_stream,
                            strategy: DialStrategy::Tunnel,
                        })
                    }
                    Err(err) => {
                        // The agent exists but the tunnel hop itself broke; do not fall through.
                        conn.heartbeat.mark_invalid();
                        if conn.heartbeat.active_sessions() == 0 {
                            self.registry.unregister(&conn);
                            conn.close().await;
                        } else {
                            conn.mark_pending_close();
                        }
                        Err(Error::connection_problem(format!(
                            "failed to dial {} over tunnel: {}",
                            params.server_id, err
                        )))
                    }
                };
            }
            Err(err) if err.is_not_found() => causes.push(err),
            Err(err) => return Err(err),
        }

        if should_try_peer_proxy(self.peer_dialer.is_some(), &params) {
            last_strategy = "peer";
            let dialer = self.peer_dialer.as_ref().expect("checked above");
            match dialer
                .dial_node(
                    &params.proxy_ids,
                    &params.server_id,
                    params.from,
                    params.to.as_deref(),
                    params.conn_type,
                )
                .await
            {
                Ok(peer_conn) => {
                    // `peer_conn: Box<dyn PeerConn>` itself satisfies the
                    // `AsyncRead + AsyncWrite + Unpin + Send` bound `dyn
                    // TunnelChannel` blanket-implements over, so boxing it
                    // again gives a `TunnelChannel` trait object.
                    let mut boxed: Pin<Box<dyn TunnelChannel>> = Box::pin(peer_conn);
                    self.maybe_sign_header(&mut boxed, &params, false).await?;
                    timer.record(DialStrategy::Peer.label());
                    return Ok(Dialed {
                        conn: boxed,
                        strategy: DialStrategy::Peer,
                    });
                }
                Err(err) => causes.push(err),
            }
        }

        if should_try_direct(&params) {
            last_strategy = "direct";
            match self.dial_direct(&params).await {
                Ok(tcp) => {
                    let mut boxed: Pin<Box<dyn TunnelChannel>> = Box::pin(tcp);
                    self.maybe_sign_header(&mut boxed, &params, false).await?;
                    timer.record(DialStrategy::Direct.label());
                    return Ok(Dialed {
                        conn: boxed,
                        strategy: DialStrategy::Direct,
                    });
                }
                Err(err) => causes.push(err),
            }
        }

        timer.record(last_strategy);
        Err(self.build_final_error(&params, causes, last_strategy))
    }

    async fn dial_tunnel(
        &self,
        conn: &Arc<RemoteConn>,
        params: &DialParams,
    ) -> Result<Pin<Box<dyn TunnelChannel>>> {
        let req = DialReq::from_params(params);
        let channel = conn.transport.dial_transport(&req).await?;
        Ok(Box::pin(SessionTrackingConn::new(channel, conn.clone())))
    }

    async fn dial_direct(&self, params: &DialParams) -> Result<TcpStream> {
        let addr = params
            .to
            .as_deref()
            .ok_or_else(|| Error::bad_parameter("direct dial requested with no destination"))?;
        tokio::time::timeout(self.direct_dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::connection_problem(format!("timed out dialing {addr}")))?
            .map_err(|err| Error::connection_problem(format!("failed to dial {addr}: {err}")))
    }

    async fn maybe_sign_header(
        &self,
        conn: &mut Pin<Box<dyn TunnelChannel>>,
        params: &DialParams,
        used_tunnel: bool,
    ) -> Result<()> {
        let has_signer = self.proxy_signer.is_some();
        if !should_send_signed_proxy_header(
            has_signer,
            used_tunnel,
            self.check_peer_version,
            &params.teleport_version,
            params.from,
            params.original_client_dst_addr,
        ) {
            return Ok(());
        }
        let signer = self.proxy_signer.as_ref().expect("checked above");
        let from = params.from.expect("checked above");
        let to = params.original_client_dst_addr.expect("checked above");
        let header = signer.sign_proxy_header(from, to).await?;
        conn.write_all(&header).await.map_err(Error::from)?;
        Ok(())
    }

    fn build_final_error(&self, params: &DialParams, causes: Vec<Error>, last_strategy: &str) -> Error {
        let aggregate = Error::aggregate(causes)
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no eligible strategy".to_string());
        Error::connection_problem(format!(
            "unable to dial {} to {}: last attempted strategy was {}: {}",
            params.conn_type,
            params.to.as_deref().unwrap_or(LOCAL_NODE),
            last_strategy,
            aggregate
        ))
    }
}

/// `from` = the caller's address and `to` = target, mirroring
/// `skipDirectDial`: App/Database tunnels must go over a tunnel, a peer
/// proxy relaying on our behalf should not also try direct, and a
/// tunnel-only destination has no address to dial anyway.
pub fn should_try_direct(params: &DialParams) -> bool {
    if matches!(
        params.conn_type,
        TunnelType::App | TunnelType::Database | TunnelType::DatabaseService
    ) {
        return false;
    }
    if params.from_peer_proxy {
        return false;
    }
    !params.to_is_tunnel_only()
}

/// Wraps a tunnel channel so `active_sessions` on the owning [`RemoteConn`]
/// is incremented for the wrapper's lifetime, mirroring
/// `sessionTrackingConn`. Decrementing on drop may trigger a deferred close
/// left behind by the heartbeat loop (see
/// [`RemoteConn::close_or_defer`]).
pub struct SessionTrackingConn<T> {
    inner: T,
    conn: Arc<RemoteConn>,
}

impl<T> SessionTrackingConn<T> {
    pub fn new(inner: T, conn: Arc<RemoteConn>) -> Self {
        conn.heartbeat.increment_active_sessions();
        SessionTrackingConn { inner, conn }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for SessionTrackingConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for SessionTrackingConn<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<T> Drop for SessionTrackingConn<T> {
    fn drop(&mut self) {
        self.conn.heartbeat.decrement_active_sessions();
        if self.conn.heartbeat.active_sessions() == 0 && self.conn.is_pending_close() {
            let conn = self.conn.clone();
            tokio::spawn(async move {
                conn.close().await;
            });
        }
    }
}
