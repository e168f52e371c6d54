//! Listener accept loops.
//!
//! Four kinds of port: the agent tunnel (mTLS framed streams), the CNC
//! REST surface (mTLS, `control` certificates only), HTTPS ingress ports,
//! and plain-HTTP ingress ports. Each loop runs until the shutdown token
//! fires; per-connection work is spawned so a slow handshake never blocks
//! the accept path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{agent_name_from_der, require_control_purpose};
use crate::session::{serve_agent_stream, SessionContext, SessionIdentity};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await
}

/// Agent tunnel listener. With TLS, the peer's verified leaf certificate
/// binds the agent name before any frame is read; without (insecure mode),
/// identity comes from the Hello.
pub async fn run_agent_tunnel(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
) {
    info!(
        port = listener.local_addr().map(|a| a.port()).unwrap_or(0),
        secure = acceptor.is_some(),
        "agent tunnel listening"
    );
    loop {
        let (tcp, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tunnel accept failed");
                    continue;
                }
            },
        };

        let ctx = ctx.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => {
                    let tls = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                        Ok(Ok(tls)) => tls,
                        Ok(Err(e)) => {
                            warn!(peer = %peer, error = %e, "tunnel TLS handshake failed");
                            return;
                        }
                        Err(_) => {
                            warn!(peer = %peer, "tunnel TLS handshake timed out");
                            return;
                        }
                    };
                    let agent_name = {
                        let (_, conn) = tls.get_ref();
                        let Some(leaf) = conn.peer_certificates().and_then(|c| c.first()) else {
                            warn!(peer = %peer, "tunnel stream without peer certificate");
                            return;
                        };
                        match agent_name_from_der(leaf.as_ref()) {
                            Ok(name) => name,
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "tunnel stream rejected");
                                return;
                            }
                        }
                    };
                    let result =
                        serve_agent_stream(tls, SessionIdentity::Certified(agent_name.clone()), ctx)
                            .await;
                    if let Err(e) = result {
                        debug!(agent = %agent_name, error = %e, "agent session ended");
                    }
                }
                None => {
                    if let Err(e) = serve_agent_stream(tcp, SessionIdentity::FromHello, ctx).await {
                        debug!(peer = %peer, error = %e, "insecure agent session ended");
                    }
                }
            }
        });
    }
}

/// CNC listener: mTLS, and the peer leaf must be a `control` certificate.
pub async fn run_cnc(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) {
    info!(
        port = listener.local_addr().map(|a| a.port()).unwrap_or(0),
        "CNC listening"
    );
    loop {
        let (tcp, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "CNC accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let tls = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "CNC TLS handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(peer = %peer, "CNC TLS handshake timed out");
                    return;
                }
            };
            {
                let (_, conn) = tls.get_ref();
                let Some(leaf) = conn.peer_certificates().and_then(|c| c.first()) else {
                    warn!(peer = %peer, "CNC connection without peer certificate");
                    return;
                };
                if let Err(e) = require_control_purpose(leaf.as_ref()) {
                    warn!(peer = %peer, error = %e, "CNC connection rejected");
                    return;
                }
            }
            serve_router_on(tls, router).await;
        });
    }
}

/// HTTPS ingress listener (no client auth).
pub async fn run_https_ingress(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) {
    info!(
        port = listener.local_addr().map(|a| a.port()).unwrap_or(0),
        "HTTPS ingress listening"
    );
    loop {
        let (tcp, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "ingress accept failed");
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(tls)) => serve_router_on(tls, router).await,
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "ingress TLS handshake failed"),
                Err(_) => debug!(peer = %peer, "ingress TLS handshake timed out"),
            }
        });
    }
}

/// Plain-HTTP ingress listener, for services configured with `useHTTP`.
pub async fn run_http_ingress(listener: TcpListener, router: Router, shutdown: CancellationToken) {
    info!(
        port = listener.local_addr().map(|a| a.port()).unwrap_or(0),
        "HTTP ingress listening"
    );
    let shutdown_signal = async move { shutdown.cancelled().await };
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        warn!(error = %e, "HTTP ingress server error");
    }
}

async fn serve_router_on<S>(stream: S, router: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router);
    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(error = %e, "connection ended with error");
    }
}
