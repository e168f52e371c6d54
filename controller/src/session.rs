//! Agent session state machine.
//!
//! One session per accepted tunnel stream. States:
//!
//! - `HANDSHAKE` — stream accepted, waiting for the agent's `Hello`
//!   (deadline 30 s; anything else closes the stream).
//! - `OPEN` — a reader and a writer task per session. The reader dispatches
//!   inbound frames and enforces liveness (3x the ping interval without a
//!   frame forces a drain); the writer owns the sink, drains the route's
//!   send channel, and emits pings.
//! - `DRAINING` — route removed from the table, every outstanding
//!   transaction on the session cancelled. In-flight HTTP clients get a
//!   502 if their headers were not yet written.
//! - `CLOSED` — workers exited.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

use culvert_wire::{CodecError, Frame, FrameCodec, Hello, TransactionRegistry, TunnelControl};

use crate::routes::{Route, RouteTable};
use crate::webhook::Notifier;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub handshake_deadline: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            handshake_deadline: Duration::from_secs(30),
        }
    }
}

/// Shared dependencies for every agent session.
pub struct SessionContext {
    pub table: Arc<RouteTable>,
    pub registry: Arc<TransactionRegistry>,
    pub config: SessionConfig,
    pub notifier: Option<Arc<Notifier>>,
}

/// How the agent's name was established.
pub enum SessionIdentity {
    /// From the verified peer certificate (the production path).
    Certified(String),
    /// Insecure mode only: take the name from the Hello's hostname.
    FromHello,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no Hello within the handshake deadline")]
    HandshakeTimeout,
    #[error("stream closed before Hello")]
    ClosedBeforeHello,
    #[error("first frame was not Hello")]
    UnexpectedFirstFrame,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Run one agent session to completion. Returns once the session reaches
/// `CLOSED`; the error reports why the stream ended when it ended abnormally.
pub async fn serve_agent_stream<S>(
    stream: S,
    identity: SessionIdentity,
    ctx: Arc<SessionContext>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(stream, FrameCodec::new());
    let (sink, mut frames) = framed.split();

    // HANDSHAKE: the first frame must be Hello, within the deadline.
    let hello = match timeout(ctx.config.handshake_deadline, frames.next()).await {
        Err(_) => return Err(SessionError::HandshakeTimeout),
        Ok(None) => return Err(SessionError::ClosedBeforeHello),
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(Some(Ok(Frame::Hello(hello)))) => hello,
        Ok(Some(Ok(_))) => return Err(SessionError::UnexpectedFirstFrame),
    };

    let agent_name = match identity {
        SessionIdentity::Certified(name) => name,
        SessionIdentity::FromHello => hello.hostname.clone(),
    };

    let session_id = Uuid::new_v4().to_string();
    let Hello {
        endpoints,
        version,
        hostname,
        ..
    } = hello;
    let (route, outbound_rx) = Route::new(
        agent_name.clone(),
        session_id.clone(),
        endpoints,
        version,
        hostname,
    );
    ctx.table.add(route.clone()).await;
    if let Some(notifier) = &ctx.notifier {
        notifier.agent_connected(&route);
    }

    // OPEN: writer owns the sink.
    let writer = tokio::spawn(run_writer(
        sink,
        outbound_rx,
        route.clone(),
        ctx.config.ping_interval,
    ));

    let liveness = ctx.config.ping_interval * 3;
    let closed = route.closed();
    let result = loop {
        tokio::select! {
            () = closed.cancelled() => break Ok(()),
            next = timeout(liveness, frames.next()) => match next {
                Err(_) => {
                    warn!(agent = %agent_name, session_id = %session_id, "no frame within liveness window, draining session");
                    break Ok(());
                }
                Ok(None) => {
                    info!(agent = %agent_name, session_id = %session_id, "agent stream closed");
                    break Ok(());
                }
                Ok(Some(Err(e))) => {
                    warn!(agent = %agent_name, session_id = %session_id, error = %e, "frame decode error, draining session");
                    break Err(SessionError::Codec(e));
                }
                Ok(Some(Ok(frame))) => {
                    route.note_received();
                    dispatch(&ctx, &route, frame).await;
                }
            }
        }
    };

    // DRAINING: drop the route, cancel everything still in flight.
    ctx.table.remove(&route).await;
    let outstanding: Vec<String> = route
        .open_transactions
        .iter()
        .map(|e| e.key().clone())
        .collect();
    if !outstanding.is_empty() {
        info!(
            agent = %agent_name,
            session_id = %session_id,
            count = outstanding.len(),
            "cancelling transactions for draining session"
        );
    }
    for id in outstanding {
        ctx.registry.cancel(&id);
    }
    route.open_transactions.clear();

    // CLOSED. The writer may be parked on a send to a peer that stopped
    // reading; abort rather than wait it out.
    writer.abort();
    let _ = writer.await;
    result
}

async fn run_writer<S>(
    mut sink: futures::stream::SplitSink<Framed<S, FrameCodec>, Frame>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    route: Arc<Route>,
    ping_interval: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so pings start one
    // interval in.
    ticker.tick().await;

    let closed = route.closed();
    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Frame::TunnelControl(TunnelControl::OpenHttpTunnelRequest(ref req)) = frame {
                    route.open_transactions.insert(req.id.clone(), ());
                }
                if sink.send(frame).await.is_err() {
                    route.close();
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Frame::ping(unix_millis())).await.is_err() {
                    route.close();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn dispatch(ctx: &SessionContext, route: &Arc<Route>, frame: Frame) {
    match frame {
        Frame::Ping { ts } => {
            if route.try_send(Frame::pong(unix_millis(), ts)).is_err() {
                debug!(agent = %route.name, "pong dropped, session backpressured");
            }
        }
        Frame::Pong { .. } => {
            // Receipt alone refreshed the liveness window.
        }
        Frame::Hello(_) => {
            warn!(agent = %route.name, session_id = %route.session_id, "duplicate Hello, ignoring");
        }
        Frame::TunnelControl(control) => dispatch_control(ctx, route, control).await,
        Frame::Unknown => {
            warn!(agent = %route.name, session_id = %route.session_id, "unknown frame type, dropping");
        }
    }
}

async fn dispatch_control(ctx: &SessionContext, route: &Arc<Route>, control: TunnelControl) {
    match control {
        TunnelControl::HttpTunnelResponse(ref resp) => {
            let id = resp.id.clone();
            ctx.registry.respond(&id, control).await;
        }
        TunnelControl::HttpTunnelChunkedResponse { ref id, ref body } => {
            let id = id.clone();
            let terminal = body.is_empty();
            ctx.registry.respond(&id, control).await;
            if terminal {
                route.open_transactions.remove(&id);
            }
        }
        TunnelControl::CancelRequest { ref id } => {
            debug!(agent = %route.name, transaction_id = %id, "agent cancelled transaction");
            ctx.registry.cancel(id);
        }
        TunnelControl::OpenHttpTunnelRequest(req) => {
            warn!(
                agent = %route.name,
                transaction_id = %req.id,
                "agent sent an open request, dropping"
            );
        }
        TunnelControl::Unknown => {
            warn!(agent = %route.name, "unknown tunnel control, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_wire::{Endpoint, HttpTunnelResponse, OpenHttpTunnelRequest};
    use tokio_util::sync::CancellationToken;

    fn test_ctx(config: SessionConfig) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            table: Arc::new(RouteTable::new()),
            registry: Arc::new(TransactionRegistry::new()),
            config,
            notifier: None,
        })
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_millis(200),
            handshake_deadline: Duration::from_millis(100),
        }
    }

    fn hello_frame() -> Frame {
        Frame::Hello(Hello {
            endpoints: vec![Endpoint {
                name: "prod".into(),
                kind: "kubernetes".into(),
                configured: true,
                namespaces: vec![],
                account_id: None,
                assume_role: None,
                annotations: vec![],
            }],
            version: "0.0.0".into(),
            hostname: "agent-host".into(),
            client_cert: None,
            annotations: vec![],
        })
    }

    #[tokio::test]
    async fn no_hello_within_deadline_registers_no_route() {
        let ctx = test_ctx(quick_config());
        let (client, server) = tokio::io::duplex(4096);

        let result = serve_agent_stream(
            server,
            SessionIdentity::Certified("a1".into()),
            ctx.clone(),
        )
        .await;
        assert!(matches!(result, Err(SessionError::HandshakeTimeout)));
        assert_eq!(ctx.table.connected_count().await, 0);
        drop(client);
    }

    #[tokio::test]
    async fn hello_registers_route_and_close_removes_it() {
        let ctx = test_ctx(quick_config());
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(serve_agent_stream(
            server,
            SessionIdentity::Certified("a1".into()),
            ctx.clone(),
        ));

        let mut agent = Framed::new(client, FrameCodec::new());
        agent.send(hello_frame()).await.unwrap();

        // Wait for the route to appear.
        for _ in 0..50 {
            if ctx.table.connected_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = ctx.table.statistics().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "a1");
        assert_eq!(stats[0].hostname, "agent-host");

        drop(agent);
        session.await.unwrap().unwrap();
        assert_eq!(ctx.table.connected_count().await, 0);
    }

    #[tokio::test]
    async fn response_frames_reach_the_registered_transaction() {
        let ctx = test_ctx(quick_config());
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(serve_agent_stream(
            server,
            SessionIdentity::Certified("a1".into()),
            ctx.clone(),
        ));

        let mut agent = Framed::new(client, FrameCodec::new());
        agent.send(hello_frame()).await.unwrap();
        for _ in 0..50 {
            if ctx.table.connected_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Ingress side: register a transaction, then open it on the stream.
        let (tx, mut rx) = mpsc::channel(8);
        ctx.registry.register_cancel("t1", CancellationToken::new());
        ctx.registry.register_responder("t1", tx);
        let search = crate::routes::Search {
            name: "a1".into(),
            endpoint_type: "kubernetes".into(),
            endpoint_name: "prod".into(),
            session_id: None,
        };
        let open = Frame::TunnelControl(TunnelControl::OpenHttpTunnelRequest(
            OpenHttpTunnelRequest {
                id: "t1".into(),
                name: "prod".into(),
                kind: "kubernetes".into(),
                method: "GET".into(),
                uri: "/v1/pods".into(),
                headers: vec![],
                body: vec![],
            },
        ));
        ctx.table.send(&search, open).await.unwrap();

        // The agent observes the open request (pings may interleave)...
        let req = loop {
            match agent.next().await.unwrap().unwrap() {
                Frame::TunnelControl(TunnelControl::OpenHttpTunnelRequest(req)) => break req,
                Frame::Ping { .. } => continue,
                other => panic!("expected open request, got {other:?}"),
            }
        };
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/v1/pods");

        // ...and answers with response, chunk, terminal chunk.
        agent
            .send(Frame::TunnelControl(TunnelControl::HttpTunnelResponse(
                HttpTunnelResponse {
                    id: "t1".into(),
                    status: 200,
                    headers: vec![],
                    content_length: 11,
                },
            )))
            .await
            .unwrap();
        agent
            .send(Frame::chunk("t1", b"{\"items\":[]}".to_vec()))
            .await
            .unwrap();
        agent.send(Frame::terminal_chunk("t1")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TunnelControl::HttpTunnelResponse(ref r) if r.status == 200));
        let second = rx.recv().await.unwrap();
        assert!(
            matches!(second, TunnelControl::HttpTunnelChunkedResponse { ref body, .. } if !body.is_empty())
        );
        let third = rx.recv().await.unwrap();
        assert!(
            matches!(third, TunnelControl::HttpTunnelChunkedResponse { ref body, .. } if body.is_empty())
        );

        drop(agent);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn draining_session_cancels_outstanding_transactions() {
        let ctx = test_ctx(quick_config());
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(serve_agent_stream(
            server,
            SessionIdentity::Certified("a1".into()),
            ctx.clone(),
        ));

        let mut agent = Framed::new(client, FrameCodec::new());
        agent.send(hello_frame()).await.unwrap();
        for _ in 0..50 {
            if ctx.table.connected_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let token = CancellationToken::new();
        ctx.registry.register_cancel("t1", token.clone());
        let (tx, _keep_rx) = mpsc::channel(8);
        ctx.registry.register_responder("t1", tx);
        let search = crate::routes::Search {
            name: "a1".into(),
            endpoint_type: "kubernetes".into(),
            endpoint_name: "prod".into(),
            session_id: None,
        };
        let open = Frame::TunnelControl(TunnelControl::OpenHttpTunnelRequest(
            OpenHttpTunnelRequest {
                id: "t1".into(),
                name: "prod".into(),
                kind: "kubernetes".into(),
                method: "GET".into(),
                uri: "/".into(),
                headers: vec![],
                body: vec![],
            },
        ));
        ctx.table.send(&search, open).await.unwrap();
        // Let the writer pick up the open request before the disconnect.
        loop {
            match agent.next().await.unwrap().unwrap() {
                Frame::TunnelControl(TunnelControl::OpenHttpTunnelRequest(_)) => break,
                _ => continue,
            }
        }

        drop(agent);
        session.await.unwrap().unwrap();
        assert!(token.is_cancelled());
        assert_eq!(ctx.table.connected_count().await, 0);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let ctx = test_ctx(quick_config());
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(serve_agent_stream(
            server,
            SessionIdentity::FromHello,
            ctx.clone(),
        ));

        let mut agent = Framed::new(client, FrameCodec::new());
        agent.send(hello_frame()).await.unwrap();
        agent.send(Frame::ping(1234)).await.unwrap();

        let mut saw_pong = false;
        for _ in 0..10 {
            match agent.next().await {
                Some(Ok(Frame::Pong { echoed_ts, .. })) => {
                    assert_eq!(echoed_ts, 1234);
                    saw_pong = true;
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(saw_pong);

        // Insecure identity comes from the Hello hostname.
        let stats = ctx.table.statistics().await;
        assert_eq!(stats[0].name, "agent-host");

        drop(agent);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn liveness_window_drains_a_silent_session() {
        let config = SessionConfig {
            ping_interval: Duration::from_millis(50),
            handshake_deadline: Duration::from_millis(500),
        };
        let ctx = test_ctx(config);
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(serve_agent_stream(
            server,
            SessionIdentity::Certified("a1".into()),
            ctx.clone(),
        ));

        let mut agent = Framed::new(client, FrameCodec::new());
        agent.send(hello_frame()).await.unwrap();

        // Stay silent; after 3x the ping interval the controller drains the
        // session even though the socket is still open.
        session.await.unwrap().unwrap();
        assert_eq!(ctx.table.connected_count().await, 0);
        drop(agent);
    }
}
