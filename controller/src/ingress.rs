//! HTTP ingress: splices inbound client requests onto tunnel transactions.
//!
//! Two flavors of listener share this module:
//!
//! - fixed incoming-service ports, where a signed service-auth JWT in the
//!   `x-culvert-session` header names the `(agent, name, type)` triple;
//! - the `_services` port, where the URL prefix
//!   `/{agent}/{type}/{name}/rest-of-uri` names it.
//!
//! Request bodies are fully buffered; response bodies stream chunk by
//! chunk as frames arrive. A client that disconnects mid-stream causes a
//! `CancelRequest` toward the agent; a session that drains mid-stream
//! truncates the body (or answers 502 when headers were not yet written).

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use culvert_wire::{
    Frame, HttpHeader, OpenHttpTunnelRequest, TransactionRegistry, TunnelControl,
};

use crate::routes::{RouteTable, Search};
use crate::serviceauth::ServiceKeySet;

pub const SERVICE_TOKEN_HEADER: &str = "x-culvert-session";
const SPINNAKER_USER_HEADER: &str = "x-spinnaker-user";
const MAX_REQUEST_BODY: usize = 8 * 1024 * 1024;

/// Depth of the per-transaction response channel.
const RESPONSE_QUEUE_DEPTH: usize = 32;

#[derive(Clone)]
pub struct IngressState {
    pub table: Arc<RouteTable>,
    pub registry: Arc<TransactionRegistry>,
    pub keys: Arc<ServiceKeySet>,
    pub mode: IngressMode,
}

#[derive(Clone)]
pub enum IngressMode {
    /// A configured incoming-service port. The JWT still names the target;
    /// its `(name, type)` must match this service.
    Service { name: String, service_type: String },
    /// The `_services` port: target from the URL prefix.
    Prefixed,
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

enum Reject {
    /// Authentication failure; logged with a reason, empty 401 body.
    Unauthorized(&'static str),
    /// No live route (or the only routes are backpressured/unconfigured).
    BadGateway,
    RequestTooLarge,
    Internal,
}

impl IntoResponse for Reject {
    fn into_response(self) -> Response {
        match self {
            Reject::Unauthorized(reason) => {
                debug!(reason, "rejecting ingress request");
                StatusCode::UNAUTHORIZED.into_response()
            }
            Reject::BadGateway => StatusCode::BAD_GATEWAY.into_response(),
            Reject::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE.into_response(),
            Reject::Internal => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

pub async fn handle(State(state): State<IngressState>, req: Request) -> Response {
    match proxy(state, req).await {
        Ok(resp) => resp,
        Err(reject) => reject.into_response(),
    }
}

async fn proxy(state: IngressState, req: Request) -> Result<Response, Reject> {
    let (search, uri) = resolve_target(&state, &req)?;

    let (parts, body) = req.into_parts();
    let mut headers = collect_headers(&parts.headers);
    protect_user_header(&state.keys, &parts.headers, &mut headers);
    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|_| Reject::RequestTooLarge)?;

    let id = Uuid::new_v4().to_string();
    let token = CancellationToken::new();
    if !state.registry.register_cancel(&id, token.clone()) {
        // Duplicate UUID: contained programming error, drop this request.
        return Err(Reject::Internal);
    }
    let (tx, mut rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
    state.registry.register_responder(&id, tx);

    let open = Frame::TunnelControl(TunnelControl::OpenHttpTunnelRequest(
        OpenHttpTunnelRequest {
            id: id.clone(),
            name: search.endpoint_name.clone(),
            kind: search.endpoint_type.clone(),
            method: parts.method.as_str().to_string(),
            uri,
            headers,
            body: body.to_vec(),
        },
    ));

    let session_id = match state.table.send(&search, open).await {
        Ok(session_id) => session_id,
        Err(e) => {
            state.registry.unregister_cancel(&id);
            state.registry.unregister_responder(&id);
            warn!(target_route = %search, error = %e, "no route for ingress request");
            return Err(Reject::BadGateway);
        }
    };

    let guard = TransactionGuard {
        table: state.table.clone(),
        registry: state.registry.clone(),
        search: Search {
            session_id: Some(session_id.clone()),
            ..search
        },
        id: id.clone(),
        token: token.clone(),
        completed: false,
    };

    // The first frame drives the status line and response headers.
    let head = tokio::select! {
        () = token.cancelled() => {
            debug!(transaction_id = %id, session_id = %session_id, "session drained before response headers");
            return Err(Reject::BadGateway);
        }
        frame = rx.recv() => frame,
    };
    let head = match head {
        Some(TunnelControl::HttpTunnelResponse(head)) => head,
        Some(other) => {
            warn!(transaction_id = %id, frame = ?other, "expected response headers first");
            return Err(Reject::BadGateway);
        }
        None => return Err(Reject::BadGateway),
    };

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY));
    for header in &head.headers {
        if is_connection_header(&header.name) {
            continue;
        }
        for value in &header.values {
            builder = builder.header(header.name.as_str(), value.as_str());
        }
    }

    // From here the stream owns the guard; completion or drop of the body
    // finishes the transaction.
    let stream = futures::stream::unfold(
        BodyStreamState { rx, guard, token },
        |mut st| async move {
            loop {
                tokio::select! {
                    () = st.token.cancelled() => return None,
                    frame = st.rx.recv() => match frame {
                        None => return None,
                        Some(TunnelControl::HttpTunnelChunkedResponse { body, .. }) => {
                            if body.is_empty() {
                                st.guard.complete();
                                return None;
                            }
                            return Some((Ok::<Bytes, std::io::Error>(Bytes::from(body)), st));
                        }
                        // Trailing or duplicate frames after a cancel are
                        // tolerated and dropped.
                        Some(_) => continue,
                    }
                }
            }
        },
    );

    builder
        .body(Body::from_stream(stream))
        .map_err(|_| Reject::Internal)
}

struct BodyStreamState {
    rx: mpsc::Receiver<TunnelControl>,
    guard: TransactionGuard,
    token: CancellationToken,
}

/// Ties transaction cleanup to the response lifecycle. Dropped without
/// [`complete`](Self::complete) (client disconnect), it unregisters and
/// sends a `CancelRequest` toward the agent; after a session-side cancel
/// the request is skipped since the route is already gone.
struct TransactionGuard {
    table: Arc<RouteTable>,
    registry: Arc<TransactionRegistry>,
    search: Search,
    id: String,
    token: CancellationToken,
    completed: bool,
}

impl TransactionGuard {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.registry.unregister_cancel(&self.id);
        self.registry.unregister_responder(&self.id);
        if self.completed || self.token.is_cancelled() {
            return;
        }
        debug!(transaction_id = %self.id, "client gone mid-transaction, cancelling agentward");
        let table = self.table.clone();
        let search = self.search.clone();
        let id = self.id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = table.cancel(&search, &id).await {
                    debug!(transaction_id = %id, error = %e, "cancel after disconnect failed");
                }
            });
        }
    }
}

fn resolve_target(state: &IngressState, req: &Request) -> Result<(Search, String), Reject> {
    match &state.mode {
        IngressMode::Service { name, service_type } => {
            let token = req
                .headers()
                .get(SERVICE_TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .ok_or(Reject::Unauthorized("missing service token"))?;
            let claims = state
                .keys
                .validate_service_token(token)
                .map_err(|_| Reject::Unauthorized("invalid service token"))?;
            if &claims.n != name || &claims.y != service_type {
                return Err(Reject::Unauthorized("token names a different service"));
            }
            let uri = path_and_query(req.uri());
            Ok((
                Search {
                    name: claims.a,
                    endpoint_type: claims.y,
                    endpoint_name: claims.n,
                    session_id: None,
                },
                uri,
            ))
        }
        IngressMode::Prefixed => {
            let (agent, kind, name, uri) = parse_prefix(req.uri())
                .ok_or(Reject::Unauthorized("malformed service prefix"))?;
            Ok((
                Search {
                    name: agent,
                    endpoint_type: kind,
                    endpoint_name: name,
                    session_id: None,
                },
                uri,
            ))
        }
    }
}

/// `/{agent}/{type}/{name}/rest` on the `_services` port.
fn parse_prefix(uri: &Uri) -> Option<(String, String, String, String)> {
    let mut segments = uri.path().trim_start_matches('/').splitn(4, '/');
    let agent = segments.next().filter(|s| !s.is_empty())?;
    let kind = segments.next().filter(|s| !s.is_empty())?;
    let name = segments.next().filter(|s| !s.is_empty())?;
    let rest = segments.next().unwrap_or("");
    let mut rebuilt = format!("/{rest}");
    if let Some(query) = uri.query() {
        rebuilt.push('?');
        rebuilt.push_str(query);
    }
    Some((
        agent.to_string(),
        kind.to_string(),
        name.to_string(),
        rebuilt,
    ))
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Copy headers verbatim, preserving multi-value order.
fn collect_headers(map: &HeaderMap) -> Vec<HttpHeader> {
    map.keys()
        .map(|name| HttpHeader {
            name: name.as_str().to_string(),
            values: map
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok().map(str::to_string))
                .collect(),
        })
        .collect()
}

/// Replace `x-spinnaker-user` with a signed mutation token so the agent
/// side can verify the header was set by this controller.
fn protect_user_header(keys: &ServiceKeySet, raw: &HeaderMap, headers: &mut [HttpHeader]) {
    let Some(user) = raw
        .get(SPINNAKER_USER_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return;
    };
    match keys.sign_mutation_token(user) {
        Ok(token) => {
            if let Some(header) = headers
                .iter_mut()
                .find(|h| h.name.eq_ignore_ascii_case(SPINNAKER_USER_HEADER))
            {
                header.values = vec![token];
            }
        }
        Err(e) => warn!(error = %e, "could not sign user header mutation"),
    }
}

/// Connection-level headers that must not cross the tunnel boundary on the
/// way back to the client; the body is re-framed by the controller.
fn is_connection_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "content-length"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
