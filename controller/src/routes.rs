//! Route table: the registry of live agent sessions.
//!
//! A route exists only between a successful `Hello` and stream closure.
//! Multiple sessions may share one agent name (rolling deploys, HA agents);
//! lookups pick uniformly at random among the sessions advertising a
//! matching `configured=true` endpoint. The table's lock is never held
//! across a blocking channel operation: delivery uses `try_send`, and a
//! full session channel surfaces as a backpressure error instead of a
//! stalled table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use culvert_wire::{Endpoint, Frame};

/// Capacity of a session's outbound frame channel. Absorbs bursts; a
/// session that cannot drain this fast is reported as backpressured.
const SEND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no routes connected for {0}")]
    NoRoute(Search),
    #[error("session {session} for agent {agent} is backpressured")]
    Backpressure { agent: String, session: String },
    #[error("session is not set on cancel search (coding error)")]
    SessionRequired,
    #[error("no route with session {session} for agent {agent}")]
    UnknownSession { agent: String, session: String },
}

/// Lookup key for route selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub name: String,
    pub endpoint_type: String,
    pub endpoint_name: String,
    /// Required for [`RouteTable::cancel`], ignored by send.
    pub session_id: Option<String>,
}

impl std::fmt::Display for Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.name, self.endpoint_type, self.endpoint_name
        )
    }
}

/// One live agent session.
pub struct Route {
    pub name: String,
    pub session_id: String,
    pub connection_type: &'static str,
    pub endpoints: Vec<Endpoint>,
    pub version: String,
    pub hostname: String,
    sender: mpsc::Sender<Frame>,
    /// Transaction ids currently open on this session; resolved against
    /// the process-wide transaction registry when the session drains.
    pub open_transactions: DashMap<String, ()>,
    closed: CancellationToken,
    sent_frames: AtomicU64,
    received_frames: AtomicU64,
}

/// Snapshot of one route's statistics, rendered to JSON by the CNC
/// statistics endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatistics {
    pub name: String,
    pub session: String,
    pub connection_type: &'static str,
    pub endpoints: Vec<Endpoint>,
    pub version: String,
    pub hostname: String,
    pub sent_frames: u64,
    pub received_frames: u64,
    pub open_transactions: usize,
}

impl Route {
    /// Build a route and hand back the receiving end of its send channel,
    /// which the session writer owns exclusively.
    pub fn new(
        name: String,
        session_id: String,
        endpoints: Vec<Endpoint>,
        version: String,
        hostname: String,
    ) -> (Arc<Route>, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(SEND_QUEUE_DEPTH);
        let route = Arc::new(Route {
            name,
            session_id,
            connection_type: "direct",
            endpoints,
            version,
            hostname,
            sender,
            open_transactions: DashMap::new(),
            closed: CancellationToken::new(),
            sent_frames: AtomicU64::new(0),
            received_frames: AtomicU64::new(0),
        });
        (route, receiver)
    }

    /// Queue a frame for the session writer without blocking.
    pub fn try_send(&self, frame: Frame) -> Result<(), RouteError> {
        self.sender
            .try_send(frame)
            .map_err(|_| RouteError::Backpressure {
                agent: self.name.clone(),
                session: self.session_id.clone(),
            })?;
        self.sent_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Ask the agent to abort transaction `id`.
    pub fn cancel(&self, id: &str) -> Result<(), RouteError> {
        self.try_send(Frame::cancel_request(id))
    }

    pub fn has_endpoint(&self, endpoint_type: &str, endpoint_name: &str) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.configured && e.kind == endpoint_type && e.name == endpoint_name)
    }

    /// Signal the session workers to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn note_received(&self) {
        self.received_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> RouteStatistics {
        RouteStatistics {
            name: self.name.clone(),
            session: self.session_id.clone(),
            connection_type: self.connection_type,
            endpoints: self.endpoints.clone(),
            version: self.version.clone(),
            hostname: self.hostname.clone(),
            sent_frames: self.sent_frames.load(Ordering::Relaxed),
            received_frames: self.received_frames.load(Ordering::Relaxed),
            open_transactions: self.open_transactions.len(),
        }
    }
}

#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Vec<Arc<Route>>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, route: Arc<Route>) {
        let mut routes = self.routes.write().await;
        let list = routes.entry(route.name.clone()).or_default();
        list.push(route.clone());
        info!(
            agent = %route.name,
            session_id = %route.session_id,
            path_count = list.len(),
            endpoint_count = route.endpoints.len(),
            "new route"
        );
        for endpoint in &route.endpoints {
            info!(
                agent = %route.name,
                session_id = %route.session_id,
                endpoint_type = %endpoint.kind,
                endpoint_name = %endpoint.name,
                endpoint_configured = endpoint.configured,
                "endpoint"
            );
        }
        metrics::gauge!("culvert_connected_routes", "agent" => route.name.clone()).increment(1.0);
    }

    /// Close `route` and drop exactly that session from the table. A route
    /// that is not present is logged, not fatal.
    pub async fn remove(&self, route: &Arc<Route>) {
        route.close();

        let mut routes = self.routes.write().await;
        let Some(list) = routes.get_mut(&route.name) else {
            error!(agent = %route.name, "no routes known by this name on remove");
            return;
        };
        let Some(index) = list
            .iter()
            .position(|r| r.session_id == route.session_id)
        else {
            error!(
                agent = %route.name,
                session_id = %route.session_id,
                "attempt to remove unknown route"
            );
            return;
        };
        list.swap_remove(index);
        let path_count = list.len();
        if list.is_empty() {
            routes.remove(&route.name);
        }
        metrics::gauge!("culvert_connected_routes", "agent" => route.name.clone()).decrement(1.0);
        info!(
            agent = %route.name,
            session_id = %route.session_id,
            path_count,
            "remove route"
        );
    }

    /// Select a route for `search` and queue `frame` on it. Returns the
    /// chosen session id.
    pub async fn send(&self, search: &Search, frame: Frame) -> Result<String, RouteError> {
        let routes = self.routes.read().await;
        let route = find_service(&routes, search)?;
        route.try_send(frame)?;
        Ok(route.session_id.clone())
    }

    /// Deliver a cancellation to the specific session named by the search.
    pub async fn cancel(&self, search: &Search, id: &str) -> Result<(), RouteError> {
        let session = search
            .session_id
            .as_deref()
            .ok_or(RouteError::SessionRequired)?;

        let routes = self.routes.read().await;
        let list = routes
            .get(&search.name)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| RouteError::NoRoute(search.clone()))?;
        let route = list
            .iter()
            .find(|r| r.session_id == session)
            .ok_or_else(|| RouteError::UnknownSession {
                agent: search.name.clone(),
                session: session.to_string(),
            })?;
        route.cancel(id)
    }

    /// Statistics for every connected route; opaque, intended for JSON.
    pub async fn statistics(&self) -> Vec<RouteStatistics> {
        let routes = self.routes.read().await;
        routes
            .values()
            .flat_map(|list| list.iter().map(|r| r.statistics()))
            .collect()
    }

    pub async fn connected_count(&self) -> usize {
        let routes = self.routes.read().await;
        routes.values().map(Vec::len).sum()
    }
}

fn find_service<'a>(
    routes: &'a HashMap<String, Vec<Arc<Route>>>,
    search: &Search,
) -> Result<&'a Arc<Route>, RouteError> {
    let list = routes
        .get(&search.name)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RouteError::NoRoute(search.clone()))?;
    let candidates: Vec<&Arc<Route>> = list
        .iter()
        .filter(|r| r.has_endpoint(&search.endpoint_type, &search.endpoint_name))
        .collect();
    if candidates.is_empty() {
        return Err(RouteError::NoRoute(search.clone()));
    }
    let selected = rand::thread_rng().gen_range(0..candidates.len());
    Ok(candidates[selected])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, kind: &str, configured: bool) -> Endpoint {
        Endpoint {
            name: name.into(),
            kind: kind.into(),
            configured,
            namespaces: vec![],
            account_id: None,
            assume_role: None,
            annotations: vec![],
        }
    }

    fn route(name: &str, session: &str, endpoints: Vec<Endpoint>) -> (Arc<Route>, mpsc::Receiver<Frame>) {
        Route::new(
            name.into(),
            session.into(),
            endpoints,
            "0.0.0".into(),
            "host".into(),
        )
    }

    fn search(name: &str) -> Search {
        Search {
            name: name.into(),
            endpoint_type: "kubernetes".into(),
            endpoint_name: "prod".into(),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn add_then_remove_restores_empty_table() {
        let table = RouteTable::new();
        let (r, _rx) = route("a1", "s1", vec![endpoint("prod", "kubernetes", true)]);
        table.add(r.clone()).await;
        assert_eq!(table.connected_count().await, 1);
        table.remove(&r).await;
        assert_eq!(table.connected_count().await, 0);
        assert!(table.statistics().await.is_empty());
    }

    #[tokio::test]
    async fn remove_of_unknown_route_is_a_noop() {
        let table = RouteTable::new();
        let (r, _rx) = route("a1", "s1", vec![]);
        table.remove(&r).await;
        assert_eq!(table.connected_count().await, 0);
    }

    #[tokio::test]
    async fn send_returns_the_selected_session() {
        let table = RouteTable::new();
        let (r, mut rx) = route("a1", "s1", vec![endpoint("prod", "kubernetes", true)]);
        table.add(r).await;

        let session = table.send(&search("a1"), Frame::ping(1)).await.unwrap();
        assert_eq!(session, "s1");
        assert_eq!(rx.recv().await, Some(Frame::ping(1)));
    }

    #[tokio::test]
    async fn unconfigured_endpoints_are_excluded_from_selection() {
        let table = RouteTable::new();
        let (r, mut rx) = route("a1", "s1", vec![endpoint("prod", "kubernetes", false)]);
        table.add(r).await;

        let err = table.send(&search("a1"), Frame::ping(1)).await.unwrap_err();
        assert!(matches!(err, RouteError::NoRoute(_)));
        assert!(rx.try_recv().is_err(), "no frame may reach the stream");
    }

    #[tokio::test]
    async fn unknown_agent_is_no_route() {
        let table = RouteTable::new();
        let err = table.send(&search("ghost"), Frame::ping(1)).await.unwrap_err();
        assert!(matches!(err, RouteError::NoRoute(_)));
    }

    #[tokio::test]
    async fn full_send_queue_is_backpressure_not_a_stall() {
        let table = RouteTable::new();
        let (r, _rx) = route("a1", "s1", vec![endpoint("prod", "kubernetes", true)]);
        table.add(r).await;

        let mut saw_backpressure = false;
        for i in 0..=SEND_QUEUE_DEPTH as u64 {
            match table.send(&search("a1"), Frame::ping(i)).await {
                Ok(_) => {}
                Err(RouteError::Backpressure { .. }) => {
                    saw_backpressure = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_backpressure);
    }

    #[tokio::test]
    async fn cancel_requires_a_session_id() {
        let table = RouteTable::new();
        let err = table.cancel(&search("a1"), "t1").await.unwrap_err();
        assert!(matches!(err, RouteError::SessionRequired));
    }

    #[tokio::test]
    async fn cancel_reaches_the_named_session() {
        let table = RouteTable::new();
        let (r1, mut rx1) = route("a1", "s1", vec![endpoint("prod", "kubernetes", true)]);
        let (r2, mut rx2) = route("a1", "s2", vec![endpoint("prod", "kubernetes", true)]);
        table.add(r1).await;
        table.add(r2).await;

        let mut s = search("a1");
        s.session_id = Some("s2".into());
        table.cancel(&s, "t1").await.unwrap();

        assert_eq!(rx2.recv().await, Some(Frame::cancel_request("t1")));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn selection_is_uniform_across_candidates() {
        let table = RouteTable::new();
        let mut receivers = Vec::new();
        for session in ["s1", "s2", "s3"] {
            let (r, rx) = route("a1", session, vec![endpoint("prod", "kubernetes", true)]);
            table.add(r).await;
            receivers.push(rx);
        }

        const DRAWS: usize = 10_000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..DRAWS {
            let session = table.send(&search("a1"), Frame::ping(0)).await.unwrap();
            *counts.entry(session).or_default() += 1;
            // Drain so the queues never fill.
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        }

        // Uniform across 3 candidates: each within 3 sigma of N/3.
        let expected = DRAWS as f64 / 3.0;
        let sigma = (DRAWS as f64 * (1.0 / 3.0) * (2.0 / 3.0)).sqrt();
        for session in ["s1", "s2", "s3"] {
            let n = *counts.get(session).unwrap_or(&0) as f64;
            assert!(
                (n - expected).abs() < 3.0 * sigma,
                "session {session} drew {n}, expected {expected} +/- {}",
                3.0 * sigma
            );
        }
    }
}
