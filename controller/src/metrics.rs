//! Prometheus exposition and health probes.
//!
//! One port serves `/metrics` plus `/` and `/health`, both of which return
//! `200 {}` for load-balancer liveness checks.

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global metrics recorder. Call once at startup, before any
/// counter or gauge is touched.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/", get(healthcheck))
        .route("/health", get(healthcheck))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn healthcheck() -> impl IntoResponse {
    ([(CONTENT_TYPE, "application/json")], "{}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthcheck_is_an_empty_json_object() {
        let resp = healthcheck().await.into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        let body = axum::body::to_bytes(resp.into_body(), 16).await.unwrap();
        assert_eq!(&body[..], b"{}");
    }
}
