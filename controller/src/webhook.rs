//! Webhook notifier.
//!
//! When `webhook:` URLs are configured, every agent connect posts a JSON
//! event to each of them. Delivery is fire-and-forget; failures are logged
//! and never affect the session.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::routes::Route;

pub struct Notifier {
    client: reqwest::Client,
    urls: Vec<String>,
}

#[derive(Serialize)]
struct AgentEvent<'a> {
    event: &'static str,
    agent: &'a str,
    session: &'a str,
    version: &'a str,
    hostname: &'a str,
}

impl Notifier {
    /// Returns `None` when no URLs are configured.
    pub fn new(urls: Vec<String>) -> Option<Arc<Notifier>> {
        if urls.is_empty() {
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Some(Arc::new(Notifier { client, urls }))
    }

    pub fn agent_connected(&self, route: &Route) {
        let event = json!(AgentEvent {
            event: "agent-connected",
            agent: &route.name,
            session: &route.session_id,
            version: &route.version,
            hostname: &route.hostname,
        });
        for url in self.urls.clone() {
            let client = self.client.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = client.post(&url).json(&event).send().await {
                    warn!(url = %url, error = %e, "webhook delivery failed");
                }
            });
        }
    }
}
