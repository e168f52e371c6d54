//! Generic HTTP endpoint executor.
//!
//! Same call path as the Kubernetes executor but with a static base URL
//! and static credentials (basic or bearer) from the configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use culvert_wire::{Frame, OpenHttpTunnelRequest, TransactionRegistry};

use super::{run_http_request, Executor, OutboundCall};
use crate::config::{HttpCredentialType, HttpEndpointConfig};

pub struct HttpExecutor {
    config: HttpEndpointConfig,
    client: reqwest::Client,
    registry: Arc<TransactionRegistry>,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpExecutorError {
    #[error("endpoint has no url")]
    MissingUrl,
    #[error("cannot build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl HttpExecutor {
    pub fn new(
        config: HttpEndpointConfig,
        registry: Arc<TransactionRegistry>,
    ) -> Result<Arc<HttpExecutor>, HttpExecutorError> {
        if config.url.is_empty() {
            return Err(HttpExecutorError::MissingUrl);
        }
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Arc::new(HttpExecutor {
            config,
            client,
            registry,
        }))
    }

    fn credentials(&self) -> (Option<String>, Option<(String, String)>) {
        match self.config.credential_type {
            HttpCredentialType::None => (None, None),
            HttpCredentialType::Basic => (
                None,
                Some((self.config.username.clone(), self.config.password.clone())),
            ),
            HttpCredentialType::Bearer => (Some(self.config.token.clone()), None),
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, req: OpenHttpTunnelRequest, outbound: mpsc::Sender<Frame>) {
        let (bearer, basic) = self.credentials();
        run_http_request(
            OutboundCall {
                client: self.client.clone(),
                base_url: self.config.url.clone(),
                bearer,
                basic,
            },
            &self.registry,
            req,
            outbound,
        )
        .await;
    }
}
