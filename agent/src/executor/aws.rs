//! AWS endpoint executor.
//!
//! AWS API calls are never proxied through the tunnel. Instead the
//! executor answers with the STS-style credential payload it holds, and
//! the caller talks to AWS directly with it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use culvert_wire::{
    Frame, HttpHeader, HttpTunnelResponse, OpenHttpTunnelRequest, TransactionRegistry,
    TunnelControl,
};

use super::Executor;
use crate::config::AwsEndpointConfig;

pub struct AwsExecutor {
    name: String,
    config: AwsEndpointConfig,
    registry: Arc<TransactionRegistry>,
}

impl AwsExecutor {
    pub fn new(
        name: String,
        config: AwsEndpointConfig,
        registry: Arc<TransactionRegistry>,
    ) -> Arc<AwsExecutor> {
        Arc::new(AwsExecutor {
            name,
            config,
            registry,
        })
    }
}

#[async_trait]
impl Executor for AwsExecutor {
    async fn execute(&self, req: OpenHttpTunnelRequest, outbound: mpsc::Sender<Frame>) {
        // Registered for symmetry with the HTTP executors; the response is
        // immediate, so a cancel can at most suppress the tail frames.
        let token = CancellationToken::new();
        if !self.registry.register_cancel(&req.id, token) {
            return;
        }

        let mut credential = json!({
            "credentialType": "aws",
            "name": self.name,
            "awsAccessKey": self.config.access_key_id,
            "awsSecretAccessKey": self.config.secret_access_key,
        });
        if let Some(account_id) = &self.config.account_id {
            credential["accountId"] = json!(account_id);
        }
        if let Some(assume_role) = &self.config.assume_role {
            credential["assumeRole"] = json!(assume_role);
        }
        let body = serde_json::to_vec(&credential).unwrap_or_default();

        let frames = [
            Frame::TunnelControl(TunnelControl::HttpTunnelResponse(HttpTunnelResponse {
                id: req.id.clone(),
                status: 200,
                headers: vec![HttpHeader {
                    name: "content-type".into(),
                    values: vec!["application/json".into()],
                }],
                content_length: body.len() as i64,
            })),
            Frame::chunk(&req.id, body),
            Frame::terminal_chunk(&req.id),
        ];
        for frame in frames {
            if outbound.send(frame).await.is_err() {
                break;
            }
        }

        self.registry.unregister_cancel(&req.id);
    }
}
