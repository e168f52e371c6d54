//! Endpoint executors.
//!
//! An executor fulfills tunneled requests for one advertised endpoint. The
//! set is fixed at startup from the agent's configuration; dispatch picks
//! the executor by the endpoint `(type, name)` pair from each
//! `OpenHttpTunnelRequest`. A request for an endpoint with no usable
//! executor is answered with a synthesized `502` response.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use culvert_wire::{
    bad_gateway_frames, Endpoint, Frame, HttpHeader, HttpTunnelResponse, OpenHttpTunnelRequest,
    TransactionRegistry, TunnelControl,
};

use crate::config::EndpointConfig;

pub mod aws;
pub mod http;
pub mod kubernetes;

/// Response bodies are re-framed into chunks of at most this size.
pub const CHUNK_SIZE: usize = 10 * 1024;

#[async_trait]
pub trait Executor: Send + Sync {
    /// Fulfill one tunneled request, writing response frames to `outbound`.
    async fn execute(&self, req: OpenHttpTunnelRequest, outbound: mpsc::Sender<Frame>);
}

/// The agent's fixed set of executors, plus the endpoint inventory it
/// advertises in its Hello (including entries that failed to configure,
/// advertised with `configured=false`).
pub struct ExecutorRegistry {
    executors: HashMap<(String, String), Arc<dyn Executor>>,
    inventory: Vec<Endpoint>,
}

impl ExecutorRegistry {
    pub async fn from_config(
        endpoints: &[EndpointConfig],
        registry: Arc<TransactionRegistry>,
    ) -> ExecutorRegistry {
        let mut executors: HashMap<(String, String), Arc<dyn Executor>> = HashMap::new();
        let mut inventory = Vec::new();

        for endpoint in endpoints {
            let built: Option<Arc<dyn Executor>> = match endpoint.kind.as_str() {
                "kubernetes" => match &endpoint.kubernetes {
                    Some(config) => {
                        match kubernetes::KubernetesExecutor::new(
                            endpoint.name.clone(),
                            config.kube_config.clone(),
                            registry.clone(),
                        )
                        .await
                        {
                            Ok(executor) => Some(executor),
                            Err(e) => {
                                warn!(
                                    endpoint = %endpoint.name,
                                    error = %e,
                                    "kubernetes endpoint failed to configure"
                                );
                                None
                            }
                        }
                    }
                    None => None,
                },
                "aws" => endpoint.aws.as_ref().map(|config| {
                    aws::AwsExecutor::new(endpoint.name.clone(), config.clone(), registry.clone())
                        as Arc<dyn Executor>
                }),
                "http" => match &endpoint.http {
                    Some(config) => {
                        match http::HttpExecutor::new(config.clone(), registry.clone()) {
                            Ok(executor) => Some(executor),
                            Err(e) => {
                                warn!(
                                    endpoint = %endpoint.name,
                                    error = %e,
                                    "http endpoint failed to configure"
                                );
                                None
                            }
                        }
                    }
                    None => None,
                },
                other => {
                    warn!(endpoint = %endpoint.name, endpoint_type = %other, "unknown endpoint type");
                    None
                }
            };

            let configured = built.is_some();
            if let Some(executor) = built {
                executors.insert((endpoint.kind.clone(), endpoint.name.clone()), executor);
            }
            info!(
                endpoint = %endpoint.name,
                endpoint_type = %endpoint.kind,
                configured,
                "endpoint registered"
            );
            inventory.push(Endpoint {
                name: endpoint.name.clone(),
                kind: endpoint.kind.clone(),
                configured,
                namespaces: endpoint.namespaces.clone(),
                account_id: endpoint
                    .aws
                    .as_ref()
                    .and_then(|aws| aws.account_id.clone()),
                assume_role: endpoint
                    .aws
                    .as_ref()
                    .and_then(|aws| aws.assume_role.clone()),
                annotations: endpoint.annotations.clone(),
            });
        }

        ExecutorRegistry {
            executors,
            inventory,
        }
    }

    /// The endpoint list advertised in the Hello.
    pub fn inventory(&self) -> Vec<Endpoint> {
        self.inventory.clone()
    }

    /// Route a tunneled request to its executor. Spawns the execution so
    /// the stream reader is never blocked behind an outbound HTTP call.
    pub fn dispatch(&self, req: OpenHttpTunnelRequest, outbound: mpsc::Sender<Frame>) {
        let key = (req.kind.clone(), req.name.clone());
        match self.executors.get(&key) {
            Some(executor) => {
                let executor = executor.clone();
                tokio::spawn(async move {
                    executor.execute(req, outbound).await;
                });
            }
            None => {
                warn!(
                    endpoint = %req.name,
                    endpoint_type = %req.kind,
                    transaction_id = %req.id,
                    "request for unknown or unconfigured endpoint"
                );
                tokio::spawn(async move {
                    for frame in bad_gateway_frames(&req.id) {
                        if outbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    }
}

/// Shared outbound-call shape used by the kubernetes and http executors.
pub(crate) struct OutboundCall {
    pub client: reqwest::Client,
    pub base_url: String,
    /// Overrides any tunneled `Authorization` header when set.
    pub bearer: Option<String>,
    pub basic: Option<(String, String)>,
}

/// Perform the outbound HTTP call for one transaction and stream the
/// response back as frames. Registers a cancel handle for the transaction
/// for its whole duration; cancellation aborts the call mid-flight.
pub(crate) async fn run_http_request(
    call: OutboundCall,
    registry: &TransactionRegistry,
    req: OpenHttpTunnelRequest,
    outbound: mpsc::Sender<Frame>,
) {
    let token = CancellationToken::new();
    if !registry.register_cancel(&req.id, token.clone()) {
        // Duplicate id is a contained programming error; drop the request.
        return;
    }
    perform_call(&call, &token, &req, &outbound).await;
    registry.unregister_cancel(&req.id);
}

async fn perform_call(
    call: &OutboundCall,
    token: &CancellationToken,
    req: &OpenHttpTunnelRequest,
    outbound: &mpsc::Sender<Frame>,
) {
    let Ok(method) = reqwest::Method::from_bytes(req.method.as_bytes()) else {
        send_bad_gateway(outbound, &req.id).await;
        return;
    };
    let url = format!("{}{}", call.base_url.trim_end_matches('/'), req.uri);

    let mut builder = call.client.request(method, &url);
    let override_auth = call.bearer.is_some() || call.basic.is_some();
    for header in &req.headers {
        if skip_outbound_header(&header.name, override_auth) {
            continue;
        }
        for value in &header.values {
            builder = builder.header(header.name.as_str(), value.as_str());
        }
    }
    if let Some((username, password)) = &call.basic {
        builder = builder.basic_auth(username, Some(password));
    }
    if let Some(bearer) = &call.bearer {
        builder = builder.bearer_auth(bearer);
    }
    builder = builder.body(req.body.clone());

    debug!(transaction_id = %req.id, method = %req.method, url = %url, "sending outbound request");
    let response = tokio::select! {
        () = token.cancelled() => {
            debug!(transaction_id = %req.id, "cancelled before outbound response");
            return;
        }
        response = builder.send() => match response {
            Ok(response) => response,
            Err(e) => {
                warn!(transaction_id = %req.id, url = %url, error = %e, "outbound request failed");
                send_bad_gateway(outbound, &req.id).await;
                return;
            }
        }
    };

    let head = Frame::TunnelControl(TunnelControl::HttpTunnelResponse(HttpTunnelResponse {
        id: req.id.clone(),
        status: response.status().as_u16(),
        headers: headers_to_wire(response.headers()),
        content_length: response.content_length().map_or(-1, |n| n as i64),
    }));
    if outbound.send(head).await.is_err() {
        return;
    }

    use futures::StreamExt;
    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            () = token.cancelled() => {
                debug!(transaction_id = %req.id, "cancelled mid-body");
                return;
            }
            chunk = stream.next() => match chunk {
                None => {
                    let _ = outbound.send(Frame::terminal_chunk(&req.id)).await;
                    return;
                }
                Some(Ok(bytes)) => {
                    for piece in split_chunks(&bytes, CHUNK_SIZE) {
                        if outbound.send(Frame::chunk(&req.id, piece)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(transaction_id = %req.id, error = %e, "outbound body read failed");
                    let _ = outbound.send(Frame::terminal_chunk(&req.id)).await;
                    return;
                }
            }
        }
    }
}

async fn send_bad_gateway(outbound: &mpsc::Sender<Frame>, id: &str) {
    for frame in bad_gateway_frames(id) {
        if outbound.send(frame).await.is_err() {
            break;
        }
    }
}

/// Re-chunk a buffer into pieces of at most `size` bytes. A zero-length
/// input produces no pieces (the empty chunk is reserved for termination).
pub(crate) fn split_chunks(bytes: &[u8], size: usize) -> Vec<Vec<u8>> {
    bytes.chunks(size).map(<[u8]>::to_vec).collect()
}

fn headers_to_wire(map: &reqwest::header::HeaderMap) -> Vec<HttpHeader> {
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

/// Headers the outbound client owns: the connection-level set plus
/// `authorization` whenever the executor injects its own credentials.
fn skip_outbound_header(name: &str, override_auth: bool) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "host" | "connection" | "content-length" | "transfer-encoding" | "keep-alive"
    ) || (override_auth && lower == "authorization")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AwsEndpointConfig, EndpointConfig};

    fn aws_endpoint(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            kind: "aws".into(),
            namespaces: vec![],
            annotations: vec![],
            kubernetes: None,
            aws: Some(AwsEndpointConfig {
                access_key_id: "AKIAEXAMPLE".into(),
                secret_access_key: "secret".into(),
                account_id: Some("123456789012".into()),
                assume_role: None,
            }),
            http: None,
        }
    }

    #[tokio::test]
    async fn inventory_reflects_configured_state() {
        let registry = Arc::new(TransactionRegistry::new());
        let endpoints = vec![
            aws_endpoint("billing"),
            EndpointConfig {
                name: "mystery".into(),
                kind: "carrier-pigeon".into(),
                namespaces: vec![],
                annotations: vec![],
                kubernetes: None,
                aws: None,
                http: None,
            },
        ];
        let executors = ExecutorRegistry::from_config(&endpoints, registry).await;
        let inventory = executors.inventory();
        assert_eq!(inventory.len(), 2);
        assert!(inventory[0].configured);
        assert_eq!(inventory[0].account_id.as_deref(), Some("123456789012"));
        assert!(!inventory[1].configured);
    }

    #[tokio::test]
    async fn dispatch_to_unknown_endpoint_synthesizes_a_502() {
        let registry = Arc::new(TransactionRegistry::new());
        let executors = ExecutorRegistry::from_config(&[], registry).await;
        let (tx, mut rx) = mpsc::channel(8);

        executors.dispatch(
            OpenHttpTunnelRequest {
                id: "t1".into(),
                name: "ghost".into(),
                kind: "kubernetes".into(),
                method: "GET".into(),
                uri: "/".into(),
                headers: vec![],
                body: vec![],
            },
            tx,
        );

        let first = rx.recv().await.unwrap();
        let Frame::TunnelControl(TunnelControl::HttpTunnelResponse(head)) = first else {
            panic!("expected response frame");
        };
        assert_eq!(head.status, 502);
        assert_eq!(rx.recv().await, Some(Frame::terminal_chunk("t1")));
    }

    #[test]
    fn chunks_split_at_the_boundary() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 5];
        let pieces = split_chunks(&data, CHUNK_SIZE);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), CHUNK_SIZE);
        assert_eq!(pieces[2].len(), 5);

        assert!(split_chunks(&[], CHUNK_SIZE).is_empty());
    }

    #[test]
    fn injected_credentials_shadow_the_tunneled_authorization_header() {
        assert!(skip_outbound_header("Authorization", true));
        assert!(!skip_outbound_header("Authorization", false));
        assert!(skip_outbound_header("Host", false));
        assert!(!skip_outbound_header("x-custom", true));
    }
}
