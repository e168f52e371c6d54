//! Command-and-control REST surface.
//!
//! Served on the control port behind mTLS; the accept loop has already
//! required a `control`-purpose peer certificate before a request reaches
//! these handlers. All responses are `application/json`; errors are
//! `{"error":{"message":"..."}}` with a 4xx/5xx status.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::ca::Authority;
use crate::config::ControllerConfig;
use crate::identity::{CertificateName, CertificatePurpose};
use crate::routes::RouteTable;
use crate::serviceauth::ServiceKeySet;

#[derive(Clone)]
pub struct CncState {
    pub config: Arc<ControllerConfig>,
    pub authority: Arc<Authority>,
    pub table: Arc<RouteTable>,
    pub keys: Arc<ServiceKeySet>,
}

pub fn router(state: CncState) -> Router {
    Router::new()
        .route("/generateKubectlComponents", post(generate_kubectl_components))
        .route(
            "/generateAgentManifestComponents",
            post(generate_agent_manifest_components),
        )
        .route("/generateServiceCredentials", post(generate_service_credentials))
        .route("/generateControlCredentials", post(generate_control_credentials))
        .route("/statistics", get(get_statistics))
        .with_state(state)
}

#[derive(Debug)]
pub struct CncError {
    status: StatusCode,
    message: String,
}

impl CncError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn invalid_field(field: &str) -> Self {
        Self::bad_request(format!("'{field}' is invalid"))
    }
}

impl IntoResponse for CncError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": {"message": self.message}})),
        )
            .into_response()
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, CncError> {
    serde_json::from_slice(body).map_err(|e| CncError::bad_request(e.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigRequest {
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigResponse {
    pub agent_name: String,
    pub name: String,
    #[serde(rename = "serverURL")]
    pub server_url: String,
    pub user_certificate: String,
    pub user_key: String,
    #[serde(rename = "caCert")]
    pub ca_cert: String,
}

/// `POST /generateKubectlComponents` — mint a `service` certificate for a
/// named kubectl user against one agent.
pub async fn generate_kubectl_components(
    State(state): State<CncState>,
    body: Bytes,
) -> Result<Json<KubeConfigResponse>, CncError> {
    let request: KubeConfigRequest = parse_body(&body)?;
    if request.agent_name.is_empty() {
        return Err(CncError::invalid_field("agentName"));
    }
    if request.name.is_empty() {
        return Err(CncError::invalid_field("name"));
    }

    let identity = CertificateName {
        purpose: CertificatePurpose::Service,
        agent: Some(request.agent_name.clone()),
        name: Some(request.name.clone()),
    };
    let bundle = state
        .authority
        .generate_certificate(&identity)
        .map_err(|e| CncError::internal(e.to_string()))?;

    info!(agent = %request.agent_name, name = %request.name, "generated kubectl components");
    Ok(Json(KubeConfigResponse {
        agent_name: request.agent_name,
        name: request.name,
        server_url: state.config.service_url.clone(),
        user_certificate: bundle.cert_base64(),
        user_key: bundle.key_base64(),
        ca_cert: state.authority.ca_cert_base64(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRequest {
    #[serde(default)]
    pub agent_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResponse {
    pub agent_name: String,
    pub server_hostname: String,
    pub server_port: u16,
    pub agent_certificate: String,
    pub agent_key: String,
    #[serde(rename = "caCert")]
    pub ca_cert: String,
}

/// `POST /generateAgentManifestComponents` — everything an agent manifest
/// needs to connect: its certificate, key, the CA, and where to dial.
pub async fn generate_agent_manifest_components(
    State(state): State<CncState>,
    body: Bytes,
) -> Result<Json<ManifestResponse>, CncError> {
    let request: ManifestRequest = parse_body(&body)?;
    if request.agent_name.is_empty() {
        return Err(CncError::invalid_field("agentName"));
    }

    let identity = CertificateName {
        purpose: CertificatePurpose::Agent,
        agent: Some(request.agent_name.clone()),
        name: None,
    };
    let bundle = state
        .authority
        .generate_certificate(&identity)
        .map_err(|e| CncError::internal(e.to_string()))?;

    info!(agent = %request.agent_name, "generated agent manifest components");
    Ok(Json(ManifestResponse {
        agent_name: request.agent_name,
        server_hostname: state.config.agent_hostname.clone(),
        server_port: state.config.agent_advertise_port,
        agent_certificate: bundle.cert_base64(),
        agent_key: bundle.key_base64(),
        ca_cert: state.authority.ca_cert_base64(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCredentialRequest {
    #[serde(default)]
    pub agent_name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCredentialResponse {
    pub agent_name: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "caCert")]
    pub ca_cert: String,
    pub credential_type: String,
    pub credential: serde_json::Value,
}

/// `POST /generateServiceCredentials` — mint a service-auth token pair for
/// a client of one tunneled service.
pub async fn generate_service_credentials(
    State(state): State<CncState>,
    body: Bytes,
) -> Result<Json<ServiceCredentialResponse>, CncError> {
    let request: ServiceCredentialRequest = parse_body(&body)?;
    if request.agent_name.is_empty() {
        return Err(CncError::invalid_field("agentName"));
    }
    if request.kind.is_empty() {
        return Err(CncError::invalid_field("type"));
    }
    if request.name.is_empty() {
        return Err(CncError::invalid_field("name"));
    }

    let token = state
        .keys
        .sign_service_token(&request.agent_name, &request.name, &request.kind)
        .map_err(|e| CncError::internal(e.to_string()))?;
    let username = format!("{}.{}", request.agent_name, request.name);

    let (credential_type, credential) = if request.kind == "aws" {
        (
            "aws".to_string(),
            json!({"awsAccessKey": username, "awsSecretAccessKey": token}),
        )
    } else {
        (
            "basic".to_string(),
            json!({"username": username, "password": token}),
        )
    };

    info!(agent = %request.agent_name, name = %request.name, kind = %request.kind, "generated service credentials");
    Ok(Json(ServiceCredentialResponse {
        agent_name: request.agent_name,
        name: request.name,
        kind: request.kind,
        url: state.config.service_url.clone(),
        ca_cert: state.authority.ca_cert_base64(),
        credential_type,
        credential,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCredentialsRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCredentialsResponse {
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub certificate: String,
    pub key: String,
    #[serde(rename = "caCert")]
    pub ca_cert: String,
}

/// `POST /generateControlCredentials` — mint a `control` certificate for
/// another operator of this surface.
pub async fn generate_control_credentials(
    State(state): State<CncState>,
    body: Bytes,
) -> Result<Json<ControlCredentialsResponse>, CncError> {
    let request: ControlCredentialsRequest = parse_body(&body)?;
    if request.name.is_empty() {
        return Err(CncError::invalid_field("name"));
    }

    let identity = CertificateName {
        purpose: CertificatePurpose::Control,
        agent: None,
        name: Some(request.name.clone()),
    };
    let bundle = state
        .authority
        .generate_certificate(&identity)
        .map_err(|e| CncError::internal(e.to_string()))?;

    info!(name = %request.name, "generated control credentials");
    Ok(Json(ControlCredentialsResponse {
        name: request.name,
        url: state.config.control_url.clone(),
        certificate: bundle.cert_base64(),
        key: bundle.key_base64(),
        ca_cert: state.authority.ca_cert_base64(),
    }))
}

/// `GET /statistics` — snapshot of every connected route.
pub async fn get_statistics(State(state): State<CncState>) -> Json<serde_json::Value> {
    let stats = state.table.statistics().await;
    Json(json!({"connectedAgents": stats}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_state() -> CncState {
        let yaml = r"
caConfig:
  certFile: /dev/null
  keyFile: /dev/null
serverNames: [controller.local]
agentAdvertisePort: 1234
agentHostname: agent.local
controlURL: https://control.local
serviceURL: https://service.local
serviceAuth:
  currentKeyName: key1
  headerMutationKeyName: key2
";
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        let (authority, _) = Authority::self_signed("culvert test CA").unwrap();
        let mut keys = HashMap::new();
        keys.insert("key1".to_string(), b"key one".to_vec());
        keys.insert("key2".to_string(), b"key two".to_vec());
        CncState {
            config: Arc::new(config),
            authority: Arc::new(authority),
            table: Arc::new(RouteTable::new()),
            keys: Arc::new(ServiceKeySet::from_keys(keys, "key1", "key2").unwrap()),
        }
    }

    fn body(v: serde_json::Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&v).unwrap())
    }

    #[tokio::test]
    async fn kubectl_components_round_trip() {
        let state = test_state();
        let Json(resp) = generate_kubectl_components(
            State(state),
            body(json!({"agentName": "agent smith", "name": "alice smith"})),
        )
        .await
        .unwrap();
        assert_eq!(resp.agent_name, "agent smith");
        assert_eq!(resp.name, "alice smith");
        assert_eq!(resp.server_url, "https://service.local");
        assert!(!resp.user_certificate.is_empty());
        assert!(!resp.user_key.is_empty());
        assert!(!resp.ca_cert.is_empty());
    }

    #[tokio::test]
    async fn kubectl_components_requires_names() {
        let state = test_state();
        let err = generate_kubectl_components(State(state.clone()), body(json!({})))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("is invalid"));

        let err = generate_kubectl_components(
            State(state),
            Bytes::from_static(b"badjson"),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn manifest_components_name_the_advertised_endpoint() {
        let state = test_state();
        let Json(resp) = generate_agent_manifest_components(
            State(state),
            body(json!({"agentName": "agent smith"})),
        )
        .await
        .unwrap();
        assert_eq!(resp.agent_name, "agent smith");
        assert_eq!(resp.server_hostname, "agent.local");
        assert_eq!(resp.server_port, 1234);
        assert!(!resp.agent_certificate.is_empty());
    }

    #[tokio::test]
    async fn service_credentials_are_basic_for_http_services() {
        let state = test_state();
        let Json(resp) = generate_service_credentials(
            State(state.clone()),
            body(json!({"agentName": "agent smith", "type": "jenkins", "name": "service smith"})),
        )
        .await
        .unwrap();
        assert_eq!(resp.credential_type, "basic");
        let creds = resp.credential.as_object().unwrap();
        assert_eq!(creds.len(), 2);
        assert!(creds.contains_key("username"));
        let password = creds["password"].as_str().unwrap();
        let claims = state.keys.validate_service_token(password).unwrap();
        assert_eq!(claims.a, "agent smith");
        assert_eq!(claims.n, "service smith");
        assert_eq!(claims.y, "jenkins");
    }

    #[tokio::test]
    async fn service_credentials_are_aws_shaped_for_aws() {
        let state = test_state();
        let Json(resp) = generate_service_credentials(
            State(state),
            body(json!({"agentName": "agent smith", "type": "aws", "name": "service smith"})),
        )
        .await
        .unwrap();
        assert_eq!(resp.credential_type, "aws");
        let creds = resp.credential.as_object().unwrap();
        assert_eq!(creds.len(), 2);
        assert!(creds.contains_key("awsAccessKey"));
        assert!(creds.contains_key("awsSecretAccessKey"));
    }

    #[tokio::test]
    async fn control_credentials_round_trip() {
        let state = test_state();
        let Json(resp) = generate_control_credentials(
            State(state),
            body(json!({"name": "contra smith"})),
        )
        .await
        .unwrap();
        assert_eq!(resp.name, "contra smith");
        assert_eq!(resp.url, "https://control.local");
        assert!(!resp.certificate.is_empty());
        assert!(!resp.key.is_empty());
    }

    #[tokio::test]
    async fn statistics_wraps_connected_agents() {
        let state = test_state();
        let Json(value) = get_statistics(State(state)).await;
        assert!(value.get("connectedAgents").unwrap().is_array());
    }
}
