//! Controller configuration.
//!
//! Loaded from YAML (default `/app/config/config.yaml`, overridden with
//! `--configFile`). The file mirrors the struct hierarchy:
//!
//! ```yaml
//! caConfig:
//!   certFile: /app/secrets/ca/tls.crt
//!   keyFile: /app/secrets/ca/tls.key
//! serverNames: [controller.example.com]
//! agentListenPort: 9001
//! agentAdvertisePort: 9001
//! controlListenPort: 9002
//! serviceListenPort: 9003
//! prometheusListenPort: 9102
//! agentHostname: controller.example.com
//! controlURL: https://controller.example.com:9002
//! serviceURL: https://controller.example.com:9003
//! serviceAuth:
//!   currentKeyName: key1
//!   headerMutationKeyName: key2
//!   secretsPath: /app/secrets/serviceAuth
//! webhook: []
//! serviceConfig:
//!   incomingServices:
//!     - name: jenkins
//!       port: 9004
//!       useHTTP: false
//!       serviceType: http
//! insecureAgentConnections: false
//! ```
//!
//! Missing required keys fail startup with an error naming the key.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("while reading config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("while parsing config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("required config key '{0}' is missing or empty")]
    MissingKey(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    pub ca_config: CaConfig,
    /// DNS names placed in the controller's server certificate.
    pub server_names: Vec<String>,
    /// Port the agent tunnel listener binds (default 9001).
    #[serde(default = "default_agent_port")]
    pub agent_listen_port: u16,
    /// Port baked into generated agent manifests (default 9001).
    #[serde(default = "default_agent_port")]
    pub agent_advertise_port: u16,
    /// CNC REST port (default 9002).
    #[serde(default = "default_control_port")]
    pub control_listen_port: u16,
    /// The always-on `_services` ingress port (default 9003).
    #[serde(default = "default_service_port")]
    pub service_listen_port: u16,
    /// Prometheus `/metrics` + health port (default 9102).
    #[serde(default = "default_prometheus_port")]
    pub prometheus_listen_port: u16,
    /// Hostname agents are told to connect to.
    #[serde(default)]
    pub agent_hostname: String,
    /// Base URL reported in generated control credentials.
    #[serde(default)]
    pub control_url: String,
    /// Base URL reported in generated service credentials.
    #[serde(default)]
    pub service_url: String,
    pub service_auth: ServiceAuthConfig,
    #[serde(default)]
    pub webhook: Vec<String>,
    #[serde(default)]
    pub service_config: ServiceConfig,
    /// Accept plaintext agent streams. Testing only; production
    /// deployments must leave this off.
    #[serde(default)]
    pub insecure_agent_connections: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAuthConfig {
    /// `kid` of the key used to sign new service tokens. Must name a file
    /// in `secretsPath`.
    #[serde(default)]
    pub current_key_name: String,
    /// `kid` of the key protecting `x-spinnaker-user` header mutations.
    #[serde(default)]
    pub header_mutation_key_name: String,
    #[serde(default = "default_secrets_path")]
    pub secrets_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default)]
    pub incoming_services: Vec<IncomingServiceConfig>,
    /// Parsed and logged at startup; outgoing services are handled by a
    /// separate subsystem.
    #[serde(default)]
    pub outgoing_services: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingServiceConfig {
    pub name: String,
    pub port: u16,
    /// Serve this port without TLS.
    #[serde(rename = "useHTTP", default)]
    pub use_http: bool,
    #[serde(default)]
    pub service_type: String,
    /// Parsed for compatibility and logged at startup as a presence flag;
    /// service credentials are minted through the CNC surface instead.
    #[serde(default)]
    pub credentials: Option<String>,
    /// Parsed and logged at startup; Google API key auth is not handled
    /// here.
    #[serde(rename = "useGoogleAPIKey", default)]
    pub use_google_api_key: bool,
}

fn default_agent_port() -> u16 {
    9001
}
fn default_control_port() -> u16 {
    9002
}
fn default_service_port() -> u16 {
    9003
}
fn default_prometheus_port() -> u16 {
    9102
}
fn default_secrets_path() -> String {
    "/app/secrets/serviceAuth".to_string()
}

impl ControllerConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(Path::new(path)).map_err(|e| ConfigError::Read {
            path: path.to_string(),
            source: e,
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            ParseFailure::Yaml(source) => ConfigError::Parse {
                path: path.to_string(),
                source,
            },
            ParseFailure::Missing(key) => ConfigError::MissingKey(key),
        })?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self, ParseFailure> {
        let mut config: ControllerConfig = serde_yaml::from_str(content)?;
        if config.ca_config.cert_file.is_empty() {
            return Err(ParseFailure::Missing("caConfig.certFile"));
        }
        if config.ca_config.key_file.is_empty() {
            return Err(ParseFailure::Missing("caConfig.keyFile"));
        }
        if config.server_names.is_empty() {
            return Err(ParseFailure::Missing("serverNames"));
        }
        if config.service_auth.current_key_name.is_empty() {
            return Err(ParseFailure::Missing("serviceAuth.currentKeyName"));
        }
        if config.service_auth.header_mutation_key_name.is_empty() {
            return Err(ParseFailure::Missing("serviceAuth.headerMutationKeyName"));
        }
        if config.agent_hostname.is_empty() {
            config.agent_hostname = config.server_names[0].clone();
        }
        Ok(config)
    }
}

enum ParseFailure {
    Yaml(serde_yaml::Error),
    Missing(&'static str),
}

impl From<serde_yaml::Error> for ParseFailure {
    fn from(e: serde_yaml::Error) -> Self {
        ParseFailure::Yaml(e)
    }
}
