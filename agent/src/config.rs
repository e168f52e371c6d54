//! Agent configuration.
//!
//! Loaded from YAML (default `/app/config/agent.yaml`):
//!
//! ```yaml
//! controllerHostname: controller.example.com:9001
//! caCertFile: /app/secrets/ca.pem
//! certFile: /app/secrets/agent.pem
//! keyFile: /app/secrets/agent.key
//! insecureControllerConnection: false
//! hostname: agent-1
//! endpoints:
//!   - name: prod
//!     type: kubernetes
//!     kubernetes:
//!       kubeConfig: /app/config/kubeconfig.yaml
//!   - name: billing
//!     type: aws
//!     aws:
//!       accessKeyId: AKIA...
//!       secretAccessKey: ...
//!       accountId: "123456789012"
//!   - name: jenkins
//!     type: http
//!     http:
//!       url: https://jenkins.internal:8443
//!       credentialType: basic
//!       username: culvert
//!       password: hunter2
//! ```

use serde::Deserialize;

use culvert_wire::Annotation;

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
pub struct AgentConfig {
    /// `host:port` of the controller's agent tunnel port.
    pub controller_hostname: String,
    #[serde(default)]
    pub ca_cert_file: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    /// Connect without TLS. Testing only.
    #[serde(default)]
    pub insecure_controller_connection: bool,
    /// Advertised in the Hello; defaults to `$HOSTNAME`.
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub kubernetes: Option<KubernetesEndpointConfig>,
    #[serde(default)]
    pub aws: Option<AwsEndpointConfig>,
    #[serde(default)]
    pub http: Option<HttpEndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesEndpointConfig {
    #[serde(default = "default_kubeconfig_path")]
    pub kube_config: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsEndpointConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub assume_role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpointConfig {
    pub url: String,
    #[serde(default)]
    pub credential_type: HttpCredentialType,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpCredentialType {
    #[default]
    None,
    Basic,
    Bearer,
}

fn default_kubeconfig_path() -> String {
    "/app/config/kubeconfig.yaml".to_string()
}

impl AgentConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
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
        let mut config: AgentConfig = serde_yaml::from_str(content)?;
        if config.controller_hostname.is_empty() {
            return Err(ParseFailure::Missing("controllerHostname"));
        }
        if !config.insecure_controller_connection {
            if config.ca_cert_file.is_empty() {
                return Err(ParseFailure::Missing("caCertFile"));
            }
            if config.cert_file.is_empty() {
                return Err(ParseFailure::Missing("certFile"));
            }
            if config.key_file.is_empty() {
                return Err(ParseFailure::Missing("keyFile"));
            }
        }
        if config.hostname.is_empty() {
            config.hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_parse_with_type_specific_blocks() {
        let yaml = r"
controllerHostname: controller.local:9001
insecureControllerConnection: true
endpoints:
  - name: prod
    type: kubernetes
    kubernetes:
      kubeConfig: /tmp/kubeconfig.yaml
  - name: billing
    type: aws
    aws:
      accessKeyId: AKIAEXAMPLE
      secretAccessKey: secret
  - name: jenkins
    type: http
    http:
      url: https://jenkins.internal
      credentialType: bearer
      token: tok
";
        let config = AgentConfig::parse(yaml).ok().unwrap();
        assert_eq!(config.endpoints.len(), 3);
        assert_eq!(
            config.endpoints[0].kubernetes.as_ref().unwrap().kube_config,
            "/tmp/kubeconfig.yaml"
        );
        assert_eq!(
            config.endpoints[2].http.as_ref().unwrap().credential_type,
            HttpCredentialType::Bearer
        );
    }

    #[test]
    fn secure_mode_requires_cert_material() {
        let yaml = "controllerHostname: controller.local:9001\n";
        match AgentConfig::parse(yaml) {
            Err(ParseFailure::Missing(key)) => assert_eq!(key, "caCertFile"),
            _ => panic!("expected missing-key failure"),
        }
    }
}
