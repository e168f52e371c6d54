//! Minimal kubeconfig model.
//!
//! Only what the Kubernetes executor needs: the current context's cluster
//! address, trust material, and user credentials. Everything else in the
//! file is ignored.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum KubeConfigError {
    #[error("unable to parse kubeconfig: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("context '{0}' not found in kubeconfig")]
    UnknownContext(String),
    #[error("cluster '{0}' not found in kubeconfig")]
    UnknownCluster(String),
    #[error("user '{0}' not found in kubeconfig")]
    UnknownUser(String),
    #[error("invalid base64 in kubeconfig field {0}")]
    Base64(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubeConfig {
    #[serde(rename = "current-context", default)]
    pub current_context: String,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cluster {
    pub server: String,
    #[serde(rename = "certificate-authority-data", default)]
    pub certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    #[serde(rename = "client-certificate-data", default)]
    pub client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data", default)]
    pub client_key_data: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextRef {
    pub cluster: String,
    pub user: String,
}

impl KubeConfig {
    pub fn parse(content: &str) -> Result<KubeConfig, KubeConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Resolve the current context to its user and cluster.
    pub fn find_current(&self) -> Result<(&User, &Cluster), KubeConfigError> {
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)
            .ok_or_else(|| KubeConfigError::UnknownContext(self.current_context.clone()))?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| KubeConfigError::UnknownCluster(context.context.cluster.clone()))?;
        let user = self
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .map(|u| &u.user)
            .ok_or_else(|| KubeConfigError::UnknownUser(context.context.user.clone()))?;
        Ok((user, cluster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
apiVersion: v1
kind: Config
current-context: prod
clusters:
  - name: prod-cluster
    cluster:
      server: https://10.0.0.1:6443
      certificate-authority-data: Zm9v
contexts:
  - name: prod
    context:
      cluster: prod-cluster
      user: prod-user
  - name: other
    context:
      cluster: prod-cluster
      user: missing-user
users:
  - name: prod-user
    user:
      token: sekrit
";

    #[test]
    fn current_context_resolves() {
        let config = KubeConfig::parse(SAMPLE).unwrap();
        let (user, cluster) = config.find_current().unwrap();
        assert_eq!(cluster.server, "https://10.0.0.1:6443");
        assert_eq!(user.token.as_deref(), Some("sekrit"));
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some("Zm9v")
        );
    }

    #[test]
    fn missing_context_is_an_error() {
        let mut config = KubeConfig::parse(SAMPLE).unwrap();
        config.current_context = "nope".to_string();
        assert!(matches!(
            config.find_current(),
            Err(KubeConfigError::UnknownContext(_))
        ));
    }

    #[test]
    fn dangling_user_reference_is_an_error() {
        let mut config = KubeConfig::parse(SAMPLE).unwrap();
        config.current_context = "other".to_string();
        assert!(matches!(
            config.find_current(),
            Err(KubeConfigError::UnknownUser(_))
        ));
    }
}
