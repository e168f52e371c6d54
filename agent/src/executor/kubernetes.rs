//! Kubernetes endpoint executor.
//!
//! Credentials come from a mounted kubeconfig when one exists, otherwise
//! from the in-pod service account. A background worker re-reads them every
//! ten minutes (with jitter) and swaps the context atomically when the
//! loaded value differs structurally; each request snapshots the current
//! context under the read lock so a concurrent refresh can never tear it.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use async_trait::async_trait;
use culvert_wire::{Frame, OpenHttpTunnelRequest, TransactionRegistry};

use super::{run_http_request, Executor, OutboundCall};
use crate::kubeconfig::KubeConfig;

const REFRESH_INTERVAL: Duration = Duration::from_secs(600);
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, thiserror::Error)]
pub enum KubeContextError {
    #[error(transparent)]
    KubeConfig(#[from] crate::kubeconfig::KubeConfigError),
    #[error("no kubeconfig and no service account found: {0}")]
    NoCredentials(String),
    #[error("unable to locate API server from KUBERNETES_SERVICE_{0} environment variable")]
    NoApiServer(&'static str),
    #[error("invalid base64 in kubeconfig field {0}")]
    Base64(&'static str),
}

/// Everything needed to call one API server. Compared structurally on
/// refresh; the PEM byte comparison covers CA and client cert changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeContext {
    pub username: String,
    pub server_url: String,
    pub server_ca_pem: Option<Vec<u8>>,
    /// Client certificate and key, concatenated PEM.
    pub client_identity_pem: Option<Vec<u8>>,
    pub token: String,
    pub insecure: bool,
}

pub struct KubernetesExecutor {
    name: String,
    kubeconfig_path: String,
    context: RwLock<KubeContext>,
    registry: Arc<TransactionRegistry>,
}

impl KubernetesExecutor {
    pub async fn new(
        name: String,
        kubeconfig_path: String,
        registry: Arc<TransactionRegistry>,
    ) -> Result<Arc<KubernetesExecutor>, KubeContextError> {
        let context = load_context(&kubeconfig_path).await?;
        let executor = Arc::new(KubernetesExecutor {
            name,
            kubeconfig_path,
            context: RwLock::new(context),
            registry,
        });
        tokio::spawn(refresh_worker(executor.clone()));
        Ok(executor)
    }

    async fn snapshot(&self) -> KubeContext {
        self.context.read().await.clone()
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    async fn execute(&self, req: OpenHttpTunnelRequest, outbound: mpsc::Sender<Frame>) {
        let context = self.snapshot().await;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .danger_accept_invalid_certs(context.insecure);
        if let Some(ca_pem) = &context.server_ca_pem {
            match reqwest::Certificate::from_pem(ca_pem) {
                Ok(cert) => builder = builder.add_root_certificate(cert),
                Err(e) => {
                    warn!(endpoint = %self.name, error = %e, "invalid server CA");
                    super::send_bad_gateway(&outbound, &req.id).await;
                    return;
                }
            }
        }
        if let Some(identity_pem) = &context.client_identity_pem {
            match reqwest::Identity::from_pem(identity_pem) {
                Ok(identity) => builder = builder.identity(identity),
                Err(e) => {
                    warn!(endpoint = %self.name, error = %e, "invalid client certificate");
                    super::send_bad_gateway(&outbound, &req.id).await;
                    return;
                }
            }
        }
        let client = match builder.build() {
            Ok(client) => client,
            Err(e) => {
                warn!(endpoint = %self.name, error = %e, "cannot build API client");
                super::send_bad_gateway(&outbound, &req.id).await;
                return;
            }
        };

        let bearer = (!context.token.is_empty()).then(|| context.token.clone());
        run_http_request(
            OutboundCall {
                client,
                base_url: context.server_url,
                bearer,
                basic: None,
            },
            &self.registry,
            req,
            outbound,
        )
        .await;
    }
}

async fn refresh_worker(executor: Arc<KubernetesExecutor>) {
    loop {
        tokio::time::sleep(jittered(REFRESH_INTERVAL)).await;
        match load_context(&executor.kubeconfig_path).await {
            Ok(fresh) => {
                let mut context = executor.context.write().await;
                if *context != fresh {
                    info!(
                        endpoint = %executor.name,
                        "updating security context for API calls"
                    );
                    *context = fresh;
                }
            }
            Err(e) => {
                warn!(endpoint = %executor.name, error = %e, "credential refresh failed");
            }
        }
    }
}

/// The refresh period with +/- 10% jitter, so a fleet of agents does not
/// hit the credential source in lockstep.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    base.mul_f64(factor)
}

async fn load_context(kubeconfig_path: &str) -> Result<KubeContext, KubeContextError> {
    match tokio::fs::read_to_string(kubeconfig_path).await {
        Ok(content) => context_from_kubeconfig(&KubeConfig::parse(&content)?),
        Err(read_err) => load_service_account()
            .await
            .map_err(|_| KubeContextError::NoCredentials(read_err.to_string())),
    }
}

fn context_from_kubeconfig(config: &KubeConfig) -> Result<KubeContext, KubeContextError> {
    let (user, cluster) = config.find_current()?;

    let client_identity_pem = match (&user.client_certificate_data, &user.client_key_data) {
        (Some(cert), Some(key)) => {
            let mut pem = BASE64
                .decode(cert)
                .map_err(|_| KubeContextError::Base64("client-certificate-data"))?;
            let key = BASE64
                .decode(key)
                .map_err(|_| KubeContextError::Base64("client-key-data"))?;
            pem.push(b'\n');
            pem.extend_from_slice(&key);
            Some(pem)
        }
        _ => None,
    };

    let server_ca_pem = match &cluster.certificate_authority_data {
        Some(data) => Some(
            BASE64
                .decode(data)
                .map_err(|_| KubeContextError::Base64("certificate-authority-data"))?,
        ),
        None => None,
    };

    Ok(KubeContext {
        username: config.current_context.clone(),
        server_url: cluster.server.clone(),
        server_ca_pem,
        client_identity_pem,
        token: user.token.clone().unwrap_or_default(),
        insecure: cluster.insecure_skip_tls_verify,
    })
}

async fn load_service_account() -> Result<KubeContext, KubeContextError> {
    let token = tokio::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
        .await
        .map_err(|e| KubeContextError::NoCredentials(e.to_string()))?;
    let server_ca = tokio::fs::read(SERVICE_ACCOUNT_CA)
        .await
        .map_err(|e| KubeContextError::NoCredentials(e.to_string()))?;

    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| KubeContextError::NoApiServer("HOST"))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT")
        .map_err(|_| KubeContextError::NoApiServer("PORT"))?;

    Ok(KubeContext {
        username: "ServiceAccount".to_string(),
        server_url: format!("https://{host}:{port}"),
        server_ca_pem: Some(server_ca),
        client_identity_pem: None,
        token,
        insecure: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> KubeContext {
        KubeContext {
            username: "prod".into(),
            server_url: "https://10.0.0.1:6443".into(),
            server_ca_pem: Some(b"ca bytes".to_vec()),
            client_identity_pem: None,
            token: "sekrit".into(),
            insecure: false,
        }
    }

    #[test]
    fn identical_contexts_compare_equal() {
        assert_eq!(sample_context(), sample_context());
    }

    #[test]
    fn changed_ca_bytes_are_a_different_context() {
        let mut other = sample_context();
        other.server_ca_pem = Some(b"different ca".to_vec());
        assert_ne!(sample_context(), other);
    }

    #[test]
    fn changed_token_is_a_different_context() {
        let mut other = sample_context();
        other.token = "rotated".into();
        assert_ne!(sample_context(), other);
    }

    #[test]
    fn kubeconfig_context_extraction() {
        let yaml = r"
current-context: prod
clusters:
  - name: c
    cluster:
      server: https://api.example.com:6443
      certificate-authority-data: Y2EgYnl0ZXM=
contexts:
  - name: prod
    context: {cluster: c, user: u}
users:
  - name: u
    user:
      token: tok
";
        let config = KubeConfig::parse(yaml).unwrap();
        let context = context_from_kubeconfig(&config).unwrap();
        assert_eq!(context.server_url, "https://api.example.com:6443");
        assert_eq!(context.server_ca_pem.as_deref(), Some(&b"ca bytes"[..]));
        assert_eq!(context.token, "tok");
        assert!(!context.insecure);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(600));
            assert!(d >= Duration::from_secs(540));
            assert!(d <= Duration::from_secs(660));
        }
    }
}
