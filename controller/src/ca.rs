//! Certificate authority.
//!
//! The controller owns a CA (cert + key PEM on disk) and uses it to mint
//! its own server certificate plus agent/control/service client
//! certificates on demand through the CNC surface. Every issued certificate
//! carries the [`CertificateName`] JSON blob in its OU, which is what the
//! identity layer reads back on connection accept.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;

use crate::identity::CertificateName;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("while reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid CA material: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("invalid PEM in {0}")]
    Pem(String),
    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("identity is not encodable: {0}")]
    Encode(#[from] serde_json::Error),
}

/// PEM cert + key pair as issued by the CA.
#[derive(Debug, Clone)]
pub struct CertBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CertBundle {
    pub fn cert_base64(&self) -> String {
        BASE64.encode(self.cert_pem.as_bytes())
    }

    pub fn key_base64(&self) -> String {
        BASE64.encode(self.key_pem.as_bytes())
    }
}

pub struct Authority {
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    issuer_cert: Certificate,
    issuer_key: KeyPair,
}

impl Authority {
    /// Load the CA from its PEM files.
    pub fn load(cert_file: &str, key_file: &str) -> Result<Authority, CaError> {
        let cert_pem = std::fs::read_to_string(cert_file).map_err(|e| CaError::Read {
            path: cert_file.to_string(),
            source: e,
        })?;
        let key_pem = std::fs::read_to_string(key_file).map_err(|e| CaError::Read {
            path: key_file.to_string(),
            source: e,
        })?;
        let issuer_key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        // rcgen cannot re-hydrate a Certificate from DER, so the issuer is
        // rebuilt from the parsed params; subject and key match the on-disk
        // CA, which is all chain verification needs.
        let issuer_cert = params.self_signed(&issuer_key)?;

        let ca_cert_der = pem_to_cert_ders(&cert_pem)
            .map_err(|()| CaError::Pem(cert_file.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| CaError::Pem(cert_file.to_string()))?;

        Ok(Authority {
            ca_cert_pem: cert_pem,
            ca_cert_der,
            issuer_cert,
            issuer_key,
        })
    }

    /// Generate a fresh self-signed CA. Deployments mount an existing CA;
    /// this exists for tests and local bring-up.
    pub fn self_signed(common_name: &str) -> Result<(Authority, CertBundle), CaError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key)?;
        let bundle = CertBundle {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        };
        let ca_cert_der = cert.der().clone().into_owned();
        let authority = Authority {
            ca_cert_pem: bundle.cert_pem.clone(),
            ca_cert_der,
            issuer_cert: cert,
            issuer_key: key,
        };
        Ok((authority, bundle))
    }

    /// Base64 of the CA certificate PEM, as embedded in CNC responses.
    pub fn ca_cert_base64(&self) -> String {
        BASE64.encode(self.ca_cert_pem.as_bytes())
    }

    /// Issue the controller's own server certificate for `names`.
    pub fn make_server_cert(&self, names: &[String]) -> Result<CertBundle, CaError> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(names.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, names.first().map_or("culvert", String::as_str));
        params.distinguished_name = dn;
        let cert = params.signed_by(&key, &self.issuer_cert, &self.issuer_key)?;
        Ok(CertBundle {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Issue a client certificate carrying `name` in its OU.
    pub fn generate_certificate(&self, name: &CertificateName) -> Result<CertBundle, CaError> {
        let cn = name
            .agent
            .as_deref()
            .or(name.name.as_deref())
            .unwrap_or("culvert");
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        dn.push(DnType::OrganizationalUnitName, serde_json::to_string(name)?);
        params.distinguished_name = dn;
        let cert = params.signed_by(&key, &self.issuer_cert, &self.issuer_key)?;
        Ok(CertBundle {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// TLS acceptor for a listener using `bundle` as its server identity.
    /// With `require_client_auth`, peers must present a certificate issued
    /// by this CA; the verified leaf is what identity binding reads.
    pub fn tls_acceptor(
        &self,
        bundle: &CertBundle,
        require_client_auth: bool,
    ) -> Result<TlsAcceptor, CaError> {
        let chain =
            pem_to_cert_ders(&bundle.cert_pem).map_err(|()| CaError::Pem("server cert".into()))?;
        let key = pem_to_key(&bundle.key_pem).map_err(|()| CaError::Pem("server key".into()))?;

        let builder = rustls::ServerConfig::builder();
        let config = if require_client_auth {
            let mut roots = RootCertStore::empty();
            roots
                .add(self.ca_cert_der.clone())
                .map_err(CaError::Tls)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(chain, key)?
        };
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn pem_to_cert_ders(pem: &str) -> Result<Vec<CertificateDer<'static>>, ()> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|_| ())?;
    if certs.is_empty() {
        Err(())
    } else {
        Ok(certs)
    }
}

fn pem_to_key(pem: &str) -> Result<PrivateKeyDer<'static>, ()> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| ())?
        .ok_or(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{agent_name_from_der, CertificatePurpose};

    #[test]
    fn issued_agent_cert_round_trips_through_identity_binding() {
        let (authority, _) = Authority::self_signed("culvert test CA").unwrap();
        let bundle = authority
            .generate_certificate(&CertificateName {
                purpose: CertificatePurpose::Agent,
                agent: Some("a1".into()),
                name: None,
            })
            .unwrap();

        let ders = pem_to_cert_ders(&bundle.cert_pem).unwrap();
        assert_eq!(agent_name_from_der(ders[0].as_ref()).unwrap(), "a1");
    }

    #[test]
    fn server_cert_carries_requested_names() {
        let (authority, _) = Authority::self_signed("culvert test CA").unwrap();
        let bundle = authority
            .make_server_cert(&["controller.local".to_string()])
            .unwrap();
        assert!(bundle.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(bundle.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn cert_material_is_base64_for_transport() {
        let (authority, bundle) = Authority::self_signed("culvert test CA").unwrap();
        let decoded = BASE64.decode(authority.ca_cert_base64()).unwrap();
        assert_eq!(decoded, bundle.cert_pem.as_bytes());
    }
}
