//! Peer identity extraction.
//!
//! Every certificate the CA mints carries a JSON blob in its OU naming the
//! certificate's purpose and, for agent and service certs, the subject it
//! was issued for. The TLS layer has already verified the chain by the time
//! this code runs; here we only read the leaf.

use serde::{Deserialize, Serialize};
use x509_parser::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificatePurpose {
    Agent,
    Control,
    Service,
}

impl std::fmt::Display for CertificatePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificatePurpose::Agent => write!(f, "agent"),
            CertificatePurpose::Control => write!(f, "control"),
            CertificatePurpose::Service => write!(f, "service"),
        }
    }
}

/// Identity blob encoded in a certificate's OU field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateName {
    pub purpose: CertificatePurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no verified peer certificate")]
    NoPeerCertificate,
    #[error("peer certificate could not be parsed")]
    UnparseableCertificate,
    #[error("peer certificate has no organizational unit")]
    MissingOrganizationalUnit,
    #[error("peer certificate OU is not a valid identity: {0}")]
    MalformedName(serde_json::Error),
    #[error("not an {expected} certificate (purpose is {found})")]
    WrongPurpose {
        expected: CertificatePurpose,
        found: CertificatePurpose,
    },
    #[error("agent certificate does not name an agent")]
    MissingAgentName,
}

/// Parse the identity blob out of a DER-encoded certificate.
pub fn certificate_name_from_der(der: &[u8]) -> Result<CertificateName, IdentityError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|_| IdentityError::UnparseableCertificate)?;
    let ou = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or(IdentityError::MissingOrganizationalUnit)?;
    serde_json::from_str(ou).map_err(IdentityError::MalformedName)
}

/// Agent-name binding for a tunnel stream: the leaf must be an `agent`
/// certificate and carry the agent's name.
pub fn agent_name_from_der(der: &[u8]) -> Result<String, IdentityError> {
    let name = certificate_name_from_der(der)?;
    if name.purpose != CertificatePurpose::Agent {
        return Err(IdentityError::WrongPurpose {
            expected: CertificatePurpose::Agent,
            found: name.purpose,
        });
    }
    name.agent.ok_or(IdentityError::MissingAgentName)
}

/// CNC access check: the leaf must be a `control` certificate.
pub fn require_control_purpose(der: &[u8]) -> Result<CertificateName, IdentityError> {
    let name = certificate_name_from_der(der)?;
    if name.purpose != CertificatePurpose::Control {
        return Err(IdentityError::WrongPurpose {
            expected: CertificatePurpose::Control,
            found: name.purpose,
        });
    }
    Ok(name)
}
