//! Service-auth JWT keysets.
//!
//! Two HS256 keysets share one secrets directory: every regular file is a
//! key, the file name is its `kid`. `currentKeyName` signs new service
//! tokens (validation accepts any loaded key, selected by the token's `kid`
//! header, so keys can be rotated without invalidating outstanding tokens).
//! `headerMutationKeyName` signs the tokens that protect the
//! `x-spinnaker-user` header on its way to agents.
//!
//! Service token claims: `{t:"svc", a:<agent>, n:<name>, y:<type>}`.

use std::collections::HashMap;

use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ServiceAuthError {
    #[error("while reading service keys from {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("no service keys found in {0}")]
    EmptyKeyset(String),
    #[error("configured key '{0}' is not in the loaded keyset")]
    UnknownKey(String),
    #[error("token has no kid header")]
    MissingKid,
    #[error("token kid '{0}' is not in the keyset")]
    UnknownKid(String),
    #[error("token is not a {expected} token")]
    WrongTokenType { expected: &'static str },
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Claims of a service-auth token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaims {
    /// Token type, always `"svc"`.
    pub t: String,
    /// Agent name.
    pub a: String,
    /// Endpoint name.
    pub n: String,
    /// Endpoint type.
    pub y: String,
}

/// Claims of a header-mutation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationClaims {
    /// Token type, always `"mut"`.
    pub t: String,
    /// The protected `x-spinnaker-user` value.
    pub u: String,
}

pub struct ServiceKeySet {
    keys: HashMap<String, Vec<u8>>,
    current: String,
    mutation: String,
}

impl ServiceKeySet {
    /// Load every regular file under `path` as a key named by its file
    /// name. Fails when either configured key name is absent.
    pub fn load(
        path: &str,
        current_key_name: &str,
        mutation_key_name: &str,
    ) -> Result<ServiceKeySet, ServiceAuthError> {
        let mut keys = HashMap::new();
        let entries = std::fs::read_dir(path).map_err(|e| ServiceAuthError::Read {
            path: path.to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| ServiceAuthError::Read {
                path: path.to_string(),
                source: e,
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let content = std::fs::read(entry.path()).map_err(|e| ServiceAuthError::Read {
                path: entry.path().display().to_string(),
                source: e,
            })?;
            info!(key = %name, length = content.len(), "loaded service key");
            keys.insert(name, content);
        }
        if keys.is_empty() {
            return Err(ServiceAuthError::EmptyKeyset(path.to_string()));
        }
        Self::from_keys(keys, current_key_name, mutation_key_name)
    }

    /// Assemble a keyset from in-memory keys. Used by tests and the secret
    /// loader path.
    pub fn from_keys(
        keys: HashMap<String, Vec<u8>>,
        current_key_name: &str,
        mutation_key_name: &str,
    ) -> Result<ServiceKeySet, ServiceAuthError> {
        if !keys.contains_key(current_key_name) {
            return Err(ServiceAuthError::UnknownKey(current_key_name.to_string()));
        }
        if !keys.contains_key(mutation_key_name) {
            return Err(ServiceAuthError::UnknownKey(mutation_key_name.to_string()));
        }
        Ok(ServiceKeySet {
            keys,
            current: current_key_name.to_string(),
            mutation: mutation_key_name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Mint a service token for `(agent, name, type)`.
    pub fn sign_service_token(
        &self,
        agent: &str,
        name: &str,
        kind: &str,
    ) -> Result<String, ServiceAuthError> {
        let claims = ServiceClaims {
            t: "svc".into(),
            a: agent.into(),
            n: name.into(),
            y: kind.into(),
        };
        self.sign(&self.current, &claims)
    }

    /// Validate a service token and return its claims.
    pub fn validate_service_token(&self, token: &str) -> Result<ServiceClaims, ServiceAuthError> {
        let claims: ServiceClaims = self.validate(token)?;
        if claims.t != "svc" {
            return Err(ServiceAuthError::WrongTokenType { expected: "svc" });
        }
        Ok(claims)
    }

    /// Mint a header-mutation token protecting `user`.
    pub fn sign_mutation_token(&self, user: &str) -> Result<String, ServiceAuthError> {
        let claims = MutationClaims {
            t: "mut".into(),
            u: user.into(),
        };
        self.sign(&self.mutation, &claims)
    }

    pub fn validate_mutation_token(&self, token: &str) -> Result<MutationClaims, ServiceAuthError> {
        let claims: MutationClaims = self.validate(token)?;
        if claims.t != "mut" {
            return Err(ServiceAuthError::WrongTokenType { expected: "mut" });
        }
        Ok(claims)
    }

    fn sign<C: Serialize>(&self, kid: &str, claims: &C) -> Result<String, ServiceAuthError> {
        let secret = self
            .keys
            .get(kid)
            .ok_or_else(|| ServiceAuthError::UnknownKey(kid.to_string()))?;
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        Ok(encode(&header, claims, &EncodingKey::from_secret(secret))?)
    }

    fn validate<C: for<'de> Deserialize<'de>>(&self, token: &str) -> Result<C, ServiceAuthError> {
        let header = decode_header(token)?;
        let kid = header.kid.ok_or(ServiceAuthError::MissingKid)?;
        let secret = self
            .keys
            .get(&kid)
            .ok_or(ServiceAuthError::UnknownKid(kid))?;
        let mut validation = Validation::new(Algorithm::HS256);
        // Service tokens are long-lived capability tokens with no exp claim.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        Ok(decode::<C>(token, &DecodingKey::from_secret(secret), &validation)?.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test keys, obviously not for production use.
    fn test_keyset() -> ServiceKeySet {
        let mut keys = HashMap::new();
        keys.insert("key1".to_string(), b"this is a key".to_vec());
        keys.insert("key2".to_string(), b"this is a key2".to_vec());
        ServiceKeySet::from_keys(keys, "key1", "key2").unwrap()
    }

    #[test]
    fn service_token_round_trips() {
        let keyset = test_keyset();
        let token = keyset.sign_service_token("a1", "prod", "kubernetes").unwrap();
        let claims = keyset.validate_service_token(&token).unwrap();
        assert_eq!(
            claims,
            ServiceClaims {
                t: "svc".into(),
                a: "a1".into(),
                n: "prod".into(),
                y: "kubernetes".into(),
            }
        );
    }

    #[test]
    fn kid_header_selects_the_signing_key() {
        let keyset = test_keyset();
        let token = keyset.sign_service_token("a1", "prod", "kubernetes").unwrap();
        let header = decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("key1"));
    }

    #[test]
    fn token_signed_with_unknown_key_is_rejected() {
        let keyset = test_keyset();
        let mut other_keys = HashMap::new();
        other_keys.insert("key9".to_string(), b"other".to_vec());
        other_keys.insert("key2".to_string(), b"this is a key2".to_vec());
        let other = ServiceKeySet::from_keys(other_keys, "key9", "key2").unwrap();

        let token = other.sign_service_token("a1", "prod", "kubernetes").unwrap();
        assert!(matches!(
            keyset.validate_service_token(&token),
            Err(ServiceAuthError::UnknownKid(_))
        ));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let keyset = test_keyset();
        let token = keyset.sign_service_token("a1", "prod", "kubernetes").unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(keyset.validate_service_token(&tampered).is_err());
    }

    #[test]
    fn mutation_token_is_not_a_service_token() {
        let keyset = test_keyset();
        let token = keyset.sign_mutation_token("alice").unwrap();
        assert!(keyset.validate_service_token(&token).is_err());
        assert_eq!(keyset.validate_mutation_token(&token).unwrap().u, "alice");
    }

    #[test]
    fn missing_configured_key_fails_construction() {
        let mut keys = HashMap::new();
        keys.insert("key1".to_string(), b"k".to_vec());
        assert!(matches!(
            ServiceKeySet::from_keys(keys, "key1", "missing"),
            Err(ServiceAuthError::UnknownKey(_))
        ));
    }
}
