//! Short-lived bearer tokens for bridge authentication
//!
//! The bridge authenticates a device by a JWT passed as the MQTT password,
//! signed with the device's private key. [`JwtSigner`] reads the key from
//! disk on every issue so a rotated key file is picked up on the next
//! session open.
//!
//! # Example
//!
//! ```ignore
//! use alice_iot_link::credentials::{CredentialProvider, JwtSigner, SigningAlgorithm};
//!
//! let signer = JwtSigner::new("rsa_private.pem", SigningAlgorithm::Rs256);
//! let token = signer.issue_token(&identity, Duration::from_secs(20 * 60))?;
//! ```
//!
//! Author: Moroya Sakamoto

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

use crate::device::DeviceIdentity;

/// Token issuing errors
///
/// None of these can be fixed by retrying.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("cannot read signing key {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signing key {path} is not a valid {algorithm} key: {reason}")]
    MalformedKey {
        path: PathBuf,
        algorithm: SigningAlgorithm,
        reason: String,
    },

    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Issues tokens for a device identity
pub trait CredentialProvider {
    /// Issue a token valid for `validity` from now
    fn issue_token(
        &self,
        identity: &DeviceIdentity,
        validity: Duration,
    ) -> Result<SignedToken, CredentialError>;
}

/// Opaque bearer token with its lifetime
#[derive(Clone, PartialEq, Eq)]
pub struct SignedToken {
    token: String,
    issued_at: SystemTime,
    expires_at: SystemTime,
}

impl SignedToken {
    pub fn new(token: impl Into<String>, issued_at: SystemTime, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            issued_at,
            expires_at,
        }
    }

    /// The bearer string sent as the MQTT password
    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }
}

impl fmt::Debug for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedToken")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supported signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    Rs256,
    /// ECDSA P-256 with SHA-256
    Es256,
}

impl From<SigningAlgorithm> for Algorithm {
    fn from(alg: SigningAlgorithm) -> Self {
        match alg {
            SigningAlgorithm::Rs256 => Algorithm::RS256,
            SigningAlgorithm::Es256 => Algorithm::ES256,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningAlgorithm::Rs256 => write!(f, "RS256"),
            SigningAlgorithm::Es256 => write!(f, "ES256"),
        }
    }
}

impl FromStr for SigningAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RS256" => Ok(SigningAlgorithm::Rs256),
            "ES256" => Ok(SigningAlgorithm::Es256),
            other => Err(format!(
                "unsupported algorithm '{}', expected RS256 or ES256",
                other
            )),
        }
    }
}

/// Claims understood by the bridge
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Issued at (unix seconds)
    pub iat: u64,
    /// Expiry (unix seconds)
    pub exp: u64,
    /// Audience: the cloud project id
    pub aud: String,
}

/// Signs JWTs with a PEM private key from disk
#[derive(Debug, Clone)]
pub struct JwtSigner {
    private_key: PathBuf,
    algorithm: SigningAlgorithm,
}

impl JwtSigner {
    pub fn new(private_key: impl Into<PathBuf>, algorithm: SigningAlgorithm) -> Self {
        Self {
            private_key: private_key.into(),
            algorithm,
        }
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn private_key(&self) -> &Path {
        &self.private_key
    }

    fn load_key(&self) -> Result<EncodingKey, CredentialError> {
        let pem = std::fs::read(&self.private_key).map_err(|source| CredentialError::Unreadable {
            path: self.private_key.clone(),
            source,
        })?;

        let key = match self.algorithm {
            SigningAlgorithm::Rs256 => EncodingKey::from_rsa_pem(&pem),
            SigningAlgorithm::Es256 => EncodingKey::from_ec_pem(&pem),
        };

        key.map_err(|e| CredentialError::MalformedKey {
            path: self.private_key.clone(),
            algorithm: self.algorithm,
            reason: e.to_string(),
        })
    }
}

impl CredentialProvider for JwtSigner {
    fn issue_token(
        &self,
        identity: &DeviceIdentity,
        validity: Duration,
    ) -> Result<SignedToken, CredentialError> {
        let key = self.load_key()?;

        let issued_at = SystemTime::now();
        let expires_at = issued_at.checked_add(validity).ok_or_else(|| {
            CredentialError::Signing(format!("token lifetime {:?} is out of range", validity))
        })?;
        let iat = issued_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let claims = Claims {
            iat,
            exp: iat.saturating_add(validity.as_secs()),
            aud: identity.project_id.clone(),
        };

        let token = jsonwebtoken::encode(&Header::new(self.algorithm.into()), &claims, &key)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        debug!(
            algorithm = %self.algorithm,
            audience = %claims.aud,
            exp = claims.exp,
            "issued bridge token"
        );

        Ok(SignedToken::new(token, issued_at, expires_at))
    }
}
