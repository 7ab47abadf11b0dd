// Long-term credential authentication for TURN requests
use crate::config::AuthConfig;
use crate::error::{AuthError, Error, Result};
use crate::proto::TurnMessage;
use crate::rate_limit::RateLimiter;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use stun_rs::{Algorithm, AlgorithmId, HMACKey};

mod nonce;

pub use nonce::NonceRegistry;

pub(crate) type HmacSha1 = Hmac<Sha1>;

/// Builds an HMAC-SHA1 instance keyed with `key`
pub(crate) fn new_mac(key: &[u8]) -> Result<HmacSha1> {
    HmacSha1::new_from_slice(key).map_err(|e| Error::Stun(format!("invalid HMAC key: {}", e)))
}

/// Derives the long-term credential key MD5(username ":" realm ":" password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Result<Vec<u8>> {
    let key = HMACKey::new_long_term(
        username,
        realm,
        password,
        Algorithm::from(AlgorithmId::MD5),
    )?;
    Ok(key.as_bytes().to_vec())
}

/// Resolves the message-integrity key of a user
///
/// Implementations must be free of side effects visible to the relay. Any
/// `Fn(&str, &str, SocketAddr) -> Option<Vec<u8>>` closure qualifies.
pub trait CredentialStore: Send + Sync {
    /// Returns the key for `username` in `realm`, or `None` if unknown
    fn lookup(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Option<Vec<u8>>;
}

impl<F> CredentialStore for F
where
    F: Fn(&str, &str, SocketAddr) -> Option<Vec<u8>> + Send + Sync,
{
    fn lookup(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Option<Vec<u8>> {
        self(username, realm, src_addr)
    }
}

/// Fixed user table for a single realm
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    realm: String,
    keys: HashMap<String, Vec<u8>>,
}

impl StaticCredentials {
    /// Creates an empty table for `realm`
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            keys: HashMap::new(),
        }
    }

    /// Builds the table from the configured users
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut credentials = Self::new(config.realm.clone());
        for (username, password) in &config.users {
            credentials.add_user(username, password)?;
        }
        Ok(credentials)
    }

    /// Adds or replaces a user, storing only the derived key
    pub fn add_user(&mut self, username: &str, password: &str) -> Result<()> {
        let key = long_term_key(username, &self.realm, password)?;
        self.keys.insert(username.to_owned(), key);
        Ok(())
    }
}

impl CredentialStore for StaticCredentials {
    fn lookup(&self, username: &str, realm: &str, _src_addr: SocketAddr) -> Option<Vec<u8>> {
        if realm != self.realm {
            return None;
        }
        self.keys.get(username).cloned()
    }
}

/// Identity established by a request's MESSAGE-INTEGRITY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub key: Vec<u8>,
}

/// Decides whether a request is challenged, rejected or accepted
pub struct Authenticator {
    realm: String,
    nonces: NonceRegistry,
    credentials: Arc<dyn CredentialStore>,
    rate_limiter: RateLimiter,
}

impl Authenticator {
    /// Creates an authenticator over an injected credential lookup
    pub fn new(config: &AuthConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        Ok(Self {
            realm: config.realm.clone(),
            nonces: NonceRegistry::new(config.nonce_lifetime),
            credentials,
            rate_limiter: RateLimiter::from_config(&config.rate_limit)?,
        })
    }

    /// The realm sent in challenges
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Issues a fresh nonce for a challenge response
    pub fn issue_nonce(&self) -> Result<String> {
        self.nonces.issue()
    }

    /// Validates a request under the long-term credential mechanism
    ///
    /// # Returns
    /// * `Ok(Credentials)` with the username and key that signed the request
    /// * `Err(Error::Auth(_))` otherwise; no state is touched on failure
    ///
    /// # Error Responses
    /// * 401 - MESSAGE-INTEGRITY or NONCE absent, unknown user, bad MAC
    /// * 438 - nonce stale or not issued by this server
    /// * 400 - USERNAME or REALM absent
    /// * none - source blacklisted after repeated failures
    pub async fn authenticate(&self, msg: &TurnMessage, src_addr: SocketAddr) -> Result<Credentials> {
        let ip = src_addr.ip();
        if self.rate_limiter.is_blacklisted(ip).await {
            return Err(AuthError::Blacklisted.into());
        }

        let integrity = msg.integrity.as_ref().ok_or(AuthError::MissingIntegrity)?;
        let nonce = msg.nonce.as_deref().ok_or(AuthError::MissingNonce)?;
        self.nonces.validate(nonce)?;

        let (username, realm) = match (msg.username.as_deref(), msg.realm.as_deref()) {
            (Some(username), Some(realm)) => (username, realm),
            _ => return Err(AuthError::MissingCredentials.into()),
        };

        // Unknown users fail exactly like a bad MAC
        let verified = match self.credentials.lookup(username, realm, src_addr) {
            Some(key) if integrity.verify(&key)? => Some(key),
            _ => None,
        };

        match verified {
            Some(key) => Ok(Credentials {
                username: username.to_owned(),
                key,
            }),
            None => {
                log::warn!("Integrity check failed for user {} from {}", username, src_addr);
                self.rate_limiter.record_failure(ip).await;
                Err(AuthError::IntegrityMismatch.into())
            }
        }
    }

    /// Forgets expired rate limit state
    pub async fn cleanup(&self) {
        self.rate_limiter.cleanup().await;
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
