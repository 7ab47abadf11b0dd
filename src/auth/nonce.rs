//! Stateless nonces for the long-term credential challenge
//!
//! A nonce is `base64url(timestamp_ms || HMAC-SHA1(key, timestamp_ms))`.
//! Nothing is stored per nonce: any nonce whose MAC verifies under this
//! registry's key and whose timestamp lies inside the validity window is fresh.

use super::new_mac;
use crate::error::{AuthError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use byteorder::{BigEndian, ByteOrder};
use hmac::Mac;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TIMESTAMP_SIZE: usize = 8;
const MAC_SIZE: usize = 20;

/// Issues and validates freshness tokens
pub struct NonceRegistry {
    key: [u8; 32],
    lifetime: Duration,
}

impl NonceRegistry {
    /// Creates a registry with a random key
    ///
    /// # Arguments
    /// * `lifetime` - How long an issued nonce stays fresh
    pub fn new(lifetime: Duration) -> Self {
        Self {
            key: rand::random(),
            lifetime,
        }
    }

    /// Issues a nonce stamped with the current time
    pub fn issue(&self) -> Result<String> {
        self.issue_at(now_millis())
    }

    /// Checks that `nonce` was issued here and is inside its window
    pub fn validate(&self, nonce: &str) -> std::result::Result<(), AuthError> {
        self.validate_at(nonce, now_millis())
    }

    fn issue_at(&self, timestamp_ms: u64) -> Result<String> {
        let mut raw = [0u8; TIMESTAMP_SIZE];
        BigEndian::write_u64(&mut raw, timestamp_ms);

        let mut mac = new_mac(&self.key)?;
        mac.update(&raw);

        let mut token = raw.to_vec();
        token.extend_from_slice(&mac.finalize().into_bytes());
        Ok(BASE64.encode(token))
    }

    fn validate_at(&self, nonce: &str, now_ms: u64) -> std::result::Result<(), AuthError> {
        let token = BASE64.decode(nonce).map_err(|_| AuthError::StaleNonce)?;
        if token.len() != TIMESTAMP_SIZE + MAC_SIZE {
            return Err(AuthError::StaleNonce);
        }
        let (stamp, tag) = token.split_at(TIMESTAMP_SIZE);

        let mut mac = new_mac(&self.key).map_err(|_| AuthError::StaleNonce)?;
        mac.update(stamp);
        mac.verify_slice(tag).map_err(|_| AuthError::StaleNonce)?;

        let issued_ms = BigEndian::read_u64(stamp);
        let lifetime_ms = u64::try_from(self.lifetime.as_millis()).unwrap_or(u64::MAX);
        if issued_ms > now_ms || now_ms - issued_ms > lifetime_ms {
            return Err(AuthError::StaleNonce);
        }
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
