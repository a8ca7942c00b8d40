//! Keyed MAC over a rotating secret list.
//!
//! `mac` always uses the first (active) secret; `equal` accepts a value
//! produced under any secret still in the list, so rotating a new secret to
//! position 0 keeps previously issued codes verifiable until they expire.

use hmac::{Hmac, Mac};
use sha2::Sha512_256;
use std::sync::RwLock;
use subtle::ConstantTimeEq;

use crate::services::error::ServiceError;

type HmacSha512_256 = Hmac<Sha512_256>;

pub struct SecretRotator {
    // Read-mostly: every request reads, only a config reload writes.
    secrets: RwLock<Vec<Vec<u8>>>,
}

impl SecretRotator {
    pub fn new(secrets: Vec<String>) -> Self {
        Self {
            secrets: RwLock::new(secrets.into_iter().map(String::into_bytes).collect()),
        }
    }

    /// Replace the rotation list, e.g. on config reload. The first entry
    /// becomes the active signing secret.
    pub fn rotate(&self, secrets: Vec<String>) {
        let mut guard = self.secrets.write().expect("secret list lock poisoned");
        *guard = secrets.into_iter().map(String::into_bytes).collect();
    }

    /// Raw MAC bytes of `value` under the active secret.
    pub fn sign(&self, value: &[u8]) -> Result<Vec<u8>, ServiceError> {
        let secrets = self.secrets.read().expect("secret list lock poisoned");
        let active = secrets.first().ok_or_else(|| {
            ServiceError::Config(anyhow::anyhow!("secret rotation list is empty"))
        })?;
        Ok(keyed_mac(active, value))
    }

    /// Constant-time check of raw MAC bytes across the rotation list.
    pub fn verify(&self, value: &[u8], tag: &[u8]) -> bool {
        let secrets = self.secrets.read().expect("secret list lock poisoned");
        for secret in secrets.iter() {
            let candidate = keyed_mac(secret, value);
            if candidate.ct_eq(tag).into() {
                return true;
            }
        }
        false
    }

    /// MAC of `value` under the active secret, fixed-width hex.
    pub fn mac(&self, value: &[u8]) -> Result<String, ServiceError> {
        Ok(hex::encode(self.sign(value)?))
    }

    /// Constant-time comparison of `value` against a stored hex MAC, across
    /// the whole rotation list. The loop over secrets is not constant-time
    /// (rotation is operational, not attacker-facing); the comparison of each
    /// candidate is.
    pub fn equal(&self, value: &[u8], stored_hex: &str) -> bool {
        let Ok(stored) = hex::decode(stored_hex) else {
            return false;
        };
        self.verify(value, &stored)
    }
}

fn keyed_mac(secret: &[u8], value: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha512_256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(value);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_round_trip() {
        let rotator = SecretRotator::new(vec!["k1".to_string()]);
        let mac = rotator.mac(b"123456").unwrap();
        assert!(rotator.equal(b"123456", &mac));
        assert!(!rotator.equal(b"654321", &mac));
    }

    #[test]
    fn test_mac_is_fixed_width_hex() {
        let rotator = SecretRotator::new(vec!["k1".to_string()]);
        let a = rotator.mac(b"x").unwrap();
        let b = rotator.mac(b"a much longer value than the other one").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(b.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_rotation_keeps_old_macs_verifiable() {
        let rotator = SecretRotator::new(vec!["k1".to_string()]);
        let old = rotator.mac(b"code").unwrap();

        rotator.rotate(vec!["k2".to_string(), "k1".to_string()]);
        assert!(rotator.equal(b"code", &old));

        // New MACs use the new active secret.
        let new = rotator.mac(b"code").unwrap();
        assert_ne!(old, new);
        assert!(rotator.equal(b"code", &new));

        // Dropping k1 entirely invalidates the old MAC.
        rotator.rotate(vec!["k2".to_string()]);
        assert!(!rotator.equal(b"code", &old));
        assert!(rotator.equal(b"code", &new));
    }

    #[test]
    fn test_empty_secret_list_is_a_config_error() {
        let rotator = SecretRotator::new(vec![]);
        assert!(matches!(
            rotator.mac(b"x"),
            Err(ServiceError::Config(_))
        ));
        assert!(!rotator.equal(b"x", "00"));
    }

    #[test]
    fn test_raw_tag_rejects_tampering() {
        let rotator = SecretRotator::new(vec!["k1".to_string()]);
        let tag = rotator.sign(b"payload").unwrap();
        assert_eq!(tag.len(), 32);
        assert!(rotator.verify(b"payload", &tag));
        assert!(!rotator.verify(b"payloae", &tag));

        let mut flipped = tag.clone();
        flipped[0] ^= 0x01;
        assert!(!rotator.verify(b"payload", &flipped));
    }

    #[test]
    fn test_garbage_stored_mac_never_matches() {
        let rotator = SecretRotator::new(vec!["k1".to_string()]);
        assert!(!rotator.equal(b"x", "not-hex-at-all"));
        assert!(!rotator.equal(b"x", ""));
    }
}
