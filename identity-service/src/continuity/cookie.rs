//! Authenticated encoding of the continuity cookie value.
//!
//! The value is `urlsafe-base64(tag || json)` where `json` is a map of
//! container name to container id and `tag` is the keyed MAC of the json
//! bytes. The same string travels either in a `Cookie` header or out-of-band
//! as a `RelayState` parameter, so both transports share one codec and one
//! tamper check.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

use crate::services::{SecretRotator, ServiceError};

/// SHA-512/256 output width.
const TAG_LEN: usize = 32;

pub fn encode(
    rotator: &SecretRotator,
    entries: &BTreeMap<String, Uuid>,
) -> Result<String, ServiceError> {
    let json = serde_json::to_vec(entries)?;
    let tag = rotator.sign(&json)?;
    let mut raw = Vec::with_capacity(TAG_LEN + json.len());
    raw.extend_from_slice(&tag);
    raw.extend_from_slice(&json);
    Ok(URL_SAFE_NO_PAD.encode(raw))
}

/// Decode and authenticate a cookie value. Any malformed or tampered value
/// comes back as `NotResumable`; the caller treats that the same as an
/// absent cookie.
pub fn decode(
    rotator: &SecretRotator,
    value: &str,
) -> Result<BTreeMap<String, Uuid>, ServiceError> {
    let raw = URL_SAFE_NO_PAD
        .decode(value.trim())
        .map_err(|e| ServiceError::NotResumable(anyhow::anyhow!("malformed cookie value: {e}")))?;
    if raw.len() < TAG_LEN {
        return Err(ServiceError::NotResumable(anyhow::anyhow!(
            "cookie value too short to carry an authentication tag"
        )));
    }
    let (tag, json) = raw.split_at(TAG_LEN);
    if !rotator.verify(json, tag) {
        return Err(ServiceError::NotResumable(anyhow::anyhow!(
            "cookie authentication tag mismatch"
        )));
    }
    serde_json::from_slice(json)
        .map_err(|e| ServiceError::NotResumable(anyhow::anyhow!("malformed cookie payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotator() -> SecretRotator {
        SecretRotator::new(vec!["cookie-secret".to_string()])
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let r = rotator();
        let mut entries = BTreeMap::new();
        entries.insert("login_code".to_string(), Uuid::new_v4());
        entries.insert("settings_password".to_string(), Uuid::new_v4());

        let value = encode(&r, &entries).unwrap();
        assert_eq!(decode(&r, &value).unwrap(), entries);
    }

    #[test]
    fn test_tampered_value_is_not_resumable() {
        let r = rotator();
        let mut entries = BTreeMap::new();
        entries.insert("login_code".to_string(), Uuid::new_v4());
        let value = encode(&r, &entries).unwrap();

        // Flip one character in the payload region.
        let mut chars: Vec<char> = value.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        assert!(matches!(
            decode(&r, &tampered),
            Err(ServiceError::NotResumable(_))
        ));
    }

    #[test]
    fn test_garbage_values_are_not_resumable() {
        let r = rotator();
        for bad in ["", "!!!", "c2hvcnQ"] {
            assert!(matches!(
                decode(&r, bad),
                Err(ServiceError::NotResumable(_))
            ));
        }
    }

    #[test]
    fn test_decoding_under_rotated_secret_list() {
        let r = rotator();
        let mut entries = BTreeMap::new();
        entries.insert("recovery".to_string(), Uuid::new_v4());
        let value = encode(&r, &entries).unwrap();

        r.rotate(vec!["fresh-secret".to_string(), "cookie-secret".to_string()]);
        assert_eq!(decode(&r, &value).unwrap(), entries);

        r.rotate(vec!["fresh-secret".to_string()]);
        assert!(decode(&r, &value).is_err());
    }
}
