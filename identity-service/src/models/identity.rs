//! Identity model - traits document plus the collections derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Credential types the identity schema extension can derive identifiers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialsType {
    Password,
    Webauthn,
    Totp,
    Oidc,
}

impl CredentialsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialsType::Password => "password",
            CredentialsType::Webauthn => "webauthn",
            CredentialsType::Totp => "totp",
            CredentialsType::Oidc => "oidc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "password" => Some(CredentialsType::Password),
            "webauthn" => Some(CredentialsType::Webauthn),
            "totp" => Some(CredentialsType::Totp),
            "oidc" => Some(CredentialsType::Oidc),
            _ => None,
        }
    }
}

/// Delivery channel for verifiable and recovery addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            _ => None,
        }
    }
}

/// Verification lifecycle of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressStatus {
    Pending,
    Completed,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressStatus::Pending => "pending",
            AddressStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AddressStatus::Pending),
            "completed" => Some(AddressStatus::Completed),
            _ => None,
        }
    }
}

/// A credential set of one type on one identity. `identifiers` are the
/// normalised lookup keys (lowercased, deduplicated); `config` is opaque to
/// the core - password hashes, WebAuthn key material, whatever the method
/// needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "type")]
    pub credentials_type: CredentialsType,
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub config: Value,
}

impl Credentials {
    pub fn new(credentials_type: CredentialsType) -> Self {
        Self {
            credentials_type,
            identifiers: Vec::new(),
            config: Value::Null,
        }
    }
}

/// Address the platform can verify by sending a code over `via`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct VerifiableAddress {
    pub id: Uuid,
    pub value: String,
    pub via: String,
    pub verified: bool,
    pub status: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl VerifiableAddress {
    pub fn pending(value: &str, via: Channel, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: value.to_string(),
            via: via.as_str().to_string(),
            verified: false,
            status: AddressStatus::Pending.as_str().to_string(),
            verified_at: None,
            expires_at,
        }
    }
}

/// Address a recovery code can be sent to.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RecoveryAddress {
    pub id: Uuid,
    pub value: String,
    pub via: String,
}

impl RecoveryAddress {
    pub fn new(value: &str, via: Channel) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: value.to_string(),
            via: via.as_str().to_string(),
        }
    }
}

/// Identity entity. The credential and address collections are owned
/// exclusively by the identity and loaded separately from the row columns.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    #[serde(skip)]
    pub nid: Uuid,
    pub schema_id: String,
    pub traits: Value,
    pub state: String,
    pub state_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<CredentialsType, Credentials>,
    #[sqlx(skip)]
    #[serde(default)]
    pub verifiable_addresses: Vec<VerifiableAddress>,
    #[sqlx(skip)]
    #[serde(default)]
    pub recovery_addresses: Vec<RecoveryAddress>,
}

pub const IDENTITY_STATE_ACTIVE: &str = "active";

impl Identity {
    pub fn new(nid: Uuid, schema_id: &str, traits: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            nid,
            schema_id: schema_id.to_string(),
            traits,
            state: IDENTITY_STATE_ACTIVE.to_string(),
            state_changed_at: now,
            created_at: now,
            updated_at: now,
            credentials: BTreeMap::new(),
            verifiable_addresses: Vec::new(),
            recovery_addresses: Vec::new(),
        }
    }

    /// Public view: identical row, credentials withheld.
    pub fn without_credentials(mut self) -> Self {
        self.credentials.clear();
        self
    }

    /// Upsert an identifier for a credential type, keeping the list
    /// normalised and free of duplicates.
    pub fn add_credential_identifier(&mut self, kind: CredentialsType, identifier: String) {
        let creds = self
            .credentials
            .entry(kind)
            .or_insert_with(|| Credentials::new(kind));
        if !creds.identifiers.contains(&identifier) {
            creds.identifiers.push(identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_credential_identifier_deduplicates() {
        let mut id = Identity::new(Uuid::new_v4(), "default", json!({}));
        id.add_credential_identifier(CredentialsType::Password, "a@x".into());
        id.add_credential_identifier(CredentialsType::Password, "a@x".into());
        id.add_credential_identifier(CredentialsType::Password, "b@x".into());
        assert_eq!(
            id.credentials[&CredentialsType::Password].identifiers,
            vec!["a@x", "b@x"]
        );
    }

    #[test]
    fn test_without_credentials_strips_only_credentials() {
        let mut id = Identity::new(Uuid::new_v4(), "default", json!({}));
        id.add_credential_identifier(CredentialsType::Password, "a@x".into());
        id.recovery_addresses.push(RecoveryAddress::new("a@x", Channel::Email));
        let public = id.without_credentials();
        assert!(public.credentials.is_empty());
        assert_eq!(public.recovery_addresses.len(), 1);
    }
}
