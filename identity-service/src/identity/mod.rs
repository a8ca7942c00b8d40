//! Identity write paths and the protected-field policy.
//!
//! Every write validates the traits document, derives the credential
//! identifiers and addresses from it, and persists in one transaction.
//! Unprivileged callers can change traits freely; changes to credentials,
//! recovery addresses, or verification state are detected before anything
//! is written, the caller-visible struct is restored to the stored
//! pre-image, and the call fails.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::code::{CodeManager, CodeTarget};
use crate::models::{AddressStatus, CodeKind, Flow, Identity, OneTimeCode, VerifiableAddress};
use crate::schema::{ExtensionOutput, SchemaCatalogue, SchemaExtensionRunner};
use crate::services::{ServiceError, Store};

#[derive(Clone)]
pub struct IdentityManager {
    store: Store,
    schemas: Arc<SchemaCatalogue>,
    codes: CodeManager,
    verifiable_address_lifespan: Duration,
    code_lifespan: Duration,
}

impl IdentityManager {
    pub fn new(
        store: Store,
        schemas: Arc<SchemaCatalogue>,
        codes: CodeManager,
        verifiable_address_lifespan: Duration,
        code_lifespan: Duration,
    ) -> Self {
        Self {
            store,
            schemas,
            codes,
            verifiable_address_lifespan,
            code_lifespan,
        }
    }

    /// Validate, derive collections, and persist a new identity. The
    /// identity is updated in place with whatever the derivation added.
    pub async fn create(&self, identity: &mut Identity) -> Result<(), ServiceError> {
        let output = self.derive(identity)?;
        output.apply_to(identity, self.verifiable_address_lifespan);
        self.store.create_identity(identity).await
    }

    /// Full update. `privileged` callers may rewrite credentials and
    /// verification state; everyone else is limited to traits, and a
    /// violation restores `identity` to the stored pre-image.
    pub async fn update(
        &self,
        identity: &mut Identity,
        privileged: bool,
    ) -> Result<(), ServiceError> {
        let original = self
            .store
            .get_identity_confidential(identity.nid, identity.id)
            .await?;

        // Collections the caller left empty count as "unchanged", not as a
        // request to delete everything.
        if identity.credentials.is_empty() {
            identity.credentials = original.credentials.clone();
        }
        if identity.verifiable_addresses.is_empty() {
            identity.verifiable_addresses = original.verifiable_addresses.clone();
        }
        if identity.recovery_addresses.is_empty() {
            identity.recovery_addresses = original.recovery_addresses.clone();
        }

        let output = self.derive(identity)?;

        if !privileged {
            if let Err(err) = check_protected_fields(identity, &original, &output) {
                *identity = original;
                return Err(err);
            }
        }

        output.apply_to(identity, self.verifiable_address_lifespan);
        identity.updated_at = Utc::now();
        self.store.update_identity(identity).await
    }

    /// Replace only the traits document. Protected fields cannot be reached
    /// through this path by construction.
    pub async fn update_traits(
        &self,
        nid: Uuid,
        id: Uuid,
        traits: Value,
        privileged: bool,
    ) -> Result<Identity, ServiceError> {
        let mut identity = self.store.get_identity_confidential(nid, id).await?;
        identity.traits = traits;
        self.update(&mut identity, privileged).await?;
        Ok(identity)
    }

    /// Re-arm verification for an address: extend its window and issue a
    /// fresh code bound to it on the given verification flow. Returns the
    /// plaintext for delivery and the stored row.
    pub async fn refresh_verify_address(
        &self,
        flow: &Flow,
        address: &mut VerifiableAddress,
        identity_id: Option<Uuid>,
    ) -> Result<(String, OneTimeCode), ServiceError> {
        address.expires_at = Utc::now() + self.verifiable_address_lifespan;
        address.status = AddressStatus::Pending.as_str().to_string();
        self.store
            .update_verifiable_address(flow.nid, address)
            .await?;

        self.codes
            .issue(
                CodeKind::Verification,
                flow,
                self.code_lifespan,
                CodeTarget::VerifiableAddress {
                    address_id: address.id,
                    identity_id,
                },
            )
            .await
    }

    fn derive(&self, identity: &Identity) -> Result<ExtensionOutput, ServiceError> {
        let schema = self.schemas.get(&identity.schema_id)?;
        let document = serde_json::json!({ "traits": identity.traits });
        SchemaExtensionRunner::new().run(&schema, &document)
    }
}

/// Detect unprivileged modification of protected fields.
///
/// A collection is acceptable when it equals the stored original, or when it
/// equals what derivation from the new traits produces anyway (a caller
/// echoing the derivation outcome changed nothing). Everything else is an
/// attempt to write credentials or verification state directly.
fn check_protected_fields(
    caller: &Identity,
    original: &Identity,
    derived: &ExtensionOutput,
) -> Result<(), ServiceError> {
    if original
        .credentials
        .keys()
        .any(|k| !caller.credentials.contains_key(k))
    {
        return Err(ServiceError::ProtectedFieldModified);
    }

    for (kind, creds) in &caller.credentials {
        let derived_identifiers: Vec<String> = derived
            .identifiers
            .iter()
            .filter(|(k, _)| k == kind)
            .map(|(_, v)| v.clone())
            .collect();
        match original.credentials.get(kind) {
            Some(orig) => {
                if creds.config != orig.config {
                    return Err(ServiceError::ProtectedFieldModified);
                }
                if creds.identifiers != orig.identifiers
                    && creds.identifiers != derived_identifiers
                {
                    return Err(ServiceError::ProtectedFieldModified);
                }
            }
            None => {
                // A brand-new credential type is only tolerable when it is
                // exactly the derivation outcome with no config attached.
                if !creds.config.is_null()
                    || derived_identifiers.is_empty()
                    || creds.identifiers != derived_identifiers
                {
                    return Err(ServiceError::ProtectedFieldModified);
                }
            }
        }
    }

    let key_set = |addrs: &[crate::models::RecoveryAddress]| {
        let mut keys: Vec<(String, String)> = addrs
            .iter()
            .map(|a| (a.value.clone(), a.via.clone()))
            .collect();
        keys.sort();
        keys
    };
    let derived_recovery = {
        let mut keys: Vec<(String, String)> = derived
            .recovery
            .iter()
            .map(|(v, via)| (v.clone(), via.as_str().to_string()))
            .collect();
        keys.sort();
        keys
    };
    let caller_recovery = key_set(&caller.recovery_addresses);
    if caller_recovery != key_set(&original.recovery_addresses)
        && caller_recovery != derived_recovery
    {
        return Err(ServiceError::ProtectedFieldModified);
    }

    for address in &caller.verifiable_addresses {
        match original
            .verifiable_addresses
            .iter()
            .find(|a| a.value == address.value && a.via == address.via)
        {
            Some(orig) => {
                if address.verified != orig.verified
                    || address.status != orig.status
                    || address.verified_at != orig.verified_at
                {
                    return Err(ServiceError::ProtectedFieldModified);
                }
            }
            None => {
                if address.verified
                    || address.verified_at.is_some()
                    || address.status != AddressStatus::Pending.as_str()
                {
                    return Err(ServiceError::ProtectedFieldModified);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, Credentials, CredentialsType, RecoveryAddress};
    use serde_json::json;

    fn stored_identity() -> Identity {
        let mut identity = Identity::new(Uuid::new_v4(), "default", json!({"email": "a@x.io"}));
        identity.credentials.insert(
            CredentialsType::Password,
            Credentials {
                credentials_type: CredentialsType::Password,
                identifiers: vec!["a@x.io".to_string()],
                config: json!({"hashed_password": "$argon2..."}),
            },
        );
        identity.verifiable_addresses = vec![VerifiableAddress {
            verified: true,
            status: AddressStatus::Completed.as_str().to_string(),
            verified_at: Some(Utc::now()),
            ..VerifiableAddress::pending("a@x.io", Channel::Email, Utc::now() + Duration::hours(1))
        }];
        identity
            .recovery_addresses
            .push(RecoveryAddress::new("a@x.io", Channel::Email));
        identity
    }

    fn derived_for(email: &str) -> ExtensionOutput {
        ExtensionOutput {
            identifiers: vec![(CredentialsType::Password, email.to_string())],
            verifiable: vec![(email.to_string(), Channel::Email)],
            recovery: vec![(email.to_string(), Channel::Email)],
        }
    }

    #[test]
    fn test_unchanged_collections_pass() {
        let original = stored_identity();
        let caller = original.clone();
        assert!(check_protected_fields(&caller, &original, &derived_for("a@x.io")).is_ok());
    }

    #[test]
    fn test_forged_identifier_list_is_rejected() {
        let original = stored_identity();
        let mut caller = original.clone();
        caller
            .credentials
            .get_mut(&CredentialsType::Password)
            .unwrap()
            .identifiers = vec!["b@x.io".to_string()];
        // Traits still say a@x.io, so the derivation does too.
        assert!(matches!(
            check_protected_fields(&caller, &original, &derived_for("a@x.io")),
            Err(ServiceError::ProtectedFieldModified)
        ));
    }

    #[test]
    fn test_identifier_change_backed_by_traits_passes() {
        let original = stored_identity();
        let mut caller = original.clone();
        caller.traits = json!({"email": "b@x.io"});
        caller
            .credentials
            .get_mut(&CredentialsType::Password)
            .unwrap()
            .identifiers = vec!["b@x.io".to_string()];
        assert!(check_protected_fields(&caller, &original, &derived_for("b@x.io")).is_ok());
    }

    #[test]
    fn test_config_change_is_rejected() {
        let original = stored_identity();
        let mut caller = original.clone();
        caller
            .credentials
            .get_mut(&CredentialsType::Password)
            .unwrap()
            .config = json!({"hashed_password": "$attacker"});
        assert!(matches!(
            check_protected_fields(&caller, &original, &derived_for("a@x.io")),
            Err(ServiceError::ProtectedFieldModified)
        ));
    }

    #[test]
    fn test_removed_credential_type_is_rejected() {
        let original = stored_identity();
        let mut caller = original.clone();
        caller.credentials.clear();
        caller.credentials.insert(
            CredentialsType::Webauthn,
            Credentials::new(CredentialsType::Webauthn),
        );
        assert!(check_protected_fields(&caller, &original, &derived_for("a@x.io")).is_err());
    }

    #[test]
    fn test_forged_verified_flag_is_rejected() {
        let original = stored_identity();
        let mut caller = original.clone();
        caller.verifiable_addresses.push(VerifiableAddress {
            verified: true,
            status: AddressStatus::Completed.as_str().to_string(),
            verified_at: Some(Utc::now()),
            ..VerifiableAddress::pending("b@x.io", Channel::Email, Utc::now() + Duration::hours(1))
        });
        assert!(matches!(
            check_protected_fields(&caller, &original, &derived_for("a@x.io")),
            Err(ServiceError::ProtectedFieldModified)
        ));
    }

    #[test]
    fn test_unverifying_an_address_is_rejected() {
        let original = stored_identity();
        let mut caller = original.clone();
        caller.verifiable_addresses[0].verified = false;
        caller.verifiable_addresses[0].status = AddressStatus::Pending.as_str().to_string();
        caller.verifiable_addresses[0].verified_at = None;
        assert!(check_protected_fields(&caller, &original, &derived_for("a@x.io")).is_err());
    }

    #[test]
    fn test_recovery_address_change_backed_by_traits_passes() {
        let original = stored_identity();
        let mut caller = original.clone();
        caller.recovery_addresses = vec![RecoveryAddress::new("b@x.io", Channel::Email)];
        assert!(check_protected_fields(&caller, &original, &derived_for("b@x.io")).is_ok());
        assert!(check_protected_fields(&caller, &original, &derived_for("a@x.io")).is_err());
    }
}
