//! The `ory.sh/kratos` annotation walk.
//!
//! After a traits document passes schema validation, the runner revisits it
//! alongside the schema and collects the side effects the annotation asks
//! for: credential identifiers, verifiable addresses, recovery addresses.
//! The collected output is then merged into an identity; the merge is
//! idempotent, so re-running over unchanged traits changes nothing.

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::models::{
    Channel, Credentials, CredentialsType, Identity, RecoveryAddress, VerifiableAddress,
};
use crate::services::ServiceError;

use super::{CompiledSchema, EXTENSION_ANNOTATION};

/// Compiled value of one `ory.sh/kratos` annotation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub credentials: CredentialsAnnotation,
    pub verification: ChannelAnnotation,
    pub recovery: ChannelAnnotation,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CredentialsAnnotation {
    pub password: IdentifierFlag,
    pub webauthn: IdentifierFlag,
    pub totp: AccountNameFlag,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentifierFlag {
    pub identifier: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountNameFlag {
    pub account_name: bool,
}

/// `{via: "email" | "sms" | ""}` - empty means the concern is disabled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelAnnotation {
    pub via: String,
}

impl ChannelAnnotation {
    fn channel(&self) -> Result<Option<Channel>, ServiceError> {
        if self.via.is_empty() {
            return Ok(None);
        }
        Channel::parse(&self.via).map(Some).ok_or_else(|| {
            ServiceError::Config(anyhow::anyhow!(
                "unknown delivery channel {:?} in {EXTENSION_ANNOTATION} annotation",
                self.via
            ))
        })
    }
}

impl ExtensionConfig {
    pub fn verification_channel(&self) -> Result<Option<Channel>, ServiceError> {
        self.verification.channel()
    }

    pub fn recovery_channel(&self) -> Result<Option<Channel>, ServiceError> {
        self.recovery.channel()
    }
}

/// Everything one runner pass derived from a traits document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionOutput {
    pub identifiers: Vec<(CredentialsType, String)>,
    pub verifiable: Vec<(String, Channel)>,
    pub recovery: Vec<(String, Channel)>,
}

impl ExtensionOutput {
    /// Merge the derived collections into an identity.
    ///
    /// Identifier lists for derivable credential types are recomputed from
    /// scratch. Addresses merge by `(value, via)`: a surviving key keeps its
    /// row (and thus its verification state), a vanished key is dropped, a
    /// new key enters as pending.
    pub fn apply_to(&self, identity: &mut Identity, verifiable_lifespan: Duration) {
        for kind in [CredentialsType::Password, CredentialsType::Webauthn] {
            let derived: Vec<String> = self
                .identifiers
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, v)| v.clone())
                .collect();
            if let Some(creds) = identity.credentials.get_mut(&kind) {
                creds.identifiers = derived;
            } else if !derived.is_empty() {
                let mut creds = Credentials::new(kind);
                creds.identifiers = derived;
                identity.credentials.insert(kind, creds);
            }
        }

        let now = Utc::now();
        identity.verifiable_addresses = self
            .verifiable
            .iter()
            .map(|(value, via)| {
                identity
                    .verifiable_addresses
                    .iter()
                    .find(|a| &a.value == value && a.via == via.as_str())
                    .cloned()
                    .unwrap_or_else(|| {
                        VerifiableAddress::pending(value, *via, now + verifiable_lifespan)
                    })
            })
            .collect();

        identity.recovery_addresses = self
            .recovery
            .iter()
            .map(|(value, via)| {
                identity
                    .recovery_addresses
                    .iter()
                    .find(|a| &a.value == value && a.via == via.as_str())
                    .cloned()
                    .unwrap_or_else(|| RecoveryAddress::new(value, *via))
            })
            .collect();
    }
}

/// One validation pass over a traits document. Stateless; instantiate per
/// call.
pub struct SchemaExtensionRunner;

impl SchemaExtensionRunner {
    pub fn new() -> Self {
        Self
    }

    /// Validate `document` against `schema`, then walk it and collect the
    /// annotated derivations. A validation failure aborts before anything is
    /// derived.
    pub fn run(
        &self,
        schema: &CompiledSchema,
        document: &Value,
    ) -> Result<ExtensionOutput, ServiceError> {
        schema.validate(document)?;
        let mut output = ExtensionOutput::default();
        visit(&schema.raw, document, &mut output)?;
        Ok(output)
    }
}

impl Default for SchemaExtensionRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn visit(schema: &Value, instance: &Value, out: &mut ExtensionOutput) -> Result<(), ServiceError> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(annotation) = obj.get(EXTENSION_ANNOTATION) {
        let config: ExtensionConfig = serde_json::from_value(annotation.clone())?;
        dispatch(&config, instance, out)?;
    }

    if let (Some(props), Some(inst)) = (
        obj.get("properties").and_then(Value::as_object),
        instance.as_object(),
    ) {
        for (key, subschema) in props {
            if let Some(value) = inst.get(key) {
                visit(subschema, value, out)?;
            }
        }
    }

    if let (Some(items), Some(values)) = (obj.get("items"), instance.as_array()) {
        for value in values {
            visit(items, value, out)?;
        }
    }

    Ok(())
}

fn dispatch(
    config: &ExtensionConfig,
    value: &Value,
    out: &mut ExtensionOutput,
) -> Result<(), ServiceError> {
    // Only string leaves derive anything; other shapes passed validation,
    // so they are simply not identifier material.
    let Some(s) = value.as_str() else {
        return Ok(());
    };

    if config.credentials.password.identifier {
        push_unique(
            &mut out.identifiers,
            (CredentialsType::Password, s.trim().to_lowercase()),
        );
    }
    if config.credentials.webauthn.identifier {
        push_unique(
            &mut out.identifiers,
            (CredentialsType::Webauthn, s.trim().to_lowercase()),
        );
    }

    if let Some(via) = config.verification_channel()? {
        push_unique(&mut out.verifiable, (normalise(s, via), via));
    }
    if let Some(via) = config.recovery_channel()? {
        push_unique(&mut out.recovery, (normalise(s, via), via));
    }
    Ok(())
}

/// Email values are case-insensitive; everything else is only trimmed.
fn normalise(value: &str, via: Channel) -> String {
    match via {
        Channel::Email => value.trim().to_lowercase(),
        Channel::Sms => value.trim().to_string(),
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) {
    if !list.contains(&item) {
        list.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn schema() -> CompiledSchema {
        CompiledSchema::compile(
            "default",
            json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": {
                    "traits": {
                        "type": "object",
                        "properties": {
                            "email": {
                                "type": "string",
                                "format": "email",
                                "ory.sh/kratos": {
                                    "credentials": {"password": {"identifier": true}},
                                    "verification": {"via": "email"},
                                    "recovery": {"via": "email"}
                                }
                            },
                            "emails": {
                                "type": "array",
                                "items": {
                                    "type": "string",
                                    "format": "email",
                                    "ory.sh/kratos": {"verification": {"via": "email"}}
                                }
                            },
                            "name": {"type": "string"}
                        },
                        "required": ["email"]
                    }
                },
                "required": ["traits"]
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_derives_identifier_and_addresses() {
        let out = SchemaExtensionRunner::new()
            .run(&schema(), &json!({"traits": {"email": " A@X.io ", "name": "a"}}))
            .unwrap();
        assert_eq!(
            out.identifiers,
            vec![(CredentialsType::Password, "a@x.io".to_string())]
        );
        assert_eq!(out.verifiable, vec![("a@x.io".to_string(), Channel::Email)]);
        assert_eq!(out.recovery, vec![("a@x.io".to_string(), Channel::Email)]);
    }

    #[test]
    fn test_array_items_are_visited() {
        let out = SchemaExtensionRunner::new()
            .run(
                &schema(),
                &json!({"traits": {"email": "a@x.io", "emails": ["b@x.io", "B@X.io"]}}),
            )
            .unwrap();
        // Duplicate after normalisation collapses to one entry.
        assert_eq!(
            out.verifiable,
            vec![
                ("a@x.io".to_string(), Channel::Email),
                ("b@x.io".to_string(), Channel::Email)
            ]
        );
    }

    #[test]
    fn test_invalid_traits_abort_before_derivation() {
        let err = SchemaExtensionRunner::new()
            .run(&schema(), &json!({"traits": {"email": "not an email"}}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationFailed(_)));
    }

    #[test]
    fn test_runner_is_idempotent() {
        let doc = json!({"traits": {"email": "a@x.io", "emails": ["b@x.io"]}});
        let runner = SchemaExtensionRunner::new();
        let first = runner.run(&schema(), &doc).unwrap();
        let second = runner.run(&schema(), &doc).unwrap();
        assert_eq!(first, second);

        let mut identity = Identity::new(Uuid::new_v4(), "default", doc["traits"].clone());
        first.apply_to(&mut identity, Duration::hours(1));
        let after_once = identity.clone();
        second.apply_to(&mut identity, Duration::hours(1));
        assert_eq!(identity.verifiable_addresses, after_once.verifiable_addresses);
        assert_eq!(identity.recovery_addresses, after_once.recovery_addresses);
        assert_eq!(identity.credentials, after_once.credentials);
    }

    #[test]
    fn test_merge_preserves_verified_state_and_drops_vanished() {
        let runner = SchemaExtensionRunner::new();
        let mut identity = Identity::new(Uuid::new_v4(), "default", json!({}));

        // First pass derives a@x.io; pretend it got verified afterwards.
        let out = runner
            .run(&schema(), &json!({"traits": {"email": "a@x.io"}}))
            .unwrap();
        out.apply_to(&mut identity, Duration::hours(1));
        identity.verifiable_addresses[0].verified = true;
        identity.verifiable_addresses[0].status = "completed".to_string();
        identity.verifiable_addresses[0].verified_at = Some(Utc::now());
        let verified_id = identity.verifiable_addresses[0].id;

        // New traits keep a@x.io and add b@x.io.
        let out = runner
            .run(
                &schema(),
                &json!({"traits": {"email": "a@x.io", "emails": ["b@x.io"]}}),
            )
            .unwrap();
        out.apply_to(&mut identity, Duration::hours(1));
        assert_eq!(identity.verifiable_addresses.len(), 2);
        let a = &identity.verifiable_addresses[0];
        assert_eq!((a.id, a.verified, a.status.as_str()), (verified_id, true, "completed"));
        let b = &identity.verifiable_addresses[1];
        assert_eq!((b.value.as_str(), b.verified, b.status.as_str()), ("b@x.io", false, "pending"));

        // a@x.io vanishes from the traits; its row goes with it.
        let out = runner
            .run(&schema(), &json!({"traits": {"email": "b@x.io"}}))
            .unwrap();
        out.apply_to(&mut identity, Duration::hours(1));
        assert_eq!(identity.verifiable_addresses.len(), 1);
        assert_eq!(identity.verifiable_addresses[0].value, "b@x.io");
        assert!(!identity.verifiable_addresses[0].verified);
    }

    #[test]
    fn test_recomputed_identifiers_replace_old_ones() {
        let runner = SchemaExtensionRunner::new();
        let mut identity = Identity::new(Uuid::new_v4(), "default", json!({}));

        runner
            .run(&schema(), &json!({"traits": {"email": "a@x.io"}}))
            .unwrap()
            .apply_to(&mut identity, Duration::hours(1));
        runner
            .run(&schema(), &json!({"traits": {"email": "b@x.io"}}))
            .unwrap()
            .apply_to(&mut identity, Duration::hours(1));

        assert_eq!(
            identity.credentials[&CredentialsType::Password].identifiers,
            vec!["b@x.io"]
        );
    }
}
