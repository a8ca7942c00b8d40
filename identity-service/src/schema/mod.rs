//! Identity schema catalogue and compilation.
//!
//! Trait documents are validated against JSON Schemas that additionally
//! carry an `ory.sh/kratos` annotation on individual properties. The
//! annotation drives the extension runner (see `extension`); this module
//! owns loading, compiling, and caching the schemas themselves.

pub mod extension;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::services::ServiceError;

pub use extension::{ExtensionConfig, ExtensionOutput, SchemaExtensionRunner};

/// Property-level annotation key carrying the extension config.
pub const EXTENSION_ANNOTATION: &str = "ory.sh/kratos";

/// Format value that opts a property out of format assertion while still
/// allowing verification/recovery derivation on opaque channels.
pub const FORMAT_NO_VALIDATE: &str = "no-validate";

/// One entry of the configured schema catalogue.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaSource {
    pub id: String,
    pub url: String,
}

/// A compiled identity schema: the raw document (the annotation walk needs
/// it) plus the compiled validator.
pub struct CompiledSchema {
    pub id: String,
    pub raw: Value,
    validator: jsonschema::JSONSchema,
}

impl CompiledSchema {
    pub fn compile(id: &str, raw: Value) -> Result<Self, ServiceError> {
        check_annotations(&raw)?;
        let validator = jsonschema::JSONSchema::options()
            .should_validate_formats(true)
            .compile(&raw)
            .map_err(|e| {
                ServiceError::Config(anyhow::anyhow!("identity schema {id} does not compile: {e}"))
            })?;
        Ok(Self {
            id: id.to_string(),
            raw,
            validator,
        })
    }

    /// Validate a traits document. All schema violations are collected into
    /// one message so the caller sees every problem at once.
    pub fn validate(&self, traits: &Value) -> Result<(), ServiceError> {
        if let Err(errors) = self.validator.validate(traits) {
            let details: Vec<String> = errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect();
            return Err(ServiceError::ValidationFailed(details.join("; ")));
        }
        Ok(())
    }
}

/// Process-wide schema cache: built lazily per schema id, immutable once
/// compiled, safe for concurrent readers.
pub struct SchemaCatalogue {
    default_schema_id: String,
    sources: HashMap<String, String>,
    cache: RwLock<HashMap<String, Arc<CompiledSchema>>>,
}

impl SchemaCatalogue {
    pub fn new(default_schema_id: String, sources: Vec<SchemaSource>) -> Self {
        Self {
            default_schema_id,
            sources: sources.into_iter().map(|s| (s.id, s.url)).collect(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_schema_id(&self) -> &str {
        &self.default_schema_id
    }

    pub fn get(&self, schema_id: &str) -> Result<Arc<CompiledSchema>, ServiceError> {
        if let Some(schema) = self
            .cache
            .read()
            .expect("schema cache lock poisoned")
            .get(schema_id)
        {
            return Ok(schema.clone());
        }

        let url = self.sources.get(schema_id).ok_or_else(|| {
            ServiceError::Config(anyhow::anyhow!("unknown identity schema id {schema_id}"))
        })?;
        let raw = load_schema(url)?;
        let compiled = Arc::new(CompiledSchema::compile(schema_id, raw)?);

        let mut cache = self.cache.write().expect("schema cache lock poisoned");
        // A concurrent loader may have won; keep whichever landed first.
        Ok(cache
            .entry(schema_id.to_string())
            .or_insert(compiled)
            .clone())
    }
}

/// Supported schemes: `file://` for on-disk schemas and `base64://` for
/// schemas embedded directly in configuration.
fn load_schema(url: &str) -> Result<Value, ServiceError> {
    let bytes = if let Some(path) = url.strip_prefix("file://") {
        std::fs::read(path).map_err(|e| {
            ServiceError::Config(anyhow::anyhow!("cannot read identity schema {url}: {e}"))
        })?
    } else if let Some(encoded) = url.strip_prefix("base64://") {
        STANDARD.decode(encoded).map_err(|e| {
            ServiceError::Config(anyhow::anyhow!("cannot decode identity schema {url}: {e}"))
        })?
    } else {
        return Err(ServiceError::Config(anyhow::anyhow!(
            "unsupported identity schema url scheme: {url}"
        )));
    };
    serde_json::from_slice(&bytes).map_err(|e| {
        ServiceError::Config(anyhow::anyhow!("identity schema {url} is not valid JSON: {e}"))
    })
}

/// Compile-time annotation lint: a property that derives a verifiable or
/// recovery address must assert a format (or explicitly opt out with
/// `no-validate`), otherwise unvalidated input would become a delivery
/// target.
fn check_annotations(node: &Value) -> Result<(), ServiceError> {
    let Some(obj) = node.as_object() else {
        return Ok(());
    };

    if let Some(annotation) = obj.get(EXTENSION_ANNOTATION) {
        let config: ExtensionConfig = serde_json::from_value(annotation.clone()).map_err(|e| {
            ServiceError::Config(anyhow::anyhow!("malformed {EXTENSION_ANNOTATION} annotation: {e}"))
        })?;
        let derives_address =
            config.verification_channel()?.is_some() || config.recovery_channel()?.is_some();
        if derives_address && obj.get("format").and_then(Value::as_str).is_none() {
            return Err(ServiceError::Config(anyhow::anyhow!(
                "property deriving a verifiable or recovery address must declare a format (use {FORMAT_NO_VALIDATE} to opt out)"
            )));
        }
    }

    for (key, child) in obj {
        if key == EXTENSION_ANNOTATION {
            continue;
        }
        match child {
            Value::Object(_) => check_annotations(child)?,
            Value::Array(items) => {
                for item in items {
                    check_annotations(item)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn email_schema() -> Value {
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
                        }
                    },
                    "required": ["email"]
                }
            },
            "required": ["traits"]
        })
    }

    #[test]
    fn test_compile_and_validate() {
        let schema = CompiledSchema::compile("default", email_schema()).unwrap();
        assert!(schema
            .validate(&json!({"traits": {"email": "a@x.io"}}))
            .is_ok());
        assert!(matches!(
            schema.validate(&json!({"traits": {"email": "not an email"}})),
            Err(ServiceError::ValidationFailed(_))
        ));
        assert!(schema.validate(&json!({"traits": {}})).is_err());
    }

    #[test]
    fn test_address_annotation_without_format_fails_compilation() {
        let schema = json!({
            "type": "object",
            "properties": {
                "traits": {
                    "type": "object",
                    "properties": {
                        "phone": {
                            "type": "string",
                            "ory.sh/kratos": {"recovery": {"via": "sms"}}
                        }
                    }
                }
            }
        });
        assert!(matches!(
            CompiledSchema::compile("default", schema),
            Err(ServiceError::Config(_))
        ));
    }

    #[test]
    fn test_no_validate_format_is_accepted() {
        let schema = json!({
            "type": "object",
            "properties": {
                "traits": {
                    "type": "object",
                    "properties": {
                        "handle": {
                            "type": "string",
                            "format": "no-validate",
                            "ory.sh/kratos": {"verification": {"via": "sms"}}
                        }
                    }
                }
            }
        });
        let compiled = CompiledSchema::compile("default", schema).unwrap();
        // Unknown formats assert nothing.
        assert!(compiled
            .validate(&json!({"traits": {"handle": "anything at all"}}))
            .is_ok());
    }

    #[test]
    fn test_catalogue_loads_base64_schemas() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let encoded = STANDARD.encode(serde_json::to_vec(&email_schema()).unwrap());
        let catalogue = SchemaCatalogue::new(
            "default".to_string(),
            vec![SchemaSource {
                id: "default".to_string(),
                url: format!("base64://{encoded}"),
            }],
        );
        let schema = catalogue.get("default").unwrap();
        assert_eq!(schema.id, "default");
        // Second get hits the cache and returns the same compilation.
        assert!(Arc::ptr_eq(&schema, &catalogue.get("default").unwrap()));
    }

    #[test]
    fn test_catalogue_rejects_unknown_ids_and_schemes() {
        let catalogue = SchemaCatalogue::new("default".to_string(), vec![
            SchemaSource { id: "http".to_string(), url: "https://example.com/schema.json".to_string() },
        ]);
        assert!(matches!(
            catalogue.get("missing"),
            Err(ServiceError::Config(_))
        ));
        assert!(matches!(
            catalogue.get("http"),
            Err(ServiceError::Config(_))
        ));
    }
}
