use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use uuid::Uuid;

use crate::cleanup::CleanupSettings;
use crate::schema::SchemaSource;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub secrets: SecretsConfig,
    pub lifespans: LifespanConfig,
    pub cleanup: CleanupConfig,
    pub schemas: SchemaCatalogueConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    /// MAC rotation list; the first entry signs, all entries verify.
    pub session: Vec<String>,
}

/// All durations the core hands out, in one place.
#[derive(Debug, Clone, Deserialize)]
pub struct LifespanConfig {
    pub flow_minutes: i64,
    pub code_minutes: i64,
    pub verifiable_address_hours: i64,
    pub continuity_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    pub interval_seconds: u64,
    pub batch_size: i64,
    pub sleep_tables_millis: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaCatalogueConfig {
    pub default_schema_id: String,
    pub schemas: Vec<SchemaSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: String,
    pub cookie_secure: bool,
    /// Tenant scope stamped on every row this instance touches.
    pub network_id: Uuid,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?
                    .parse()
                    .unwrap_or(10),
            },
            secrets: SecretsConfig {
                session: get_env("SECRETS_SESSION", None, is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            lifespans: LifespanConfig {
                flow_minutes: get_env("FLOW_LIFESPAN_MINUTES", Some("60"), is_prod)?
                    .parse()
                    .unwrap_or(60),
                code_minutes: get_env("CODE_LIFESPAN_MINUTES", Some("15"), is_prod)?
                    .parse()
                    .unwrap_or(15),
                verifiable_address_hours: get_env(
                    "VERIFIABLE_ADDRESS_LIFESPAN_HOURS",
                    Some("24"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(24),
                continuity_seconds: get_env("CONTINUITY_LIFESPAN_SECONDS", Some("60"), is_prod)?
                    .parse()
                    .unwrap_or(60),
            },
            cleanup: CleanupConfig {
                interval_seconds: get_env("CLEANUP_INTERVAL_SECONDS", Some("300"), is_prod)?
                    .parse()
                    .unwrap_or(300),
                batch_size: get_env("CLEANUP_BATCH_SIZE", Some("500"), is_prod)?
                    .parse()
                    .unwrap_or(500),
                sleep_tables_millis: get_env("CLEANUP_SLEEP_TABLES_MILLIS", Some("250"), is_prod)?
                    .parse()
                    .unwrap_or(250),
            },
            schemas: SchemaCatalogueConfig {
                default_schema_id: get_env("DEFAULT_SCHEMA_ID", Some("default"), is_prod)?,
                schemas: serde_json::from_str(&get_env(
                    "IDENTITY_SCHEMAS",
                    Some(r#"[{"id":"default","url":"file://config/identity.schema.json"}]"#),
                    is_prod,
                )?)
                .map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("IDENTITY_SCHEMAS is not valid JSON: {e}"))
                })?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
                admin_api_key: get_env("ADMIN_API_KEY", None, is_prod)?,
                cookie_secure: get_env("COOKIE_SECURE", Some("false"), is_prod)?
                    .parse()
                    .unwrap_or(is_prod),
                network_id: get_env(
                    "NETWORK_ID",
                    Some("00000000-0000-0000-0000-000000000000"),
                    is_prod,
                )?
                .parse()
                .map_err(|e: uuid::Error| {
                    AppError::ConfigError(anyhow::anyhow!("NETWORK_ID is not a UUID: {e}"))
                })?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.secrets.session.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SECRETS_SESSION must contain at least one secret"
            )));
        }

        if self.cleanup.batch_size <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CLEANUP_BATCH_SIZE must be positive"
            )));
        }

        if self.lifespans.flow_minutes <= 0 || self.lifespans.code_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "flow and code lifespans must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }
            if self.secrets.session.iter().any(|s| s.len() < 16) {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "SECRETS_SESSION entries must be at least 16 characters in production"
                )));
            }
            if !self.security.cookie_secure {
                tracing::error!(
                    "Continuity cookies are not marked Secure in production - set COOKIE_SECURE=true"
                );
            }
        }

        Ok(())
    }

    pub fn flow_lifespan(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lifespans.flow_minutes)
    }

    pub fn code_lifespan(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lifespans.code_minutes)
    }

    pub fn verifiable_address_lifespan(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lifespans.verifiable_address_hours)
    }

    pub fn continuity_lifespan(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lifespans.continuity_seconds)
    }

    pub fn cleanup_settings(&self) -> CleanupSettings {
        CleanupSettings {
            interval: std::time::Duration::from_secs(self.cleanup.interval_seconds),
            batch_size: self.cleanup.batch_size,
            sleep_between_tables: std::time::Duration::from_millis(
                self.cleanup.sleep_tables_millis,
            ),
        }
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_falls_back_in_dev() {
        let value = get_env("IDENTITY_TEST_UNSET_WITH_DEFAULT", Some("fallback"), false).unwrap();
        assert_eq!(value, "fallback");
    }

    #[test]
    fn test_get_env_required_key_missing_in_dev() {
        let err = get_env("IDENTITY_TEST_UNSET_REQUIRED", None, false).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("required but not set"), "{message}");
        assert!(!message.contains("production"), "{message}");
    }

    #[test]
    fn test_get_env_prod_ignores_defaults() {
        let err = get_env("IDENTITY_TEST_UNSET_PROD", Some("fallback"), true).unwrap_err();
        assert!(err.to_string().contains("production"));
    }
}
