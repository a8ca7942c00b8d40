//! Test helper module for identity-service integration tests.
//!
//! The suite runs against a real PostgreSQL database. Set `TEST_DATABASE_URL`
//! to enable it; without the variable every test skips itself. Each `TestApp`
//! gets a random network id, so tests never see each other's rows.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use identity_service::config::{
    CleanupConfig, DatabaseConfig, Environment, IdentityConfig, LifespanConfig,
    SchemaCatalogueConfig, SecretsConfig, SecurityConfig,
};
use identity_service::db;
use identity_service::schema::SchemaSource;
use identity_service::services::InMemorySessionIssuer;
use identity_service::{build_router, AppState};

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-12345";

/// Test application bound to a fresh random network id.
pub struct TestApp {
    pub state: AppState,
    pub nid: Uuid,
}

impl TestApp {
    /// Spawn the test application, or `None` when no test database is
    /// configured.
    pub async fn spawn() -> Option<Self> {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping integration test");
            return None;
        };

        let pool = db::create_pool(&DatabaseConfig {
            url,
            max_connections: 5,
        })
        .await
        .expect("Failed to create test pool");
        db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        let config = test_config(Uuid::new_v4());
        let sessions = Arc::new(InMemorySessionIssuer::new(chrono::Duration::hours(1)));
        let state = AppState::new(config, pool, sessions);
        Some(TestApp {
            nid: state.config.security.network_id,
            state,
        })
    }

    /// Issue one HTTP request against a fresh router instance.
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        admin: bool,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if admin {
            builder = builder.header("x-admin-api-key", TEST_ADMIN_API_KEY);
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = build_router(self.state.clone())
            .oneshot(request)
            .await
            .expect("request failed");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request("GET", uri, None, false).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request("POST", uri, Some(body), false).await
    }

    /// Create an identity through the admin API and return its body.
    pub async fn create_identity(&self, email: &str) -> Value {
        let (status, body) = self
            .request(
                "POST",
                "/admin/identities",
                Some(json!({ "traits": { "email": email } })),
                false,
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create identity: {body}");
        body
    }

    /// Create a self-service flow and return `(flow_id, csrf_token, body)`.
    pub async fn create_flow(&self, kind: &str, query: &str) -> (Uuid, String, Value) {
        let (status, body) = self.get(&format!("/self-service/{kind}/api{query}")).await;
        assert_eq!(status, StatusCode::OK, "create {kind} flow: {body}");
        let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
        let csrf = body["csrf_token"].as_str().unwrap().to_string();
        (id, csrf, body)
    }
}

/// Unique email so tests never collide on the identifier index.
pub fn unique_email(prefix: &str) -> String {
    format!("{prefix}-{}@example.com", Uuid::new_v4().simple())
}

fn test_schema() -> Value {
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
                            "credentials": { "password": { "identifier": true } },
                            "verification": { "via": "email" },
                            "recovery": { "via": "email" }
                        }
                    },
                    "name": { "type": "string" }
                },
                "required": ["email"],
                "additionalProperties": false
            }
        },
        "required": ["traits"]
    })
}

fn test_config(network_id: Uuid) -> IdentityConfig {
    let encoded = STANDARD.encode(serde_json::to_vec(&test_schema()).unwrap());
    IdentityConfig {
        common: service_core::config::Config {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        environment: Environment::Dev,
        service_name: "identity-service-test".to_string(),
        service_version: "0.0.0".to_string(),
        log_level: "debug".to_string(),
        database: DatabaseConfig {
            url: std::env::var("TEST_DATABASE_URL").unwrap_or_default(),
            max_connections: 5,
        },
        secrets: SecretsConfig {
            session: vec!["test-rotation-secret-one".to_string()],
        },
        lifespans: LifespanConfig {
            flow_minutes: 10,
            code_minutes: 10,
            verifiable_address_hours: 1,
            continuity_seconds: 60,
        },
        cleanup: CleanupConfig {
            interval_seconds: 300,
            batch_size: 100,
            sleep_tables_millis: 0,
        },
        schemas: SchemaCatalogueConfig {
            default_schema_id: "default".to_string(),
            schemas: vec![SchemaSource {
                id: "default".to_string(),
                url: format!("base64://{encoded}"),
            }],
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: TEST_ADMIN_API_KEY.to_string(),
            cookie_secure: false,
            network_id,
        },
    }
}
