pub mod cleanup;
pub mod code;
pub mod config;
pub mod continuity;
pub mod db;
pub mod flow;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod schema;
pub mod services;

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::middleware::from_fn;
use axum::routing::get;
use axum::Router;
use sqlx::PgPool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use service_core::middleware::{
    security_headers::security_headers_middleware, tracing::request_id_middleware,
};

use crate::code::CodeManager;
use crate::config::IdentityConfig;
use crate::continuity::ContinuityManager;
use crate::flow::FlowCoordinator;
use crate::identity::IdentityManager;
use crate::schema::SchemaCatalogue;
use crate::services::{SecretRotator, SessionIssuer, Store};

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub store: Store,
    pub secrets: Arc<SecretRotator>,
    pub schemas: Arc<SchemaCatalogue>,
    pub continuity: Arc<ContinuityManager>,
    pub codes: CodeManager,
    pub identities: IdentityManager,
    pub flows: FlowCoordinator,
    pub sessions: Arc<dyn SessionIssuer>,
}

impl AppState {
    pub fn new(config: IdentityConfig, pool: PgPool, sessions: Arc<dyn SessionIssuer>) -> Self {
        let store = Store::new(pool);
        let secrets = Arc::new(SecretRotator::new(config.secrets.session.clone()));
        let schemas = Arc::new(SchemaCatalogue::new(
            config.schemas.default_schema_id.clone(),
            config.schemas.schemas.clone(),
        ));
        let continuity = Arc::new(ContinuityManager::new(
            store.clone(),
            secrets.clone(),
            config.security.cookie_secure,
        ));
        let codes = CodeManager::new(store.clone(), secrets.clone());
        let identities = IdentityManager::new(
            store.clone(),
            schemas.clone(),
            codes.clone(),
            config.verifiable_address_lifespan(),
            config.code_lifespan(),
        );
        let flows = FlowCoordinator::new(
            store.clone(),
            codes.clone(),
            continuity.clone(),
            config.flow_lifespan(),
            config.code_lifespan(),
        );

        Self {
            config,
            store,
            secrets,
            schemas,
            continuity,
            codes,
            identities,
            flows,
            sessions,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .security
                .allowed_origins
                .iter()
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::error!("Invalid CORS origin '{}': {}", o, e);
                        None
                    }
                })
                .collect::<Vec<HeaderValue>>(),
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::COOKIE,
            axum::http::header::HeaderName::from_static("x-admin-api-key"),
        ]);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/self-service/exchange-code-for-session-token",
            get(handlers::exchange::exchange_code_for_session_token),
        )
        .route(
            "/self-service/:kind/api",
            get(handlers::flows::create_api_flow),
        )
        .route(
            "/self-service/:kind",
            axum::routing::post(handlers::flows::submit_flow),
        )
        .route(
            "/admin/identities",
            get(handlers::identities::list_identities)
                .post(handlers::identities::create_identity),
        )
        .route(
            "/admin/identities/:id",
            get(handlers::identities::get_identity)
                .put(handlers::identities::update_identity)
                .delete(handlers::identities::delete_identity),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(service_core::middleware::tracing::REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}
