//! Admin identity CRUD.
//!
//! Every caller can manage identities through traits; only callers holding
//! the admin API key may touch credentials or verification state. An
//! unprivileged update that tries is answered with the restored pre-image
//! so the caller sees exactly what is still persisted.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use service_core::error::AppError;
use uuid::Uuid;

use crate::handlers::is_privileged;
use crate::models::{Credentials, CredentialsType, Identity, RecoveryAddress, VerifiableAddress};
use crate::services::ServiceError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListIdentitiesQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct GetIdentityQuery {
    #[serde(default)]
    pub include_credentials: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateIdentityRequest {
    pub schema_id: Option<String>,
    pub traits: Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateIdentityRequest {
    pub schema_id: Option<String>,
    pub traits: Value,
    pub state: Option<String>,
    #[serde(default)]
    pub credentials: BTreeMap<CredentialsType, Credentials>,
    #[serde(default)]
    pub verifiable_addresses: Vec<VerifiableAddress>,
    #[serde(default)]
    pub recovery_addresses: Vec<RecoveryAddress>,
}

/// `GET /admin/identities`
pub async fn list_identities(
    State(state): State<AppState>,
    Query(query): Query<ListIdentitiesQuery>,
) -> Result<Json<Vec<Identity>>, AppError> {
    let nid = state.config.security.network_id;
    let per_page = query.per_page.unwrap_or(100).clamp(1, 500);
    let page = query.page.unwrap_or(1).max(1);
    let identities = state
        .store
        .list_identities(nid, per_page, (page - 1) * per_page)
        .await
        .map_err(AppError::from)?;
    Ok(Json(identities))
}

/// `GET /admin/identities/:id`
pub async fn get_identity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetIdentityQuery>,
    headers: HeaderMap,
) -> Result<Json<Identity>, AppError> {
    let nid = state.config.security.network_id;
    let identity = if query.include_credentials && is_privileged(&state, &headers) {
        state.store.get_identity_confidential(nid, id).await
    } else {
        state.store.get_identity(nid, id).await
    }
    .map_err(AppError::from)?;
    Ok(Json(identity))
}

/// `POST /admin/identities`
pub async fn create_identity(
    State(state): State<AppState>,
    Json(body): Json<CreateIdentityRequest>,
) -> Result<(StatusCode, Json<Identity>), AppError> {
    let nid = state.config.security.network_id;
    let schema_id = body
        .schema_id
        .unwrap_or_else(|| state.schemas.default_schema_id().to_string());
    let mut identity = Identity::new(nid, &schema_id, body.traits);
    state
        .identities
        .create(&mut identity)
        .await
        .map_err(AppError::from)?;
    Ok((StatusCode::CREATED, Json(identity.without_credentials())))
}

/// `PUT /admin/identities/:id`
pub async fn update_identity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<UpdateIdentityRequest>,
) -> Result<Response, AppError> {
    let nid = state.config.security.network_id;
    let privileged = is_privileged(&state, &headers);

    let mut identity = state
        .store
        .get_identity_confidential(nid, id)
        .await
        .map_err(AppError::from)?;
    if let Some(schema_id) = body.schema_id {
        identity.schema_id = schema_id;
    }
    identity.traits = body.traits;
    if let Some(new_state) = body.state {
        if identity.state != new_state {
            identity.state = new_state;
            identity.state_changed_at = Utc::now();
        }
    }
    if !body.credentials.is_empty() {
        identity.credentials = body.credentials;
    }
    if !body.verifiable_addresses.is_empty() {
        identity.verifiable_addresses = body.verifiable_addresses;
    }
    if !body.recovery_addresses.is_empty() {
        identity.recovery_addresses = body.recovery_addresses;
    }

    match state.identities.update(&mut identity, privileged).await {
        Ok(()) => Ok(Json(identity.without_credentials()).into_response()),
        Err(ServiceError::ProtectedFieldModified) => {
            // `identity` was restored to the stored pre-image by the manager.
            Ok((
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": "Modifying credentials or verified addresses requires a privileged caller",
                    "identity": identity.without_credentials(),
                })),
            )
                .into_response())
        }
        Err(err) => Err(AppError::from(err)),
    }
}

/// `DELETE /admin/identities/:id`
pub async fn delete_identity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let nid = state.config.security.network_id;
    state
        .store
        .delete_identity(nid, id)
        .await
        .map_err(AppError::from)?;
    Ok(StatusCode::NO_CONTENT)
}
