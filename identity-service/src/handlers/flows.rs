//! Self-service flow endpoints.
//!
//! `GET /self-service/{kind}/api` creates a flow for an API client;
//! `POST /self-service/{kind}?flow=<uuid>` either requests a code (no
//! `code` in the body) or submits one. Send responses look identical
//! whether or not the target address exists, so the endpoints cannot be
//! used to enumerate accounts.

use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::http::Uri;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use uuid::Uuid;

use crate::code::CodeTarget;
use crate::models::{
    AddressStatus, Channel, CodeKind, CredentialsType, Flow, FlowKind, FlowState, Identity,
    OneTimeCode,
};
use crate::schema::SchemaExtensionRunner;
use crate::services::{IssuedSession, ServiceError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateFlowQuery {
    #[serde(default)]
    pub return_session_token_exchange_code: bool,
    /// Settings flows act on behalf of an identity.
    pub identity_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitFlowQuery {
    pub flow: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitFlowRequest {
    pub csrf_token: Option<String>,
    pub code: Option<String>,
    pub email: Option<String>,
    pub via: Option<String>,
    pub traits: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct FlowView {
    pub id: Uuid,
    pub kind: FlowKind,
    pub state: String,
    pub issued_at: chrono::DateTime<Utc>,
    pub expires_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_via: Option<String>,
}

fn flow_view(kind: FlowKind, flow: &Flow) -> FlowView {
    FlowView {
        id: flow.id,
        kind,
        state: flow.state.clone(),
        issued_at: flow.issued_at,
        expires_at: flow.expires_at,
        requested_via: flow.requested_via.clone(),
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedFlowResponse {
    #[serde(flatten)]
    pub flow: FlowView,
    pub csrf_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token_exchange_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitFlowResponse {
    #[serde(flatten)]
    pub flow: FlowView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<IssuedSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

fn parse_kind(kind: &str) -> Result<FlowKind, AppError> {
    FlowKind::parse(kind)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("unknown flow kind {kind}")))
}

/// `GET /self-service/{kind}/api`
pub async fn create_api_flow(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<CreateFlowQuery>,
    uri: Uri,
) -> Result<Json<CreatedFlowResponse>, AppError> {
    let kind = parse_kind(&kind)?;
    let nid = state.config.security.network_id;

    let wants_exchange = query.return_session_token_exchange_code
        && matches!(
            kind,
            FlowKind::Login | FlowKind::Registration | FlowKind::Recovery
        );
    let mut flow = state
        .flows
        .create_flow(kind, nid, &uri.to_string(), wants_exchange)
        .await
        .map_err(AppError::from)?;

    if kind == FlowKind::Settings {
        let identity_id = query.identity_id.ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("settings flows require an identity_id"))
        })?;
        flow.identity_id = Some(identity_id);
        state
            .store
            .update_flow(kind, &flow)
            .await
            .map_err(AppError::from)?;
    }

    let session_token_exchange_code = if wants_exchange {
        Some(
            state
                .store
                .get_exchanger_by_flow(nid, flow.id)
                .await
                .map_err(AppError::from)?
                .code,
        )
    } else {
        None
    };

    Ok(Json(CreatedFlowResponse {
        flow: flow_view(kind, &flow),
        csrf_token: flow.csrf_token.clone(),
        session_token_exchange_code,
    }))
}

/// `POST /self-service/{kind}?flow=<uuid>`
pub async fn submit_flow(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<SubmitFlowQuery>,
    Json(body): Json<SubmitFlowRequest>,
) -> Result<Json<SubmitFlowResponse>, AppError> {
    let kind = parse_kind(&kind)?;
    let nid = state.config.security.network_id;
    let flow_id = query
        .flow
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("missing flow query parameter")))?;
    let flow = state
        .flows
        .get_active_flow(kind, nid, flow_id)
        .await
        .map_err(AppError::from)?;

    match kind {
        FlowKind::Settings => submit_settings(&state, flow, body).await,
        FlowKind::Login => code_flow(&state, CodeKind::Login, flow, body).await,
        FlowKind::Registration => code_flow(&state, CodeKind::Registration, flow, body).await,
        FlowKind::Recovery => code_flow(&state, CodeKind::Recovery, flow, body).await,
        FlowKind::Verification => code_flow(&state, CodeKind::Verification, flow, body).await,
    }
}

async fn submit_settings(
    state: &AppState,
    mut flow: Flow,
    body: SubmitFlowRequest,
) -> Result<Json<SubmitFlowResponse>, AppError> {
    state
        .flows
        .verify_csrf(&flow, body.csrf_token.as_deref().unwrap_or(""))
        .map_err(AppError::from)?;
    let traits = body
        .traits
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("traits are required")))?;
    let identity_id = flow.identity_id.ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("the settings flow is not bound to an identity"))
    })?;

    // Self-service settings are always unprivileged.
    let identity = state
        .identities
        .update_traits(flow.nid, identity_id, traits, false)
        .await
        .map_err(AppError::from)?;

    flow.set_state(FlowState::PassedChallenge);
    state
        .store
        .update_flow(FlowKind::Settings, &flow)
        .await
        .map_err(AppError::from)?;

    Ok(Json(SubmitFlowResponse {
        flow: flow_view(FlowKind::Settings, &flow),
        session: None,
        session_token: None,
        identity: Some(identity.without_credentials()),
    }))
}

async fn code_flow(
    state: &AppState,
    kind: CodeKind,
    flow: Flow,
    body: SubmitFlowRequest,
) -> Result<Json<SubmitFlowResponse>, AppError> {
    match body.code {
        Some(_) => submit_code(state, kind, flow, body).await,
        None => send_code(state, kind, flow, body).await,
    }
}

/// The send step. When the target address does not resolve, the flow still
/// advances to `sent_code` and the response is byte-identical to the happy
/// path; only no code row exists.
async fn send_code(
    state: &AppState,
    kind: CodeKind,
    mut flow: Flow,
    body: SubmitFlowRequest,
) -> Result<Json<SubmitFlowResponse>, AppError> {
    state
        .flows
        .verify_csrf(&flow, body.csrf_token.as_deref().unwrap_or(""))
        .map_err(AppError::from)?;
    let email = body
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("an address is required")))?;
    let via = match body.via.as_deref() {
        None => Channel::Email,
        Some(v) => Channel::parse(v)
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("unknown channel {v}")))?,
    };
    let nid = flow.nid;

    let target = match kind {
        CodeKind::Login => state
            .store
            .find_by_credentials_identifier(nid, CredentialsType::Password, &email)
            .await
            .map(|identity| CodeTarget::Identity(identity.id)),
        CodeKind::Registration => Ok(CodeTarget::Address {
            address: email.clone(),
            channel: via.as_str().to_string(),
        }),
        CodeKind::Recovery => state
            .store
            .find_recovery_address(nid, &email, via)
            .await
            .map(|(identity_id, address)| CodeTarget::RecoveryAddress {
                address_id: address.id,
                identity_id,
                via,
            }),
        CodeKind::Verification => state
            .store
            .find_verifiable_address(nid, &email, via)
            .await
            .map(|(identity_id, address)| CodeTarget::VerifiableAddress {
                address_id: address.id,
                identity_id: Some(identity_id),
            }),
    };

    match target {
        Ok(target) => {
            let (_plaintext, code) = state
                .flows
                .send_code(kind, &mut flow, target)
                .await
                .map_err(AppError::from)?;
            // Delivery belongs to the courier, which picks the row up by id.
            tracing::debug!(flow_id = %flow.id, code_id = %code.id, "One-time code issued");
        }
        Err(err) if err.is_not_found() => {
            // Unknown address: advance the flow anyway so the response does
            // not disclose whether the account exists.
            flow.set_state(FlowState::SentCode);
            state
                .store
                .update_flow(kind.flow_kind(), &flow)
                .await
                .map_err(AppError::from)?;
            tracing::debug!(flow_id = %flow.id, "Code requested for unknown address");
        }
        Err(err) => return Err(AppError::from(err)),
    }

    Ok(Json(SubmitFlowResponse {
        flow: flow_view(kind.flow_kind(), &flow),
        session: None,
        session_token: None,
        identity: None,
    }))
}

async fn submit_code(
    state: &AppState,
    kind: CodeKind,
    mut flow: Flow,
    body: SubmitFlowRequest,
) -> Result<Json<SubmitFlowResponse>, AppError> {
    let csrf = body.csrf_token.as_deref().unwrap_or("");
    let submitted = body.code.as_deref().unwrap_or("");
    let nid = flow.nid;

    match kind {
        CodeKind::Login => {
            let code = state
                .flows
                .submit_code(kind, &mut flow, csrf, submitted)
                .await
                .map_err(AppError::from)?;
            let identity_id = code
                .identity_id
                .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("login code without identity")))?;
            finish_with_session(state, kind, flow, identity_id, None).await
        }
        CodeKind::Registration => {
            let traits = body
                .traits
                .clone()
                .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("traits are required")))?;
            let derived = derived_addresses(state, &traits)?;
            let extra = move |code: &OneTimeCode| {
                code.address
                    .as_deref()
                    .map_or(false, |a| derived.contains(&a.trim().to_lowercase()))
            };
            let code = state
                .flows
                .submit_code_with(kind, &mut flow, csrf, submitted, &extra)
                .await
                .map_err(AppError::from)?;

            let mut identity = Identity::new(nid, state.schemas.default_schema_id(), traits);
            state
                .identities
                .create(&mut identity)
                .await
                .map_err(AppError::from)?;
            mark_claimed_address_verified(state, nid, &identity, &code).await?;

            finish_with_session(state, kind, flow, identity.id, Some(identity.without_credentials()))
                .await
        }
        CodeKind::Recovery => {
            let code = state
                .flows
                .submit_code(kind, &mut flow, csrf, submitted)
                .await
                .map_err(AppError::from)?;
            let identity_id = code.identity_id.ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!("recovery code without identity"))
            })?;
            finish_with_session(state, kind, flow, identity_id, None).await
        }
        CodeKind::Verification => {
            let code = state
                .flows
                .submit_code(kind, &mut flow, csrf, submitted)
                .await
                .map_err(AppError::from)?;
            verify_address(state, nid, &code).await?;
            Ok(Json(SubmitFlowResponse {
                flow: flow_view(kind.flow_kind(), &flow),
                session: None,
                session_token: None,
                identity: None,
            }))
        }
    }
}

/// Emails and identifiers derivable from a traits document, for checking a
/// registration code's claimed address.
fn derived_addresses(state: &AppState, traits: &Value) -> Result<HashSet<String>, AppError> {
    let schema = state
        .schemas
        .get(state.schemas.default_schema_id())
        .map_err(AppError::from)?;
    let document = serde_json::json!({ "traits": traits });
    let output = SchemaExtensionRunner::new()
        .run(&schema, &document)
        .map_err(AppError::from)?;
    Ok(output
        .verifiable
        .iter()
        .map(|(v, _)| v.clone())
        .chain(output.identifiers.iter().map(|(_, v)| v.clone()))
        .collect())
}

async fn mark_claimed_address_verified(
    state: &AppState,
    nid: Uuid,
    identity: &Identity,
    code: &OneTimeCode,
) -> Result<(), AppError> {
    let Some(claimed) = code.address.as_deref() else {
        return Ok(());
    };
    if let Some(address) = identity
        .verifiable_addresses
        .iter()
        .find(|a| a.value == claimed && Some(a.via.as_str()) == code.channel.as_deref())
    {
        let mut address = address.clone();
        address.verified = true;
        address.status = AddressStatus::Completed.as_str().to_string();
        address.verified_at = Some(Utc::now());
        state
            .store
            .update_verifiable_address(nid, &address)
            .await
            .map_err(AppError::from)?;
    }
    Ok(())
}

async fn verify_address(
    state: &AppState,
    nid: Uuid,
    code: &OneTimeCode,
) -> Result<(), AppError> {
    let address_id = code.verifiable_address_id.ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!("verification code without address"))
    })?;
    // The address may have been dropped from the traits since the code was
    // sent; that burns the code.
    let mut address = match state.store.get_verifiable_address(nid, address_id).await {
        Ok(address) => address,
        Err(err) if err.is_not_found() => {
            return Err(AppError::from(ServiceError::InvalidCode));
        }
        Err(err) => return Err(AppError::from(err)),
    };
    address.verified = true;
    address.status = AddressStatus::Completed.as_str().to_string();
    address.verified_at = Some(Utc::now());
    state
        .store
        .update_verifiable_address(nid, &address)
        .await
        .map_err(AppError::from)
}

async fn finish_with_session(
    state: &AppState,
    kind: CodeKind,
    flow: Flow,
    identity_id: Uuid,
    identity: Option<Identity>,
) -> Result<Json<SubmitFlowResponse>, AppError> {
    let nid = flow.nid;
    let session = state
        .sessions
        .issue(nid, identity_id)
        .await
        .map_err(AppError::from)?;

    // Only flows created with an exchanger have one; everyone else is a
    // browser client that keeps the session directly.
    match state
        .store
        .update_exchanger_session(nid, flow.id, session.id)
        .await
    {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(AppError::from(err)),
    }

    Ok(Json(SubmitFlowResponse {
        flow: flow_view(kind.flow_kind(), &flow),
        session_token: Some(session.token.clone()),
        session: Some(session),
        identity,
    }))
}
