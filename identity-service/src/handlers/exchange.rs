//! `GET /self-service/exchange-code-for-session-token`
//!
//! API clients that completed a flow out-of-band trade their one-time
//! exchange code for the session minted when the flow passed its challenge.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use crate::services::IssuedSession;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ExchangeQuery {
    pub code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExchangeResponse {
    pub session_token: String,
    pub session: IssuedSession,
}

pub async fn exchange_code_for_session_token(
    State(state): State<AppState>,
    Query(query): Query<ExchangeQuery>,
) -> Result<Json<ExchangeResponse>, AppError> {
    let nid = state.config.security.network_id;
    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("no exchange code provided")))?;

    let exchanger = state
        .store
        .get_exchanger_by_code(nid, &code)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("unknown exchange code")))?;

    if exchanger.consumed_at.is_some() {
        return Err(AppError::Gone(anyhow::anyhow!(
            "the exchange code was already used"
        )));
    }
    // The flow has not passed its challenge yet, so there is no session to
    // hand out. The code stays unconsumed and can be retried.
    let session_id = exchanger.session_id.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("the flow has not completed yet"))
    })?;

    // Atomic consume closes the race between two exchanges of the same code.
    state
        .store
        .try_consume_exchanger(nid, &code)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::Gone(anyhow::anyhow!("the exchange code was already used")))?;

    let session = state
        .sessions
        .get(nid, session_id)
        .await
        .map_err(AppError::from)?;

    Ok(Json(ExchangeResponse {
        session_token: session.token.clone(),
        session,
    }))
}
