pub mod exchange;
pub mod flows;
pub mod health;
pub mod identities;

use subtle::ConstantTimeEq;

use crate::AppState;

/// A caller presenting the admin API key is privileged; everyone else is
/// not. Absence and mismatch are indistinguishable.
pub fn is_privileged(state: &AppState, headers: &axum::http::HeaderMap) -> bool {
    let Some(presented) = headers
        .get("x-admin-api-key")
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    presented
        .as_bytes()
        .ct_eq(state.config.security.admin_api_key.as_bytes())
        .into()
}
