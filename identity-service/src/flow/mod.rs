//! Flow lifecycle coordination.
//!
//! The coordinator owns the glue between a persisted flow row, its optional
//! continuity container, its optional session-token exchanger, and the code
//! manager: it creates flows, pauses and resumes them across redirects,
//! relinks exchangers when an upstream round trip minted a fresh flow id,
//! and drives the submit path that consumes a one-time code.

use std::sync::Arc;

use axum_extra::extract::cookie::CookieJar;
use chrono::{Duration, Utc};
use rand::Rng;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::code::{CodeManager, CodeTarget};
use crate::continuity::{ContinuityManager, ContinuityOptions};
use crate::models::{CodeKind, Flow, FlowKind, FlowState, OneTimeCode, SessionTokenExchange};
use crate::services::{ServiceError, Store};

/// Container name under which a flow of the given kind is paused.
pub fn continuity_name(kind: FlowKind) -> String {
    format!("ory_kratos_{}_flow", kind.as_str())
}

#[derive(Clone)]
pub struct FlowCoordinator {
    store: Store,
    codes: CodeManager,
    continuity: Arc<ContinuityManager>,
    flow_lifespan: Duration,
    code_lifespan: Duration,
}

impl FlowCoordinator {
    pub fn new(
        store: Store,
        codes: CodeManager,
        continuity: Arc<ContinuityManager>,
        flow_lifespan: Duration,
        code_lifespan: Duration,
    ) -> Self {
        Self {
            store,
            codes,
            continuity,
            flow_lifespan,
            code_lifespan,
        }
    }

    /// Create and persist a fresh flow. With `session_token_exchange` the
    /// flow also gets its exchanger row, so an API client polling
    /// out-of-band can later trade the exchange code for a session.
    pub async fn create_flow(
        &self,
        kind: FlowKind,
        nid: Uuid,
        request_url: &str,
        session_token_exchange: bool,
    ) -> Result<Flow, ServiceError> {
        let flow = Flow::new(nid, request_url, random_token(), self.flow_lifespan);
        self.store.create_flow(kind, &flow).await?;

        if session_token_exchange {
            let exchange = SessionTokenExchange::new(nid, flow.id, random_token());
            self.store.create_exchanger(&exchange).await?;
        }
        Ok(flow)
    }

    /// Fetch a flow, treating expiry as non-resumable.
    pub async fn get_active_flow(
        &self,
        kind: FlowKind,
        nid: Uuid,
        id: Uuid,
    ) -> Result<Flow, ServiceError> {
        let flow = self.store.get_flow(kind, nid, id).await?;
        if flow.is_expired() {
            return Err(ServiceError::NotResumable(anyhow::anyhow!(
                "the {} flow has expired",
                kind.as_str()
            )));
        }
        Ok(flow)
    }

    /// Pause a flow before handing the user agent off to a third party. The
    /// container lives as long as the flow does and carries the flow id as
    /// payload; the returned string doubles as the RelayState token.
    pub async fn pause_flow(
        &self,
        jar: CookieJar,
        kind: FlowKind,
        flow: &Flow,
    ) -> Result<(CookieJar, String), ServiceError> {
        let remaining = flow.expires_at - Utc::now();
        self.continuity
            .pause(
                jar,
                flow.nid,
                &continuity_name(kind),
                ContinuityOptions {
                    identity_id: flow.identity_id,
                    lifespan: Some(remaining),
                    payload: Some(serde_json::json!({ "flow_id": flow.id })),
                },
            )
            .await
    }

    /// Resume the flow paused under this kind's container name.
    pub async fn resume_flow(
        &self,
        jar: CookieJar,
        kind: FlowKind,
        nid: Uuid,
        identity_id: Option<Uuid>,
    ) -> (CookieJar, Result<Flow, ServiceError>) {
        let (jar, container) = self
            .continuity
            .resume(jar, nid, &continuity_name(kind), identity_id)
            .await;
        let flow = match container {
            Ok(container) => self.flow_from_container(kind, nid, container).await,
            Err(err) => Err(err),
        };
        (jar, flow)
    }

    async fn flow_from_container(
        &self,
        kind: FlowKind,
        nid: Uuid,
        container: crate::models::Container,
    ) -> Result<Flow, ServiceError> {
        let flow_id = container
            .payload
            .as_ref()
            .and_then(|p| p.get("flow_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                ServiceError::NotResumable(anyhow::anyhow!(
                    "paused interaction does not reference a flow"
                ))
            })?;
        self.get_active_flow(kind, nid, flow_id).await
    }

    /// Relink the exchanger after an upstream redirect replaced the flow id.
    /// Flows without an exchanger are left alone.
    pub async fn move_flow(
        &self,
        nid: Uuid,
        old_flow_id: Uuid,
        new_flow_id: Uuid,
    ) -> Result<(), ServiceError> {
        match self
            .store
            .move_exchanger_to_new_flow(nid, old_flow_id, new_flow_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Issue a code for the flow and advance it to `sent_code`.
    pub async fn send_code(
        &self,
        kind: CodeKind,
        flow: &mut Flow,
        target: CodeTarget,
    ) -> Result<(String, OneTimeCode), ServiceError> {
        if let CodeTarget::Identity(identity_id) = &target {
            flow.identity_id = Some(*identity_id);
        }
        if let CodeTarget::RecoveryAddress { via, identity_id, .. } = &target {
            flow.identity_id = Some(*identity_id);
            flow.requested_via = Some(via.as_str().to_string());
        }

        let issued = self.codes.issue(kind, flow, self.code_lifespan, target).await?;
        flow.set_state(FlowState::SentCode);
        self.store.update_flow(kind.flow_kind(), flow).await?;
        Ok(issued)
    }

    /// Constant-time check of a submitted anti-CSRF token.
    pub fn verify_csrf(&self, flow: &Flow, submitted: &str) -> Result<(), ServiceError> {
        if !token_matches(submitted, &flow.csrf_token) {
            return Err(ServiceError::ValidationFailed(
                "the anti-CSRF token is missing or invalid".to_string(),
            ));
        }
        Ok(())
    }

    /// Consume a submitted code and advance the flow to `passed_challenge`.
    /// The CSRF token is checked first, in constant time; the kind-specific
    /// constraint is applied inside the consume transaction.
    pub async fn submit_code(
        &self,
        kind: CodeKind,
        flow: &mut Flow,
        csrf_token: &str,
        submitted: &str,
    ) -> Result<OneTimeCode, ServiceError> {
        self.submit_code_with(kind, flow, csrf_token, submitted, &|_| true)
            .await
    }

    /// Like `submit_code` with an extra caller-supplied constraint joined to
    /// the kind-specific one (e.g. registration checking the code's address
    /// against the submitted traits).
    pub async fn submit_code_with(
        &self,
        kind: CodeKind,
        flow: &mut Flow,
        csrf_token: &str,
        submitted: &str,
        extra: &(dyn Fn(&OneTimeCode) -> bool + Sync),
    ) -> Result<OneTimeCode, ServiceError> {
        self.verify_csrf(flow, csrf_token)?;
        if flow.is_expired() {
            return Err(ServiceError::NotResumable(anyhow::anyhow!(
                "the {} flow has expired",
                kind.flow_kind().as_str()
            )));
        }

        let base = kind_constraint(kind, flow.identity_id, flow.requested_via.clone());
        let constraint = move |code: &OneTimeCode| base(code) && extra(code);
        let code = self
            .codes
            .use_code(kind, flow.nid, flow.id, submitted, &constraint)
            .await?;

        flow.set_state(FlowState::PassedChallenge);
        if flow.identity_id.is_none() {
            flow.identity_id = code.identity_id;
        }
        self.store.update_flow(kind.flow_kind(), flow).await?;
        Ok(code)
    }
}

/// The per-kind domain constraint on a matched code row. Failing it looks
/// exactly like a wrong code.
fn kind_constraint(
    kind: CodeKind,
    flow_identity: Option<Uuid>,
    requested_via: Option<String>,
) -> Box<dyn Fn(&OneTimeCode) -> bool + Send + Sync> {
    match kind {
        // A login code must belong to the identity the flow selected.
        CodeKind::Login => Box::new(move |code: &OneTimeCode| {
            flow_identity.is_some() && code.identity_id == flow_identity
        }),
        // Registration codes are bound to the claimed address.
        CodeKind::Registration => Box::new(|code: &OneTimeCode| code.address.is_some()),
        // A recovery code must have been requested over the channel the
        // flow asked for.
        CodeKind::Recovery => Box::new(move |code: &OneTimeCode| {
            code.recovery_address_id.is_some()
                && (requested_via.is_none() || code.channel == requested_via)
        }),
        CodeKind::Verification => {
            Box::new(|code: &OneTimeCode| code.verifiable_address_id.is_some())
        }
    }
}

fn token_matches(submitted: &str, expected: &str) -> bool {
    submitted.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// 256-bit random token, hex-encoded. Used for CSRF tokens and session
/// token exchange codes.
pub fn random_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_shape() {
        let token = random_token();
        assert_eq!(token.len(), 64);
        assert_ne!(token, random_token());
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("abc", "abc"));
        assert!(!token_matches("abc", "abd"));
        assert!(!token_matches("", "abc"));
    }

    #[test]
    fn test_login_constraint_requires_flow_identity() {
        let flow = Flow::new(Uuid::new_v4(), "http://x", "tok".into(), Duration::minutes(10));
        let code = OneTimeCode::new(flow.nid, flow.id, "ab".repeat(32), Duration::minutes(15))
            .with_identity(Uuid::new_v4());
        // Flow never selected an identity: nothing can match.
        assert!(!kind_constraint(CodeKind::Login, None, None)(&code));
        assert!(kind_constraint(CodeKind::Login, code.identity_id, None)(&code));
        assert!(!kind_constraint(CodeKind::Login, Some(Uuid::new_v4()), None)(&code));
    }

    #[test]
    fn test_recovery_constraint_checks_channel() {
        let flow = Flow::new(Uuid::new_v4(), "http://x", "tok".into(), Duration::minutes(10));
        let mut code = OneTimeCode::new(flow.nid, flow.id, "ab".repeat(32), Duration::minutes(15))
            .with_recovery_address(Uuid::new_v4());
        code.channel = Some("email".to_string());
        let email_constraint = kind_constraint(CodeKind::Recovery, None, Some("email".to_string()));
        assert!(email_constraint(&code));

        code.channel = Some("sms".to_string());
        assert!(!email_constraint(&code));
    }
}
