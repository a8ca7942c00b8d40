//! Flow row model - one persisted multi-step self-service interaction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The self-service flow kinds. Each kind persists to its own table but the
/// row shape is identical, so the kind doubles as the table selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Login,
    Registration,
    Recovery,
    Verification,
    Settings,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Login => "login",
            FlowKind::Registration => "registration",
            FlowKind::Recovery => "recovery",
            FlowKind::Verification => "verification",
            FlowKind::Settings => "settings",
        }
    }

    /// Table holding rows of this kind. Static strings only, so the value is
    /// safe to splice into SQL.
    pub fn flow_table(&self) -> &'static str {
        match self {
            FlowKind::Login => "login_flows",
            FlowKind::Registration => "registration_flows",
            FlowKind::Recovery => "recovery_flows",
            FlowKind::Verification => "verification_flows",
            FlowKind::Settings => "settings_flows",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "login" => Some(FlowKind::Login),
            "registration" => Some(FlowKind::Registration),
            "recovery" => Some(FlowKind::Recovery),
            "verification" => Some(FlowKind::Verification),
            "settings" => Some(FlowKind::Settings),
            _ => None,
        }
    }
}

/// Flow lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    ChooseMethod,
    SentCode,
    PassedChallenge,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::ChooseMethod => "choose_method",
            FlowState::SentCode => "sent_code",
            FlowState::PassedChallenge => "passed_challenge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "choose_method" => Some(FlowState::ChooseMethod),
            "sent_code" => Some(FlowState::SentCode),
            "passed_challenge" => Some(FlowState::PassedChallenge),
            _ => None,
        }
    }
}

/// Flow row entity. `submit_count` is the brute-force governor: it only ever
/// grows, and past the ceiling the flow refuses code matching entirely.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Flow {
    pub id: Uuid,
    pub nid: Uuid,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub request_url: String,
    pub csrf_token: String,
    pub submit_count: i32,
    pub state: String,
    pub identity_id: Option<Uuid>,
    pub requested_via: Option<String>,
}

impl Flow {
    pub fn new(nid: Uuid, request_url: &str, csrf_token: String, lifespan: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            nid,
            expires_at: now + lifespan,
            issued_at: now,
            request_url: request_url.to_string(),
            csrf_token,
            submit_count: 0,
            state: FlowState::ChooseMethod.as_str().to_string(),
            identity_id: None,
            requested_via: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn flow_state(&self) -> Option<FlowState> {
        FlowState::parse(&self.state)
    }

    pub fn set_state(&mut self, state: FlowState) {
        self.state = state.as_str().to_string();
    }
}
