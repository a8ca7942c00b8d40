//! One-time code model. Only the HMAC of a code is ever persisted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::flow::FlowKind;

/// The code kinds mirror the flow kinds that issue them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Login,
    Registration,
    Recovery,
    Verification,
}

impl CodeKind {
    pub fn flow_kind(&self) -> FlowKind {
        match self {
            CodeKind::Login => FlowKind::Login,
            CodeKind::Registration => FlowKind::Registration,
            CodeKind::Recovery => FlowKind::Recovery,
            CodeKind::Verification => FlowKind::Verification,
        }
    }

    /// Table holding codes of this kind. Static strings only, safe to splice
    /// into SQL.
    pub fn code_table(&self) -> &'static str {
        match self {
            CodeKind::Login => "login_codes",
            CodeKind::Registration => "registration_codes",
            CodeKind::Recovery => "recovery_codes",
            CodeKind::Verification => "verification_codes",
        }
    }
}

/// One-time code row. The kind-specific target is whichever of the optional
/// columns is set: `identity_id` (login), `address`+`channel` (registration),
/// `recovery_address_id` (recovery), `verifiable_address_id` (verification).
#[derive(Debug, Clone, FromRow)]
pub struct OneTimeCode {
    pub id: Uuid,
    pub nid: Uuid,
    pub flow_id: Uuid,
    pub code_hmac: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub identity_id: Option<Uuid>,
    pub recovery_address_id: Option<Uuid>,
    pub verifiable_address_id: Option<Uuid>,
    pub address: Option<String>,
    pub channel: Option<String>,
}

impl OneTimeCode {
    pub fn new(nid: Uuid, flow_id: Uuid, code_hmac: String, lifespan: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            nid,
            flow_id,
            code_hmac,
            issued_at: now,
            expires_at: now + lifespan,
            used_at: None,
            identity_id: None,
            recovery_address_id: None,
            verifiable_address_id: None,
            address: None,
            channel: None,
        }
    }

    pub fn with_identity(mut self, identity_id: Uuid) -> Self {
        self.identity_id = Some(identity_id);
        self
    }

    pub fn with_address(mut self, address: &str, channel: &str) -> Self {
        self.address = Some(address.to_string());
        self.channel = Some(channel.to_string());
        self
    }

    pub fn with_recovery_address(mut self, id: Uuid) -> Self {
        self.recovery_address_id = Some(id);
        self
    }

    pub fn with_verifiable_address(mut self, id: Uuid) -> Self {
        self.verifiable_address_id = Some(id);
        self
    }

    /// Consumable while unused and unexpired.
    pub fn is_active(&self) -> bool {
        self.used_at.is_none() && Utc::now() < self.expires_at
    }
}
