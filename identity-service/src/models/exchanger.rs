//! Session-token exchanger row - lets a browserless client trade an opaque
//! code for the session created at the end of a flow.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Exactly one row exists per `(nid, flow_id)`; the code is indexed and the
/// session id stays null until the flow completes.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SessionTokenExchange {
    pub id: Uuid,
    pub nid: Uuid,
    pub flow_id: Uuid,
    pub session_id: Option<Uuid>,
    pub code: String,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl SessionTokenExchange {
    pub fn new(nid: Uuid, flow_id: Uuid, code: String) -> Self {
        debug_assert!(!code.is_empty());
        Self {
            id: Uuid::new_v4(),
            nid,
            flow_id,
            session_id: None,
            code,
            consumed_at: None,
        }
    }
}
