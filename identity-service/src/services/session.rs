//! Session issuance seam.
//!
//! The core completes flows; turning a completed flow into a session is the
//! owning platform's job. The trait keeps that boundary explicit and lets
//! tests run without any session infrastructure.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use service_core::async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::services::error::ServiceError;

#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub id: Uuid,
    pub identity_id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionIssuer: Send + Sync {
    /// Mint a session for an identity that just passed a challenge.
    async fn issue(&self, nid: Uuid, identity_id: Uuid) -> Result<IssuedSession, ServiceError>;

    /// Look up a previously issued session by id.
    async fn get(&self, nid: Uuid, session_id: Uuid) -> Result<IssuedSession, ServiceError>;
}

/// Process-local issuer for development and tests. Sessions live only as
/// long as the process does.
pub struct InMemorySessionIssuer {
    lifespan: Duration,
    sessions: RwLock<HashMap<(Uuid, Uuid), IssuedSession>>,
}

impl InMemorySessionIssuer {
    pub fn new(lifespan: Duration) -> Self {
        Self {
            lifespan,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionIssuer for InMemorySessionIssuer {
    async fn issue(&self, nid: Uuid, identity_id: Uuid) -> Result<IssuedSession, ServiceError> {
        let session = IssuedSession {
            id: Uuid::new_v4(),
            identity_id,
            token: crate::flow::random_token(),
            expires_at: Utc::now() + self.lifespan,
        };
        self.sessions
            .write()
            .expect("session map lock poisoned")
            .insert((nid, session.id), session.clone());
        Ok(session)
    }

    async fn get(&self, nid: Uuid, session_id: Uuid) -> Result<IssuedSession, ServiceError> {
        self.sessions
            .read()
            .expect("session map lock poisoned")
            .get(&(nid, session_id))
            .cloned()
            .ok_or_else(|| ServiceError::not_found("session"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_get_round_trip() {
        let issuer = InMemorySessionIssuer::new(Duration::hours(1));
        let nid = Uuid::new_v4();
        let issued = issuer.issue(nid, Uuid::new_v4()).await.unwrap();
        let fetched = issuer.get(nid, issued.id).await.unwrap();
        assert_eq!(fetched.token, issued.token);

        // Sessions are tenant-scoped like everything else.
        assert!(issuer.get(Uuid::new_v4(), issued.id).await.is_err());
    }
}
