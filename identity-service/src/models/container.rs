//! Continuity container model - a pause/resume capsule for a self-service flow.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::error::ServiceError;

/// A named, expiring capsule of opaque JSON payload, optionally bound to an
/// identity. The id is the only handle that ever leaves the server, carried
/// either in the continuity cookie or in a RelayState parameter.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Container {
    pub id: Uuid,
    pub name: String,
    pub identity_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Container {
    pub fn new(
        name: &str,
        identity_id: Option<Uuid>,
        lifespan: Duration,
        payload: Option<Value>,
    ) -> Result<Self, ServiceError> {
        if name.is_empty() {
            return Err(ServiceError::Fatal(anyhow::anyhow!(
                "container name must not be empty"
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            identity_id,
            // Second precision: sub-second jitter must not make a container
            // that was just paused look expired on another node.
            expires_at: truncate_to_second(now + lifespan),
            payload,
            created_at: now,
            updated_at: now,
        })
    }

    /// A container is resumable only while unexpired and, when the caller
    /// supplies an identity, only for that identity.
    pub fn valid(&self, identity_id: Option<Uuid>) -> Result<(), ServiceError> {
        if Utc::now() >= self.expires_at {
            return Err(ServiceError::NotResumable(anyhow::anyhow!(
                "session continuity container has expired"
            )));
        }
        if let Some(expected) = identity_id {
            if self.identity_id != Some(expected) {
                return Err(ServiceError::NotResumable(anyhow::anyhow!(
                    "session continuity container belongs to another identity"
                )));
            }
        }
        Ok(())
    }
}

fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_name() {
        assert!(Container::new("", None, Duration::minutes(1), None).is_err());
    }

    #[test]
    fn test_valid_within_lifespan() {
        let c = Container::new("login", None, Duration::minutes(1), None).unwrap();
        assert!(c.valid(None).is_ok());
    }

    #[test]
    fn test_expired_container_is_not_resumable() {
        let mut c = Container::new("login", None, Duration::minutes(1), None).unwrap();
        c.expires_at = Utc::now() - Duration::seconds(1);
        assert!(matches!(
            c.valid(None),
            Err(ServiceError::NotResumable(_))
        ));
    }

    #[test]
    fn test_identity_mismatch_is_not_resumable() {
        let owner = Uuid::new_v4();
        let c = Container::new("oidc", Some(owner), Duration::minutes(1), None).unwrap();
        assert!(c.valid(Some(owner)).is_ok());
        assert!(matches!(
            c.valid(Some(Uuid::new_v4())),
            Err(ServiceError::NotResumable(_))
        ));
    }

    #[test]
    fn test_unbound_container_rejects_identity_check() {
        let c = Container::new("saml", None, Duration::minutes(1), None).unwrap();
        assert!(c.valid(Some(Uuid::new_v4())).is_err());
    }

    #[test]
    fn test_expiry_has_second_precision() {
        let c = Container::new("login", None, Duration::minutes(1), None).unwrap();
        assert_eq!(c.expires_at.timestamp_subsec_nanos(), 0);
    }
}
