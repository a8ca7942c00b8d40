//! One-time code issuance and consumption.
//!
//! Consumption runs as a single serializable transaction so the submit
//! counter, the code match, and the used-at stamp move together. The
//! counter increment commits on a miss (every guess costs an attempt) but
//! rolls back past the ceiling, so the stored count never exceeds it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::models::{CodeKind, Flow, OneTimeCode};
use crate::services::{SecretRotator, ServiceError, Store};

/// Submissions allowed per flow before it locks out.
pub const MAX_CODE_SUBMISSIONS: i32 = 5;

/// Width of generated codes.
const CODE_DIGITS: u32 = 6;

/// Kind-specific delivery target recorded alongside a code.
#[derive(Debug, Clone)]
pub enum CodeTarget {
    /// Login: the code belongs to an already-known identity.
    Identity(Uuid),
    /// Registration: no identity exists yet, only a claimed address.
    Address { address: String, channel: String },
    /// Recovery: bound to a stored recovery address, its owner, and the
    /// channel the caller asked to be reached over.
    RecoveryAddress {
        address_id: Uuid,
        identity_id: Uuid,
        via: crate::models::Channel,
    },
    /// Verification: bound to a stored verifiable address.
    VerifiableAddress { address_id: Uuid, identity_id: Option<Uuid> },
}

#[derive(Clone)]
pub struct CodeManager {
    store: Store,
    secrets: Arc<SecretRotator>,
}

impl CodeManager {
    pub fn new(store: Store, secrets: Arc<SecretRotator>) -> Self {
        Self { store, secrets }
    }

    /// Issue a fresh code for `flow` and persist only its MAC. Returns the
    /// plaintext for delivery together with the stored row.
    pub async fn issue(
        &self,
        kind: CodeKind,
        flow: &Flow,
        lifespan: Duration,
        target: CodeTarget,
    ) -> Result<(String, OneTimeCode), ServiceError> {
        let plaintext = random_code();
        // MAC before touching storage: a missing secret list must fail
        // without leaving a row behind.
        let code_hmac = self.secrets.mac(plaintext.as_bytes())?;

        let mut code = OneTimeCode::new(flow.nid, flow.id, code_hmac, lifespan);
        code = match target {
            CodeTarget::Identity(identity_id) => code.with_identity(identity_id),
            CodeTarget::Address { address, channel } => code.with_address(&address, &channel),
            CodeTarget::RecoveryAddress {
                address_id,
                identity_id,
                via,
            } => {
                let mut code = code.with_recovery_address(address_id).with_identity(identity_id);
                code.channel = Some(via.as_str().to_string());
                code
            }
            CodeTarget::VerifiableAddress {
                address_id,
                identity_id,
            } => {
                let code = code.with_verifiable_address(address_id);
                match identity_id {
                    Some(id) => code.with_identity(id),
                    None => code,
                }
            }
        };

        self.store.create_code(kind, &code).await?;
        Ok((plaintext, code))
    }

    /// Consume a submitted code. On success the matched row comes back with
    /// `used_at` set. `constraint` is the kind-specific check on the matched
    /// row (right identity, right channel, address still derivable); a row
    /// failing it is reported as an invalid code, not as a distinct
    /// condition.
    ///
    /// Retries once when the database aborts the serializable transaction.
    pub async fn use_code(
        &self,
        kind: CodeKind,
        nid: Uuid,
        flow_id: Uuid,
        submitted: &str,
        constraint: &(dyn Fn(&OneTimeCode) -> bool + Send + Sync),
    ) -> Result<OneTimeCode, ServiceError> {
        match self
            .try_use_code(kind, nid, flow_id, submitted, constraint)
            .await
        {
            Err(err) if err.is_transient() => {
                tracing::debug!(flow_id = %flow_id, "Retrying code consumption after transaction abort");
                self.try_use_code(kind, nid, flow_id, submitted, constraint)
                    .await
            }
            other => other,
        }
    }

    async fn try_use_code(
        &self,
        kind: CodeKind,
        nid: Uuid,
        flow_id: Uuid,
        submitted: &str,
        constraint: &(dyn Fn(&OneTimeCode) -> bool + Send + Sync),
    ) -> Result<OneTimeCode, ServiceError> {
        let mut tx = self.store.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let increment = format!(
            "UPDATE {} SET submit_count = submit_count + 1 WHERE id = $1 AND nid = $2 RETURNING submit_count",
            kind.flow_kind().flow_table()
        );
        let submit_count: Option<(i32,)> = sqlx::query_as(&increment)
            .bind(flow_id)
            .bind(nid)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((submit_count,)) = submit_count else {
            // Unknown flow looks exactly like a wrong code.
            tx.commit().await?;
            return Err(ServiceError::InvalidCode);
        };

        if submit_count > MAX_CODE_SUBMISSIONS {
            // Roll back so the stored counter stays at the ceiling instead
            // of growing without bound under a brute-force attempt.
            tx.rollback().await?;
            return Err(ServiceError::SubmittedTooOften);
        }

        let select = format!(
            "SELECT * FROM {} WHERE nid = $1 AND flow_id = $2 AND used_at IS NULL AND expires_at > NOW() ORDER BY issued_at ASC",
            kind.code_table()
        );
        let candidates: Vec<OneTimeCode> = sqlx::query_as(&select)
            .bind(nid)
            .bind(flow_id)
            .fetch_all(&mut *tx)
            .await?;

        // Compare against every active row; no early exit on match.
        let mut matched: Option<OneTimeCode> = None;
        for candidate in candidates {
            let hit = self.secrets.equal(submitted.as_bytes(), &candidate.code_hmac);
            if hit && matched.is_none() {
                matched = Some(candidate);
            }
        }

        let matched = matched.filter(|code| constraint(code));

        let Some(mut code) = matched else {
            // Commit the failed attempt: it must count against the ceiling.
            tx.commit().await?;
            return Err(ServiceError::InvalidCode);
        };

        let now = Utc::now();
        let mark_used = format!("UPDATE {} SET used_at = $1 WHERE id = $2", kind.code_table());
        sqlx::query(&mark_used)
            .bind(now)
            .bind(code.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        code.used_at = Some(now);
        Ok(code)
    }
}

/// Fixed-width numeric code, leading zeros kept.
pub fn random_code() -> String {
    let bound = 10u32.pow(CODE_DIGITS);
    let n = rand::thread_rng().gen_range(0..bound);
    format!("{:0width$}", n, width = CODE_DIGITS as usize)
}
