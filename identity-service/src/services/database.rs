//! PostgreSQL persistence for the identity core.
//!
//! Every method is scoped by `nid`: a cross-tenant lookup is indistinguishable
//! from absence. Methods that mutate multiple tables open one transaction and
//! commit before returning, so a successful call is a committed call.

use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{
    Channel, CodeKind, Container, Credentials, CredentialsType, Flow, FlowKind, Identity,
    OneTimeCode, RecoveryAddress, SessionTokenExchange, VerifiableAddress,
};
use crate::services::error::ServiceError;

/// PostgreSQL store wrapper.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

#[derive(Debug, Clone, FromRow)]
struct RecoveryAddressRow {
    id: Uuid,
    identity_id: Uuid,
    value: String,
    via: String,
}

#[derive(Debug, Clone, FromRow)]
struct VerifiableAddressRow {
    id: Uuid,
    identity_id: Uuid,
    value: String,
    via: String,
    verified: bool,
    status: String,
    verified_at: Option<chrono::DateTime<chrono::Utc>>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl Store {
    /// Create a new store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== Continuity Containers ====================

    pub async fn save_container(&self, nid: Uuid, c: &Container) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO continuity_containers (id, nid, name, identity_id, expires_at, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(c.id)
        .bind(nid)
        .bind(&c.name)
        .bind(c.identity_id)
        .bind(c.expires_at)
        .bind(&c.payload)
        .bind(c.created_at)
        .bind(c.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_container(&self, nid: Uuid, id: Uuid) -> Result<Container, ServiceError> {
        sqlx::query_as::<_, Container>(
            "SELECT id, name, identity_id, expires_at, payload, created_at, updated_at
             FROM continuity_containers WHERE id = $1 AND nid = $2",
        )
        .bind(id)
        .bind(nid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("continuity container"))
    }

    /// Delete a container. Returns `NotFound` when no row matched; callers
    /// that abort a never-paused session swallow that.
    pub async fn delete_container(&self, nid: Uuid, id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query("DELETE FROM continuity_containers WHERE id = $1 AND nid = $2")
            .bind(id)
            .bind(nid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("continuity container"));
        }
        Ok(())
    }

    // ==================== Flows ====================

    pub async fn create_flow(&self, kind: FlowKind, flow: &Flow) -> Result<(), ServiceError> {
        let query = format!(
            r#"
            INSERT INTO {} (id, nid, expires_at, issued_at, request_url, csrf_token, submit_count, state, identity_id, requested_via)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            kind.flow_table()
        );
        sqlx::query(&query)
            .bind(flow.id)
            .bind(flow.nid)
            .bind(flow.expires_at)
            .bind(flow.issued_at)
            .bind(&flow.request_url)
            .bind(&flow.csrf_token)
            .bind(flow.submit_count)
            .bind(&flow.state)
            .bind(flow.identity_id)
            .bind(&flow.requested_via)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_flow(
        &self,
        kind: FlowKind,
        nid: Uuid,
        id: Uuid,
    ) -> Result<Flow, ServiceError> {
        let query = format!(
            "SELECT * FROM {} WHERE id = $1 AND nid = $2",
            kind.flow_table()
        );
        sqlx::query_as::<_, Flow>(&query)
            .bind(id)
            .bind(nid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("flow"))
    }

    /// Update the mutable flow columns. `submit_count` is deliberately
    /// excluded: it only moves through the single-transaction consume path,
    /// keeping it non-decreasing.
    pub async fn update_flow(&self, kind: FlowKind, flow: &Flow) -> Result<(), ServiceError> {
        let query = format!(
            "UPDATE {} SET state = $1, identity_id = $2, requested_via = $3, expires_at = $4
             WHERE id = $5 AND nid = $6",
            kind.flow_table()
        );
        let result = sqlx::query(&query)
            .bind(&flow.state)
            .bind(flow.identity_id)
            .bind(&flow.requested_via)
            .bind(flow.expires_at)
            .bind(flow.id)
            .bind(flow.nid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("flow"));
        }
        Ok(())
    }

    // ==================== One-Time Codes ====================

    /// Persist a code row. The caller passes the MAC of the plaintext; the
    /// plaintext itself never reaches the store.
    pub async fn create_code(&self, kind: CodeKind, code: &OneTimeCode) -> Result<(), ServiceError> {
        let query = format!(
            r#"
            INSERT INTO {} (id, nid, flow_id, code_hmac, issued_at, expires_at, used_at, identity_id, recovery_address_id, verifiable_address_id, address, channel)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
            kind.code_table()
        );
        sqlx::query(&query)
            .bind(code.id)
            .bind(code.nid)
            .bind(code.flow_id)
            .bind(&code.code_hmac)
            .bind(code.issued_at)
            .bind(code.expires_at)
            .bind(code.used_at)
            .bind(code.identity_id)
            .bind(code.recovery_address_id)
            .bind(code.verifiable_address_id)
            .bind(&code.address)
            .bind(&code.channel)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Identities ====================

    pub async fn create_identity(&self, identity: &Identity) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO identities (id, nid, schema_id, traits, state, state_changed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(identity.id)
        .bind(identity.nid)
        .bind(&identity.schema_id)
        .bind(&identity.traits)
        .bind(&identity.state)
        .bind(identity.state_changed_at)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .execute(&mut *tx)
        .await?;

        write_credentials(&mut tx, identity).await?;
        write_addresses(&mut tx, identity).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Rewrite an identity and everything it owns in one transaction. The
    /// credential and identifier index rows are deleted and re-inserted
    /// rather than updated in place, so a changed identifier never leaves a
    /// stale index row behind.
    pub async fn update_identity(&self, identity: &Identity) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE identities SET schema_id = $1, traits = $2, state = $3, state_changed_at = $4, updated_at = NOW()
            WHERE id = $5 AND nid = $6
            "#,
        )
        .bind(&identity.schema_id)
        .bind(&identity.traits)
        .bind(&identity.state)
        .bind(identity.state_changed_at)
        .bind(identity.id)
        .bind(identity.nid)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("identity"));
        }

        // Deleting credentials cascades into the identifier index.
        sqlx::query("DELETE FROM identity_credentials WHERE identity_id = $1")
            .bind(identity.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM identity_verifiable_addresses WHERE identity_id = $1")
            .bind(identity.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM identity_recovery_addresses WHERE identity_id = $1")
            .bind(identity.id)
            .execute(&mut *tx)
            .await?;

        write_credentials(&mut tx, identity).await?;
        write_addresses(&mut tx, identity).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Load an identity including its credentials.
    pub async fn get_identity_confidential(
        &self,
        nid: Uuid,
        id: Uuid,
    ) -> Result<Identity, ServiceError> {
        let mut identity = sqlx::query_as::<_, Identity>(
            "SELECT * FROM identities WHERE id = $1 AND nid = $2",
        )
        .bind(id)
        .bind(nid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("identity"))?;

        self.load_collections(&mut identity).await?;
        Ok(identity)
    }

    /// Load an identity with credentials stripped.
    pub async fn get_identity(&self, nid: Uuid, id: Uuid) -> Result<Identity, ServiceError> {
        Ok(self.get_identity_confidential(nid, id).await?.without_credentials())
    }

    /// Paginated listing with stable ordering.
    pub async fn list_identities(
        &self,
        nid: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Identity>, ServiceError> {
        let mut identities = sqlx::query_as::<_, Identity>(
            "SELECT * FROM identities WHERE nid = $1 ORDER BY created_at ASC, id ASC LIMIT $2 OFFSET $3",
        )
        .bind(nid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        for identity in identities.iter_mut() {
            self.load_addresses(identity).await?;
        }
        Ok(identities)
    }

    pub async fn delete_identity(&self, nid: Uuid, id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query("DELETE FROM identities WHERE id = $1 AND nid = $2")
            .bind(id)
            .bind(nid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("identity"));
        }
        Ok(())
    }

    /// Credentials-first lookup for the login path: find the identity owning
    /// a normalised identifier of the given credential type.
    pub async fn find_by_credentials_identifier(
        &self,
        nid: Uuid,
        credentials_type: CredentialsType,
        identifier: &str,
    ) -> Result<Identity, ServiceError> {
        let mut identity = sqlx::query_as::<_, Identity>(
            r#"
            SELECT i.* FROM identities i
            JOIN identity_credentials c ON c.identity_id = i.id
            JOIN identity_credential_identifiers x ON x.identity_credential_id = c.id
            WHERE i.nid = $1 AND c.credential_type = $2 AND x.identifier = LOWER($3)
            "#,
        )
        .bind(nid)
        .bind(credentials_type.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("identity"))?;

        self.load_collections(&mut identity).await?;
        Ok(identity)
    }

    async fn load_collections(&self, identity: &mut Identity) -> Result<(), ServiceError> {
        #[derive(FromRow)]
        struct CredentialRow {
            id: Uuid,
            credential_type: String,
            config: serde_json::Value,
        }

        let rows = sqlx::query_as::<_, CredentialRow>(
            "SELECT id, credential_type, config FROM identity_credentials WHERE identity_id = $1",
        )
        .bind(identity.id)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let Some(kind) = CredentialsType::parse(&row.credential_type) else {
                return Err(ServiceError::Fatal(anyhow::anyhow!(
                    "unknown credential type {} on identity {}",
                    row.credential_type,
                    identity.id
                )));
            };
            let identifiers: Vec<(String,)> = sqlx::query_as(
                "SELECT identifier FROM identity_credential_identifiers WHERE identity_credential_id = $1 ORDER BY identifier",
            )
            .bind(row.id)
            .fetch_all(&self.pool)
            .await?;

            identity.credentials.insert(
                kind,
                Credentials {
                    credentials_type: kind,
                    identifiers: identifiers.into_iter().map(|(i,)| i).collect(),
                    config: row.config,
                },
            );
        }

        self.load_addresses(identity).await?;
        Ok(())
    }

    async fn load_addresses(&self, identity: &mut Identity) -> Result<(), ServiceError> {
        let verifiable = sqlx::query_as::<_, VerifiableAddressRow>(
            "SELECT id, identity_id, value, via, verified, status, verified_at, expires_at
             FROM identity_verifiable_addresses WHERE identity_id = $1 ORDER BY value, via",
        )
        .bind(identity.id)
        .fetch_all(&self.pool)
        .await?;
        identity.verifiable_addresses = verifiable
            .into_iter()
            .map(|r| VerifiableAddress {
                id: r.id,
                value: r.value,
                via: r.via,
                verified: r.verified,
                status: r.status,
                verified_at: r.verified_at,
                expires_at: r.expires_at,
            })
            .collect();

        let recovery = sqlx::query_as::<_, RecoveryAddressRow>(
            "SELECT id, identity_id, value, via FROM identity_recovery_addresses
             WHERE identity_id = $1 ORDER BY value, via",
        )
        .bind(identity.id)
        .fetch_all(&self.pool)
        .await?;
        identity.recovery_addresses = recovery
            .into_iter()
            .map(|r| RecoveryAddress {
                id: r.id,
                value: r.value,
                via: r.via,
            })
            .collect();
        Ok(())
    }

    // ==================== Addresses ====================

    /// Update the verification lifecycle columns of one address.
    pub async fn update_verifiable_address(
        &self,
        nid: Uuid,
        address: &VerifiableAddress,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE identity_verifiable_addresses
            SET verified = $1, status = $2, verified_at = $3, expires_at = $4
            WHERE id = $5 AND nid = $6
            "#,
        )
        .bind(address.verified)
        .bind(&address.status)
        .bind(address.verified_at)
        .bind(address.expires_at)
        .bind(address.id)
        .bind(nid)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("verifiable address"));
        }
        Ok(())
    }

    /// Look up a verifiable address and its owning identity.
    pub async fn find_verifiable_address(
        &self,
        nid: Uuid,
        value: &str,
        via: Channel,
    ) -> Result<(Uuid, VerifiableAddress), ServiceError> {
        let row = sqlx::query_as::<_, VerifiableAddressRow>(
            r#"
            SELECT id, identity_id, value, via, verified, status, verified_at, expires_at
            FROM identity_verifiable_addresses
            WHERE nid = $1 AND LOWER(value) = LOWER($2) AND via = $3
            "#,
        )
        .bind(nid)
        .bind(value)
        .bind(via.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("verifiable address"))?;

        Ok((
            row.identity_id,
            VerifiableAddress {
                id: row.id,
                value: row.value,
                via: row.via,
                verified: row.verified,
                status: row.status,
                verified_at: row.verified_at,
                expires_at: row.expires_at,
            },
        ))
    }

    pub async fn get_verifiable_address(
        &self,
        nid: Uuid,
        id: Uuid,
    ) -> Result<VerifiableAddress, ServiceError> {
        sqlx::query_as::<_, VerifiableAddress>(
            "SELECT id, value, via, verified, status, verified_at, expires_at
             FROM identity_verifiable_addresses WHERE id = $1 AND nid = $2",
        )
        .bind(id)
        .bind(nid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("verifiable address"))
    }

    /// Look up a recovery address and its owning identity.
    pub async fn find_recovery_address(
        &self,
        nid: Uuid,
        value: &str,
        via: Channel,
    ) -> Result<(Uuid, RecoveryAddress), ServiceError> {
        let row = sqlx::query_as::<_, RecoveryAddressRow>(
            r#"
            SELECT id, identity_id, value, via FROM identity_recovery_addresses
            WHERE nid = $1 AND LOWER(value) = LOWER($2) AND via = $3
            "#,
        )
        .bind(nid)
        .bind(value)
        .bind(via.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("recovery address"))?;

        Ok((
            row.identity_id,
            RecoveryAddress {
                id: row.id,
                value: row.value,
                via: row.via,
            },
        ))
    }

    // ==================== Session Token Exchanger ====================

    pub async fn create_exchanger(
        &self,
        exchanger: &SessionTokenExchange,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO session_token_exchanges (id, nid, flow_id, session_id, code, consumed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(exchanger.id)
        .bind(exchanger.nid)
        .bind(exchanger.flow_id)
        .bind(exchanger.session_id)
        .bind(&exchanger.code)
        .bind(exchanger.consumed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_exchanger_by_flow(
        &self,
        nid: Uuid,
        flow_id: Uuid,
    ) -> Result<SessionTokenExchange, ServiceError> {
        sqlx::query_as::<_, SessionTokenExchange>(
            "SELECT * FROM session_token_exchanges WHERE nid = $1 AND flow_id = $2",
        )
        .bind(nid)
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("session token exchanger"))
    }

    pub async fn get_exchanger_by_code(
        &self,
        nid: Uuid,
        code: &str,
    ) -> Result<Option<SessionTokenExchange>, ServiceError> {
        Ok(sqlx::query_as::<_, SessionTokenExchange>(
            "SELECT * FROM session_token_exchanges WHERE nid = $1 AND code = $2",
        )
        .bind(nid)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Atomically consume an exchanger code. Returns the row on the first
    /// call; `None` afterwards, so two racing exchanges cannot both win.
    pub async fn try_consume_exchanger(
        &self,
        nid: Uuid,
        code: &str,
    ) -> Result<Option<SessionTokenExchange>, ServiceError> {
        Ok(sqlx::query_as::<_, SessionTokenExchange>(
            r#"
            UPDATE session_token_exchanges SET consumed_at = NOW()
            WHERE nid = $1 AND code = $2 AND consumed_at IS NULL
            RETURNING *
            "#,
        )
        .bind(nid)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn update_exchanger_session(
        &self,
        nid: Uuid,
        flow_id: Uuid,
        session_id: Uuid,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE session_token_exchanges SET session_id = $1 WHERE nid = $2 AND flow_id = $3",
        )
        .bind(session_id)
        .bind(nid)
        .bind(flow_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("session token exchanger"));
        }
        Ok(())
    }

    /// Relink the exchanger row after an upstream redirect handed the user
    /// agent a fresh flow id. The unique `(nid, flow_id)` constraint keeps
    /// the one-row-per-flow invariant.
    pub async fn move_exchanger_to_new_flow(
        &self,
        nid: Uuid,
        old_flow_id: Uuid,
        new_flow_id: Uuid,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE session_token_exchanges SET flow_id = $1 WHERE nid = $2 AND flow_id = $3",
        )
        .bind(new_flow_id)
        .bind(nid)
        .bind(old_flow_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("session token exchanger"));
        }
        Ok(())
    }

    // ==================== Cleanup ====================

    /// Delete expired containers in bounded batches so a sweep never holds a
    /// long table lock. Returns the number of rows removed.
    pub async fn delete_expired_containers(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
        batch_size: i64,
    ) -> Result<u64, ServiceError> {
        self.batched_delete(
            "DELETE FROM continuity_containers WHERE id IN
             (SELECT id FROM continuity_containers WHERE expires_at < $1 LIMIT $2)",
            older_than,
            batch_size,
        )
        .await
    }

    pub async fn delete_expired_flows(
        &self,
        kind: FlowKind,
        older_than: chrono::DateTime<chrono::Utc>,
        batch_size: i64,
    ) -> Result<u64, ServiceError> {
        let query = format!(
            "DELETE FROM {t} WHERE id IN (SELECT id FROM {t} WHERE expires_at < $1 LIMIT $2)",
            t = kind.flow_table()
        );
        self.batched_delete(&query, older_than, batch_size).await
    }

    pub async fn delete_expired_codes(
        &self,
        kind: CodeKind,
        older_than: chrono::DateTime<chrono::Utc>,
        batch_size: i64,
    ) -> Result<u64, ServiceError> {
        let query = format!(
            "DELETE FROM {t} WHERE id IN (SELECT id FROM {t} WHERE expires_at < $1 LIMIT $2)",
            t = kind.code_table()
        );
        self.batched_delete(&query, older_than, batch_size).await
    }

    pub async fn delete_consumed_exchangers(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
        batch_size: i64,
    ) -> Result<u64, ServiceError> {
        self.batched_delete(
            "DELETE FROM session_token_exchanges WHERE id IN
             (SELECT id FROM session_token_exchanges WHERE consumed_at < $1 LIMIT $2)",
            older_than,
            batch_size,
        )
        .await
    }

    async fn batched_delete(
        &self,
        query: &str,
        older_than: chrono::DateTime<chrono::Utc>,
        batch_size: i64,
    ) -> Result<u64, ServiceError> {
        let mut total = 0u64;
        loop {
            let affected = sqlx::query(query)
                .bind(older_than)
                .bind(batch_size)
                .execute(&self.pool)
                .await?
                .rows_affected();
            total += affected;
            if affected < batch_size as u64 {
                break;
            }
        }
        Ok(total)
    }
}

async fn write_credentials(
    tx: &mut Transaction<'_, Postgres>,
    identity: &Identity,
) -> Result<(), ServiceError> {
    for credentials in identity.credentials.values() {
        let credential_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO identity_credentials (id, identity_id, nid, credential_type, config)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(credential_id)
        .bind(identity.id)
        .bind(identity.nid)
        .bind(credentials.credentials_type.as_str())
        .bind(&credentials.config)
        .execute(&mut **tx)
        .await?;

        for identifier in &credentials.identifiers {
            sqlx::query(
                r#"
                INSERT INTO identity_credential_identifiers (id, identity_credential_id, nid, credential_type, identifier)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(credential_id)
            .bind(identity.nid)
            .bind(credentials.credentials_type.as_str())
            .bind(identifier)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn write_addresses(
    tx: &mut Transaction<'_, Postgres>,
    identity: &Identity,
) -> Result<(), ServiceError> {
    for address in &identity.verifiable_addresses {
        sqlx::query(
            r#"
            INSERT INTO identity_verifiable_addresses (id, identity_id, nid, value, via, verified, status, verified_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(address.id)
        .bind(identity.id)
        .bind(identity.nid)
        .bind(&address.value)
        .bind(&address.via)
        .bind(address.verified)
        .bind(&address.status)
        .bind(address.verified_at)
        .bind(address.expires_at)
        .execute(&mut **tx)
        .await?;
    }

    for address in &identity.recovery_addresses {
        sqlx::query(
            r#"
            INSERT INTO identity_recovery_addresses (id, identity_id, nid, value, via)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(address.id)
        .bind(identity.id)
        .bind(identity.nid)
        .bind(&address.value)
        .bind(&address.via)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
