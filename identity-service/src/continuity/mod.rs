//! Server-side continuity: pause a multi-step interaction, hand the user
//! agent an opaque resume token, and pick the interaction back up later.
//!
//! The durable state lives in a container row; the user agent only ever
//! holds an authenticated name-to-id map. Resuming deletes the row, so a
//! resume token is single-use.

pub mod cookie;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Duration;
use serde_json::Value;
use uuid::Uuid;

use crate::models::Container;
use crate::services::{SecretRotator, ServiceError, Store};

/// Cookie carrying the authenticated container map.
pub const CONTINUITY_COOKIE_NAME: &str = "ory_kratos_continuity";

/// Default pause window when the caller does not specify one.
pub const DEFAULT_LIFESPAN_SECS: i64 = 60;

/// Per-pause options.
#[derive(Debug, Clone, Default)]
pub struct ContinuityOptions {
    /// Bind the container to one identity; resuming as anyone else fails.
    pub identity_id: Option<Uuid>,
    /// How long the paused interaction stays resumable.
    pub lifespan: Option<Duration>,
    /// Opaque caller state returned verbatim on resume.
    pub payload: Option<Value>,
}

impl ContinuityOptions {
    fn lifespan(&self) -> Duration {
        self.lifespan
            .unwrap_or_else(|| Duration::seconds(DEFAULT_LIFESPAN_SECS))
    }
}

#[derive(Clone)]
pub struct ContinuityManager {
    store: Store,
    secrets: Arc<SecretRotator>,
    cookie_secure: bool,
}

impl ContinuityManager {
    pub fn new(store: Store, secrets: Arc<SecretRotator>, cookie_secure: bool) -> Self {
        Self {
            store,
            secrets,
            cookie_secure,
        }
    }

    /// Pause an interaction under `name`. Returns the updated jar and the
    /// encoded cookie value, which doubles as the out-of-band `RelayState`
    /// token for user agents that cannot carry cookies across the round trip.
    pub async fn pause(
        &self,
        jar: CookieJar,
        nid: Uuid,
        name: &str,
        options: ContinuityOptions,
    ) -> Result<(CookieJar, String), ServiceError> {
        let container = Container::new(
            name,
            options.identity_id,
            options.lifespan(),
            options.payload.clone(),
        )?;
        self.store.save_container(nid, &container).await?;

        // A stale or unreadable cookie is replaced, not an error: pausing
        // starts fresh state for this name either way.
        let mut entries = self.entries_from_jar(&jar).unwrap_or_default();
        entries.insert(name.to_string(), container.id);
        self.write_jar(jar, &entries)
    }

    /// Resume the interaction paused under `name`, consuming it. The jar
    /// comes back with the name unset in every outcome, including failures,
    /// so a poisoned entry cannot wedge the user agent.
    pub async fn resume(
        &self,
        jar: CookieJar,
        nid: Uuid,
        name: &str,
        identity_id: Option<Uuid>,
    ) -> (CookieJar, Result<Container, ServiceError>) {
        let entries = match self.entries_from_jar(&jar) {
            Ok(entries) => entries,
            Err(err) => return (self.clear(jar), Err(err)),
        };
        let Some(&container_id) = entries.get(name) else {
            return (
                jar,
                Err(ServiceError::NotResumable(anyhow::anyhow!(
                    "no paused interaction named {name}"
                ))),
            );
        };

        let mut remaining = entries;
        remaining.remove(name);
        // Encode before touching the jar so a failure can still hand the
        // cleared jar back.
        let jar = if remaining.is_empty() {
            self.clear(jar)
        } else {
            match cookie::encode(&self.secrets, &remaining) {
                Ok(value) => self.set_cookie(jar, value),
                Err(err) => return (self.clear(jar), Err(err)),
            }
        };

        (
            jar,
            self.consume(nid, container_id, identity_id).await,
        )
    }

    /// Resume from an out-of-band token instead of the cookie header. The
    /// token is the full encoded value, so tampering fails authentication
    /// exactly as a tampered cookie would.
    pub async fn resume_from_relay_state(
        &self,
        relay_state: &str,
        nid: Uuid,
        name: &str,
        identity_id: Option<Uuid>,
    ) -> Result<Container, ServiceError> {
        let entries = cookie::decode(&self.secrets, relay_state)?;
        let container_id = entries.get(name).copied().ok_or_else(|| {
            ServiceError::NotResumable(anyhow::anyhow!("no paused interaction named {name}"))
        })?;
        self.consume(nid, container_id, identity_id).await
    }

    /// Drop the paused interaction named `name`, if any. Aborting something
    /// that was never paused is not an error.
    pub async fn abort(
        &self,
        jar: CookieJar,
        nid: Uuid,
        name: &str,
    ) -> Result<CookieJar, ServiceError> {
        let mut entries = self.entries_from_jar(&jar).unwrap_or_default();
        if let Some(container_id) = entries.remove(name) {
            match self.store.delete_container(nid, container_id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(self.write_jar(jar, &entries)?.0)
    }

    async fn consume(
        &self,
        nid: Uuid,
        container_id: Uuid,
        identity_id: Option<Uuid>,
    ) -> Result<Container, ServiceError> {
        let container = match self.store.get_container(nid, container_id).await {
            Ok(container) => container,
            Err(err) if err.is_not_found() => {
                return Err(ServiceError::NotResumable(anyhow::anyhow!(
                    "paused interaction no longer exists"
                )));
            }
            Err(err) => return Err(err),
        };

        let validity = container.valid(identity_id);

        // Single-use: the row goes away whether or not validation passed. A
        // concurrent resume losing this delete is treated as already consumed.
        match self.store.delete_container(nid, container_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                return Err(ServiceError::NotResumable(anyhow::anyhow!(
                    "paused interaction was already resumed"
                )));
            }
            Err(err) => return Err(err),
        }

        validity?;
        Ok(container)
    }

    fn entries_from_jar(
        &self,
        jar: &CookieJar,
    ) -> Result<BTreeMap<String, Uuid>, ServiceError> {
        match jar.get(CONTINUITY_COOKIE_NAME) {
            Some(c) => cookie::decode(&self.secrets, c.value()),
            None => Err(ServiceError::NotResumable(anyhow::anyhow!(
                "no continuity cookie present"
            ))),
        }
    }

    fn write_jar(
        &self,
        jar: CookieJar,
        entries: &BTreeMap<String, Uuid>,
    ) -> Result<(CookieJar, String), ServiceError> {
        if entries.is_empty() {
            return Ok((self.clear(jar), String::new()));
        }
        let value = cookie::encode(&self.secrets, entries)?;
        Ok((self.set_cookie(jar, value.clone()), value))
    }

    fn set_cookie(&self, jar: CookieJar, value: String) -> CookieJar {
        let cookie = Cookie::build((CONTINUITY_COOKIE_NAME, value))
            .path("/")
            .http_only(true)
            .secure(self.cookie_secure)
            .same_site(SameSite::Lax)
            .build();
        jar.add(cookie)
    }

    fn clear(&self, jar: CookieJar) -> CookieJar {
        jar.remove(Cookie::build((CONTINUITY_COOKIE_NAME, "")).path("/").build())
    }
}
