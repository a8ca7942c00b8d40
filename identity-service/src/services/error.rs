use service_core::error::AppError;
use thiserror::Error;

/// Domain error taxonomy for the identity core. Converted into
/// `service_core::error::AppError` exactly once, at the handler boundary, so
/// upper layers match on kind rather than on strings.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Deliberately opaque: never reveals whether the flow, the code, or the
    /// target was the wrong part.
    #[error("The provided code is invalid or has already been used")]
    InvalidCode,

    #[error("An account with the same identifier already exists")]
    DuplicateCredentials,

    #[error("The flow could not be resumed: {0}")]
    NotResumable(anyhow::Error),

    #[error("The request was submitted too often")]
    SubmittedTooOften,

    #[error("A protected field was modified by an unprivileged caller")]
    ProtectedFieldModified,

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Transient storage error: {0}")]
    Transient(anyhow::Error),

    #[error("Fatal error: {0}")]
    Fatal(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(anyhow::Error),
}

impl ServiceError {
    pub fn not_found(what: &str) -> Self {
        ServiceError::NotFound(anyhow::anyhow!("{} not found", what))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => {
                ServiceError::NotFound(anyhow::anyhow!("row not found"))
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("23505") => ServiceError::DuplicateCredentials,
                // serialization_failure / deadlock_detected
                Some("40001") | Some("40P01") => {
                    ServiceError::Transient(anyhow::Error::new(err))
                }
                _ => ServiceError::Fatal(anyhow::Error::new(err)),
            },
            _ => ServiceError::Fatal(anyhow::Error::new(err)),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Fatal(anyhow::Error::new(err))
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::ValidationFailed(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::InvalidCode => AppError::BadRequest(anyhow::anyhow!(
                "The provided code is invalid or has already been used"
            )),
            ServiceError::DuplicateCredentials => AppError::Conflict(anyhow::anyhow!(
                "An account with the same identifier already exists"
            )),
            ServiceError::NotResumable(e) => AppError::BadRequest(anyhow::anyhow!(
                "The flow could not be resumed, please clear cookies and restart: {}",
                e
            )),
            ServiceError::SubmittedTooOften => AppError::TooManyRequests(
                "The request was submitted too often. Please restart the flow.".to_string(),
                None,
            ),
            ServiceError::ProtectedFieldModified => AppError::Forbidden(anyhow::anyhow!(
                "Modifying credentials or verified addresses requires a privileged caller"
            )),
            ServiceError::NotFound(e) => AppError::NotFound(e),
            ServiceError::Transient(e) => {
                tracing::warn!(error = %e, "Transient storage error surfaced to caller");
                AppError::ServiceUnavailable
            }
            ServiceError::Fatal(e) => AppError::InternalError(e),
            ServiceError::Config(e) => AppError::ConfigError(e),
        }
    }
}
