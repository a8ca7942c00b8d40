pub mod database;
pub mod error;
pub mod hmac;
pub mod session;

pub use database::Store;
pub use error::ServiceError;
pub use hmac::SecretRotator;
pub use session::{InMemorySessionIssuer, IssuedSession, SessionIssuer};
