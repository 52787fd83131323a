pub mod processor;

pub use processor::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque session identifier issued by [`RequestHandler::connect`].
///
/// The empty identifier is the "no session" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn invalid() -> Self {
        Self(String::new())
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Datum>>,
    pub execution_time_ms: u64,
    pub total_time_ms: u64,
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    pub column_format: bool,
    pub nonce: String,
    pub first_n: i64,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            column_format: true,
            nonce: String::new(),
            first_n: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum HandlerError {
    #[error("Session not valid: {0}")]
    InvalidSession(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Cannot execute write statement in read-only mode")]
    ReadOnly,

    #[error("Execution error: {0}")]
    Execution(String),
}

/// The query engine as seen from the serving layer.
///
/// One implementation is shared by both protocol listeners and the warmup
/// runner, so every method must be callable concurrently.
pub trait RequestHandler: Send + Sync {
    fn connect(&self, user: &str, password: &str, database: &str)
        -> Result<SessionId, HandlerError>;

    fn disconnect(&self, session: &SessionId) -> Result<(), HandlerError>;

    fn sql_execute(
        &self,
        session: &SessionId,
        query: &str,
        options: &ExecuteOptions,
    ) -> Result<QueryResult, HandlerError>;

    /// Grants connects made while enabled superuser rights without a password.
    ///
    /// The flag is handler-wide: a connect from any listener that lands while
    /// it is set is elevated too.
    fn set_super_user_rights(&self, enabled: bool);

    fn invalid_session_id(&self) -> SessionId {
        SessionId::invalid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_sessions_are_valid_and_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert!(a.is_valid());
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn sentinel_is_invalid() {
        assert!(!SessionId::invalid().is_valid());
        assert_eq!(SessionId::default(), SessionId::invalid());
    }
}
