//! Error types for guarded query execution.
//!
//! Three layers, innermost first:
//! - [`BackendError`]: what a pool or session reports (SQLSTATE-coded or not).
//! - [`AttemptError`]: why one attempt failed, before classification.
//! - [`ExecutorError`]: the single terminal error a caller receives.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::hardener::SessionSettings;

/// Longest prefix of query text carried in error context and log fields.
pub const SQL_CONTEXT_LIMIT: usize = 200;

/// Failure reported by a connection pool or session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Reported by the database server or driver, usually with a SQLSTATE.
    #[error("{message}")]
    Database {
        code: Option<String>,
        message: String,
    },
    /// Anything outside the database error hierarchy (decoding, driver bugs).
    #[error("{0}")]
    Unexpected(String),
}

impl BackendError {
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// SQLSTATE code, if the failure carried one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            Self::Unexpected(_) => None,
        }
    }
}

/// Why a single execution attempt failed.
#[derive(Debug, Clone, Error)]
pub enum AttemptError {
    #[error("query execution exceeded timeout of {} ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// A security setting failed its character-class check; nothing was sent.
    #[error("invalid {setting} configuration: {value:?}")]
    Configuration { setting: &'static str, value: String },

    /// A hardening command was rejected by the server.
    #[error("failed to set session parameters: {source}")]
    Session {
        source: BackendError,
        settings: SessionSettings,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl AttemptError {
    /// The underlying backend failure, if there is one.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            Self::Session { source, .. } => Some(source),
            Self::Backend(err) => Some(err),
            Self::Timeout { .. } | Self::Configuration { .. } => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.backend().and_then(BackendError::code)
    }
}

/// Coarse failure class surfaced on [`ExecutorError::Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Recoverable infrastructure failure; retries were exhausted.
    Transient,
    /// Reported by the database and not recoverable by retrying.
    Permanent,
    /// Deployment bug in the security policy.
    Configuration,
    /// Programming fault outside the database error hierarchy.
    Unexpected,
}

/// Structured diagnostics attached to every terminal error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Query text, cut to [`SQL_CONTEXT_LIMIT`] characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<SessionSettings>,
}

/// Terminal outcome of a failed `execute` call.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorError {
    #[error("Query execution exceeded timeout of {timeout_ms} ms")]
    Timeout {
        timeout_ms: u64,
        context: ErrorContext,
    },

    #[error("{message}")]
    Database {
        class: FailureClass,
        message: String,
        context: ErrorContext,
    },
}

impl ExecutorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Failure class for database errors; `None` for timeouts.
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            Self::Timeout { .. } => None,
            Self::Database { class, .. } => Some(*class),
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Timeout { context, .. } | Self::Database { context, .. } => context,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.context().attempts
    }

    /// Serialize to JSON for API responses and structured logs.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            tracing::warn!("failed to serialize ExecutorError: {err}");
            format!(r#"{{"kind":"database","message":{:?}}}"#, self.to_string())
        })
    }
}

/// Cut query text to at most `limit` characters, on a char boundary.
pub fn truncate_sql(sql: &str, limit: usize) -> String {
    match sql.char_indices().nth(limit) {
        Some((end, _)) => sql[..end].to_string(),
        None => sql.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_sql_respects_char_boundaries() {
        assert_eq!(truncate_sql("SELECT 1", 200), "SELECT 1");
        assert_eq!(truncate_sql("SELECT 1", 6), "SELECT");
        assert_eq!(truncate_sql("héllo", 2), "hé");
        assert_eq!(truncate_sql("", 5), "");
    }

    #[test]
    fn backend_error_code_lookup() {
        let err = BackendError::database("40001", "could not serialize access");
        assert_eq!(err.code(), Some("40001"));
        assert_eq!(err.to_string(), "could not serialize access");
        assert_eq!(BackendError::unexpected("boom").code(), None);

        let attempt = AttemptError::from(err);
        assert_eq!(attempt.code(), Some("40001"));
        let timeout = AttemptError::Timeout {
            timeout: Duration::from_secs(2),
        };
        assert_eq!(timeout.code(), None);
        assert_eq!(timeout.to_string(), "query execution exceeded timeout of 2000 ms");
    }

    #[test]
    fn executor_error_json_shape() {
        let err = ExecutorError::Database {
            class: FailureClass::Permanent,
            message: "Database query failed: syntax error".to_string(),
            context: ErrorContext {
                error_code: Some("42601".to_string()),
                sql: Some("SELEC 1".to_string()),
                attempts: 1,
                ..ErrorContext::default()
            },
        };
        let json: serde_json::Value = serde_json::from_str(&err.to_json()).expect("json");
        assert_eq!(json["kind"], "database");
        assert_eq!(json["class"], "permanent");
        assert_eq!(json["context"]["error_code"], "42601");
        assert_eq!(json["context"]["attempts"], 1);
        assert!(json["context"].get("timeout_ms").is_none());
        assert_eq!(err.class(), Some(FailureClass::Permanent));
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_display() {
        let err = ExecutorError::Timeout {
            timeout_ms: 1500,
            context: ErrorContext::default(),
        };
        assert!(err.is_timeout());
        assert_eq!(err.class(), None);
        assert_eq!(err.to_string(), "Query execution exceeded timeout of 1500 ms");
    }
}
