//! Maps attempt failures onto the retry decision.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{AttemptError, BackendError};

/// SQLSTATE raised when the server-side `statement_timeout` fires.
pub const QUERY_CANCELED: &str = "57014";

/// SQLSTATE codes treated as recoverable by default.
pub const DEFAULT_TRANSIENT_CODES: &[&str] = &[
    "08000", // connection_exception
    "08003", // connection_does_not_exist
    "08006", // connection_failure
    "08001", // sqlclient_unable_to_establish_sqlconnection
    "08004", // sqlserver_rejected_establishment_of_sqlconnection
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "53300", // too_many_connections
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
];

/// Immutable set of SQLSTATE codes worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientCodes {
    codes: Arc<HashSet<String>>,
}

impl TransientCodes {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: Arc::new(codes.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl Default for TransientCodes {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_CODES.iter().copied())
    }
}

/// Outcome of classifying one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Did not finish in time. Never retried.
    Timeout,
    /// Recoverable infrastructure failure.
    Transient(String),
    /// Database failure that retrying will not fix.
    Permanent(Option<String>),
    /// Bad security policy. Never retried.
    Configuration,
    /// Fault outside the database error hierarchy. Never retried.
    Unexpected,
}

impl Classification {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub fn classify(err: &AttemptError, transient: &TransientCodes) -> Classification {
    match err {
        AttemptError::Timeout { .. } => Classification::Timeout,
        AttemptError::Configuration { .. } => Classification::Configuration,
        AttemptError::Session { source, .. } | AttemptError::Backend(source) => match source {
            BackendError::Unexpected(_) => Classification::Unexpected,
            BackendError::Database { code: None, .. } => Classification::Permanent(None),
            BackendError::Database {
                code: Some(code), ..
            } => {
                if code == QUERY_CANCELED {
                    Classification::Timeout
                } else if transient.contains(code) {
                    Classification::Transient(code.clone())
                } else {
                    Classification::Permanent(Some(code.clone()))
                }
            }
        },
    }
}
