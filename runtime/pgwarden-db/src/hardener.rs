//! Session confinement applied at the start of every read-only transaction.
//!
//! Three settings, in order: a server-side statement timeout, a search path
//! restricted to allow-listed schemas, and (optionally) a switch to a
//! read-only role. Identifiers are checked before the first statement is
//! sent, so a bad policy issues nothing. Every setting is `SET LOCAL` and
//! ends with the transaction; nothing here resets them.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::AttemptError;
use crate::policy::{SecurityPolicy, is_identifier};
use crate::session::Session;

/// Largest `statement_timeout` the server accepts, in milliseconds.
const MAX_STATEMENT_TIMEOUT_MS: u64 = i32::MAX as u64;

/// Validated settings for one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSettings {
    pub timeout_ms: u64,
    pub search_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly_role: Option<String>,
}

impl SessionSettings {
    /// Check the policy's identifiers and derive the settings for `timeout`.
    pub fn plan(policy: &SecurityPolicy, timeout: Duration) -> Result<Self, AttemptError> {
        let search_path = policy.rendered_search_path();
        if !is_search_path(&search_path) {
            return Err(AttemptError::Configuration {
                setting: "search_path",
                value: search_path,
            });
        }
        if let Some(role) = &policy.readonly_role {
            if role.is_empty() || !is_identifier(role) {
                return Err(AttemptError::Configuration {
                    setting: "readonly_role",
                    value: role.clone(),
                });
            }
        }
        Ok(Self {
            timeout_ms: timeout_millis(timeout),
            search_path,
            readonly_role: policy.readonly_role.clone(),
        })
    }

    /// The statements that apply these settings, in execution order.
    pub fn statements(&self) -> Vec<String> {
        let path = if self.search_path.trim().is_empty() {
            "''"
        } else {
            self.search_path.as_str()
        };
        let mut statements = vec![
            format!("SET LOCAL statement_timeout = {}", self.timeout_ms),
            format!("SET LOCAL search_path TO {path}"),
        ];
        if let Some(role) = &self.readonly_role {
            statements.push(format!("SET LOCAL ROLE {role}"));
        }
        statements
    }
}

/// Applies a [`SecurityPolicy`] to freshly opened transactions.
#[derive(Debug, Clone)]
pub struct SessionHardener {
    policy: Arc<SecurityPolicy>,
}

impl SessionHardener {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Validate the policy and derive settings for `timeout`. Sends nothing.
    pub fn plan(&self, timeout: Duration) -> Result<SessionSettings, AttemptError> {
        SessionSettings::plan(&self.policy, timeout)
    }

    /// Configure `session` for one query bounded by `timeout`.
    ///
    /// Must run inside an open transaction. Server failures come back as
    /// [`AttemptError::Session`] carrying the attempted settings; whether to
    /// retry is the caller's decision.
    pub async fn harden<S>(
        &self,
        session: &mut S,
        timeout: Duration,
    ) -> Result<SessionSettings, AttemptError>
    where
        S: Session + ?Sized,
    {
        let settings = self.plan(timeout)?;
        self.apply(session, &settings).await?;
        Ok(settings)
    }

    /// Send already-planned settings.
    pub async fn apply<S>(
        &self,
        session: &mut S,
        settings: &SessionSettings,
    ) -> Result<(), AttemptError>
    where
        S: Session + ?Sized,
    {
        for statement in settings.statements() {
            debug!(%statement, "applying session setting");
            if let Err(source) = session.execute(&statement).await {
                return Err(AttemptError::Session {
                    source,
                    settings: settings.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Alphanumerics, underscores, and `", "` separators only.
fn is_search_path(path: &str) -> bool {
    path.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ',' | ' '))
}

/// Whole milliseconds, at least 1 (0 would disable the server ceiling).
fn timeout_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_STATEMENT_TIMEOUT_MS)
}
