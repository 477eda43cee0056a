//! Guarded query execution with retry on transient failures.
//!
//! Each attempt checks out one session, opens a `READ ONLY` transaction,
//! hardens it, runs the query under a timeout, and commits. Failed attempts
//! are classified; only transient database failures are retried, sleeping
//! `initial_delay * backoff_factor^n` between attempts.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, debug, error, info_span, warn};

use crate::classify::{Classification, TransientCodes, classify};
use crate::error::{
    AttemptError, ErrorContext, ExecutorError, FailureClass, SQL_CONTEXT_LIMIT, truncate_sql,
};
use crate::hardener::{SessionHardener, SessionSettings};
use crate::limiter::limit_rows;
use crate::policy::{RetryPolicy, SecurityPolicy};
use crate::session::{ConnectionPool, Session};
use crate::value::{JsonRow, Row, serialize_row};

/// One query to run. Unset (or zero) limits fall back to the security policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub sql: String,
    pub timeout: Option<Duration>,
    pub max_rows: Option<usize>,
}

impl ExecutionRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            timeout: None,
            max_rows: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

/// Serialized rows plus the number of rows the query produced before the
/// row limit was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub rows: Vec<JsonRow>,
    pub total_count: usize,
}

/// Per-call retry bookkeeping.
#[derive(Debug)]
struct RetryAttempt {
    attempt_number: u32,
    accumulated_delay: Duration,
    last_error: Option<AttemptError>,
}

/// Runs pre-approved queries against a [`ConnectionPool`].
///
/// Holds only immutable configuration, so one executor can serve any number
/// of concurrent calls.
pub struct QueryExecutor<P> {
    pool: P,
    hardener: SessionHardener,
    retry: RetryPolicy,
    transient: TransientCodes,
}

impl<P: ConnectionPool> QueryExecutor<P> {
    pub fn new(pool: P, security: Arc<SecurityPolicy>, retry: RetryPolicy) -> Self {
        Self {
            pool,
            hardener: SessionHardener::new(security),
            retry,
            transient: TransientCodes::default(),
        }
    }

    /// Replace the SQLSTATE codes treated as transient.
    pub fn with_transient_codes(mut self, transient: TransientCodes) -> Self {
        self.transient = transient;
        self
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn security(&self) -> &SecurityPolicy {
        self.hardener.policy()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn execute(
        &self,
        sql: &str,
        timeout: Option<Duration>,
        max_rows: Option<usize>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let policy = self.security();
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(policy.max_execution_time);
        let max_rows = max_rows.filter(|n| *n > 0).unwrap_or(policy.max_rows);

        let span = info_span!(
            "execute",
            sql = %truncate_sql(sql, SQL_CONTEXT_LIMIT),
            timeout_ms = millis(timeout),
            max_rows,
        );
        self.execute_with_retry(sql, timeout, max_rows)
            .instrument(span)
            .await
    }

    pub async fn execute_request(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.execute(&request.sql, request.timeout, request.max_rows)
            .await
    }

    async fn execute_with_retry(
        &self,
        sql: &str,
        timeout: Duration,
        max_rows: usize,
    ) -> Result<ExecutionResult, ExecutorError> {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts();
        let mut delay = self.retry.initial_delay();
        let mut attempt = RetryAttempt {
            attempt_number: 0,
            accumulated_delay: Duration::ZERO,
            last_error: None,
        };

        for number in 1..=max_attempts {
            attempt.attempt_number = number;
            let err = match self.execute_once(sql, timeout, max_rows).await {
                Ok(result) => {
                    debug!(
                        attempt = number,
                        rows = result.rows.len(),
                        total_count = result.total_count,
                        "query succeeded"
                    );
                    return Ok(result);
                }
                Err(err) => err,
            };

            match classify(&err, &self.transient) {
                Classification::Transient(code) if number < max_attempts => {
                    warn!(
                        attempt = number,
                        max_attempts,
                        error_code = %code,
                        retry_delay_ms = millis(delay),
                        error = %err,
                        "retryable database error"
                    );
                    sleep(delay).await;
                    attempt.accumulated_delay = attempt.accumulated_delay.saturating_add(delay);
                    attempt.last_error = Some(err);
                    delay = self.retry.next_delay(delay);
                }
                class => return Err(surface(err, class, &attempt, sql, timeout, started)),
            }
        }

        // Every path above returns on the last attempt.
        let context = ErrorContext {
            sql: Some(truncate_sql(sql, SQL_CONTEXT_LIMIT)),
            attempts: attempt.attempt_number,
            elapsed_ms: millis(started.elapsed()),
            ..ErrorContext::default()
        };
        Err(match attempt.last_error {
            Some(last) => ExecutorError::Database {
                class: FailureClass::Transient,
                message: format!(
                    "Database query failed after {} attempts: {last}",
                    attempt.attempt_number
                ),
                context: ErrorContext {
                    error_code: last.code().map(str::to_string),
                    error_message: Some(last.to_string()),
                    ..context
                },
            },
            None => ExecutorError::Database {
                class: FailureClass::Unexpected,
                message: "Query execution failed unexpectedly".to_string(),
                context,
            },
        })
    }

    /// One attempt: validate settings, then acquire, harden, fetch, commit.
    async fn execute_once(
        &self,
        sql: &str,
        timeout: Duration,
        max_rows: usize,
    ) -> Result<ExecutionResult, AttemptError> {
        // A bad policy must fail before any connection is touched.
        let settings = self.hardener.plan(timeout)?;

        let mut session = self.pool.acquire().await?;
        session.begin_read_only().await?;
        let rows = match self.fetch_hardened(&mut session, &settings, sql, timeout).await {
            Ok(rows) => rows,
            // The transaction is left open; the pool discards the connection.
            Err(err @ AttemptError::Timeout { .. }) => return Err(err),
            Err(err) => {
                if let Err(rollback) = session.rollback().await {
                    debug!(error = %rollback, "rollback after failed attempt also failed");
                }
                return Err(err);
            }
        };
        session.commit().await?;
        drop(session);

        let (rows, total_count) = limit_rows(rows, max_rows);
        Ok(ExecutionResult {
            rows: rows.iter().map(serialize_row).collect(),
            total_count,
        })
    }

    async fn fetch_hardened(
        &self,
        session: &mut P::Session,
        settings: &SessionSettings,
        sql: &str,
        timeout: Duration,
    ) -> Result<Vec<Row>, AttemptError> {
        self.hardener.apply(session, settings).await?;
        match tokio::time::timeout(timeout, session.fetch(sql)).await {
            Ok(rows) => Ok(rows?),
            Err(_) => Err(AttemptError::Timeout { timeout }),
        }
    }
}

/// Turn a non-retried attempt failure into the caller-facing error.
fn surface(
    err: AttemptError,
    class: Classification,
    attempt: &RetryAttempt,
    sql: &str,
    timeout: Duration,
    started: Instant,
) -> ExecutorError {
    let mut context = ErrorContext {
        error_code: err.code().map(str::to_string),
        error_message: Some(err.to_string()),
        sql: Some(truncate_sql(sql, SQL_CONTEXT_LIMIT)),
        attempts: attempt.attempt_number,
        elapsed_ms: millis(started.elapsed()),
        timeout_ms: None,
        settings: None,
    };
    if let AttemptError::Session { settings, .. } = &err {
        context.settings = Some(settings.clone());
    }

    let (class, message) = match class {
        Classification::Timeout => {
            let timeout_ms = millis(timeout);
            context.timeout_ms = Some(timeout_ms);
            warn!(timeout_ms, attempts = attempt.attempt_number, "query timed out");
            return ExecutorError::Timeout {
                timeout_ms,
                context,
            };
        }
        Classification::Transient(_) => (
            FailureClass::Transient,
            format!(
                "Database query failed after {} attempts: {err}",
                attempt.attempt_number
            ),
        ),
        Classification::Permanent(_) => {
            (FailureClass::Permanent, format!("Database query failed: {err}"))
        }
        Classification::Configuration => {
            (FailureClass::Configuration, capitalize(&err.to_string()))
        }
        Classification::Unexpected => (
            FailureClass::Unexpected,
            format!("Unexpected error during query execution: {err}"),
        ),
    };
    error!(
        class = ?class,
        error_code = context.error_code.as_deref(),
        attempts = attempt.attempt_number,
        retry_wait_ms = millis(attempt.accumulated_delay),
        "{message}"
    );
    ExecutorError::Database {
        class,
        message,
        context,
    }
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
