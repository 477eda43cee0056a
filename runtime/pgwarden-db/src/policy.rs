//! Security and retry policies.
//!
//! Both are loaded once by the embedding service and shared read-only across
//! calls. Durations are written as fractional seconds in serialized form.

use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_EXECUTION_TIME_SECS: f64 = 30.0;
pub const DEFAULT_MAX_ROWS: usize = 10_000;
pub const DEFAULT_SEARCH_PATH: &str = "public";

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("backoff_factor must be at least 1.0, got {0}")]
    BackoffFactor(f64),
    #[error("invalid identifier in {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
}

/// Limits and session confinement applied to every query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SecurityPolicy {
    #[serde(
        default = "default_max_execution_time",
        deserialize_with = "deserialize_secs"
    )]
    pub max_execution_time: Duration,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    /// Schemas searched for unqualified names, in order.
    #[serde(default = "default_search_path")]
    pub safe_search_path: Vec<String>,
    /// Role switched to for the duration of each transaction.
    #[serde(default)]
    pub readonly_role: Option<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            max_execution_time: default_max_execution_time(),
            max_rows: default_max_rows(),
            safe_search_path: default_search_path(),
            readonly_role: None,
        }
    }
}

impl SecurityPolicy {
    /// Search path as sent to the server: schemas joined by `", "`.
    pub fn rendered_search_path(&self) -> String {
        self.safe_search_path.join(", ")
    }

    /// Range and identifier checks, run once at load time.
    ///
    /// The hardener repeats the identifier checks before every use.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_execution_time.is_zero() {
            return Err(PolicyError::NotPositive {
                field: "max_execution_time",
            });
        }
        if self.max_rows == 0 {
            return Err(PolicyError::NotPositive { field: "max_rows" });
        }
        for schema in &self.safe_search_path {
            if schema.is_empty() || !is_identifier(schema) {
                return Err(PolicyError::InvalidIdentifier {
                    field: "safe_search_path",
                    value: schema.clone(),
                });
            }
        }
        if let Some(role) = &self.readonly_role {
            if role.is_empty() || !is_identifier(role) {
                return Err(PolicyError::InvalidIdentifier {
                    field: "readonly_role",
                    value: role.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Exponential backoff settings for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "RawRetryPolicy")]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        backoff_factor: f64,
    ) -> Result<Self, PolicyError> {
        if initial_delay.is_zero() {
            return Err(PolicyError::NotPositive {
                field: "initial_delay",
            });
        }
        if !backoff_factor.is_finite() || backoff_factor < 1.0 {
            return Err(PolicyError::BackoffFactor(backoff_factor));
        }
        Ok(Self {
            max_retries,
            initial_delay,
            backoff_factor,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts a persistently failing call makes.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    /// Delay after `delay`, uncapped apart from `Duration`'s own range.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.backoff_factor;
        Duration::try_from_secs_f64(next).unwrap_or(Duration::MAX)
    }

    /// The sleep before each retry, in order: `max_retries` entries.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay), |delay| {
            Some(self.next_delay(*delay))
        })
        .take(self.max_retries as usize)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_secs_f64(DEFAULT_INITIAL_DELAY_SECS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

#[derive(Deserialize)]
struct RawRetryPolicy {
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_initial_delay", deserialize_with = "deserialize_secs")]
    initial_delay: Duration,
    #[serde(default = "default_backoff_factor")]
    backoff_factor: f64,
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = PolicyError;

    fn try_from(raw: RawRetryPolicy) -> Result<Self, Self::Error> {
        RetryPolicy::new(raw.max_retries, raw.initial_delay, raw.backoff_factor)
    }
}

/// Alphanumeric or underscore only.
pub(crate) fn is_identifier(value: &str) -> bool {
    value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn default_max_execution_time() -> Duration {
    Duration::from_secs_f64(DEFAULT_MAX_EXECUTION_TIME_SECS)
}

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}

fn default_search_path() -> Vec<String> {
    vec![DEFAULT_SEARCH_PATH.to_string()]
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_delay() -> Duration {
    Duration::from_secs_f64(DEFAULT_INITIAL_DELAY_SECS)
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}
