use async_trait::async_trait;
use pgwarden_db::{AsyncPool, BackendError, PgValue, Row, Session};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// What the next `fetch` does.
#[allow(dead_code)]
pub enum Outcome {
    Rows(Vec<Row>),
    Fail(BackendError),
    /// Never completes; only the caller's timeout ends it.
    Hang,
}

#[derive(Default)]
pub struct ScriptState {
    pub outcomes: VecDeque<Outcome>,
    pub default_rows: Vec<Row>,
    pub statements: Vec<String>,
    pub fetch_delay: Option<Duration>,
    pub fetch_times: Vec<Instant>,
    pub connects: usize,
    pub connect_failures: VecDeque<BackendError>,
    pub active_fetches: usize,
    pub max_active_fetches: usize,
    /// `(needle, error)`: the next `execute` containing `needle` fails once.
    pub execute_failures: Vec<(String, BackendError)>,
}

/// Shared, scriptable backend state for [`ScriptedConn`]s.
#[derive(Clone, Default)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

#[allow(dead_code)]
impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Row>) -> Self {
        let script = Self::default();
        script.state().default_rows = rows;
        script
    }

    pub fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script state")
    }

    pub fn push(&self, outcome: Outcome) -> &Self {
        self.state().outcomes.push_back(outcome);
        self
    }

    pub fn fail_execute(&self, needle: &str, err: BackendError) -> &Self {
        self.state()
            .execute_failures
            .push((needle.to_string(), err));
        self
    }

    pub fn fail_connect(&self, err: BackendError) -> &Self {
        self.state().connect_failures.push_back(err);
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.state().fetch_times.clone()
    }

    pub fn fetches(&self) -> usize {
        self.state().fetch_times.len()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    fn open(&self) -> Result<ScriptedConn, BackendError> {
        let mut state = self.state();
        state.connects += 1;
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        Ok(ScriptedConn {
            script: self.clone(),
            in_transaction: false,
        })
    }

    fn record(&self, statement: &str) {
        self.state().statements.push(statement.to_string());
    }
}

pub struct ScriptedConn {
    script: Script,
    pub in_transaction: bool,
}

/// Tracks concurrent fetches; decrements even when the fetch is abandoned.
struct ActiveFetch<'a>(&'a Script);

impl<'a> ActiveFetch<'a> {
    fn enter(script: &'a Script) -> Self {
        let mut state = script.state();
        state.fetch_times.push(Instant::now());
        state.active_fetches += 1;
        state.max_active_fetches = state.max_active_fetches.max(state.active_fetches);
        Self(script)
    }
}

impl Drop for ActiveFetch<'_> {
    fn drop(&mut self) {
        self.0.state().active_fetches -= 1;
    }
}

#[async_trait]
impl Session for ScriptedConn {
    async fn begin_read_only(&mut self) -> Result<(), BackendError> {
        self.script.record("BEGIN READ ONLY");
        self.in_transaction = true;
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> Result<(), BackendError> {
        self.script.record(statement);
        let mut state = self.script.state();
        let position = state
            .execute_failures
            .iter()
            .position(|(needle, _)| statement.contains(needle.as_str()));
        match position {
            Some(index) => Err(state.execute_failures.remove(index).1),
            None => Ok(()),
        }
    }

    async fn fetch(&mut self, sql: &str) -> Result<Vec<Row>, BackendError> {
        self.script.record(sql);
        let _active = ActiveFetch::enter(&self.script);
        let (outcome, delay) = {
            let mut state = self.script.state();
            let outcome = state
                .outcomes
                .pop_front()
                .unwrap_or_else(|| Outcome::Rows(state.default_rows.clone()));
            (outcome, state.fetch_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Fail(err) => Err(err),
            Outcome::Hang => std::future::pending().await,
        }
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.script.record("COMMIT");
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.script.record("ROLLBACK");
        self.in_transaction = false;
        Ok(())
    }
}

/// Pool over scripted connections that, like the Postgres pool, drops
/// connections returned mid-transaction.
pub fn scripted_pool(script: &Script, size: usize) -> AsyncPool<ScriptedConn> {
    let script = script.clone();
    AsyncPool::new(size, move || {
        let script = script.clone();
        async move { script.open() }
    })
    .with_reuse_check(|conn: &ScriptedConn| !conn.in_transaction)
}

#[allow(dead_code)]
pub fn row(cells: &[(&str, PgValue)]) -> Row {
    cells
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[allow(dead_code)]
pub fn db_error(code: &str, message: &str) -> BackendError {
    BackendError::database(code, message)
}
