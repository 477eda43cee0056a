//! tokio-postgres backed [`ConnectionPool`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;
use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, Config, Error as PgError, NoTls, Row as PgRow};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::async_pool::{AsyncPool, AsyncPooled};
use crate::error::BackendError;
use crate::session::{ConnectionPool, Session};
use crate::value::{PgInterval, PgValue, Row};

/// SQLSTATE for failures while establishing a connection.
const UNABLE_TO_CONNECT: &str = "08001";
/// SQLSTATE for use of a connection that has gone away.
const CONNECTION_DOES_NOT_EXIST: &str = "08003";

#[derive(Clone, Debug)]
pub struct PgPoolConfig {
    pub dsn: String,
    /// Connections opened up front by [`PgPool::new`].
    pub min_conns: usize,
    pub max_conns: usize,
    /// Idle connections older than this are closed instead of reused.
    pub max_idle: Option<Duration>,
    pub connect_timeout: Duration,
    /// How long `acquire` waits for a free connection.
    pub max_wait: Duration,
    /// Ping connections idle longer than this before handing them out.
    pub health_check_interval: Option<Duration>,
    /// Extra PEM root certificates, on top of the platform store.
    pub ssl_root_cert: Option<PathBuf>,
}

impl PgPoolConfig {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            min_conns: 0,
            max_conns: 16,
            max_idle: None,
            connect_timeout: Duration::from_secs(5),
            max_wait: Duration::from_millis(250),
            health_check_interval: None,
            ssl_root_cert: None,
        }
    }
}

pub struct PgConn {
    client: Client,
    in_transaction: bool,
    last_used: Instant,
}

impl PgConn {
    async fn connect(config: &PgPoolConfig) -> Result<Self, BackendError> {
        let mut pg_config = parse_dsn(&config.dsn)?;
        pg_config.connect_timeout(config.connect_timeout);
        let client = if pg_config.get_ssl_mode() == SslMode::Disable {
            let (client, connection) = pg_config.connect(NoTls).await.map_err(connect_error)?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    error!(error = %err, "postgres connection error");
                }
            });
            client
        } else {
            let tls = build_tls_connector(config)?;
            let (client, connection) = pg_config.connect(tls).await.map_err(connect_error)?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    error!(error = %err, "postgres connection error");
                }
            });
            client
        };
        debug!("opened postgres connection");
        Ok(Self {
            client,
            in_transaction: false,
            last_used: Instant::now(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Safe to hand to the next caller: open, with no transaction pending.
    pub fn is_reusable(&self) -> bool {
        !self.in_transaction && !self.client.is_closed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub async fn ping(&self) -> Result<(), BackendError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(query_error)
    }

    async fn end_transaction(&mut self, statement: &str) -> Result<(), BackendError> {
        self.client
            .batch_execute(statement)
            .await
            .map_err(query_error)?;
        self.in_transaction = false;
        Ok(())
    }
}

#[async_trait]
impl Session for PgConn {
    async fn begin_read_only(&mut self) -> Result<(), BackendError> {
        self.in_transaction = true;
        self.client
            .batch_execute("BEGIN READ ONLY")
            .await
            .map_err(query_error)
    }

    async fn execute(&mut self, statement: &str) -> Result<(), BackendError> {
        self.client
            .batch_execute(statement)
            .await
            .map_err(query_error)
    }

    async fn fetch(&mut self, sql: &str) -> Result<Vec<Row>, BackendError> {
        let rows = self.client.query(sql, &[]).await.map_err(query_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.end_transaction("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.end_transaction("ROLLBACK").await
    }
}

/// [`ConnectionPool`] over tokio-postgres connections.
///
/// Connections returned closed or mid-transaction are dropped rather than
/// reused; idle recycling and health checks run on checkout.
#[derive(Clone)]
pub struct PgPool {
    config: Arc<PgPoolConfig>,
    pool: AsyncPool<PgConn>,
}

impl PgPool {
    pub async fn new(config: PgPoolConfig) -> Result<Self, BackendError> {
        parse_dsn(&config.dsn)?;
        let config = Arc::new(config);
        let pool = {
            let cfg = Arc::clone(&config);
            AsyncPool::new(config.max_conns, move || {
                let cfg = Arc::clone(&cfg);
                async move { PgConn::connect(&cfg).await }
            })
            .with_max_wait(config.max_wait)
            .with_reuse_check(PgConn::is_reusable)
        };
        let pool_handle = Self { config, pool };
        pool_handle.prewarm().await?;
        Ok(pool_handle)
    }

    async fn prewarm(&self) -> Result<(), BackendError> {
        let target = self.config.min_conns.min(self.config.max_conns);
        let mut warm = Vec::with_capacity(target);
        for _ in 0..target {
            let conn = self
                .pool
                .acquire_within(Some(self.config.connect_timeout))
                .await?;
            warm.push(conn);
        }
        Ok(())
    }

    pub fn config(&self) -> &PgPoolConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn idle_count(&self) -> usize {
        self.pool.idle_count()
    }
}

#[async_trait]
impl ConnectionPool for PgPool {
    type Session = AsyncPooled<PgConn>;

    async fn acquire(&self) -> Result<Self::Session, BackendError> {
        loop {
            let mut conn = self
                .pool
                .acquire_within(Some(self.config.max_wait))
                .await?;
            if let Some(max_idle) = self.config.max_idle {
                if conn.idle_for() > max_idle {
                    debug!(idle = ?conn.idle_for(), "recycling idle connection");
                    conn.discard();
                    continue;
                }
            }
            if let Some(interval) = self.config.health_check_interval {
                if conn.idle_for() > interval {
                    if let Err(err) = conn.ping().await {
                        warn!(error = %err, "health check failed; discarding connection");
                        conn.discard();
                        continue;
                    }
                }
            }
            conn.touch();
            return Ok(conn);
        }
    }
}

fn parse_dsn(dsn: &str) -> Result<Config, BackendError> {
    Config::from_str(dsn)
        .map_err(|err| BackendError::unexpected(format!("invalid Postgres DSN: {err}")))
}

fn build_tls_connector(config: &PgPoolConfig) -> Result<MakeRustlsConnect, BackendError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "failed to load native root certificate");
    }
    let (_added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        debug!(ignored, "skipped unparsable native root certificates");
    }
    if let Some(path) = config.ssl_root_cert.as_ref() {
        let pem = std::fs::read(path).map_err(|err| {
            BackendError::unexpected(format!("failed to read {}: {err}", path.display()))
        })?;
        let mut cursor = std::io::Cursor::new(pem);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cursor)
            .collect::<Result<_, _>>()
            .map_err(invalid_root_cert)?;
        for cert in certs {
            roots.add(cert).map_err(invalid_root_cert)?;
        }
    }
    if roots.is_empty() {
        return Err(BackendError::unexpected(
            "no root certificates available for TLS",
        ));
    }
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

fn invalid_root_cert(err: impl std::fmt::Display) -> BackendError {
    BackendError::unexpected(format!("invalid root certificate: {err}"))
}

/// Driver error from an established connection.
fn query_error(err: PgError) -> BackendError {
    match err.as_db_error() {
        Some(db) => BackendError::database(db.code().code(), db.message()),
        None if err.is_closed() => {
            BackendError::database(CONNECTION_DOES_NOT_EXIST, err.to_string())
        }
        None => BackendError::Database {
            code: err.code().map(|state| state.code().to_string()),
            message: err.to_string(),
        },
    }
}

/// Driver error while connecting; uncoded failures count as transient.
fn connect_error(err: PgError) -> BackendError {
    match err.as_db_error() {
        Some(db) => BackendError::database(db.code().code(), db.message()),
        None => BackendError::database(UNABLE_TO_CONNECT, err.to_string()),
    }
}

fn decode_row(row: &PgRow) -> Result<Row, BackendError> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let value = decode_column(row, idx, column.type_())?;
            Ok((column.name().to_string(), value))
        })
        .collect()
}

#[derive(Clone, Copy)]
enum Shape {
    Scalar,
    Array,
}

fn decode_column(row: &PgRow, idx: usize, ty: &Type) -> Result<PgValue, BackendError> {
    let (ty, shape) = match ty.kind() {
        Kind::Array(member) => (member, Shape::Array),
        _ => (ty, Shape::Scalar),
    };
    if let Kind::Enum(_) = ty.kind() {
        return decode(row, idx, shape, |label: EnumLabel| PgValue::Text(label.0));
    }
    match *ty {
        Type::BOOL => decode(row, idx, shape, PgValue::Bool),
        Type::CHAR => decode(row, idx, shape, |v: i8| PgValue::Int(v.into())),
        Type::INT2 => decode(row, idx, shape, |v: i16| PgValue::Int(v.into())),
        Type::INT4 => decode(row, idx, shape, |v: i32| PgValue::Int(v.into())),
        Type::INT8 => decode(row, idx, shape, PgValue::Int),
        Type::OID => decode(row, idx, shape, |v: u32| PgValue::Int(v.into())),
        Type::FLOAT4 => decode(row, idx, shape, |v: f32| PgValue::Float(v.into())),
        Type::FLOAT8 => decode(row, idx, shape, PgValue::Float),
        Type::NUMERIC => decode(row, idx, shape, PgValue::Decimal),
        Type::DATE => decode(row, idx, shape, PgValue::Date),
        Type::TIME => decode(row, idx, shape, PgValue::Time),
        Type::TIMESTAMP => decode(row, idx, shape, PgValue::Timestamp),
        Type::TIMESTAMPTZ => decode(row, idx, shape, PgValue::TimestampTz),
        Type::INTERVAL => decode(row, idx, shape, PgValue::Interval),
        Type::UUID => decode(row, idx, shape, PgValue::Uuid),
        Type::BYTEA => decode(row, idx, shape, PgValue::Bytes),
        Type::JSON | Type::JSONB => decode(row, idx, shape, PgValue::Json),
        _ if ty.name() == "hstore" => decode(row, idx, shape, hstore),
        _ if <String as FromSql>::accepts(ty) => decode(row, idx, shape, PgValue::Text),
        _ => Err(BackendError::unexpected(format!(
            "unsupported type {} in column {}",
            ty.name(),
            row.columns()[idx].name()
        ))),
    }
}

fn decode<'a, T, W>(
    row: &'a PgRow,
    idx: usize,
    shape: Shape,
    wrap: W,
) -> Result<PgValue, BackendError>
where
    T: FromSql<'a>,
    W: Fn(T) -> PgValue,
{
    let value = match shape {
        Shape::Scalar => row
            .try_get::<_, Option<T>>(idx)
            .map_err(decode_error)?
            .map(&wrap),
        Shape::Array => row
            .try_get::<_, Option<Vec<Option<T>>>>(idx)
            .map_err(decode_error)?
            .map(|items| {
                PgValue::Array(
                    items
                        .into_iter()
                        .map(|item| item.map_or(PgValue::Null, &wrap))
                        .collect(),
                )
            }),
    };
    Ok(value.unwrap_or(PgValue::Null))
}

fn decode_error(err: PgError) -> BackendError {
    BackendError::unexpected(err.to_string())
}

fn hstore(map: HashMap<String, Option<String>>) -> PgValue {
    PgValue::Map(
        map.into_iter()
            .map(|(key, value)| (key, value.map_or(PgValue::Null, PgValue::Text)))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// Enum values arrive as their label bytes.
struct EnumLabel(String);

impl<'a> FromSql<'a> for EnumLabel {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(Self(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_))
    }
}

/// Binary layout: microseconds (i64), days (i32), months (i32), big-endian.
impl<'a> FromSql<'a> for PgInterval {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        let raw: &[u8; 16] = raw
            .try_into()
            .map_err(|_| format!("invalid interval length {}", raw.len()))?;
        let mut micros = [0u8; 8];
        let mut days = [0u8; 4];
        let mut months = [0u8; 4];
        micros.copy_from_slice(&raw[..8]);
        days.copy_from_slice(&raw[8..12]);
        months.copy_from_slice(&raw[12..]);
        Ok(PgInterval::new(
            i32::from_be_bytes(months),
            i32::from_be_bytes(days),
            i64::from_be_bytes(micros),
        ))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INTERVAL
    }
}
