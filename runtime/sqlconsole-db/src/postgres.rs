//! Async Postgres store.
//!
//! Result columns are resolved from the prepared statement and mapped to
//! [`ScanType`]s through [`scan_type_for`]; anything outside that table is a
//! column-metadata failure rather than a guess.

use std::error::Error as StdError;
use std::fmt::Write as _;
use std::future::Future;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, Config, Error as PgError, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, warn};

use crate::async_pool::{AsyncAcquireError, AsyncPool, AsyncPooled, CancelToken};
use crate::lock;
use crate::stats::PoolStats;
use crate::store::{Cursor, Store, StoreError, slot_count_mismatch};
use crate::value::{DynamicValue, ScanType, Slot};

type BoxError = Box<dyn StdError + Sync + Send>;

/// Idle connections kept parked when nothing else is configured.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 2;

#[derive(Clone, Debug)]
pub struct PgPoolConfig {
    pub dsn: String,
    pub min_conns: usize,
    pub max_conns: usize,
    /// Parked connections beyond this count are closed on release.
    pub max_idle_conns: Option<usize>,
    /// Connections idle longer than this are closed instead of reused.
    pub max_idle: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub connect_timeout: Duration,
    pub max_wait: Duration,
    pub health_check_interval: Option<Duration>,
    pub ssl_root_cert: Option<std::path::PathBuf>,
}

impl PgPoolConfig {
    pub fn new(dsn: String) -> Self {
        Self {
            dsn,
            min_conns: 0,
            max_conns: 16,
            max_idle_conns: Some(DEFAULT_MAX_IDLE_CONNS),
            max_idle: None,
            max_lifetime: None,
            connect_timeout: Duration::from_secs(5),
            max_wait: Duration::from_secs(30),
            health_check_interval: None,
            ssl_root_cert: None,
        }
    }

    /// Builds a key/value DSN from the libpq environment (`PGHOST`, `PGPORT`,
    /// `PGUSER`, `PGPASSWORD`, `PGDATABASE`) with TLS disabled.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let mut parts = vec!["sslmode=disable".to_string()];
        let host = lookup("PGHOST").unwrap_or_else(|| "localhost".to_string());
        parts.push(format!("host={}", quote_dsn_value(&host)));
        if let Some(user) = lookup("PGUSER").or_else(|| lookup("USER")) {
            parts.push(format!("user={}", quote_dsn_value(&user)));
        }
        for (var, key) in [
            ("PGPORT", "port"),
            ("PGPASSWORD", "password"),
            ("PGDATABASE", "dbname"),
        ] {
            if let Some(value) = lookup(var) {
                parts.push(format!("{key}={}", quote_dsn_value(&value)));
            }
        }
        Self::new(parts.join(" "))
    }
}

fn quote_dsn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

pub struct PgConn {
    client: Client,
    cancel_token: tokio_postgres::CancelToken,
    tls: PgTls,
    created: Instant,
    last_used: Mutex<Instant>,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConn {
    async fn connect(config: &PgPoolConfig) -> Result<Self, String> {
        let mut pg_config = Config::from_str(&config.dsn)
            .map_err(|err| format!("invalid Postgres DSN: {err}"))?;
        pg_config.connect_timeout(config.connect_timeout);
        let ssl_mode = pg_config.get_ssl_mode();
        let (client, tls) = if ssl_mode == SslMode::Disable {
            let (client, connection) = pg_config
                .connect(NoTls)
                .await
                .map_err(|err| pg_error_text(&err))?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    error!(error = %err, "postgres connection error");
                }
            });
            (client, PgTls::None)
        } else {
            let tls = build_tls_connector(config)?;
            let (client, connection) = pg_config
                .connect(tls.clone())
                .await
                .map_err(|err| pg_error_text(&err))?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    error!(error = %err, "postgres connection error");
                }
            });
            (client, PgTls::Rustls(tls))
        };
        let cancel_token = client.cancel_token();
        let now = Instant::now();
        Ok(Self {
            client,
            cancel_token,
            tls,
            created: now,
            last_used: Mutex::new(now),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Asks the server to abort whatever this connection is running.
    pub async fn cancel_query(&self) -> Result<(), PgError> {
        match &self.tls {
            PgTls::None => self.cancel_token.cancel_query(NoTls).await,
            PgTls::Rustls(tls) => self.cancel_token.cancel_query(tls.clone()).await,
        }
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    pub async fn ping(&self) -> Result<(), PgError> {
        self.client.simple_query("SELECT 1").await.map(|_| ())
    }
}

pub struct PgPool {
    config: Arc<PgPoolConfig>,
    pool: Arc<AsyncPool<PgConn>>,
}

impl PgPool {
    pub async fn new(config: PgPoolConfig) -> Result<Self, String> {
        let config = Arc::new(config);
        let pool = {
            let cfg = config.clone();
            AsyncPool::with_max_idle(config.max_conns, config.max_idle_conns, move || {
                let cfg = cfg.clone();
                async move { PgConn::connect(&cfg).await }
            })
        };
        let pool_handle = Self { config, pool };
        pool_handle.prewarm().await?;
        Ok(pool_handle)
    }

    async fn prewarm(&self) -> Result<(), String> {
        if self.config.min_conns == 0 {
            return Ok(());
        }
        let mut warmed = Vec::new();
        for _ in 0..self.config.min_conns.min(self.config.max_conns) {
            let conn = self
                .pool
                .acquire(Some(self.config.connect_timeout), None)
                .await
                .map_err(|err| format!("prewarm failed: {err}"))?;
            warmed.push(conn);
        }
        Ok(())
    }

    pub async fn acquire(
        &self,
        cancel: Option<&CancelToken>,
    ) -> Result<AsyncPooled<PgConn>, AsyncAcquireError> {
        loop {
            let conn = self
                .pool
                .acquire(Some(self.config.max_wait), cancel)
                .await?;
            if conn.as_ref().client().is_closed() {
                debug!("discarding closed postgres connection");
                conn.discard();
                continue;
            }
            if let Some(max_lifetime) = self.config.max_lifetime {
                if conn.as_ref().age() > max_lifetime {
                    self.pool.counters().record_max_lifetime_closed();
                    conn.discard();
                    continue;
                }
            }
            if let Some(max_idle) = self.config.max_idle {
                if conn.as_ref().idle_for() > max_idle {
                    self.pool.counters().record_max_idle_time_closed();
                    conn.discard();
                    continue;
                }
            }
            if let Some(interval) = self.config.health_check_interval {
                if conn.as_ref().idle_for() > interval {
                    match conn.as_ref().ping().await {
                        Ok(()) => conn.as_ref().touch(),
                        Err(err) => {
                            debug!(error = %err, "discarding unhealthy postgres connection");
                            conn.discard();
                            continue;
                        }
                    }
                }
            }
            return Ok(conn);
        }
    }

    pub fn config(&self) -> &PgPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

fn build_tls_connector(config: &PgPoolConfig) -> Result<MakeRustlsConnect, String> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "failed to load a native root certificate");
    }
    for cert in native.certs {
        roots.add(cert).map_err(|err| err.to_string())?;
    }
    if let Some(path) = config.ssl_root_cert.as_ref() {
        let pem = std::fs::read(path).map_err(|err| err.to_string())?;
        let certs = CertificateDer::pem_slice_iter(&pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| err.to_string())?;
        for cert in certs {
            roots.add(cert).map_err(|err| err.to_string())?;
        }
    }
    if roots.is_empty() {
        return Err("no root certificates available for TLS".to_string());
    }
    let tls_config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|err| err.to_string())?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

/// Server-reported errors keep the server's wording; client-side failures
/// use the driver's, followed by the underlying cause when it adds detail.
fn pg_error_text(err: &PgError) -> String {
    if let Some(db) = err.as_db_error() {
        return db.to_string();
    }
    let text = err.to_string();
    match err.source().map(|cause| cause.to_string()) {
        Some(cause) if !text.contains(&cause) => format!("{text}: {cause}"),
        _ => text,
    }
}

/// Whether `err` left the connection unusable.
fn is_fatal(err: &PgError) -> bool {
    err.is_closed()
        || err
            .as_db_error()
            .is_some_and(|db| matches!(db.severity(), "FATAL" | "PANIC"))
}

/// Exhaustive Postgres type table. `None` means the type is not decodable.
pub fn scan_type_for(ty: &Type) -> Option<ScanType> {
    match ty.kind() {
        Kind::Domain(base) => return scan_type_for(base),
        Kind::Array(member) => return scan_type_for(member).map(|_| ScanType::Array),
        Kind::Enum(_) => return Some(ScanType::Text),
        _ => {}
    }
    let scan_type = match *ty {
        Type::BOOL => ScanType::Bool,
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => ScanType::Int,
        Type::FLOAT4 | Type::FLOAT8 => ScanType::Float,
        Type::CHAR
        | Type::UUID
        | Type::INET
        | Type::CIDR
        | Type::MACADDR
        | Type::MACADDR8
        | Type::INTERVAL
        | Type::TIMETZ => ScanType::Text,
        Type::BYTEA => ScanType::Bytes,
        Type::NUMERIC | Type::MONEY => ScanType::Decimal,
        Type::DATE => ScanType::Date,
        Type::TIME => ScanType::Time,
        Type::TIMESTAMP => ScanType::Timestamp,
        Type::TIMESTAMPTZ => ScanType::TimestampTz,
        Type::JSON | Type::JSONB => ScanType::Json,
        _ if <String as FromSql>::accepts(ty) => ScanType::Text,
        _ => return None,
    };
    Some(scan_type)
}

/// One column of a row, decoded according to its wire type.
struct Cell(DynamicValue);

impl<'a> FromSql<'a> for Cell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_raw(ty, raw).map(Cell)
    }

    fn from_sql_null(_: &Type) -> Result<Self, BoxError> {
        Ok(Cell(DynamicValue::Null))
    }

    fn accepts(ty: &Type) -> bool {
        scan_type_for(ty).is_some()
    }
}

fn decode_raw(ty: &Type, raw: &[u8]) -> Result<DynamicValue, BoxError> {
    match ty.kind() {
        Kind::Domain(base) => return decode_raw(base, raw),
        Kind::Array(member) => return array_values(member, raw).map(DynamicValue::Array),
        Kind::Enum(_) => return Ok(DynamicValue::Text(std::str::from_utf8(raw)?.to_owned())),
        _ => {}
    }
    let value = match *ty {
        Type::BOOL => DynamicValue::Bool(bool::from_sql(ty, raw)?),
        Type::INT2 => DynamicValue::Int(i16::from_sql(ty, raw)?.into()),
        Type::INT4 => DynamicValue::Int(i32::from_sql(ty, raw)?.into()),
        Type::INT8 => DynamicValue::Int(i64::from_sql(ty, raw)?),
        Type::OID => DynamicValue::Int(u32::from_sql(ty, raw)?.into()),
        Type::FLOAT4 => DynamicValue::Float(f32::from_sql(ty, raw)?.into()),
        Type::FLOAT8 => DynamicValue::Float(f64::from_sql(ty, raw)?),
        Type::CHAR => DynamicValue::Text(char_text(raw)?),
        Type::UUID => DynamicValue::Text(uuid::Uuid::from_sql(ty, raw)?.to_string()),
        Type::INET | Type::CIDR => DynamicValue::Text(inet_text(raw)?),
        Type::MACADDR | Type::MACADDR8 => DynamicValue::Text(mac_text(raw)?),
        Type::INTERVAL => DynamicValue::Text(interval_text(raw)?),
        Type::TIMETZ => DynamicValue::Text(timetz_text(raw)?),
        Type::BYTEA => DynamicValue::Bytes(raw.to_vec()),
        Type::NUMERIC => DynamicValue::Decimal(numeric_to_string(raw)?),
        Type::MONEY => DynamicValue::Decimal(money_text(raw)?),
        Type::DATE => DynamicValue::Date(NaiveDate::from_sql(ty, raw)?),
        Type::TIME => DynamicValue::Time(NaiveTime::from_sql(ty, raw)?),
        Type::TIMESTAMP => DynamicValue::Timestamp(NaiveDateTime::from_sql(ty, raw)?),
        Type::TIMESTAMPTZ => DynamicValue::TimestampTz(DateTime::<Utc>::from_sql(ty, raw)?),
        Type::JSON | Type::JSONB => DynamicValue::Json(serde_json::Value::from_sql(ty, raw)?),
        _ if <String as FromSql>::accepts(ty) => {
            DynamicValue::Text(std::str::from_utf8(raw)?.to_owned())
        }
        _ => return Err(format!("unsupported column type {ty}").into()),
    };
    Ok(value)
}

fn fixed<const N: usize>(raw: &[u8], at: usize) -> Result<[u8; N], BoxError> {
    raw.get(at..at + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| "truncated value".into())
}

fn exact_len(raw: &[u8], len: usize, what: &str) -> Result<(), BoxError> {
    if raw.len() != len {
        return Err(format!("invalid {what} payload of {} bytes", raw.len()).into());
    }
    Ok(())
}

/// Binary array layout: dimension count, null flag, element oid, one
/// (length, lower bound) pair per dimension, then length-prefixed elements.
fn array_values(member: &Type, raw: &[u8]) -> Result<Vec<DynamicValue>, BoxError> {
    let ndim = usize::try_from(i32::from_be_bytes(fixed(raw, 0)?))
        .map_err(|_| "negative array dimension count")?;
    let mut at = 12;
    let mut count: usize = if ndim == 0 { 0 } else { 1 };
    for _ in 0..ndim {
        let len = usize::try_from(i32::from_be_bytes(fixed(raw, at)?))
            .map_err(|_| "negative array dimension")?;
        count = count.checked_mul(len).ok_or("array dimensions overflow")?;
        at += 8;
    }
    let mut values = Vec::new();
    for _ in 0..count {
        let len = i32::from_be_bytes(fixed(raw, at)?);
        at += 4;
        let Ok(len) = usize::try_from(len) else {
            values.push(DynamicValue::Null);
            continue;
        };
        let element = raw.get(at..at + len).ok_or("truncated array element")?;
        values.push(decode_raw(member, element)?);
        at += len;
    }
    if at != raw.len() {
        return Err("array payload has trailing bytes".into());
    }
    Ok(values)
}

/// `"char"` is a single byte; high-bit bytes print as octal escapes.
fn char_text(raw: &[u8]) -> Result<String, BoxError> {
    exact_len(raw, 1, "\"char\"")?;
    let text = match raw[0] {
        0 => String::new(),
        byte if byte.is_ascii() => char::from(byte).to_string(),
        byte => format!("\\{byte:03o}"),
    };
    Ok(text)
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// Binary layout: family, prefix bits, cidr flag, address length, address.
/// The prefix is shown for cidr values and for inet values narrower than
/// the address.
fn inet_text(raw: &[u8]) -> Result<String, BoxError> {
    let [family, bits, is_cidr, len] = fixed::<4>(raw, 0)?;
    let address = &raw[4..];
    exact_len(address, usize::from(len), "inet address")?;
    let (addr, max_bits) = match family {
        PGSQL_AF_INET => (IpAddr::from(fixed::<4>(address, 0)?), 32),
        PGSQL_AF_INET6 => (IpAddr::from(fixed::<16>(address, 0)?), 128),
        other => return Err(format!("invalid inet family {other}").into()),
    };
    if is_cidr != 0 || bits != max_bits {
        Ok(format!("{addr}/{bits}"))
    } else {
        Ok(addr.to_string())
    }
}

fn mac_text(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() != 6 && raw.len() != 8 {
        return Err(format!("invalid macaddr payload of {} bytes", raw.len()).into());
    }
    let octets: Vec<String> = raw.iter().map(|byte| format!("{byte:02x}")).collect();
    Ok(octets.join(":"))
}

const MICROS_PER_SECOND: u64 = 1_000_000;

/// `HH:MM:SS` with a fractional part only when non-zero.
fn clock_text(micros: u64) -> String {
    let seconds = micros / MICROS_PER_SECOND;
    let fraction = micros % MICROS_PER_SECOND;
    let mut out = format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        seconds / 60 % 60,
        seconds % 60
    );
    if fraction > 0 {
        let digits = format!("{fraction:06}");
        out.push('.');
        out.push_str(digits.trim_end_matches('0'));
    }
    out
}

/// Renders an interval the way the server's default `postgres` style does:
/// `1 year 2 mons -3 days +04:05:06.5`.
fn interval_text(raw: &[u8]) -> Result<String, BoxError> {
    exact_len(raw, 16, "interval")?;
    let micros = i64::from_be_bytes(fixed(raw, 0)?);
    let days = i32::from_be_bytes(fixed(raw, 8)?);
    let months = i32::from_be_bytes(fixed(raw, 12)?);

    let mut parts = Vec::new();
    let mut negative_seen = false;
    for (value, unit, plural) in [
        (months / 12, "year", "years"),
        (months % 12, "mon", "mons"),
        (days, "day", "days"),
    ] {
        if value == 0 {
            continue;
        }
        let sign = if negative_seen && value > 0 { "+" } else { "" };
        let unit = if value == 1 { unit } else { plural };
        parts.push(format!("{sign}{value} {unit}"));
        negative_seen |= value < 0;
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 {
            "-"
        } else if negative_seen {
            "+"
        } else {
            ""
        };
        parts.push(format!("{sign}{}", clock_text(micros.unsigned_abs())));
    }
    Ok(parts.join(" "))
}

/// Time of day followed by the UTC offset. The wire carries the zone as
/// seconds west of UTC.
fn timetz_text(raw: &[u8]) -> Result<String, BoxError> {
    exact_len(raw, 12, "timetz")?;
    let micros = u64::try_from(i64::from_be_bytes(fixed(raw, 0)?))
        .map_err(|_| "negative time of day")?;
    let offset = -i64::from(i32::from_be_bytes(fixed(raw, 8)?));
    let sign = if offset < 0 { '-' } else { '+' };
    let offset = offset.unsigned_abs();
    let mut out = format!("{}{sign}{:02}", clock_text(micros), offset / 3600);
    if offset % 3600 != 0 {
        write!(out, ":{:02}", offset / 60 % 60)?;
        if offset % 60 != 0 {
            write!(out, ":{:02}", offset % 60)?;
        }
    }
    Ok(out)
}

/// MONEY is a count of cents.
fn money_text(raw: &[u8]) -> Result<String, BoxError> {
    exact_len(raw, 8, "money")?;
    let cents = i64::from_be_bytes(fixed(raw, 0)?);
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    Ok(format!("{sign}{}.{:02}", cents / 100, cents % 100))
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// NUMERIC rendered as exact decimal text.
fn numeric_to_string(raw: &[u8]) -> Result<String, BoxError> {
    let word = |at: usize| fixed::<2>(raw, at);
    let ndigits = i16::from_be_bytes(word(0)?);
    let weight = i16::from_be_bytes(word(2)?);
    let sign = u16::from_be_bytes(word(4)?);
    let dscale = usize::from(u16::from_be_bytes(word(6)?));
    let ndigits = usize::try_from(ndigits).map_err(|_| "negative numeric digit count")?;
    if raw.len() != 8 + ndigits * 2 {
        return Err("numeric digit count does not match payload".into());
    }
    let digits = (0..ndigits)
        .map(|i| word(8 + i * 2).map(u16::from_be_bytes))
        .collect::<Result<Vec<u16>, _>>()?;

    let mut out = String::new();
    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_NEG => out.push('-'),
        NUMERIC_POS => {}
        other => return Err(format!("invalid numeric sign {other:#06x}").into()),
    }

    let digit = |idx: i32| -> u16 {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| digits.get(idx).copied())
            .unwrap_or(0)
    };
    let weight = i32::from(weight);
    if weight < 0 {
        out.push('0');
    } else {
        write!(out, "{}", digit(0))?;
        for idx in 1..=weight {
            write!(out, "{:04}", digit(idx))?;
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while fraction.len() < dscale {
            write!(fraction, "{:04}", digit(idx))?;
            idx += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

fn decode(row: &Row, idx: usize) -> Result<DynamicValue, StoreError> {
    row.try_get::<_, Cell>(idx)
        .map(|cell| cell.0)
        .map_err(|err| StoreError::Scan(pg_error_text(&err)))
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: PgPoolConfig) -> Result<Self, String> {
        Ok(Self {
            pool: PgPool::new(config).await?,
        })
    }
}

async fn execute(client: &Client, sql: &str) -> Result<(Vec<String>, Vec<Type>, Vec<Row>), PgError> {
    let statement = client.prepare(sql).await?;
    let rows = client.query(&statement, &[]).await?;
    let (names, types) = statement
        .columns()
        .iter()
        .map(|column| (column.name().to_string(), column.type_().clone()))
        .unzip();
    Ok((names, types, rows))
}

impl Store for PgStore {
    type Cursor = PgCursor;

    fn query(
        &self,
        sql: &str,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<PgCursor, StoreError>> + Send {
        async move {
            let conn = self.pool.acquire(Some(cancel)).await?;
            let outcome = tokio::select! {
                result = execute(conn.as_ref().client(), sql) => Some(result),
                _ = cancel.cancelled() => None,
            };
            match outcome {
                Some(Ok((names, types, rows))) => {
                    conn.as_ref().touch();
                    Ok(PgCursor {
                        names,
                        types,
                        rows: rows.into_iter(),
                        current: None,
                    })
                }
                Some(Err(err)) => {
                    if is_fatal(&err) || conn.as_ref().client().is_closed() {
                        debug!(error = %err, "discarding broken postgres connection");
                        conn.discard();
                    } else {
                        conn.as_ref().touch();
                    }
                    Err(StoreError::Query(pg_error_text(&err)))
                }
                None => {
                    let abort = conn.as_ref().cancel_query();
                    match tokio::time::timeout(self.pool.config().connect_timeout, abort).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(error = %err, "postgres cancel request failed"),
                        Err(_) => warn!("postgres cancel request timed out"),
                    }
                    conn.discard();
                    Err(StoreError::Cancelled)
                }
            }
        }
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// Fully fetched result of a Postgres statement.
pub struct PgCursor {
    names: Vec<String>,
    types: Vec<Type>,
    rows: std::vec::IntoIter<Row>,
    current: Option<Row>,
}

impl Cursor for PgCursor {
    fn column_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.names.clone())
    }

    fn column_types(&self) -> Result<Vec<ScanType>, StoreError> {
        self.types
            .iter()
            .map(|ty| {
                scan_type_for(ty)
                    .ok_or_else(|| StoreError::Columns(format!("unsupported column type {ty}")))
            })
            .collect()
    }

    fn advance(&mut self) -> Result<bool, StoreError> {
        self.current = self.rows.next();
        Ok(self.current.is_some())
    }

    fn scan_into(&mut self, slots: &mut [Slot]) -> Result<(), StoreError> {
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| StoreError::Scan("scan called without a current row".to_string()))?;
        if row.len() != slots.len() {
            return Err(slot_count_mismatch(row.len(), slots.len()));
        }
        for (idx, slot) in slots.iter_mut().enumerate() {
            slot.fill(decode(row, idx)?)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<(), StoreError> {
        Ok(())
    }
}
