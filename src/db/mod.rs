//! Database handle abstraction
//!
//! The replay worker talks to the target through these traits so tests can
//! substitute a scripted driver and the worker can classify failures
//! without knowing the concrete client library. The bundled implementation
//! in [`mysql`] wraps `mysql_async`.

pub mod mysql;

pub use mysql::MySqlDriver;

use crate::event::ParamValue;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How a database call failed, as far as the worker cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// The connection was closed underneath us
    ConnClosed,
    /// The connection is unusable (driver-level invalid state)
    InvalidConn,
    /// The per-query deadline expired
    Timeout,
    /// Anything else: SQL errors, constraint violations, bad statements
    Other,
}

/// A classified database error
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(DbErrorKind::Timeout, "query deadline exceeded")
    }

    /// Transport faults invalidate the connection; the worker reconnects
    /// and lazily re-prepares statements
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind,
            DbErrorKind::ConnClosed | DbErrorKind::InvalidConn | DbErrorKind::Timeout
        )
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// A prepared statement bound to its connection
#[async_trait]
pub trait DbStatement: Send + Sync {
    async fn exec(&self, params: &[ParamValue]) -> DbResult<()>;
    async fn close(&self) -> DbResult<()>;
}

/// One connection checked out of a pool
#[async_trait]
pub trait DbConnection: Send + Sync {
    async fn exec(&self, sql: &str) -> DbResult<()>;
    async fn prepare(&self, sql: &str) -> DbResult<Box<dyn DbStatement>>;
    async fn close(&self) -> DbResult<()>;
}

/// A connection pool against one DSN
#[async_trait]
pub trait DbPool: Send + Sync {
    async fn conn(&self) -> DbResult<Box<dyn DbConnection>>;
    async fn close(&self) -> DbResult<()>;
}

/// Opens pools; the worker gets one per session handshake
pub trait DbDriver: Send + Sync {
    fn open(&self, dsn: &Dsn) -> DbResult<Box<dyn DbPool>>;
}

/// Parsed `user:pass@tcp(host:port)/schema?params` data source name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub schema: String,
    pub params: HashMap<String, String>,
}

impl Dsn {
    /// Copy with the schema replaced (empty `schema` keeps the default)
    pub fn with_schema(&self, schema: &str) -> Dsn {
        let mut out = self.clone();
        if !schema.is_empty() {
            out.schema = schema.to_string();
        }
        out
    }
}

impl FromStr for Dsn {
    type Err = crate::error::ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |msg: &str| crate::error::ReplayError::Dsn(msg.to_string());

        let (creds, rest) = s.rsplit_once('@').ok_or_else(|| bad("missing '@'"))?;
        let (user, password) = match creds.split_once(':') {
            Some((u, p)) => (u.to_string(), p.to_string()),
            None => (creds.to_string(), String::new()),
        };

        let rest = rest
            .strip_prefix("tcp(")
            .ok_or_else(|| bad("expected tcp(host:port)"))?;
        let (endpoint, rest) = rest
            .split_once(')')
            .ok_or_else(|| bad("unterminated tcp(...)"))?;
        let (host, port) = match endpoint.rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse().map_err(|_| bad("bad port number"))?,
            ),
            None => (endpoint.to_string(), 3306),
        };

        let rest = rest.strip_prefix('/').ok_or_else(|| bad("missing '/'"))?;
        let (schema, query) = match rest.split_once('?') {
            Some((schema, query)) => (schema.to_string(), Some(query)),
            None => (rest.to_string(), None),
        };

        let mut params = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => params.insert(k.to_string(), v.to_string()),
                    None => params.insert(pair.to_string(), String::new()),
                };
            }
        }

        Ok(Dsn {
            user,
            password,
            host,
            port,
            schema,
            params,
        })
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user)?;
        if !self.password.is_empty() {
            write!(f, ":{}", self.password)?;
        }
        write!(f, "@tcp({}:{})/{}", self.host, self.port, self.schema)?;
        if !self.params.is_empty() {
            let mut keys: Vec<_> = self.params.keys().collect();
            keys.sort();
            for (i, key) in keys.into_iter().enumerate() {
                write!(
                    f,
                    "{}{}={}",
                    if i == 0 { "?" } else { "&" },
                    key,
                    self.params[key]
                )?;
            }
        }
        Ok(())
    }
}
