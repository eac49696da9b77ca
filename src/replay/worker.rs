//! Per-session replay worker
//!
//! Scans one session file, paces each event against the shared virtual
//! clock, and applies it to the target. Transport faults tear down the
//! connection but keep the statement table so handles can be re-prepared
//! lazily from their remembered SQL.

use crate::db::{DbConnection, DbDriver, DbError, DbErrorKind, DbPool, DbResult, DbStatement};
use crate::error::{ReplayError, Result};
use crate::event::{decode_event, Event, EventBody, ParamValue};
use crate::replay::{PlayOptions, VirtualClock};
use crate::stats;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Statement {
    sql: String,
    handle: Option<Box<dyn DbStatement>>,
}

/// Replays one captured session
pub struct ReplayWorker {
    options: Arc<PlayOptions>,
    clock: Arc<VirtualClock>,
    driver: Arc<dyn DbDriver>,
    source: PathBuf,
    /// Session key (the connection hash from the file name)
    session: u64,

    schema: String,
    pool: Option<Box<dyn DbPool>>,
    conn: Option<Box<dyn DbConnection>>,
    stmts: HashMap<u64, Statement>,
    /// Currently behind schedule; cleared once a pacing sleep happens again
    slow: bool,
}

impl ReplayWorker {
    pub fn new(
        options: Arc<PlayOptions>,
        clock: Arc<VirtualClock>,
        driver: Arc<dyn DbDriver>,
        source: PathBuf,
        session: u64,
    ) -> Self {
        Self {
            options,
            clock,
            driver,
            source,
            session,
            schema: String::new(),
            pool: None,
            conn: None,
            stmts: HashMap::new(),
            slow: false,
        }
    }

    /// Run to end of file or cancellation, then release everything
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let result = self.play(&cancel).await;
        self.teardown(false).await;
        stats::set_lagging(self.session, Duration::ZERO);
        result
    }

    async fn play(&mut self, cancel: &CancellationToken) -> Result<()> {
        let file = tokio::fs::File::open(&self.source).await?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(());
            }
            if self.options.max_line_size > 0 && line.len() > self.options.max_line_size {
                return Err(ReplayError::replay(format!(
                    "line longer than {} bytes in {}",
                    self.options.max_line_size,
                    self.source.display()
                )));
            }
            let trimmed = line.trim_end_matches(&['\n', '\r'][..]);
            if trimmed.is_empty() {
                continue;
            }
            let event = decode_event(trimmed)?;

            if !self.pace(event.time, cancel).await {
                debug!(session = self.session, "exit due to cancellation");
                return Ok(());
            }

            if self.options.dry_run {
                info!(session = self.session, "{}", event);
                continue;
            }
            self.apply(&event).await;
        }
    }

    /// Sleep until the event is due; returns false on cancellation
    async fn pace(&mut self, t: i64, cancel: &CancellationToken) -> bool {
        let wait = self.clock.wait_time(t);
        if wait > 0 {
            stats::add(stats::CONN_WAITING, 1);
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => false,
            };
            stats::add(stats::CONN_WAITING, -1);
            if cancelled {
                return false;
            }
            if self.slow {
                stats::set_lagging(self.session, Duration::ZERO);
                self.slow = false;
            }
        } else {
            if cancel.is_cancelled() {
                return false;
            }
            if wait < 0 {
                stats::set_lagging(self.session, Duration::from_millis((-wait) as u64));
                self.slow = true;
            }
        }
        true
    }

    async fn apply(&mut self, event: &Event) {
        let outcome = match &event.body {
            EventBody::Handshake { db } => {
                let db = db.clone();
                self.teardown(false).await;
                self.handshake(db).await
            }
            EventBody::Quit => {
                self.teardown(false).await;
                Ok(())
            }
            EventBody::Query { sql } => self.execute(sql).await,
            EventBody::StmtPrepare { id, sql } => self.stmt_prepare(*id, sql).await,
            EventBody::StmtExecute { id, params } => self.stmt_execute(*id, params).await,
            EventBody::StmtClose { id } => {
                self.stmt_close(*id).await;
                Ok(())
            }
        };

        if let Err(err) = outcome {
            if err.is_transport() {
                warn!(
                    session = self.session,
                    cause = %err,
                    "reconnect after {}", event
                );
                self.teardown(true).await;
                let schema = self.schema.clone();
                if let Err(err) = self.handshake(schema).await {
                    warn!(session = self.session, error = %err, "reconnect error");
                }
            } else {
                warn!(session = self.session, error = %err, "failed to apply {}", event);
            }
        }
    }

    async fn handshake(&mut self, schema: String) -> DbResult<()> {
        let Some(target) = self.options.target_dsn.as_ref() else {
            return Err(DbError::new(DbErrorKind::Other, "no target DSN configured"));
        };
        let pool = self.driver.open(&target.with_schema(&schema))?;
        self.pool = Some(pool);
        self.schema = schema;
        self.conn().await?;
        Ok(())
    }

    /// Drop all handles, the connection and the pool; `reconnect` keeps the
    /// statement table so SQL can be re-prepared lazily
    async fn teardown(&mut self, reconnect: bool) {
        for stmt in self.stmts.values_mut() {
            if let Some(handle) = stmt.handle.take() {
                let _ = handle.close().await;
            }
        }
        if !reconnect {
            self.stmts.clear();
        }
        if let Some(conn) = self.conn.take() {
            let _ = conn.close().await;
            stats::add(stats::CONNECTIONS, -1);
        }
        if let Some(pool) = self.pool.take() {
            let _ = pool.close().await;
        }
    }

    async fn conn(&mut self) -> DbResult<&dyn DbConnection> {
        if self.pool.is_none() {
            let Some(target) = self.options.target_dsn.as_ref() else {
                return Err(DbError::new(DbErrorKind::Other, "no target DSN configured"));
            };
            self.pool = Some(self.driver.open(&target.with_schema(&self.schema))?);
        }
        if self.conn.is_none() {
            let pool = match self.pool.as_deref() {
                Some(pool) => pool,
                None => return Err(DbError::new(DbErrorKind::InvalidConn, "pool missing")),
            };
            self.conn = Some(pool.conn().await?);
            stats::add(stats::CONNECTIONS, 1);
        }
        match self.conn.as_deref() {
            Some(conn) => Ok(conn),
            None => Err(DbError::new(DbErrorKind::InvalidConn, "connection missing")),
        }
    }

    async fn with_deadline<T>(
        timeout: Duration,
        fut: impl std::future::Future<Output = DbResult<T>>,
    ) -> DbResult<T> {
        if timeout.is_zero() {
            fut.await
        } else {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout()),
            }
        }
    }

    async fn execute(&mut self, sql: &str) -> DbResult<()> {
        let timeout = self.options.query_timeout;
        let conn = self.conn().await?;
        stats::add(stats::QUERIES, 1);
        stats::add(stats::CONN_RUNNING, 1);
        let result = Self::with_deadline(timeout, conn.exec(sql)).await;
        stats::add(stats::CONN_RUNNING, -1);
        if result.is_err() {
            stats::add(stats::FAILED_QUERIES, 1);
        }
        result
    }

    async fn stmt_prepare(&mut self, id: u64, sql: &str) -> DbResult<()> {
        if let Some(old) = self.stmts.remove(&id) {
            if let Some(handle) = old.handle {
                let _ = handle.close().await;
            }
        }
        let timeout = self.options.query_timeout;
        let conn = self.conn().await?;
        stats::add(stats::STMT_PREPARES, 1);
        let handle = match Self::with_deadline(timeout, conn.prepare(sql)).await {
            Ok(handle) => handle,
            Err(err) => {
                stats::add(stats::FAILED_STMT_PREPARES, 1);
                return Err(err);
            }
        };
        self.stmts.insert(
            id,
            Statement {
                sql: sql.to_string(),
                handle: Some(handle),
            },
        );
        Ok(())
    }

    async fn stmt_execute(&mut self, id: u64, params: &[ParamValue]) -> DbResult<()> {
        let timeout = self.options.query_timeout;
        if !self.stmts.contains_key(&id) {
            return Err(DbError::new(
                DbErrorKind::Other,
                format!("no such statement #{}", id),
            ));
        }
        // Re-prepare transparently when the handle was lost to a reconnect.
        if self.stmts.get(&id).map(|s| s.handle.is_none()) == Some(true) {
            let sql = self
                .stmts
                .get(&id)
                .map(|s| s.sql.clone())
                .unwrap_or_default();
            let conn = self.conn().await?;
            let handle = Self::with_deadline(timeout, conn.prepare(&sql)).await?;
            if let Some(stmt) = self.stmts.get_mut(&id) {
                stmt.handle = Some(handle);
            }
        }
        let Some(handle) = self.stmts.get(&id).and_then(|s| s.handle.as_deref()) else {
            return Err(DbError::new(DbErrorKind::InvalidConn, "statement handle missing"));
        };
        stats::add(stats::STMT_EXECUTES, 1);
        stats::add(stats::CONN_RUNNING, 1);
        let result = Self::with_deadline(timeout, handle.exec(params)).await;
        stats::add(stats::CONN_RUNNING, -1);
        if result.is_err() {
            stats::add(stats::FAILED_STMT_EXECUTES, 1);
        }
        result
    }

    async fn stmt_close(&mut self, id: u64) {
        if let Some(stmt) = self.stmts.remove(&id) {
            if let Some(handle) = stmt.handle {
                let _ = handle.close().await;
            }
        }
    }
}
