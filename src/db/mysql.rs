//! mysql_async implementation of the database handle traits
//!
//! Statements hold a clone of the shared connection handle because
//! `mysql_async` executes prepared statements through the connection, not
//! the statement object.

use crate::db::{DbConnection, DbDriver, DbError, DbErrorKind, DbPool, DbResult, DbStatement, Dsn};
use crate::event::ParamValue;
use async_trait::async_trait;
use mysql_async::prelude::*;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Driver producing `mysql_async` pools
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDriver;

impl DbDriver for MySqlDriver {
    fn open(&self, dsn: &Dsn) -> DbResult<Box<dyn DbPool>> {
        let mut opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(dsn.host.clone())
            .tcp_port(dsn.port)
            .user(Some(dsn.user.clone()));
        if !dsn.password.is_empty() {
            opts = opts.pass(Some(dsn.password.clone()));
        }
        if !dsn.schema.is_empty() {
            opts = opts.db_name(Some(dsn.schema.clone()));
        }
        let pool = mysql_async::Pool::new(opts);
        Ok(Box::new(MySqlPool { pool }))
    }
}

struct MySqlPool {
    pool: mysql_async::Pool,
}

#[async_trait]
impl DbPool for MySqlPool {
    async fn conn(&self) -> DbResult<Box<dyn DbConnection>> {
        let conn = self.pool.get_conn().await.map_err(classify)?;
        Ok(Box::new(MySqlConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    async fn close(&self) -> DbResult<()> {
        self.pool.clone().disconnect().await.map_err(classify)
    }
}

struct MySqlConnection {
    conn: Arc<Mutex<mysql_async::Conn>>,
}

#[async_trait]
impl DbConnection for MySqlConnection {
    async fn exec(&self, sql: &str) -> DbResult<()> {
        let mut conn = self.conn.lock().await;
        conn.query_drop(sql).await.map_err(classify)
    }

    async fn prepare(&self, sql: &str) -> DbResult<Box<dyn DbStatement>> {
        let mut conn = self.conn.lock().await;
        let stmt = conn.prep(sql).await.map_err(classify)?;
        Ok(Box::new(MySqlStatement {
            conn: Arc::clone(&self.conn),
            stmt,
        }))
    }

    async fn close(&self) -> DbResult<()> {
        // The connection object returns to the pool on drop; nothing to
        // tear down eagerly.
        Ok(())
    }
}

struct MySqlStatement {
    conn: Arc<Mutex<mysql_async::Conn>>,
    stmt: mysql_async::Statement,
}

#[async_trait]
impl DbStatement for MySqlStatement {
    async fn exec(&self, params: &[ParamValue]) -> DbResult<()> {
        let bound: Vec<mysql_async::Value> = params.iter().map(to_sql_value).collect();
        let mut conn = self.conn.lock().await;
        conn.exec_drop(&self.stmt, bound).await.map_err(classify)
    }

    async fn close(&self) -> DbResult<()> {
        let mut conn = self.conn.lock().await;
        conn.close(self.stmt.clone()).await.map_err(classify)
    }
}

/// Convert a captured parameter to a driver value
fn to_sql_value(param: &ParamValue) -> mysql_async::Value {
    match param {
        ParamValue::Null => mysql_async::Value::NULL,
        ParamValue::Int(v) => mysql_async::Value::from(*v),
        ParamValue::Uint(v) => mysql_async::Value::from(*v),
        ParamValue::Double(v) => mysql_async::Value::from(*v),
        ParamValue::Decimal(v) => mysql_async::Value::from(v.as_str()),
        ParamValue::Time(v) => mysql_async::Value::from(v.as_str()),
        ParamValue::Bytes(v) => mysql_async::Value::from(v.clone()),
        ParamValue::Text(v) => mysql_async::Value::from(v.as_str()),
    }
}

/// Map driver errors onto the worker's fault classes
fn classify(err: mysql_async::Error) -> DbError {
    let kind = match &err {
        mysql_async::Error::Io(_) => DbErrorKind::ConnClosed,
        mysql_async::Error::Driver(_) => DbErrorKind::InvalidConn,
        _ => DbErrorKind::Other,
    };
    DbError::new(kind, err.to_string())
}
