//! Process-wide counters shared by the capture and replay pipelines
//!
//! A fixed set of well-known counter names is backed by plain atomics so the
//! hot paths (per-packet, per-query) never take a lock. Counters outside the
//! fixed set fall back to a write-locked map. Per-session lagging durations
//! live in a concurrent map; the global lagging metric is the maximum across
//! all sessions.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

pub const PACKETS: &str = "packets";
pub const QUERIES: &str = "queries";
pub const STREAMS: &str = "streams";
pub const CONNECTIONS: &str = "connections";
pub const CONN_WAITING: &str = "conn.waiting";
pub const CONN_RUNNING: &str = "conn.running";
pub const STMT_EXECUTES: &str = "stmt.executes";
pub const STMT_PREPARES: &str = "stmt.prepares";
pub const DATA_IN: &str = "data.in";
pub const DATA_OUT: &str = "data.out";

pub const FAILED_QUERIES: &str = "err.queries";
pub const FAILED_STMT_EXECUTES: &str = "err.stmt.executes";
pub const FAILED_STMT_PREPARES: &str = "err.stmt.prepares";

/// Counter names reported by the periodic replay stats log
pub const REPLAY_REPORT_NAMES: &[&str] = &[
    CONNECTIONS,
    CONN_RUNNING,
    CONN_WAITING,
    QUERIES,
    STMT_EXECUTES,
    STMT_PREPARES,
    FAILED_QUERIES,
    FAILED_STMT_EXECUTES,
    FAILED_STMT_PREPARES,
];

const FIXED_NAMES: &[&str] = &[
    PACKETS,
    QUERIES,
    STMT_EXECUTES,
    STMT_PREPARES,
    STREAMS,
    CONNECTIONS,
    DATA_IN,
    DATA_OUT,
    FAILED_QUERIES,
    FAILED_STMT_EXECUTES,
    FAILED_STMT_PREPARES,
    CONN_WAITING,
    CONN_RUNNING,
];

#[derive(Default)]
struct Registry {
    packets: AtomicI64,
    queries: AtomicI64,
    streams: AtomicI64,
    connections: AtomicI64,
    conn_waiting: AtomicI64,
    conn_running: AtomicI64,
    stmt_executes: AtomicI64,
    stmt_prepares: AtomicI64,
    data_in: AtomicI64,
    data_out: AtomicI64,
    err_queries: AtomicI64,
    err_stmt_executes: AtomicI64,
    err_stmt_prepares: AtomicI64,

    others: RwLock<HashMap<String, i64>>,
    laggings: DashMap<u64, Duration>,
}

impl Registry {
    fn fixed(&self, name: &str) -> Option<&AtomicI64> {
        match name {
            PACKETS => Some(&self.packets),
            DATA_IN => Some(&self.data_in),
            DATA_OUT => Some(&self.data_out),
            CONN_RUNNING => Some(&self.conn_running),
            CONN_WAITING => Some(&self.conn_waiting),
            QUERIES => Some(&self.queries),
            STMT_EXECUTES => Some(&self.stmt_executes),
            STMT_PREPARES => Some(&self.stmt_prepares),
            STREAMS => Some(&self.streams),
            CONNECTIONS => Some(&self.connections),
            FAILED_QUERIES => Some(&self.err_queries),
            FAILED_STMT_EXECUTES => Some(&self.err_stmt_executes),
            FAILED_STMT_PREPARES => Some(&self.err_stmt_prepares),
            _ => None,
        }
    }
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::default)
}

/// Add `delta` to the named counter, returning the new value
pub fn add(name: &str, delta: i64) -> i64 {
    let reg = registry();
    if let Some(counter) = reg.fixed(name) {
        counter.fetch_add(delta, Ordering::Relaxed) + delta
    } else {
        let mut others = reg.others.write();
        let entry = others.entry(name.to_string()).or_insert(0);
        *entry += delta;
        *entry
    }
}

/// Read the named counter
pub fn get(name: &str) -> i64 {
    let reg = registry();
    if let Some(counter) = reg.fixed(name) {
        counter.load(Ordering::Relaxed)
    } else {
        reg.others.read().get(name).copied().unwrap_or(0)
    }
}

/// Snapshot all counters, fixed and overflow
pub fn dump() -> HashMap<String, i64> {
    let reg = registry();
    let others = reg.others.read();
    let mut out = HashMap::with_capacity(FIXED_NAMES.len() + others.len());
    for name in FIXED_NAMES {
        out.insert((*name).to_string(), get(name));
    }
    for (name, value) in others.iter() {
        out.insert(name.clone(), *value);
    }
    out
}

/// Record how far behind schedule a session is; zero or negative clears it
pub fn set_lagging(session: u64, lag: Duration) {
    let reg = registry();
    if lag.is_zero() {
        reg.laggings.remove(&session);
    } else {
        reg.laggings.insert(session, lag);
    }
}

/// Maximum lagging across all sessions
pub fn get_lagging() -> Duration {
    registry()
        .laggings
        .iter()
        .map(|entry| *entry.value())
        .max()
        .unwrap_or_default()
}
