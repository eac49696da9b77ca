//! Shared fixtures for mysql-replay integration tests
//!
//! Provides a scripted database driver for replay tests and TCP/MySQL
//! packet builders that drive the capture pipeline the way a real trace
//! would.

#![allow(dead_code)]

use async_trait::async_trait;
use mysql_replay::capture::{Assembler, CaptureInfo, FlowKey, TcpSegment};
use mysql_replay::db::{
    DbConnection, DbDriver, DbError, DbErrorKind, DbPool, DbResult, DbStatement, Dsn,
};
use mysql_replay::event::{Event, ParamValue};
use mysql_replay::stream::state::EventHandler;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Event collection
// ============================================================================

/// Event sink that collects into a shared vector
pub struct CollectingSink {
    pub events: Arc<Mutex<Vec<Event>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl CollectingSink {
    pub fn pair() -> (Self, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
                closed: Arc::new(Mutex::new(false)),
            },
            events,
        )
    }
}

impl EventHandler for CollectingSink {
    fn on_event(&mut self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
    fn on_close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }
}

// ============================================================================
// Wire and trace builders
// ============================================================================

/// Frame a MySQL packet: 3-byte LE length, sequence, payload
pub fn mysql_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![
        (payload.len() & 0xff) as u8,
        ((payload.len() >> 8) & 0xff) as u8,
        ((payload.len() >> 16) & 0xff) as u8,
        seq,
    ];
    out.extend_from_slice(payload);
    out
}

/// A seven-byte OK packet
pub fn ok_packet() -> Vec<u8> {
    vec![0x00, 0, 0, 0, 0, 0, 0]
}

/// Minimal protocol-10 server greeting
pub fn greeting() -> Vec<u8> {
    let mut out = vec![0x0a];
    out.extend_from_slice(b"8.0.36\0");
    out.extend_from_slice(&[0u8; 44]);
    out
}

/// Client handshake response with optional schema
pub fn handshake_response(db: &str) -> Vec<u8> {
    const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    let mut caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION;
    if !db.is_empty() {
        caps |= CLIENT_CONNECT_WITH_DB;
    }
    let mut out = Vec::new();
    out.extend_from_slice(&caps.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.push(0x21);
    out.extend_from_slice(&[0u8; 23]);
    out.extend_from_slice(b"app\0");
    out.push(0);
    if !db.is_empty() {
        out.extend_from_slice(db.as_bytes());
        out.push(0);
    }
    out
}

/// COM_STMT_PREPARE_OK header for `stmt_id` with `params` parameters
pub fn prepare_ok(stmt_id: u32, params: u16) -> Vec<u8> {
    let mut out = vec![0x00];
    out.extend_from_slice(&stmt_id.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&params.to_le_bytes());
    out.push(0);
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

pub fn eof_packet() -> Vec<u8> {
    vec![0xfe, 0, 0, 0, 0]
}

/// Drives an [`Assembler`] like a live two-way capture would
pub struct TraceFeeder {
    pub assembler: Assembler,
    client: SocketAddr,
    server: SocketAddr,
    client_seq: u32,
    server_seq: u32,
    ts: i64,
}

impl TraceFeeder {
    pub fn new(assembler: Assembler) -> Self {
        let mut feeder = Self {
            assembler,
            client: "10.1.0.1:51234".parse().unwrap(),
            server: "10.1.0.2:3306".parse().unwrap(),
            client_seq: 1,
            server_seq: 1,
            ts: 1_700_000_000_000,
        };
        feeder.syn();
        feeder
    }

    /// A feeder that never saw the TCP handshake
    pub fn without_syn(assembler: Assembler) -> Self {
        Self {
            assembler,
            client: "10.1.0.1:51234".parse().unwrap(),
            server: "10.1.0.2:3306".parse().unwrap(),
            client_seq: 1,
            server_seq: 1,
            ts: 1_700_000_000_000,
        }
    }

    fn client_flow(&self) -> FlowKey {
        FlowKey {
            src: self.client,
            dst: self.server,
        }
    }

    fn server_flow(&self) -> FlowKey {
        FlowKey {
            src: self.server,
            dst: self.client,
        }
    }

    fn segment(seq: u32, payload: &[u8]) -> TcpSegment {
        TcpSegment {
            seq,
            syn: false,
            ack: true,
            fin: false,
            rst: false,
            payload: payload.to_vec(),
        }
    }

    pub fn syn(&mut self) {
        self.ts += 1;
        let mut syn = Self::segment(0, &[]);
        syn.syn = true;
        syn.ack = false;
        self.assembler
            .assemble(self.client_flow(), &syn, CaptureInfo { ts: self.ts });
        let mut syn_ack = Self::segment(0, &[]);
        syn_ack.syn = true;
        self.assembler
            .assemble(self.server_flow(), &syn_ack, CaptureInfo { ts: self.ts });
    }

    /// Send one MySQL packet from the client
    pub fn client_packet(&mut self, wire_seq: u8, payload: &[u8]) {
        let bytes = mysql_packet(wire_seq, payload);
        self.client_raw(&bytes);
    }

    /// Send one MySQL packet from the server
    pub fn server_packet(&mut self, wire_seq: u8, payload: &[u8]) {
        let bytes = mysql_packet(wire_seq, payload);
        self.ts += 1;
        let segment = Self::segment(self.server_seq, &bytes);
        self.assembler
            .assemble(self.server_flow(), &segment, CaptureInfo { ts: self.ts });
        self.server_seq += bytes.len() as u32;
    }

    /// Send raw client bytes as one TCP segment
    pub fn client_raw(&mut self, bytes: &[u8]) {
        self.ts += 1;
        let segment = Self::segment(self.client_seq, bytes);
        self.assembler
            .assemble(self.client_flow(), &segment, CaptureInfo { ts: self.ts });
        self.client_seq += bytes.len() as u32;
    }

    /// Send raw client bytes split into `pieces` TCP segments delivered in
    /// `order` (indices into the split)
    pub fn client_raw_reordered(&mut self, bytes: &[u8], pieces: usize, order: &[usize]) {
        let chunk = bytes.len().div_ceil(pieces);
        let chunks: Vec<(u32, &[u8])> = bytes
            .chunks(chunk)
            .enumerate()
            .map(|(i, c)| (self.client_seq + (i * chunk) as u32, c))
            .collect();
        for &index in order {
            self.ts += 1;
            let (seq, data) = chunks[index];
            let segment = Self::segment(seq, data);
            self.assembler
                .assemble(self.client_flow(), &segment, CaptureInfo { ts: self.ts });
        }
        self.client_seq += bytes.len() as u32;
    }

    /// Close both directions
    pub fn fin(&mut self) {
        self.ts += 1;
        let mut fin = Self::segment(self.client_seq, &[]);
        fin.fin = true;
        self.assembler
            .assemble(self.client_flow(), &fin, CaptureInfo { ts: self.ts });
        let mut fin = Self::segment(self.server_seq, &[]);
        fin.fin = true;
        self.assembler
            .assemble(self.server_flow(), &fin, CaptureInfo { ts: self.ts });
    }
}

// ============================================================================
// Scripted database driver
// ============================================================================

#[derive(Default)]
pub struct MockState {
    /// DSNs passed to `open`, in order
    pub opens: Mutex<Vec<Dsn>>,
    /// SQL passed to plain `exec`, in order
    pub execs: Mutex<Vec<String>>,
    /// SQL passed to `prepare`, in order
    pub prepares: Mutex<Vec<String>>,
    /// Prepared-statement executions `(sql, params)`, in order
    pub stmt_execs: Mutex<Vec<(String, Vec<ParamValue>)>>,
    /// 1-based `exec` call indices that fail with a transport fault
    pub fail_exec_at: Mutex<HashSet<usize>>,
    /// 1-based `stmt exec` call indices that fail with a transport fault
    pub fail_stmt_exec_at: Mutex<HashSet<usize>>,
    exec_calls: AtomicUsize,
    stmt_exec_calls: AtomicUsize,
}

/// Database driver whose behavior is scripted through [`MockState`]
#[derive(Clone)]
pub struct MockDriver(pub Arc<MockState>);

impl MockDriver {
    pub fn new() -> Self {
        Self(Arc::new(MockState::default()))
    }
}

impl DbDriver for MockDriver {
    fn open(&self, dsn: &Dsn) -> DbResult<Box<dyn DbPool>> {
        self.0.opens.lock().unwrap().push(dsn.clone());
        Ok(Box::new(MockPool(self.0.clone())))
    }
}

struct MockPool(Arc<MockState>);

#[async_trait]
impl DbPool for MockPool {
    async fn conn(&self) -> DbResult<Box<dyn DbConnection>> {
        Ok(Box::new(MockConnection(self.0.clone())))
    }
    async fn close(&self) -> DbResult<()> {
        Ok(())
    }
}

struct MockConnection(Arc<MockState>);

#[async_trait]
impl DbConnection for MockConnection {
    async fn exec(&self, sql: &str) -> DbResult<()> {
        let call = self.0.exec_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.execs.lock().unwrap().push(sql.to_string());
        if self.0.fail_exec_at.lock().unwrap().contains(&call) {
            return Err(DbError::new(DbErrorKind::ConnClosed, "connection closed"));
        }
        Ok(())
    }

    async fn prepare(&self, sql: &str) -> DbResult<Box<dyn DbStatement>> {
        self.0.prepares.lock().unwrap().push(sql.to_string());
        Ok(Box::new(MockStatement {
            sql: sql.to_string(),
            state: self.0.clone(),
        }))
    }

    async fn close(&self) -> DbResult<()> {
        Ok(())
    }
}

struct MockStatement {
    sql: String,
    state: Arc<MockState>,
}

#[async_trait]
impl DbStatement for MockStatement {
    async fn exec(&self, params: &[ParamValue]) -> DbResult<()> {
        let call = self.state.stmt_exec_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .stmt_execs
            .lock()
            .unwrap()
            .push((self.sql.clone(), params.to_vec()));
        if self.state.fail_stmt_exec_at.lock().unwrap().contains(&call) {
            return Err(DbError::new(DbErrorKind::ConnClosed, "connection closed"));
        }
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        Ok(())
    }
}
