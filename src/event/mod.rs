//! Canonical event log records
//!
//! An [`Event`] is one observed client intent: a handshake, a query, a
//! prepared-statement operation, or a session quit. Events are produced by
//! the capture state machine and consumed by the replay worker; the
//! line-oriented text serialization lives in [`text`].

mod text;

pub use text::{decode_event, encode_event};

use std::fmt;

/// One captured client intent, timestamped in milliseconds since the
/// capture epoch
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Capture timestamp of the frame that completed this event (ms)
    pub time: i64,
    /// What the client did
    pub body: EventBody,
}

impl Event {
    pub fn new(time: i64, body: EventBody) -> Self {
        Self { time, body }
    }
}

/// The event payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// Session established; `db` is the schema from the handshake response
    /// (may be empty)
    Handshake { db: String },
    /// Session ended by COM_QUIT
    Quit,
    /// COM_QUERY
    Query { sql: String },
    /// COM_STMT_PREPARE confirmed by the server
    StmtPrepare { id: u64, sql: String },
    /// COM_STMT_EXECUTE with decoded parameters
    StmtExecute { id: u64, params: Vec<ParamValue> },
    /// COM_STMT_CLOSE
    StmtClose { id: u64 },
}

/// A decoded statement parameter, tagged with its MySQL value class so the
/// replay driver can bind it back with the right type
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Int(i64),
    Uint(u64),
    Double(f64),
    /// DECIMAL/NEWDECIMAL, kept as the decimal string off the wire
    Decimal(String),
    /// DATE/DATETIME/TIMESTAMP/TIME rendered as text
    Time(String),
    /// Binary payloads (BLOB family, long data)
    Bytes(Vec<u8>),
    /// Text payloads (VARCHAR/STRING/JSON)
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "NULL"),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Uint(v) => write!(f, "{}", v),
            ParamValue::Double(v) => write!(f, "{}", v),
            ParamValue::Decimal(v) => write!(f, "{}", v),
            ParamValue::Time(v) => write!(f, "'{}'", v),
            ParamValue::Bytes(v) => write!(f, "0x{}", hex(v)),
            ParamValue::Text(v) => write!(f, "'{}'", v),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use fmt::Write;
        let _ = write!(out, "{:02x}", b);
    }
    out
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            EventBody::Handshake { db } => write!(f, "[{}] handshake db={:?}", self.time, db),
            EventBody::Quit => write!(f, "[{}] quit", self.time),
            EventBody::Query { sql } => write!(f, "[{}] query {:?}", self.time, sql),
            EventBody::StmtPrepare { id, sql } => {
                write!(f, "[{}] stmt-prepare #{} {:?}", self.time, id, sql)
            }
            EventBody::StmtExecute { id, params } => {
                write!(f, "[{}] stmt-execute #{} (", self.time, id)?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
            EventBody::StmtClose { id } => write!(f, "[{}] stmt-close #{}", self.time, id),
        }
    }
}
