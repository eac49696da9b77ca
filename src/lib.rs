#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # mysql-replay
//!
//! Captures live MySQL client/server traffic from packet traces and
//! re-executes the observed client behavior against a target
//! MySQL-compatible database, preserving inter-event timing and
//! per-connection ordering. Useful for reproducing production workloads
//! against staging databases for regression and performance testing.
//!
//! ## Pipeline
//!
//! ```text
//! packet source -> per-direction reassembly -> protocol state machine
//!   -> event log files -> scheduler -> per-session workers -> target DB
//! ```
//!
//! Capture and replay are decoupled through line-oriented session files
//! named `<firstTs>.<lastTs>.<connHash>.tsv`, one file per captured
//! connection, one event per line.
//!
//! ## Capturing
//!
//! ```bash
//! $ mysql-replay dump --output ./sessions trace.pcap
//! ```
//!
//! ## Replaying
//!
//! ```bash
//! # At original speed against a staging database
//! $ mysql-replay play --target-dsn 'user:pass@tcp(staging:3306)/app' ./sessions
//!
//! # Twice as fast, printing events without touching a database
//! $ mysql-replay play --speed 2 --dry-run ./sessions
//!
//! # Distributed across agents
//! $ mysql-replay agent --listen 0.0.0.0:7077 --target-dsn '...'
//! $ mysql-replay play --agents http://agent-1:7077,http://agent-2:7077 ./sessions
//! ```
//!
//! ## Library layout
//!
//! - [`capture`]: packet sources, the TCP assembler, and session dumping
//! - [`stream`]: reassembly buffers, MySQL wire codecs, and the
//!   per-connection state machine
//! - [`event`]: the canonical event model and its text serialization
//! - [`replay`]: the virtual clock, per-session workers, the scheduler,
//!   and the remote-agent protocol
//! - [`db`]: database handle traits and the `mysql_async` driver
//! - [`stats`]: process-wide counters shared by both pipelines

pub mod capture;
pub mod cli;
pub mod db;
pub mod error;
pub mod event;
pub mod replay;
pub mod stats;
pub mod stream;

pub use error::{ReplayError, Result};
pub use event::{Event, EventBody, ParamValue};
pub use stream::ConnId;
