//! Replay engine
//!
//! Reads session files produced by the capture pipeline and re-executes
//! them against a target database: one worker per captured session, all
//! paced by a shared virtual clock derived from the original capture
//! timestamps.

pub mod remote;
pub mod scheduler;
pub mod worker;

pub use scheduler::{discover_sessions, play_local, SessionFile};
pub use worker::ReplayWorker;

use crate::db::Dsn;
use std::time::Duration;

/// Wall-clock milliseconds since the epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Knobs shared by every worker of one replay run
#[derive(Debug, Clone)]
pub struct PlayOptions {
    /// Print events instead of applying them
    pub dry_run: bool,
    /// Speed ratio; `<= 0` disables pacing entirely
    pub speed: f64,
    /// Longest accepted session-file line in bytes (0 = unlimited)
    pub max_line_size: usize,
    /// Deadline for a single query/execute/prepare (zero = none)
    pub query_timeout: Duration,
    /// Target data source; `None` only makes sense with `dry_run`
    pub target_dsn: Option<Dsn>,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            speed: 1.0,
            max_line_size: 16 << 20,
            query_timeout: Duration::from_secs(60),
            target_dsn: None,
        }
    }
}

/// Maps original capture timestamps onto replay wall time
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    /// Wall time at replay begin (ms)
    pub play_start: i64,
    /// First event timestamp across all session files (ms)
    pub orig_start: i64,
    /// Speed ratio; `<= 0` disables pacing
    pub speed: f64,
}

impl VirtualClock {
    /// Start the clock now
    pub fn start(orig_start: i64, speed: f64) -> Self {
        Self {
            play_start: now_ms(),
            orig_start,
            speed,
        }
    }

    /// Scheduled wall time for an event captured at `t`
    pub fn scheduled_at(&self, t: i64) -> i64 {
        self.play_start + ((t - self.orig_start) as f64 / self.speed) as i64
    }

    /// Milliseconds until the event captured at `t` is due; negative means
    /// we are behind by that much
    pub fn wait_time(&self, t: i64) -> i64 {
        if self.speed <= 0.0 {
            return 0;
        }
        self.scheduled_at(t) - now_ms()
    }
}
