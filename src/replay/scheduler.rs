//! Session discovery and local replay scheduling
//!
//! Session files are named `<firstTs>.<lastTs>.<hash>.tsv`. The scheduler
//! orders them by first timestamp, anchors the virtual clock at the
//! earliest one, and launches each worker when its session originally
//! began.

use crate::db::DbDriver;
use crate::error::{ReplayError, Result};
use crate::replay::{PlayOptions, ReplayWorker, VirtualClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One discovered session file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFile {
    pub path: PathBuf,
    /// Timestamp of the session's first event (ms)
    pub first_ts: i64,
    /// Connection hash parsed from the file name
    pub session: u64,
}

/// Parse `<firstTs>.<lastTs>.<hash>.tsv`
pub fn parse_session_name(name: &str) -> Option<(i64, u64)> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 || parts[3] != "tsv" {
        return None;
    }
    let first_ts = parts[0].parse().ok()?;
    let session = u64::from_str_radix(parts[2], 16).ok()?;
    Some((first_ts, session))
}

/// Enumerate session files in `dir`, ordered by first timestamp
pub fn discover_sessions(dir: impl AsRef<Path>) -> Result<Vec<SessionFile>> {
    let dir = dir.as_ref();
    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match parse_session_name(name) {
            Some((first_ts, session)) => sessions.push(SessionFile {
                path: entry.path(),
                first_ts,
                session,
            }),
            None => {
                if !name.starts_with('.') {
                    warn!(name, "skip input file");
                }
            }
        }
    }
    sessions.sort_by_key(|s| s.first_ts);
    Ok(sessions)
}

/// Replay every session in `input` against the target, in-process
pub async fn play_local(
    options: PlayOptions,
    driver: Arc<dyn DbDriver>,
    input: impl AsRef<Path>,
    cancel: CancellationToken,
) -> Result<()> {
    if !options.dry_run && options.target_dsn.is_none() {
        return Err(ReplayError::replay("target DSN required unless dry-run"));
    }
    let sessions = discover_sessions(input)?;
    let Some(first) = sessions.first() else {
        info!("no session files found");
        return Ok(());
    };
    let clock = Arc::new(VirtualClock::start(first.first_ts, options.speed));
    let options = Arc::new(options);
    info!(sessions = sessions.len(), "starting replay");

    let mut tasks = JoinSet::new();
    for session in sessions {
        let wait = clock.wait_time(session.first_ts);
        if wait > 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
            }
        } else if cancel.is_cancelled() {
            break;
        }
        let worker = ReplayWorker::new(
            Arc::clone(&options),
            Arc::clone(&clock),
            Arc::clone(&driver),
            session.path.clone(),
            session.session,
        );
        let cancel = cancel.clone();
        let path = session.path;
        tasks.spawn(async move {
            if let Err(err) = worker.run(cancel).await {
                warn!(file = %path.display(), error = %err, "session replay failed");
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "worker task panicked");
        }
    }
    Ok(())
}
