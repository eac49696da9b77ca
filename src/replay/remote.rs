//! Remote replay: distribute sessions across agents over HTTP
//!
//! A submitting scheduler POSTs each session file to an agent under a
//! per-run job name and polls every agent for aggregate progress. The
//! agent side is a small axum server that stores uploads and runs the
//! local worker for each.

use crate::db::DbDriver;
use crate::error::{ReplayError, Result};
use crate::replay::scheduler::discover_sessions;
use crate::replay::{now_ms, PlayOptions, ReplayWorker, VirtualClock};
use crate::stats;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const HEADER_SESSION: &str = "x-replay-session";
const HEADER_FIRST_TS: &str = "x-replay-first-ts";
const HEADER_ORIG_START: &str = "x-replay-orig-start";
const HEADER_SPEED: &str = "x-replay-speed";

/// Progress snapshot returned by `GET /<job>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub total: usize,
    pub finished: usize,
    /// Seconds the slowest session is behind schedule
    pub lagging: f64,
    pub stats: HashMap<String, i64>,
}

/// Replay every session in `input` by distributing workers round-robin
/// over `agents`, then poll until all of them finish
pub async fn play_remote(
    options: PlayOptions,
    input: impl AsRef<Path>,
    agents: &[String],
    cancel: CancellationToken,
) -> Result<()> {
    if agents.is_empty() {
        return Err(ReplayError::Remote("no agents given".to_string()));
    }
    let sessions = discover_sessions(input)?;
    let Some(first) = sessions.first() else {
        info!("no session files found");
        return Ok(());
    };
    let clock = VirtualClock::start(first.first_ts, options.speed);
    let job = format!("job-{}-{}", clock.play_start, rand::random::<u64>());
    let client = reqwest::Client::new();
    info!(job = %job, agents = agents.len(), sessions = sessions.len(), "starting remote replay");

    let submitted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let submitter = {
        let client = client.clone();
        let job = job.clone();
        let agents = agents.to_vec();
        let submitted = Arc::clone(&submitted);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            for (i, session) in sessions.into_iter().enumerate() {
                let wait = clock.wait_time(session.first_ts);
                if wait > 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
                    }
                }
                let agent = &agents[i % agents.len()];
                let url = format!("{}/{}", agent, job);
                let body = match tokio::fs::read(&session.path).await {
                    Ok(body) => body,
                    Err(err) => {
                        error!(file = %session.path.display(), error = %err, "open session file");
                        continue;
                    }
                };
                info!(url = %url, file = %session.path.display(), "submit task");
                let response = client
                    .post(&url)
                    .header(HEADER_SESSION, format!("{:016x}", session.session))
                    .header(HEADER_FIRST_TS, session.first_ts)
                    .header(HEADER_ORIG_START, clock.orig_start)
                    .header(HEADER_SPEED, clock.speed.to_string())
                    .body(body)
                    .send()
                    .await;
                match response {
                    Ok(response) if !response.status().is_success() => {
                        error!(url = %url, status = %response.status(), "unexpected response");
                    }
                    Ok(_) => {}
                    Err(err) => error!(url = %url, error = %err, "send remote request"),
                }
            }
            submitted.store(true, Ordering::SeqCst);
        })
    };

    // Poll agents until every submitted worker reports finished.
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let mut total = 0usize;
        let mut finished = 0usize;
        let mut lagging = 0f64;
        let mut counters: HashMap<String, i64> = HashMap::new();
        for agent in agents {
            let url = format!("{}/{}", agent, job);
            let status: JobStatus = match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json().await {
                        Ok(status) => status,
                        Err(err) => {
                            error!(agent = %agent, error = %err, "decode response");
                            continue;
                        }
                    }
                }
                Ok(response) => {
                    error!(agent = %agent, status = %response.status(), "unexpected response");
                    continue;
                }
                Err(err) => {
                    error!(agent = %agent, error = %err, "query job status");
                    continue;
                }
            };
            total += status.total;
            finished += status.finished;
            if status.lagging > lagging {
                lagging = status.lagging;
            }
            for name in stats::REPLAY_REPORT_NAMES {
                *counters.entry((*name).to_string()).or_insert(0) +=
                    status.stats.get(*name).copied().unwrap_or(0);
            }
        }
        stats::set_lagging(0, Duration::from_secs_f64(lagging.max(0.0)));
        for name in stats::REPLAY_REPORT_NAMES {
            let aggregate = counters.get(*name).copied().unwrap_or(0);
            stats::add(name, aggregate - stats::get(name));
        }
        if submitted.load(Ordering::SeqCst) && total == finished {
            break;
        }
    }
    stats::set_lagging(0, Duration::ZERO);
    submitter.abort();
    Ok(())
}

struct Job {
    total: AtomicUsize,
    finished: AtomicUsize,
}

/// Shared state of one agent process
pub struct AgentState {
    options: PlayOptions,
    driver: Arc<dyn DbDriver>,
    data_dir: PathBuf,
    jobs: DashMap<String, Arc<Job>>,
    cancel: CancellationToken,
    upload_seq: AtomicUsize,
}

/// Build the agent router serving the remote protocol
pub fn agent_router(
    options: PlayOptions,
    driver: Arc<dyn DbDriver>,
    data_dir: PathBuf,
    cancel: CancellationToken,
) -> Router {
    let state = Arc::new(AgentState {
        options,
        driver,
        data_dir,
        jobs: DashMap::new(),
        cancel,
        upload_seq: AtomicUsize::new(0),
    });
    Router::new()
        .route("/:job", get(job_status).post(job_submit))
        .with_state(state)
}

/// Serve the agent until cancelled
pub async fn run_agent(
    listen: std::net::SocketAddr,
    options: PlayOptions,
    driver: Arc<dyn DbDriver>,
    data_dir: PathBuf,
    cancel: CancellationToken,
) -> Result<()> {
    std::fs::create_dir_all(&data_dir)?;
    let router = agent_router(options, driver, data_dir, cancel.clone());
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen = %listen, "agent listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ReplayError::Remote(e.to_string()))
}

async fn job_status(
    State(state): State<Arc<AgentState>>,
    UrlPath(job): UrlPath<String>,
) -> Json<JobStatus> {
    let (total, finished) = state
        .jobs
        .get(&job)
        .map(|job| {
            (
                job.total.load(Ordering::SeqCst),
                job.finished.load(Ordering::SeqCst),
            )
        })
        .unwrap_or((0, 0));
    Json(JobStatus {
        total,
        finished,
        lagging: stats::get_lagging().as_secs_f64(),
        stats: stats::dump(),
    })
}

async fn job_submit(
    State(state): State<Arc<AgentState>>,
    UrlPath(job): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, (StatusCode, String)> {
    let session = header_value(&headers, HEADER_SESSION)
        .and_then(|v| u64::from_str_radix(v, 16).ok())
        .unwrap_or(0);
    let orig_start = header_value(&headers, HEADER_ORIG_START)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0i64);
    let first_ts = header_value(&headers, HEADER_FIRST_TS)
        .and_then(|v| v.parse().ok())
        .unwrap_or(orig_start);
    let speed = header_value(&headers, HEADER_SPEED)
        .and_then(|v| v.parse().ok())
        .unwrap_or(state.options.speed);

    let seq = state.upload_seq.fetch_add(1, Ordering::Relaxed);
    let path = state
        .data_dir
        .join(format!("{}.{:016x}.{}.upload", job, session, seq));
    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let entry = state
        .jobs
        .entry(job.clone())
        .or_insert_with(|| {
            Arc::new(Job {
                total: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        })
        .clone();
    entry.total.fetch_add(1, Ordering::SeqCst);

    // The submitter holds events until their original start time, so the
    // worker clock is re-anchored here: this session's first event is due
    // now, and everything after it keeps the original spacing.
    let clock = Arc::new(VirtualClock {
        play_start: now_ms() - if speed > 0.0 {
            ((first_ts - orig_start) as f64 / speed) as i64
        } else {
            0
        },
        orig_start,
        speed,
    });
    let worker = ReplayWorker::new(
        Arc::new(state.options.clone()),
        clock,
        Arc::clone(&state.driver),
        path.clone(),
        session,
    );
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = worker.run(cancel).await {
            warn!(job = %job, file = %path.display(), error = %err, "remote session failed");
        }
        let _ = tokio::fs::remove_file(&path).await;
        entry.finished.fetch_add(1, Ordering::SeqCst);
    });

    Ok(StatusCode::OK)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_serialization() {
        let status = JobStatus {
            total: 4,
            finished: 2,
            lagging: 1.5,
            stats: HashMap::from([("queries".to_string(), 10)]),
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total, 4);
        assert_eq!(back.finished, 2);
        assert_eq!(back.stats.get("queries"), Some(&10));
    }
}
