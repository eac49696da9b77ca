//! Replay engine tests: pacing, application, reconnection

mod common;

use common::*;
use mysql_replay::event::{encode_event, Event, EventBody, ParamValue};
use mysql_replay::replay::{play_local, PlayOptions, ReplayWorker, VirtualClock};
use mysql_replay::stats;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_session(dir: &Path, session: u64, events: &[Event]) -> std::path::PathBuf {
    let first = events.first().map(|e| e.time).unwrap_or(0);
    let last = events.last().map(|e| e.time).unwrap_or(0);
    let mut content = String::new();
    for event in events {
        encode_event(event, &mut content);
        content.push('\n');
    }
    let path = dir.join(format!("{}.{}.{:016x}.tsv", first, last, session));
    std::fs::write(&path, content).unwrap();
    path
}

fn queries(n: usize, start_ts: i64) -> Vec<Event> {
    let mut events = vec![Event::new(
        start_ts,
        EventBody::Handshake { db: "db1".into() },
    )];
    for i in 1..=n {
        events.push(Event::new(
            start_ts + i as i64,
            EventBody::Query {
                sql: format!("SELECT {}", i),
            },
        ));
    }
    events
}

fn fast_options() -> PlayOptions {
    PlayOptions {
        speed: 0.0, // no pacing
        ..PlayOptions::default()
    }
}

fn target() -> mysql_replay::db::Dsn {
    "app:pw@tcp(staging:3306)/default".parse().unwrap()
}

#[tokio::test]
async fn test_transport_fault_keeps_statements_for_lazy_reprepare() {
    let dir = TempDir::new().unwrap();
    let events = vec![
        Event::new(0, EventBody::Handshake { db: String::new() }),
        Event::new(
            1,
            EventBody::StmtPrepare {
                id: 3,
                sql: "SELECT ?".into(),
            },
        ),
        Event::new(
            2,
            EventBody::StmtExecute {
                id: 3,
                params: vec![ParamValue::Int(1)],
            },
        ),
        Event::new(
            3,
            EventBody::StmtExecute {
                id: 3,
                params: vec![ParamValue::Int(2)],
            },
        ),
    ];
    write_session(dir.path(), 0xdef, &events);

    let driver = MockDriver::new();
    // First statement execution dies; the second must transparently
    // re-prepare from the remembered SQL.
    driver.0.fail_stmt_exec_at.lock().unwrap().insert(1);

    let mut options = fast_options();
    options.target_dsn = Some(target());
    play_local(
        options,
        Arc::new(driver.clone()),
        dir.path(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let prepares = driver.0.prepares.lock().unwrap();
    assert_eq!(*prepares, vec!["SELECT ?", "SELECT ?"]);

    let stmt_execs = driver.0.stmt_execs.lock().unwrap();
    assert_eq!(stmt_execs.len(), 2);
    assert_eq!(stmt_execs[1].1, vec![ParamValue::Int(2)]);
}

#[tokio::test]
async fn test_missing_statement_reported_and_replay_continues() {
    let dir = TempDir::new().unwrap();
    let events = vec![
        Event::new(0, EventBody::Handshake { db: String::new() }),
        Event::new(
            1,
            EventBody::StmtExecute {
                id: 42,
                params: vec![],
            },
        ),
        Event::new(
            2,
            EventBody::Query {
                sql: "SELECT after".into(),
            },
        ),
    ];
    write_session(dir.path(), 0x111, &events);

    let driver = MockDriver::new();
    let mut options = fast_options();
    options.target_dsn = Some(target());
    play_local(
        options,
        Arc::new(driver.clone()),
        dir.path(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(driver.0.stmt_execs.lock().unwrap().is_empty());
    assert_eq!(*driver.0.execs.lock().unwrap(), vec!["SELECT after"]);
}

#[tokio::test]
async fn test_decode_failure_stops_worker() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("0.10.0000000000000222.tsv");
    std::fs::write(&path, "0\thandshake\tdb1\nthis is not an event\n5\tquery\tSELECT x\n")
        .unwrap();

    let driver = MockDriver::new();
    let mut options = fast_options();
    options.target_dsn = Some(target());
    play_local(
        options,
        Arc::new(driver.clone()),
        dir.path(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // The handshake applied, then the bad line killed the worker before
    // the following query.
    assert_eq!(driver.0.opens.lock().unwrap().len(), 1);
    assert!(driver.0.execs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_touches_no_database() {
    let dir = TempDir::new().unwrap();
    write_session(dir.path(), 0x333, &queries(5, 0));

    let driver = MockDriver::new();
    let mut options = fast_options();
    options.dry_run = true;
    play_local(
        options,
        Arc::new(driver.clone()),
        dir.path(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(driver.0.opens.lock().unwrap().is_empty());
    assert!(driver.0.execs.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pacing_lower_bound() {
    // Three events 100ms apart at speed 2.0 must take at least ~100ms of
    // (virtual) wall time in total.
    let dir = TempDir::new().unwrap();
    let events = vec![
        Event::new(0, EventBody::Handshake { db: String::new() }),
        Event::new(
            100,
            EventBody::Query {
                sql: "SELECT 1".into(),
            },
        ),
        Event::new(
            200,
            EventBody::Query {
                sql: "SELECT 2".into(),
            },
        ),
    ];
    write_session(dir.path(), 0x444, &events);

    let options = PlayOptions {
        dry_run: true,
        speed: 2.0,
        ..PlayOptions::default()
    };
    let driver = MockDriver::new();
    let started = tokio::time::Instant::now();
    play_local(
        options,
        Arc::new(driver),
        dir.path(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    // 200ms of original spacing compressed by 2x.
    assert!(started.elapsed() >= Duration::from_millis(95));
}

#[tokio::test]
async fn test_worker_paces_against_shared_clock() {
    // A clock anchored in the past means everything is late: the worker
    // must record lagging for its session and clear it when done.
    let dir = TempDir::new().unwrap();
    let path = write_session(dir.path(), 0x555, &queries(2, 0));

    let clock = Arc::new(VirtualClock {
        play_start: mysql_replay::replay::now_ms() - 5_000,
        orig_start: 0,
        speed: 1.0,
    });
    let options = Arc::new(PlayOptions {
        dry_run: true,
        ..PlayOptions::default()
    });
    let worker = ReplayWorker::new(
        options,
        clock,
        Arc::new(MockDriver::new()),
        path,
        0x555,
    );
    worker.run(CancellationToken::new()).await.unwrap();
    // The lagging entry is zeroed on termination.
    assert_eq!(stats::get_lagging(), Duration::ZERO);
}
