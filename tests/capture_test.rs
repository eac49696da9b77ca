//! End-to-end capture pipeline tests: TCP segments in, events out

mod common;

use common::*;
use mysql_replay::capture::Assembler;
use mysql_replay::event::{decode_event, EventBody, ParamValue};
use mysql_replay::stream::state::EventHandler;
use mysql_replay::stream::FactoryOptions;
use std::sync::{Arc, Mutex};
use mysql_replay::event::Event;

fn collecting_assembler(force_start: bool) -> (Assembler, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let shared = events.clone();
    let assembler = Assembler::new(
        FactoryOptions {
            synchronized: false,
            force_start,
        },
        Box::new(move |_| {
            Some(Box::new(CollectingSink {
                events: shared.clone(),
                closed: Arc::new(Mutex::new(false)),
            }) as Box<dyn EventHandler>)
        }),
    );
    (assembler, events)
}

fn run_handshake(feeder: &mut TraceFeeder, db: &str) {
    feeder.server_packet(0, &greeting());
    feeder.client_packet(1, &handshake_response(db));
    feeder.server_packet(2, &ok_packet());
}

#[test]
fn test_single_query_session() {
    let (assembler, events) = collecting_assembler(false);
    let mut feeder = TraceFeeder::new(assembler);

    run_handshake(&mut feeder, "db1");
    feeder.client_packet(0, b"\x03SELECT 1");
    feeder.server_packet(1, &ok_packet());
    feeder.client_packet(0, &[0x01]); // COM_QUIT
    feeder.fin();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].body, EventBody::Handshake { db: "db1".into() });
    assert_eq!(
        events[1].body,
        EventBody::Query {
            sql: "SELECT 1".into()
        }
    );
    assert_eq!(events[2].body, EventBody::Quit);
    assert!(
        events.windows(2).all(|w| w[0].time <= w[1].time),
        "timestamps must be non-decreasing"
    );
}

#[test]
fn test_prepare_execute_roundtrip() {
    let (assembler, events) = collecting_assembler(false);
    let mut feeder = TraceFeeder::new(assembler);

    run_handshake(&mut feeder, "");
    let mut prepare = vec![0x16];
    prepare.extend_from_slice(b"SELECT ?");
    feeder.client_packet(0, &prepare);
    feeder.server_packet(1, &prepare_ok(7, 1));
    feeder.server_packet(2, &[0x03, b'd', b'e', b'f', 0, 0, 0, 0, 0, 0]);
    feeder.server_packet(3, &eof_packet());

    let mut exec = vec![0x17];
    exec.extend_from_slice(&7u32.to_le_bytes());
    exec.push(0);
    exec.extend_from_slice(&1u32.to_le_bytes());
    exec.push(0x00); // null bitmap
    exec.push(1); // new params bound
    exec.push(0x08); // longlong
    exec.push(0x00);
    exec.extend_from_slice(&42i64.to_le_bytes());
    feeder.client_packet(0, &exec);
    feeder.server_packet(1, &ok_packet());
    feeder.fin();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[1].body,
        EventBody::StmtPrepare {
            id: 7,
            sql: "SELECT ?".into()
        }
    );
    assert_eq!(
        events[2].body,
        EventBody::StmtExecute {
            id: 7,
            params: vec![ParamValue::Int(42)]
        }
    );
}

#[test]
fn test_long_data_splice() {
    let (assembler, events) = collecting_assembler(false);
    let mut feeder = TraceFeeder::new(assembler);

    run_handshake(&mut feeder, "");
    let mut prepare = vec![0x16];
    prepare.extend_from_slice(b"INSERT INTO t VALUES (?)");
    feeder.client_packet(0, &prepare);
    feeder.server_packet(1, &prepare_ok(9, 1));
    feeder.server_packet(2, &[0x03, b'd', b'e', b'f', 0, 0, 0, 0, 0, 0]);
    feeder.server_packet(3, &eof_packet());

    for chunk in [b"hel".as_slice(), b"lo".as_slice()] {
        let mut long = vec![0x18];
        long.extend_from_slice(&9u32.to_le_bytes());
        long.extend_from_slice(&0u16.to_le_bytes());
        long.extend_from_slice(chunk);
        feeder.client_packet(0, &long);
    }

    let mut exec = vec![0x17];
    exec.extend_from_slice(&9u32.to_le_bytes());
    exec.push(0);
    exec.extend_from_slice(&1u32.to_le_bytes());
    exec.push(0x01); // value suppressed via null bit
    exec.push(1);
    exec.push(0xfc); // blob
    exec.push(0x00);
    feeder.client_packet(0, &exec);
    feeder.server_packet(1, &ok_packet());
    feeder.fin();

    let events = events.lock().unwrap();
    let last = events.last().unwrap();
    assert_eq!(
        last.body,
        EventBody::StmtExecute {
            id: 9,
            params: vec![ParamValue::Bytes(b"hello".to_vec())]
        }
    );
}

#[test]
fn test_out_of_order_segments() {
    let (assembler, events) = collecting_assembler(false);
    let mut feeder = TraceFeeder::new(assembler);

    run_handshake(&mut feeder, "db1");
    // The query packet split into 3 TCP segments delivered [3, 1, 2].
    let bytes = mysql_packet(0, b"\x03SELECT a, b, c FROM big_enough_table");
    feeder.client_raw_reordered(&bytes, 3, &[2, 0, 1]);
    feeder.server_packet(1, &ok_packet());
    feeder.client_packet(0, &[0x01]);
    feeder.fin();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[1].body,
        EventBody::Query {
            sql: "SELECT a, b, c FROM big_enough_table".into()
        }
    );
}

#[test]
fn test_duplicate_segments_ignored() {
    let (assembler, events) = collecting_assembler(false);
    let mut feeder = TraceFeeder::new(assembler);

    run_handshake(&mut feeder, "");
    let bytes = mysql_packet(0, b"\x03SELECT 1");
    // Same segment delivered twice (retransmit).
    feeder.client_raw_reordered(&bytes, 1, &[0, 0]);
    feeder.server_packet(1, &ok_packet());
    feeder.fin();

    let events = events.lock().unwrap();
    let queries = events
        .iter()
        .filter(|e| matches!(e.body, EventBody::Query { .. }))
        .count();
    assert_eq!(queries, 1);
}

#[test]
fn test_mid_stream_requires_force_start() {
    // Without ForceStart a SYN-less flow produces nothing.
    let (assembler, events) = collecting_assembler(false);
    let mut feeder = TraceFeeder::without_syn(assembler);
    feeder.client_packet(0, b"\x03SELECT 1");
    feeder.server_packet(1, &ok_packet());
    feeder.fin();
    assert!(events.lock().unwrap().is_empty());

    // With ForceStart events begin at the first parseable client command,
    // and no handshake is emitted.
    let (assembler, events) = collecting_assembler(true);
    let mut feeder = TraceFeeder::without_syn(assembler);
    feeder.client_packet(0, b"\x03SELECT 1");
    feeder.server_packet(1, &ok_packet());
    feeder.fin();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].body, EventBody::Query { .. }));
}

#[test]
fn test_dump_files_feed_replay_discovery() {
    use mysql_replay::capture::TextDumpHandler;
    use mysql_replay::replay::discover_sessions;
    use tempfile::TempDir;

    let dir = TempDir::new().unwrap();
    let out = dir.path().to_path_buf();
    let assembler = Assembler::new(
        FactoryOptions::default(),
        Box::new(move |conn| {
            TextDumpHandler::create(&out, conn)
                .ok()
                .map(|h| Box::new(h) as Box<dyn EventHandler>)
        }),
    );
    let mut feeder = TraceFeeder::new(assembler);
    run_handshake(&mut feeder, "db1");
    feeder.client_packet(0, b"\x03SELECT 1");
    feeder.server_packet(1, &ok_packet());
    feeder.client_packet(0, &[0x01]);
    feeder.fin();
    feeder.assembler.flush_all();

    let sessions = discover_sessions(dir.path()).unwrap();
    assert_eq!(sessions.len(), 1);

    let content = std::fs::read_to_string(&sessions[0].path).unwrap();
    let events: Vec<_> = content
        .lines()
        .map(|line| decode_event(line).unwrap())
        .collect();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].body, EventBody::Handshake { db: "db1".into() });
    assert_eq!(events[0].time, sessions[0].first_ts);
    assert!(matches!(events[2].body, EventBody::Quit));
}

#[test]
fn test_desync_recovers_at_next_command() {
    let (assembler, events) = collecting_assembler(false);
    let mut feeder = TraceFeeder::new(assembler);

    run_handshake(&mut feeder, "");
    // Corrupted client packet: unknown opcode.
    feeder.client_packet(0, &[0x77, 1, 2, 3, 4]);
    // The machine drains to the next clean command boundary.
    feeder.client_packet(0, b"\x03SELECT recovered");
    feeder.server_packet(1, &ok_packet());
    feeder.fin();

    let events = events.lock().unwrap();
    assert_eq!(
        events.last().unwrap().body,
        EventBody::Query {
            sql: "SELECT recovered".into()
        }
    );
}
