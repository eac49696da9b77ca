//! Text dump event handler
//!
//! Streams events for one connection into a hidden temp file and renames it
//! to `<firstTs>.<lastTs>.<hash>.tsv` when the connection closes. Sessions
//! that produced no events leave nothing behind.

use crate::error::Result;
use crate::event::{encode_event, Event};
use crate::stats;
use crate::stream::state::EventHandler;
use crate::stream::ConnId;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes one session file per connection
pub struct TextDumpHandler {
    conn: ConnId,
    dir: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
    line: String,
    first_ts: i64,
    last_ts: i64,
}

impl TextDumpHandler {
    /// Open a temp file for the connection's events in `dir`
    pub fn create(dir: impl AsRef<Path>, conn: ConnId) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let temp_path = dir.join(format!(
            ".{}.{}.{}",
            conn.hash_str(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        let file = File::create(&temp_path)?;
        Ok(Self {
            conn,
            dir,
            temp_path,
            writer: BufWriter::with_capacity(1 << 20, file),
            line: String::with_capacity(4096),
            first_ts: 0,
            last_ts: 0,
        })
    }
}

impl EventHandler for TextDumpHandler {
    fn on_event(&mut self, event: Event) {
        self.line.clear();
        encode_event(&event, &mut self.line);
        self.line.push('\n');
        stats::add(stats::DATA_OUT, self.line.len() as i64);
        if let Err(err) = self.writer.write_all(self.line.as_bytes()) {
            error!(conn = %self.conn, error = %err, "failed to dump event");
            return;
        }
        self.last_ts = event.time;
        if self.first_ts == 0 {
            self.first_ts = event.time;
        }
    }

    fn on_close(&mut self) {
        if let Err(err) = self.writer.flush() {
            error!(conn = %self.conn, error = %err, "failed to flush session file");
        }
        if self.first_ts == 0 {
            let _ = std::fs::remove_file(&self.temp_path);
            return;
        }
        let name = format!(
            "{}.{}.{}.tsv",
            self.first_ts,
            self.last_ts,
            self.conn.hash_str()
        );
        let target = self.dir.join(&name);
        match std::fs::rename(&self.temp_path, &target) {
            Ok(()) => info!(conn = %self.conn, file = %name, "session dumped"),
            Err(err) => {
                error!(conn = %self.conn, error = %err, "failed to finalize session file")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use tempfile::TempDir;

    fn conn() -> ConnId {
        ConnId::new(
            "10.0.0.1:50000".parse().unwrap(),
            "10.0.0.2:3306".parse().unwrap(),
        )
    }

    #[test]
    fn test_dump_and_rename() {
        let dir = TempDir::new().unwrap();
        let id = conn();
        let mut handler = TextDumpHandler::create(dir.path(), id).unwrap();

        handler.on_event(Event::new(100, EventBody::Handshake { db: "db1".into() }));
        handler.on_event(Event::new(
            200,
            EventBody::Query {
                sql: "SELECT 1".into(),
            },
        ));
        handler.on_event(Event::new(300, EventBody::Quit));
        handler.on_close();

        let expected = dir
            .path()
            .join(format!("100.300.{}.tsv", id.hash_str()));
        let content = std::fs::read_to_string(&expected).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("100\thandshake"));
        assert!(lines[2].starts_with("300\tquit"));
    }

    #[test]
    fn test_empty_session_removed() {
        let dir = TempDir::new().unwrap();
        let mut handler = TextDumpHandler::create(dir.path(), conn()).unwrap();
        handler.on_close();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
