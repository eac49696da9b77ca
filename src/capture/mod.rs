//! Packet intake and stream assembly
//!
//! A [`PacketSource`] yields raw TCP segments in capture order; the
//! [`Assembler`] routes them onto per-connection state machines and owns
//! their lifecycle, including idle flushing for connections that never see
//! a FIN. Trace file formats stay behind the source trait; the bundled
//! implementation reads legacy pcap files.

pub mod dump;
pub mod pcap;

pub use dump::TextDumpHandler;
pub use pcap::PcapFileSource;

use crate::error::Result;
use crate::stats;
use crate::stream::state::{EventHandler, FactoryOptions, MySqlStream};
use crate::stream::ConnId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// One direction of a TCP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn conn_id(&self) -> ConnId {
        ConnId::new(self.src, self.dst)
    }

    /// Index of this direction within the canonical pair
    fn dir_index(&self) -> usize {
        let id = self.conn_id();
        if self.src == id.lower {
            0
        } else {
            1
        }
    }
}

/// One captured TCP segment
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub seq: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// Capture metadata attached to a segment
#[derive(Debug, Clone, Copy)]
pub struct CaptureInfo {
    /// Capture timestamp, milliseconds since the epoch
    pub ts: i64,
}

/// A packet supplier: one `(flow, segment, info)` triple per TCP packet
pub trait PacketSource {
    fn next_packet(&mut self) -> Result<Option<(FlowKey, TcpSegment, CaptureInfo)>>;
}

/// Creates the event sink for a newly seen connection. Returning `None`
/// drops the connection's events (the stream is still tracked so its bytes
/// are consumed).
pub type HandlerFactory = dyn Fn(ConnId) -> Option<Box<dyn EventHandler>> + Send + Sync;

/// Demultiplexes segments onto per-connection state machines
pub struct Assembler {
    options: FactoryOptions,
    factory: Box<HandlerFactory>,
    streams: HashMap<ConnId, Arc<Mutex<MySqlStream>>>,
}

impl Assembler {
    pub fn new(options: FactoryOptions, factory: Box<HandlerFactory>) -> Self {
        Self {
            options,
            factory,
            streams: HashMap::new(),
        }
    }

    /// Feed one segment into its connection's state machine
    pub fn assemble(&mut self, flow: FlowKey, segment: &TcpSegment, info: CaptureInfo) {
        stats::add(stats::PACKETS, 1);
        stats::add(stats::DATA_IN, segment.payload.len() as i64);

        let id = flow.conn_id();
        let dir = flow.dir_index();

        let stream = match self.streams.get(&id) {
            Some(stream) => Arc::clone(stream),
            None => {
                let Some(handler) = (self.factory)(id) else {
                    return;
                };
                debug!(conn = %id, "new stream");
                stats::add(stats::STREAMS, 1);
                let stream = Arc::new(Mutex::new(MySqlStream::new(id, self.options, handler)));
                self.streams.insert(id, Arc::clone(&stream));
                stream
            }
        };

        let mut guard = if self.options.synchronized {
            stream.lock()
        } else {
            match stream.try_lock() {
                Some(guard) => guard,
                None => {
                    warn!(conn = %id, "dropped segment: concurrent delivery without Synchronized");
                    return;
                }
            }
        };

        if segment.syn {
            guard.on_syn(dir, segment.seq, segment.ack, info.ts);
        }
        if !segment.payload.is_empty() {
            let seq = if segment.syn {
                segment.seq.wrapping_add(1)
            } else {
                segment.seq
            };
            guard.on_data(dir, seq, &segment.payload, info.ts);
        }
        if segment.fin || segment.rst {
            guard.on_fin(dir);
        }
        let finished = guard.is_finished();
        drop(guard);

        if finished {
            self.streams.remove(&id);
        }
    }

    /// Close and drop every stream idle since before `ts`
    pub fn flush_close_older_than(&mut self, ts: i64) {
        self.streams.retain(|id, stream| {
            let mut guard = stream.lock();
            let finished = guard.flush_close_older_than(ts);
            if finished {
                debug!(conn = %id, "flushed idle stream");
            }
            !finished
        });
    }

    /// Close and drop every stream (end of trace)
    pub fn flush_all(&mut self) {
        for (_, stream) in self.streams.drain() {
            stream.lock().finish();
        }
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Pump a packet source to completion through an assembler, flushing idle
/// streams every `flush_interval_ms` of capture time
pub fn run_capture(
    source: &mut dyn PacketSource,
    assembler: &mut Assembler,
    flush_interval_ms: i64,
) -> Result<()> {
    let mut last_flush: Option<i64> = None;
    while let Some((flow, segment, info)) = source.next_packet()? {
        match last_flush {
            None => last_flush = Some(info.ts),
            Some(at) if info.ts - at > flush_interval_ms => {
                assembler.flush_close_older_than(at);
                last_flush = Some(info.ts);
            }
            _ => {}
        }
        assembler.assemble(flow, &segment, info);
    }
    Ok(())
}
