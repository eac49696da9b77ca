//! Per-connection protocol state machine
//!
//! A [`MySqlStream`] owns the two directional buffers of one TCP connection
//! and walks the MySQL protocol across them: handshake, command/reply
//! cycles, prepared-statement bookkeeping, and desync recovery. Events are
//! pushed into the connection's [`EventHandler`] as frames become
//! contiguous.

use crate::event::{Event, EventBody};
use crate::stream::buffer::DirectionalBuffer;
use crate::stream::codec::{
    self, classify_reply, decode_command, decode_execute_params, decode_handshake_response,
    decode_prepare_ok, is_known_command, is_server_greeting, Command, ParamTypes, ServerReply,
    CLIENT_DEPRECATE_EOF,
};
use crate::stream::conn::ConnId;
use crate::stream::frame::{read_frame, Frame, FrameRead};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Sink for events decoded out of one connection
pub trait EventHandler: Send {
    fn on_event(&mut self, event: Event);
    /// The connection is finished; no more events will arrive
    fn on_close(&mut self);
}

/// Options shared by every stream a factory creates
#[derive(Debug, Clone, Copy, Default)]
pub struct FactoryOptions {
    /// Serialize state-machine callbacks under a per-connection lock; when
    /// false the caller must deliver segments from a single thread
    pub synchronized: bool,
    /// Accept flows whose SYN was not captured; the first byte seen
    /// defines the base sequence
    pub force_start: bool,
}

/// Bytes a direction may accumulate while the phase expects the other
/// direction before the machine declares the streams out of step
const MAX_UNEXPECTED_BACKLOG: usize = 256 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitHandshake,
    AwaitHandshakeResponse,
    Idle,
    AwaitCommandReply,
    AwaitPrepareReply,
    AwaitExecuteReply,
    Desync,
    Closed,
}

/// What the current server reply structurally looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyShape {
    /// OK/ERR or a result set with a column-count header
    Generic,
    /// COM_FIELD_LIST: definitions straight to EOF/ERR
    FieldList,
    /// Post-handshake authentication exchange: anything until OK/ERR
    Auth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyStage {
    First,
    Columns { remaining: u64 },
    Rows,
}

#[derive(Debug)]
struct StmtInfo {
    sql: String,
    param_count: u16,
    types: Option<ParamTypes>,
}

const CLIENT_DIR: usize = 0;
const SERVER_DIR: usize = 1;

/// State machine for one captured connection
pub struct MySqlStream {
    id: ConnId,
    force_start: bool,

    bufs: [DirectionalBuffer; 2],
    parked: [Option<Frame>; 2],
    /// Which buffer index carries client->server traffic; set by SYN
    /// direction or inferred from the first parseable frame
    roles: Option<[usize; 2]>,

    phase: Phase,
    reply_shape: ReplyShape,
    reply_stage: ReplyStage,
    /// Definition packets (and EOFs) still to skip after a prepare-OK
    prepare_skip: u32,

    schema: String,
    caps: u32,
    pending_prepare: Option<String>,
    pending_init_db: Option<String>,
    stmts: HashMap<u32, StmtInfo>,
    long_data: HashMap<(u32, u16), Vec<u8>>,

    handler: Option<Box<dyn EventHandler>>,
}

impl MySqlStream {
    pub fn new(id: ConnId, opts: FactoryOptions, handler: Box<dyn EventHandler>) -> Self {
        Self {
            id,
            force_start: opts.force_start,
            bufs: [
                DirectionalBuffer::new(opts.force_start),
                DirectionalBuffer::new(opts.force_start),
            ],
            parked: [None, None],
            roles: None,
            phase: Phase::AwaitHandshake,
            reply_shape: ReplyShape::Generic,
            reply_stage: ReplyStage::First,
            prepare_skip: 0,
            schema: String::new(),
            caps: 0,
            pending_prepare: None,
            pending_init_db: None,
            stmts: HashMap::new(),
            long_data: HashMap::new(),
            handler: Some(handler),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// A SYN (without ACK) identifies its sender as the client
    pub fn on_syn(&mut self, dir: usize, seq: u32, is_ack: bool, ts: i64) {
        self.bufs[dir].start(seq, ts);
        if self.roles.is_none() {
            if is_ack {
                self.roles = Some([dir ^ 1, dir]);
            } else {
                self.roles = Some([dir, dir ^ 1]);
            }
        }
    }

    /// Payload bytes for one direction
    pub fn on_data(&mut self, dir: usize, seq: u32, payload: &[u8], ts: i64) {
        self.bufs[dir].write(seq, payload, ts);
        self.process();
    }

    /// FIN or RST for one direction
    pub fn on_fin(&mut self, dir: usize) {
        self.bufs[dir].close();
        self.process();
        self.maybe_finish();
    }

    /// Close both directions if idle since before `ts`; returns true when
    /// the stream is finished and can be dropped
    pub fn flush_close_older_than(&mut self, ts: i64) -> bool {
        for buf in &mut self.bufs {
            if !buf.is_closed() && buf.last_seen() < ts {
                buf.close();
            }
        }
        if self.bufs.iter().all(|b| b.is_closed()) {
            self.process();
            self.finish();
        }
        self.is_finished()
    }

    /// Force the stream closed (end of trace)
    pub fn finish(&mut self) {
        for buf in &mut self.bufs {
            buf.close();
        }
        self.process();
        self.phase = Phase::Closed;
        if let Some(mut handler) = self.handler.take() {
            handler.on_close();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handler.is_none()
    }

    fn maybe_finish(&mut self) {
        let drained = self
            .bufs
            .iter()
            .all(|b| b.is_closed() && b.window().is_empty());
        if drained || self.phase == Phase::Closed {
            self.finish();
        }
    }

    fn emit(&mut self, ts: i64, body: EventBody) {
        if let Some(handler) = self.handler.as_mut() {
            handler.on_event(Event::new(ts, body));
        }
    }

    fn deprecate_eof(&self) -> bool {
        self.caps & CLIENT_DEPRECATE_EOF != 0
    }

    // ------------------------------------------------------------------
    // Frame pump
    // ------------------------------------------------------------------

    fn process(&mut self) {
        loop {
            if self.phase == Phase::Closed {
                return;
            }
            self.fill_parked();

            let Some([client, server]) = self.roles else {
                if !self.assign_roles() {
                    return;
                }
                continue;
            };

            if self.phase == Phase::Desync {
                if !self.step_desync(client, server) {
                    return;
                }
                continue;
            }

            let want = match self.phase {
                Phase::AwaitHandshake => server,
                Phase::AwaitHandshakeResponse | Phase::Idle => client,
                Phase::AwaitCommandReply
                | Phase::AwaitPrepareReply
                | Phase::AwaitExecuteReply => server,
                Phase::Desync | Phase::Closed => return,
            };

            if let Some(frame) = self.parked[want].take() {
                if want == client {
                    self.handle_client_frame(frame);
                } else {
                    self.handle_server_frame(frame);
                }
                continue;
            }

            let other = want ^ 1;
            if self.parked[other].is_some()
                && self.bufs[other].window().len() > MAX_UNEXPECTED_BACKLOG
            {
                warn!(conn = %self.id, "streams out of step, draining to a safe boundary");
                self.enter_desync();
                continue;
            }
            return;
        }
    }

    fn fill_parked(&mut self) {
        for dir in 0..2 {
            if self.parked[dir].is_some() {
                continue;
            }
            match read_frame(&mut self.bufs[dir]) {
                FrameRead::Frame(frame) => self.parked[dir] = Some(frame),
                FrameRead::NeedMore => {}
                FrameRead::Invalid(reason) => {
                    warn!(conn = %self.id, reason, "invalid framing");
                    self.enter_desync();
                }
            }
        }
    }

    /// Figure out which direction is which when no SYN was captured.
    /// Returns false when nothing can be decided yet.
    fn assign_roles(&mut self) -> bool {
        for dir in 0..2 {
            if let Some(frame) = self.parked[dir].as_ref() {
                if self.phase == Phase::AwaitHandshake && is_server_greeting(&frame.payload) {
                    self.roles = Some([dir ^ 1, dir]);
                    return true;
                }
            }
        }
        if self.force_start {
            for dir in 0..2 {
                if let Some(frame) = self.parked[dir].as_ref() {
                    if frame.seq == 0
                        && frame
                            .payload
                            .first()
                            .is_some_and(|&op| is_known_command(op))
                    {
                        // Mid-stream capture starting at a client command:
                        // no handshake will be seen.
                        self.roles = Some([dir, dir ^ 1]);
                        self.phase = Phase::Idle;
                        return true;
                    }
                }
            }
            // Nothing attributable yet; drop one parked frame so the pump
            // keeps moving toward a recognizable boundary.
            for dir in 0..2 {
                if self.parked[dir].take().is_some() {
                    return true;
                }
            }
        }
        false
    }

    fn enter_desync(&mut self) {
        self.phase = Phase::Desync;
        self.pending_prepare = None;
        self.pending_init_db = None;
        self.long_data.clear();
    }

    /// Drain both directions toward the next client frame that starts a
    /// command (MySQL seq 0, known opcode). Returns false when out of
    /// frames.
    fn step_desync(&mut self, client: usize, server: usize) -> bool {
        let mut progressed = self.parked[server].take().is_some();
        if let Some(frame) = self.parked[client].take() {
            progressed = true;
            if frame.seq == 0
                && frame
                    .payload
                    .first()
                    .is_some_and(|&op| is_known_command(op))
            {
                debug!(conn = %self.id, "resynchronized at client command");
                self.phase = Phase::Idle;
                self.handle_client_frame(frame);
            }
        }
        progressed
    }

    // ------------------------------------------------------------------
    // Client direction
    // ------------------------------------------------------------------

    fn handle_client_frame(&mut self, frame: Frame) {
        match self.phase {
            Phase::AwaitHandshakeResponse => self.handle_handshake_response(frame),
            Phase::Idle => self.handle_command(frame),
            _ => {}
        }
    }

    fn handle_handshake_response(&mut self, frame: Frame) {
        let response = match decode_handshake_response(&frame.payload) {
            Ok(r) => r,
            Err(err) => {
                warn!(conn = %self.id, reason = err.0, "bad handshake response");
                self.enter_desync();
                return;
            }
        };
        if response.ssl {
            debug!(conn = %self.id, "TLS session, cannot decode");
            self.phase = Phase::Closed;
            self.finish();
            return;
        }
        self.caps = response.capabilities;
        self.schema = response.schema.clone();
        self.emit(
            frame.ts,
            EventBody::Handshake {
                db: response.schema,
            },
        );
        self.phase = Phase::AwaitCommandReply;
        self.reply_shape = ReplyShape::Auth;
        self.reply_stage = ReplyStage::First;
    }

    fn handle_command(&mut self, frame: Frame) {
        if frame.seq != 0 {
            // Leftover continuation (e.g. an auth exchange tail); commands
            // always restart the sequence.
            return;
        }
        let command = match decode_command(&frame.payload) {
            Ok(Some(command)) => command,
            Ok(None) => {
                warn!(conn = %self.id, opcode = frame.payload[0], "unknown command opcode");
                self.enter_desync();
                return;
            }
            Err(err) => {
                warn!(conn = %self.id, reason = err.0, "malformed command");
                self.enter_desync();
                return;
            }
        };

        match command {
            Command::Quit => {
                self.emit(frame.ts, EventBody::Quit);
                self.phase = Phase::Closed;
                self.finish();
            }
            Command::Query { sql } => {
                self.emit(frame.ts, EventBody::Query { sql });
                self.await_reply(Phase::AwaitCommandReply, ReplyShape::Generic);
            }
            Command::InitDb { schema } => {
                self.pending_init_db = Some(schema);
                self.await_reply(Phase::AwaitCommandReply, ReplyShape::Generic);
            }
            Command::Ping => {
                self.await_reply(Phase::AwaitCommandReply, ReplyShape::Generic);
            }
            Command::FieldList => {
                self.await_reply(Phase::AwaitCommandReply, ReplyShape::FieldList);
            }
            Command::StmtPrepare { sql } => {
                self.pending_prepare = Some(sql);
                self.await_reply(Phase::AwaitPrepareReply, ReplyShape::Generic);
            }
            Command::StmtExecute { stmt_id, body } => {
                self.handle_execute(frame.ts, stmt_id, &body);
            }
            Command::StmtClose { stmt_id } => {
                self.stmts.remove(&stmt_id);
                self.long_data.retain(|(id, _), _| *id != stmt_id);
                self.emit(
                    frame.ts,
                    EventBody::StmtClose {
                        id: stmt_id as u64,
                    },
                );
            }
            Command::StmtReset { stmt_id } => {
                self.long_data.retain(|(id, _), _| *id != stmt_id);
                self.await_reply(Phase::AwaitCommandReply, ReplyShape::Generic);
            }
            Command::StmtSendLongData {
                stmt_id,
                param,
                data,
            } => {
                self.long_data
                    .entry((stmt_id, param))
                    .or_default()
                    .extend_from_slice(&data);
            }
        }
    }

    fn handle_execute(&mut self, ts: i64, stmt_id: u32, body: &[u8]) {
        let Some(info) = self.stmts.get(&stmt_id) else {
            warn!(conn = %self.id, stmt = stmt_id, "execute for unknown statement");
            self.enter_desync();
            return;
        };
        let param_count = info.param_count;
        let prior_types = info.types.clone();
        let long_data = &mut self.long_data;
        let decoded = decode_execute_params(body, param_count, prior_types.as_ref(), |param| {
            long_data.remove(&(stmt_id, param))
        });
        match decoded {
            Ok(out) => {
                if let Some(types) = out.types {
                    if let Some(info) = self.stmts.get_mut(&stmt_id) {
                        info.types = Some(types);
                    }
                }
                self.emit(
                    ts,
                    EventBody::StmtExecute {
                        id: stmt_id as u64,
                        params: out.params,
                    },
                );
                self.await_reply(Phase::AwaitExecuteReply, ReplyShape::Generic);
            }
            Err(err) => {
                warn!(conn = %self.id, stmt = stmt_id, reason = err.0, "malformed execute");
                self.enter_desync();
            }
        }
    }

    fn await_reply(&mut self, phase: Phase, shape: ReplyShape) {
        self.phase = phase;
        self.reply_shape = shape;
        self.reply_stage = ReplyStage::First;
    }

    // ------------------------------------------------------------------
    // Server direction
    // ------------------------------------------------------------------

    fn handle_server_frame(&mut self, frame: Frame) {
        match self.phase {
            Phase::AwaitHandshake => {
                if is_server_greeting(&frame.payload) {
                    self.phase = Phase::AwaitHandshakeResponse;
                } else {
                    warn!(conn = %self.id, "expected server greeting");
                    self.enter_desync();
                }
            }
            Phase::AwaitPrepareReply => self.handle_prepare_reply(frame),
            Phase::AwaitCommandReply | Phase::AwaitExecuteReply => {
                self.handle_command_reply(frame)
            }
            _ => {}
        }
    }

    fn handle_prepare_reply(&mut self, frame: Frame) {
        if self.prepare_skip > 0 {
            self.prepare_skip -= 1;
            if self.prepare_skip == 0 {
                self.phase = Phase::Idle;
            }
            return;
        }
        match frame.payload.first() {
            Some(0x00) => match decode_prepare_ok(&frame.payload) {
                Ok(ok) => {
                    let sql = self.pending_prepare.take().unwrap_or_default();
                    self.stmts.insert(
                        ok.stmt_id,
                        StmtInfo {
                            sql: sql.clone(),
                            param_count: ok.num_params,
                            types: None,
                        },
                    );
                    self.emit(
                        frame.ts,
                        EventBody::StmtPrepare {
                            id: ok.stmt_id as u64,
                            sql,
                        },
                    );
                    // Definition packets to skip, plus one EOF per block
                    // unless the client deprecated EOF.
                    let eof = if self.deprecate_eof() { 0 } else { 1 };
                    let mut skip = 0u32;
                    if ok.num_params > 0 {
                        skip += ok.num_params as u32 + eof;
                    }
                    if ok.num_columns > 0 {
                        skip += ok.num_columns as u32 + eof;
                    }
                    self.prepare_skip = skip;
                    if skip == 0 {
                        self.phase = Phase::Idle;
                    }
                }
                Err(err) => {
                    warn!(conn = %self.id, reason = err.0, "bad prepare reply");
                    self.enter_desync();
                }
            },
            Some(0xff) => {
                self.pending_prepare = None;
                self.phase = Phase::Idle;
            }
            _ => {
                warn!(conn = %self.id, "unexpected prepare reply");
                self.enter_desync();
            }
        }
    }

    fn handle_command_reply(&mut self, frame: Frame) {
        let reply = classify_reply(&frame.payload, self.deprecate_eof());
        match self.reply_shape {
            ReplyShape::Auth => match reply {
                ServerReply::Ok | ServerReply::Err => self.finish_reply(reply),
                // Auth switch / more-data packets, and any client
                // continuation they provoke, carry no events.
                _ => {}
            },
            ReplyShape::FieldList => match reply {
                ServerReply::Eof | ServerReply::Err => self.finish_reply(reply),
                _ => {}
            },
            ReplyShape::Generic => match self.reply_stage {
                ReplyStage::First => match reply {
                    ServerReply::Ok | ServerReply::Err | ServerReply::Eof => {
                        self.finish_reply(reply)
                    }
                    ServerReply::Data => {
                        match codec::read_lenenc_int(&frame.payload) {
                            Some((columns, _)) if columns > 0 => {
                                self.reply_stage = ReplyStage::Columns { remaining: columns };
                            }
                            _ => {
                                warn!(conn = %self.id, "unreadable result set header");
                                self.enter_desync();
                            }
                        }
                    }
                },
                ReplyStage::Columns { remaining } => {
                    if reply == ServerReply::Err {
                        self.finish_reply(reply);
                    } else if remaining > 0 {
                        let left = remaining - 1;
                        if left == 0 && self.deprecate_eof() {
                            self.reply_stage = ReplyStage::Rows;
                        } else {
                            self.reply_stage = ReplyStage::Columns { remaining: left };
                        }
                    } else if reply == ServerReply::Eof {
                        self.reply_stage = ReplyStage::Rows;
                    } else {
                        warn!(conn = %self.id, "missing end of column definitions");
                        self.enter_desync();
                    }
                }
                ReplyStage::Rows => match reply {
                    ServerReply::Ok | ServerReply::Err | ServerReply::Eof => {
                        self.finish_reply(reply)
                    }
                    ServerReply::Data => {}
                },
            },
        }
    }

    fn finish_reply(&mut self, reply: ServerReply) {
        if let Some(schema) = self.pending_init_db.take() {
            if reply == ServerReply::Ok {
                self.schema = schema;
            }
        }
        self.phase = Phase::Idle;
        self.reply_stage = ReplyStage::First;
        self.reply_shape = ReplyShape::Generic;
    }
}
