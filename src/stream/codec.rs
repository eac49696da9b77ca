//! MySQL payload decoding
//!
//! Everything below the framing layer: client command packets, the
//! handshake exchange, server reply classification, and the binary protocol
//! parameter block of `COM_STMT_EXECUTE`. Only the subset needed to recover
//! client intent is decoded; result-set packets are classified, never
//! materialized.

use crate::event::ParamValue;

// Command opcodes (first payload byte of a client packet)
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_FIELD_LIST: u8 = 0x04;
pub const COM_PING: u8 = 0x0e;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
pub const COM_STMT_CLOSE: u8 = 0x19;
pub const COM_STMT_RESET: u8 = 0x1a;

// Capability flags (handshake response)
pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
pub const CLIENT_SSL: u32 = 1 << 11;
pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
pub const CLIENT_PLUGIN_AUTH_LENENC_DATA: u32 = 1 << 21;
pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

// Binary protocol type tags
pub const TYPE_DECIMAL: u8 = 0x00;
pub const TYPE_TINY: u8 = 0x01;
pub const TYPE_SHORT: u8 = 0x02;
pub const TYPE_LONG: u8 = 0x03;
pub const TYPE_FLOAT: u8 = 0x04;
pub const TYPE_DOUBLE: u8 = 0x05;
pub const TYPE_NULL: u8 = 0x06;
pub const TYPE_TIMESTAMP: u8 = 0x07;
pub const TYPE_LONGLONG: u8 = 0x08;
pub const TYPE_INT24: u8 = 0x09;
pub const TYPE_DATE: u8 = 0x0a;
pub const TYPE_TIME: u8 = 0x0b;
pub const TYPE_DATETIME: u8 = 0x0c;
pub const TYPE_YEAR: u8 = 0x0d;
pub const TYPE_BIT: u8 = 0x10;
pub const TYPE_JSON: u8 = 0xf5;
pub const TYPE_NEWDECIMAL: u8 = 0xf6;
pub const TYPE_TINY_BLOB: u8 = 0xf9;
pub const TYPE_MEDIUM_BLOB: u8 = 0xfa;
pub const TYPE_LONG_BLOB: u8 = 0xfb;
pub const TYPE_BLOB: u8 = 0xfc;
pub const TYPE_VAR_STRING: u8 = 0xfd;
pub const TYPE_STRING: u8 = 0xfe;
pub const TYPE_VARCHAR: u8 = 0x0f;

/// Is `opcode` one of the client commands this pipeline understands?
pub fn is_known_command(opcode: u8) -> bool {
    matches!(
        opcode,
        COM_QUIT
            | COM_INIT_DB
            | COM_QUERY
            | COM_FIELD_LIST
            | COM_PING
            | COM_STMT_PREPARE
            | COM_STMT_EXECUTE
            | COM_STMT_SEND_LONG_DATA
            | COM_STMT_CLOSE
            | COM_STMT_RESET
    )
}

/// A decoded client command payload
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Quit,
    InitDb { schema: String },
    Query { sql: String },
    FieldList,
    Ping,
    StmtPrepare { sql: String },
    /// Raw execute body; parameter decoding needs the statement table and
    /// happens in [`decode_execute_params`]
    StmtExecute { stmt_id: u32, body: Vec<u8> },
    StmtSendLongData { stmt_id: u32, param: u16, data: Vec<u8> },
    StmtClose { stmt_id: u32 },
    StmtReset { stmt_id: u32 },
}

/// Decoding error: the payload does not match its opcode's layout
#[derive(Debug, Clone, PartialEq)]
pub struct Malformed(pub &'static str);

/// Decode a client command payload (first byte is the opcode)
pub fn decode_command(payload: &[u8]) -> Result<Option<Command>, Malformed> {
    let Some(&opcode) = payload.first() else {
        return Err(Malformed("empty command payload"));
    };
    let rest = &payload[1..];
    let cmd = match opcode {
        COM_QUIT => Command::Quit,
        COM_PING => Command::Ping,
        COM_FIELD_LIST => Command::FieldList,
        COM_INIT_DB => Command::InitDb {
            schema: String::from_utf8_lossy(rest).into_owned(),
        },
        COM_QUERY => Command::Query {
            sql: String::from_utf8_lossy(rest).into_owned(),
        },
        COM_STMT_PREPARE => Command::StmtPrepare {
            sql: String::from_utf8_lossy(rest).into_owned(),
        },
        COM_STMT_EXECUTE => {
            if rest.len() < 8 {
                return Err(Malformed("short COM_STMT_EXECUTE"));
            }
            Command::StmtExecute {
                stmt_id: u32_le(&rest[0..4]),
                body: rest.to_vec(),
            }
        }
        COM_STMT_SEND_LONG_DATA => {
            if rest.len() < 6 {
                return Err(Malformed("short COM_STMT_SEND_LONG_DATA"));
            }
            Command::StmtSendLongData {
                stmt_id: u32_le(&rest[0..4]),
                param: u16_le(&rest[4..6]),
                data: rest[6..].to_vec(),
            }
        }
        COM_STMT_CLOSE => {
            if rest.len() < 4 {
                return Err(Malformed("short COM_STMT_CLOSE"));
            }
            Command::StmtClose {
                stmt_id: u32_le(&rest[0..4]),
            }
        }
        COM_STMT_RESET => {
            if rest.len() < 4 {
                return Err(Malformed("short COM_STMT_RESET"));
            }
            Command::StmtReset {
                stmt_id: u32_le(&rest[0..4]),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(cmd))
}

/// Fields of a client handshake response we care about
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub username: String,
    /// Schema from the CONNECT_WITH_DB block, empty when absent
    pub schema: String,
    /// Client requested a TLS upgrade; the rest of the stream is opaque
    pub ssl: bool,
}

/// Parse the client's reply to the server greeting.
///
/// A 32-byte payload carrying `CLIENT_SSL` is an SSLRequest; the session
/// switches to TLS and cannot be decoded further.
pub fn decode_handshake_response(payload: &[u8]) -> Result<HandshakeResponse, Malformed> {
    if payload.len() < 32 {
        return Err(Malformed("short handshake response"));
    }
    let capabilities = u32_le(&payload[0..4]);
    if capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(Malformed("pre-4.1 handshake response"));
    }
    if payload.len() == 32 && capabilities & CLIENT_SSL != 0 {
        return Ok(HandshakeResponse {
            capabilities,
            username: String::new(),
            schema: String::new(),
            ssl: true,
        });
    }

    // caps(4) maxpacket(4) charset(1) reserved(23)
    let mut at = 32;
    let username = read_cstring(payload, &mut at).ok_or(Malformed("handshake username"))?;

    // auth response, encoding chosen by capability flags
    if capabilities & CLIENT_PLUGIN_AUTH_LENENC_DATA != 0 {
        let (len, used) = read_lenenc_int(&payload[at..]).ok_or(Malformed("auth length"))?;
        at += used + len as usize;
    } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        let len = *payload.get(at).ok_or(Malformed("auth length"))? as usize;
        at += 1 + len;
    } else {
        read_cstring(payload, &mut at).ok_or(Malformed("auth response"))?;
    }
    if at > payload.len() {
        return Err(Malformed("truncated auth response"));
    }

    let schema = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && at < payload.len() {
        read_cstring(payload, &mut at).unwrap_or_default()
    } else {
        String::new()
    };

    Ok(HandshakeResponse {
        capabilities,
        username,
        schema,
        ssl: false,
    })
}

/// True when a server payload looks like the protocol-10 greeting
pub fn is_server_greeting(payload: &[u8]) -> bool {
    // protocol version, then a NUL-terminated version string
    payload.len() > 5 && payload[0] == 0x0a && payload[1..].contains(&0)
}

/// Structural classification of one server payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerReply {
    Ok,
    Err,
    Eof,
    /// Anything else: column counts, definitions, rows
    Data,
}

/// Classify a server payload by its first byte.
///
/// `deprecate_eof` widens the OK detection to the 0xFE-headed terminator
/// used when the client negotiated `CLIENT_DEPRECATE_EOF`.
pub fn classify_reply(payload: &[u8], deprecate_eof: bool) -> ServerReply {
    match payload.first() {
        None => ServerReply::Data,
        Some(0x00) => ServerReply::Ok,
        Some(0xff) => ServerReply::Err,
        Some(0xfe) if payload.len() < 9 => ServerReply::Eof,
        Some(0xfe) if deprecate_eof => ServerReply::Ok,
        Some(_) => ServerReply::Data,
    }
}

/// COM_STMT_PREPARE_OK header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrepareOk {
    pub stmt_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
}

/// Parse the first packet of a prepare reply (status byte 0x00)
pub fn decode_prepare_ok(payload: &[u8]) -> Result<PrepareOk, Malformed> {
    if payload.len() < 12 || payload[0] != 0x00 {
        return Err(Malformed("bad COM_STMT_PREPARE_OK"));
    }
    Ok(PrepareOk {
        stmt_id: u32_le(&payload[1..5]),
        num_columns: u16_le(&payload[5..7]),
        num_params: u16_le(&payload[7..9]),
    })
}

/// Remembered binding types from a previous execute of the same statement
pub type ParamTypes = Vec<(u8, bool)>;

/// Decoded body of a COM_STMT_EXECUTE
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteBody {
    pub params: Vec<ParamValue>,
    /// The type block seen on this execute (present when new-params-bound
    /// was set), to be remembered for the next one
    pub types: Option<ParamTypes>,
}

/// Decode the parameter block of an execute body.
///
/// `body` starts at the statement id (the opcode is already stripped).
/// `param_count` comes from the prepared-statement table. `long_data`
/// returns the spliced byte value for a parameter fed by
/// `COM_STMT_SEND_LONG_DATA`, if any.
pub fn decode_execute_params(
    body: &[u8],
    param_count: u16,
    prior_types: Option<&ParamTypes>,
    mut long_data: impl FnMut(u16) -> Option<Vec<u8>>,
) -> Result<ExecuteBody, Malformed> {
    if body.len() < 9 {
        return Err(Malformed("short execute body"));
    }
    let iterations = u32_le(&body[5..9]);
    if iterations != 1 {
        return Err(Malformed("execute iteration count must be 1"));
    }
    let mut at = 9usize;

    if param_count == 0 {
        return Ok(ExecuteBody {
            params: Vec::new(),
            types: None,
        });
    }

    let bitmap_len = (param_count as usize + 7) / 8;
    if body.len() < at + bitmap_len + 1 {
        return Err(Malformed("short null bitmap"));
    }
    let bitmap = &body[at..at + bitmap_len];
    at += bitmap_len;

    let new_params_bound = body[at];
    at += 1;

    let owned_types;
    let types: &ParamTypes = if new_params_bound == 1 {
        let need = param_count as usize * 2;
        if body.len() < at + need {
            return Err(Malformed("short parameter type block"));
        }
        owned_types = (0..param_count as usize)
            .map(|i| {
                let ty = body[at + i * 2];
                let unsigned = body[at + i * 2 + 1] & 0x80 != 0;
                (ty, unsigned)
            })
            .collect::<Vec<_>>();
        at += need;
        &owned_types
    } else {
        prior_types.ok_or(Malformed("no parameter types bound"))?
    };

    let mut params = Vec::with_capacity(param_count as usize);
    for i in 0..param_count as usize {
        if let Some(data) = long_data(i as u16) {
            params.push(ParamValue::Bytes(data));
            continue;
        }
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            params.push(ParamValue::Null);
            continue;
        }
        let (ty, unsigned) = types[i];
        params.push(decode_value(body, &mut at, ty, unsigned)?);
    }

    Ok(ExecuteBody {
        params,
        types: (new_params_bound == 1).then(|| types.clone()),
    })
}

fn decode_value(
    body: &[u8],
    at: &mut usize,
    ty: u8,
    unsigned: bool,
) -> Result<ParamValue, Malformed> {
    let need = |at: usize, n: usize| {
        if body.len() < at + n {
            Err(Malformed("truncated parameter value"))
        } else {
            Ok(())
        }
    };
    let value = match ty {
        TYPE_NULL => ParamValue::Null,
        TYPE_TINY => {
            need(*at, 1)?;
            let raw = body[*at];
            *at += 1;
            if unsigned {
                ParamValue::Uint(raw as u64)
            } else {
                ParamValue::Int(raw as i8 as i64)
            }
        }
        TYPE_SHORT | TYPE_YEAR => {
            need(*at, 2)?;
            let raw = u16_le(&body[*at..*at + 2]);
            *at += 2;
            if unsigned {
                ParamValue::Uint(raw as u64)
            } else {
                ParamValue::Int(raw as i16 as i64)
            }
        }
        TYPE_LONG | TYPE_INT24 => {
            need(*at, 4)?;
            let raw = u32_le(&body[*at..*at + 4]);
            *at += 4;
            if unsigned {
                ParamValue::Uint(raw as u64)
            } else {
                ParamValue::Int(raw as i32 as i64)
            }
        }
        TYPE_LONGLONG => {
            need(*at, 8)?;
            let raw = u64_le(&body[*at..*at + 8]);
            *at += 8;
            if unsigned {
                ParamValue::Uint(raw)
            } else {
                ParamValue::Int(raw as i64)
            }
        }
        TYPE_FLOAT => {
            need(*at, 4)?;
            let raw = f32::from_le_bytes([body[*at], body[*at + 1], body[*at + 2], body[*at + 3]]);
            *at += 4;
            ParamValue::Double(raw as f64)
        }
        TYPE_DOUBLE => {
            need(*at, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&body[*at..*at + 8]);
            *at += 8;
            ParamValue::Double(f64::from_le_bytes(raw))
        }
        TYPE_DECIMAL | TYPE_NEWDECIMAL => {
            let bytes = read_lenenc_bytes(body, at)?;
            ParamValue::Decimal(String::from_utf8_lossy(&bytes).into_owned())
        }
        TYPE_DATE | TYPE_DATETIME | TYPE_TIMESTAMP => {
            ParamValue::Time(decode_datetime(body, at)?)
        }
        TYPE_TIME => ParamValue::Time(decode_time(body, at)?),
        TYPE_VARCHAR | TYPE_VAR_STRING | TYPE_STRING | TYPE_JSON => {
            let bytes = read_lenenc_bytes(body, at)?;
            ParamValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        TYPE_TINY_BLOB | TYPE_MEDIUM_BLOB | TYPE_LONG_BLOB | TYPE_BLOB | TYPE_BIT => {
            ParamValue::Bytes(read_lenenc_bytes(body, at)?)
        }
        _ => return Err(Malformed("impossible parameter type tag")),
    };
    Ok(value)
}

fn decode_datetime(body: &[u8], at: &mut usize) -> Result<String, Malformed> {
    let len = *body.get(*at).ok_or(Malformed("truncated datetime"))? as usize;
    *at += 1;
    if body.len() < *at + len {
        return Err(Malformed("truncated datetime"));
    }
    let v = &body[*at..*at + len];
    *at += len;
    let text = match len {
        0 => "0000-00-00 00:00:00".to_string(),
        4 => format!("{:04}-{:02}-{:02}", u16_le(&v[0..2]), v[2], v[3]),
        7 => format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            u16_le(&v[0..2]),
            v[2],
            v[3],
            v[4],
            v[5],
            v[6]
        ),
        11 => format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            u16_le(&v[0..2]),
            v[2],
            v[3],
            v[4],
            v[5],
            v[6],
            u32_le(&v[7..11])
        ),
        _ => return Err(Malformed("bad datetime length")),
    };
    Ok(text)
}

fn decode_time(body: &[u8], at: &mut usize) -> Result<String, Malformed> {
    let len = *body.get(*at).ok_or(Malformed("truncated time"))? as usize;
    *at += 1;
    if body.len() < *at + len {
        return Err(Malformed("truncated time"));
    }
    let v = &body[*at..*at + len];
    *at += len;
    let text = match len {
        0 => "00:00:00".to_string(),
        8 | 12 => {
            let negative = v[0] != 0;
            let days = u32_le(&v[1..5]);
            let hours = days * 24 + v[5] as u32;
            let base = format!("{}{:02}:{:02}:{:02}", if negative { "-" } else { "" }, hours, v[6], v[7]);
            if len == 12 {
                format!("{}.{:06}", base, u32_le(&v[8..12]))
            } else {
                base
            }
        }
        _ => return Err(Malformed("bad time length")),
    };
    Ok(text)
}

fn read_lenenc_bytes(body: &[u8], at: &mut usize) -> Result<Vec<u8>, Malformed> {
    let rest = body.get(*at..).ok_or(Malformed("truncated length"))?;
    let (len, used) = read_lenenc_int(rest).ok_or(Malformed("truncated length"))?;
    *at += used;
    let len = len as usize;
    if body.len() < *at + len {
        return Err(Malformed("truncated string value"));
    }
    let out = body[*at..*at + len].to_vec();
    *at += len;
    Ok(out)
}

/// Length-encoded integer; returns `(value, bytes consumed)`
pub fn read_lenenc_int(buf: &[u8]) -> Option<(u64, usize)> {
    match *buf.first()? {
        v @ 0..=0xfa => Some((v as u64, 1)),
        0xfc if buf.len() >= 3 => Some((u16_le(&buf[1..3]) as u64, 3)),
        0xfd if buf.len() >= 4 => {
            Some(((buf[1] as u64) | ((buf[2] as u64) << 8) | ((buf[3] as u64) << 16), 4))
        }
        0xfe if buf.len() >= 9 => Some((u64_le(&buf[1..9]), 9)),
        _ => None,
    }
}

fn read_cstring(buf: &[u8], at: &mut usize) -> Option<String> {
    let rest = buf.get(*at..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&rest[..end]).into_owned();
    *at += end + 1;
    Some(s)
}

fn u16_le(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn u32_le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn u64_le(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
