//! Line-oriented text serialization for events
//!
//! One event per line, fields tab-separated:
//! `<ts>\t<type>\t<payload...>`. String payloads are escaped so a field can
//! never contain a raw tab or newline; binary parameters are hex-encoded.
//! Decoding is the exact inverse of encoding for every event variant.

use crate::error::{ReplayError, Result};
use crate::event::{Event, EventBody, ParamValue};

const TYPE_HANDSHAKE: &str = "handshake";
const TYPE_QUIT: &str = "quit";
const TYPE_QUERY: &str = "query";
const TYPE_STMT_PREPARE: &str = "stmt_prepare";
const TYPE_STMT_EXECUTE: &str = "stmt_execute";
const TYPE_STMT_CLOSE: &str = "stmt_close";

/// Append the text encoding of `event` to `out` (no trailing newline)
pub fn encode_event(event: &Event, out: &mut String) {
    use std::fmt::Write;
    let _ = write!(out, "{}", event.time);
    match &event.body {
        EventBody::Handshake { db } => {
            out.push('\t');
            out.push_str(TYPE_HANDSHAKE);
            out.push('\t');
            escape_into(db, out);
        }
        EventBody::Quit => {
            out.push('\t');
            out.push_str(TYPE_QUIT);
        }
        EventBody::Query { sql } => {
            out.push('\t');
            out.push_str(TYPE_QUERY);
            out.push('\t');
            escape_into(sql, out);
        }
        EventBody::StmtPrepare { id, sql } => {
            let _ = write!(out, "\t{}\t{}\t", TYPE_STMT_PREPARE, id);
            escape_into(sql, out);
        }
        EventBody::StmtExecute { id, params } => {
            let _ = write!(out, "\t{}\t{}\t{}", TYPE_STMT_EXECUTE, id, params.len());
            for param in params {
                out.push('\t');
                encode_param(param, out);
            }
        }
        EventBody::StmtClose { id } => {
            let _ = write!(out, "\t{}\t{}", TYPE_STMT_CLOSE, id);
        }
    }
}

/// Decode one line previously produced by [`encode_event`]
pub fn decode_event(line: &str) -> Result<Event> {
    let mut fields = line.split('\t');
    let time: i64 = next(&mut fields, "time")?
        .parse()
        .map_err(|_| ReplayError::event("bad time field"))?;
    let kind = next(&mut fields, "type")?;

    let body = match kind {
        TYPE_HANDSHAKE => EventBody::Handshake {
            db: unescape(next(&mut fields, "db")?)?,
        },
        TYPE_QUIT => EventBody::Quit,
        TYPE_QUERY => EventBody::Query {
            sql: unescape(next(&mut fields, "sql")?)?,
        },
        TYPE_STMT_PREPARE => {
            let id = parse_id(next(&mut fields, "stmt id")?)?;
            let sql = unescape(next(&mut fields, "sql")?)?;
            EventBody::StmtPrepare { id, sql }
        }
        TYPE_STMT_EXECUTE => {
            let id = parse_id(next(&mut fields, "stmt id")?)?;
            let count: usize = next(&mut fields, "param count")?
                .parse()
                .map_err(|_| ReplayError::event("bad param count"))?;
            let mut params = Vec::with_capacity(count);
            for _ in 0..count {
                params.push(decode_param(next(&mut fields, "param")?)?);
            }
            EventBody::StmtExecute { id, params }
        }
        TYPE_STMT_CLOSE => EventBody::StmtClose {
            id: parse_id(next(&mut fields, "stmt id")?)?,
        },
        other => {
            return Err(ReplayError::event(format!("unknown event type {:?}", other)));
        }
    };

    if fields.next().is_some() {
        return Err(ReplayError::event("trailing fields"));
    }
    Ok(Event { time, body })
}

fn next<'a>(fields: &mut std::str::Split<'a, char>, what: &str) -> Result<&'a str> {
    fields
        .next()
        .ok_or_else(|| ReplayError::event(format!("missing {} field", what)))
}

fn parse_id(field: &str) -> Result<u64> {
    field
        .parse()
        .map_err(|_| ReplayError::event("bad statement id"))
}

fn encode_param(param: &ParamValue, out: &mut String) {
    use std::fmt::Write;
    match param {
        ParamValue::Null => out.push_str("nil"),
        ParamValue::Int(v) => {
            let _ = write!(out, "i:{}", v);
        }
        ParamValue::Uint(v) => {
            let _ = write!(out, "u:{}", v);
        }
        ParamValue::Double(v) => {
            let _ = write!(out, "f:{}", v);
        }
        ParamValue::Decimal(v) => {
            out.push_str("d:");
            escape_into(v, out);
        }
        ParamValue::Time(v) => {
            out.push_str("t:");
            escape_into(v, out);
        }
        ParamValue::Bytes(v) => {
            out.push_str("b:");
            for b in v {
                let _ = write!(out, "{:02x}", b);
            }
        }
        ParamValue::Text(v) => {
            out.push_str("s:");
            escape_into(v, out);
        }
    }
}

fn decode_param(field: &str) -> Result<ParamValue> {
    if field == "nil" {
        return Ok(ParamValue::Null);
    }
    let (tag, payload) = field
        .split_once(':')
        .ok_or_else(|| ReplayError::event("malformed parameter field"))?;
    match tag {
        "i" => payload
            .parse()
            .map(ParamValue::Int)
            .map_err(|_| ReplayError::event("bad int parameter")),
        "u" => payload
            .parse()
            .map(ParamValue::Uint)
            .map_err(|_| ReplayError::event("bad uint parameter")),
        "f" => payload
            .parse()
            .map(ParamValue::Double)
            .map_err(|_| ReplayError::event("bad float parameter")),
        "d" => Ok(ParamValue::Decimal(unescape(payload)?)),
        "t" => Ok(ParamValue::Time(unescape(payload)?)),
        "b" => Ok(ParamValue::Bytes(unhex(payload)?)),
        "s" => Ok(ParamValue::Text(unescape(payload)?)),
        other => Err(ReplayError::event(format!("unknown parameter tag {:?}", other))),
    }
}

fn escape_into(s: &str, out: &mut String) {
    use std::fmt::Write;
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 0x20 || c == '\x7f' => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('x') => {
                let hi = chars.next();
                let lo = chars.next();
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(ReplayError::event("truncated \\x escape"));
                };
                let byte = u8::from_str_radix(&format!("{}{}", hi, lo), 16)
                    .map_err(|_| ReplayError::event("bad \\x escape"))?;
                out.push(byte as char);
            }
            _ => return Err(ReplayError::event("dangling escape")),
        }
    }
    Ok(out)
}

fn unhex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(ReplayError::event("odd hex length"));
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(s.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = hex_val(pair[0]).ok_or_else(|| ReplayError::event("bad hex digit"))?;
        let lo = hex_val(pair[1]).ok_or_else(|| ReplayError::event("bad hex digit"))?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
