//! Keyset cursor codec.
//!
//! Wire format, then base64url (no padding):
//!
//! ```text
//! byte     version (=1)
//! varint   key count
//! per key: varint name-len, name bytes, direction byte (0=asc, 1=desc)
//! per key: varint value-len, value as JSON bytes
//! ```
//!
//! Cursors are opaque to clients and versioned for forward compatibility;
//! decoding rejects unknown versions, and the pipeline rejects cursors
//! whose order keys do not match the current request.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

use crate::error::ApiError;
use crate::storage::{Direction, KeysetBound, OrderKey};

pub const CURSOR_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub order: Vec<OrderKey>,
    pub last_values: Vec<Value>,
}

impl Cursor {
    pub fn bound(&self) -> KeysetBound {
        KeysetBound { values: self.last_values.clone() }
    }
}

fn push_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

fn read_chunk<'a>(bytes: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len = read_varint(bytes, pos)? as usize;
    let chunk = bytes.get(*pos..*pos + len)?;
    *pos += len;
    Some(chunk)
}

pub fn encode(cursor: &Cursor) -> String {
    let mut out = Vec::new();
    out.push(CURSOR_VERSION);
    push_varint(&mut out, cursor.order.len() as u64);
    for key in &cursor.order {
        push_varint(&mut out, key.field.len() as u64);
        out.extend_from_slice(key.field.as_bytes());
        out.push(match key.direction {
            Direction::Asc => 0,
            Direction::Desc => 1,
        });
    }
    for value in &cursor.last_values {
        let json = value.to_string();
        push_varint(&mut out, json.len() as u64);
        out.extend_from_slice(json.as_bytes());
    }
    URL_SAFE_NO_PAD.encode(out)
}

pub fn decode(raw: &str) -> Result<Cursor, ApiError> {
    let malformed = || ApiError::Validation("malformed cursor".to_owned());

    let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|_| malformed())?;
    let mut pos = 0usize;

    let version = *bytes.first().ok_or_else(malformed)?;
    pos += 1;
    if version != CURSOR_VERSION {
        return Err(ApiError::Validation(format!("unsupported cursor version {version}")));
    }

    let count = read_varint(&bytes, &mut pos).ok_or_else(malformed)? as usize;
    // An adversarial count cannot allocate more keys than the payload holds.
    if count > bytes.len() {
        return Err(malformed());
    }

    let mut order = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_chunk(&bytes, &mut pos).ok_or_else(malformed)?;
        let field = std::str::from_utf8(name).map_err(|_| malformed())?.to_owned();
        let direction = match bytes.get(pos) {
            Some(0) => Direction::Asc,
            Some(1) => Direction::Desc,
            _ => return Err(malformed()),
        };
        pos += 1;
        order.push(OrderKey { field, direction });
    }

    let mut last_values = Vec::with_capacity(count);
    for _ in 0..count {
        let chunk = read_chunk(&bytes, &mut pos).ok_or_else(malformed)?;
        let value: Value = serde_json::from_slice(chunk).map_err(|_| malformed())?;
        last_values.push(value);
    }

    if pos != bytes.len() {
        return Err(malformed());
    }
    Ok(Cursor { order, last_values })
}
