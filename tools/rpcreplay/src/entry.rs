//! Log entries: one framed record per event in the call timeline.
//!
//! Body layout, all integers big-endian:
//!
//! ```text
//! kind:u8 | method_len:u32 | method | ref_index:u64 | tag:u8 | payload
//! payload (tag 0) = len:u32 | message bytes
//! payload (tag 1) = code:u32 | len:u32 | message text
//! ```

use crate::errors::ReplayError;
use crate::framing::{read_record, write_record};
use crate::status::{Code, Status};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Opens a call: a unary request or the start of a stream.
    Request,
    /// Ends a call with its result or error.
    Response,
    /// A message the client sent on an open stream.
    Send,
    /// A message the client received on an open stream.
    Receive,
}

impl EntryKind {
    pub fn as_u8(self) -> u8 {
        match self {
            EntryKind::Request => 1,
            EntryKind::Response => 2,
            EntryKind::Send => 3,
            EntryKind::Receive => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EntryKind::Request),
            2 => Some(EntryKind::Response),
            3 => Some(EntryKind::Send),
            4 => Some(EntryKind::Receive),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Request => "REQUEST",
            EntryKind::Response => "RESPONSE",
            EntryKind::Send => "SEND",
            EntryKind::Receive => "RECEIVE",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either a serialized application message or the error the call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Message(Vec<u8>),
    Error(Status),
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Message(Vec::new())
    }

    pub fn from_result(result: Result<Vec<u8>, Status>) -> Self {
        match result {
            Ok(bytes) => Payload::Message(bytes),
            Err(status) => Payload::Error(status),
        }
    }

    pub fn into_result(self) -> Result<Vec<u8>, Status> {
        match self {
            Payload::Message(bytes) => Ok(bytes),
            Payload::Error(status) => Err(status),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error(_))
    }

    /// Messages match on bytes, errors on code and text; a message never
    /// matches an error.
    pub fn equivalent(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Message(a), Payload::Message(b)) => a == b,
            (Payload::Error(a), Payload::Error(b)) => a.code == b.code && a.message == b.message,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub method: String,
    pub payload: Payload,
    /// 1-based position of the entry this one answers or continues; 0 for none.
    pub ref_index: u64,
}

impl Entry {
    pub fn request(method: impl Into<String>, payload: Payload) -> Self {
        Self {
            kind: EntryKind::Request,
            method: method.into(),
            payload,
            ref_index: 0,
        }
    }

    pub fn continuation(kind: EntryKind, payload: Payload, ref_index: u64) -> Self {
        Self {
            kind,
            method: String::new(),
            payload,
            ref_index,
        }
    }

    pub fn equivalent(&self, other: &Entry) -> bool {
        self.kind == other.kind
            && self.method == other.method
            && self.ref_index == other.ref_index
            && self.payload.equivalent(&other.payload)
    }
}

const TAG_MESSAGE: u8 = 0;
const TAG_ERROR: u8 = 1;

pub fn encode_entry(entry: &Entry) -> Result<Vec<u8>, ReplayError> {
    let mut body = Vec::with_capacity(32 + entry.method.len());
    body.write_u8(entry.kind.as_u8())?;
    put_bytes(&mut body, entry.method.as_bytes())?;
    body.write_u64::<BigEndian>(entry.ref_index)?;
    match &entry.payload {
        Payload::Message(bytes) => {
            body.write_u8(TAG_MESSAGE)?;
            put_bytes(&mut body, bytes)?;
        }
        Payload::Error(status) => {
            body.write_u8(TAG_ERROR)?;
            body.write_u32::<BigEndian>(status.code.as_u32())?;
            put_bytes(&mut body, status.message.as_bytes())?;
        }
    }
    Ok(body)
}

pub fn decode_entry(body: &[u8]) -> Result<Entry, ReplayError> {
    let mut cursor = Cursor { data: body, pos: 0 };
    let raw_kind = cursor.u8()?;
    let kind = EntryKind::from_u8(raw_kind)
        .ok_or_else(|| ReplayError::EntryFormat(format!("unknown entry kind {raw_kind}")))?;
    let method = cursor.string("method")?;
    let ref_index = cursor.u64()?;
    let payload = match cursor.u8()? {
        TAG_MESSAGE => Payload::Message(cursor.bytes()?.to_vec()),
        TAG_ERROR => {
            let raw_code = cursor.u32()?;
            let code = Code::from_u32(raw_code).ok_or_else(|| {
                ReplayError::EntryFormat(format!("unknown status code {raw_code}"))
            })?;
            let message = cursor.string("error message")?;
            Payload::Error(Status { code, message })
        }
        tag => {
            return Err(ReplayError::EntryFormat(format!("unknown payload tag {tag}")));
        }
    };
    if cursor.remaining() != 0 {
        return Err(ReplayError::EntryFormat(format!(
            "{} trailing bytes after entry payload",
            cursor.remaining()
        )));
    }
    Ok(Entry {
        kind,
        method,
        payload,
        ref_index,
    })
}

pub fn write_entry(w: &mut dyn Write, entry: &Entry) -> Result<(), ReplayError> {
    let body = encode_entry(entry)?;
    write_record(w, &body)
}

/// Read the next entry, or `None` once the log is cleanly exhausted.
pub fn read_entry(r: &mut dyn Read) -> Result<Option<Entry>, ReplayError> {
    match read_record(r)? {
        Some(body) => decode_entry(&body).map(Some),
        None => Ok(None),
    }
}

fn put_bytes(body: &mut Vec<u8>, bytes: &[u8]) -> Result<(), ReplayError> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        ReplayError::EntryFormat(format!("field of {} bytes is too long", bytes.len()))
    })?;
    body.write_u32::<BigEndian>(len)?;
    body.extend_from_slice(bytes);
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ReplayError> {
        if self.remaining() < n {
            return Err(ReplayError::EntryFormat(format!(
                "entry body ends at byte {} but {n} more were expected",
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ReplayError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ReplayError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, ReplayError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    fn bytes(&mut self) -> Result<&'a [u8], ReplayError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self, field: &str) -> Result<String, ReplayError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| ReplayError::EntryFormat(format!("{field} is not UTF-8: {e}")))
    }
}
