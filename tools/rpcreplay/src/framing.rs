//! Length-prefixed records on a raw byte stream.
//!
//! Each record is a big-endian `u32` length followed by that many bytes. A
//! reader can tell a clean end of stream (no bytes where a prefix would start)
//! apart from a truncated record (a partial prefix, or a payload shorter than
//! its prefix claims).

use crate::errors::ReplayError;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::{ErrorKind, Read, Write};

pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Upper bound on a declared record length; anything larger is treated as a
/// corrupt prefix rather than an allocation request.
pub const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

pub fn write_record(w: &mut dyn Write, bytes: &[u8]) -> Result<(), ReplayError> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        ReplayError::EntryFormat(format!(
            "record of {} bytes exceeds the u32 length prefix",
            bytes.len()
        ))
    })?;
    w.write_u32::<BigEndian>(len)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read the next record, or `None` once the stream is cleanly exhausted.
pub fn read_record(r: &mut dyn Read) -> Result<Option<Vec<u8>>, ReplayError> {
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let filled = fill(r, &mut prefix)?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < LENGTH_PREFIX_BYTES {
        return Err(ReplayError::Truncated(format!(
            "got {filled} of {LENGTH_PREFIX_BYTES} length-prefix bytes"
        )));
    }
    let len = BigEndian::read_u32(&prefix) as usize;
    if len > MAX_RECORD_LEN {
        return Err(ReplayError::EntryFormat(format!(
            "declared record length {len} exceeds limit {MAX_RECORD_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    let got = fill(r, &mut payload)?;
    if got < len {
        return Err(ReplayError::Truncated(format!(
            "record declares {len} bytes but only {got} remain"
        )));
    }
    Ok(Some(payload))
}

// Like `read_exact`, but reports how far it got instead of failing at EOF.
fn fill(r: &mut dyn Read, buf: &mut [u8]) -> Result<usize, ReplayError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReplayError::Io(e.to_string())),
        }
    }
    Ok(filled)
}
