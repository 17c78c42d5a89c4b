//! The first record of every log: magic token plus the caller's initial state.

use crate::errors::ReplayError;
use crate::framing::{read_record, write_record};
use std::io::{Read, Write};

/// Magic bytes at the start of the header record.
pub const MAGIC: &[u8] = b"RPCReplay";

pub fn write_header(w: &mut dyn Write, initial: &[u8]) -> Result<(), ReplayError> {
    let mut record = Vec::with_capacity(MAGIC.len() + initial.len());
    record.extend_from_slice(MAGIC);
    record.extend_from_slice(initial);
    write_record(w, &record)
}

/// Read the header record and return the initial state that follows the magic.
pub fn read_header(r: &mut dyn Read) -> Result<Vec<u8>, ReplayError> {
    let record = match read_record(r) {
        Ok(Some(record)) => record,
        Ok(None) => return Err(ReplayError::HeaderFormat("empty log".to_string())),
        Err(ReplayError::Io(detail)) => return Err(ReplayError::Io(detail)),
        Err(other) => {
            return Err(ReplayError::HeaderFormat(format!("unreadable header: {other}")))
        }
    };
    if record.len() < MAGIC.len() {
        return Err(ReplayError::HeaderFormat(format!(
            "header record of {} bytes is shorter than the magic",
            record.len()
        )));
    }
    let (magic, initial) = record.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(ReplayError::HeaderFormat(format!(
            "bad magic {:?}",
            String::from_utf8_lossy(magic)
        )));
    }
    Ok(initial.to_vec())
}
