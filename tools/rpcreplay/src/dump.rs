//! Human and machine readable views of a log, for debugging recordings.

use crate::entry::{read_entry, Entry, EntryKind, Payload};
use crate::errors::ReplayError;
use crate::header::read_header;
use crate::status::Status;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOptions {
    /// Payloads longer than this print as a size and digest.
    pub max_payload_bytes: usize,
    pub show_initial: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            show_initial: true,
        }
    }
}

/// Print the log read from `reader` as text, one line per entry.
pub fn fprint(
    out: &mut dyn Write,
    reader: &mut dyn Read,
    options: &DumpOptions,
) -> Result<(), ReplayError> {
    let initial = read_header(reader)?;
    if options.show_initial {
        writeln!(
            out,
            "initial state: {}",
            render_bytes(&initial, options.max_payload_bytes)
        )?;
    }
    let mut index = 0u64;
    while let Some(entry) = read_entry(reader)? {
        index += 1;
        writeln!(
            out,
            "#{index} {} method={} ref={} {}",
            entry.kind,
            entry.method,
            entry.ref_index,
            render_payload(&entry.payload, options.max_payload_bytes)
        )?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct JsonHeader {
    initial: String,
    initial_bytes: usize,
}

#[derive(Debug, Serialize)]
struct JsonEntry<'a> {
    index: u64,
    kind: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    method: &'a str,
    ref_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a Status>,
}

/// Print the log as JSON lines: the header first, then one object per entry.
pub fn fprint_json(
    out: &mut dyn Write,
    reader: &mut dyn Read,
    options: &DumpOptions,
) -> Result<(), ReplayError> {
    let initial = read_header(reader)?;
    write_json_line(
        out,
        &JsonHeader {
            initial: render_bytes(&initial, options.max_payload_bytes),
            initial_bytes: initial.len(),
        },
    )?;
    let mut index = 0u64;
    while let Some(entry) = read_entry(reader)? {
        index += 1;
        let (message, message_bytes, error) = match &entry.payload {
            Payload::Message(bytes) => (
                Some(render_bytes(bytes, options.max_payload_bytes)),
                Some(bytes.len()),
                None,
            ),
            Payload::Error(status) => (None, None, Some(status)),
        };
        write_json_line(
            out,
            &JsonEntry {
                index,
                kind: entry.kind.as_str(),
                method: &entry.method,
                ref_index: entry.ref_index,
                message,
                message_bytes,
                error,
            },
        )?;
    }
    Ok(())
}

fn write_json_line<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<(), ReplayError> {
    let line = serde_json::to_string(value).map_err(|e| ReplayError::Io(e.to_string()))?;
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    Ok(())
}

// ── Summary ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodSummary {
    pub method: String,
    pub calls: u64,
    /// Calls whose RESPONSE carries an error.
    pub errors: u64,
    pub sends: u64,
    pub receives: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub initial_bytes: usize,
    pub entries: u64,
    /// In order of each method's first call.
    pub methods: Vec<MethodSummary>,
}

impl LogSummary {
    pub fn method(&self, method: &str) -> Option<&MethodSummary> {
        self.methods.iter().find(|summary| summary.method == method)
    }
}

/// Count calls per method. Fails on entries that refer to no request.
pub fn summarize(reader: &mut dyn Read) -> Result<LogSummary, ReplayError> {
    let initial = read_header(reader)?;
    let mut summary = LogSummary {
        initial_bytes: initial.len(),
        ..LogSummary::default()
    };
    let mut slot_by_method: HashMap<String, usize> = HashMap::new();
    let mut slot_by_request: HashMap<u64, usize> = HashMap::new();

    while let Some(entry) = read_entry(reader)? {
        summary.entries += 1;
        let index = summary.entries;
        let slot = match entry.kind {
            EntryKind::Request => {
                let slot = *slot_by_method
                    .entry(entry.method.clone())
                    .or_insert_with(|| {
                        summary.methods.push(MethodSummary {
                            method: entry.method.clone(),
                            ..MethodSummary::default()
                        });
                        summary.methods.len() - 1
                    });
                slot_by_request.insert(index, slot);
                slot
            }
            _ => slot_by_request
                .get(&entry.ref_index)
                .copied()
                .ok_or_else(|| dangling(&entry, index))?,
        };
        let counts = &mut summary.methods[slot];
        match entry.kind {
            EntryKind::Request => counts.calls += 1,
            EntryKind::Response if entry.payload.is_error() => counts.errors += 1,
            EntryKind::Response => {}
            EntryKind::Send => counts.sends += 1,
            EntryKind::Receive => counts.receives += 1,
        }
    }
    Ok(summary)
}

fn dangling(entry: &Entry, index: u64) -> ReplayError {
    ReplayError::EntryFormat(format!(
        "{} #{index} refers to #{}, which is not a request",
        entry.kind, entry.ref_index
    ))
}

/// Print a summary as an aligned table.
pub fn fprint_summary(out: &mut dyn Write, summary: &LogSummary) -> Result<(), ReplayError> {
    writeln!(
        out,
        "{} entries, {} bytes of initial state",
        summary.entries, summary.initial_bytes
    )?;
    let width = summary
        .methods
        .iter()
        .map(|m| m.method.len())
        .max()
        .unwrap_or(0)
        .max("METHOD".len());
    writeln!(
        out,
        "{:<width$}  {:>6}  {:>6}  {:>6}  {:>8}",
        "METHOD", "CALLS", "ERRORS", "SENDS", "RECEIVES"
    )?;
    for m in &summary.methods {
        writeln!(
            out,
            "{:<width$}  {:>6}  {:>6}  {:>6}  {:>8}",
            m.method, m.calls, m.errors, m.sends, m.receives
        )?;
    }
    Ok(())
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn render_payload(payload: &Payload, max_bytes: usize) -> String {
    match payload {
        Payload::Message(bytes) => render_bytes(bytes, max_bytes),
        Payload::Error(status) => format!("error code={} desc={:?}", status.code, status.message),
    }
}

/// UTF-8 renders quoted, anything else as hex; oversized payloads as
/// `<N bytes sha256:XXXXXXXXXXXXXXXX>`.
fn render_bytes(bytes: &[u8], max_bytes: usize) -> String {
    if bytes.len() > max_bytes {
        let hash = Sha256::digest(bytes);
        return format!("<{} bytes sha256:{}>", bytes.len(), hex_bytes(&hash[..8]));
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => format!("{text:?}"),
        Err(_) => format!("0x{}", hex_bytes(bytes)),
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
