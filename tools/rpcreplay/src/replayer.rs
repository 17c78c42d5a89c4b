//! Replay side: answer calls from a recorded log with no network I/O.
//!
//! The whole log is parsed up front into an arena of recorded calls indexed by
//! method. The index is never restructured after construction; serving a call
//! flips that call's `consumed` flag with a compare-and-swap, so concurrent
//! identical calls are each served a distinct recording, first recorded first.

use crate::entry::{read_entry, Entry, EntryKind, Payload};
use crate::errors::ReplayError;
use crate::header::read_header;
use crate::logging::append_run_log;
use crate::status::Status;
use crate::transport::{
    CallContext, Channel, ChannelOptions, ClientStream, DisconnectedChannel, Interceptor,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hook that rewrites a live request before it is matched against the log,
/// typically to undo the scrubbing applied at record time.
pub type BeforeMatch = Arc<dyn Fn(&str, &mut Vec<u8>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ReplayerOptions {
    pub before_match: Option<BeforeMatch>,
}

impl ReplayerOptions {
    pub fn with_before_match<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &mut Vec<u8>) + Send + Sync + 'static,
    {
        self.before_match = Some(Arc::new(hook));
        self
    }
}

/// A recorded call that no replayed call has claimed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub method: String,
    /// Log position of the call's opening REQUEST.
    pub index: u64,
}

// ── Call index ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct RecordedCall {
    method: String,
    request: Payload,
    index: u64,
    sends: Vec<Payload>,
    receives: Vec<Payload>,
    response: Option<Payload>,
    consumed: AtomicBool,
}

impl RecordedCall {
    fn matches(&self, request: &[u8]) -> bool {
        matches!(&self.request, Payload::Message(bytes) if bytes.as_slice() == request)
    }

    /// Streams are told apart by their first client message. A send that
    /// failed at record time kept no bytes and accepts any first message.
    fn matches_stream(&self, first_send: Option<&[u8]>) -> bool {
        if !self.matches(&[]) {
            return false;
        }
        match (self.sends.first(), first_send) {
            (Some(Payload::Message(recorded)), Some(sent)) => recorded.as_slice() == sent,
            (Some(Payload::Error(_)), Some(_)) => true,
            (None, None) => true,
            _ => false,
        }
    }

    /// A stream that failed without exchanging a message failed to open.
    fn failed_to_open(&self) -> bool {
        self.sends.is_empty()
            && self.receives.is_empty()
            && matches!(self.response, Some(Payload::Error(_)))
    }

    fn try_consume(&self) -> bool {
        self.consumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct CallIndex {
    calls: Vec<RecordedCall>,
    by_method: HashMap<String, Vec<usize>>,
}

impl CallIndex {
    fn build(entries: &[Entry]) -> Result<Self, ReplayError> {
        let mut calls: Vec<RecordedCall> = Vec::new();
        let mut by_method: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_request_index: HashMap<u64, usize> = HashMap::new();

        for (pos, entry) in entries.iter().enumerate() {
            let index = pos as u64 + 1;
            if entry.kind == EntryKind::Request {
                if entry.ref_index != 0 {
                    return Err(ReplayError::EntryFormat(format!(
                        "request #{index} has ref index {}",
                        entry.ref_index
                    )));
                }
                if entry.method.is_empty() {
                    return Err(ReplayError::EntryFormat(format!(
                        "request #{index} has no method"
                    )));
                }
                let slot = calls.len();
                calls.push(RecordedCall {
                    method: entry.method.clone(),
                    request: entry.payload.clone(),
                    index,
                    sends: Vec::new(),
                    receives: Vec::new(),
                    response: None,
                    consumed: AtomicBool::new(false),
                });
                by_request_index.insert(index, slot);
                by_method.entry(entry.method.clone()).or_default().push(slot);
                continue;
            }

            let slot = by_request_index.get(&entry.ref_index).copied().ok_or_else(|| {
                ReplayError::EntryFormat(format!(
                    "{} #{index} refers to #{}, which is not a request",
                    entry.kind, entry.ref_index
                ))
            })?;
            let call = &mut calls[slot];
            if call.response.is_some() {
                return Err(ReplayError::EntryFormat(format!(
                    "{} #{index} continues call #{} after its response",
                    entry.kind, call.index
                )));
            }
            match entry.kind {
                EntryKind::Response => call.response = Some(entry.payload.clone()),
                EntryKind::Send => call.sends.push(entry.payload.clone()),
                EntryKind::Receive => call.receives.push(entry.payload.clone()),
                EntryKind::Request => {}
            }
        }

        Ok(Self { calls, by_method })
    }

    /// Claim the first unconsumed call to `method` whose request is `request`.
    fn claim(&self, method: &str, request: &[u8]) -> Option<&RecordedCall> {
        self.claim_by(method, |call| call.matches(request))
    }

    /// Claim the first unconsumed call to `method` accepted by `accept`.
    fn claim_by<F>(&self, method: &str, accept: F) -> Option<&RecordedCall>
    where
        F: Fn(&RecordedCall) -> bool,
    {
        let slots = self.by_method.get(method)?;
        slots.iter().map(|&slot| &self.calls[slot]).find(|call| {
            !call.consumed.load(Ordering::Acquire) && accept(*call) && call.try_consume()
        })
    }

    fn next_unconsumed(&self, method: &str) -> Option<&RecordedCall> {
        let slots = self.by_method.get(method)?;
        slots
            .iter()
            .map(|&slot| &self.calls[slot])
            .find(|call| !call.consumed.load(Ordering::Acquire))
    }
}

// ── Replayer ──────────────────────────────────────────────────────────────────

struct ReplayerState {
    initial: Vec<u8>,
    entries: Vec<Entry>,
    index: CallIndex,
    before_match: Option<BeforeMatch>,
}

impl ReplayerState {
    fn normalize(&self, method: &str, request: &[u8]) -> Vec<u8> {
        let mut copy = request.to_vec();
        if let Some(hook) = &self.before_match {
            hook(method, &mut copy);
        }
        copy
    }

    fn claim(&self, method: &str, request: &[u8]) -> Result<&RecordedCall, ReplayError> {
        let request = self.normalize(method, request);
        self.index
            .claim(method, &request)
            .ok_or_else(|| unmatched(method, request.len()))
    }

    /// Claim a stream call by its first client message, already normalized.
    /// `None` claims a stream on which the client never sent anything.
    fn claim_stream(
        &self,
        method: &str,
        first_send: Option<&[u8]>,
    ) -> Result<&RecordedCall, ReplayError> {
        self.index
            .claim_by(method, |call| call.matches_stream(first_send))
            .ok_or_else(|| unmatched(method, first_send.map_or(0, <[u8]>::len)))
    }

    /// Claim the next call to `method` if it is a stream that failed to open.
    fn claim_open_failure(&self, method: &str) -> Option<Status> {
        let call = self.index.next_unconsumed(method)?;
        if !call.failed_to_open() || !call.try_consume() {
            return None;
        }
        match &call.response {
            Some(Payload::Error(status)) => Some(status.clone()),
            _ => None,
        }
    }

    fn answer_unary(&self, method: &str, request: &[u8]) -> Result<Payload, ReplayError> {
        let call = self.claim(method, request)?;
        call.response
            .clone()
            .ok_or_else(|| ReplayError::IncompleteCall {
                method: call.method.clone(),
                index: call.index,
            })
    }
}

fn unmatched(method: &str, request_bytes: usize) -> ReplayError {
    append_run_log(
        "warn",
        "replayer.unmatched_call",
        json!({ "method": method, "request_bytes": request_bytes }),
    );
    ReplayError::UnmatchedCall {
        method: method.to_string(),
    }
}

/// Serves calls from a recorded log.
///
/// Cheap to clone; clones share one index, so a call consumed through one
/// clone is gone for all of them.
#[derive(Clone)]
pub struct Replayer {
    state: Arc<ReplayerState>,
}

impl Replayer {
    pub fn new<R: Read>(reader: R) -> Result<Self, ReplayError> {
        Self::with_options(reader, ReplayerOptions::default())
    }

    /// Read and index the entire log. Any header, framing, entry, or
    /// correlation error fails construction.
    pub fn with_options<R: Read>(
        mut reader: R,
        options: ReplayerOptions,
    ) -> Result<Self, ReplayError> {
        let initial = read_header(&mut reader)?;
        let mut entries = Vec::new();
        while let Some(entry) = read_entry(&mut reader)? {
            entries.push(entry);
        }
        let index = CallIndex::build(&entries)?;
        append_run_log(
            "info",
            "replayer.loaded",
            json!({
                "initial_bytes": initial.len(),
                "entries": entries.len(),
                "calls": index.calls.len(),
            }),
        );
        Ok(Self {
            state: Arc::new(ReplayerState {
                initial,
                entries,
                index,
                before_match: options.before_match,
            }),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        Self::open_with_options(path, ReplayerOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: ReplayerOptions,
    ) -> Result<Self, ReplayError> {
        let file = File::open(path.as_ref())?;
        Self::with_options(BufReader::new(file), options)
    }

    /// The initial state passed to the recorder.
    pub fn initial(&self) -> &[u8] {
        &self.state.initial
    }

    /// Every entry in log order.
    pub fn entries(&self) -> &[Entry] {
        &self.state.entries
    }

    pub fn call_count(&self) -> usize {
        self.state.index.calls.len()
    }

    /// Answer a unary call. A recorded application error comes back as
    /// `Ok(Payload::Error(_))`; `Err` means the log cannot answer at all.
    pub fn answer_unary(&self, method: &str, request: &[u8]) -> Result<Payload, ReplayError> {
        self.state.answer_unary(method, request)
    }

    /// Recorded calls not yet served, in log order.
    pub fn unconsumed(&self) -> Vec<PendingCall> {
        self.state
            .index
            .calls
            .iter()
            .filter(|call| !call.consumed.load(Ordering::Acquire))
            .map(|call| PendingCall {
                method: call.method.clone(),
                index: call.index,
            })
            .collect()
    }

    /// Connection options that answer every call from the log. The wrapped
    /// channel is never called.
    pub fn options(&self) -> ChannelOptions {
        ChannelOptions::new().with_interceptor(Arc::new(ReplayingInterceptor {
            state: Arc::clone(&self.state),
        }))
    }

    /// A channel that needs no underlying connection.
    pub fn connection(&self) -> Arc<dyn Channel> {
        self.options().wrap(Arc::new(DisconnectedChannel))
    }
}

// ── ReplayingInterceptor ──────────────────────────────────────────────────────

struct ReplayingInterceptor {
    state: Arc<ReplayerState>,
}

impl Interceptor for ReplayingInterceptor {
    fn unary(
        &self,
        _ctx: &CallContext,
        method: &str,
        request: &[u8],
        _next: &dyn Channel,
    ) -> Result<Vec<u8>, Status> {
        self.state.answer_unary(method, request)?.into_result()
    }

    fn stream(
        &self,
        _ctx: &CallContext,
        method: &str,
        _next: &dyn Channel,
    ) -> Result<Box<dyn ClientStream>, Status> {
        if let Some(status) = self.state.claim_open_failure(method) {
            return Err(status);
        }
        Ok(Box::new(ReplayStream {
            state: Arc::clone(&self.state),
            method: method.to_string(),
            call: None,
        }))
    }
}

/// A replayed stream. The recorded call is claimed on the first send, or on
/// the first close-send or receive when the client sends nothing.
struct ReplayStream {
    state: Arc<ReplayerState>,
    method: String,
    call: Option<ClaimedStream>,
}

struct ClaimedStream {
    method: String,
    index: u64,
    sends: VecDeque<Payload>,
    receives: VecDeque<Payload>,
    response: Option<Payload>,
}

impl ClaimedStream {
    fn new(call: &RecordedCall) -> Self {
        Self {
            method: call.method.clone(),
            index: call.index,
            sends: call.sends.iter().cloned().collect(),
            receives: call.receives.iter().cloned().collect(),
            response: call.response.clone(),
        }
    }
}

impl ReplayStream {
    fn claimed(&mut self, first_send: Option<&[u8]>) -> Result<&mut ClaimedStream, Status> {
        let claimed = match self.call.take() {
            Some(claimed) => claimed,
            None => ClaimedStream::new(self.state.claim_stream(&self.method, first_send)?),
        };
        Ok(self.call.insert(claimed))
    }
}

impl ClientStream for ReplayStream {
    fn send(&mut self, message: &[u8]) -> Result<(), Status> {
        let sent = self.state.normalize(&self.method, message);
        let call = self.claimed(Some(sent.as_slice()))?;
        match call.sends.pop_front() {
            Some(Payload::Message(recorded)) if recorded == sent => Ok(()),
            Some(Payload::Message(recorded)) => {
                append_run_log(
                    "warn",
                    "replayer.send_mismatch",
                    json!({
                        "method": call.method,
                        "index": call.index,
                        "recorded_bytes": recorded.len(),
                        "sent_bytes": sent.len(),
                    }),
                );
                Err(Status::failed_precondition(format!(
                    "rpcreplay: message sent on {} (call #{}) differs from the recording",
                    call.method, call.index
                )))
            }
            Some(Payload::Error(status)) => Err(status),
            None => Err(Status::failed_precondition(format!(
                "rpcreplay: no more recorded sends for {} (call #{})",
                call.method, call.index
            ))),
        }
    }

    fn close_send(&mut self) -> Result<(), Status> {
        self.claimed(None).map(|_| ())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
        let call = self.claimed(None)?;
        if let Some(payload) = call.receives.pop_front() {
            return payload.into_result().map(Some);
        }
        match &call.response {
            Some(Payload::Message(_)) => Ok(None),
            Some(Payload::Error(status)) => Err(status.clone()),
            None => Err(Status::from(ReplayError::IncompleteCall {
                method: call.method.clone(),
                index: call.index,
            })),
        }
    }
}
