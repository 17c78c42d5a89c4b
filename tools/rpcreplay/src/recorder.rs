//! Recording side: persist every call made through a wrapped channel.
//!
//! A [`Recorder`] owns the single write side of a log. Its interceptor runs the
//! real call and appends REQUEST / SEND / RECEIVE / RESPONSE entries as events
//! happen. Index assignment and the write happen under one lock, so entries of
//! concurrent calls interleave without corrupting framing and every
//! continuation points at the right opening request.

use crate::entry::{write_entry, Entry, EntryKind, Payload};
use crate::errors::ReplayError;
use crate::header::write_header;
use crate::logging::append_run_log;
use crate::status::Status;
use crate::transport::{CallContext, Channel, ChannelOptions, ClientStream, Interceptor};
use parking_lot::Mutex;
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Hook run on each outgoing request or stream message before it is written to
/// the log. It edits the logged copy only; the live call still sends the
/// original bytes. Returning an error fails the call before it reaches the
/// server.
pub type BeforeWrite = Arc<dyn Fn(&str, &mut Vec<u8>) -> Result<(), Status> + Send + Sync>;

#[derive(Clone, Default)]
pub struct RecorderOptions {
    pub initial: Vec<u8>,
    pub before_write: Option<BeforeWrite>,
}

impl RecorderOptions {
    pub fn new(initial: impl Into<Vec<u8>>) -> Self {
        Self {
            initial: initial.into(),
            before_write: None,
        }
    }

    pub fn with_before_write<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &mut Vec<u8>) -> Result<(), Status> + Send + Sync + 'static,
    {
        self.before_write = Some(Arc::new(hook));
        self
    }
}

// ── Shared write state ────────────────────────────────────────────────────────

struct LogWriter<W> {
    sink: Option<W>,
    entries_written: u64,
}

struct RecorderState<W> {
    log: Mutex<LogWriter<W>>,
    before_write: Option<BeforeWrite>,
}

impl<W: Write> RecorderState<W> {
    /// Append one entry and return its 1-based index in the log.
    fn append(&self, entry: &Entry) -> Result<u64, ReplayError> {
        let mut log = self.log.lock();
        let sink = log.sink.as_mut().ok_or(ReplayError::RecorderClosed)?;
        write_entry(sink, entry)?;
        log.entries_written += 1;
        Ok(log.entries_written)
    }

    fn append_for_call(&self, entry: &Entry, method: &str) -> Result<u64, Status> {
        self.append(entry).map_err(|error| {
            append_run_log(
                "error",
                "recorder.write.failed",
                json!({
                    "method": method,
                    "kind": entry.kind.as_str(),
                    "error": error.to_string(),
                }),
            );
            Status::from(error)
        })
    }

    fn logged_copy(&self, method: &str, message: &[u8]) -> Result<Vec<u8>, Status> {
        let mut copy = message.to_vec();
        if let Some(hook) = &self.before_write {
            hook(method, &mut copy)?;
        }
        Ok(copy)
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────────

pub struct Recorder<W: Write + Send + 'static> {
    state: Arc<RecorderState<W>>,
}

impl Recorder<BufWriter<File>> {
    /// Create (or truncate) the log file at `path` and start recording into it.
    pub fn create(path: impl AsRef<Path>, options: RecorderOptions) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        append_run_log(
            "info",
            "recorder.file.created",
            json!({ "path": path.display().to_string() }),
        );
        Self::with_options(BufWriter::new(file), options)
    }
}

impl<W: Write + Send + 'static> Recorder<W> {
    /// Start recording into `writer`. The header is written immediately.
    pub fn new(writer: W, initial: &[u8]) -> Result<Self, ReplayError> {
        Self::with_options(writer, RecorderOptions::new(initial))
    }

    pub fn with_options(mut writer: W, options: RecorderOptions) -> Result<Self, ReplayError> {
        write_header(&mut writer, &options.initial)?;
        append_run_log(
            "info",
            "recorder.opened",
            json!({ "initial_bytes": options.initial.len() }),
        );
        Ok(Self {
            state: Arc::new(RecorderState {
                log: Mutex::new(LogWriter {
                    sink: Some(writer),
                    entries_written: 0,
                }),
                before_write: options.before_write,
            }),
        })
    }

    /// Connection options that record every call made through the channel
    /// they are installed on.
    pub fn options(&self) -> ChannelOptions {
        ChannelOptions::new().with_interceptor(Arc::new(RecordingInterceptor {
            state: Arc::clone(&self.state),
        }))
    }

    pub fn wrap(&self, channel: Arc<dyn Channel>) -> Arc<dyn Channel> {
        self.options().wrap(channel)
    }

    pub fn entries_written(&self) -> u64 {
        self.state.log.lock().entries_written
    }

    /// Flush and release the log. Any later write, including a second close,
    /// fails with [`ReplayError::RecorderClosed`].
    pub fn close(&self) -> Result<W, ReplayError> {
        let mut log = self.state.log.lock();
        let mut sink = log.sink.take().ok_or(ReplayError::RecorderClosed)?;
        sink.flush()?;
        append_run_log(
            "info",
            "recorder.closed",
            json!({ "entries": log.entries_written }),
        );
        Ok(sink)
    }
}

// ── RecordingInterceptor ──────────────────────────────────────────────────────

struct RecordingInterceptor<W> {
    state: Arc<RecorderState<W>>,
}

impl<W: Write + Send + 'static> Interceptor for RecordingInterceptor<W> {
    fn unary(
        &self,
        ctx: &CallContext,
        method: &str,
        request: &[u8],
        next: &dyn Channel,
    ) -> Result<Vec<u8>, Status> {
        let logged = self.state.logged_copy(method, request)?;
        let index = self
            .state
            .append_for_call(&Entry::request(method, Payload::Message(logged)), method)?;
        let result = next.unary(ctx, method, request);
        let response = Entry::continuation(
            EntryKind::Response,
            Payload::from_result(result.clone()),
            index,
        );
        self.state.append_for_call(&response, method)?;
        result
    }

    fn stream(
        &self,
        ctx: &CallContext,
        method: &str,
        next: &dyn Channel,
    ) -> Result<Box<dyn ClientStream>, Status> {
        let index = self
            .state
            .append_for_call(&Entry::request(method, Payload::empty()), method)?;
        match next.open_stream(ctx, method) {
            Ok(inner) => Ok(Box::new(RecordingStream {
                inner,
                state: Arc::clone(&self.state),
                method: method.to_string(),
                ref_index: index,
                finished: false,
            })),
            Err(status) => {
                let response =
                    Entry::continuation(EntryKind::Response, Payload::Error(status.clone()), index);
                self.state.append_for_call(&response, method)?;
                Err(status)
            }
        }
    }
}

struct RecordingStream<W: Write + Send + 'static> {
    inner: Box<dyn ClientStream>,
    state: Arc<RecorderState<W>>,
    method: String,
    ref_index: u64,
    finished: bool,
}

impl<W: Write + Send + 'static> RecordingStream<W> {
    fn record(&self, kind: EntryKind, payload: Payload) -> Result<(), Status> {
        let entry = Entry::continuation(kind, payload, self.ref_index);
        self.state.append_for_call(&entry, &self.method).map(|_| ())
    }
}

impl<W: Write + Send + 'static> ClientStream for RecordingStream<W> {
    fn send(&mut self, message: &[u8]) -> Result<(), Status> {
        let logged = self.state.logged_copy(&self.method, message)?;
        let result = self.inner.send(message);
        let payload = match &result {
            Ok(()) => Payload::Message(logged),
            Err(status) => Payload::Error(status.clone()),
        };
        self.record(EntryKind::Send, payload)?;
        result
    }

    fn close_send(&mut self) -> Result<(), Status> {
        self.inner.close_send()
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
        if self.finished {
            return self.inner.recv();
        }
        let result = self.inner.recv();
        match &result {
            Ok(Some(message)) => {
                self.record(EntryKind::Receive, Payload::Message(message.clone()))?
            }
            Ok(None) => {
                self.finished = true;
                self.record(EntryKind::Response, Payload::empty())?;
            }
            Err(status) => {
                self.finished = true;
                self.record(EntryKind::Response, Payload::Error(status.clone()))?;
            }
        }
        result
    }
}

// A client that stops receiving before end of stream still ends the call.
impl<W: Write + Send + 'static> Drop for RecordingStream<W> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.record(EntryKind::Response, Payload::empty());
        }
    }
}
