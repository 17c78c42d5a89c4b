//! The client-side transport seam that recording and replay plug into.
//!
//! A [`Channel`] is whatever the client under test makes calls through. An
//! [`Interceptor`] wraps a channel without the call site noticing, and
//! [`ChannelOptions`] is the bundle of interceptors a client is configured
//! with, in the role dial options play for a real RPC client.

use crate::status::{Code, Status};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ── CallContext ───────────────────────────────────────────────────────────────

/// Per-call metadata, deadline, and cancellation flag.
///
/// Clones share the cancellation flag, so cancelling any clone cancels the call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub metadata: BTreeMap<String, String>,
    pub deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

// ── Channel / ClientStream ────────────────────────────────────────────────────

pub trait Channel: Send + Sync {
    fn unary(&self, ctx: &CallContext, method: &str, request: &[u8]) -> Result<Vec<u8>, Status>;
    fn open_stream(&self, ctx: &CallContext, method: &str)
        -> Result<Box<dyn ClientStream>, Status>;
}

/// Client half of an open stream.
pub trait ClientStream: Send {
    fn send(&mut self, message: &[u8]) -> Result<(), Status>;
    fn close_send(&mut self) -> Result<(), Status>;
    /// Next message from the server, `Ok(None)` once the stream ended cleanly.
    fn recv(&mut self) -> Result<Option<Vec<u8>>, Status>;
}

// ── Interceptor / ChannelOptions ──────────────────────────────────────────────

/// Middleware around every call made through a channel. `next` is the channel
/// being wrapped; an interceptor may call it, or answer without it.
pub trait Interceptor: Send + Sync {
    fn unary(
        &self,
        ctx: &CallContext,
        method: &str,
        request: &[u8],
        next: &dyn Channel,
    ) -> Result<Vec<u8>, Status>;

    fn stream(
        &self,
        ctx: &CallContext,
        method: &str,
        next: &dyn Channel,
    ) -> Result<Box<dyn ClientStream>, Status>;
}

#[derive(Clone, Default)]
pub struct ChannelOptions {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interceptor. Earlier interceptors run outside later ones.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn extend(mut self, other: ChannelOptions) -> Self {
        self.interceptors.extend(other.interceptors);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Install the interceptors on `channel`.
    pub fn wrap(&self, channel: Arc<dyn Channel>) -> Arc<dyn Channel> {
        self.interceptors
            .iter()
            .rev()
            .fold(channel, |inner, interceptor| {
                let wrapped: Arc<dyn Channel> = Arc::new(InterceptedChannel {
                    inner,
                    interceptor: Arc::clone(interceptor),
                });
                wrapped
            })
    }
}

struct InterceptedChannel {
    inner: Arc<dyn Channel>,
    interceptor: Arc<dyn Interceptor>,
}

impl Channel for InterceptedChannel {
    fn unary(&self, ctx: &CallContext, method: &str, request: &[u8]) -> Result<Vec<u8>, Status> {
        self.interceptor
            .unary(ctx, method, request, self.inner.as_ref())
    }

    fn open_stream(
        &self,
        ctx: &CallContext,
        method: &str,
    ) -> Result<Box<dyn ClientStream>, Status> {
        self.interceptor.stream(ctx, method, self.inner.as_ref())
    }
}

/// A channel with nothing behind it. Every call fails with `UNAVAILABLE`.
pub struct DisconnectedChannel;

impl Channel for DisconnectedChannel {
    fn unary(&self, _ctx: &CallContext, method: &str, _request: &[u8]) -> Result<Vec<u8>, Status> {
        Err(Status::new(
            Code::Unavailable,
            format!("no connection for {method}"),
        ))
    }

    fn open_stream(
        &self,
        _ctx: &CallContext,
        method: &str,
    ) -> Result<Box<dyn ClientStream>, Status> {
        Err(Status::new(
            Code::Unavailable,
            format!("no connection for {method}"),
        ))
    }
}

// ── FakeChannel ───────────────────────────────────────────────────────────────

/// A scripted server-side stream for [`FakeChannel`].
#[derive(Debug, Clone, Default)]
pub struct FakeStreamScript {
    pub open: Option<Status>,
    pub receives: Vec<Result<Vec<u8>, Status>>,
    /// How the stream ends once `receives` is drained.
    pub end: Option<Status>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub method: String,
    pub request: Vec<u8>,
}

/// Channel double that answers from queued responses and remembers what it saw.
#[derive(Clone, Default)]
pub struct FakeChannel {
    unary_responses: Arc<Mutex<VecDeque<Result<Vec<u8>, Status>>>>,
    streams: Arc<Mutex<VecDeque<FakeStreamScript>>>,
    calls: Arc<Mutex<Vec<FakeCall>>>,
    sent: Arc<Mutex<Vec<FakeCall>>>,
}

impl FakeChannel {
    pub fn push_unary_response(&self, response: Result<Vec<u8>, Status>) {
        self.unary_responses.lock().push_back(response);
    }

    pub fn push_stream(&self, script: FakeStreamScript) {
        self.streams.lock().push_back(script);
    }

    /// Unary calls and stream opens, in order. Stream opens carry no request.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    /// Messages sent on streams, in order.
    pub fn sent(&self) -> Vec<FakeCall> {
        self.sent.lock().clone()
    }
}

impl Channel for FakeChannel {
    fn unary(&self, _ctx: &CallContext, method: &str, request: &[u8]) -> Result<Vec<u8>, Status> {
        self.calls.lock().push(FakeCall {
            method: method.to_string(),
            request: request.to_vec(),
        });
        self.unary_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Status::internal("no fake response queued")))
    }

    fn open_stream(
        &self,
        _ctx: &CallContext,
        method: &str,
    ) -> Result<Box<dyn ClientStream>, Status> {
        self.calls.lock().push(FakeCall {
            method: method.to_string(),
            request: Vec::new(),
        });
        let script = self
            .streams
            .lock()
            .pop_front()
            .ok_or_else(|| Status::internal("no fake stream queued"))?;
        if let Some(status) = script.open {
            return Err(status);
        }
        Ok(Box::new(FakeStream {
            method: method.to_string(),
            receives: script.receives.into(),
            end: script.end,
            finished: false,
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct FakeStream {
    method: String,
    receives: VecDeque<Result<Vec<u8>, Status>>,
    end: Option<Status>,
    finished: bool,
    sent: Arc<Mutex<Vec<FakeCall>>>,
}

impl ClientStream for FakeStream {
    fn send(&mut self, message: &[u8]) -> Result<(), Status> {
        self.sent.lock().push(FakeCall {
            method: self.method.clone(),
            request: message.to_vec(),
        });
        Ok(())
    }

    fn close_send(&mut self) -> Result<(), Status> {
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
        if self.finished {
            return Ok(None);
        }
        match self.receives.pop_front() {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(status)) => {
                self.finished = true;
                Err(status)
            }
            None => {
                self.finished = true;
                match self.end.take() {
                    Some(status) => Err(status),
                    None => Ok(None),
                }
            }
        }
    }
}
