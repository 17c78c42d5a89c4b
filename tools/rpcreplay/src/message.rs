//! Application messages and typed calls over a byte-level [`Channel`].
//!
//! The engine only ever sees encoded bytes. Any serde type is a [`Message`];
//! its canonical encoding is compact JSON, and two messages are equal when
//! their encodings are.

use crate::status::Status;
use crate::transport::{CallContext, Channel, ClientStream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

pub trait Message: Sized {
    fn encode(&self) -> Result<Vec<u8>, Status>;
    fn decode(bytes: &[u8]) -> Result<Self, Status>;
}

impl<T> Message for T
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self) -> Result<Vec<u8>, Status> {
        serde_json::to_vec(self).map_err(|e| Status::internal(format!("encode message: {e}")))
    }

    fn decode(bytes: &[u8]) -> Result<Self, Status> {
        serde_json::from_slice(bytes)
            .map_err(|e| Status::internal(format!("decode message: {e}")))
    }
}

/// Equality by canonical encoding. Messages that fail to encode are unequal.
pub fn messages_equal<M: Message>(a: &M, b: &M) -> bool {
    match (a.encode(), b.encode()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

pub fn invoke<Req, Resp>(
    channel: &dyn Channel,
    ctx: &CallContext,
    method: &str,
    request: &Req,
) -> Result<Resp, Status>
where
    Req: Message,
    Resp: Message,
{
    let bytes = channel.unary(ctx, method, &request.encode()?)?;
    Resp::decode(&bytes)
}

/// A stream whose messages are encoded and decoded on the way through.
pub struct TypedStream<Req, Resp> {
    inner: Box<dyn ClientStream>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Message, Resp: Message> TypedStream<Req, Resp> {
    pub fn open(channel: &dyn Channel, ctx: &CallContext, method: &str) -> Result<Self, Status> {
        Ok(Self {
            inner: channel.open_stream(ctx, method)?,
            _types: PhantomData,
        })
    }

    pub fn send(&mut self, message: &Req) -> Result<(), Status> {
        self.inner.send(&message.encode()?)
    }

    pub fn close_send(&mut self) -> Result<(), Status> {
        self.inner.close_send()
    }

    pub fn recv(&mut self) -> Result<Option<Resp>, Status> {
        match self.inner.recv()? {
            Some(bytes) => Resp::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Receive until the stream ends.
    pub fn recv_all(&mut self) -> Result<Vec<Resp>, Status> {
        let mut out = Vec::new();
        while let Some(message) = self.recv()? {
            out.push(message);
        }
        Ok(out)
    }
}
