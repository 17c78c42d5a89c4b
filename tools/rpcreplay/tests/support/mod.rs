#![allow(dead_code)]

use parking_lot::Mutex;
use rpcreplay::{CallContext, Channel, ClientStream, Code, Message, Status};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub const SET: &str = "/intstore.IntStore/Set";
pub const GET: &str = "/intstore.IntStore/Get";
pub const INCR: &str = "/intstore.IntStore/Incr";
pub const LIST_ITEMS: &str = "/intstore.IntStore/ListItems";
pub const SET_STREAM: &str = "/intstore.IntStore/SetStream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub value: i64,
}

impl Item {
    pub fn new(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub name: String,
}

impl GetRequest {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetResponse {
    pub prev_value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItemsRequest {}

/// In-memory integer store served over a [`Channel`].
#[derive(Clone, Default)]
pub struct IntStore {
    items: Arc<Mutex<BTreeMap<String, i64>>>,
}

impl IntStore {
    fn set(&self, item: Item) -> SetResponse {
        let prev_value = self.items.lock().insert(item.name, item.value).unwrap_or(0);
        SetResponse { prev_value }
    }
}

impl Channel for IntStore {
    fn unary(&self, _ctx: &CallContext, method: &str, request: &[u8]) -> Result<Vec<u8>, Status> {
        match method {
            SET => self.set(Item::decode(request)?).encode(),
            GET => {
                let req = GetRequest::decode(request)?;
                let value = self.items.lock().get(&req.name).copied();
                match value {
                    Some(value) => Item::new(&req.name, value).encode(),
                    None => Err(Status::not_found(req.name)),
                }
            }
            INCR => {
                let req = GetRequest::decode(request)?;
                let mut items = self.items.lock();
                let value = items.entry(req.name.clone()).or_insert(0);
                *value += 1;
                Item::new(&req.name, *value).encode()
            }
            _ => Err(Status::new(Code::Unimplemented, method.to_string())),
        }
    }

    fn open_stream(
        &self,
        _ctx: &CallContext,
        method: &str,
    ) -> Result<Box<dyn ClientStream>, Status> {
        match method {
            LIST_ITEMS | SET_STREAM => Ok(Box::new(IntStoreStream {
                store: self.clone(),
                method: method.to_string(),
                outgoing: None,
                stored: 0,
            })),
            _ => Err(Status::new(Code::Unimplemented, method.to_string())),
        }
    }
}

struct IntStoreStream {
    store: IntStore,
    method: String,
    outgoing: Option<VecDeque<Vec<u8>>>,
    stored: u64,
}

impl ClientStream for IntStoreStream {
    fn send(&mut self, message: &[u8]) -> Result<(), Status> {
        if self.method == SET_STREAM {
            self.store.set(Item::decode(message)?);
            self.stored += 1;
        } else {
            ListItemsRequest::decode(message)?;
        }
        Ok(())
    }

    fn close_send(&mut self) -> Result<(), Status> {
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
        if self.outgoing.is_none() {
            let mut outgoing = VecDeque::new();
            if self.method == SET_STREAM {
                outgoing.push_back(Summary { count: self.stored }.encode()?);
            } else {
                let items = self.store.items.lock().clone();
                for (name, value) in items {
                    outgoing.push_back(Item::new(&name, value).encode()?);
                }
            }
            self.outgoing = Some(outgoing);
        }
        Ok(self.outgoing.as_mut().and_then(VecDeque::pop_front))
    }
}
