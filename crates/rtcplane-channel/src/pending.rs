use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RequestError;
use crate::message::Method;

pub(crate) type ResponseSender = oneshot::Sender<Result<Value, RequestError>>;

/// Hands out request ids in `1..=u32::MAX`.
///
/// Wraps to 1 after `u32::MAX`, never yields 0 and skips ids still in use.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    last: u32,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose next candidate is `last + 1`.
    pub fn starting_after(last: u32) -> Self {
        Self { last }
    }

    /// Next id for which `in_use` is false.
    pub fn next(&mut self, in_use: impl Fn(u32) -> bool) -> u32 {
        loop {
            self.last = if self.last == u32::MAX {
                1
            } else {
                self.last + 1
            };
            if !in_use(self.last) {
                return self.last;
            }
        }
    }
}

pub(crate) struct PendingRequest {
    pub(crate) method: Method,
    pub(crate) sender: ResponseSender,
}

/// In-flight requests keyed by id.
#[derive(Default)]
pub(crate) struct PendingRequests {
    ids: RequestIdAllocator,
    requests: HashMap<u32, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn allocate_id(&mut self) -> u32 {
        let requests = &self.requests;
        self.ids.next(|id| requests.contains_key(&id))
    }

    pub(crate) fn insert(&mut self, id: u32, method: Method, sender: ResponseSender) {
        self.requests.insert(id, PendingRequest { method, sender });
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<PendingRequest> {
        self.requests.remove(&id)
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingRequest> {
        self.requests.drain().map(|(_, request)| request).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}
