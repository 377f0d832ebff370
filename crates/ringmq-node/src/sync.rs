//! Blocking primitive surface.
//!
//! [`SyncNode`] drives a [`NodeRuntime`] on a tokio runtime handle and
//! flattens every result into the shapes a binding layer expects: `bool`,
//! a receiver count or `-1`, and `Option`s. The error behind the most
//! recent failure stays available through [`SyncNode::last_error`].
//!
//! Calls block the current thread and must not be made from inside an
//! async task.

use std::path::Path;
use std::sync::{Arc, Mutex};

use ringmq_queue::Wait;
use ringmq_types::MsgId;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::NodeError;
use crate::fabric::Fabric;
use crate::runtime::NodeRuntime;

/// A [`NodeRuntime`] behind synchronous calls.
pub struct SyncNode {
    runtime: NodeRuntime,
    handle: Handle,
    last_error: Mutex<Option<NodeError>>,
}

impl SyncNode {
    /// Create an uninitialized node on `fabric`, running its async work on
    /// `handle`.
    pub fn new(fabric: Arc<Fabric>, handle: Handle) -> Self {
        Self {
            runtime: NodeRuntime::new(fabric),
            handle,
            last_error: Mutex::new(None),
        }
    }

    /// The wrapped runtime.
    pub fn runtime(&self) -> &NodeRuntime {
        &self.runtime
    }

    /// Error behind the most recent failed call, if any.
    pub fn last_error(&self) -> Option<NodeError> {
        self.last_error.lock().expect("last error lock poisoned").clone()
    }

    pub fn initialize_on_server(&self, path: &Path, auto_rejoin: bool) -> bool {
        let result = self
            .handle
            .block_on(self.runtime.initialize_on_server(path, auto_rejoin));
        self.record(result).is_some()
    }

    pub fn initialize_on_slave(&self, path: &Path, auto_rejoin: bool) -> bool {
        let result = self
            .handle
            .block_on(self.runtime.initialize_on_slave(path, auto_rejoin));
        self.record(result).is_some()
    }

    /// Open a handle, returned in its fixed-width byte form.
    pub fn open(&self) -> Option<[u8; MsgId::WIDTH]> {
        self.record(self.runtime.open()).map(|msgid| msgid.to_bytes())
    }

    pub fn close(&self, handle: &[u8]) -> bool {
        self.record(self.runtime.close(MsgId::from_slice(handle))).is_some()
    }

    /// Returns the receiver count, or `-1` on failure.
    pub fn send(&self, handle: &[u8], body: &[u8], routing: bool) -> i64 {
        let msgid = MsgId::from_slice(handle);
        let body = body.to_vec();
        let result = self.handle.block_on(self.runtime.send(msgid, body, routing));
        self.record(result).map_or(-1, |receipt| receipt.receivers as i64)
    }

    /// Returns the number of servers that enqueued the packet, or `-1`.
    pub fn broadcast(&self, handle: &[u8], body: &[u8]) -> i64 {
        let msgid = MsgId::from_slice(handle);
        let body = body.to_vec();
        let result = self.handle.block_on(self.runtime.broadcast(msgid, body));
        self.record(result).map_or(-1, |receipt| receipt.receivers as i64)
    }

    /// Answer a packet; `reference` is the opaque ref from [`SyncNode::receive`].
    pub fn reply(&self, reference: &[u8], body: &[u8]) -> bool {
        let body = body.to_vec();
        let result = self.handle.block_on(self.runtime.reply_bytes(reference, body));
        self.record(result).is_some()
    }

    /// Take the next packet as `(ref, body)`.
    ///
    /// `timeout_ms` of `0` polls and a negative value waits until a packet
    /// arrives or the handle closes. `None` on timeout, close or error.
    pub fn receive(&self, handle: Option<&[u8]>, timeout_ms: i64) -> Option<(Vec<u8>, Vec<u8>)> {
        let msgid = handle.map(MsgId::from_slice);
        let result = self
            .handle
            .block_on(self.runtime.receive(msgid, Wait::from_millis(timeout_ms)));
        self.record(result)
            .map(|received| (received.reply_ref.to_bytes(), received.body.to_vec()))
    }

    pub fn is_exiting(&self) -> bool {
        self.runtime.is_exiting()
    }

    /// Leave the fabric and stop the heartbeat task.
    pub fn shutdown(&self) {
        self.handle.block_on(self.runtime.shutdown());
    }

    fn record<T>(&self, result: Result<T, NodeError>) -> Option<T> {
        let mut last = self.last_error.lock().expect("last error lock poisoned");
        match result {
            Ok(value) => {
                *last = None;
                Some(value)
            }
            Err(e) => {
                if !e.is_timeout() {
                    debug!(code = e.code(), error = %e, "primitive call failed");
                }
                *last = Some(e);
                None
            }
        }
    }
}

impl std::fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncNode")
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}
