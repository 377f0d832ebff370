//! Message Queue Registry.
//!
//! Named inbound queues (handles, identified by [`MsgId`](ringmq_types::MsgId))
//! opened by a node runtime, the shared inbox a server drains without a
//! handle, and the pending-reply table that matches REPLY packets to the
//! requests that caused them.
//!
//! Every handle has its own lock; `close` is linearizable with respect to
//! `enqueue`, `dequeue` and request registration on the same handle, and it
//! wakes every waiter with [`QueueError::Closed`].

mod error;
mod registry;
mod wait;


pub use error::QueueError;
pub use registry::{QueueConfig, QueueRegistry, routing_key};
pub use wait::Wait;
