//! Node runtime tying the ringmq components together.
//!
//! - [`Fabric`]: the explicitly constructed process context holding the
//!   membership table, transport and failure detector.
//! - [`NodeRuntime`]: one server or slave, with the messaging primitives
//!   from initialize through exit-check.
//! - [`SyncNode`]: the blocking primitive surface with literal return
//!   shapes (`bool`, counts or `-1`, `Option`s) for binding layers.
//! - [`NodeConfig`]: the TOML topology file read at initialize.

pub mod config;
pub mod error;
pub mod fabric;
pub mod runtime;
pub mod sync;

pub use config::NodeConfig;
pub use error::NodeError;
pub use fabric::Fabric;
pub use runtime::{NodeRuntime, Received, RuntimeState, SendReceipt};
pub use sync::SyncNode;
