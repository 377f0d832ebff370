//! Cluster membership and failure detection.
//!
//! This crate provides:
//!
//! - [`MembershipTable`]: the single source of truth for routing, holding every
//!   known node, its state, and the versioned ring built from the active
//!   servers.
//! - [`Snapshot`]: an immutable copy-on-write view of the table, read
//!   without taking the table's lock.
//! - [`detector`]: the background task that turns missed heartbeats into
//!   SUSPECT/DOWN transitions.

pub mod detector;
mod error;
mod table;


pub use detector::DetectorHandle;
pub use error::MembershipError;
pub use table::{MembershipConfig, MembershipTable, Snapshot};
