//! Service layer for the execflow control plane.
//!
//! Services own run lifecycles and sit between the HTTP handlers and the
//! event store.

pub mod run_manager;

pub use run_manager::{ManagerError, RunManager, Subscription};
