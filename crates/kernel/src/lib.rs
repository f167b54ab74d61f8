//! permgate kernel library
//!
//! Tiered permission-check cache (Moka L1, shared-store L2), coordinated
//! invalidation and resilience guards. The `permgate` binary wires these
//! into an ops server; services embed [`resolver::PermissionResolver`]
//! directly.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod listener;
pub mod metrics;
pub mod resilience;
pub mod resolver;
pub mod routes;
pub mod state;
pub mod store;
pub mod worker;
