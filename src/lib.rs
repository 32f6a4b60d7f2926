#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Lease-based leader election for redundant KMS proxy instances.
//!
//! Many identical processes race for one time-bounded lease stored in a
//! shared backend. Exactly one of them at a time serves seal/unseal
//! traffic; the others reject requests and point callers at the leader.
//!
//! The pieces, leaves first:
//! - [`lease::LeaseManager`] turns "try to hold leadership" into
//!   read/create/update calls against a [`lease::LeaseBackend`].
//! - [`election::ElectionController`] runs the periodic election loop and
//!   owns the authoritative leadership state.
//! - [`election::CallbackBuilder`] wraps application hooks so a slow
//!   transition never stalls the loop.
//! - [`gate::LeadershipGate`] admits or rejects each request based on
//!   that state.

pub mod config;
pub mod election;
pub mod error;
pub mod gate;
pub mod health;
pub mod lease;

pub use config::ElectionConfig;
pub use election::{CallbackBuilder, ElectionController, ElectionMetrics, LeadershipCallbacks};
pub use error::{Error, Result};
pub use gate::{ActivationFlag, GateError, KmsService, LeadershipGate, LeadershipStatus};
pub use lease::{InMemoryLeaseBackend, LeaseBackend, LeaseDescriptor, LeaseKey, LeaseManager};
