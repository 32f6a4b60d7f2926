// Lease coordination for leader election
//
// A lease is a named, time-bounded exclusivity claim kept in a shared
// backend and renewed periodically by its holder:
// - `descriptor` is the unit of coordination as stored in the backend
// - `backend` abstracts Get / Create / Update against that store
// - `manager` decides eligibility and performs the read-modify-write

pub mod backend;
pub mod descriptor;
#[cfg(feature = "kubernetes")]
pub mod kubernetes;
pub mod manager;

pub use backend::{BackendError, InMemoryLeaseBackend, LeaseBackend};
pub use descriptor::{LeaseDescriptor, LeaseKey};
#[cfg(feature = "kubernetes")]
pub use kubernetes::KubernetesLeaseBackend;
pub use manager::LeaseManager;
