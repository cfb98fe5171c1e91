//! # Replication
//!
//! Ownership coordination between replicas that observe the same trigger
//! sources. All access to the shared store goes through [`Coordinator`].

pub mod coordinator;
pub mod errors;
pub mod store;

pub use coordinator::{job_key, Coordinator, CoordinatorConfig, Ownership};
pub use errors::{ReplicationError, ReplicationResult};
pub use store::{
    AcquireOutcome, CoordinationStore, InMemoryCoordinationStore, LeaseState, OwnershipRecord,
};
