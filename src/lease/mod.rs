//! Repository lease management.
//!
//! A repository is either materialized on local disk or recoverable from a
//! bundle in blob storage.  At most one mutating operation may hold it at a
//! time, across every instance of the service.  The lease manager hides
//! that state machine: callers acquire a lease, work against the local bare
//! repo it points at, and release it with a flag saying whether the repo
//! changed.

pub mod locks;
pub mod manager;

pub use locks::{Coordinator, KeydbCoordinator, LocalCoordinator};
pub use manager::{LeaseManager, LeaseMode, RepositoryLease};
