//! Merge queue: scheduler, speculative lookahead and the CI seam.
//!
//! Per queue item the state machine is `queued -> running -> {merged |
//! failed}`.  Repositories are independent; within one repository items are
//! attempted strictly in enqueue order.  Failed items are not retried here;
//! retry is an explicit external re-enqueue.

pub mod ci;
pub mod lookahead;
pub mod merge;
pub mod scheduler;

pub use ci::{CiGate, CiVerdict, SimulatedCi};
pub use lookahead::{ChainedLookahead, NoopLookahead, SpeculativeRunner};
pub use merge::{GitMergeExecutor, IntegrationOutcome, MergeExecutor};
pub use scheduler::Scheduler;
