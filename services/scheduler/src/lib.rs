//! brig Scheduler Library
//!
//! The scheduler consumes "start this Worker" and "start this Job" messages
//! from per-project queues, admits them against a global concurrency budget
//! computed from live pod state, and asks the orchestration API to start the
//! admitted workload.
//!
//! ## Architecture
//!
//! - **Pod synchronizers** (`sync`): list and watch Worker and Job pods,
//!   maintaining the set of pods that consume capacity
//! - **Capacity managers** (`capacity`): periodically offer one admission
//!   when below the ceiling
//! - **Project loop manager** (`projects`): one pair of consumer loops per
//!   project, reconciled against the project list
//! - **Consumer loops** (`consumer`): read, filter, wait for admission,
//!   start, acknowledge
//! - **Scheduler** (`scheduler`): wiring and bounded shutdown
//!
//! External systems sit behind traits: [`api::CoreApi`],
//! [`queue::QueueReaderFactory`] and [`substrate::PodSource`].

pub mod api;
pub mod capacity;
pub mod config;
pub mod consumer;
pub mod error;
pub mod projects;
pub mod queue;
pub mod scheduler;
pub mod substrate;
pub mod sync;

pub use config::{Config, SchedulerConfig};
pub use error::SchedulerError;
pub use scheduler::Scheduler;
