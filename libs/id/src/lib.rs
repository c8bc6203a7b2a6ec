//! # brig-id
//!
//! Typed identifiers used by the scheduler.
//!
//! ## Design Principles
//!
//! - IDs are assigned by the orchestration API; the scheduler never mints them
//! - IDs are opaque strings, but typed so a project ID can't be passed where an
//!   event ID is expected
//! - Every ID must be safe to embed in a URL path segment and in a queue name
//!
//! ## ID Format
//!
//! IDs are non-empty ASCII strings drawn from `[A-Za-z0-9_-]`. The `:`
//! character is reserved because job queue messages are encoded as
//! `<eventID>:<jobName>`, and `.` because queue names are
//! `<kind>.<projectID>`.
//!
//! Examples:
//! - `my-project`
//! - `2b4fa0f8-5c4e-4a4c-8c3d-8f1c1b5a6d7e`
//! - `build_linux`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::MAX_ID_LEN;
pub use types::*;
