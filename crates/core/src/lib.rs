//! `jobhost-core`: shared building blocks for the job host.
//!
//! This crate contains identifiers, the clock abstraction and the core error
//! type. It carries no storage or runtime concerns.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{add_duration, to_time_delta, Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use id::{MessageId, TaskId, WorkerId};
