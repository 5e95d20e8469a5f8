//! Domain model (IDs, processor errors).

pub mod errors;
pub mod ids;

pub use errors::{ErrorKind, ProcessError};
pub use ids::{RunId, TaskId};
