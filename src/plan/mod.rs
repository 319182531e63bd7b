pub mod analyzer;
pub mod ownership;

pub use analyzer::{analyze, ConflictGraph};
pub use ownership::{assign, OwnershipAssignment, SharedResource, WorkerGroup};
