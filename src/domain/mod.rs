//! Domain layer - Pure business logic.

pub mod av;
pub mod error;
pub mod jobs;
