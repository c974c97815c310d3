//! Data models for stemsync

pub mod job;
pub mod mode;
pub mod separation;

pub use job::{Job, JobState, StateTransition};
pub use mode::{Mode, ModeProfile, PROFILE_SAMPLE_RATE};
pub use separation::{SeparationResult, StemResult};
