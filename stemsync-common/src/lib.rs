//! # stemsync Common Library
//!
//! Shared code for the stemsync service and its tooling:
//! - Error type shared across crates
//! - Bootstrap configuration (TOML) and root folder resolution
//! - Progress event types streamed to clients
//! - Server-Sent Events helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
pub use events::{ProgressEvent, StreamItem};
