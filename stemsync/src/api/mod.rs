//! HTTP API handlers for stemsync
//!
//! REST endpoints plus the SSE progress stream for separation jobs.

pub mod audio_info;
pub mod health;
pub mod separation;
pub mod stems;

pub use audio_info::audio_info_routes;
pub use health::health_routes;
pub use separation::separation_routes;
pub use stems::stem_routes;
