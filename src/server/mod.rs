//! Socket-facing pieces around the engine
//!
//! Accept loop, the shared timeout sweep and a small compile-time router.

pub mod heartbeat;
pub mod listener;
pub mod router;

pub use heartbeat::Heartbeat;
pub use router::Router;
