//! Keel - HTTP/1.x connection engine
//!
//! Incremental request parsing, connection lifecycle and timeout control,
//! and backpressured response output over any duplex byte transport.

pub mod config;
pub mod http;
pub mod server;
