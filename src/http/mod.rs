//! HTTP/1.x connection engine.
//!
//! Turns a possibly fragmented byte stream into a sequence of requests,
//! hands each to an [`Application`](connection::Application), and frames
//! the responses back onto the same stream.
//!
//! # Architecture
//!
//! - **`reader`**: restartable cursor over discontiguous buffers
//! - **`input`**: pooled read buffers with consumed/examined bookkeeping
//! - **`parser`**: incremental start-line and header-block parser
//! - **`body`**: request body framing (none, fixed length, chunked)
//! - **`context`**: per-request state exposed to the application
//! - **`connection`**: the request loop and keep-alive decisions
//! - **`writer`**: response output with backpressure and abort handling
//! - **`timeout`**: deadlines and minimum data rates
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │    Idle     │ ← reset between requests
//!        └──────┬──────┘
//!               │ first byte
//!               ▼
//!        ┌──────────────────┐
//!        │ ReadingStartLine │
//!        └──────┬───────────┘
//!               ▼
//!        ┌──────────────────┐
//!        │  ReadingHeaders  │
//!        └──────┬───────────┘
//!               │ blank line
//!               ▼
//!        ┌──────────────────┐
//!        │   RequestReady   │ ← application runs
//!        └──────┬───────────┘
//!               │ first byte written
//!               ▼
//!        ┌────────────────────┐
//!        │ ResponseInProgress │
//!        └──────┬─────────────┘
//!               ▼
//!        ┌──────────────────┐
//!        │ ResponseComplete │
//!        └──────┬───────────┘
//!               ├─ Keep-Alive → Idle (same connection)
//!               └─ Close → Closed
//! ```
//!
//! Any state can move to `Closed` through an abort.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use keel::http::connection::{BoxFuture, Connection, app_fn};
//! use keel::http::context::HttpContext;
//! use keel::http::limits::Limits;
//! use tokio::net::TcpListener;
//!
//! fn hello(ctx: &mut HttpContext) -> BoxFuture<'_, anyhow::Result<()>> {
//!     Box::pin(async move {
//!         ctx.write(b"hello").await?;
//!         Ok(())
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let app = Arc::new(app_fn(hello));
//!     let limits = Arc::new(Limits::default());
//!
//!     loop {
//!         let (socket, _addr) = listener.accept().await?;
//!         let conn = Connection::new(socket, app.clone(), limits.clone());
//!         tokio::spawn(conn.run());
//!     }
//! }
//! ```

pub mod body;
pub mod cancel;
pub mod connection;
pub mod context;
pub mod error;
pub mod features;
pub mod headers;
pub mod input;
pub mod limits;
pub mod parser;
pub mod pool;
pub mod reader;
pub mod request;
pub mod response;
pub mod timeout;
pub mod writer;
