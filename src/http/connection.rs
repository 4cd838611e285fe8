use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};

use crate::http::cancel::{AbortReason, CancellationToken};
use crate::http::context::HttpContext;
use crate::http::error::HttpError;
use crate::http::limits::Limits;
use crate::http::pool::MemoryPool;
use crate::http::response::StatusCode;
use crate::http::timeout::TimeoutControl;
use crate::http::writer::TransportControl;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Consumer of parsed requests.
///
/// The application reads the request and writes the response through the
/// context. Returning `Err` before the response started produces a 500;
/// after that it aborts the connection.
pub trait Application: Send + Sync {
    fn process_request<'a>(&'a self, ctx: &'a mut HttpContext) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Adapts a plain function into an [`Application`].
pub struct AppFn<F>(F);

pub fn app_fn<F>(f: F) -> AppFn<F>
where
    F: for<'a> Fn(&'a mut HttpContext) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync,
{
    AppFn(f)
}

impl<F> Application for AppFn<F>
where
    F: for<'a> Fn(&'a mut HttpContext) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync,
{
    fn process_request<'a>(&'a self, ctx: &'a mut HttpContext) -> BoxFuture<'a, anyhow::Result<()>> {
        (self.0)(ctx)
    }
}

const BASE32: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Process-unique connection identifier, rendered as 13 base-32 digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Next identifier. The sequence is seeded from the clock on first use.
    pub fn next() -> Self {
        static NEXT: OnceLock<AtomicU64> = OnceLock::new();
        let counter = NEXT.get_or_init(|| {
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default();
            AtomicU64::new(seed)
        });
        ConnectionId(counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; 13];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 60 - 5 * i as u32;
            *slot = BASE32[((self.0 >> shift) & 31) as usize];
        }
        // The alphabet is ASCII.
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

/// Drives one transport through any number of requests.
pub struct Connection<A: Application> {
    id: ConnectionId,
    ctx: HttpContext,
    app: Arc<A>,
}

impl<A: Application> Connection<A> {
    pub fn new<T>(transport: T, app: Arc<A>, limits: Arc<Limits>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_pool(transport, app, limits, MemoryPool::default())
    }

    pub fn with_pool<T>(transport: T, app: Arc<A>, limits: Arc<Limits>, pool: MemoryPool) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = ConnectionId::next();
        let (reader, writer) = tokio::io::split(transport);
        let ctx = HttpContext::new(id.to_string(), Box::new(reader), Box::new(writer), pool, limits);
        Self { id, ctx, app }
    }

    pub fn with_transport_control(mut self, control: Arc<dyn TransportControl>) -> Self {
        self.ctx.set_transport_control(control);
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.ctx.set_remote_addr(Some(addr));
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn context(&self) -> &HttpContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut HttpContext {
        &mut self.ctx
    }

    /// Handle for an external timeout sweep.
    pub fn timeout_control(&self) -> TimeoutControl {
        self.ctx.timeout_control().clone()
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.ctx.request_aborted()
    }

    /// Serves requests until the peer closes, a request is rejected or the
    /// connection is aborted.
    pub async fn run(mut self) -> anyhow::Result<()> {
        debug!(connection_id = %self.id, "connection started");
        let result = self.process_requests().await;
        self.ctx.dispose().await;
        debug!(connection_id = %self.id, "connection closed");
        result
    }

    async fn process_requests(&mut self) -> anyhow::Result<()> {
        loop {
            self.ctx.reset();

            match self.ctx.read_request_head().await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => return self.on_head_error(e).await,
            }

            let result = self.app.process_request(&mut self.ctx).await;

            if let Some(reason) = self.ctx.abort_reason() {
                self.ctx.abort_with(reason);
                return Ok(());
            }

            if let Some(rejection) = self.ctx.rejection().cloned() {
                self.ctx.reject(&rejection).await;
                return Ok(());
            }

            if let Err(e) = result {
                if self.ctx.response_started() {
                    error!(
                        connection_id = %self.id,
                        trace_id = %self.ctx.trace_identifier(),
                        error = %e,
                        "application failed after the response started"
                    );
                    self.ctx.abort_with(AbortReason::ApplicationError);
                    return Ok(());
                }
                error!(
                    connection_id = %self.id,
                    trace_id = %self.ctx.trace_identifier(),
                    error = %e,
                    "application failed"
                );
                self.ctx.reset_response(StatusCode::INTERNAL_SERVER_ERROR);
            }

            if let Err(e) = self.ctx.complete_response().await {
                warn!(
                    connection_id = %self.id,
                    trace_id = %self.ctx.trace_identifier(),
                    error = %e,
                    "response could not be completed"
                );
                self.ctx.abort_with(AbortReason::ApplicationError);
                return Ok(());
            }
            self.ctx.fire_on_completed();

            if !self.ctx.keep_alive() || self.ctx.is_aborted() {
                return Ok(());
            }
            if let Err(e) = self.ctx.consume_body().await {
                debug!(connection_id = %self.id, error = %e, "unread request body could not be drained");
                if let HttpError::ConnectionAborted(reason) = e {
                    self.ctx.abort_with(reason);
                }
                return Ok(());
            }
            if !self.ctx.keep_alive() {
                return Ok(());
            }
        }
    }

    async fn on_head_error(&mut self, err: HttpError) -> anyhow::Result<()> {
        match err {
            HttpError::BadRequest(bad) => {
                self.ctx.reject(&bad).await;
                Ok(())
            }
            HttpError::ConnectionAborted(reason) => {
                self.ctx.abort_with(reason);
                Ok(())
            }
            HttpError::Io(e) => {
                debug!(connection_id = %self.id, error = %e, "transport read failed");
                Err(e.into())
            }
            other => Err(other.into()),
        }
    }
}
