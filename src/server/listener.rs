use std::future::Future;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::http::cancel::AbortReason;
use crate::http::connection::{Application, Connection};
use crate::http::limits::Limits;
use crate::http::pool::MemoryPool;
use crate::http::writer::TransportControl;
use crate::server::heartbeat::Heartbeat;

/// How long shutdown waits for aborted connections to wind down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shuts the accepted socket down in both directions on abort, even while
/// the connection task still owns its halves.
#[derive(Debug)]
pub struct SocketTransportControl {
    socket: std::net::TcpStream,
}

impl SocketTransportControl {
    /// Splits a shutdown handle off `socket`.
    pub fn attach(socket: TcpStream) -> std::io::Result<(TcpStream, Self)> {
        let socket = socket.into_std()?;
        let handle = socket.try_clone()?;
        Ok((TcpStream::from_std(socket)?, Self { socket: handle }))
    }
}

impl TransportControl for SocketTransportControl {
    fn abort(&self, reason: &AbortReason) {
        warn!(%reason, "transport aborted");
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!(error = %e, "socket shutdown failed");
        }
    }
}

/// Accepts connections on `listener` and serves each on its own task.
pub async fn serve<A>(
    listener: TcpListener,
    app: Arc<A>,
    limits: Arc<Limits>,
    heartbeat: Heartbeat,
) -> anyhow::Result<()>
where
    A: Application + 'static,
{
    let pool = MemoryPool::default();

    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let (socket, control) = match SocketTransportControl::attach(socket) {
            Ok(attached) => attached,
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer, e);
                continue;
            }
        };

        let conn = Connection::with_pool(socket, app.clone(), limits.clone(), pool.clone())
            .with_transport_control(Arc::new(control))
            .with_remote_addr(peer);
        info!(connection_id = %conn.id(), "Accepted connection from {}", peer);

        let registration = heartbeat.register(conn.timeout_control());
        tokio::spawn(async move {
            let _registration = registration;
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}

/// Serves until `shutdown` resolves, then aborts every live connection and
/// waits up to [`SHUTDOWN_GRACE`] for them to close.
pub async fn serve_until<A, S>(
    listener: TcpListener,
    app: Arc<A>,
    limits: Arc<Limits>,
    heartbeat: Heartbeat,
    shutdown: S,
) -> anyhow::Result<()>
where
    A: Application + 'static,
    S: Future<Output = ()>,
{
    tokio::select! {
        res = serve(listener, app, limits, heartbeat.clone()) => return res,
        _ = shutdown => {}
    }

    let aborted = heartbeat.abort_all(AbortReason::ServerShutdown);
    info!(aborted, "Shutting down");

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while !heartbeat.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = heartbeat.len(), "connections still open after shutdown grace");
    }
    Ok(())
}

/// Binds `addr`, starts the heartbeat and serves until `shutdown` resolves
/// or the listener fails.
pub async fn run<A, S>(addr: &str, app: Arc<A>, limits: Limits, shutdown: S) -> anyhow::Result<()>
where
    A: Application + 'static,
    S: Future<Output = ()>,
{
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    let heartbeat = Heartbeat::new();
    let sweep = heartbeat.spawn(crate::server::heartbeat::DEFAULT_INTERVAL);
    let result = serve_until(listener, app, Arc::new(limits), heartbeat, shutdown).await;
    sweep.abort();
    result
}
