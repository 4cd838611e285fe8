//! Connection abort signalling.
//!
//! A [`CancellationSource`] is owned by the connection. Application code and
//! the engine's own suspension points observe it through
//! [`CancellationToken`]s. Registrations made before the abort run when it
//! fires; registrations made afterwards run immediately. Cancelling twice is
//! a no-op.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

/// Why a connection was torn down without a normal close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    KeepAliveTimeout,
    RequestHeadersTimeout,
    MinRequestBodyDataRate,
    MinResponseDataRate,
    /// A malformed request was rejected.
    BadRequest(String),
    /// The application called `abort`.
    ApplicationAbort,
    /// The application failed after the response had started.
    ApplicationError,
    /// The response body was shorter than its declared Content-Length.
    ResponseLengthMismatch,
    TransportClosed,
    ServerShutdown,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::KeepAliveTimeout => write!(f, "keep-alive timeout expired"),
            AbortReason::RequestHeadersTimeout => write!(f, "request headers timeout expired"),
            AbortReason::MinRequestBodyDataRate => {
                write!(f, "request body arrived below the minimum data rate")
            }
            AbortReason::MinResponseDataRate => {
                write!(f, "response was read below the minimum data rate")
            }
            AbortReason::BadRequest(msg) => write!(f, "bad request: {}", msg),
            AbortReason::ApplicationAbort => write!(f, "aborted by the application"),
            AbortReason::ApplicationError => write!(f, "application failed mid-response"),
            AbortReason::ResponseLengthMismatch => {
                write!(f, "response ended before its declared Content-Length")
            }
            AbortReason::TransportClosed => write!(f, "transport closed"),
            AbortReason::ServerShutdown => write!(f, "server shutting down"),
        }
    }
}

type Callback = Box<dyn FnOnce(&AbortReason) + Send>;

struct State {
    reason: Option<AbortReason>,
    callbacks: Vec<(u64, Callback)>,
    next_id: u64,
}

struct Shared {
    state: Mutex<State>,
    signal: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner side of a connection's abort signal.
#[derive(Clone)]
pub struct CancellationSource {
    shared: Arc<Shared>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    reason: None,
                    callbacks: Vec::new(),
                    next_id: 0,
                }),
                signal,
            }),
        }
    }

    /// Fires the signal. Returns `false` if it had already fired, in which
    /// case the original reason is kept and nothing runs again.
    pub fn cancel(&self, reason: AbortReason) -> bool {
        let callbacks = {
            let mut state = self.shared.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.callbacks)
        };

        self.shared.signal.send_replace(true);

        for (_, callback) in callbacks {
            callback(&reason);
        }
        true
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().reason.is_some()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("reason", &self.shared.lock().reason)
            .finish()
    }
}

/// Observer side of a connection's abort signal.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.shared.lock().reason.clone()
    }

    /// Runs `callback` when the signal fires, or right away if it already has.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce(&AbortReason) + Send + 'static,
    {
        let mut state = self.shared.lock();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            callback(&reason);
            return Registration {
                shared: Arc::clone(&self.shared),
                id: None,
            };
        }

        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Box::new(callback)));
        Registration {
            shared: Arc::clone(&self.shared),
            id: Some(id),
        }
    }

    /// Resolves once the signal has fired.
    pub async fn cancelled(&self) {
        let mut rx = self.shared.signal.subscribe();
        // The sender lives inside `shared`, which this token keeps alive.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle to a pending callback. Dropping it keeps the callback registered.
#[must_use = "dropping a Registration keeps the callback; call unregister() to remove it"]
pub struct Registration {
    shared: Arc<Shared>,
    id: Option<u64>,
}

impl Registration {
    /// Removes the callback if it has not run yet.
    pub fn unregister(self) -> bool {
        let Some(id) = self.id else {
            return false;
        };
        let mut state = self.shared.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(cb_id, _)| *cb_id != id);
        state.callbacks.len() != before
    }
}
