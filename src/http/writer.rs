//! Write side of the transport.
//!
//! [`OutputProducer`] stages response bytes and pushes them to the transport
//! once enough has accumulated or the caller flushes. Every flush reports
//! whether the transport is gone (`is_completed`) and whether it was cut
//! short by a [`FlushCanceler`] (`is_canceled`). After the transport is gone,
//! writes and flushes are cheap no-ops.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::http::cancel::{AbortReason, CancellationToken};
use crate::http::timeout::{MinDataRate, TimeoutControl};

/// Staged bytes that trigger an implicit flush.
pub const DEFAULT_PAUSE_THRESHOLD: usize = 64 * 1024;

/// Smallest scratch allocation handed out by [`OutputProducer::get_memory`].
const MIN_SCRATCH_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// The transport is closed; further output is discarded.
    pub is_completed: bool,
    /// The flush was cancelled before all bytes were written.
    pub is_canceled: bool,
}

impl FlushResult {
    fn completed() -> Self {
        Self {
            is_completed: true,
            is_canceled: false,
        }
    }

    fn canceled() -> Self {
        Self {
            is_completed: false,
            is_canceled: true,
        }
    }
}

/// Hard-close hook of the underlying connection.
pub trait TransportControl: Send + Sync {
    fn abort(&self, reason: &AbortReason);
}

/// Transport control that only records the abort in the log. Used for
/// transports with no socket to close, such as in-memory pipes; the
/// listener installs [`SocketTransportControl`](crate::server::listener::SocketTransportControl).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTransportControl;

impl TransportControl for TracingTransportControl {
    fn abort(&self, reason: &AbortReason) {
        warn!(%reason, "transport aborted");
    }
}

/// Cancels the next pending flush of one producer. Later flushes are not
/// affected.
#[derive(Clone, Default)]
pub struct FlushCanceler {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl FlushCanceler {
    pub fn cancel_pending_flush(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for FlushCanceler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushCanceler")
            .field("requested", &self.requested.load(Ordering::Acquire))
            .finish()
    }
}

enum Step {
    Canceled,
    Aborted,
    Wrote(io::Result<usize>),
}

pub struct OutputProducer {
    writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    buffer: BytesMut,
    pause_threshold: usize,
    scratch: Vec<u8>,
    canceler: FlushCanceler,
    abort_token: Option<CancellationToken>,
    control: Arc<dyn TransportControl>,
    timeout: Option<(TimeoutControl, MinDataRate)>,
    aborted: bool,
    completed: bool,
    end_reason: Option<AbortReason>,
    bytes_flushed: u64,
}

impl OutputProducer {
    pub fn new(writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            writer: Some(writer),
            buffer: BytesMut::new(),
            pause_threshold: DEFAULT_PAUSE_THRESHOLD,
            scratch: Vec::new(),
            canceler: FlushCanceler::default(),
            abort_token: None,
            control: Arc::new(TracingTransportControl),
            timeout: None,
            aborted: false,
            completed: false,
            end_reason: None,
            bytes_flushed: 0,
        }
    }

    pub fn with_transport_control(mut self, control: Arc<dyn TransportControl>) -> Self {
        self.control = control;
        self
    }

    /// Flushes stop waiting on the transport once `token` fires.
    pub fn with_abort_token(mut self, token: CancellationToken) -> Self {
        self.abort_token = Some(token);
        self
    }

    pub fn with_pause_threshold(mut self, threshold: usize) -> Self {
        self.pause_threshold = threshold.max(1);
        self
    }

    pub fn set_transport_control(&mut self, control: Arc<dyn TransportControl>) {
        self.control = control;
    }

    /// Enforces `rate` on time spent waiting for the transport to accept bytes.
    /// `None` disables rate checks.
    pub fn set_min_data_rate(&mut self, timeout: TimeoutControl, rate: Option<MinDataRate>) {
        self.timeout = rate.map(|rate| (timeout, rate));
    }

    pub fn canceler(&self) -> FlushCanceler {
        self.canceler.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn end_reason(&self) -> Option<&AbortReason> {
        self.end_reason.as_ref()
    }

    /// Bytes staged but not yet handed to the transport.
    pub fn unflushed(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes_flushed(&self) -> u64 {
        self.bytes_flushed
    }

    /// Stages `data`, flushing when the staged total reaches the pause
    /// threshold.
    pub async fn write(&mut self, data: &[u8]) -> FlushResult {
        if self.completed {
            return FlushResult::completed();
        }
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.pause_threshold {
            return self.flush().await;
        }
        FlushResult::default()
    }

    /// Writes every staged byte to the transport.
    pub async fn flush(&mut self) -> FlushResult {
        if self.completed {
            self.buffer.clear();
            return FlushResult::completed();
        }

        let canceler = self.canceler.clone();
        let abort_token = self.abort_token.clone();
        if let Some((timeout, rate)) = &self.timeout {
            timeout.start_timing_write(*rate);
        }

        let result = loop {
            let notified = canceler.notify.notified();
            if canceler.take() {
                break FlushResult::canceled();
            }
            let Some(writer) = self.writer.as_mut() else {
                self.completed = true;
                break FlushResult::completed();
            };
            if self.buffer.is_empty() {
                match writer.flush().await {
                    Ok(()) => break FlushResult::default(),
                    Err(e) => {
                        self.transport_closed(e);
                        break FlushResult::completed();
                    }
                }
            }

            let step = tokio::select! {
                biased;
                _ = notified => Step::Canceled,
                _ = wait_for_abort(abort_token.as_ref()) => Step::Aborted,
                res = writer.write(&self.buffer) => Step::Wrote(res),
            };

            match step {
                Step::Canceled => continue,
                Step::Aborted => {
                    self.completed = true;
                    self.buffer.clear();
                    break FlushResult::completed();
                }
                Step::Wrote(Ok(0)) => {
                    self.transport_closed(io::ErrorKind::WriteZero.into());
                    break FlushResult::completed();
                }
                Step::Wrote(Ok(n)) => {
                    let _ = self.buffer.split_to(n);
                    self.bytes_flushed += n as u64;
                    if let Some((timeout, _)) = &self.timeout {
                        timeout.bytes_written(n);
                    }
                }
                Step::Wrote(Err(e)) => {
                    self.transport_closed(e);
                    break FlushResult::completed();
                }
            }
        };

        if let Some((timeout, _)) = &self.timeout {
            timeout.stop_timing_write();
        }
        result
    }

    fn transport_closed(&mut self, err: io::Error) {
        debug!(error = %err, "transport closed while writing");
        self.completed = true;
        self.buffer.clear();
        self.writer = None;
        if self.end_reason.is_none() {
            self.end_reason = Some(AbortReason::TransportClosed);
        }
    }

    /// Scratch space of at least `size_hint` bytes for callers that format
    /// output in place. The allocation only ever grows. Commit with
    /// [`advance`](Self::advance).
    pub fn get_memory(&mut self, size_hint: usize) -> &mut [u8] {
        let wanted = size_hint.max(MIN_SCRATCH_SIZE);
        if self.scratch.len() < wanted {
            self.scratch.resize(wanted, 0);
        }
        &mut self.scratch
    }

    /// Stages the first `count` bytes of the scratch space.
    pub fn advance(&mut self, count: usize) {
        let count = count.min(self.scratch.len());
        if !self.completed {
            self.buffer.extend_from_slice(&self.scratch[..count]);
        }
    }

    pub fn scratch_capacity(&self) -> usize {
        self.scratch.len()
    }

    /// Hard-closes the transport. Only the first call reaches the transport;
    /// later calls, including after [`dispose`](Self::dispose), do nothing.
    pub fn abort(&mut self, reason: AbortReason) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.completed = true;
        self.buffer.clear();
        self.writer = None;
        self.control.abort(&reason);
        self.end_reason = Some(reason);
    }

    /// Flushes what is staged and shuts the write half down. Never aborts.
    pub async fn dispose(&mut self) {
        if !self.completed {
            self.flush().await;
        }
        self.completed = true;
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "transport shutdown failed");
            }
        }
    }
}

async fn wait_for_abort(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl fmt::Debug for OutputProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputProducer")
            .field("unflushed", &self.buffer.len())
            .field("completed", &self.completed)
            .field("aborted", &self.aborted)
            .field("end_reason", &self.end_reason)
            .finish()
    }
}
