//! Per-connection deadlines and minimum data rates.
//!
//! The connection task arms and disarms timers; an external sweep calls
//! [`TimeoutControl::tick`] with the current time. A tick that finds a
//! violation only fires the connection's abort signal. It never touches
//! request or response state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::http::cancel::{AbortReason, CancellationSource};
use crate::http::error::HttpError;

/// A minimum transfer rate enforced after an initial grace period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinDataRate {
    bytes_per_second: f64,
    grace_period: Duration,
}

impl MinDataRate {
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Result<Self, HttpError> {
        if bytes_per_second.is_nan() || bytes_per_second <= 0.0 || bytes_per_second.is_infinite() {
            return Err(HttpError::invalid_argument(format!(
                "bytes_per_second must be positive, got {}",
                bytes_per_second
            )));
        }
        Ok(Self {
            bytes_per_second,
            grace_period,
        })
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    KeepAlive,
    RequestHeaders,
    ReadDataRate,
    WriteDataRate,
}

impl TimeoutReason {
    pub fn abort_reason(self) -> AbortReason {
        match self {
            TimeoutReason::KeepAlive => AbortReason::KeepAliveTimeout,
            TimeoutReason::RequestHeaders => AbortReason::RequestHeadersTimeout,
            TimeoutReason::ReadDataRate => AbortReason::MinRequestBodyDataRate,
            TimeoutReason::WriteDataRate => AbortReason::MinResponseDataRate,
        }
    }
}

/// Bytes moved against time spent actively waiting on the transport.
#[derive(Debug)]
struct RateTracker {
    rate: MinDataRate,
    bytes: u64,
    elapsed: Duration,
    /// Set while timing is running.
    since: Option<Instant>,
}

impl RateTracker {
    fn new(rate: MinDataRate) -> Self {
        Self {
            rate,
            bytes: 0,
            elapsed: Duration::ZERO,
            since: None,
        }
    }

    fn resume(&mut self, now: Instant) {
        if self.since.is_none() {
            self.since = Some(now);
        }
    }

    fn pause(&mut self, now: Instant) {
        if let Some(since) = self.since.take() {
            self.elapsed += now.saturating_duration_since(since);
        }
    }

    fn is_violated(&mut self, now: Instant) -> bool {
        if let Some(since) = self.since {
            self.elapsed += now.saturating_duration_since(since);
            self.since = Some(now);
        }
        if self.elapsed <= self.rate.grace_period {
            return false;
        }
        let required = self.rate.bytes_per_second * self.elapsed.as_secs_f64();
        (self.bytes as f64) < required
    }
}

#[derive(Debug, Default)]
struct TimeoutState {
    deadline: Option<(Instant, TimeoutReason)>,
    read: Option<RateTracker>,
    write: Option<RateTracker>,
    timed_out: Option<TimeoutReason>,
}

/// Shared handle; clones observe the same state.
#[derive(Debug, Clone)]
pub struct TimeoutControl {
    inner: Arc<Mutex<TimeoutState>>,
    abort: CancellationSource,
}

impl TimeoutControl {
    pub fn new(abort: CancellationSource) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimeoutState::default())),
            abort,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimeoutState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms the deadline. Fails if one is already armed.
    pub fn set_timeout(&self, timeout: Duration, reason: TimeoutReason) -> Result<(), HttpError> {
        let mut state = self.lock();
        if state.deadline.is_some() {
            return Err(HttpError::invalid_operation(
                "a timeout is already armed; use reset_timeout to replace it",
            ));
        }
        state.deadline = Some((Instant::now() + timeout, reason));
        Ok(())
    }

    /// Arms the deadline, replacing any armed one.
    pub fn reset_timeout(&self, timeout: Duration, reason: TimeoutReason) {
        self.lock().deadline = Some((Instant::now() + timeout, reason));
    }

    pub fn cancel_timeout(&self) {
        self.lock().deadline = None;
    }

    /// Reason of the armed deadline, if any.
    pub fn armed(&self) -> Option<TimeoutReason> {
        self.lock().deadline.map(|(_, reason)| reason)
    }

    /// Starts tracking request body reads against `rate`. Timing itself
    /// only runs between [`resume_timing_reads`](Self::resume_timing_reads)
    /// and [`pause_timing_reads`](Self::pause_timing_reads).
    pub fn start_timing_reads(&self, rate: MinDataRate) {
        self.lock().read = Some(RateTracker::new(rate));
    }

    pub fn resume_timing_reads(&self) {
        if let Some(tracker) = self.lock().read.as_mut() {
            tracker.resume(Instant::now());
        }
    }

    pub fn pause_timing_reads(&self) {
        if let Some(tracker) = self.lock().read.as_mut() {
            tracker.pause(Instant::now());
        }
    }

    pub fn bytes_read(&self, count: usize) {
        if let Some(tracker) = self.lock().read.as_mut() {
            tracker.bytes += count as u64;
        }
    }

    pub fn stop_timing_reads(&self) {
        self.lock().read = None;
    }

    /// Starts (or resumes) timing a response write against `rate`.
    pub fn start_timing_write(&self, rate: MinDataRate) {
        let mut state = self.lock();
        let tracker = state.write.get_or_insert_with(|| RateTracker::new(rate));
        tracker.rate = rate;
        tracker.resume(Instant::now());
    }

    pub fn bytes_written(&self, count: usize) {
        if let Some(tracker) = self.lock().write.as_mut() {
            tracker.bytes += count as u64;
        }
    }

    /// Pauses write timing; totals carry over to the next write.
    pub fn stop_timing_write(&self) {
        if let Some(tracker) = self.lock().write.as_mut() {
            tracker.pause(Instant::now());
        }
    }

    /// Drops every deadline and rate tracker.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.deadline = None;
        state.read = None;
        state.write = None;
    }

    /// The reason the connection timed out, once it has.
    pub fn timed_out(&self) -> Option<TimeoutReason> {
        self.lock().timed_out
    }

    /// Fires the connection's abort signal from outside the connection.
    /// Returns `false` if it had already fired.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.abort.cancel(reason)
    }

    /// Checks every armed limit against `now`. The first violation fires
    /// the abort signal and is returned; later ticks return `None`.
    pub fn tick(&self, now: Instant) -> Option<TimeoutReason> {
        let fired = {
            let mut state = self.lock();
            if state.timed_out.is_some() {
                return None;
            }
            let mut fired = state
                .deadline
                .filter(|(at, _)| now >= *at)
                .map(|(_, reason)| reason);
            if fired.is_none() && state.read.as_mut().is_some_and(|t| t.is_violated(now)) {
                fired = Some(TimeoutReason::ReadDataRate);
            }
            if fired.is_none() && state.write.as_mut().is_some_and(|t| t.is_violated(now)) {
                fired = Some(TimeoutReason::WriteDataRate);
            }
            let fired = fired?;
            state.timed_out = Some(fired);
            fired
        };

        debug!(reason = ?fired, "connection timed out");
        self.abort.cancel(fired.abort_reason());
        Some(fired)
    }
}
