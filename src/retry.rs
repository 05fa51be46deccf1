//! Retry policy for RPCs and file downloads.
//!
//! Every logical call gets a fresh [`RetryState`]; nothing is remembered between calls, so
//! concurrent handles never share backoff timers.
//!
//! A failed attempt is first classified ([`FailureKind`]) and then either retried after a
//! delay, followed to a new location (redirects), or surfaced. Delays grow exponentially
//! from [`RetryConfig::delay_min`] by [`RetryConfig::multiplier`], get up to
//! [`RetryConfig::jitter`] of random extra, and are capped at [`RetryConfig::delay_max`].
//! Within one call delays never shrink. A server wait hint (429/503 `retry_after`) replaces
//! the computed delay when larger, still bounded by the cap. Retrying stops when the attempt
//! count or the elapsed-time budget would be exceeded, whichever comes first.
//!
//! Submissions are special: they are retried only when the server cannot have started the
//! statement (connect failures, 429, 503). An ambiguous failure after the request was sent
//! surfaces as [`Error::UnsafeToRetry`].
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use rand::Rng;

use crate::{
    config::RetryConfig,
    error::{Error, Result},
    protocol::TransportError,
};

/// Whether repeating a call can change server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Status polls, metadata and result fetches, cancel, close, downloads.
    Idempotent,
    /// Statement submission.
    Submit,
}

/// Coarse classification of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// No connection was made; the request was never sent.
    Connect,
    /// The connection broke after the request may have been sent.
    Connection,
    /// 429-equivalent.
    Throttled { retry_after: Option<Duration> },
    /// 503-equivalent.
    Unavailable { retry_after: Option<Duration> },
    /// 401/403-equivalent.
    Unauthorized { status: u16 },
    Redirect { location: String },
    LinkExpired,
    /// Anything else: malformed messages, other status codes.
    Fatal,
}

impl FailureKind {
    pub fn classify(err: &TransportError) -> Self {
        match err {
            TransportError::Connect { .. } => FailureKind::Connect,
            TransportError::Io(_) => FailureKind::Connection,
            TransportError::Deserialize(bincode::error::DecodeError::Io { .. }) => {
                FailureKind::Connection
            }
            TransportError::Status {
                status: 429,
                retry_after,
                ..
            } => FailureKind::Throttled {
                retry_after: *retry_after,
            },
            TransportError::Status {
                status: 503,
                retry_after,
                ..
            } => FailureKind::Unavailable {
                retry_after: *retry_after,
            },
            TransportError::Status {
                status: status @ (401 | 403),
                ..
            } => FailureKind::Unauthorized { status: *status },
            TransportError::Redirect { location } => FailureKind::Redirect {
                location: location.clone(),
            },
            TransportError::LinkExpired { .. } => FailureKind::LinkExpired,
            _ => FailureKind::Fatal,
        }
    }

    fn is_retryable(&self, idempotency: Idempotency) -> bool {
        match self {
            FailureKind::Connect | FailureKind::Throttled { .. } | FailureKind::Unavailable { .. } => {
                true
            }
            FailureKind::Connection => idempotency == Idempotency::Idempotent,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FailureKind::Throttled { retry_after } | FailureKind::Unavailable { retry_after } => {
                *retry_after
            }
            _ => None,
        }
    }
}

/// Per-call bookkeeping. Never shared between calls.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempts: u32,
    pub redirects: u32,
    started: Instant,
    last_delay: Duration,
    pub last_failure: Option<FailureKind>,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempts: 0,
            redirects: 0,
            started: Instant::now(),
            last_delay: Duration::ZERO,
            last_failure: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Outcome of evaluating one failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Redirect(String),
    GiveUp(Error),
}

/// Blocks the calling thread between attempts.
pub trait Sleeper: Send + Sync {
    /// Waits for `duration` unless `cancel` fires first. Returns `false` when cancelled.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

#[derive(Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        !cancel.wait_timeout(duration)
    }
}

/// Cooperative stop signal shared between an owner and its worker threads.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelToken")
            .field(&self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `timeout`; returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_sleeper(config, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn begin(&self) -> RetryState {
        RetryState::new()
    }

    /// Unjittered delay before retry number `attempt` (1-based), capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.config.delay_min.as_secs_f64() * self.config.multiplier.powi(exponent);
        let max = self.config.delay_max.as_secs_f64();
        Duration::from_secs_f64(secs.min(max).max(0.0))
    }

    fn next_delay(&self, state: &RetryState, hint: Option<Duration>) -> Duration {
        let base = self.base_delay(state.attempts);
        let proposed = match hint {
            Some(hint) if hint > base => hint,
            _ => {
                // NaN falls through to no jitter
                let jitter = self.config.jitter.clamp(0.0, 1.0);
                let extra = if jitter > 0.0 {
                    rand::rng().random_range(0.0..=jitter)
                } else {
                    0.0
                };
                base.mul_f64(1.0 + extra)
            }
        };
        proposed.min(self.config.delay_max).max(state.last_delay)
    }

    /// Evaluates a failed attempt. `state.attempts` must already count it.
    pub fn on_failure(
        &self,
        state: &mut RetryState,
        idempotency: Idempotency,
        err: TransportError,
    ) -> RetryDecision {
        let kind = FailureKind::classify(&err);
        state.last_failure = Some(kind.clone());

        match &kind {
            FailureKind::Redirect { location } => {
                if state.redirects >= self.config.max_redirects {
                    return RetryDecision::GiveUp(Error::TooManyRedirects {
                        max: self.config.max_redirects,
                        location: location.clone(),
                    });
                }
                state.redirects += 1;
                return RetryDecision::Redirect(location.clone());
            }
            FailureKind::Unauthorized { status } => {
                let message = match &err {
                    TransportError::Status { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                return RetryDecision::GiveUp(Error::Auth {
                    status: *status,
                    message,
                });
            }
            FailureKind::Connection if idempotency == Idempotency::Submit => {
                return RetryDecision::GiveUp(Error::UnsafeToRetry(err));
            }
            _ => {}
        }

        if !kind.is_retryable(idempotency) {
            return RetryDecision::GiveUp(Error::Transport(err));
        }

        let delay = if state.attempts >= self.config.max_attempts {
            None
        } else {
            self.schedule(state, kind.retry_after())
        };
        match delay {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::GiveUp(Error::RetriesExhausted {
                attempts: state.attempts,
                elapsed: state.elapsed(),
                source: err,
            }),
        }
    }

    /// Next non-decreasing delay for `state`, or `None` once waiting it would overrun the
    /// elapsed-time budget.
    pub fn backoff(&self, state: &mut RetryState) -> Option<Duration> {
        self.schedule(state, None)
    }

    fn schedule(&self, state: &mut RetryState, hint: Option<Duration>) -> Option<Duration> {
        let delay = self.next_delay(state, hint);
        if state.elapsed() + delay > self.config.max_duration {
            return None;
        }
        state.last_delay = delay;
        Some(delay)
    }

    /// Runs `call` against `endpoint` until it succeeds or the policy gives up.
    ///
    /// The closure receives the endpoint to use for that attempt, which changes after a
    /// redirect.
    pub fn run<T, F>(
        &self,
        name: &str,
        idempotency: Idempotency,
        endpoint: &str,
        cancel: &CancelToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(&str) -> std::result::Result<T, TransportError>,
    {
        let mut state = self.begin();
        let mut endpoint = endpoint.to_string();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancellation);
            }
            state.attempts += 1;
            debug!("{name}: attempt {} to {endpoint}", state.attempts);

            let err = match call(&endpoint) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.on_failure(&mut state, idempotency, err) {
                RetryDecision::RetryAfter(delay) => {
                    info!(
                        "{name}: attempt {} failed ({:?}), retrying in {delay:?}",
                        state.attempts, state.last_failure
                    );
                    if !self.sleeper.sleep(delay, cancel) {
                        return Err(Error::Cancellation);
                    }
                }
                RetryDecision::Redirect(location) => {
                    debug!("{name}: following redirect to {location}");
                    // Redirects are not failed attempts.
                    state.attempts -= 1;
                    endpoint = location;
                }
                RetryDecision::GiveUp(err) => {
                    warn!(
                        "{name}: giving up after {} attempts in {:?}: {err}",
                        state.attempts,
                        state.elapsed()
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Sleeps on the policy's sleeper; used by status polling so it shares the schedule.
    pub fn pause(&self, delay: Duration, cancel: &CancelToken) -> bool {
        self.sleeper.sleep(delay, cancel)
    }
}
