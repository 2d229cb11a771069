//! Circuit breaker between the dispatch tool and the job store.
//!
//! Three states: closed (operations pass through), open (operations skip
//! straight to the fallback), half-open (the next operation probes; success
//! closes, failure re-opens). State is process-local by design: all calls
//! pass through one instance, so transitions are linearizable without any
//! cross-process coordination.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Which path produced the dispatch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPath<P, F> {
    Primary(P),
    /// Fallback result plus the reason the primary path was skipped or
    /// abandoned.
    Fallback(F, String),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    forced_reason: Option<String>,
}

/// The breaker. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct CircuitBreaker {
    fail_max: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

/// What `begin()` decided for this call.
enum Attempt {
    /// Execute the primary (closed, or the half-open probe).
    Primary,
    /// Skip straight to the fallback.
    Fallback(String),
}

impl CircuitBreaker {
    pub fn new(fail_max: u32, reset_timeout: Duration) -> Self {
        Self {
            fail_max: fail_max.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                forced_reason: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Force the breaker open immediately. Idempotent; used on
    /// authentication failures where retrying cannot help.
    pub fn force_open(&self, reason: &str) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Open {
            tracing::warn!(reason, "circuit breaker forced open");
        }
        inner.state = BreakerState::Open;
        inner.failures = self.fail_max;
        inner.last_failure = Some(Instant::now());
        inner.forced_reason = Some(reason.to_owned());
    }

    /// Run `primary` under the breaker, routing to `fallback` when the
    /// breaker is open or the failure threshold is crossed.
    ///
    /// A primary failure below the threshold propagates as an error; at or
    /// past the threshold (and on a failed half-open probe) the call is
    /// answered by the fallback instead.
    pub async fn dispatch<P, F, PFut, FFut>(
        &self,
        primary: impl FnOnce() -> PFut,
        fallback: impl FnOnce() -> FFut,
    ) -> Result<DispatchPath<P, F>>
    where
        PFut: Future<Output = Result<P>>,
        FFut: Future<Output = Result<F>>,
    {
        match self.begin() {
            Attempt::Fallback(reason) => {
                let value = fallback().await?;
                Ok(DispatchPath::Fallback(value, reason))
            }
            Attempt::Primary => match primary().await {
                Ok(value) => {
                    self.on_success();
                    Ok(DispatchPath::Primary(value))
                }
                Err(err) => {
                    if self.on_failure() {
                        let reason = format!("job store unavailable: {err:#}");
                        tracing::warn!(error = %err, "breaker rerouting to fallback");
                        let value = fallback().await?;
                        Ok(DispatchPath::Fallback(value, reason))
                    } else {
                        Err(err)
                    }
                }
            },
        }
    }

    fn begin(&self) -> Attempt {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Attempt::Primary,
            BreakerState::HalfOpen => Attempt::Primary,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!("circuit breaker half-open, probing primary");
                    Attempt::Primary
                } else {
                    let reason = inner
                        .forced_reason
                        .clone()
                        .unwrap_or_else(|| "circuit breaker open".to_owned());
                    Attempt::Fallback(reason)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            tracing::info!("circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.forced_reason = None;
    }

    /// Record a primary failure. Returns `true` when the call should be
    /// answered by the fallback (threshold crossed or probe failed).
    fn on_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                true
            }
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.fail_max {
                    inner.state = BreakerState::Open;
                    tracing::warn!(failures = inner.failures, "circuit breaker opened");
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => true,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-update; the state is a plain
        // enum + counters, safe to keep using.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
