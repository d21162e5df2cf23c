//! Waiting for eventually-consistent backends.
//!
//! A create response does not mean the change is visible everywhere yet:
//! directory objects take seconds to show up in list queries, EDM schemas
//! take many minutes to reach the upload agent. The waiter sleeps, probes,
//! and gives up after a wall-clock budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::ResourceApi;
use crate::clock::{Clock, SystemClock};
use crate::error::{Cancelled, ConfigError, ErrorInfo};
use crate::transport::{Request, Transport};

/// Longest stretch slept without looking at the cancel token.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationState {
    Pending,
    Ready,
    /// Budget spent. The resource exists; the dependent step should be
    /// retried later.
    TimedOut,
}

/// Readiness check for one resource.
///
/// `Ok(false)` and `Err(_)` both mean "not yet": a 404 is the usual way an
/// unpropagated object shows itself.
pub trait Probe {
    fn poll(&mut self) -> Result<bool, ErrorInfo>;
}

impl<F> Probe for F
where
    F: FnMut() -> Result<bool, ErrorInfo>,
{
    fn poll(&mut self) -> Result<bool, ErrorInfo> {
        self()
    }
}

/// Ready once the resource is returned by a natural-key lookup.
pub struct VisibleProbe<'a, A> {
    api: &'a A,
    kind: String,
    natural_key: String,
}

impl<'a, A: ResourceApi> VisibleProbe<'a, A> {
    pub fn new(api: &'a A, kind: &str, natural_key: &str) -> Self {
        Self {
            api,
            kind: kind.to_string(),
            natural_key: natural_key.to_string(),
        }
    }
}

impl<A: ResourceApi> Probe for VisibleProbe<'_, A> {
    fn poll(&mut self) -> Result<bool, ErrorInfo> {
        Ok(!self.api.find_by_key(&self.kind, &self.natural_key)?.is_empty())
    }
}

/// Ready once a GET succeeds, optionally with a field at a JSON pointer
/// holding an expected value (e.g. `/properties/provisioningState`).
pub struct HttpProbe<T> {
    transport: T,
    request: Request,
    expect: Option<(String, Value)>,
}

impl<T: Transport> HttpProbe<T> {
    pub fn new(transport: T, request: Request) -> Self {
        Self {
            transport,
            request,
            expect: None,
        }
    }

    pub fn expect(mut self, pointer: impl Into<String>, value: Value) -> Self {
        self.expect = Some((pointer.into(), value));
        self
    }
}

impl<T: Transport> Probe for HttpProbe<T> {
    fn poll(&mut self) -> Result<bool, ErrorInfo> {
        let response = self.transport.send(&self.request)?;
        Ok(match &self.expect {
            None => true,
            Some((pointer, expected)) => response
                .json()
                .and_then(|v| v.pointer(pointer))
                .is_some_and(|actual| actual == expected),
        })
    }
}

/// A probe with its polling schedule.
pub struct PropagationCheck<P> {
    pub probe: P,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl<P: Probe> PropagationCheck<P> {
    pub fn new(probe: P, poll_interval: Duration, max_wait: Duration) -> Result<Self, ConfigError> {
        if poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if poll_interval > max_wait {
            return Err(ConfigError::PollIntervalExceedsMaxWait {
                interval_secs: poll_interval.as_secs(),
                max_wait_secs: max_wait.as_secs(),
            });
        }
        Ok(Self {
            probe,
            poll_interval,
            max_wait,
        })
    }

    /// Schema-style propagation: every minute for up to twenty minutes.
    pub fn schema(probe: P) -> Self {
        Self {
            probe,
            poll_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(20 * 60),
        }
    }

    /// New directory objects showing up in list calls.
    pub fn directory_object(probe: P) -> Self {
        Self {
            probe,
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(120),
        }
    }
}

/// Cooperative cancellation flag, shared with whoever handles interrupts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sleep-then-probe loop with a deadline.
pub struct PropagationWaiter<C = SystemClock> {
    clock: C,
}

impl PropagationWaiter<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for PropagationWaiter<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> PropagationWaiter<C> {
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }

    /// Poll `check` until it reports ready or `max_wait` has elapsed.
    ///
    /// Returns `Ready` or `TimedOut`; a cancelled wait returns `Err(Cancelled)`.
    ///
    /// A probe call in flight is not interrupted, so the budget can be
    /// overrun by one probe's duration. Give HTTP probes a request timeout
    /// (`Request::with_timeout`) to bound that.
    pub fn wait<P: Probe>(
        &self,
        what: &str,
        check: &mut PropagationCheck<P>,
        cancel: &CancelToken,
    ) -> Result<PropagationState, Cancelled> {
        let start = self.clock.now();
        let mut polls: u32 = 0;

        info!(
            what,
            poll_interval_secs = check.poll_interval.as_secs(),
            max_wait_secs = check.max_wait.as_secs(),
            "Waiting for propagation"
        );

        loop {
            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= check.max_wait {
                warn!(what, polls, elapsed_secs = elapsed.as_secs(), "Propagation timed out");
                return Ok(PropagationState::TimedOut);
            }

            let nap = check.poll_interval.min(check.max_wait - elapsed);
            self.sleep(nap, cancel)?;
            cancel.check()?;

            polls += 1;
            match check.probe.poll() {
                Ok(true) => {
                    let elapsed = self.clock.now().saturating_duration_since(start);
                    info!(what, polls, elapsed_secs = elapsed.as_secs(), "Propagation complete");
                    return Ok(PropagationState::Ready);
                }
                Ok(false) => debug!(what, polls, "Not propagated yet"),
                Err(e) => debug!(what, polls, error = %e, "Probe failed, still pending"),
            }
        }
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Cancelled> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            cancel.check()?;
            let slice = remaining.min(CANCEL_CHECK_INTERVAL);
            self.clock.sleep(slice);
            remaining -= slice;
        }
        Ok(())
    }
}
