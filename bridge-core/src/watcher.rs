//! Change watchers: polling loops that report only state transitions.
//!
//! Each loop owns a [`ChangeWatcher`] (last-known value + callback) and a
//! schedule that yields the delay before the next tick. Cancellation only
//! stops future ticks; a probe or poll already in flight runs to completion
//! and its result is discarded.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::BridgeError;
use crate::protocol::{permissions_equal, Permission};

/// Default number of initial availability attempts retried without delay.
pub const DEFAULT_SETTLING_ATTEMPTS: u32 = 5;
/// Default delay after an unavailable probe once settling is over.
pub const DEFAULT_UNAVAILABLE_RETRY: Duration = Duration::from_secs(5);
/// Default delay after an available probe.
pub const DEFAULT_AVAILABLE_RETRY: Duration = Duration::from_secs(10);
/// Default permission poll interval.
pub const DEFAULT_PERMISSION_POLL: Duration = Duration::from_secs(10);

/// Availability polling interval: retry at once while settling, back off after.
#[derive(Debug, Clone)]
pub struct AvailabilitySchedule {
    attempt: u32,
    settling_attempts: u32,
    unavailable_retry: Duration,
    available_retry: Duration,
}

impl AvailabilitySchedule {
    pub fn new(
        settling_attempts: u32,
        unavailable_retry: Duration,
        available_retry: Duration,
    ) -> Self {
        Self {
            attempt: 0,
            settling_attempts,
            unavailable_retry,
            available_retry,
        }
    }

    /// Delay before the next probe, given the outcome of the one just finished.
    /// The attempt counter only advances during the settling window.
    pub fn next_delay(&mut self, available: bool) -> Duration {
        let settling = self.is_settling();
        if settling {
            self.attempt += 1;
        }
        if available {
            self.available_retry
        } else if settling {
            Duration::ZERO
        } else {
            self.unavailable_retry
        }
    }

    pub fn is_settling(&self) -> bool {
        self.attempt < self.settling_attempts
    }
}

impl Default for AvailabilitySchedule {
    fn default() -> Self {
        Self::new(
            DEFAULT_SETTLING_ATTEMPTS,
            DEFAULT_UNAVAILABLE_RETRY,
            DEFAULT_AVAILABLE_RETRY,
        )
    }
}

/// Fixed polling interval.
#[derive(Debug, Clone, Copy)]
pub struct FixedSchedule {
    pub interval: Duration,
}

impl FixedSchedule {
    pub fn next_delay(&self) -> Duration {
        self.interval
    }
}

/// Last-known value plus the callback fired when a new observation differs from it.
pub struct ChangeWatcher<T, C> {
    current: T,
    same: fn(&T, &T) -> bool,
    callback: C,
}

impl<T: Clone, C: FnMut(T)> ChangeWatcher<T, C> {
    pub fn new(initial: T, same: fn(&T, &T) -> bool, callback: C) -> Self {
        Self {
            current: initial,
            same,
            callback,
        }
    }

    /// Record `next`; fires the callback and returns true only on a change.
    pub fn observe(&mut self, next: T) -> bool {
        if (self.same)(&self.current, &next) {
            return false;
        }
        (self.callback)(next.clone());
        self.current = next;
        true
    }

    pub fn current(&self) -> &T {
        &self.current
    }
}

fn same_status(a: &bool, b: &bool) -> bool {
    a == b
}

fn same_permission(a: &Option<Permission>, b: &Option<Permission>) -> bool {
    permissions_equal(a.as_ref(), b.as_ref())
}

struct WatchState {
    cancelled: AtomicBool,
    wake: Notify,
}

impl WatchState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `delay`; false if cancelled before or during the sleep.
    async fn rearm(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_cancelled(),
            _ = self.wake.notified() => false,
        }
    }
}

/// Cancellation handle returned by the `on_*_change` calls. Dropping it does
/// not stop the watcher; call [`WatchHandle::cancel`].
#[derive(Clone)]
pub struct WatchHandle {
    state: Arc<WatchState>,
}

impl WatchHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(WatchState {
                cancelled: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    /// Stop scheduling further ticks. Idempotent. A tick already in flight
    /// finishes, but its result no longer reaches the callback.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            self.state.wake.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

/// Spawn the availability loop. `probe` is called once per tick.
pub fn spawn_availability_watcher<P, Fut, C>(
    mut probe: P,
    mut schedule: AvailabilitySchedule,
    callback: C,
) -> WatchHandle
where
    P: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
    C: FnMut(bool) + Send + 'static,
{
    let handle = WatchHandle::new();
    let state = handle.state.clone();
    tokio::spawn(async move {
        let mut watcher = ChangeWatcher::new(false, same_status, callback);
        loop {
            let available = probe().await;
            if state.is_cancelled() {
                debug!(available, "watcher cancelled; dropping in-flight result");
                break;
            }
            if watcher.observe(available) {
                debug!(available, "availability changed");
            }
            if !state.rearm(schedule.next_delay(available)).await {
                break;
            }
        }
    });
    handle
}

/// Spawn the permission loop. Poll errors are logged and skipped; the loop
/// keeps its schedule until cancelled.
pub fn spawn_permission_watcher<P, Fut, C>(
    mut poll: P,
    schedule: FixedSchedule,
    callback: C,
) -> WatchHandle
where
    P: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<Permission>, BridgeError>> + Send + 'static,
    C: FnMut(Option<Permission>) + Send + 'static,
{
    let handle = WatchHandle::new();
    let state = handle.state.clone();
    tokio::spawn(async move {
        let mut watcher = ChangeWatcher::new(None, same_permission, callback);
        loop {
            let polled = poll().await;
            if state.is_cancelled() {
                debug!("permission watcher cancelled; dropping in-flight result");
                break;
            }
            match polled {
                Ok(permission) => {
                    if watcher.observe(permission) {
                        let pkh = watcher.current().as_ref().map(|p| p.pkh.clone());
                        debug!(?pkh, "permission changed");
                    }
                }
                Err(e) => debug!(error = %e, "permission poll failed"),
            }
            if !state.rearm(schedule.next_delay()).await {
                break;
            }
        }
    });
    handle
}
