//! Periodic tick driver shared by collection and delivery.
//!
//! A [`Timer`] fires a callback on the Tokio worker pool at a fixed period.
//! Executions never overlap: each one runs behind a [`TickGuard`] and a tick
//! that fires while the previous execution is still going is skipped, not
//! queued. A panicking execution is logged and the timer stays armed.
//!
//! ## Metrics
//!
//! `tick_skipped`: Ticks skipped because the previous execution was still running
//!

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use metrics::counter;
use tokio::{
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, error, warn};

use crate::signals::Running;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOP_REQUESTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Observable state of a [`TickGuard`].
pub(crate) enum TickState {
    /// No execution in flight, the next tick may enter.
    Idle,
    /// An execution holds the guard.
    Running,
    /// The owner is shutting down, nothing may enter again.
    StopRequested,
}

#[derive(Debug, Default)]
/// Re-entrancy guard for timer callbacks.
///
/// Transitions are `Idle -> Running` by [`TickGuard::try_enter`],
/// `Running -> Idle` when the returned [`Permit`] drops and
/// `* -> StopRequested` by [`TickGuard::request_stop`]. `StopRequested` is
/// terminal.
pub(crate) struct TickGuard {
    state: AtomicU8,
}

impl TickGuard {
    pub(crate) fn state(&self) -> TickState {
        match self.state.load(Ordering::Acquire) {
            IDLE => TickState::Idle,
            RUNNING => TickState::Running,
            _ => TickState::StopRequested,
        }
    }

    /// Claim the guard. Returns `None` if an execution is already in flight
    /// or a stop was requested.
    pub(crate) fn try_enter(self: &Arc<Self>) -> Option<Permit> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Permit {
                guard: Arc::clone(self),
            })
    }

    pub(crate) fn request_stop(&self) {
        self.state.store(STOP_REQUESTED, Ordering::Release);
    }
}

#[derive(Debug)]
/// Proof of a claimed [`TickGuard`]. Releases the guard on drop unless a stop
/// was requested in the meantime.
pub(crate) struct Permit {
    guard: Arc<TickGuard>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        // A failed exchange means StopRequested, which must stick.
        let _ = self.guard.state.compare_exchange(
            RUNNING,
            IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[derive(Debug)]
/// A periodic, non-overlapping callback driver.
pub(crate) struct Timer {
    name: String,
    guard: Arc<TickGuard>,
    halt: Running,
    driver: Option<JoinHandle<Option<JoinHandle<()>>>>,
}

impl Timer {
    /// Arm a new timer. `tick` first runs after `first` and then every
    /// `period` until either `running` or [`Timer::shutdown`] stops it.
    pub(crate) fn spawn<F, Fut>(
        name: impl Into<String>,
        first: Duration,
        period: Duration,
        running: Running,
        tick: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let guard = Arc::new(TickGuard::default());
        let halt = Running::new();
        // A zero period would make the interval panic.
        let period = period.max(Duration::from_millis(1));

        let driver = tokio::spawn(drive(
            name.clone(),
            Arc::clone(&guard),
            running,
            halt.clone(),
            first,
            period,
            tick,
        ));

        Self {
            name,
            guard,
            halt,
            driver: Some(driver),
        }
    }

    pub(crate) fn state(&self) -> TickState {
        self.guard.state()
    }

    /// Stop the timer. No new execution starts after this call begins; an
    /// execution already in flight gets at most `grace` to finish. Calling
    /// this more than once is harmless.
    pub(crate) async fn shutdown(&mut self, grace: Duration) {
        self.guard.request_stop();
        self.halt.stop();

        let Some(driver) = self.driver.take() else {
            return;
        };
        let in_flight = match driver.await {
            Ok(in_flight) => in_flight,
            Err(err) => {
                error!(timer = %self.name, "timer driver failed: {err}");
                None
            }
        };
        if let Some(handle) = in_flight {
            if time::timeout(grace, handle).await.is_err() {
                warn!(
                    timer = %self.name,
                    "in-flight tick did not finish within {grace:?}, abandoning it"
                );
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.guard.request_stop();
        self.halt.stop();
    }
}

async fn drive<F, Fut>(
    name: String,
    guard: Arc<TickGuard>,
    running: Running,
    halt: Running,
    first: Duration,
    period: Duration,
    tick: F,
) -> Option<JoinHandle<()>>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let labels = vec![("timer".to_string(), name.clone())];
    let mut interval = time::interval_at(Instant::now() + first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(permit) = guard.try_enter() else {
                    debug!(timer = %name, "previous tick still running, skipping");
                    counter!("tick_skipped", &labels).increment(1);
                    continue;
                };
                let body = tokio::spawn(tick());
                let name = name.clone();
                in_flight = Some(tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = body.await {
                        if err.is_panic() {
                            error!(timer = %name, "tick panicked: {err}");
                        } else {
                            warn!(timer = %name, "tick cancelled: {err}");
                        }
                    }
                }));
            }
            () = running.stopped() => break,
            () = halt.stopped() => break,
        }
    }
    debug!(timer = %name, "timer stopped");
    in_flight
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn guard_rejects_overlap_and_honours_stop() {
        let guard = Arc::new(TickGuard::default());
        let permit = guard.try_enter().expect("idle guard must admit");
        assert_eq!(guard.state(), TickState::Running);
        assert!(guard.try_enter().is_none());

        drop(permit);
        assert_eq!(guard.state(), TickState::Idle);

        let permit = guard.try_enter().expect("released guard must admit");
        guard.request_stop();
        drop(permit);
        assert_eq!(guard.state(), TickState::StopRequested);
        assert!(guard.try_enter().is_none());
    }

    #[tokio::test]
    async fn slow_ticks_are_skipped_not_queued() {
        let started = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut timer = {
            let started = Arc::clone(&started);
            let concurrent = Arc::clone(&concurrent);
            let max_concurrent = Arc::clone(&max_concurrent);
            Timer::spawn(
                "slow",
                Duration::from_millis(1),
                Duration::from_millis(5),
                Running::new(),
                move || {
                    let started = Arc::clone(&started);
                    let concurrent = Arc::clone(&concurrent);
                    let max_concurrent = Arc::clone(&max_concurrent);
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        time::sleep(Duration::from_millis(40)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    }
                },
            )
        };

        time::sleep(Duration::from_millis(150)).await;
        timer.shutdown(Duration::from_secs(1)).await;

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
        // 150ms of 5ms ticks with 40ms bodies admits only a handful.
        let started = started.load(Ordering::SeqCst);
        assert!((1..=5).contains(&started), "started {started} ticks");
        assert_eq!(timer.state(), TickState::StopRequested);
    }

    #[tokio::test]
    async fn panicking_tick_leaves_timer_armed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut timer = {
            let calls = Arc::clone(&calls);
            Timer::spawn(
                "panicky",
                Duration::from_millis(1),
                Duration::from_millis(10),
                Running::new(),
                move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        assert!(n > 0, "first tick blows up");
                    }
                },
            )
        };

        time::sleep(Duration::from_millis(100)).await;
        timer.shutdown(Duration::from_secs(1)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn process_stop_halts_timer() {
        let running = Running::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut timer = {
            let calls = Arc::clone(&calls);
            Timer::spawn(
                "halts",
                Duration::from_millis(1),
                Duration::from_millis(5),
                running.clone(),
                move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
        };

        time::sleep(Duration::from_millis(30)).await;
        running.stop();
        time::sleep(Duration::from_millis(20)).await;
        let after_stop = calls.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);

        timer.shutdown(Duration::from_millis(10)).await;
        timer.shutdown(Duration::from_millis(10)).await;
    }
}
