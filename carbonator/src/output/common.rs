//! Common types for outputs

use std::sync::atomic::{AtomicU8, Ordering};

use carbonator_buffer::{Buffer, Error as BufferError};
use metrics::counter;
use tokio::time::Duration;

use crate::metric::CollectedMetric;

/// Per-item timeout when draining the buffer.
pub(super) const TAKE_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout for putting a failed metric back into the buffer.
pub(super) const REQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout a producer waits for buffer space.
const ADD_TIMEOUT: Duration = Duration::from_millis(100);
/// Delay before the first delivery tick.
pub(super) const FIRST_TICK: Duration = Duration::from_millis(100);
/// Upper bound on each blocking step of shutdown.
pub(super) const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where an output is in its connection lifecycle.
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// Attempting to connect, backing off between attempts.
    Connecting,
    /// Connected and able to write.
    Connected,
}

#[derive(Debug)]
/// An atomically updated [`ConnectionState`].
pub(super) struct StateCell {
    inner: AtomicU8,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            inner: AtomicU8::new(0),
        }
    }
}

impl StateCell {
    pub(super) fn get(&self) -> ConnectionState {
        match self.inner.load(Ordering::Acquire) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Connected,
        }
    }

    pub(super) fn set(&self, state: ConnectionState) {
        let raw = match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        };
        self.inner.store(raw, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
/// Stepped reconnect backoff.
///
/// The delay after the Nth consecutive failure is `min(N * step, max)`.
pub(super) struct Backoff {
    step: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub(super) fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            failures: 0,
        }
    }

    /// Record one more failure and return how long to wait before the next
    /// attempt.
    pub(super) fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.step.saturating_mul(self.failures).min(self.max)
    }

    /// The number of consecutive failures recorded.
    pub(super) fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the delay has reached its cap.
    pub(super) fn capped(&self) -> bool {
        self.step.saturating_mul(self.failures) >= self.max
    }

    pub(super) fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Builds the label set attached to every output metric.
pub(super) struct MetricsBuilder {
    labels: Vec<(String, String)>,
}

impl MetricsBuilder {
    /// Create a new metrics builder with standard component labels
    pub(super) fn new(component_name: &str) -> Self {
        Self {
            labels: vec![
                ("component".to_string(), "output".to_string()),
                ("component_name".to_string(), component_name.to_string()),
            ],
        }
    }

    /// Add an ID label if provided
    pub(super) fn with_id(mut self, id: Option<String>) -> Self {
        if let Some(id) = id {
            self.labels.push(("id".to_string(), id));
        }
        self
    }

    /// Build the final label vector
    pub(super) fn build(self) -> Vec<(String, String)> {
        self.labels
    }
}

/// Append a `reason` label to `labels`.
pub(super) fn with_reason(labels: &[(String, String)], reason: &'static str) -> Vec<(String, String)> {
    let mut labels = labels.to_vec();
    labels.push(("reason".to_string(), reason.to_string()));
    labels
}

/// Count the outcome of one enqueue attempt. Returns whether the metric was
/// accepted.
fn record(labels: &[(String, String)], result: Result<(), BufferError<CollectedMetric>>) -> bool {
    match result {
        Ok(()) => {
            counter!("metrics_enqueued", labels).increment(1);
            true
        }
        Err(err) => {
            let reason = if err.is_full() { "buffer_full" } else { "shutdown" };
            counter!("metrics_dropped", &with_reason(labels, reason)).increment(1);
            false
        }
    }
}

/// Offer one metric, waiting up to [`ADD_TIMEOUT`] for space.
pub(super) async fn enqueue(
    buffer: &Buffer<CollectedMetric>,
    labels: &[(String, String)],
    metric: CollectedMetric,
) -> bool {
    record(labels, buffer.try_add(metric, ADD_TIMEOUT).await)
}

/// Offer a batch of metrics. Only the first rejection waits out
/// [`ADD_TIMEOUT`]; every metric after it is pushed without waiting, so a
/// saturated buffer costs one tick at most one timeout. Returns the number
/// accepted.
pub(super) async fn enqueue_all(
    buffer: &Buffer<CollectedMetric>,
    labels: &[(String, String)],
    metrics: &[CollectedMetric],
) -> usize {
    let mut accepted = 0;
    let mut saturated = false;
    for metric in metrics {
        let result = if saturated {
            buffer.try_push(metric.clone())
        } else {
            buffer.try_add(metric.clone(), ADD_TIMEOUT).await
        };
        if record(labels, result) {
            accepted += 1;
        } else {
            saturated = true;
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn backoff_steps_then_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30_000));
        let delays: Vec<u64> = (0..32)
            .map(|_| u64::try_from(backoff.next_delay().as_millis()).expect("fits"))
            .collect();
        assert_eq!(&delays[..3], &[1000, 2000, 3000]);
        assert_eq!(delays[29], 30_000);
        assert_eq!(delays[31], 30_000);
        assert!(backoff.capped());

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert!(!backoff.capped());
    }

    #[test]
    fn state_cell_round_trips() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    fn metrics(count: usize) -> Vec<CollectedMetric> {
        (0..count)
            .map(|i| {
                CollectedMetric::new(
                    "%COUNTER_INSTANCE%",
                    "Processor",
                    "% Processor Time",
                    Some(i.to_string()),
                    1.0,
                )
                .expect("valid metric")
            })
            .collect()
    }

    #[tokio::test]
    async fn saturated_batch_waits_once() {
        let buffer = Buffer::new(std::num::NonZeroUsize::new(2).expect("non-zero"));
        let labels = MetricsBuilder::new("graphite").build();

        let started = tokio::time::Instant::now();
        assert_eq!(enqueue_all(&buffer, &labels, &metrics(20)).await, 2);
        assert!(started.elapsed() < ADD_TIMEOUT * 3);
        assert_eq!(buffer.len(), 2);

        assert!(!enqueue(&buffer, &labels, metrics(1).remove(0)).await);
        buffer.close().await;
        assert_eq!(enqueue_all(&buffer, &labels, &metrics(3)).await, 0);
    }

    #[test]
    fn labels() {
        let labels = MetricsBuilder::new("graphite")
            .with_id(Some("carbon".to_string()))
            .build();
        let labels = with_reason(&labels, "buffer_full");
        assert_eq!(labels.len(), 4);
        assert_eq!(labels[3], ("reason".to_string(), "buffer_full".to_string()));
    }

    proptest! {
        #[test]
        fn nth_failure_waits_min_of_n_steps_and_max(
            step_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            n in 1u32..200,
        ) {
            let mut backoff = Backoff::new(Duration::from_millis(step_ms), Duration::from_millis(max_ms));
            let mut delay = Duration::ZERO;
            for _ in 0..n {
                delay = backoff.next_delay();
            }
            let expected = (u64::from(n) * step_ms).min(max_ms);
            prop_assert_eq!(delay, Duration::from_millis(expected));
        }
    }
}
