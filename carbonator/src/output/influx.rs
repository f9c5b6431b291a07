//! The InfluxDB line protocol output.
//!
//! Each delivery tick drains up to `max_batch_size` metrics, renders them as
//! line protocol and sends them in a single HTTP POST. A failed POST is
//! logged and its batch discarded; unlike the Graphite output nothing is put
//! back into the buffer.
//!
//! ## Metrics
//!
//! `metrics_enqueued`: Metrics accepted into the buffer
//! `metrics_dropped`: Metrics lost, labelled by `reason`
//! `bytes_written`: Request body bytes accepted by the server
//! `request_ok`: Successful POSTs
//! `request_failure`: Failed POSTs, by transport error or non-2xx status
//!

use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use carbonator_buffer::Buffer;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{
    General,
    common::{
        FIRST_TICK, MetricsBuilder, SHUTDOWN_GRACE, TAKE_TIMEOUT, enqueue, enqueue_all,
        with_reason,
    },
};
use crate::{
    metric::CollectedMetric,
    signals::Running,
    template::{Escape, Formatter},
    timer::Timer,
};

fn default_posting_interval_seconds() -> u64 {
    5
}

fn default_buffer_size() -> usize {
    50_000
}

fn default_max_batch_size() -> usize {
    1_000
}

fn default_timeout_seconds() -> u64 {
    5
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of this output.
pub struct Config {
    /// Full write URL, including database and precision query parameters
    pub posting_url: String,
    /// Seconds between delivery ticks
    #[serde(default = "default_posting_interval_seconds")]
    pub posting_interval_seconds: u64,
    /// Capacity of the metric buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Most metrics sent in one POST
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Bound on each POST
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Config {
    /// Create a configuration posting to `posting_url` with every other
    /// field at its default.
    #[must_use]
    pub fn new(posting_url: impl Into<String>) -> Self {
        Self {
            posting_url: posting_url.into(),
            posting_interval_seconds: default_posting_interval_seconds(),
            buffer_size: default_buffer_size(),
            max_batch_size: default_max_batch_size(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Influx`].
pub enum Error {
    /// The configuration is unusable.
    #[error("Invalid InfluxDB configuration: {0}")]
    Configuration(&'static str),
    /// The HTTP client could not be built.
    #[error("Unable to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    /// [`Influx::start`] was called twice.
    #[error("InfluxDB output already started")]
    AlreadyStarted,
}

/// Render `metric` as one line protocol line, without trailing newline.
fn line(formatter: &Formatter, metric: &CollectedMetric) -> String {
    let field = match metric.instance() {
        Some(instance) if !instance.trim().is_empty() => formatter.escape().apply(instance),
        _ => "value".to_string(),
    };
    format!(
        "{measurement} {field}={value:.2} {timestamp}",
        measurement = formatter.render(metric),
        value = metric.value(),
        timestamp = metric.unix_nanos(),
    )
}

#[derive(Debug)]
struct Shared {
    client: reqwest::Client,
    posting_url: String,
    max_batch_size: usize,
    buffer: Buffer<CollectedMetric>,
    formatter: Formatter,
    running: Running,
    labels: Vec<(String, String)>,
}

impl Shared {
    async fn deliver(&self) {
        let mut lines = Vec::with_capacity(self.max_batch_size.min(1024));
        while lines.len() < self.max_batch_size && self.running.is_running() {
            let Some(metric) = self.buffer.try_take(TAKE_TIMEOUT).await else {
                break;
            };
            lines.push(line(&self.formatter, &metric));
        }
        if lines.is_empty() {
            return;
        }

        let batch = lines.len();
        let body = lines.join("\n");
        let body_len = body.len();
        match self.client.post(&self.posting_url).body(body).send().await {
            Ok(response) if response.status().is_success() => {
                counter!("request_ok", &self.labels).increment(1);
                counter!("bytes_written", &self.labels).increment(body_len as u64);
                debug!("posted {batch} metrics to {}", self.posting_url);
            }
            Ok(response) => {
                warn!(
                    "posting {batch} metrics to {} failed with status {}; batch discarded",
                    self.posting_url,
                    response.status()
                );
                self.discard(batch);
            }
            Err(err) => {
                warn!(
                    "posting {batch} metrics to {} failed: {err}; batch discarded",
                    self.posting_url
                );
                self.discard(batch);
            }
        }
    }

    fn discard(&self, batch: usize) {
        counter!("request_failure", &self.labels).increment(1);
        counter!("metrics_dropped", &with_reason(&self.labels, "batch_failed"))
            .increment(batch as u64);
    }
}

#[derive(Debug)]
/// The InfluxDB output.
pub struct Influx {
    shared: Arc<Shared>,
    posting_interval: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
    timer: Mutex<Option<Timer>>,
}

impl Influx {
    /// Create a new [`Influx`] output.
    ///
    /// # Errors
    ///
    /// Fails if the URL is empty, any size or interval is zero or the HTTP
    /// client cannot be built.
    pub fn new(general: General, config: &Config, running: Running) -> Result<Self, Error> {
        if config.posting_url.is_empty() {
            return Err(Error::Configuration("posting_url must not be empty"));
        }
        if config.posting_interval_seconds == 0 {
            return Err(Error::Configuration("posting_interval_seconds must be positive"));
        }
        if config.max_batch_size == 0 {
            return Err(Error::Configuration("max_batch_size must be positive"));
        }
        if config.timeout_seconds == 0 {
            return Err(Error::Configuration("timeout_seconds must be positive"));
        }
        let capacity = NonZeroUsize::new(config.buffer_size)
            .ok_or(Error::Configuration("buffer_size must be positive"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        let labels = MetricsBuilder::new("influx").with_id(general.id).build();

        let shared = Shared {
            client,
            posting_url: config.posting_url.clone(),
            max_batch_size: config.max_batch_size,
            buffer: Buffer::new(capacity),
            formatter: Formatter::new("", Escape::LineProtocol),
            running,
            labels,
        };
        Ok(Self {
            shared: Arc::new(shared),
            posting_interval: Duration::from_secs(config.posting_interval_seconds),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    /// Arm the delivery timer. The first tick fires after 100ms.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        let shared = Arc::clone(&self.shared);
        let timer = Timer::spawn(
            format!("influx {}", self.shared.posting_url),
            FIRST_TICK,
            self.posting_interval,
            self.shared.running.clone(),
            move || {
                let shared = Arc::clone(&shared);
                async move { shared.deliver().await }
            },
        );
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        info!("influx output to {} started", self.shared.posting_url);
        Ok(())
    }

    /// Offer `metric` to the buffer, waiting up to 100ms for space. Returns
    /// `false` if the metric was not accepted and is lost.
    pub async fn try_add(&self, metric: CollectedMetric) -> bool {
        enqueue(&self.shared.buffer, &self.shared.labels, metric).await
    }

    /// Offer a batch of metrics. Once the buffer rejects one, the rest are
    /// pushed without waiting. Returns how many were accepted.
    pub async fn offer(&self, metrics: &[CollectedMetric]) -> usize {
        enqueue_all(&self.shared.buffer, &self.shared.labels, metrics).await
    }

    /// Run one delivery pass now, outside the timer.
    pub async fn deliver(&self) {
        self.shared.deliver().await;
    }

    #[must_use]
    /// Metrics currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }

    #[must_use]
    /// Where this output delivers to.
    pub fn destination(&self) -> &str {
        &self.shared.posting_url
    }

    /// Stop delivering. Metrics still buffered are counted as dropped. Safe
    /// to call repeatedly.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.running.stop();

        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut timer) = timer {
            timer.shutdown(SHUTDOWN_GRACE).await;
        }

        self.shared.buffer.close().await;
        let lost = self.shared.buffer.clear().await;
        if lost > 0 {
            warn!(
                "{lost} metrics for {} were still buffered at shutdown",
                self.shared.posting_url
            );
            counter!("metrics_dropped", &with_reason(&self.shared.labels, "shutdown"))
                .increment(lost as u64);
        }
        info!("influx output to {} stopped", self.shared.posting_url);
    }
}
