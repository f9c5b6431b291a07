//! The Graphite plaintext protocol output.
//!
//! Metrics are written one per line, `<path> <value> <unix seconds>\n`, to a
//! single persistent TCP connection. A failed connection attempt backs off
//! by a fixed step per consecutive failure up to a cap. A failed write drops
//! the connection and puts the in-flight metric back into the buffer.
//!
//! ## Metrics
//!
//! `metrics_enqueued`: Metrics accepted into the buffer
//! `metrics_dropped`: Metrics lost, labelled by `reason`
//! `bytes_written`: Bytes written successfully
//! `request_failure`: Number of failed writes; each occurrence causes a reconnect
//! `connection_failure`: Number of connection failures
//!

use std::{
    io,
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use carbonator_buffer::Buffer;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};

use super::{
    General,
    common::{
        Backoff, ConnectionState, FIRST_TICK, MetricsBuilder, REQUEUE_TIMEOUT, SHUTDOWN_GRACE,
        StateCell, TAKE_TIMEOUT, enqueue, enqueue_all, with_reason,
    },
};
use crate::{
    metric::CollectedMetric,
    signals::Running,
    template::{Escape, Formatter},
    timer::Timer,
};

fn default_port() -> u16 {
    2003
}

fn default_reporting_interval_seconds() -> u64 {
    5
}

fn default_buffer_size() -> usize {
    50_000
}

fn default_reconnect_interval_step_milliseconds() -> u64 {
    1_000
}

fn default_reconnect_interval_max_milliseconds() -> u64 {
    30_000
}

fn default_connect_timeout_milliseconds() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of this output.
pub struct Config {
    /// Host name or address of the Graphite server
    pub server: String,
    /// TCP port of the Graphite plaintext listener
    #[serde(default = "default_port")]
    pub port: u16,
    /// Static string prepended to every rendered path
    #[serde(default)]
    pub prefix: String,
    /// Seconds between delivery ticks
    #[serde(default = "default_reporting_interval_seconds")]
    pub reporting_interval_seconds: u64,
    /// Capacity of the metric buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Backoff added per consecutive failed connection attempt
    #[serde(default = "default_reconnect_interval_step_milliseconds")]
    pub reconnect_interval_step_milliseconds: u64,
    /// Cap on the backoff between connection attempts
    #[serde(default = "default_reconnect_interval_max_milliseconds")]
    pub reconnect_interval_max_milliseconds: u64,
    /// Bound on each individual connection attempt
    #[serde(default = "default_connect_timeout_milliseconds")]
    pub connect_timeout_milliseconds: u64,
}

impl Config {
    /// Create a configuration for `server` with every other field at its
    /// default.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: default_port(),
            prefix: String::new(),
            reporting_interval_seconds: default_reporting_interval_seconds(),
            buffer_size: default_buffer_size(),
            reconnect_interval_step_milliseconds: default_reconnect_interval_step_milliseconds(),
            reconnect_interval_max_milliseconds: default_reconnect_interval_max_milliseconds(),
            connect_timeout_milliseconds: default_connect_timeout_milliseconds(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Graphite`].
pub enum Error {
    /// The configuration is unusable.
    #[error("Invalid Graphite configuration: {0}")]
    Configuration(&'static str),
    /// [`Graphite::start`] was called twice.
    #[error("Graphite output already started")]
    AlreadyStarted,
}

#[async_trait]
/// Opens the stream a [`Graphite`] output writes to.
pub trait Connector: Send + Sync + 'static {
    /// The stream type produced
    type Stream: AsyncWrite + Unpin + Send + 'static;

    /// Make one connection attempt.
    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Human readable destination, for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
/// A [`Connector`] opening TCP connections. The address is resolved anew on
/// every attempt so DNS changes are picked up on reconnect.
pub struct TcpConnector {
    server: String,
    port: u16,
    timeout: Duration,
}

impl TcpConnector {
    /// Create a new [`TcpConnector`].
    #[must_use]
    pub fn new(server: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let attempt = TcpStream::connect((self.server.as_str(), self.port));
        match time::timeout(self.timeout, attempt).await {
            Ok(result) => {
                let stream = result?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection attempt exceeded {:?}", self.timeout),
            )),
        }
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Render `metric` as one plaintext protocol line.
fn line(formatter: &Formatter, metric: &CollectedMetric) -> String {
    format!(
        "{path} {value:.3} {timestamp}\n",
        path = formatter.render(metric),
        value = metric.value(),
        timestamp = metric.unix_seconds(),
    )
}

struct Connection<S> {
    stream: Option<S>,
    backoff: Backoff,
}

struct Shared<C: Connector> {
    connector: C,
    destination: String,
    buffer: Buffer<CollectedMetric>,
    formatter: Formatter,
    connection: tokio::sync::Mutex<Connection<C::Stream>>,
    state: StateCell,
    running: Running,
    labels: Vec<(String, String)>,
}

impl<C: Connector> Shared<C> {
    /// One delivery pass: connect if needed, then drain.
    async fn deliver(&self) {
        let mut connection = self.connection.lock().await;
        if !self.connect(&mut connection).await {
            return;
        }

        let mut written = 0usize;
        while self.running.is_running() {
            let Some(stream) = connection.stream.as_mut() else {
                break;
            };
            let Some(metric) = self.buffer.try_take(TAKE_TIMEOUT).await else {
                break;
            };
            let line = line(&self.formatter, &metric);
            match stream.write_all(line.as_bytes()).await {
                Ok(()) => {
                    written += 1;
                    counter!("bytes_written", &self.labels).increment(line.len() as u64);
                }
                Err(err) => {
                    warn!("write to {} failed, reconnecting: {err}", self.destination);
                    counter!("request_failure", &self.labels).increment(1);
                    connection.stream = None;
                    self.state.set(ConnectionState::Disconnected);
                    self.requeue(metric).await;
                    break;
                }
            }
        }
        if let Some(stream) = connection.stream.as_mut() {
            if let Err(err) = stream.flush().await {
                warn!("flush to {} failed: {err}", self.destination);
                connection.stream = None;
                self.state.set(ConnectionState::Disconnected);
            }
        }
        debug!("delivered {written} metrics to {}", self.destination);
    }

    /// Connect, backing off between failed attempts, until connected or
    /// stopped. Returns whether a connection is available.
    async fn connect(&self, connection: &mut Connection<C::Stream>) -> bool {
        while connection.stream.is_none() {
            if !self.running.is_running() {
                self.state.set(ConnectionState::Disconnected);
                return false;
            }
            self.state.set(ConnectionState::Connecting);
            match self.connector.connect().await {
                Ok(stream) => {
                    info!(
                        "connected to {} after {} failed attempts",
                        self.destination,
                        connection.backoff.failures()
                    );
                    connection.stream = Some(stream);
                    connection.backoff.reset();
                    self.state.set(ConnectionState::Connected);
                }
                Err(err) => {
                    counter!("connection_failure", &self.labels).increment(1);
                    let delay = connection.backoff.next_delay();
                    let attempt = connection.backoff.failures();
                    if attempt == 1 {
                        error!(
                            "unable to connect to {}: {err}; retrying in {delay:?}",
                            self.destination
                        );
                    } else if connection.backoff.capped() {
                        debug!(
                            "attempt {attempt} to connect to {} failed: {err}; retrying in {delay:?}",
                            self.destination
                        );
                    } else {
                        warn!(
                            "attempt {attempt} to connect to {} failed: {err}; retrying in {delay:?}",
                            self.destination
                        );
                    }
                    tokio::select! {
                        () = time::sleep(delay) => {}
                        () = self.running.stopped() => {}
                    }
                }
            }
        }
        true
    }

    async fn requeue(&self, metric: CollectedMetric) {
        if self.buffer.try_add(metric, REQUEUE_TIMEOUT).await.is_err() {
            error!(
                "unable to return metric to the buffer for {}, buffer may be full; metric lost",
                self.destination
            );
            counter!("metrics_dropped", &with_reason(&self.labels, "requeue_failed")).increment(1);
        }
    }
}

/// The Graphite output.
pub struct Graphite<C: Connector = TcpConnector> {
    shared: Arc<Shared<C>>,
    reporting_interval: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
    timer: Mutex<Option<Timer>>,
}

impl<C: Connector> std::fmt::Debug for Graphite<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graphite")
            .field("destination", &self.shared.destination)
            .field("state", &self.shared.state.get())
            .field("buffered", &self.shared.buffer.len())
            .finish_non_exhaustive()
    }
}

impl Graphite<TcpConnector> {
    /// Create a new [`Graphite`] output connecting over TCP.
    ///
    /// # Errors
    ///
    /// Fails if the server is empty or the buffer, interval or backoff step
    /// are zero.
    pub fn new(general: General, config: &Config, running: Running) -> Result<Self, Error> {
        let connector = TcpConnector::new(
            config.server.clone(),
            config.port,
            Duration::from_millis(config.connect_timeout_milliseconds),
        );
        Self::with_connector(general, config, connector, running)
    }
}

impl<C: Connector> Graphite<C> {
    /// Create a new [`Graphite`] output over an arbitrary [`Connector`].
    ///
    /// # Errors
    ///
    /// See [`Graphite::new`].
    pub fn with_connector(
        general: General,
        config: &Config,
        connector: C,
        running: Running,
    ) -> Result<Self, Error> {
        if config.server.is_empty() {
            return Err(Error::Configuration("server must not be empty"));
        }
        if config.reporting_interval_seconds == 0 {
            return Err(Error::Configuration("reporting_interval_seconds must be positive"));
        }
        if config.reconnect_interval_step_milliseconds == 0 {
            return Err(Error::Configuration(
                "reconnect_interval_step_milliseconds must be positive",
            ));
        }
        let capacity = NonZeroUsize::new(config.buffer_size)
            .ok_or(Error::Configuration("buffer_size must be positive"))?;

        let labels = MetricsBuilder::new("graphite").with_id(general.id).build();
        let destination = connector.describe();
        let shared = Shared {
            connector,
            destination,
            buffer: Buffer::new(capacity),
            formatter: Formatter::new(config.prefix.clone(), Escape::Sanitize),
            connection: tokio::sync::Mutex::new(Connection {
                stream: None,
                backoff: Backoff::new(
                    Duration::from_millis(config.reconnect_interval_step_milliseconds),
                    Duration::from_millis(
                        config
                            .reconnect_interval_max_milliseconds
                            .max(config.reconnect_interval_step_milliseconds),
                    ),
                ),
            }),
            state: StateCell::default(),
            running,
            labels,
        };

        Ok(Self {
            shared: Arc::new(shared),
            reporting_interval: Duration::from_secs(config.reporting_interval_seconds),
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
            format!("graphite {}", self.shared.destination),
            FIRST_TICK,
            self.reporting_interval,
            self.shared.running.clone(),
            move || {
                let shared = Arc::clone(&shared);
                async move { shared.deliver().await }
            },
        );
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        info!("graphite output to {} started", self.shared.destination);
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
    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    #[must_use]
    /// Metrics currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }

    #[must_use]
    /// Where this output delivers to.
    pub fn destination(&self) -> &str {
        &self.shared.destination
    }

    /// Stop delivering: flip the running flag, shut the timer down, close
    /// the connection and release the buffer. Metrics still buffered are
    /// counted as dropped. Safe to call repeatedly.
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

        match time::timeout(SHUTDOWN_GRACE, self.shared.connection.lock()).await {
            Ok(mut connection) => {
                if let Some(mut stream) = connection.stream.take() {
                    if time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await.is_err() {
                        warn!("closing connection to {} timed out", self.shared.destination);
                    }
                }
            }
            Err(_) => warn!(
                "delivery to {} still busy after {SHUTDOWN_GRACE:?}, abandoning connection",
                self.shared.destination
            ),
        }
        self.shared.state.set(ConnectionState::Disconnected);

        self.shared.buffer.close().await;
        let lost = self.shared.buffer.clear().await;
        if lost > 0 {
            warn!(
                "{lost} metrics for {} were still buffered at shutdown",
                self.shared.destination
            );
            counter!("metrics_dropped", &with_reason(&self.shared.labels, "shutdown"))
                .increment(lost as u64);
        }
        info!("graphite output to {} stopped", self.shared.destination);
    }
}
