//! The collection engine.
//!
//! An [`Engine`] owns the active watchers, the output clients and the single
//! collection timer. Each tick samples every watcher and offers the samples
//! to every client concurrently, so a full output never holds up the rest. Watchers that fail to initialize are excluded for the
//! life of the process; they are not retried.
//!
//! ## Metrics
//!
//! `metrics_collected`: Samples produced by collection ticks
//!

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use futures::future::join_all;
use metrics::counter;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    counter::Source,
    output::{self, Client},
    signals::Running,
    timer::Timer,
    watcher::Watcher,
};

/// Upper bound on an in-flight collection tick at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Engine`].
pub enum Error {
    /// Not a single output could be built.
    #[error("No usable output configured")]
    NoOutputs,
    /// See [`crate::output::Error`] for details.
    #[error(transparent)]
    Output(#[from] output::Error),
}

#[derive(Debug)]
struct Shared {
    watchers: Mutex<Vec<Watcher>>,
    clients: Vec<Client>,
    running: Running,
}

impl Shared {
    async fn collect(&self) -> usize {
        let metrics = {
            let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
            let mut sink = Vec::new();
            for watcher in watchers.iter_mut() {
                if let Err(err) = watcher.report(&mut sink, false) {
                    warn!(
                        "sampling {category} failed: {err}",
                        category = watcher.selector().category
                    );
                }
            }
            sink
        };
        counter!("metrics_collected").increment(metrics.len() as u64);

        if !self.running.is_running() {
            return metrics.len();
        }
        let metrics = &metrics;
        join_all(self.clients.iter().map(|client| async move {
            let accepted = client.offer(metrics).await;
            if accepted < metrics.len() {
                warn!(
                    "{dropped} of {total} metrics not accepted by {name} output {destination}",
                    dropped = metrics.len() - accepted,
                    total = metrics.len(),
                    name = client.name(),
                    destination = client.destination(),
                );
            }
        }))
        .await;
        metrics.len()
    }
}

#[derive(Debug)]
/// Drives collection and delivery for one configuration.
pub struct Engine {
    shared: Arc<Shared>,
    interval: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
    timer: Mutex<Option<Timer>>,
}

impl Engine {
    /// Build the watchers and output clients named by `config`, resolving
    /// counters against `source`.
    ///
    /// A selector that fails to resolve is logged and excluded. An output
    /// with invalid configuration is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoOutputs`] if no output could be built.
    pub fn new(config: &Config, source: Arc<dyn Source>) -> Result<Self, Error> {
        let running = Running::new();

        let mut clients = Vec::with_capacity(config.outputs.len());
        for output in &config.outputs {
            match Client::new(output.clone(), running.clone()) {
                Ok(client) => {
                    info!(
                        "configured {name} output to {destination}",
                        name = client.name(),
                        destination = client.destination()
                    );
                    clients.push(client);
                }
                Err(err) => error!("skipping output: {err}"),
            }
        }
        if clients.is_empty() {
            return Err(Error::NoOutputs);
        }

        let mut watchers = Vec::with_capacity(config.counters.len());
        for selector in &config.counters {
            let mut watcher = Watcher::new(selector.clone(), Arc::clone(&source));
            match watcher.initialize() {
                Ok(_) => watchers.push(watcher),
                Err(err) => error!(
                    "excluding counters for template {template}: {err}",
                    template = selector.template
                ),
            }
        }
        if watchers.is_empty() {
            warn!("no counters resolved; nothing will be collected");
        }

        Ok(Self {
            shared: Arc::new(Shared {
                watchers: Mutex::new(watchers),
                clients,
                running,
            }),
            interval: Duration::from_millis(config.collection_interval_milliseconds),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    #[must_use]
    /// The number of active watchers.
    pub fn watchers(&self) -> usize {
        self.shared
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    /// The output clients.
    pub fn clients(&self) -> &[Client] {
        &self.shared.clients
    }

    #[must_use]
    /// The flag every loop of this engine observes.
    pub fn running(&self) -> &Running {
        &self.shared.running
    }

    /// Start every output and arm the collection timer. Calling this more
    /// than once, or after [`Engine::stop`], does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if an output fails to start.
    pub fn start(&self) -> Result<(), Error> {
        if self.stopped.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for client in &self.shared.clients {
            client.start()?;
        }

        let shared = Arc::clone(&self.shared);
        let timer = Timer::spawn(
            "collection",
            self.interval,
            self.interval,
            self.shared.running.clone(),
            move || {
                let shared = Arc::clone(&shared);
                async move {
                    shared.collect().await;
                }
            },
        );
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        info!(
            "collection started every {interval:?} across {outputs} outputs",
            interval = self.interval,
            outputs = self.shared.clients.len()
        );
        Ok(())
    }

    /// Run one collection tick now. Returns the number of samples taken.
    pub async fn collect(&self) -> usize {
        self.shared.collect().await
    }

    /// Stop collection and delivery. The running flag flips first, then the
    /// collection timer, the outputs and the watchers are shut down in that
    /// order. Safe to call repeatedly.
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
        for client in &self.shared.clients {
            client.stop().await;
        }
        for watcher in self
            .shared
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
        {
            watcher.dispose();
        }
        info!("collection stopped");
    }
}
