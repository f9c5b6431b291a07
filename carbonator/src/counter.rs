//! Host counter sources.
//!
//! A [`Source`] exposes the host's counters the way operators think of them:
//! named categories, each optionally split into instances, each carrying a
//! set of named counters. Opening a counter yields a [`Counter`] handle that
//! owns whatever previous reading it needs to turn cumulative kernel numbers
//! into rates. The first read of a fresh handle has no baseline, which is why
//! [`crate::watcher::Watcher`] primes every handle with one discarded read.
//!
//! [`procfs::Procfs`] is the native Linux source. [`memory::Memory`] is a
//! deterministic in-process source.

use std::fmt;

pub mod memory;
#[cfg(target_os = "linux")]
pub mod procfs;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Source`] and [`Counter`] implementations.
pub enum Error {
    /// The category is not known to the source.
    #[error("Counter category not found: {0}")]
    CategoryNotFound(String),
    /// The instance does not exist in the category.
    #[error("Instance {instance} not found in category {category}")]
    InstanceNotFound {
        /// Category searched
        category: String,
        /// Instance requested
        instance: String,
    },
    /// The counter does not exist.
    #[error("Counter not found: {0}")]
    CounterNotFound(CounterId),
    /// The subject of a bound counter is gone, a process exited or a device
    /// was removed.
    #[error("Counter subject vanished: {0}")]
    Vanished(CounterId),
    /// A kernel file did not have the expected shape.
    #[error("Malformed {file}: {reason}")]
    Malformed {
        /// The file being parsed
        file: &'static str,
        /// What was wrong
        reason: &'static str,
    },
    #[cfg(target_os = "linux")]
    /// Wrapper for [`::procfs::ProcError`]
    #[error("Unable to read procfs: {0}")]
    Proc(#[from] ::procfs::ProcError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// The identity of one counter.
pub struct CounterId {
    /// The category, e.g. `Processor`
    pub category: String,
    /// The counter name, e.g. `% Processor Time`
    pub name: String,
    /// The instance, e.g. `_Total`, absent for single-instance categories
    pub instance: Option<String>,
}

impl CounterId {
    /// Create a new [`CounterId`].
    #[must_use]
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        instance: Option<impl Into<String>>,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            instance: instance.map(Into::into),
        }
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "\\{}({instance})\\{}", self.category, self.name),
            None => write!(f, "\\{}\\{}", self.category, self.name),
        }
    }
}

/// The host's counter subsystem.
///
/// Implementations are shared between watchers and must tolerate concurrent
/// enumeration. Handles returned by [`Source::open`] are owned by a single
/// watcher and are never read concurrently.
pub trait Source: Send + Sync + fmt::Debug {
    /// Every category this source knows.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn categories(&self) -> Result<Vec<String>, Error>;

    /// The live instances of `category`. Empty for single-instance
    /// categories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CategoryNotFound`] for an unknown category.
    fn instances(&self, category: &str) -> Result<Vec<String>, Error>;

    /// The counters of `category`, scoped to `instance` when given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CategoryNotFound`] or [`Error::InstanceNotFound`]
    /// when the scope does not exist.
    fn counters(&self, category: &str, instance: Option<&str>) -> Result<Vec<String>, Error>;

    /// Open a handle onto one counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CounterNotFound`] if no such counter exists.
    fn open(&self, id: &CounterId) -> Result<Box<dyn Counter>, Error>;
}

/// A live handle onto one counter.
pub trait Counter: Send + fmt::Debug {
    /// Sample the counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vanished`] when the counter's subject is gone. Other
    /// errors are implementation specific.
    fn next_value(&mut self) -> Result<f32, Error>;
}
