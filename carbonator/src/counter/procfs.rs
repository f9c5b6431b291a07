//! The native Linux [`Source`], reading `/proc`.
//!
//! Categories and their counters:
//!
//! * `Processor`, one instance per CPU plus `_Total`, tick shares from
//!   `/proc/stat`
//! * `Memory`, no instances, from `/proc/meminfo`
//! * `System`, no instances, from `/proc/stat`, `/proc/loadavg` and
//!   `/proc/uptime`
//! * `Network Interface`, one instance per `/proc/net/dev` device
//! * `PhysicalDisk`, one instance per `/proc/diskstats` device
//! * `Process`, one instance per live process named `<comm>#<pid>`
//!
//! Rate and share counters report `0.0` until a handle has a baseline.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use ::procfs::{FromRead, FromReadSI, KernelStats, current_system_info};

use super::{Counter, CounterId, Error, Source};

mod disk;
mod memory;
mod network;
mod process;
mod processor;
mod system;

const DEFAULT_ROOT: &str = "/proc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Processor,
    Memory,
    System,
    NetworkInterface,
    PhysicalDisk,
    Process,
}

const CATEGORIES: [Category; 6] = [
    Category::Processor,
    Category::Memory,
    Category::System,
    Category::NetworkInterface,
    Category::PhysicalDisk,
    Category::Process,
];

impl Category {
    fn name(self) -> &'static str {
        match self {
            Category::Processor => "Processor",
            Category::Memory => "Memory",
            Category::System => "System",
            Category::NetworkInterface => "Network Interface",
            Category::PhysicalDisk => "PhysicalDisk",
            Category::Process => "Process",
        }
    }

    fn from_name(name: &str) -> Result<Self, Error> {
        CATEGORIES
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::CategoryNotFound(name.to_string()))
    }

    fn counters(self) -> &'static [&'static str] {
        match self {
            Category::Processor => processor::COUNTERS,
            Category::Memory => memory::COUNTERS,
            Category::System => system::COUNTERS,
            Category::NetworkInterface => network::COUNTERS,
            Category::PhysicalDisk => disk::COUNTERS,
            Category::Process => process::COUNTERS,
        }
    }

    fn instanced(self) -> bool {
        !matches!(self, Category::Memory | Category::System)
    }
}

#[derive(Debug, Clone)]
/// Counter source backed by procfs.
pub struct Procfs {
    root: PathBuf,
}

impl Default for Procfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Procfs {
    /// Create a source reading the host's `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    /// Create a source reading a procfs mounted, or mocked, at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Procfs {
    /// Whether `instance` exists in `category`, looking only at that one
    /// instance.
    fn has_instance(&self, category: Category, instance: &str) -> Result<bool, Error> {
        match category {
            Category::Processor => processor::exists(&self.root, instance),
            Category::Memory | Category::System => Ok(false),
            Category::NetworkInterface => network::exists(&self.root, instance),
            Category::PhysicalDisk => disk::exists(&self.root, instance),
            Category::Process => Ok(process::exists(&self.root, instance)),
        }
    }
}

impl Source for Procfs {
    fn categories(&self) -> Result<Vec<String>, Error> {
        Ok(CATEGORIES.iter().map(|c| c.name().to_string()).collect())
    }

    fn instances(&self, category: &str) -> Result<Vec<String>, Error> {
        match Category::from_name(category)? {
            Category::Processor => processor::instances(&self.root),
            Category::Memory | Category::System => Ok(Vec::new()),
            Category::NetworkInterface => network::instances(&self.root),
            Category::PhysicalDisk => disk::instances(&self.root),
            Category::Process => process::instances(&self.root),
        }
    }

    fn counters(&self, category: &str, instance: Option<&str>) -> Result<Vec<String>, Error> {
        let cat = Category::from_name(category)?;
        match (cat.instanced(), instance) {
            (false, None) => {}
            // Instanced categories carry no category-level counters.
            (true, None) => return Ok(Vec::new()),
            (_, Some(instance)) => {
                if !self.has_instance(cat, instance)? {
                    return Err(Error::InstanceNotFound {
                        category: category.to_string(),
                        instance: instance.to_string(),
                    });
                }
            }
        }
        Ok(cat.counters().iter().map(ToString::to_string).collect())
    }

    fn open(&self, id: &CounterId) -> Result<Box<dyn Counter>, Error> {
        let cat = Category::from_name(&id.category)?;
        if !cat.counters().contains(&id.name.as_str()) || cat.instanced() != id.instance.is_some() {
            return Err(Error::CounterNotFound(id.clone()));
        }
        match cat {
            Category::Processor => processor::open(&self.root, id),
            Category::Memory => memory::open(&self.root, id),
            Category::System => system::open(&self.root, id),
            Category::NetworkInterface => network::open(&self.root, id),
            Category::PhysicalDisk => disk::open(&self.root, id),
            Category::Process => process::open(&self.root, id),
        }
    }
}

/// Parse `file` under `root` as the procfs type `T`.
fn parse<T: FromRead>(root: &Path, file: &str) -> Result<T, Error> {
    Ok(T::from_file(root.join(file))?)
}

/// Parse `stat` under `root`.
fn kernel_stats(root: &Path) -> Result<KernelStats, Error> {
    Ok(KernelStats::from_file(root.join("stat"), current_system_info())?)
}

#[derive(Debug, Default)]
/// Turns a cumulative kernel count into a per-second rate.
struct Rate {
    previous: Option<(u64, Instant)>,
}

impl Rate {
    /// Rate of change since the previous call, `0.0` on the first call. A
    /// count that went backwards, a wrapped or reset counter, reads as zero.
    fn per_second(&mut self, current: u64, now: Instant) -> f64 {
        let Some((previous, at)) = self.previous.replace((current, now)) else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        current.saturating_sub(previous) as f64 / elapsed
    }
}

fn percent(part: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_possible_truncation)]
    let share = (part as f64 / total as f64 * 100.0) as f32;
    share
}

#[allow(clippy::cast_possible_truncation)]
fn narrow(value: f64) -> f32 {
    value as f32
}
