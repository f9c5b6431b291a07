use std::path::{Path, PathBuf};

use ::procfs::{CpuTime, KernelStats};

use super::{Counter, CounterId, Error, kernel_stats, percent};

pub(super) const COUNTERS: &[&str] = &[
    "% Processor Time",
    "% User Time",
    "% Privileged Time",
    "% Idle Time",
    "% IOWait Time",
];

const TOTAL: &str = "_Total";

#[derive(Debug, Clone, Copy)]
enum Kind {
    Processor,
    User,
    Privileged,
    Idle,
    IoWait,
}

impl Kind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "% Processor Time" => Kind::Processor,
            "% User Time" => Kind::User,
            "% Privileged Time" => Kind::Privileged,
            "% Idle Time" => Kind::Idle,
            "% IOWait Time" => Kind::IoWait,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Times {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl From<&CpuTime> for Times {
    // Fields a kernel does not report read as zero.
    fn from(cpu: &CpuTime) -> Self {
        Self {
            user: cpu.user,
            nice: cpu.nice,
            system: cpu.system,
            idle: cpu.idle,
            iowait: cpu.iowait.unwrap_or_default(),
            irq: cpu.irq.unwrap_or_default(),
            softirq: cpu.softirq.unwrap_or_default(),
            steal: cpu.steal.unwrap_or_default(),
        }
    }
}

impl Times {
    // guest and guest_nice are already folded into user and nice.
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn delta(&self, earlier: &Times) -> Times {
        Times {
            user: self.user.saturating_sub(earlier.user),
            nice: self.nice.saturating_sub(earlier.nice),
            system: self.system.saturating_sub(earlier.system),
            idle: self.idle.saturating_sub(earlier.idle),
            iowait: self.iowait.saturating_sub(earlier.iowait),
            irq: self.irq.saturating_sub(earlier.irq),
            softirq: self.softirq.saturating_sub(earlier.softirq),
            steal: self.steal.saturating_sub(earlier.steal),
        }
    }

    fn share(&self, kind: Kind) -> f32 {
        let total = self.total();
        match kind {
            Kind::Processor => percent(total - self.idle - self.iowait, total),
            Kind::User => percent(self.user + self.nice, total),
            Kind::Privileged => percent(self.system + self.irq + self.softirq, total),
            Kind::Idle => percent(self.idle, total),
            Kind::IoWait => percent(self.iowait, total),
        }
    }
}

/// The times for `instance`, `_Total` or a CPU's position in `/proc/stat`.
fn times(stats: &KernelStats, instance: &str) -> Option<Times> {
    if instance == TOTAL {
        return Some(Times::from(&stats.total));
    }
    let index: usize = instance.parse().ok()?;
    stats.cpu_time.get(index).map(Times::from)
}

pub(super) fn instances(root: &Path) -> Result<Vec<String>, Error> {
    let stats = kernel_stats(root)?;
    Ok(std::iter::once(TOTAL.to_string())
        .chain((0..stats.cpu_time.len()).map(|cpu| cpu.to_string()))
        .collect())
}

pub(super) fn exists(root: &Path, instance: &str) -> Result<bool, Error> {
    Ok(times(&kernel_stats(root)?, instance).is_some())
}

pub(super) fn open(root: &Path, id: &CounterId) -> Result<Box<dyn Counter>, Error> {
    let kind = Kind::from_name(&id.name).ok_or_else(|| Error::CounterNotFound(id.clone()))?;
    let instance = id
        .instance
        .clone()
        .ok_or_else(|| Error::CounterNotFound(id.clone()))?;
    if !exists(root, &instance)? {
        return Err(Error::CounterNotFound(id.clone()));
    }
    Ok(Box::new(Handle {
        root: root.to_path_buf(),
        id: id.clone(),
        instance,
        kind,
        previous: None,
    }))
}

#[derive(Debug)]
struct Handle {
    root: PathBuf,
    id: CounterId,
    instance: String,
    kind: Kind,
    previous: Option<Times>,
}

impl Counter for Handle {
    fn next_value(&mut self) -> Result<f32, Error> {
        let current = times(&kernel_stats(&self.root)?, &self.instance)
            .ok_or_else(|| Error::Vanished(self.id.clone()))?;
        let Some(previous) = self.previous.replace(current) else {
            return Ok(0.0);
        };
        Ok(current.delta(&previous).share(self.kind))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::super::tests::fixture;
    use super::*;

    const STAT_A: &str = "cpu  100 0 50 800 50 0 0 0 0 0\n\
cpu0 60 0 30 380 30 0 0 0 0 0\n\
cpu1 40 0 20 420 20 0 0 0 0 0\n\
intr 12345 0 0\n\
ctxt 1000\n\
btime 1700000000\n\
processes 500\n";

    const STAT_B: &str = "cpu  160 0 70 900 70 0 0 0 0 0\n\
cpu0 120 0 50 380 50 0 0 0 0 0\n\
cpu1 40 0 20 520 20 0 0 0 0 0\n\
intr 12345 0 0\n\
ctxt 1500\n\
btime 1700000000\n\
processes 510\n";

    fn id(name: &str, instance: &str) -> CounterId {
        CounterId::new("Processor", name, Some(instance))
    }

    #[test]
    fn instances_list_total_and_each_cpu() {
        let dir = fixture(&[("stat", STAT_A)]);
        assert_eq!(instances(dir.path()).expect("instances"), ["_Total", "0", "1"]);
        assert!(exists(dir.path(), "1").expect("exists"));
        assert!(!exists(dir.path(), "2").expect("exists"));
        assert!(!exists(dir.path(), "cpu0").expect("exists"));
    }

    #[test]
    fn short_lines_default_to_zero() {
        let dir = fixture(&[("stat", "cpu 1 2 3 4\nctxt 1\nbtime 1\nprocesses 1\n")]);
        let stats = kernel_stats(dir.path()).expect("parse");
        let total = times(&stats, TOTAL).expect("total");
        assert_eq!(total.idle, 4);
        assert_eq!(total.steal, 0);
        assert!(times(&stats, "7").is_none());

        fs::write(dir.path().join("stat"), "cpu 1 2 x\nctxt 1\nbtime 1\nprocesses 1\n")
            .expect("rewrite");
        assert!(matches!(kernel_stats(dir.path()), Err(Error::Proc(_))));
    }

    #[test]
    fn shares_come_from_tick_deltas() {
        let dir = fixture(&[("stat", STAT_A)]);
        let mut busy = open(dir.path(), &id("% Processor Time", "_Total")).expect("open");
        let mut idle = open(dir.path(), &id("% Idle Time", "0")).expect("open");
        let mut user = open(dir.path(), &id("% User Time", "0")).expect("open");

        // No baseline yet.
        assert!(busy.next_value().expect("read").abs() < f32::EPSILON);
        assert!(idle.next_value().expect("read").abs() < f32::EPSILON);
        assert!(user.next_value().expect("read").abs() < f32::EPSILON);

        fs::write(dir.path().join("stat"), STAT_B).expect("rewrite");
        // _Total: 60 user + 20 system + 100 idle + 20 iowait = 200 ticks, 80 busy.
        assert!((busy.next_value().expect("read") - 40.0).abs() < 1e-4);
        // cpu0: 60 user + 20 system + 20 iowait = 100 ticks, none idle.
        assert!(idle.next_value().expect("read").abs() < 1e-4);
        assert!((user.next_value().expect("read") - 60.0).abs() < 1e-4);
    }

    #[test]
    fn missing_cpu_vanishes() {
        let dir = fixture(&[("stat", STAT_A)]);
        let mut counter = open(dir.path(), &id("% Idle Time", "1")).expect("open");
        fs::write(
            dir.path().join("stat"),
            "cpu 1 1 1 1\ncpu0 1 1 1 1\nctxt 1\nbtime 1\nprocesses 1\n",
        )
        .expect("rewrite");
        assert!(matches!(counter.next_value(), Err(Error::Vanished(_))));
        assert!(matches!(
            open(dir.path(), &id("% Idle Time", "9")),
            Err(Error::CounterNotFound(_))
        ));
    }
}
