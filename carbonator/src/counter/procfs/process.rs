use std::{path::Path, time::Instant};

use ::procfs::{
    ProcError,
    process::{Process, Stat, all_processes_with_root},
};
use tracing::debug;

use super::{Counter, CounterId, Error, Rate, narrow};

pub(super) const COUNTERS: &[&str] = &[
    "% Processor Time",
    "Working Set",
    "Virtual Bytes",
    "Thread Count",
];

#[derive(Debug, Clone, Copy)]
enum Kind {
    Processor,
    WorkingSet,
    Virtual,
    Threads,
}

impl Kind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "% Processor Time" => Kind::Processor,
            "Working Set" => Kind::WorkingSet,
            "Virtual Bytes" => Kind::Virtual,
            "Thread Count" => Kind::Threads,
            _ => return None,
        })
    }
}

fn instance_name(stat: &Stat) -> String {
    format!("{}#{}", stat.comm, stat.pid)
}

/// Split `<comm>#<pid>`. The command name may itself contain `#`.
fn split_instance(instance: &str) -> Option<(&str, i32)> {
    let (comm, pid) = instance.rsplit_once('#')?;
    Some((comm, pid.parse().ok()?))
}

pub(super) fn instances(root: &Path) -> Result<Vec<String>, Error> {
    Ok(all_processes_with_root(root)?
        .filter_map(Result::ok)
        .filter_map(|process| process.stat().ok())
        .map(|stat| instance_name(&stat))
        .collect())
}

/// The live process behind `instance`, if its pid is still running the
/// named command.
fn lookup<'a>(root: &Path, instance: &'a str) -> Option<(&'a str, Process)> {
    let (comm, pid) = split_instance(instance)?;
    let process = Process::new_with_root(root.join(pid.to_string())).ok()?;
    match process.stat() {
        Ok(stat) if stat.comm == comm => Some((comm, process)),
        _ => None,
    }
}

pub(super) fn exists(root: &Path, instance: &str) -> bool {
    lookup(root, instance).is_some()
}

pub(super) fn open(root: &Path, id: &CounterId) -> Result<Box<dyn Counter>, Error> {
    let kind = Kind::from_name(&id.name).ok_or_else(|| Error::CounterNotFound(id.clone()))?;
    let (comm, process) = id
        .instance
        .as_deref()
        .and_then(|instance| lookup(root, instance))
        .ok_or_else(|| Error::CounterNotFound(id.clone()))?;
    Ok(Box::new(Handle {
        id: id.clone(),
        comm: comm.to_string(),
        process,
        kind,
        rate: Rate::default(),
    }))
}

#[derive(Debug)]
struct Handle {
    id: CounterId,
    comm: String,
    process: Process,
    kind: Kind,
    rate: Rate,
}

impl Handle {
    fn stat(&self) -> Result<Stat, Error> {
        match self.process.stat() {
            // A recycled pid is a different process.
            Ok(stat) if stat.comm == self.comm => Ok(stat),
            Ok(_) => Err(Error::Vanished(self.id.clone())),
            Err(err @ ProcError::PermissionDenied(_)) => Err(err.into()),
            Err(err) => {
                debug!("process behind {id} is gone: {err}", id = self.id);
                Err(Error::Vanished(self.id.clone()))
            }
        }
    }
}

impl Counter for Handle {
    #[allow(clippy::cast_sign_loss)]
    fn next_value(&mut self) -> Result<f32, Error> {
        let stat = self.stat()?;
        let value = match self.kind {
            Kind::Processor => {
                // See sysconf(3).
                let ticks_per_second =
                    unsafe { nix::libc::sysconf(nix::libc::_SC_CLK_TCK) } as f64;
                let ticks = stat.utime.saturating_add(stat.stime);
                let ticks_rate = self.rate.per_second(ticks, Instant::now());
                if ticks_per_second > 0.0 {
                    ticks_rate / ticks_per_second * 100.0
                } else {
                    0.0
                }
            }
            Kind::WorkingSet => {
                let page_size = unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) }.max(0) as u64;
                stat.rss.saturating_mul(page_size) as f64
            }
            Kind::Virtual => stat.vsize as f64,
            Kind::Threads => stat.num_threads.max(0) as f64,
        };
        Ok(narrow(value))
    }
}
