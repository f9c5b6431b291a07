use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use ::procfs::{LoadAverage, Uptime};

use super::{Counter, CounterId, Error, Rate, kernel_stats, narrow, parse};

pub(super) const COUNTERS: &[&str] = &[
    "Processor Queue Length",
    "Processes",
    "Context Switches/sec",
    "Load Average 1m",
    "Load Average 5m",
    "Load Average 15m",
    "System Up Time",
];

#[derive(Debug, Clone, Copy)]
enum Kind {
    QueueLength,
    Processes,
    ContextSwitches,
    Load1,
    Load5,
    Load15,
    UpTime,
}

impl Kind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Processor Queue Length" => Kind::QueueLength,
            "Processes" => Kind::Processes,
            "Context Switches/sec" => Kind::ContextSwitches,
            "Load Average 1m" => Kind::Load1,
            "Load Average 5m" => Kind::Load5,
            "Load Average 15m" => Kind::Load15,
            "System Up Time" => Kind::UpTime,
            _ => return None,
        })
    }
}

pub(super) fn open(root: &Path, id: &CounterId) -> Result<Box<dyn Counter>, Error> {
    let kind = Kind::from_name(&id.name).ok_or_else(|| Error::CounterNotFound(id.clone()))?;
    Ok(Box::new(Handle {
        root: root.to_path_buf(),
        kind,
        rate: Rate::default(),
    }))
}

#[derive(Debug)]
struct Handle {
    root: PathBuf,
    kind: Kind,
    rate: Rate,
}

impl Counter for Handle {
    fn next_value(&mut self) -> Result<f32, Error> {
        let value = match self.kind {
            // procs_running is absent before 2.5.45.
            Kind::QueueLength => kernel_stats(&self.root)?
                .procs_running
                .map(f64::from)
                .ok_or(Error::Malformed {
                    file: "stat",
                    reason: "missing procs_running",
                })?,
            Kind::ContextSwitches => {
                let ctxt = kernel_stats(&self.root)?.ctxt;
                self.rate.per_second(ctxt, Instant::now())
            }
            Kind::UpTime => parse::<Uptime>(&self.root, "uptime")?.uptime,
            Kind::Processes | Kind::Load1 | Kind::Load5 | Kind::Load15 => {
                let load: LoadAverage = parse(&self.root, "loadavg")?;
                match self.kind {
                    Kind::Processes => f64::from(load.max),
                    Kind::Load1 => f64::from(load.one),
                    Kind::Load5 => f64::from(load.five),
                    _ => f64::from(load.fifteen),
                }
            }
        };
        Ok(narrow(value))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, thread, time::Duration};

    use super::super::tests::fixture;
    use super::*;

    fn stat(ctxt: u64, procs_running: Option<u32>) -> String {
        let running = procs_running
            .map(|n| format!("procs_running {n}\nprocs_blocked 0\n"))
            .unwrap_or_default();
        format!("cpu 1 1 1 1\nctxt {ctxt}\nbtime 1700000000\nprocesses 42\n{running}")
    }

    fn counter(root: &Path, name: &str) -> Box<dyn Counter> {
        open(root, &CounterId::new("System", name, None::<String>)).expect("open")
    }

    fn read(root: &Path, name: &str) -> f32 {
        counter(root, name).next_value().expect("read")
    }

    #[test]
    fn gauges() {
        let stat = stat(10, Some(3));
        let dir = fixture(&[
            ("stat", stat.as_str()),
            ("loadavg", "1.50 0.75 0.25 2/311 4242\n"),
            ("uptime", "3600.25 7000.00\n"),
        ]);
        let root = dir.path();
        assert!((read(root, "Processor Queue Length") - 3.0).abs() < 1e-6);
        assert!((read(root, "Processes") - 311.0).abs() < 1e-6);
        assert!((read(root, "Load Average 1m") - 1.5).abs() < 1e-6);
        assert!((read(root, "Load Average 5m") - 0.75).abs() < 1e-6);
        assert!((read(root, "Load Average 15m") - 0.25).abs() < 1e-6);
        assert!((read(root, "System Up Time") - 3600.25).abs() < 1e-3);
    }

    #[test]
    fn truncated_loadavg_is_an_error() {
        let dir = fixture(&[("loadavg", "0.20 0.18\n")]);
        assert!(matches!(
            counter(dir.path(), "Load Average 1m").next_value(),
            Err(Error::Proc(_))
        ));
    }

    #[test]
    fn context_switches_are_a_rate() {
        let dir = fixture(&[("stat", stat(1000, Some(1)).as_str())]);
        let mut switches = counter(dir.path(), "Context Switches/sec");
        assert!(switches.next_value().expect("read").abs() < f32::EPSILON);

        thread::sleep(Duration::from_millis(20));
        fs::write(dir.path().join("stat"), stat(2000, Some(1))).expect("rewrite");
        assert!(switches.next_value().expect("read") > 0.0);
    }

    #[test]
    fn missing_procs_running_is_malformed() {
        let dir = fixture(&[("stat", stat(1, None).as_str())]);
        assert!(matches!(
            counter(dir.path(), "Processor Queue Length").next_value(),
            Err(Error::Malformed { .. })
        ));
    }
}
