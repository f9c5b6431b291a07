use std::path::{Path, PathBuf};

use ::procfs::Meminfo;

use super::{Counter, CounterId, Error, narrow, parse, percent};

pub(super) const COUNTERS: &[&str] = &[
    "Total Bytes",
    "Available Bytes",
    "Free Bytes",
    "Cached Bytes",
    "Buffers Bytes",
    "Swap Used Bytes",
    "% Used",
];

#[derive(Debug, Clone, Copy)]
enum Kind {
    Total,
    Available,
    Free,
    Cached,
    Buffers,
    SwapUsed,
    Used,
}

impl Kind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Total Bytes" => Kind::Total,
            "Available Bytes" => Kind::Available,
            "Free Bytes" => Kind::Free,
            "Cached Bytes" => Kind::Cached,
            "Buffers Bytes" => Kind::Buffers,
            "Swap Used Bytes" => Kind::SwapUsed,
            "% Used" => Kind::Used,
            _ => return None,
        })
    }
}

// Kernels before 3.14 have no MemAvailable.
fn available(info: &Meminfo) -> u64 {
    info.mem_available
        .unwrap_or_else(|| info.mem_free + info.cached + info.buffers)
}

/// `info` fields are already in bytes.
fn value(info: &Meminfo, kind: Kind) -> f32 {
    let bytes = match kind {
        Kind::Total => info.mem_total,
        Kind::Available => available(info),
        Kind::Free => info.mem_free,
        Kind::Cached => info.cached,
        Kind::Buffers => info.buffers,
        Kind::SwapUsed => info.swap_total.saturating_sub(info.swap_free),
        Kind::Used => {
            return percent(info.mem_total.saturating_sub(available(info)), info.mem_total);
        }
    };
    narrow(bytes as f64)
}

pub(super) fn open(root: &Path, id: &CounterId) -> Result<Box<dyn Counter>, Error> {
    let kind = Kind::from_name(&id.name).ok_or_else(|| Error::CounterNotFound(id.clone()))?;
    Ok(Box::new(Handle {
        root: root.to_path_buf(),
        kind,
    }))
}

#[derive(Debug)]
struct Handle {
    root: PathBuf,
    kind: Kind,
}

impl Counter for Handle {
    fn next_value(&mut self) -> Result<f32, Error> {
        let info: Meminfo = parse(&self.root, "meminfo")?;
        Ok(value(&info, self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;

    /// A minimal `/proc/meminfo` carrying every field the kernel always
    /// reports.
    fn meminfo(available: Option<&str>) -> String {
        let available = available
            .map(|kb| format!("MemAvailable:     {kb} kB\n"))
            .unwrap_or_default();
        format!(
            "MemTotal:        1000 kB
MemFree:          200 kB
{available}Buffers:           50 kB
Cached:           100 kB
SwapCached:         0 kB
Active:           300 kB
Inactive:         200 kB
SwapTotal:        300 kB
SwapFree:         100 kB
Dirty:              0 kB
Writeback:          0 kB
Mapped:            10 kB
Slab:              20 kB
Committed_AS:     500 kB
VmallocTotal:   34359738367 kB
VmallocUsed:        0 kB
VmallocChunk:       0 kB
HugePages_Total:    0
"
        )
    }

    fn read_counter(root: &Path, name: &str) -> f32 {
        open(root, &CounterId::new("Memory", name, None::<String>))
            .expect("open")
            .next_value()
            .expect("read")
    }

    #[test]
    fn gauges_from_meminfo() {
        let contents = meminfo(Some("400"));
        let dir = fixture(&[("meminfo", contents.as_str())]);
        let root = dir.path();
        assert!((read_counter(root, "Total Bytes") - 1_024_000.0).abs() < 1.0);
        assert!((read_counter(root, "Available Bytes") - 409_600.0).abs() < 1.0);
        assert!((read_counter(root, "Swap Used Bytes") - 204_800.0).abs() < 1.0);
        assert!((read_counter(root, "% Used") - 60.0).abs() < 1e-4);
    }

    #[test]
    fn available_falls_back_on_old_kernels() {
        let contents = meminfo(None);
        let dir = fixture(&[("meminfo", contents.as_str())]);
        let info: Meminfo = parse(dir.path(), "meminfo").expect("parse");
        assert_eq!(available(&info), 350 * 1024);
        assert!((read_counter(dir.path(), "Available Bytes") - 358_400.0).abs() < 1.0);
    }

    #[test]
    fn unreadable_meminfo_is_an_error() {
        let dir = fixture(&[("meminfo", "MemTotal: 1000 furlongs\n")]);
        let mut total = open(dir.path(), &CounterId::new("Memory", "Total Bytes", None::<String>))
            .expect("open");
        assert!(matches!(total.next_value(), Err(Error::Proc(_))));
    }
}
