use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use ::procfs::{DiskStat, DiskStats};

use super::{Counter, CounterId, Error, Rate, narrow, parse};

const DISKSTATS: &str = "diskstats";
// diskstats reports sectors of 512 bytes regardless of the device's own
// sector size.
const SECTOR_BYTES: u64 = 512;

pub(super) const COUNTERS: &[&str] = &[
    "Disk Reads/sec",
    "Disk Writes/sec",
    "Disk Read Bytes/sec",
    "Disk Write Bytes/sec",
    "Current Disk Queue Length",
    "% Disk Time",
];

#[derive(Debug, Clone, Copy)]
enum Kind {
    Reads,
    Writes,
    ReadBytes,
    WriteBytes,
    QueueLength,
    DiskTime,
}

impl Kind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Disk Reads/sec" => Kind::Reads,
            "Disk Writes/sec" => Kind::Writes,
            "Disk Read Bytes/sec" => Kind::ReadBytes,
            "Disk Write Bytes/sec" => Kind::WriteBytes,
            "Current Disk Queue Length" => Kind::QueueLength,
            "% Disk Time" => Kind::DiskTime,
            _ => return None,
        })
    }
}

fn stats(root: &Path) -> Result<Vec<DiskStat>, Error> {
    Ok(parse::<DiskStats>(root, DISKSTATS)?.0)
}

fn find(root: &Path, device: &str) -> Result<Option<DiskStat>, Error> {
    Ok(stats(root)?.into_iter().find(|disk| disk.name == device))
}

pub(super) fn instances(root: &Path) -> Result<Vec<String>, Error> {
    Ok(stats(root)?.into_iter().map(|disk| disk.name).collect())
}

pub(super) fn exists(root: &Path, device: &str) -> Result<bool, Error> {
    Ok(find(root, device)?.is_some())
}

pub(super) fn open(root: &Path, id: &CounterId) -> Result<Box<dyn Counter>, Error> {
    let kind = Kind::from_name(&id.name).ok_or_else(|| Error::CounterNotFound(id.clone()))?;
    let device = id
        .instance
        .clone()
        .ok_or_else(|| Error::CounterNotFound(id.clone()))?;
    if !exists(root, &device)? {
        return Err(Error::CounterNotFound(id.clone()));
    }
    Ok(Box::new(Handle {
        root: root.to_path_buf(),
        id: id.clone(),
        device,
        kind,
        rate: Rate::default(),
    }))
}

#[derive(Debug)]
struct Handle {
    root: PathBuf,
    id: CounterId,
    device: String,
    kind: Kind,
    rate: Rate,
}

impl Counter for Handle {
    fn next_value(&mut self) -> Result<f32, Error> {
        let disk = find(&self.root, &self.device)?
            .ok_or_else(|| Error::Vanished(self.id.clone()))?;
        let now = Instant::now();
        let value = match self.kind {
            Kind::Reads => self.rate.per_second(disk.reads, now),
            Kind::Writes => self.rate.per_second(disk.writes, now),
            Kind::ReadBytes => self
                .rate
                .per_second(disk.sectors_read.saturating_mul(SECTOR_BYTES), now),
            Kind::WriteBytes => self
                .rate
                .per_second(disk.sectors_written.saturating_mul(SECTOR_BYTES), now),
            Kind::QueueLength => disk.in_progress as f64,
            // Busy milliseconds per second, as a share of that second.
            Kind::DiskTime => {
                (self.rate.per_second(disk.time_in_progress, now) / 10.0).min(100.0)
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

    fn diskstats(sda_reads: u64, sda_sectors: u64) -> String {
        format!(
            "   7       0 loop0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0
   8       0 sda {sda_reads} 10 {sda_sectors} 400 200 20 1600 300 2 500 700 0 0 0 0 0 0
   8       1 sda1 50 5 400 100 20 2 160 30 0 50 130
"
        )
    }

    #[test]
    fn lists_devices() {
        let dir = fixture(&[(DISKSTATS, diskstats(0, 0).as_str())]);
        assert_eq!(
            instances(dir.path()).expect("instances"),
            ["loop0", "sda", "sda1"]
        );
        assert!(exists(dir.path(), "sda1").expect("exists"));
        assert!(!exists(dir.path(), "sdb").expect("exists"));
    }

    #[test]
    fn reads_columns() {
        let dir = fixture(&[(DISKSTATS, diskstats(100, 800).as_str())]);
        let sda = find(dir.path(), "sda").expect("parse").expect("device");
        assert_eq!(sda.reads, 100);
        assert_eq!(sda.sectors_read, 800);
        assert_eq!(sda.writes, 200);
        assert_eq!(sda.sectors_written, 1600);
        assert_eq!(sda.in_progress, 2);
        assert_eq!(sda.time_in_progress, 500);
        // Older kernels stop at 11 stat fields.
        let sda1 = find(dir.path(), "sda1").expect("parse").expect("device");
        assert_eq!(sda1.time_in_progress, 50);
        assert_eq!(sda1.discards, None);
    }

    #[test]
    fn queue_length_is_a_gauge_and_bytes_a_rate() {
        let dir = fixture(&[(DISKSTATS, diskstats(100, 800).as_str())]);
        let queue = CounterId::new("PhysicalDisk", "Current Disk Queue Length", Some("sda"));
        let bytes = CounterId::new("PhysicalDisk", "Disk Read Bytes/sec", Some("sda"));
        let mut queue = open(dir.path(), &queue).expect("open");
        let mut bytes = open(dir.path(), &bytes).expect("open");

        assert!((queue.next_value().expect("read") - 2.0).abs() < f32::EPSILON);
        assert!(bytes.next_value().expect("read").abs() < f32::EPSILON);

        thread::sleep(Duration::from_millis(20));
        fs::write(dir.path().join(DISKSTATS), diskstats(110, 1800)).expect("rewrite");
        assert!(bytes.next_value().expect("read") > 0.0);
    }
}
