use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use ::procfs::net::{DeviceStatus, InterfaceDeviceStatus};

use super::{Counter, CounterId, Error, Rate, narrow, parse};

const NET_DEV: &str = "net/dev";

pub(super) const COUNTERS: &[&str] = &[
    "Bytes Received/sec",
    "Bytes Sent/sec",
    "Bytes Total/sec",
    "Packets Received/sec",
    "Packets Sent/sec",
    "Packets Received Errors/sec",
    "Packets Outbound Errors/sec",
];

#[derive(Debug, Clone, Copy)]
enum Kind {
    BytesReceived,
    BytesSent,
    BytesTotal,
    PacketsReceived,
    PacketsSent,
    ReceiveErrors,
    OutboundErrors,
}

impl Kind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Bytes Received/sec" => Kind::BytesReceived,
            "Bytes Sent/sec" => Kind::BytesSent,
            "Bytes Total/sec" => Kind::BytesTotal,
            "Packets Received/sec" => Kind::PacketsReceived,
            "Packets Sent/sec" => Kind::PacketsSent,
            "Packets Received Errors/sec" => Kind::ReceiveErrors,
            "Packets Outbound Errors/sec" => Kind::OutboundErrors,
            _ => return None,
        })
    }

    fn count(self, status: &DeviceStatus) -> u64 {
        match self {
            Kind::BytesReceived => status.recv_bytes,
            Kind::BytesSent => status.sent_bytes,
            Kind::BytesTotal => status.recv_bytes.saturating_add(status.sent_bytes),
            Kind::PacketsReceived => status.recv_packets,
            Kind::PacketsSent => status.sent_packets,
            Kind::ReceiveErrors => status.recv_errs,
            Kind::OutboundErrors => status.sent_errs,
        }
    }
}

fn devices(root: &Path) -> Result<InterfaceDeviceStatus, Error> {
    parse(root, NET_DEV)
}

pub(super) fn instances(root: &Path) -> Result<Vec<String>, Error> {
    let mut names: Vec<String> = devices(root)?.0.into_keys().collect();
    names.sort_unstable();
    Ok(names)
}

pub(super) fn exists(root: &Path, device: &str) -> Result<bool, Error> {
    Ok(devices(root)?.0.contains_key(device))
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
        let devices = devices(&self.root)?;
        let status = devices
            .0
            .get(&self.device)
            .ok_or_else(|| Error::Vanished(self.id.clone()))?;
        Ok(narrow(
            self.rate
                .per_second(self.kind.count(status), Instant::now()),
        ))
    }
}
