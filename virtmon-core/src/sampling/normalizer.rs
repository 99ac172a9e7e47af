//! Flattens per-domain counters into Zabbix items.

use super::rate::{cpu_utilization, rate, RateUnit};
use crate::error::VirtmonError;
use crate::inspector::{
    CpuStats, DiskInfo, DiskStats, DomainStats, InterfaceStats, MemoryStats,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// One addressable value, as modeled on the Zabbix server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// `<group>.<field>[<domain>]` or `<group>.<field>[<domain>,<device>]`
    pub key: String,
    pub name: String,
    pub value: f64,
    /// Unix time of the sample the value comes from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock: Option<i64>,
}

/// A record type whose values become items.
///
/// `values()` lines up one to one with the fields of the `RECORD` entry in
/// [`METRIC_GROUPS`].
pub trait StatRecord {
    const RECORD: &'static str;

    fn values(&self) -> Vec<f64>;
}

pub struct StateRecord {
    pub state: u32,
}

impl StatRecord for StateRecord {
    const RECORD: &'static str = "state";

    fn values(&self) -> Vec<f64> {
        vec![f64::from(self.state)]
    }
}

pub struct CpuRecord {
    pub number: u32,
    pub time: u64,
}

impl StatRecord for CpuRecord {
    const RECORD: &'static str = "cpu";

    fn values(&self) -> Vec<f64> {
        vec![f64::from(self.number), self.time as f64]
    }
}

pub struct CpuUtilRecord {
    /// Percent of the domain's vCPU capacity
    pub util: f64,
}

impl StatRecord for CpuUtilRecord {
    const RECORD: &'static str = "cpu_util";

    fn values(&self) -> Vec<f64> {
        vec![self.util]
    }
}

pub struct MemoryRecord {
    /// MB
    pub usage: f64,
}

impl StatRecord for MemoryRecord {
    const RECORD: &'static str = "memory";

    fn values(&self) -> Vec<f64> {
        vec![self.usage]
    }
}

pub struct MemoryResidentRecord {
    /// MB
    pub resident: f64,
}

impl StatRecord for MemoryResidentRecord {
    const RECORD: &'static str = "memory_resident";

    fn values(&self) -> Vec<f64> {
        vec![self.resident]
    }
}

pub struct InterfaceRecord<'a>(pub &'a InterfaceStats);

impl StatRecord for InterfaceRecord<'_> {
    const RECORD: &'static str = "interface";

    fn values(&self) -> Vec<f64> {
        let s = self.0;
        vec![s.rx_bytes as f64, s.rx_packets as f64, s.tx_bytes as f64, s.tx_packets as f64]
    }
}

pub struct InterfaceRateRecord {
    pub rx_bytes_ps: f64,
    pub tx_bytes_ps: f64,
    pub rx_packets_ps: f64,
    pub tx_packets_ps: f64,
}

impl InterfaceRateRecord {
    fn between(a: &InterfaceStats, b: &InterfaceStats, interval: Duration) -> Self {
        Self {
            rx_bytes_ps: rate(a.rx_bytes, b.rx_bytes, interval, RateUnit::MegabitsPerSec),
            tx_bytes_ps: rate(a.tx_bytes, b.tx_bytes, interval, RateUnit::MegabitsPerSec),
            rx_packets_ps: rate(a.rx_packets, b.rx_packets, interval, RateUnit::PacketsPerSec),
            tx_packets_ps: rate(a.tx_packets, b.tx_packets, interval, RateUnit::PacketsPerSec),
        }
    }
}

impl StatRecord for InterfaceRateRecord {
    const RECORD: &'static str = "interface_rate";

    fn values(&self) -> Vec<f64> {
        vec![self.rx_bytes_ps, self.tx_bytes_ps, self.rx_packets_ps, self.tx_packets_ps]
    }
}

pub struct DiskRecord<'a>(pub &'a DiskStats);

impl StatRecord for DiskRecord<'_> {
    const RECORD: &'static str = "disk";

    fn values(&self) -> Vec<f64> {
        let s = self.0;
        vec![
            s.read_bytes as f64,
            s.read_requests as f64,
            s.write_bytes as f64,
            s.write_requests as f64,
            s.errors as f64,
        ]
    }
}

pub struct DiskRateRecord {
    pub read_bytes_ps: f64,
    pub read_requests_ps: f64,
    pub write_bytes_ps: f64,
    pub write_requests_ps: f64,
}

impl DiskRateRecord {
    fn between(a: &DiskStats, b: &DiskStats, interval: Duration) -> Self {
        Self {
            read_bytes_ps: rate(a.read_bytes, b.read_bytes, interval, RateUnit::MegabytesPerSec),
            read_requests_ps: rate(a.read_requests, b.read_requests, interval, RateUnit::OpsPerSec),
            write_bytes_ps: rate(a.write_bytes, b.write_bytes, interval, RateUnit::MegabytesPerSec),
            write_requests_ps: rate(
                a.write_requests,
                b.write_requests,
                interval,
                RateUnit::OpsPerSec,
            ),
        }
    }
}

impl StatRecord for DiskRateRecord {
    const RECORD: &'static str = "disk_rate";

    fn values(&self) -> Vec<f64> {
        vec![
            self.read_bytes_ps,
            self.read_requests_ps,
            self.write_bytes_ps,
            self.write_requests_ps,
        ]
    }
}

pub struct DiskInfoRecord<'a>(pub &'a DiskInfo);

impl StatRecord for DiskInfoRecord<'_> {
    const RECORD: &'static str = "disk_info";

    fn values(&self) -> Vec<f64> {
        let s = self.0;
        vec![s.capacity as f64, s.allocation as f64, s.physical as f64]
    }
}

/// Key layout of one record type: the key prefix and the fields, in the
/// order the record's `values()` returns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricGroup {
    pub record: &'static str,
    pub group: &'static str,
    pub fields: &'static [&'static str],
}

/// Every record the normalizer can emit. Keys and names are built from here.
pub static METRIC_GROUPS: &[MetricGroup] = &[
    MetricGroup { record: "state", group: "state", fields: &["state"] },
    MetricGroup { record: "cpu", group: "cpustats", fields: &["number", "time"] },
    MetricGroup { record: "cpu_util", group: "cpustats", fields: &["util"] },
    MetricGroup { record: "memory", group: "memstats", fields: &["usage"] },
    MetricGroup { record: "memory_resident", group: "memstats", fields: &["resident"] },
    MetricGroup {
        record: "interface",
        group: "netstats",
        fields: &["rx_bytes", "rx_packets", "tx_bytes", "tx_packets"],
    },
    MetricGroup {
        record: "interface_rate",
        group: "netstats",
        fields: &["rx_bytes_ps", "tx_bytes_ps", "rx_packets_ps", "tx_packets_ps"],
    },
    MetricGroup {
        record: "disk",
        group: "diskstats",
        fields: &["read_bytes", "read_requests", "write_bytes", "write_requests", "errors"],
    },
    MetricGroup {
        record: "disk_rate",
        group: "diskstats",
        fields: &["read_bytes_ps", "read_requests_ps", "write_bytes_ps", "write_requests_ps"],
    },
    MetricGroup {
        record: "disk_info",
        group: "diskinfo",
        fields: &["capacity", "allocation", "physical"],
    },
];

/// Table entry of a record type.
pub fn metric_group(record: &str) -> Option<&'static MetricGroup> {
    METRIC_GROUPS.iter().find(|g| g.record == record)
}

/// Turns two snapshots of a domain into items.
#[derive(Debug, Clone, Copy)]
pub struct MetricNormalizer {
    interval: Duration,
}

impl MetricNormalizer {
    /// `interval` is the nominal gap between the two snapshots.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Build the items of one domain.
    ///
    /// `second` is the snapshot taken one interval after `first`; without it
    /// rate items are left out. A domain that is not running (in either
    /// snapshot) only reports its state.
    pub fn normalize(&self, first: &DomainStats, second: Option<&DomainStats>) -> Vec<Item> {
        let latest = second.unwrap_or(first);
        let domain = latest.domain.as_str();
        let mut items = Vec::new();
        let mut emit = Emitter { domain, clock: latest.clock, items: &mut items };

        emit.record(None, &StateRecord { state: latest.state.code() });
        if !first.state.is_running() || !latest.state.is_running() {
            return items;
        }

        if let Some(cpu) = latest.cpu {
            emit.record(None, &CpuRecord { number: cpu.number, time: cpu.time });
        }
        self.memory(&mut emit, &latest.memory);

        for iface in &latest.interfaces {
            emit.record(Some(iface.name.as_str()), &InterfaceRecord(iface));
        }
        for disk in &latest.disks {
            emit.record(Some(disk.device.as_str()), &DiskRecord(disk));
        }
        for info in &latest.disk_info {
            emit.record(Some(info.device.as_str()), &DiskInfoRecord(info));
        }

        match second {
            Some(second) => self.rates(&mut emit, first, second),
            None => debug!(domain = %domain, "Single snapshot, skipping rates"),
        }

        items
    }

    fn memory(&self, emit: &mut Emitter<'_>, memory: &MemoryStats) {
        match (memory.available, memory.unused) {
            (Some(available), Some(unused)) => {
                let usage = available.saturating_sub(unused) as f64 / 1024.0;
                emit.record(None, &MemoryRecord { usage });
            }
            _ => {
                unavailable(emit.domain, "memstats.usage", "balloon available/unused not reported")
            }
        }
        match memory.rss {
            Some(rss) => {
                emit.record(None, &MemoryResidentRecord { resident: rss as f64 / 1024.0 })
            }
            None => unavailable(emit.domain, "memstats.resident", "balloon rss not reported"),
        }
    }

    fn rates(&self, emit: &mut Emitter<'_>, first: &DomainStats, second: &DomainStats) {
        match (first.cpu, second.cpu) {
            (Some(CpuStats { time: t1, .. }), Some(CpuStats { time: t2, number })) => {
                let util = cpu_utilization(t1, t2, self.interval, number);
                emit.record(None, &CpuUtilRecord { util });
            }
            _ => unavailable(emit.domain, "cpustats.util", "cpu time not reported"),
        }

        for b in &second.interfaces {
            match first.interfaces.iter().find(|a| a.name == b.name) {
                Some(a) => {
                    let record = InterfaceRateRecord::between(a, b, self.interval);
                    emit.record(Some(b.name.as_str()), &record)
                }
                None => debug!(
                    domain = %emit.domain,
                    interface = %b.name,
                    "Interface appeared between samples"
                ),
            }
        }

        for b in &second.disks {
            match first.disks.iter().find(|a| a.device == b.device) {
                Some(a) => {
                    let record = DiskRateRecord::between(a, b, self.interval);
                    emit.record(Some(b.device.as_str()), &record)
                }
                None => {
                    debug!(domain = %emit.domain, disk = %b.device, "Disk appeared between samples")
                }
            }
        }
    }
}

struct Emitter<'a> {
    domain: &'a str,
    clock: i64,
    items: &'a mut Vec<Item>,
}

impl Emitter<'_> {
    fn record<R: StatRecord>(&mut self, device: Option<&str>, record: &R) {
        let Some(layout) = metric_group(R::RECORD) else {
            warn!(record = R::RECORD, "Record has no metric group, skipping");
            return;
        };
        for (field, value) in layout.fields.iter().zip(record.values()) {
            self.items.push(Item {
                key: item_key(layout.group, field, self.domain, device),
                name: item_name(layout.group, field, self.domain, device),
                value,
                clock: Some(self.clock),
            });
        }
    }
}

fn unavailable(domain: &str, metric: &str, reason: &str) {
    let err = VirtmonError::MetricUnavailable {
        domain: domain.to_string(),
        metric: metric.to_string(),
        reason: reason.to_string(),
    };
    warn!(domain = %domain, metric = %metric, "{}", err);
}

/// `diskstats.read_requests_ps[instance-1,vda]`
pub fn item_key(group: &str, field: &str, domain: &str, device: Option<&str>) -> String {
    match device {
        Some(device) => format!("{}.{}[{},{}]", group, field, domain, device),
        None => format!("{}.{}[{}]", group, field, domain),
    }
}

/// `Instance-1 - Diskstats Vda - Read Requests Ps`
pub fn item_name(group: &str, field: &str, domain: &str, device: Option<&str>) -> String {
    let raw = match device {
        Some(device) => format!("{} - {} {} - {}", domain, group, device, field),
        None => format!("{} - {} - {}", domain, group, field),
    };
    title_case(&raw.replace('_', " "))
}

/// Upper-case the first letter of every alphabetic run, lower-case the rest.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}
