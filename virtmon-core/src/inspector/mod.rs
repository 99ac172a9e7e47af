//! Hypervisor inspection layer.
//!
//! virtmon only needs a narrow view of the hypervisor: the list of domains
//! and, per domain, a snapshot of raw counters. Everything is behind the
//! `Inspector` trait so the poll loop never talks to libvirt directly.
//!
//! - `VirshInspector`: reads `virsh domstats --raw` (default)
//! - `Reconnecting`: caches the hypervisor connection and retries once
//!   when it is lost

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod retry;
mod virsh;

pub use retry::{Connector, Reconnecting};
pub use virsh::{parse_domstats, VirshConnection, VirshConnector, VirshInspector};

/// Inspector trait.
///
/// Two consecutive `domain_stats` calls for the same domain must be
/// comparable: rates are computed from the difference.
#[async_trait]
pub trait Inspector: Send + Sync {
    /// Names of all defined domains, running or not.
    async fn list_domains(&self) -> Result<Vec<String>>;

    /// Snapshot of the raw counters of one domain.
    async fn domain_stats(&self, domain: &str) -> Result<DomainStats>;

    /// Inspector name (for logging).
    fn name(&self) -> &str;
}

/// Libvirt domain lifecycle state (`virDomainState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Parse from the numeric libvirt code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::NoState),
            1 => Some(Self::Running),
            2 => Some(Self::Blocked),
            3 => Some(Self::Paused),
            4 => Some(Self::Shutdown),
            5 => Some(Self::Shutoff),
            6 => Some(Self::Crashed),
            7 => Some(Self::PmSuspended),
            _ => None,
        }
    }

    /// Numeric libvirt code, which is also the value reported to Zabbix.
    pub fn code(&self) -> u32 {
        match self {
            Self::NoState => 0,
            Self::Running => 1,
            Self::Blocked => 2,
            Self::Paused => 3,
            Self::Shutdown => 4,
            Self::Shutoff => 5,
            Self::Crashed => 6,
            Self::PmSuspended => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoState => "VIR_DOMAIN_NONE",
            Self::Running => "VIR_DOMAIN_RUNNING",
            Self::Blocked => "VIR_DOMAIN_BLOCKED",
            Self::Paused => "VIR_DOMAIN_PAUSED",
            Self::Shutdown => "VIR_DOMAIN_SHUTDOWN",
            Self::Shutoff => "VIR_DOMAIN_SHUTOFF",
            Self::Crashed => "VIR_DOMAIN_CRASHED",
            Self::PmSuspended => "VIR_DOMAIN_PMSUSPENDED",
        }
    }

    pub fn is_running(&self) -> bool {
        *self == Self::Running
    }
}

/// CPU counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuStats {
    /// Number of virtual CPUs
    pub number: u32,
    /// Cumulative CPU time (nanoseconds)
    pub time: u64,
}

/// Balloon memory counters, in KiB. Hypervisors that do not support
/// memory stats leave them unset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryStats {
    pub available: Option<u64>,
    pub unused: Option<u64>,
    pub rss: Option<u64>,
}

/// Counters of one virtual NIC.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceStats {
    /// Host-side device name (e.g. `vnet0`)
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// I/O counters of one disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskStats {
    /// Guest device name (e.g. `vda`)
    pub device: String,
    pub read_bytes: u64,
    pub read_requests: u64,
    pub write_bytes: u64,
    pub write_requests: u64,
    pub errors: u64,
}

/// Size information of one disk, in bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskInfo {
    pub device: String,
    pub capacity: u64,
    pub allocation: u64,
    pub physical: u64,
}

/// One snapshot of a domain's raw counters.
#[derive(Debug, Clone)]
pub struct DomainStats {
    pub domain: String,
    pub state: DomainState,
    /// Only collected for running domains.
    pub cpu: Option<CpuStats>,
    pub memory: MemoryStats,
    pub interfaces: Vec<InterfaceStats>,
    pub disks: Vec<DiskStats>,
    pub disk_info: Vec<DiskInfo>,
    /// When the snapshot was taken (unix seconds)
    pub clock: i64,
}

impl DomainStats {
    /// Snapshot holding only the lifecycle state.
    pub fn state_only(domain: impl Into<String>, state: DomainState) -> Self {
        Self {
            domain: domain.into(),
            state,
            cpu: None,
            memory: MemoryStats::default(),
            interfaces: Vec::new(),
            disks: Vec::new(),
            disk_info: Vec::new(),
            clock: unix_now(),
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
