//! Inspector backed by the `virsh` command line tool.
//!
//! Uses `virsh domstats --raw`, which prints one `group.field=value` line per
//! counter:
//!
//! ```text
//! Domain: 'instance-000002ee'
//!   state.state=1
//!   vcpu.current=2
//!   cpu.time=1049843000000
//!   balloon.available=2047940
//!   net.count=1
//!   net.0.name=vnet0
//!   net.0.rx.bytes=1200
//!   block.count=1
//!   block.0.name=vda
//!   block.0.rd.reqs=10
//! ```

use super::{
    unix_now, Connector, CpuStats, DiskInfo, DiskStats, DomainState, DomainStats, Inspector,
    InterfaceStats, MemoryStats, Reconnecting,
};
use crate::error::{Result, VirtmonError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{debug, instrument};

/// stderr fragments libvirt prints when the daemon connection dropped.
const DISCONNECT_MARKERS: &[&str] = &[
    "End of file while reading data",
    "Cannot recv data",
    "Cannot write data",
    "Broken pipe",
    "Connection reset by peer",
    "failed to connect to the hypervisor",
    "client socket is closed",
];

/// Opens (and verifies) a virsh connection to a libvirt URI.
pub struct VirshConnector {
    virsh: String,
    uri: String,
}

impl VirshConnector {
    pub fn new(virsh: impl Into<String>, uri: impl Into<String>) -> Self {
        Self { virsh: virsh.into(), uri: uri.into() }
    }
}

/// A verified libvirt URI, as canonicalised by the daemon.
pub struct VirshConnection {
    virsh: String,
    uri: String,
}

impl VirshConnection {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn run(&self, context: &str, args: &[&str]) -> Result<String> {
        run_virsh(&self.virsh, &self.uri, context, args).await
    }
}

#[async_trait]
impl Connector for VirshConnector {
    type Connection = VirshConnection;

    async fn connect(&self) -> Result<VirshConnection> {
        let canonical = run_virsh(&self.virsh, &self.uri, "connect", &["uri"]).await?;
        let uri = canonical.trim();
        let uri = if uri.is_empty() { self.uri.clone() } else { uri.to_string() };
        debug!(uri = %uri, "Connected to libvirt");
        Ok(VirshConnection { virsh: self.virsh.clone(), uri })
    }
}

async fn run_virsh(virsh: &str, uri: &str, context: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(virsh)
        .arg("-c")
        .arg(uri)
        .args(args)
        .output()
        .await
        .map_err(|e| VirtmonError::Inspect {
            domain: context.to_string(),
            reason: format!("failed to run {}: {}", virsh, e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_failure(context, stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Map a virsh failure to `ConnectionLost` or a plain inspection error.
pub(crate) fn classify_failure(context: &str, stderr: &str) -> VirtmonError {
    if DISCONNECT_MARKERS.iter().any(|m| stderr.contains(m)) {
        VirtmonError::ConnectionLost { reason: stderr.to_string() }
    } else {
        VirtmonError::Inspect { domain: context.to_string(), reason: stderr.to_string() }
    }
}

/// Inspector reading counters through `virsh`.
pub struct VirshInspector {
    conn: Reconnecting<VirshConnector>,
}

impl VirshInspector {
    pub fn new(virsh: impl Into<String>, uri: impl Into<String>) -> Self {
        Self { conn: Reconnecting::new(VirshConnector::new(virsh, uri)) }
    }
}

#[async_trait]
impl Inspector for VirshInspector {
    #[instrument(skip(self))]
    async fn list_domains(&self) -> Result<Vec<String>> {
        let output = self
            .conn
            .call(|c| async move { c.run("list", &["list", "--all", "--name"]).await })
            .await?;

        Ok(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    #[instrument(skip(self))]
    async fn domain_stats(&self, domain: &str) -> Result<DomainStats> {
        let output = self
            .conn
            .call(move |c| async move { c.run(domain, &["domstats", "--raw", domain]).await })
            .await?;

        parse_domstats(domain, &output)
    }

    fn name(&self) -> &str {
        "virsh"
    }
}

/// Parse the `virsh domstats --raw` output of a single domain.
pub fn parse_domstats(domain: &str, output: &str) -> Result<DomainStats> {
    let fields: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let num = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok());

    let state = num("state.state")
        .and_then(|code| DomainState::from_code(code as u32))
        .ok_or_else(|| VirtmonError::Inspect {
            domain: domain.to_string(),
            reason: "domstats output has no valid state.state".to_string(),
        })?;

    let cpu = match (num("vcpu.current"), num("cpu.time")) {
        (Some(number), Some(time)) => Some(CpuStats { number: number as u32, time }),
        _ => None,
    };

    let memory = MemoryStats {
        available: num("balloon.available"),
        unused: num("balloon.unused"),
        rss: num("balloon.rss"),
    };

    let mut interfaces = Vec::new();
    for i in 0..num("net.count").unwrap_or(0) {
        let Some(name) = fields.get(format!("net.{}.name", i).as_str()) else {
            continue;
        };
        let counter = |field: &str| num(&format!("net.{}.{}", i, field));
        match (counter("rx.bytes"), counter("rx.pkts"), counter("tx.bytes"), counter("tx.pkts")) {
            (Some(rx_bytes), Some(rx_packets), Some(tx_bytes), Some(tx_packets)) => {
                interfaces.push(InterfaceStats {
                    name: name.to_string(),
                    rx_bytes,
                    rx_packets,
                    tx_bytes,
                    tx_packets,
                })
            }
            _ => debug!(domain = %domain, interface = %name, "Interface counters incomplete"),
        }
    }

    let mut disks = Vec::new();
    let mut disk_info = Vec::new();
    for i in 0..num("block.count").unwrap_or(0) {
        let Some(device) = fields.get(format!("block.{}.name", i).as_str()) else {
            continue;
        };
        let counter = |field: &str| num(&format!("block.{}.{}", i, field));

        match (counter("rd.bytes"), counter("rd.reqs"), counter("wr.bytes"), counter("wr.reqs")) {
            (Some(read_bytes), Some(read_requests), Some(write_bytes), Some(write_requests)) => {
                disks.push(DiskStats {
                    device: device.to_string(),
                    read_bytes,
                    read_requests,
                    write_bytes,
                    write_requests,
                    // only reported by Xen
                    errors: counter("errors").unwrap_or(0),
                })
            }
            _ => debug!(domain = %domain, disk = %device, "Disk counters incomplete"),
        }

        // Network-backed disks have no local allocation to report.
        match (counter("capacity"), counter("allocation"), counter("physical")) {
            (Some(capacity), Some(allocation), Some(physical)) => disk_info.push(DiskInfo {
                device: device.to_string(),
                capacity,
                allocation,
                physical,
            }),
            _ => debug!(domain = %domain, disk = %device, "Disk size info unavailable"),
        }
    }

    Ok(DomainStats {
        domain: domain.to_string(),
        state,
        cpu,
        memory,
        interfaces,
        disks,
        disk_info,
        clock: unix_now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = "Domain: 'instance-000002ee'
  state.state=1
  state.reason=1
  cpu.time=1049843000000
  cpu.user=1000
  balloon.current=2097152
  balloon.available=2047940
  balloon.unused=1523652
  balloon.rss=612348
  vcpu.current=2
  vcpu.maximum=2
  net.count=1
  net.0.name=vnet0
  net.0.rx.bytes=1000000
  net.0.rx.pkts=700
  net.0.rx.errs=0
  net.0.tx.bytes=400000
  net.0.tx.pkts=300
  block.count=2
  block.0.name=vda
  block.0.path=/var/lib/nova/instances/disk
  block.0.rd.reqs=120
  block.0.rd.bytes=4915200
  block.0.wr.reqs=60
  block.0.wr.bytes=245760
  block.0.allocation=1073741824
  block.0.capacity=21474836480
  block.0.physical=1073741824
  block.1.name=vdb
  block.1.rd.reqs=1
  block.1.rd.bytes=512
  block.1.wr.reqs=0
  block.1.wr.bytes=0
";

    #[test]
    fn test_parse_running_domain() {
        let stats = parse_domstats("instance-000002ee", RUNNING).unwrap();

        assert_eq!(stats.state, DomainState::Running);
        assert_eq!(stats.cpu, Some(CpuStats { number: 2, time: 1_049_843_000_000 }));
        assert_eq!(stats.memory.available, Some(2_047_940));
        assert_eq!(stats.memory.rss, Some(612_348));

        assert_eq!(stats.interfaces.len(), 1);
        assert_eq!(stats.interfaces[0].name, "vnet0");
        assert_eq!(stats.interfaces[0].rx_bytes, 1_000_000);
        assert_eq!(stats.interfaces[0].tx_packets, 300);

        assert_eq!(stats.disks.len(), 2);
        assert_eq!(stats.disks[0].read_requests, 120);
        assert_eq!(stats.disks[0].errors, 0);

        // vdb reports no sizes, like a network disk
        assert_eq!(stats.disk_info.len(), 1);
        assert_eq!(stats.disk_info[0].device, "vda");
        assert_eq!(stats.disk_info[0].capacity, 21_474_836_480);
    }

    #[test]
    fn test_parse_shutoff_domain() {
        let output = "Domain: 'instance-1'\n  state.state=5\n  state.reason=1\n";
        let stats = parse_domstats("instance-1", output)
            .unwrap();
        assert_eq!(stats.state, DomainState::Shutoff);
        assert!(stats.cpu.is_none());
        assert!(stats.interfaces.is_empty());
        assert!(stats.disks.is_empty());
    }

    #[test]
    fn test_parse_without_state_fails() {
        let err = parse_domstats("instance-1", "Domain: 'instance-1'\n").unwrap_err();
        assert!(matches!(err, VirtmonError::Inspect { .. }));
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "instance-1",
            "error: Disconnected from qemu:///system due to end of file\nerror: End of file while reading data: Input/output error",
        );
        assert!(err.is_connection_lost());

        let err = classify_failure("instance-1", "error: failed to get domain 'instance-1'");
        assert!(!err.is_connection_lost());
    }
}
