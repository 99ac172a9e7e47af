//! Shared test doubles: a mock Zabbix API, a mock inspector and an
//! in-process sender server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use virtmon_core::error::Result;
use virtmon_core::inspector::{
    CpuStats, DiskStats, DomainState, DomainStats, Inspector, InterfaceStats, MemoryStats,
};
use virtmon_core::zabbix::protocol::{encode_frame, read_frame};
use virtmon_core::zabbix::{
    HostRef, MonitoringApi, NewItem, NewTrigger, RemoteItemRef, RemoteTriggerRef,
};

/// In-memory Zabbix server state with call counters.
#[derive(Default)]
pub struct MockApi {
    pub hosts: Vec<HostRef>,
    pub items: Mutex<Vec<RemoteItemRef>>,
    pub triggers: Mutex<Vec<RemoteTriggerRef>>,
    pub host_lookups: AtomicUsize,
    pub item_lookups: AtomicUsize,
    pub trigger_lookups: AtomicUsize,
    pub items_created: AtomicUsize,
    pub triggers_created: AtomicUsize,
}

impl MockApi {
    /// Server knowing the given host names, with ids 10001, 10002, ...
    pub fn with_hosts(names: &[&str]) -> Self {
        let hosts = names
            .iter()
            .enumerate()
            .map(|(i, name)| HostRef { host_id: (10001 + i).to_string(), host: name.to_string() })
            .collect();
        Self { hosts, ..Default::default() }
    }

    pub fn created_items(&self) -> usize {
        self.items_created.load(Ordering::SeqCst)
    }

    pub fn created_triggers(&self) -> usize {
        self.triggers_created.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MonitoringApi for MockApi {
    async fn get_hosts(&self, host: &str) -> Result<Vec<HostRef>> {
        self.host_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.hosts.iter().filter(|h| h.host == host).cloned().collect())
    }

    async fn get_items(&self, _host_id: &str, key: &str) -> Result<Vec<RemoteItemRef>> {
        self.item_lookups.fetch_add(1, Ordering::SeqCst);
        // let concurrent callers interleave
        tokio::task::yield_now().await;
        Ok(self.items.lock().unwrap().iter().filter(|i| i.key == key).cloned().collect())
    }

    async fn create_item(&self, item: &NewItem) -> Result<RemoteItemRef> {
        let n = self.items_created.fetch_add(1, Ordering::SeqCst);
        let created = RemoteItemRef { item_id: (30001 + n).to_string(), key: item.key.clone() };
        self.items.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn get_triggers(
        &self,
        _host_id: &str,
        expression: &str,
    ) -> Result<Vec<RemoteTriggerRef>> {
        self.trigger_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .triggers
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.expression == expression)
            .cloned()
            .collect())
    }

    async fn create_trigger(&self, trigger: &NewTrigger) -> Result<RemoteTriggerRef> {
        let n = self.triggers_created.fetch_add(1, Ordering::SeqCst);
        let created = RemoteTriggerRef {
            trigger_id: (50001 + n).to_string(),
            expression: trigger.expression.clone(),
        };
        self.triggers.lock().unwrap().push(created.clone());
        Ok(created)
    }
}

/// Inspector whose counters grow by a fixed step on every read.
///
/// Each read of a running domain adds 12 read requests and 1000 received
/// bytes, so with a 100ms sample interval the disk read rate is 120 ops/s.
pub struct MockInspector {
    pub domains: Vec<(String, DomainState)>,
    reads: Mutex<HashMap<String, u64>>,
    delays: HashMap<String, Duration>,
}

impl MockInspector {
    pub fn new(domains: &[(&str, DomainState)]) -> Self {
        Self {
            domains: domains.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
            reads: Mutex::new(HashMap::new()),
            delays: HashMap::new(),
        }
    }

    /// Make every read of `domain` take `delay`.
    pub fn with_delay(mut self, domain: &str, delay: Duration) -> Self {
        self.delays.insert(domain.to_string(), delay);
        self
    }
}

#[async_trait::async_trait]
impl Inspector for MockInspector {
    async fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.domains.iter().map(|(n, _)| n.clone()).collect())
    }

    async fn domain_stats(&self, domain: &str) -> Result<DomainStats> {
        if let Some(delay) = self.delays.get(domain) {
            tokio::time::sleep(*delay).await;
        }

        let state = self
            .domains
            .iter()
            .find(|(n, _)| n == domain)
            .map(|(_, s)| *s)
            .ok_or_else(|| virtmon_core::VirtmonError::Inspect {
                domain: domain.to_string(),
                reason: "Domain not found".to_string(),
            })?;

        if !state.is_running() {
            return Ok(DomainStats::state_only(domain, state));
        }

        let n = {
            let mut reads = self.reads.lock().unwrap();
            let n = reads.entry(domain.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        Ok(DomainStats {
            domain: domain.to_string(),
            state,
            cpu: Some(CpuStats { number: 2, time: n * 10_000_000 }),
            memory: MemoryStats {
                available: Some(2_048_000),
                unused: Some(1_024_000),
                rss: Some(512_000),
            },
            interfaces: vec![InterfaceStats {
                name: "vnet0".to_string(),
                rx_bytes: n * 1000,
                rx_packets: n,
                tx_bytes: 0,
                tx_packets: 0,
            }],
            disks: vec![DiskStats {
                device: "vda".to_string(),
                read_bytes: 0,
                read_requests: n * 12,
                write_bytes: 0,
                write_requests: 0,
                errors: 0,
            }],
            disk_info: vec![],
            clock: 1_700_000_000,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// How the fake sender server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Accept every value.
    Success,
    /// Header with the wrong magic.
    BadMagic,
    /// Declares more body bytes than it sends, then closes.
    Truncated,
    /// Success, written a few bytes at a time.
    Dribble,
    /// Success, after holding the reply for half a second.
    Slow,
}

/// Requests seen by the fake server: number of values in each.
pub type Seen = Arc<Mutex<Vec<usize>>>;

/// Start a sender server on an ephemeral port.
pub async fn spawn_sender_server(reply: Reply) -> (SocketAddr, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let log = log.clone();
            tokio::spawn(async move {
                let Ok(body) = read_frame(&mut stream).await else {
                    return;
                };
                let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(request["request"], "sender data");
                let count = request["data"].as_array().map(Vec::len).unwrap_or(0);
                log.lock().unwrap().push(count);

                let info = format!(
                    "processed: {}; failed: 0; total: {}; seconds spent: 0.000050",
                    count, count
                );
                let response = serde_json::json!({ "response": "success", "info": info });
                let frame = encode_frame(response.to_string().as_bytes());

                match reply {
                    Reply::Success => {
                        let _ = stream.write_all(&frame).await;
                    }
                    Reply::BadMagic => {
                        let mut bad = frame.clone();
                        bad[3] = b'X';
                        let _ = stream.write_all(&bad).await;
                    }
                    Reply::Truncated => {
                        let mut short = frame.clone();
                        let declared = (frame.len() - 13 + 100) as u64;
                        short[5..13].copy_from_slice(&declared.to_le_bytes());
                        let _ = stream.write_all(&short).await;
                    }
                    Reply::Slow => {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        let _ = stream.write_all(&frame).await;
                    }
                    Reply::Dribble => {
                        for piece in frame.chunks(5) {
                            let _ = stream.write_all(piece).await;
                            let _ = stream.flush().await;
                            tokio::time::sleep(Duration::from_millis(2)).await;
                        }
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, seen)
}
