//! Batch delivery of values over the Zabbix sender protocol.

use super::protocol::{decode_response, encode_request, parse_info, read_frame, Metric, SenderInfo};
use crate::error::{Result, VirtmonError};
use crate::observability::metrics as agent_metrics;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

/// Default number of values per request.
pub const DEFAULT_CHUNK_SIZE: usize = 250;

/// Aggregate outcome of one `send`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
    /// Sum of the server-reported processing times
    pub seconds_spent: Duration,
    /// Requests issued
    pub chunks: usize,
    /// Requests that failed as a whole
    pub failed_chunks: usize,
}

impl DeliveryReport {
    fn add_info(&mut self, info: &SenderInfo) {
        self.processed += info.processed;
        self.failed += info.failed;
        self.total += info.total;
        self.seconds_spent += info.seconds_spent;
        self.chunks += 1;
    }

    fn add_failed_chunk(&mut self, len: usize) {
        self.failed += len as u64;
        self.total += len as u64;
        self.chunks += 1;
        self.failed_chunks += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }
}

impl fmt::Display for DeliveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed: {}; failed: {}; total: {}; seconds spent: {:.6}; chunks: {}",
            self.processed,
            self.failed,
            self.total,
            self.seconds_spent.as_secs_f64(),
            self.chunks
        )
    }
}

/// Sends values to one or more Zabbix servers/proxies.
#[derive(Debug, Clone)]
pub struct SenderClient {
    endpoints: Vec<String>,
    chunk_size: usize,
    timeout: Duration,
}

impl SenderClient {
    /// `endpoints` are `host:port` strings.
    pub fn new(endpoints: Vec<String>, chunk_size: usize, timeout: Duration) -> Self {
        Self { endpoints, chunk_size: chunk_size.max(1), timeout }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Send `metrics` in chunks, never failing past this call.
    ///
    /// Every chunk goes to every endpoint. A chunk counts as failed as a whole
    /// when any endpoint could not be reached or answered with a malformed or
    /// unsuccessful response; otherwise the last endpoint's counters are used.
    #[instrument(skip(self, metrics), fields(count = metrics.len()))]
    pub async fn send(&self, metrics: &[Metric]) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for (index, chunk) in metrics.chunks(self.chunk_size).enumerate() {
            match self.send_chunk(chunk).await {
                Ok(info) => {
                    debug!(
                        chunk = index,
                        processed = info.processed,
                        failed = info.failed,
                        "Chunk delivered"
                    );
                    agent_metrics::record_chunk("ok", info.processed, info.failed);
                    report.add_info(&info);
                }
                Err(e) => {
                    warn!(chunk = index, size = chunk.len(), error = %e, "Chunk delivery failed");
                    agent_metrics::record_chunk(e.kind(), 0, chunk.len() as u64);
                    report.add_failed_chunk(chunk.len());
                }
            }
        }

        report
    }

    async fn send_chunk(&self, chunk: &[Metric]) -> Result<SenderInfo> {
        let frame = encode_request(chunk)?;
        let mut last = None;
        let mut failure = None;

        for endpoint in &self.endpoints {
            match self.exchange(endpoint, &frame).await {
                Ok(info) => last = Some(info),
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Sender request failed");
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        last.ok_or_else(|| VirtmonError::InvalidConfig {
            reason: "no sender endpoints configured".to_string(),
        })
    }

    /// One request/response round trip with a single endpoint.
    async fn exchange(&self, endpoint: &str, frame: &[u8]) -> Result<SenderInfo> {
        let io_err =
            |source: std::io::Error| VirtmonError::Io { endpoint: endpoint.to_string(), source };

        let round_trip = async {
            let mut stream = TcpStream::connect(endpoint).await.map_err(io_err)?;
            stream.write_all(frame).await.map_err(io_err)?;
            stream.flush().await.map_err(io_err)?;
            read_frame(&mut stream).await
        };

        let timed_out = |_: tokio::time::error::Elapsed| VirtmonError::Io {
            endpoint: endpoint.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "sender request timed out"),
        };
        let body = tokio::time::timeout(self.timeout, round_trip).await.map_err(timed_out)??;

        let response = decode_response(&body)?;
        if !response.is_success() {
            return Err(VirtmonError::Protocol {
                reason: format!("server answered {:?}: {}", response.response, response.info),
            });
        }
        parse_info(&response.info)
    }
}
