//! Zabbix sender protocol framing.
//!
//! # Wire Format
//!
//! Requests and responses share one header:
//!
//! ```text
//! ┌───────────┬─────────────┬──────────────────────┬─────────────────────┐
//! │ "ZBXD" (4)│ Version (1) │ Length (8 bytes)     │ JSON body (Length)  │
//! │           │ 0x01        │ little-endian u64    │ UTF-8               │
//! └───────────┴─────────────┴──────────────────────┴─────────────────────┘
//! ```
//!
//! The response body carries an `info` string of the form
//! `processed: 1; failed: 0; total: 1; seconds spent: 0.000055`.

use crate::error::{Result, VirtmonError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol magic.
pub const MAGIC: &[u8; 4] = b"ZBXD";

/// Protocol version byte.
pub const VERSION: u8 = 0x01;

/// Magic + version + length.
pub const HEADER_LEN: usize = 13;

/// Largest response body accepted from a server.
pub const MAX_BODY_LEN: u64 = 16 * 1024 * 1024;

static INFO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"processed: (\d*); failed: (\d*); total: (\d*); seconds spent: (\d*\.\d*)")
        .expect("valid regex")
});

/// One value in a sender request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub host: String,
    pub key: String,
    /// Zabbix expects every value as a string.
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock: Option<i64>,
}

impl Metric {
    pub fn new(host: impl Into<String>, key: impl Into<String>, value: impl ToString) -> Self {
        Self { host: host.into(), key: key.into(), value: value.to_string(), clock: None }
    }

    pub fn with_clock(mut self, clock: i64) -> Self {
        self.clock = Some(clock);
        self
    }
}

#[derive(Debug, Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: &'a [Metric],
}

/// Decoded response body.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderResponse {
    pub response: String,
    #[serde(default)]
    pub info: String,
}

impl SenderResponse {
    pub fn is_success(&self) -> bool {
        self.response == "success"
    }
}

/// Counters from a response `info` string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderInfo {
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
    pub seconds_spent: Duration,
}

/// Prefix a payload with the protocol header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Full request frame for a batch of metrics.
pub fn encode_request(metrics: &[Metric]) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(&SenderRequest { request: "sender data", data: metrics })
        .map_err(VirtmonError::internal)?;
    Ok(encode_frame(&payload))
}

/// Validate a header and return the declared body length.
pub fn parse_header(header: &[u8]) -> Result<u64> {
    if header.len() != HEADER_LEN {
        return Err(protocol(format!(
            "header is {} bytes, expected {}",
            header.len(),
            HEADER_LEN
        )));
    }
    if &header[..4] != MAGIC || header[4] != VERSION {
        return Err(protocol(format!("bad header magic {:02x?}", &header[..5])));
    }

    let mut len = [0u8; 8];
    len.copy_from_slice(&header[5..]);
    Ok(u64::from_le_bytes(len))
}

/// Read one frame, accumulating partial reads, and return its body.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = Vec::with_capacity(HEADER_LEN);
    read_up_to(reader, &mut header, HEADER_LEN).await?;
    let len = parse_header(&header)?;

    if len > MAX_BODY_LEN {
        return Err(protocol(format!("declared body length {} is too large", len)));
    }

    let len = len as usize;
    let mut body = Vec::with_capacity(len);
    read_up_to(reader, &mut body, len).await?;
    if body.len() < len {
        return Err(protocol(format!(
            "connection closed after {} of {} body bytes",
            body.len(),
            len
        )));
    }

    Ok(body)
}

/// Read until `want` bytes are buffered or the peer closes.
async fn read_up_to<R>(reader: &mut R, buf: &mut Vec<u8>, want: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    while buf.len() < want {
        let limit = (want - buf.len()).min(chunk.len());
        let n = reader.read(&mut chunk[..limit]).await.map_err(|e| VirtmonError::Io {
            endpoint: "sender".to_string(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// Decode a response body.
pub fn decode_response(body: &[u8]) -> Result<SenderResponse> {
    serde_json::from_slice(body).map_err(|e| protocol(format!("invalid response body: {}", e)))
}

/// Parse the fixed-field `info` string.
pub fn parse_info(info: &str) -> Result<SenderInfo> {
    let caps = INFO_RE
        .captures(info)
        .ok_or_else(|| protocol(format!("unrecognised info string: {:?}", info)))?;

    let count = |i: usize| -> Result<u64> {
        let digits = &caps[i];
        if digits.is_empty() {
            return Ok(0);
        }
        digits.parse().map_err(|_| protocol(format!("bad counter {:?} in info", digits)))
    };

    Ok(SenderInfo {
        processed: count(1)?,
        failed: count(2)?,
        total: count(3)?,
        seconds_spent: parse_seconds(&caps[4])?,
    })
}

/// Exact decimal seconds (`"0.000055"`) to a `Duration`, nanosecond precision.
pub fn parse_seconds(s: &str) -> Result<Duration> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs = if whole.is_empty() {
        0
    } else {
        whole.parse::<u64>().map_err(|_| protocol(format!("bad seconds {:?}", s)))?
    };

    let mut nanos = 0u32;
    for (i, d) in frac.chars().take(9).enumerate() {
        let digit = d.to_digit(10).ok_or_else(|| protocol(format!("bad seconds {:?}", s)))?;
        nanos += digit * 10u32.pow(8 - i as u32);
    }

    Ok(Duration::new(secs, nanos))
}

fn protocol(reason: String) -> VirtmonError {
    VirtmonError::Protocol { reason }
}
