//! Configuration management.
//!
//! The agent reads one JSON document made of sections (`agent`, `libvirt`,
//! `api`, `sender`, `poll`, `trigger`, `threshold`). Every field can also be
//! addressed through the flat `"<section>-<key>"` form, which is how command
//! line overrides are applied.

use crate::error::{Result, VirtmonError};
use crate::zabbix::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtmon/config.json";

/// Default Zabbix trapper port.
pub const DEFAULT_SENDER_PORT: u16 = 10051;

/// Agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub libvirt: LibvirtConfig,
    pub api: ApiConfig,
    pub sender: SenderConfig,
    pub poll: PollConfig,
    pub trigger: TriggerConfig,
    pub threshold: ThresholdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host name of this hypervisor as registered on the Zabbix server.
    pub hostname: String,
    pub log_level: String,
    /// Deliver items that match no threshold rule as well.
    pub send_unmatched: bool,
    /// Port for the Prometheus scrape endpoint (disabled when unset).
    pub metrics_port: Option<u16>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            log_level: "info".to_string(),
            send_unmatched: false,
            metrics_port: None,
        }
    }
}

/// Libvirt domain type, used to pick a connection URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibvirtKind {
    #[default]
    Kvm,
    Lxc,
    Qemu,
    Uml,
    Xen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub kind: LibvirtKind,
    /// Overrides the URI derived from `kind`.
    pub uri: Option<String>,
    pub virsh_path: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self { kind: LibvirtKind::Kvm, uri: None, virsh_path: "virsh".to_string() }
    }
}

impl LibvirtConfig {
    /// Connection URI for the configured hypervisor.
    pub fn effective_uri(&self) -> String {
        if let Some(uri) = self.uri.as_deref().filter(|u| !u.is_empty()) {
            return uri.to_string();
        }
        match self.kind {
            LibvirtKind::Uml => "uml:///system",
            LibvirtKind::Xen => "xen:///",
            LibvirtKind::Lxc => "lxc:///",
            LibvirtKind::Kvm | LibvirtKind::Qemu => "qemu:///system",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the Zabbix frontend, without `api_jsonrpc.php`.
    pub url: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost/zabbix".to_string(),
            user: "Admin".to_string(),
            password: "zabbix".to_string(),
            timeout_secs: 10,
        }
    }
}

impl ApiConfig {
    /// Full JSON-RPC endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}/api_jsonrpc.php", self.url.trim_end_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Trapper endpoints as `host[:port]`.
    pub servers: Vec<String>,
    /// Read endpoints from a `zabbix_agentd.conf` instead of `servers`.
    pub agentd_config: Option<PathBuf>,
    pub chunk_size: usize,
    pub timeout_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            servers: vec![format!("127.0.0.1:{}", DEFAULT_SENDER_PORT)],
            agentd_config: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_secs: 10,
        }
    }
}

impl SenderConfig {
    /// Resolve the list of `host:port` endpoints.
    pub fn endpoints(&self) -> Result<Vec<String>> {
        if let Some(path) = &self.agentd_config {
            let content = std::fs::read_to_string(path).map_err(|e| VirtmonError::InvalidConfig {
                reason: format!("Failed to read {}: {}", path.display(), e),
            })?;
            return Ok(endpoints_from_agentd_conf(&content));
        }
        Ok(self.servers.iter().map(|s| with_default_port(s)).collect())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    /// Gap between the two reads used for rate metrics.
    pub sample_interval_secs: u64,
    pub max_workers: usize,
    /// Hard cap on one cycle; defaults to the poll interval.
    pub cycle_timeout_secs: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            sample_interval_secs: 1,
            max_workers: 4,
            cycle_timeout_secs: None,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs.unwrap_or(self.interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Rolling window of the trigger expression, in seconds.
    pub window_secs: u64,
    /// Zabbix trigger priority (2 = warning).
    pub priority: u8,
    /// Constant the window minimum is compared with. The limit of the
    /// matched threshold rule when unset.
    pub breach: Option<f64>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { window_secs: 300, priority: 2, breach: None }
    }
}

/// Alert limits, one per rate metric that can raise a trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub read_requests_ps: f64,
    pub write_requests_ps: f64,
    pub rx_bytes_ps: f64,
    pub tx_bytes_ps: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            read_requests_ps: 500.0,
            write_requests_ps: 500.0,
            rx_bytes_ps: 100.0,
            tx_bytes_ps: 100.0,
        }
    }
}

impl Config {
    /// Load configuration from disk, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| VirtmonError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| VirtmonError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Apply flat `"<section>-<key>"` overrides.
    ///
    /// Values are coerced to the type of the field they replace. List fields
    /// take comma separated values.
    pub fn apply_overrides<'a, I>(&mut self, overrides: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut tree = serde_json::to_value(&*self).map_err(VirtmonError::internal)?;

        for (flat_key, raw) in overrides {
            let (section, key) = flat_key.split_once('-').ok_or_else(|| {
                VirtmonError::InvalidConfig {
                    reason: format!("Expected <section>-<key>, got {}", flat_key),
                }
            })?;
            let slot = tree.get_mut(section).and_then(|s| s.get_mut(key)).ok_or_else(|| {
                VirtmonError::InvalidConfig { reason: format!("Unknown config key: {}", flat_key) }
            })?;
            *slot = coerce(slot, raw).map_err(|reason| VirtmonError::InvalidConfig {
                reason: format!("{}: {}", flat_key, reason),
            })?;
        }

        *self = serde_json::from_value(tree).map_err(|e| VirtmonError::InvalidConfig {
            reason: format!("Invalid override: {}", e),
        })?;
        Ok(())
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> {
            Err(VirtmonError::InvalidConfig { reason: reason.to_string() })
        };

        if self.agent.hostname.trim().is_empty() {
            return invalid("agent-hostname must be set");
        }
        if self.sender.agentd_config.is_none() && self.sender.servers.is_empty() {
            return invalid("sender-servers must list at least one endpoint");
        }
        if self.sender.chunk_size == 0 {
            return invalid("sender-chunk_size must be greater than zero");
        }
        if self.poll.interval_secs == 0 {
            return invalid("poll-interval_secs must be greater than zero");
        }
        if self.poll.max_workers == 0 {
            return invalid("poll-max_workers must be greater than zero");
        }
        if self.api.url.trim().is_empty() {
            return invalid("api-url must be set");
        }
        Ok(())
    }
}

/// Split a `<section>-<key>=<value>` command line argument.
pub fn parse_override(arg: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected <section>-<key>=<value>, got {}", arg))?;
    if !key.contains('-') {
        return Err(format!("expected <section>-<key>, got {}", key));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn coerce(current: &Value, raw: &str) -> std::result::Result<Value, String> {
    match current {
        Value::Bool(_) => parse_bool(raw).map(Value::Bool),
        Value::Number(n) if n.is_u64() => {
            raw.parse::<u64>().map(Value::from).map_err(|e| e.to_string())
        }
        Value::Number(n) if n.is_i64() => {
            raw.parse::<i64>().map(Value::from).map_err(|e| e.to_string())
        }
        Value::Number(_) => raw
            .parse::<f64>()
            .map_err(|e| e.to_string())
            .and_then(|f| {
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or("not a finite number".into())
            }),
        Value::Array(_) => Ok(Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        )),
        Value::String(_) => Ok(Value::String(raw.to_string())),
        Value::Null => Ok(raw
            .parse::<u64>()
            .map(Value::from)
            .ok()
            .or_else(|| {
                raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number)
            })
            .unwrap_or_else(|| Value::String(raw.to_string()))),
        Value::Object(_) => Err("cannot override a whole section".to_string()),
    }
}

fn parse_bool(raw: &str) -> std::result::Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("not a boolean: {}", other)),
    }
}

fn with_default_port(server: &str) -> String {
    let server = server.trim();
    if server.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        server.to_string()
    } else {
        format!("{}:{}", server, DEFAULT_SENDER_PORT)
    }
}

/// Read trapper endpoints from `zabbix_agentd.conf` content.
///
/// `Server` may hold a comma separated list; every entry shares `Port`.
/// Missing keys fall back to `127.0.0.1` and the default trapper port.
pub fn endpoints_from_agentd_conf(content: &str) -> Vec<String> {
    let mut servers = "127.0.0.1".to_string();
    let mut port = DEFAULT_SENDER_PORT.to_string();

    for line in content.lines().map(str::trim) {
        if line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "Server" => servers = value.trim().to_string(),
                "Port" => port = value.trim().to_string(),
                _ => {}
            }
        }
    }

    servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("{}:{}", s, port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sender.chunk_size, 250);
        assert_eq!(config.poll.interval(), Duration::from_secs(60));
        assert_eq!(config.poll.cycle_timeout(), Duration::from_secs(60));
        assert_eq!(config.trigger.priority, 2);
        assert_eq!(config.trigger.breach, None);
        assert_eq!(config.api.endpoint(), "http://localhost/zabbix/api_jsonrpc.php");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/virtmon.json")).unwrap();
        assert_eq!(config.agent.log_level, "info");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"agent": {{"hostname": "compute-01"}}, "sender": {{"chunk_size": 100}}}}"#)
            .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.agent.hostname, "compute-01");
        assert_eq!(config.sender.chunk_size, 100);
        assert_eq!(config.sender.timeout_secs, 10);
    }

    #[test]
    fn test_overrides_coerce_types() {
        let mut config = Config::default();
        config
            .apply_overrides([
                ("agent-hostname", "compute-02"),
                ("agent-send_unmatched", "yes"),
                ("agent-metrics_port", "9105"),
                ("sender-servers", "10.0.0.1, 10.0.0.2:10052"),
                ("sender-chunk_size", "50"),
                ("threshold-rx_bytes_ps", "12.5"),
                ("trigger-breach", "150.5"),
                ("libvirt-kind", "xen"),
            ])
            .unwrap();

        assert_eq!(config.agent.hostname, "compute-02");
        assert!(config.agent.send_unmatched);
        assert_eq!(config.agent.metrics_port, Some(9105));
        assert_eq!(config.sender.chunk_size, 50);
        assert_eq!(config.threshold.rx_bytes_ps, 12.5);
        assert_eq!(config.trigger.breach, Some(150.5));
        assert_eq!(config.libvirt.effective_uri(), "xen:///");
        assert_eq!(
            config.sender.endpoints().unwrap(),
            vec!["10.0.0.1:10051".to_string(), "10.0.0.2:10052".to_string()]
        );
    }

    #[test]
    fn test_override_unknown_key() {
        let mut config = Config::default();
        let err = config.apply_overrides([("agent-nope", "1")]).unwrap_err();
        assert!(matches!(err, VirtmonError::InvalidConfig { .. }));

        let err = config.apply_overrides([("sender-chunk_size", "many")]).unwrap_err();
        assert!(err.to_string().contains("sender-chunk_size"));
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("poll-interval_secs=30").unwrap(),
            ("poll-interval_secs".to_string(), "30".to_string())
        );
        assert!(parse_override("interval=30").is_err());
        assert!(parse_override("poll-interval_secs").is_err());
    }

    #[test]
    fn test_libvirt_uri() {
        let mut libvirt = LibvirtConfig::default();
        assert_eq!(libvirt.effective_uri(), "qemu:///system");
        libvirt.kind = LibvirtKind::Lxc;
        assert_eq!(libvirt.effective_uri(), "lxc:///");
        libvirt.uri = Some("qemu+ssh://root@hv1/system".to_string());
        assert_eq!(libvirt.effective_uri(), "qemu+ssh://root@hv1/system");
    }

    #[test]
    fn test_agentd_conf() {
        let conf = "# comment\nServer=zbx1, zbx2\nPort=10052\nHostname=hv1\n";
        assert_eq!(endpoints_from_agentd_conf(conf), vec!["zbx1:10052", "zbx2:10052"]);
        assert_eq!(endpoints_from_agentd_conf(""), vec!["127.0.0.1:10051"]);
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
        config.agent.hostname = "compute-01".to_string();
        assert!(config.validate().is_ok());
        config.sender.chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
