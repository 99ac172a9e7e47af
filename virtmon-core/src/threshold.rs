//! Static alert thresholds keyed by item-key substrings.

use crate::config::ThresholdConfig;
use serde::{Deserialize, Serialize};

/// One alert rule: items whose key contains `substring` alert above `limit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub name: String,
    pub substring: String,
    pub limit: f64,
}

impl ThresholdRule {
    pub fn new(name: impl Into<String>, substring: impl Into<String>, limit: f64) -> Self {
        Self { name: name.into(), substring: substring.into(), limit }
    }

    pub fn matches(&self, key: &str) -> bool {
        key.contains(&self.substring)
    }

    /// Over threshold iff `|value| > limit`.
    pub fn is_breached(&self, value: f64) -> bool {
        value.abs() > self.limit
    }
}

/// Immutable set of rules, evaluated in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ThresholdPolicy {
    rules: Vec<ThresholdRule>,
}

impl ThresholdPolicy {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self { rules }
    }

    /// Request-rate and traffic-rate rules with the configured limits.
    pub fn from_config(config: &ThresholdConfig) -> Self {
        Self::new(vec![
            ThresholdRule::new("read_requests", "read_requests_ps", config.read_requests_ps),
            ThresholdRule::new("write_requests", "write_requests_ps", config.write_requests_ps),
            ThresholdRule::new("rx_bytes", "rx_bytes_ps", config.rx_bytes_ps),
            ThresholdRule::new("tx_bytes", "tx_bytes_ps", config.tx_bytes_ps),
        ])
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// First rule whose substring the key contains, scanning every rule.
    pub fn classify(&self, key: &str) -> Option<&ThresholdRule> {
        self.rules.iter().find(|rule| rule.matches(key))
    }

    /// The matched rule, if the value is over its limit.
    pub fn breached(&self, key: &str, value: f64) -> Option<&ThresholdRule> {
        self.classify(key).filter(|rule| rule.is_breached(value))
    }
}
