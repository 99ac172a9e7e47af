//! Turning raw counters into Zabbix items.
//!
//! - `rate`: per-second rates from two counter readings
//! - `normalizer`: per-group records flattened into keyed items

pub mod normalizer;
pub mod rate;

pub use normalizer::{
    item_key, item_name, metric_group, Item, MetricGroup, MetricNormalizer, StatRecord,
    METRIC_GROUPS,
};
pub use rate::{cpu_utilization, rate, RateSampler, RateUnit};
