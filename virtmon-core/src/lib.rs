//! virtmon core library
//!
//! Collects per-domain counters from libvirt, turns them into Zabbix items,
//! keeps the matching items and triggers present on the Zabbix server and
//! ships values over the sender protocol.

pub mod config;
pub mod error;
pub mod inspector;
pub mod observability;
pub mod poller;
pub mod sampling;
pub mod threshold;
pub mod zabbix;

// Re-export commonly used items
pub use config::Config;
pub use error::{Result, VirtmonError};
pub use inspector::{DomainState, DomainStats, Inspector};
pub use observability::init as init_observability;
pub use poller::{CycleReport, PollLoop, PollSettings, PollState};
pub use sampling::{Item, MetricNormalizer, RateUnit};
pub use threshold::{ThresholdPolicy, ThresholdRule};
pub use zabbix::{
    DeliveryReport, MonitoringApi, ObjectReconciler, SenderClient, TriggerState, ZabbixApi,
};
