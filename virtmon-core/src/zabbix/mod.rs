//! Zabbix server integration.
//!
//! - `api`: JSON-RPC client for host/item/trigger lookups and creation
//! - `reconciler`: get-or-create of items and triggers
//! - `protocol`: sender wire format
//! - `sender`: chunked delivery of values

pub mod api;
pub mod protocol;
pub mod reconciler;
pub mod sender;

pub use api::{
    HostRef, MonitoringApi, NewItem, NewTrigger, RemoteItemRef, RemoteTriggerRef, ZabbixApi,
};
pub use protocol::{Metric, SenderInfo};
pub use reconciler::{CycleScope, ObjectReconciler, TriggerState};
pub use sender::{DeliveryReport, SenderClient, DEFAULT_CHUNK_SIZE};
