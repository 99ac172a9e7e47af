//! Get-or-create of items and triggers on the Zabbix server.
//!
//! The server is the only authority on what exists: every creation is
//! preceded by a lookup. Two agents (or two processes) reconciling the same
//! key at the same instant can still both create; inside one process the
//! per-key lock rules that out.

use super::api::{MonitoringApi, NewItem, NewTrigger, RemoteItemRef, RemoteTriggerRef};
use crate::config::TriggerConfig;
use crate::error::{Result, VirtmonError};
use crate::observability::metrics as agent_metrics;
use crate::sampling::Item;
use crate::threshold::ThresholdRule;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, instrument};

/// Outcome of the host lookup, kept for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostResolution {
    Found(String),
    NotFound,
    Ambiguous(usize),
    Failed,
}

/// State shared by every worker of one poll cycle.
///
/// The host id is looked up at most once per cycle, then reused.
#[derive(Debug, Default)]
pub struct CycleScope {
    host: OnceCell<HostResolution>,
}

impl CycleScope {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Triggers known to exist, keyed by expression.
///
/// Lives for one run of the agent. An entry goes stale if the trigger is
/// deleted on the server while the agent runs; it is then not recreated
/// until restart or `forget`.
#[derive(Debug, Default)]
pub struct TriggerState {
    known: RwLock<HashMap<String, RemoteTriggerRef>>,
}

impl TriggerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, expression: &str) -> Option<RemoteTriggerRef> {
        self.known.read().await.get(expression).cloned()
    }

    pub async fn record(&self, trigger: RemoteTriggerRef) {
        self.known.write().await.insert(trigger.expression.clone(), trigger);
    }

    pub async fn forget(&self, expression: &str) -> Option<RemoteTriggerRef> {
        self.known.write().await.remove(expression)
    }

    pub async fn len(&self) -> usize {
        self.known.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.known.read().await.is_empty()
    }
}

/// Keeps remote items and triggers in step with the items the agent sends.
pub struct ObjectReconciler {
    api: Arc<dyn MonitoringApi>,
    hostname: String,
    trigger: TriggerConfig,
    key_locks: KeyLocks,
}

type KeyLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Holds the lock of one key; drops the map entry once nobody else wants it.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // the guard owns a clone of the Arc, release it first
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

impl ObjectReconciler {
    /// `hostname` is the Zabbix host the items belong to.
    pub fn new(
        api: Arc<dyn MonitoringApi>,
        hostname: impl Into<String>,
        trigger: TriggerConfig,
    ) -> Self {
        Self {
            api,
            hostname: hostname.into(),
            trigger,
            key_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Host id of the configured hostname, resolved once per cycle.
    pub async fn resolve_host(&self, scope: &CycleScope) -> Result<String> {
        let resolution = scope.host.get_or_init(|| self.lookup_host()).await;

        match resolution {
            HostResolution::Found(id) => Ok(id.clone()),
            HostResolution::NotFound => {
                Err(VirtmonError::HostNotFound { host: self.hostname.clone() })
            }
            HostResolution::Ambiguous(count) => {
                Err(VirtmonError::AmbiguousHost { host: self.hostname.clone(), count: *count })
            }
            HostResolution::Failed => {
                Err(VirtmonError::HostUnresolved { host: self.hostname.clone() })
            }
        }
    }

    async fn lookup_host(&self) -> HostResolution {
        match self.api.get_hosts(&self.hostname).await {
            Ok(hosts) if hosts.len() == 1 => {
                debug!(host = %self.hostname, host_id = %hosts[0].host_id, "Resolved host");
                HostResolution::Found(hosts[0].host_id.clone())
            }
            Ok(hosts) if hosts.is_empty() => {
                error!(
                    host = %self.hostname,
                    "Host not found on Zabbix server, skipping reconciliation this cycle"
                );
                HostResolution::NotFound
            }
            Ok(hosts) => {
                error!(
                    host = %self.hostname,
                    count = hosts.len(),
                    "Host name is ambiguous, skipping reconciliation this cycle"
                );
                HostResolution::Ambiguous(hosts.len())
            }
            Err(e) => {
                error!(
                    host = %self.hostname,
                    error = %e,
                    "Host lookup failed, skipping reconciliation this cycle"
                );
                HostResolution::Failed
            }
        }
    }

    /// Make sure an item with `item.key` exists on the host.
    #[instrument(skip(self, scope, item), fields(key = %item.key))]
    pub async fn ensure_item(&self, scope: &CycleScope, item: &Item) -> Result<RemoteItemRef> {
        let host_id = self.resolve_host(scope).await?;
        let _guard = self.lock_key(format!("item:{}", item.key)).await;

        if let Some(existing) = self.api.get_items(&host_id, &item.key).await?.into_iter().next() {
            return Ok(existing);
        }

        let new_item = NewItem::trapper(&host_id, &item.key, &item.name);
        let created = self.api.create_item(&new_item).await?;
        info!(key = %item.key, item_id = %created.item_id, "Created item");
        agent_metrics::record_object_created("item");
        Ok(created)
    }

    /// Trigger raised when `item` stays over the breach constant, which is
    /// `trigger-breach` when configured and `rule.limit` otherwise.
    pub fn trigger_for(&self, item: &Item, rule: &ThresholdRule) -> NewTrigger {
        let breach = self.trigger.breach.unwrap_or(rule.limit);
        NewTrigger {
            description: format!("{} is over {}", item.name, breach),
            expression: format!(
                "{{{}:{}.min({}s)}}>{}",
                self.hostname, item.key, self.trigger.window_secs, breach
            ),
            priority: self.trigger.priority,
        }
    }

    /// Make sure the threshold trigger of `item` exists.
    ///
    /// Triggers already seen this run are taken from `state` without asking
    /// the server.
    #[instrument(skip(self, scope, state, item, rule), fields(key = %item.key))]
    pub async fn ensure_trigger(
        &self,
        scope: &CycleScope,
        state: &TriggerState,
        item: &Item,
        rule: &ThresholdRule,
    ) -> Result<RemoteTriggerRef> {
        let wanted = self.trigger_for(item, rule);
        if let Some(known) = state.get(&wanted.expression).await {
            return Ok(known);
        }

        let host_id = self.resolve_host(scope).await?;
        let _guard = self.lock_key(format!("trigger:{}", wanted.expression)).await;

        // another worker may have finished while we waited for the lock
        if let Some(known) = state.get(&wanted.expression).await {
            return Ok(known);
        }

        let existing = self.api.get_triggers(&host_id, &wanted.expression).await?;
        let trigger = match existing.into_iter().next() {
            Some(existing) => existing,
            None => {
                let created = self.api.create_trigger(&wanted).await?;
                info!(
                    key = %item.key,
                    trigger_id = %created.trigger_id,
                    expression = %created.expression,
                    "Created trigger"
                );
                agent_metrics::record_object_created("trigger");
                created
            }
        };

        state.record(trigger.clone()).await;
        Ok(trigger)
    }

    async fn lock_key(&self, key: String) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard { locks: &self.key_locks, key, guard: Some(guard) }
    }

    #[cfg(test)]
    fn held_key_locks(&self) -> usize {
        self.key_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
