//! Zabbix JSON-RPC API: the handful of verbs the agent needs.

use crate::config::ApiConfig;
use crate::error::{Result, VirtmonError};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

/// Zabbix item type "Zabbix trapper": values arrive through the sender.
pub const ITEM_TYPE_TRAPPER: u8 = 2;

/// Zabbix value type "numeric float".
pub const VALUE_TYPE_FLOAT: u8 = 0;

/// A host as known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostRef {
    #[serde(rename = "hostid")]
    pub host_id: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteItemRef {
    #[serde(rename = "itemid")]
    pub item_id: String,
    #[serde(rename = "key_")]
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteTriggerRef {
    #[serde(rename = "triggerid")]
    pub trigger_id: String,
    pub expression: String,
}

/// Item to create.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewItem {
    #[serde(rename = "hostid")]
    pub host_id: String,
    #[serde(rename = "key_")]
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: u8,
    pub value_type: u8,
}

impl NewItem {
    /// Trapper item holding float values.
    pub fn trapper(
        host_id: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            key: key.into(),
            name: name.into(),
            item_type: ITEM_TYPE_TRAPPER,
            value_type: VALUE_TYPE_FLOAT,
        }
    }
}

/// Trigger to create.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTrigger {
    pub description: String,
    pub expression: String,
    pub priority: u8,
}

/// Monitoring-server verbs, one method each.
#[async_trait]
pub trait MonitoringApi: Send + Sync {
    /// `host.get` filtered by technical host name.
    async fn get_hosts(&self, host: &str) -> Result<Vec<HostRef>>;

    /// `item.get` filtered by host id and exact key.
    async fn get_items(&self, host_id: &str, key: &str) -> Result<Vec<RemoteItemRef>>;

    /// `item.create`.
    async fn create_item(&self, item: &NewItem) -> Result<RemoteItemRef>;

    /// `trigger.get` on a host whose expanded expression equals `expression`.
    async fn get_triggers(&self, host_id: &str, expression: &str) -> Result<Vec<RemoteTriggerRef>>;

    /// `trigger.create`.
    async fn create_trigger(&self, trigger: &NewTrigger) -> Result<RemoteTriggerRef>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CreatedIds {
    #[serde(default)]
    itemids: Vec<String>,
    #[serde(default)]
    triggerids: Vec<String>,
}

/// JSON-RPC client for `<url>/api_jsonrpc.php`.
pub struct ZabbixApi {
    client: Client,
    endpoint: String,
    auth: Option<String>,
    next_id: AtomicU64,
}

impl ZabbixApi {
    /// Client without a session; call `login` before anything else.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build().map_err(|e| {
            VirtmonError::InvalidConfig { reason: format!("Failed to create HTTP client: {}", e) }
        })?;

        Ok(Self { client, endpoint: config.endpoint(), auth: None, next_id: AtomicU64::new(0) })
    }

    /// Build a client and open a session with the configured credentials.
    pub async fn connect(config: &ApiConfig) -> Result<Self> {
        let mut api = Self::new(config)?;
        api.login(&config.user, &config.password).await?;
        Ok(api)
    }

    /// `user.login`; the returned token authenticates every later call.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        self.auth = None;
        let params = json!({ "user": user, "password": password });
        let token: String = self.call("user.login", params).await?;
        self.auth = Some(token);
        info!(endpoint = %self.endpoint, user = %user, "Logged in to Zabbix API");
        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip(self, params), fields(endpoint = %self.endpoint))]
    async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id,
            auth: self.auth.as_deref(),
        };

        let transport =
            |reason: String| VirtmonError::ApiTransport { method: method.to_string(), reason };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json-rpc")
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport(e.to_string()))?;

        let body: RpcResponse = response.json().await.map_err(|e| transport(e.to_string()))?;
        debug!(method = %method, id, "API call answered");

        if let Some(error) = body.error {
            let data = match error.data {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => "No data".to_string(),
            };
            return Err(VirtmonError::Api {
                method: method.to_string(),
                code: error.code,
                message: error.message,
                data,
            });
        }

        let result = body
            .result
            .ok_or_else(|| transport("response has neither result nor error".to_string()))?;
        serde_json::from_value(result).map_err(|e| transport(format!("unexpected result: {}", e)))
    }
}

#[async_trait]
impl MonitoringApi for ZabbixApi {
    async fn get_hosts(&self, host: &str) -> Result<Vec<HostRef>> {
        self.call(
            "host.get",
            json!({ "output": ["hostid", "host"], "filter": { "host": [host] } }),
        )
        .await
    }

    async fn get_items(&self, host_id: &str, key: &str) -> Result<Vec<RemoteItemRef>> {
        self.call(
            "item.get",
            json!({
                "output": ["itemid", "key_"],
                "hostids": host_id,
                "filter": { "key_": key },
            }),
        )
        .await
    }

    async fn create_item(&self, item: &NewItem) -> Result<RemoteItemRef> {
        let created: CreatedIds = self.call("item.create", item).await?;
        let item_id = created.itemids.into_iter().next().ok_or_else(|| VirtmonError::ApiTransport {
            method: "item.create".to_string(),
            reason: "no item id returned".to_string(),
        })?;
        Ok(RemoteItemRef { item_id, key: item.key.clone() })
    }

    async fn get_triggers(&self, host_id: &str, expression: &str) -> Result<Vec<RemoteTriggerRef>> {
        let triggers: Vec<RemoteTriggerRef> = self
            .call(
                "trigger.get",
                json!({
                    "output": ["triggerid", "expression"],
                    "hostids": host_id,
                    "expandExpression": true,
                }),
            )
            .await?;

        // trigger.get cannot filter on the expression itself
        Ok(triggers.into_iter().filter(|t| t.expression == expression).collect())
    }

    async fn create_trigger(&self, trigger: &NewTrigger) -> Result<RemoteTriggerRef> {
        let created: CreatedIds = self.call("trigger.create", trigger).await?;
        let trigger_id =
            created.triggerids.into_iter().next().ok_or_else(|| VirtmonError::ApiTransport {
                method: "trigger.create".to_string(),
                reason: "no trigger id returned".to_string(),
            })?;
        Ok(RemoteTriggerRef { trigger_id, expression: trigger.expression.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_wire_shape() {
        let item =
            NewItem::trapper("10084", "state.state[instance-1]", "Instance-1 - State - State");
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["hostid"], "10084");
        assert_eq!(value["key_"], "state.state[instance-1]");
        assert_eq!(value["type"], 2);
        assert_eq!(value["value_type"], 0);
    }

    #[test]
    fn test_request_omits_auth_before_login() {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: "user.login",
            params: json!({}),
            id: 0,
            auth: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("auth").is_none());
        assert_eq!(value["jsonrpc"], "2.0");
    }

    #[test]
    fn test_error_response_shape() {
        let body: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid params.","data":"Item exists."},"id":3}"#,
        )
        .unwrap();
        let error = body.error.unwrap();
        assert_eq!(error.code, -32602);
        assert_eq!(error.data, Some(Value::String("Item exists.".to_string())));
        assert!(body.result.is_none());
    }

    #[test]
    fn test_endpoint_from_config() {
        let api = ZabbixApi::new(&ApiConfig::default()).unwrap();
        assert_eq!(api.endpoint(), "http://localhost/zabbix/api_jsonrpc.php");
    }
}
