//! # Engine Control API
//!
//! Thin client for the engine's local HTTP control API (Clash-compatible).
//!
//! ## Endpoints
//! - `GET /` answers `200` once the engine is ready.
//! - `GET /connections` returns cumulative totals plus the live connection list.
//! - `DELETE /connections` and `DELETE /connections/{id}` close connections.
//! - `PUT /proxies/{group}` selects an outbound in a selector group.
//! - `PATCH /configs` switches the routing mode.
//!
//! Every request carries the configured secret as a bearer token. Requests are
//! never retried here: the supervisor and poller have their own cadence.

use std::time::Duration;

use lib_common::retrieve::ky_http::{ApiClient, ApiClientOptions};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ControlError, ControlResult};
use crate::types::{ConnectionInfo, EngineConfig, ProxyMode};

/// Per-request deadline for control API calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Body of `GET /connections`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionsPayload {
    pub upload_total: u64,
    pub download_total: u64,
    /// The engine sends `null` instead of `[]` when nothing is open.
    pub connections: Option<Vec<RawConnection>>,
}

/// A connection exactly as the engine reports it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConnection {
    pub id: String,
    pub metadata: RawMetadata,
    pub upload: u64,
    pub download: u64,
    pub start: String,
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawMetadata {
    pub network: String,
    #[serde(rename = "type")]
    pub conn_type: String,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    #[serde(rename = "sourcePort")]
    pub source_port: Value,
    #[serde(rename = "destinationIP")]
    pub destination_ip: String,
    #[serde(rename = "destinationPort")]
    pub destination_port: Value,
    pub host: String,
}

/// Ports arrive as strings from some engine builds and as numbers from others.
fn port_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn join_addr(ip: &str, port: &Value) -> String {
    let port = port_text(port);
    if port.is_empty() {
        ip.to_string()
    } else {
        format!("{}:{}", ip, port)
    }
}

impl From<RawConnection> for ConnectionInfo {
    fn from(raw: RawConnection) -> Self {
        let matched_rule = if raw.rule_payload.is_empty() {
            raw.rule
        } else {
            format!("{}({})", raw.rule, raw.rule_payload)
        };
        ConnectionInfo {
            source: join_addr(&raw.metadata.source_ip, &raw.metadata.source_port),
            destination: join_addr(&raw.metadata.destination_ip, &raw.metadata.destination_port),
            id: raw.id,
            network: raw.metadata.network,
            conn_type: raw.metadata.conn_type,
            host: raw.metadata.host,
            matched_rule,
            chains: raw.chains,
            upload_bytes: raw.upload,
            download_bytes: raw.download,
            started_at: raw.start,
        }
    }
}

/// Client bound to one engine instance.
pub struct ControlApi {
    client: ApiClient,
}

impl ControlApi {
    /// Builds a client for the host, port and secret in `engine`.
    pub fn new(engine: &EngineConfig) -> ControlResult<Self> {
        let options = ApiClientOptions {
            max_retries: 0,
            timeout: Some(REQUEST_TIMEOUT),
            ..Default::default()
        };
        let client = ApiClient::with_options(&engine.control_api_base(), engine.control_api_secret.clone(), options)
            .map_err(ControlError::network)?;
        Ok(Self { client })
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url().as_str()
    }

    /// True when the API answers `200`. Transport errors count as not ready.
    pub async fn is_ready(&self) -> bool {
        matches!(self.client.send_status::<()>(Method::GET, "", None).await, Ok(200))
    }

    /// Fetches totals and live connections in one call.
    pub async fn connections(&self) -> ControlResult<ConnectionsPayload> {
        let res = self
            .client
            .request::<ConnectionsPayload, ()>(Method::GET, "connections", None, None)
            .await
            .map_err(ControlError::network)?;
        if !res.success {
            return Err(ControlError::Network(format!("control API answered {}", res.status)));
        }
        Ok(res.data.unwrap_or_default())
    }

    /// Closes one connection. `Ok(false)` when the engine refused.
    pub async fn close_connection(&self, id: &str) -> ControlResult<bool> {
        let status = self
            .client
            .send_status::<()>(Method::DELETE, &format!("connections/{}", id), None)
            .await
            .map_err(ControlError::network)?;
        Ok(accepted(status))
    }

    pub async fn close_all_connections(&self) -> ControlResult<bool> {
        let status = self
            .client
            .send_status::<()>(Method::DELETE, "connections", None)
            .await
            .map_err(ControlError::network)?;
        Ok(accepted(status))
    }

    /// Selects outbound `name` in selector group `group`.
    pub async fn select_proxy(&self, group: &str, name: &str) -> ControlResult<bool> {
        let status = self
            .client
            .send_status(Method::PUT, &format!("proxies/{}", group), Some(json!({ "name": name })))
            .await
            .map_err(ControlError::network)?;
        Ok(accepted(status))
    }

    pub async fn set_mode(&self, mode: ProxyMode) -> ControlResult<bool> {
        let status = self
            .client
            .send_status(Method::PATCH, "configs", Some(json!({ "mode": mode.as_str() })))
            .await
            .map_err(ControlError::network)?;
        Ok(accepted(status))
    }
}

fn accepted(status: u16) -> bool {
    status == 200 || status == 204
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_raw_connection() {
        let raw: RawConnection = serde_json::from_value(json!({
            "id": "c1",
            "metadata": {
                "network": "tcp",
                "type": "HTTP",
                "sourceIP": "127.0.0.1",
                "sourcePort": "50000",
                "destinationIP": "1.1.1.1",
                "destinationPort": 443,
                "host": "one.one.one.one"
            },
            "upload": 10,
            "download": 20,
            "start": "2024-01-01T00:00:00Z",
            "chains": ["proxy", "GLOBAL"],
            "rule": "DomainSuffix",
            "rulePayload": "one.one"
        }))
        .unwrap();

        let info = ConnectionInfo::from(raw);
        assert_eq!(info.source, "127.0.0.1:50000");
        assert_eq!(info.destination, "1.1.1.1:443");
        assert_eq!(info.matched_rule, "DomainSuffix(one.one)");
        assert_eq!(info.chains, vec!["proxy", "GLOBAL"]);
        assert_eq!(info.download_bytes, 20);
    }

    #[test]
    fn null_connection_list_is_accepted() {
        let payload: ConnectionsPayload =
            serde_json::from_str(r#"{"uploadTotal":5,"downloadTotal":7,"connections":null}"#).unwrap();
        assert_eq!(payload.upload_total, 5);
        assert!(payload.connections.is_none());
    }

    #[test]
    fn rule_without_payload_is_kept_verbatim() {
        let raw = RawConnection {
            rule: "final".into(),
            ..Default::default()
        };
        assert_eq!(ConnectionInfo::from(raw).matched_rule, "final");
    }
}
