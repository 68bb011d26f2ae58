//! # System Proxy Coordinator
//!
//! Points the host's system proxy at the engine's local inbound, and back.
//! All host interaction goes through a `SettingsStore`.

pub mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use store::{SettingsStore, KEY_PROXY_ENABLE, KEY_PROXY_OVERRIDE, KEY_PROXY_SERVER};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7890;

/// Hosts that never go through the proxy unless configured otherwise.
pub fn default_bypass_list() -> Vec<String> {
    ["localhost", "127.*", "10.*", "172.16-31.*", "192.168.*", "<local>"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Host proxy settings as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    pub enabled: bool,
    pub server_host: String,
    pub server_port: u16,
    pub bypass_list: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server_host: DEFAULT_HOST.to_string(),
            server_port: DEFAULT_PORT,
            bypass_list: default_bypass_list(),
        }
    }
}

pub struct SystemProxyCoordinator {
    store: Arc<dyn SettingsStore>,
    bypass_list: Vec<String>,
}

impl SystemProxyCoordinator {
    pub fn new(store: Arc<dyn SettingsStore>, bypass_list: Vec<String>) -> Self {
        Self { store, bypass_list }
    }

    /// Enables the system proxy for `host:port`.
    ///
    /// Writes the enable flag, the server and the bypass list in that order.
    /// The change notification afterwards is best effort.
    pub fn enable(&self, host: &str, port: u16) -> ControlResult<()> {
        let server = format!("{}:{}", host, port);
        let bypass = self.bypass_list.join(";");
        self.write(KEY_PROXY_ENABLE, "1")?;
        self.write(KEY_PROXY_SERVER, &server)?;
        self.write(KEY_PROXY_OVERRIDE, &bypass)?;
        self.notify();
        log::info!("System proxy enabled ({})", server);
        Ok(())
    }

    /// Disables the system proxy. The server entry is removed if present.
    pub fn disable(&self) -> ControlResult<()> {
        self.write(KEY_PROXY_ENABLE, "0")?;
        if let Err(e) = self.store.delete(KEY_PROXY_SERVER) {
            log::debug!("Could not remove proxy server setting: {:#}", e);
        }
        self.notify();
        log::info!("System proxy disabled");
        Ok(())
    }

    /// Reads the current settings. Unreadable settings report the defaults,
    /// disabled.
    pub fn status(&self) -> ProxySettings {
        match self.read() {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Could not read proxy settings: {:#}", e);
                ProxySettings::default()
            }
        }
    }

    fn read(&self) -> anyhow::Result<ProxySettings> {
        let enabled = self.store.get(KEY_PROXY_ENABLE)?.is_some_and(|v| v.trim() == "1");
        let (server_host, server_port) = self
            .store
            .get(KEY_PROXY_SERVER)?
            .as_deref()
            .and_then(parse_server)
            .unwrap_or_else(|| (DEFAULT_HOST.to_string(), DEFAULT_PORT));
        let bypass_list = match self.store.get(KEY_PROXY_OVERRIDE)? {
            Some(list) if !list.trim().is_empty() => list
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => default_bypass_list(),
        };
        Ok(ProxySettings {
            enabled,
            server_host,
            server_port,
            bypass_list,
        })
    }

    fn write(&self, key: &str, value: &str) -> ControlResult<()> {
        self.store
            .set(key, value)
            .map_err(|e| ControlError::Settings(format!("{}: {:#}", key, e)))
    }

    fn notify(&self) {
        if let Err(e) = self.store.notify_changed() {
            log::warn!("Proxy settings change notification failed: {:#}", e);
        }
    }
}

/// Splits `host:port`, taking the last colon so bracketed IPv6 hosts survive.
fn parse_server(server: &str) -> Option<(String, u16)> {
    let (host, port) = server.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}
