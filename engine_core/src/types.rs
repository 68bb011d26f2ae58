//! Data model shared by the supervisor, version manager, telemetry poller and
//! orchestrator.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the supervised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No process, nothing in flight.
    #[default]
    Idle,
    /// A process is being launched or a crash restart is scheduled.
    Starting,
    /// The process answered the readiness probe.
    Running,
    /// A stop was requested and the process has not exited yet.
    Stopping,
    /// Start failed or the crash budget was exhausted.
    Error,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Idle => "idle",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Error => "error",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound routing mode forwarded to the engine. Changing it never restarts
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Rule,
    Global,
    Direct,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Rule => "rule",
            ProxyMode::Global => "global",
            ProxyMode::Direct => "direct",
        }
    }
}

/// Read-only snapshot of the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub process_id: Option<u32>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub active_config_path: Option<PathBuf>,
    pub proxy_mode: ProxyMode,
}

/// Everything needed to spawn the engine. Replacing it only affects the next start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub executable_path: PathBuf,
    pub config_directory: PathBuf,
    pub working_directory: PathBuf,
    pub control_api_host: String,
    pub control_api_port: u16,
    pub control_api_secret: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable_path: PathBuf::from(lib_common::utils::misc::sys_info::executable_name("sing-box")),
            config_directory: PathBuf::from("."),
            working_directory: PathBuf::from("."),
            control_api_host: "127.0.0.1".to_string(),
            control_api_port: 9090,
            control_api_secret: None,
        }
    }
}

impl EngineConfig {
    /// Base URL of the engine's control API, with trailing slash.
    pub fn control_api_base(&self) -> String {
        format!("http://{}:{}/", self.control_api_host, self.control_api_port)
    }

    /// Where the generated engine config lives unless a start overrides it.
    pub fn default_config_path(&self) -> PathBuf {
        self.config_directory.join("config.json")
    }

    /// File name of the engine executable, used for stray-process sweeps.
    pub fn process_name(&self) -> Option<String> {
        self.executable_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Installation track of the engine binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Alpha,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stable => "stable",
            Channel::Alpha => "alpha",
        }
    }
}

/// Version reported by an installed binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelVersion {
    pub version: String,
    pub raw_version_output: String,
    pub channel: Channel,
}

/// A downloadable release for the current platform. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRelease {
    pub version: String,
    pub tag: String,
    pub published_at: Option<String>,
    pub is_prerelease: bool,
    pub download_url: String,
    pub asset_name: String,
}

/// One telemetry sample. Totals are the engine's cumulative counters, speeds
/// are per-interval deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    pub upload_speed: u64,
    pub download_speed: u64,
    pub upload_total: u64,
    pub download_total: u64,
    pub connection_count: usize,
}

/// A live connection as reported by the control API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub network: String,
    #[serde(rename = "type")]
    pub conn_type: String,
    pub source: String,
    pub destination: String,
    pub host: String,
    pub matched_rule: String,
    pub chains: Vec<String>,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub started_at: String,
}
