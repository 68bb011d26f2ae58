//! # Component Settings
//!
//! Tunables for each component. Defaults carry the production constants; tests
//! shrink the delays so that whole lifecycles run in well under a second.

use std::path::PathBuf;
use std::time::Duration;

use lib_common::utils::misc::sys_info::platform_tag;
use serde::{Deserialize, Serialize};

use crate::sysproxy::default_bypass_list;
use crate::types::EngineConfig;

/// Supervisor timings and crash-recovery budget.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Pause between readiness probe attempts.
    pub probe_interval: Duration,
    /// Give up on readiness after this long.
    pub probe_timeout: Duration,
    /// Default deadline for a graceful stop before the process is killed.
    pub stop_timeout: Duration,
    /// Pause between the stop and start halves of a restart.
    pub restart_pause: Duration,
    /// Settle time after sweeping stray engine processes.
    pub sweep_settle: Duration,
    /// Whether `start` sweeps same-named stray processes first.
    pub sweep_strays: bool,
    /// Crash restarts allowed before giving up.
    pub max_retries: u32,
    /// Restart delay is `retry_base_delay * attempt`.
    pub retry_base_delay: Duration,
    /// Output substrings that mark a fatal startup error.
    pub fatal_markers: Vec<String>,
    /// File name of the engine's cache database inside the working directory.
    pub cache_db_name: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(3000),
            stop_timeout: Duration::from_millis(5000),
            restart_pause: Duration::from_millis(1000),
            sweep_settle: Duration::from_millis(500),
            sweep_strays: true,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(2000),
            fatal_markers: vec!["FATAL".to_string(), "panic:".to_string()],
            cache_db_name: "cache.db".to_string(),
        }
    }
}

/// Telemetry polling cadence.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
        }
    }
}

/// Where engine binaries live and where releases come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallConfig {
    /// Directory holding one binary (plus `.bak`) per channel.
    pub install_dir: PathBuf,
    /// Download cache for release archives and extraction scratch space.
    pub cache_dir: PathBuf,
    /// Product name: binary stem and asset name prefix.
    pub product: String,
    /// Release feed base, e.g. `https://api.github.com/repos/SagerNet/sing-box/`.
    pub release_feed_url: String,
    /// Asset platform tag, e.g. `linux-amd64`.
    pub platform: String,
    /// Runtime cache database removed by `clear_cache`, if any.
    pub runtime_cache_db: Option<PathBuf>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        let install_dir = PathBuf::from("core");
        Self {
            runtime_cache_db: Some(PathBuf::from("cache.db")),
            cache_dir: PathBuf::from("cache"),
            install_dir,
            product: "sing-box".to_string(),
            release_feed_url: "https://api.github.com/repos/SagerNet/sing-box/".to_string(),
            platform: platform_tag().unwrap_or_else(|| "linux-amd64".to_string()),
        }
    }
}

/// Composition settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub engine: EngineConfig,
    pub install: InstallConfig,
    pub supervisor: SupervisorSettings,
    pub poller: PollerSettings,
    /// Toggle the host system proxy together with the engine lifecycle.
    pub auto_system_proxy: bool,
    /// Local inbound the system proxy points at.
    pub proxy_host: String,
    pub proxy_port: u16,
    pub bypass_list: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            install: InstallConfig::default(),
            supervisor: SupervisorSettings::default(),
            poller: PollerSettings::default(),
            auto_system_proxy: false,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 7890,
            bypass_list: default_bypass_list(),
        }
    }
}
