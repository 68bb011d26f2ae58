use clap::Args;
use engine_core::{EngineConfig, InstallConfig, OrchestratorConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "engine_daemon";

#[derive(Args, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    #[arg(long, env = "ENGINE_DAEMON_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "ENGINE_DAEMON_DATA_DIR", help = "Root directory for binaries, cache and engine config.")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "ENGINE_DAEMON_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "ENGINE_DAEMON_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "ENGINE_PRODUCT", help = "Engine product name, used for binary and asset names.")]
    pub product: Option<String>,

    #[arg(long, env = "ENGINE_RELEASE_FEED_URL", help = "Base URL of the GitHub-style release feed.")]
    pub release_feed_url: Option<String>,

    #[arg(long, env = "ENGINE_CONTROL_API_PORT", help = "Port of the engine's local control API.")]
    pub control_api_port: Option<u16>,

    #[arg(long, env = "ENGINE_CONTROL_API_SECRET", help = "Bearer secret for the engine's control API.")]
    pub control_api_secret: Option<String>,

    #[arg(long, env = "ENGINE_PROXY_HOST", help = "Host of the engine's local proxy inbound.")]
    pub proxy_host: Option<String>,

    #[arg(long, env = "ENGINE_PROXY_PORT", help = "Port of the engine's local proxy inbound.")]
    pub proxy_port: Option<u16>,

    #[arg(long, env = "ENGINE_AUTO_SYSTEM_PROXY", help = "Point the system proxy at the engine while it runs (true/false).")]
    pub auto_system_proxy: Option<bool>,
}

impl DaemonConfig {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: DaemonConfig) -> DaemonConfig {
        DaemonConfig {
            config_path: other.config_path.or(self.config_path),
            data_dir: other.data_dir.or(self.data_dir),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            product: other.product.or(self.product),
            release_feed_url: other.release_feed_url.or(self.release_feed_url),
            control_api_port: other.control_api_port.or(self.control_api_port),
            control_api_secret: other.control_api_secret.or(self.control_api_secret),
            proxy_host: other.proxy_host.or(self.proxy_host),
            proxy_port: other.proxy_port.or(self.proxy_port),
            auto_system_proxy: other.auto_system_proxy.or(self.auto_system_proxy),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.data_dir().join("logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// JSON file backing the system proxy settings store.
    pub fn proxy_settings_path(&self) -> PathBuf {
        self.data_dir().join("system_proxy.json")
    }

    /// Builds the component configuration rooted at `data_dir`.
    ///
    /// The engine executable is left at its default; the caller points it at
    /// the channel binary once the version manager exists.
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        let data_dir = self.data_dir();
        let core_dir = data_dir.join("core");
        let defaults = OrchestratorConfig::default();

        let mut install = InstallConfig {
            install_dir: core_dir.clone(),
            cache_dir: data_dir.join("cache"),
            runtime_cache_db: Some(core_dir.join("cache.db")),
            ..InstallConfig::default()
        };
        if let Some(product) = &self.product {
            install.product = product.clone();
        }
        if let Some(url) = &self.release_feed_url {
            install.release_feed_url = url.clone();
        }

        let mut engine = EngineConfig {
            config_directory: data_dir.join("config"),
            working_directory: core_dir,
            control_api_secret: self.control_api_secret.clone(),
            ..EngineConfig::default()
        };
        if let Some(port) = self.control_api_port {
            engine.control_api_port = port;
        }

        OrchestratorConfig {
            engine,
            install,
            auto_system_proxy: self.auto_system_proxy.unwrap_or(true),
            proxy_host: self.proxy_host.clone().unwrap_or(defaults.proxy_host.clone()),
            proxy_port: self.proxy_port.unwrap_or(defaults.proxy_port),
            ..defaults
        }
    }
}

fn default_data_dir() -> PathBuf {
    match dirs::data_local_dir() {
        Some(dir) => dir.join(APP_DIR),
        None => {
            log::warn!("Could not determine local data directory. Using ./{}", APP_DIR);
            PathBuf::from(APP_DIR)
        }
    }
}

fn default_config_file() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join("daemon.json"))
        .unwrap_or_else(|| PathBuf::from("daemon.json"))
}

fn read_config_file(path: &Path) -> Option<DaemonConfig> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<DaemonConfig>(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers built-in defaults, then the JSON config file, then `cli`
/// (which already carries environment variables).
pub fn load_config(cli: DaemonConfig) -> DaemonConfig {
    // 1. Defaults
    let defaults = DaemonConfig {
        log_level: Some("info".to_string()),
        auto_system_proxy: Some(true),
        ..Default::default()
    };

    // 2. Config file, whose location the CLI may override
    let file_path = cli.config_path.clone().unwrap_or_else(default_config_file);
    let mut config = defaults;
    if let Some(file_config) = read_config_file(&file_path) {
        config = config.merge(file_config);
    }

    // 3. Environment and CLI
    config.merge(cli)
}
