//! # Engine Core
//!
//! Local control plane for an external proxy engine (sing-box compatible):
//! process supervision, versioned binary installs, telemetry polling and
//! host system-proxy coordination, composed by the `Orchestrator`.

#![forbid(unsafe_code)]

pub mod config;
pub mod control_api;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod supervisor;
pub mod sysproxy;
pub mod telemetry;
pub mod types;
pub mod versions;

pub use config::{InstallConfig, OrchestratorConfig, PollerSettings, SupervisorSettings};
pub use error::{ControlError, ControlResult};
pub use events::{ControlEvent, InstallEvent, OutputStream, ServiceEvent, TelemetryEvent};
pub use orchestrator::{Orchestrator, OrchestratorStatus};
pub use supervisor::{StartOptions, StopOptions, Supervisor};
pub use sysproxy::store::{FileSettingsStore, MemorySettingsStore, SettingsStore};
pub use sysproxy::{ProxySettings, SystemProxyCoordinator};
pub use telemetry::{TelemetryPoller, TrafficMeter};
pub use types::*;
pub use versions::VersionManager;
