//! Notifications published by the components over `tokio::sync::broadcast`.
//!
//! Each event is sent while the state change that caused it is being applied,
//! so subscribers observe events in the same order the changes happened.

use std::time::Duration;

use serde::Serialize;

use crate::types::{ConnectionInfo, ServiceState, TrafficSnapshot};

/// Capacity of every broadcast channel in the crate.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which engine pipe a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServiceEvent {
    StateChanged { from: ServiceState, to: ServiceState },
    /// The engine passed its readiness probe.
    Started { pid: u32 },
    Stopped,
    /// The engine exited while Running without being asked to.
    UnexpectedExit { code: Option<i32> },
    RestartScheduled { attempt: u32, delay: Duration },
    Error { message: String },
    Log { stream: OutputStream, line: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum TelemetryEvent {
    Traffic(TrafficSnapshot),
    Connections(Vec<ConnectionInfo>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InstallEvent {
    Started { version: String },
    Progress { downloaded: u64, total: Option<u64> },
    Completed { version: String },
    Failed { message: String },
}

/// Everything the orchestrator re-publishes to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "event", rename_all = "camelCase")]
pub enum ControlEvent {
    Service(ServiceEvent),
    Telemetry(TelemetryEvent),
    Install(InstallEvent),
}
