//! # Orchestrator
//!
//! Composes the supervisor, telemetry poller, system-proxy coordinator and
//! version manager into one lifecycle.
//!
//! ## Wiring
//! - Engine reaches **Running**: enable the system proxy (auto mode) and
//!   start the poller.
//! - Engine lands in **Idle** or **Error**: stop the poller and disable the
//!   system proxy (auto mode, and not in the middle of a restart).
//! - Every supervisor, poller and install event is re-published unchanged
//!   as a `ControlEvent`, before its side effects run.
//!
//! ## Teardown order
//! `stop` and `cleanup` always stop the poller first, then the supervisor,
//! then touch the system proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::error::ControlResult;
use crate::events::{ControlEvent, ServiceEvent, EVENT_CHANNEL_CAPACITY};
use crate::supervisor::{StartOptions, StopOptions, Supervisor};
use crate::sysproxy::store::SettingsStore;
use crate::sysproxy::{ProxySettings, SystemProxyCoordinator};
use crate::telemetry::TelemetryPoller;
use crate::types::{EngineConfig, ProxyMode, ServiceState, ServiceStatus, TrafficSnapshot};
use crate::versions::VersionManager;

/// Deadline for the supervisor stop during `cleanup`.
const CLEANUP_STOP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Combined view returned by `Orchestrator::status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub service: ServiceStatus,
    pub system_proxy: ProxySettings,
    pub auto_system_proxy: bool,
    pub traffic: Option<TrafficSnapshot>,
}

/// State shared with the event forwarding tasks.
#[derive(Clone)]
struct Wiring {
    poller: TelemetryPoller,
    proxy: Arc<SystemProxyCoordinator>,
    auto_system_proxy: Arc<AtomicBool>,
    restarting: Arc<AtomicBool>,
    proxy_host: String,
    proxy_port: u16,
}

impl Wiring {
    fn on_state(&self, to: ServiceState) {
        match to {
            ServiceState::Running => {
                if self.auto_system_proxy.load(Ordering::SeqCst) {
                    if let Err(e) = self.proxy.enable(&self.proxy_host, self.proxy_port) {
                        log::error!("Could not enable system proxy: {}", e);
                    }
                }
                self.poller.start();
            }
            ServiceState::Idle | ServiceState::Error => {
                self.poller.stop();
                if self.auto_system_proxy.load(Ordering::SeqCst) && !self.restarting.load(Ordering::SeqCst) {
                    if let Err(e) = self.proxy.disable() {
                        log::error!("Could not disable system proxy: {}", e);
                    }
                }
            }
            ServiceState::Starting | ServiceState::Stopping => {}
        }
    }
}

pub struct Orchestrator {
    supervisor: Supervisor,
    versions: Arc<VersionManager>,
    wiring: Wiring,
    events: broadcast::Sender<ControlEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds all components. Nothing runs until `init`.
    pub fn new(config: OrchestratorConfig, store: Arc<dyn SettingsStore>) -> ControlResult<Self> {
        let supervisor = Supervisor::new(config.engine, config.supervisor)?;
        let poller = TelemetryPoller::new(supervisor.control_api(), config.poller);
        let versions = Arc::new(VersionManager::new(config.install)?);
        let proxy = Arc::new(SystemProxyCoordinator::new(store, config.bypass_list));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            supervisor,
            versions,
            wiring: Wiring {
                poller,
                proxy,
                auto_system_proxy: Arc::new(AtomicBool::new(config.auto_system_proxy)),
                restarting: Arc::new(AtomicBool::new(false)),
                proxy_host: config.proxy_host,
                proxy_port: config.proxy_port,
            },
            events,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the event forwarding tasks. Calling it again is a no-op.
    pub fn init(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return;
        }

        let mut service_rx = self.supervisor.subscribe();
        let events = self.events.clone();
        let wiring = self.wiring.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match service_rx.recv().await {
                    Ok(event) => {
                        let transition = match &event {
                            ServiceEvent::StateChanged { to, .. } => Some(*to),
                            _ => None,
                        };
                        let _ = events.send(ControlEvent::Service(event));
                        if let Some(to) = transition {
                            wiring.on_state(to);
                        }
                    }
                    Err(RecvError::Lagged(n)) => log::warn!("Orchestrator missed {} service events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let mut telemetry_rx = self.wiring.poller.subscribe();
        let events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match telemetry_rx.recv().await {
                    Ok(event) => {
                        let _ = events.send(ControlEvent::Telemetry(event));
                    }
                    Err(RecvError::Lagged(n)) => log::debug!("Orchestrator missed {} telemetry events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let mut install_rx = self.versions.subscribe();
        let events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match install_rx.recv().await {
                    Ok(event) => {
                        let _ = events.send(ControlEvent::Install(event));
                    }
                    Err(RecvError::Lagged(n)) => log::debug!("Orchestrator missed {} install events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        log::debug!("Orchestrator wiring started");
    }

    /// Everything the components publish, re-published in one stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn poller(&self) -> &TelemetryPoller {
        &self.wiring.poller
    }

    pub fn versions(&self) -> &Arc<VersionManager> {
        &self.versions
    }

    pub fn system_proxy(&self) -> &SystemProxyCoordinator {
        &self.wiring.proxy
    }

    /// Starts the engine. The proxy and poller follow via the wiring.
    pub async fn start(&self, options: StartOptions) -> ControlResult<ServiceStatus> {
        self.supervisor.start(options).await
    }

    /// Stops the poller, then the engine, then optionally the system proxy.
    pub async fn stop(&self, disable_proxy: bool) -> ControlResult<()> {
        self.wiring.poller.stop();
        self.supervisor.stop(StopOptions::default()).await?;
        if disable_proxy {
            self.wiring.proxy.disable()?;
        }
        Ok(())
    }

    /// Restarts the engine while leaving the system proxy in place. If the
    /// new engine does not come up, the proxy is disabled.
    pub async fn restart(&self, options: Option<StartOptions>) -> ControlResult<ServiceStatus> {
        self.wiring.restarting.store(true, Ordering::SeqCst);
        let result = self.supervisor.restart(options).await;
        self.wiring.restarting.store(false, Ordering::SeqCst);

        if result.is_err() && self.wiring.auto_system_proxy.load(Ordering::SeqCst) {
            if let Err(e) = self.wiring.proxy.disable() {
                log::error!("Could not disable system proxy after failed restart: {}", e);
            }
        }
        result
    }

    /// Best-effort teardown for process exit. Never fails.
    pub async fn cleanup(&self) {
        // --- Phase 1: telemetry ---
        self.wiring.poller.stop();

        // --- Phase 2: engine ---
        let stop = StopOptions {
            timeout: Some(CLEANUP_STOP_TIMEOUT),
        };
        if let Err(e) = self.supervisor.stop(stop).await {
            log::warn!("Cleanup: engine stop failed: {}", e);
        }

        // --- Phase 3: host proxy ---
        if let Err(e) = self.wiring.proxy.disable() {
            log::warn!("Cleanup: system proxy disable failed: {}", e);
        }

        // --- Phase 4: leftovers ---
        self.supervisor.sweep_strays().await;
        log::info!("Cleanup finished");
    }

    /// `cleanup` plus shutting down the forwarding tasks.
    pub async fn shutdown(&self) {
        self.cleanup().await;
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            service: self.supervisor.status(),
            system_proxy: self.wiring.proxy.status(),
            auto_system_proxy: self.wiring.auto_system_proxy.load(Ordering::SeqCst),
            traffic: self.wiring.poller.last_snapshot(),
        }
    }

    /// Turns auto mode on or off, applying it to the current state at once.
    pub fn set_auto_system_proxy(&self, enabled: bool) -> ControlResult<()> {
        self.wiring.auto_system_proxy.store(enabled, Ordering::SeqCst);
        let running = self.supervisor.state() == ServiceState::Running;
        match (enabled, running) {
            (true, true) => self.wiring.proxy.enable(&self.wiring.proxy_host, self.wiring.proxy_port),
            (false, _) => self.wiring.proxy.disable(),
            (true, false) => Ok(()),
        }
    }

    pub async fn set_proxy_mode(&self, mode: ProxyMode) -> ControlResult<()> {
        self.supervisor.set_proxy_mode(mode).await
    }

    /// Selects outbound `name` in selector `group`.
    pub async fn select_proxy(&self, group: &str, name: &str) -> ControlResult<bool> {
        self.supervisor.control_api().select_proxy(group, name).await
    }

    pub async fn close_connection(&self, id: &str) -> bool {
        self.wiring.poller.close_connection(id).await
    }

    pub async fn close_all_connections(&self) -> bool {
        self.wiring.poller.close_all_connections().await
    }

    /// Replaces the engine config and repoints the poller. Takes effect on
    /// the next start.
    pub fn update_engine_config(&self, engine: EngineConfig) -> ControlResult<()> {
        self.supervisor.update_engine_config(engine)?;
        self.wiring.poller.set_api(self.supervisor.control_api());
        Ok(())
    }
}
