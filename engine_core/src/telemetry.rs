//! # Telemetry Poller
//!
//! A self-scheduling poller for the engine's control API, which only offers
//! cumulative counters over REST. Each tick fetches `GET /connections` once and
//! derives both the traffic snapshot and the live connection list from it.
//!
//! ## Key Design Principles:
//! - **Deltas, not totals**: speeds are the difference between two consecutive
//!   cumulative samples. The first sample after a (re)start has no baseline and
//!   reports zero speed. A counter that goes backwards (engine restarted under
//!   us) clamps to zero instead of underflowing.
//! - **Quiet failures**: a failed poll is skipped. The engine is routinely
//!   unreachable for a moment around restarts and the next tick will catch up.
//! - **Externally driven**: the orchestrator starts the poller when the engine
//!   reaches Running and stops it when the engine leaves it.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PollerSettings;
use crate::control_api::ControlApi;
use crate::error::ControlResult;
use crate::events::{TelemetryEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::{ConnectionInfo, TrafficSnapshot};

/// # Traffic Meter
///
/// Turns cumulative upload/download counters into per-interval speeds.
#[derive(Debug, Clone, Default)]
pub struct TrafficMeter {
    /// `(upload_total, download_total)` of the previous sample.
    baseline: Option<(u64, u64)>,
}

impl TrafficMeter {
    /// Creates a meter with no baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample and returns the snapshot for it.
    pub fn sample(&mut self, upload_total: u64, download_total: u64, connection_count: usize) -> TrafficSnapshot {
        let (upload_speed, download_speed) = match self.baseline {
            Some((up, down)) => (upload_total.saturating_sub(up), download_total.saturating_sub(down)),
            None => (0, 0),
        };
        self.baseline = Some((upload_total, download_total));
        TrafficSnapshot {
            upload_speed,
            download_speed,
            upload_total,
            download_total,
            connection_count,
        }
    }

    /// Forgets the baseline so the next sample reports zero speed.
    pub fn reset(&mut self) {
        self.baseline = None;
    }
}

struct PollerInner {
    api: RwLock<Arc<ControlApi>>,
    settings: PollerSettings,
    meter: Mutex<TrafficMeter>,
    last_snapshot: Mutex<Option<TrafficSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<TelemetryEvent>,
}

/// # Telemetry Poller
///
/// Cheap to clone; clones drive the same background task.
#[derive(Clone)]
pub struct TelemetryPoller {
    inner: Arc<PollerInner>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl TelemetryPoller {
    /// Creates a stopped poller talking to `api`.
    pub fn new(api: Arc<ControlApi>, settings: PollerSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PollerInner {
                api: RwLock::new(api),
                settings,
                meter: Mutex::new(TrafficMeter::new()),
                last_snapshot: Mutex::new(None),
                task: Mutex::new(None),
                events,
            }),
        }
    }

    /// Points the poller at a different control API (new port or secret).
    pub fn set_api(&self, api: Arc<ControlApi>) {
        *self.inner.api.write().unwrap_or_else(|e| e.into_inner()) = api;
    }

    /// Receives traffic snapshots and connection lists.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.inner.events.subscribe()
    }

    /// Starts polling from a fresh baseline. No-op when already running.
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        guard(&self.inner.meter).reset();
        self.spawn_loop();
    }

    /// Suspends polling, keeping the baseline and the last snapshot.
    pub fn pause(&self) {
        if let Some(task) = guard(&self.inner.task).take() {
            task.abort();
            log::debug!("Telemetry poller paused");
        }
    }

    /// Resumes after `pause`, continuing from the retained baseline.
    pub fn resume(&self) {
        if !self.is_running() {
            self.spawn_loop();
        }
    }

    /// Stops polling and clears all counters.
    pub fn stop(&self) {
        if let Some(task) = guard(&self.inner.task).take() {
            task.abort();
            log::debug!("Telemetry poller stopped");
        }
        guard(&self.inner.meter).reset();
        *guard(&self.inner.last_snapshot) = None;
    }

    /// True while the background task is alive.
    pub fn is_running(&self) -> bool {
        guard(&self.inner.task).as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Most recent snapshot, if any poll has succeeded since the last stop.
    pub fn last_snapshot(&self) -> Option<TrafficSnapshot> {
        *guard(&self.inner.last_snapshot)
    }

    /// # Poll Once
    ///
    /// Performs a single poll cycle and publishes its results.
    ///
    /// ## Workflow:
    /// 1. Fetch totals and connections in one request.
    /// 2. Feed the totals through the meter to obtain speeds.
    /// 3. Publish `Traffic`, then `Connections`.
    pub async fn poll_once(&self) -> ControlResult<TrafficSnapshot> {
        self.inner.poll_once().await
    }

    /// Closes one connection. `false` on refusal or network failure.
    pub async fn close_connection(&self, id: &str) -> bool {
        match self.inner.api().close_connection(id).await {
            Ok(closed) => closed,
            Err(e) => {
                log::warn!("Closing connection {} failed: {}", id, e);
                false
            }
        }
    }

    /// Closes every connection. `false` on refusal or network failure.
    pub async fn close_all_connections(&self) -> bool {
        match self.inner.api().close_all_connections().await {
            Ok(closed) => closed,
            Err(e) => {
                log::warn!("Closing all connections failed: {}", e);
                false
            }
        }
    }

    fn spawn_loop(&self) {
        // The task must not keep the poller alive on its own.
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = inner.poll_once().await {
                    log::debug!("Telemetry poll skipped: {}", e);
                }
            }
        });
        if let Some(previous) = guard(&self.inner.task).replace(task) {
            previous.abort();
        }
        log::debug!("Telemetry poller started ({:?} interval)", period);
    }
}

impl PollerInner {
    fn api(&self) -> Arc<ControlApi> {
        Arc::clone(&self.api.read().unwrap_or_else(|e| e.into_inner()))
    }

    async fn poll_once(&self) -> ControlResult<TrafficSnapshot> {
        // --- Phase 1: Fetch ---
        let payload = self.api().connections().await?;

        // --- Phase 2: Derive ---
        let connections: Vec<ConnectionInfo> = payload
            .connections
            .unwrap_or_default()
            .into_iter()
            .map(ConnectionInfo::from)
            .collect();
        let snapshot = guard(&self.meter).sample(payload.upload_total, payload.download_total, connections.len());
        *guard(&self.last_snapshot) = Some(snapshot);

        // --- Phase 3: Publish ---
        let _ = self.events.send(TelemetryEvent::Traffic(snapshot));
        let _ = self.events.send(TelemetryEvent::Connections(connections));
        Ok(snapshot)
    }
}
