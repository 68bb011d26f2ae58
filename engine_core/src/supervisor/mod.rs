//! # Engine Supervisor
//!
//! Owns the lifecycle of a single engine process and drives the
//! Idle / Starting / Running / Stopping / Error state machine.
//!
//! ## Workflow
//! 1. **Start:** sweep stray engines, validate the executable and config,
//!    spawn `<exe> run -c <config>` and probe the control API until it answers.
//! 2. **Run:** stream engine output into the log and the event channel.
//! 3. **Crash:** an exit while Running is restarted with linear backoff until
//!    the retry budget is spent, then the supervisor parks in Error.
//! 4. **Stop:** SIGTERM, wait, kill after the deadline, sweep leftovers.
//!
//! All state lives behind one mutex that is never held across an await. Each
//! spawned process gets a generation number so that exit notifications from a
//! process that has already been replaced are ignored.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

mod policy;
mod process;

pub use policy::{crash_policy, CrashDecision};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use lib_common::utils::misc::sys_info::sweep_processes_by_name;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::SupervisorSettings;
use crate::control_api::ControlApi;
use crate::error::{ControlError, ControlResult};
use crate::events::{OutputStream, ServiceEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::{EngineConfig, ProxyMode, ServiceState, ServiceStatus};
use process::{ProcessHandle, ProcessSignal};

/// How long a killed process gets to disappear before the sweep.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Parameters of one start. Remembered for crash restarts and `restart`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Config file to run. Defaults to `config.json` in the config directory.
    pub config_path: Option<PathBuf>,
    /// When set, written to the config path before launching.
    pub config_content: Option<String>,
    /// Delete the engine's cache database before launching.
    pub clear_cache_db: bool,
}

/// Parameters of one stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Graceful-exit deadline. Defaults to the configured stop timeout.
    pub timeout: Option<Duration>,
}

struct Shared {
    status: ServiceStatus,
    retry_count: u32,
    last_options: Option<StartOptions>,
    process: Option<ProcessHandle>,
    generation: u64,
    /// Bumped by every start, stop and crash restart. A launch only spawns
    /// while the id it claimed is still current.
    launch_id: u64,
    next_token: u64,
    /// Token of the crash restart that is currently waiting out its delay.
    pending_restart: Option<u64>,
}

struct Inner {
    engine: RwLock<EngineConfig>,
    api: RwLock<Arc<ControlApi>>,
    settings: SupervisorSettings,
    shared: Mutex<Shared>,
    events: broadcast::Sender<ServiceEvent>,
}

/// Handle to the supervisor. Clones share the same engine.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Creates an idle supervisor.
    pub fn new(engine: EngineConfig, settings: SupervisorSettings) -> ControlResult<Self> {
        let api = ControlApi::new(&engine)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                engine: RwLock::new(engine),
                api: RwLock::new(Arc::new(api)),
                settings,
                shared: Mutex::new(Shared {
                    status: ServiceStatus::default(),
                    retry_count: 0,
                    last_options: None,
                    process: None,
                    generation: 0,
                    launch_id: 0,
                    next_token: 0,
                    pending_restart: None,
                }),
                events,
            }),
        })
    }

    /// Receives every state change, output line and lifecycle event.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Launches the engine and waits until it is ready.
    ///
    /// Returns the Running status. Calling it while Running is a no-op that
    /// returns the current status; calling it while a start or stop is in
    /// flight fails with `AlreadyInProgress`.
    pub async fn start(&self, options: StartOptions) -> ControlResult<ServiceStatus> {
        let launch = {
            let mut shared = self.inner.lock();
            match shared.status.state {
                ServiceState::Starting => return Err(ControlError::AlreadyInProgress("start")),
                ServiceState::Stopping => return Err(ControlError::AlreadyInProgress("stop")),
                ServiceState::Running => return Ok(shared.status.clone()),
                ServiceState::Idle | ServiceState::Error => {}
            }
            shared.pending_restart = None;
            shared.status.last_error = None;
            self.inner.transition(&mut shared, ServiceState::Starting);
            claim_launch(&mut shared)
        };
        self.inner.launch(options, launch).await
    }

    /// Stops the engine, escalating to a kill after the deadline.
    ///
    /// Succeeds immediately when nothing is running. Any pending crash
    /// restart is cancelled.
    pub async fn stop(&self, options: StopOptions) -> ControlResult<()> {
        let timeout = options.timeout.unwrap_or(self.inner.settings.stop_timeout);

        let handle = {
            let mut shared = self.inner.lock();
            if shared.status.state == ServiceState::Stopping {
                return Err(ControlError::AlreadyInProgress("stop"));
            }
            shared.pending_restart = None;
            // Any launch still in flight must not spawn after this point.
            claim_launch(&mut shared);
            match shared.process.clone() {
                Some(handle) if !handle.has_exited() => {
                    self.inner.transition(&mut shared, ServiceState::Stopping);
                    handle
                }
                _ => {
                    self.inner.settle_idle(&mut shared);
                    return Ok(());
                }
            }
        };

        log::info!("Stopping engine (pid {:?})", handle.pid);
        handle.signal(ProcessSignal::Terminate);
        if handle.wait_exit(timeout).await.is_none() {
            log::warn!("Engine did not exit within {:?}, killing it", timeout);
            handle.signal(ProcessSignal::Kill);
            if handle.wait_exit(KILL_GRACE).await.is_none() {
                log::error!("Engine (pid {:?}) survived a kill", handle.pid);
            }
            self.inner.sweep_strays().await;
        }

        let mut shared = self.inner.lock();
        if shared.status.state == ServiceState::Stopping {
            self.inner.settle_idle(&mut shared);
        }
        Ok(())
    }

    /// Stop, pause, then start with `options` or the last used options.
    pub async fn restart(&self, options: Option<StartOptions>) -> ControlResult<ServiceStatus> {
        self.stop(StopOptions::default()).await?;
        tokio::time::sleep(self.inner.settings.restart_pause).await;
        let options = match options {
            Some(options) => options,
            None => self.inner.lock().last_options.clone().unwrap_or_default(),
        };
        self.start(options).await
    }

    /// Switches the routing mode without restarting the engine.
    ///
    /// While Running the mode is pushed to the control API; otherwise it is
    /// only recorded in the status.
    pub async fn set_proxy_mode(&self, mode: ProxyMode) -> ControlResult<()> {
        let running = {
            let mut shared = self.inner.lock();
            shared.status.proxy_mode = mode;
            shared.status.state == ServiceState::Running
        };
        if running {
            let api = self.control_api();
            if !api.set_mode(mode).await? {
                return Err(ControlError::Network(format!("engine rejected mode '{}'", mode.as_str())));
            }
        }
        log::info!("Proxy mode set to {}", mode.as_str());
        Ok(())
    }

    /// Replaces the engine configuration. Takes effect on the next start.
    pub fn update_engine_config(&self, engine: EngineConfig) -> ControlResult<()> {
        let api = ControlApi::new(&engine)?;
        *self.inner.engine.write().unwrap_or_else(|e| e.into_inner()) = engine;
        *self.inner.api.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(api);
        Ok(())
    }

    /// Engine configuration used by the next start.
    pub fn engine_config(&self) -> EngineConfig {
        self.inner.engine_config()
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> ServiceStatus {
        self.inner.lock().status.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.inner.lock().status.state
    }

    /// Client for the control API of the current engine config.
    pub fn control_api(&self) -> Arc<ControlApi> {
        self.inner.api()
    }

    /// Kills every process named like the engine executable. Best effort,
    /// and a no-op when sweeping is disabled in the settings.
    pub async fn sweep_strays(&self) {
        self.inner.sweep_strays().await;
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn engine_config(&self) -> EngineConfig {
        self.engine.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn api(&self) -> Arc<ControlApi> {
        Arc::clone(&self.api.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn emit(&self, event: ServiceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn transition(&self, shared: &mut Shared, to: ServiceState) {
        let from = shared.status.state;
        if from == to {
            return;
        }
        shared.status.state = to;
        log::debug!("Engine state {} -> {}", from, to);
        self.emit(ServiceEvent::StateChanged { from, to });
    }

    fn fail(&self, shared: &mut Shared, message: String) {
        log::error!("Engine error: {}", message);
        shared.status.last_error = Some(message.clone());
        self.transition(shared, ServiceState::Error);
        self.emit(ServiceEvent::Error { message });
    }

    /// Forgets the process and lands in Idle, announcing the stop once.
    fn settle_idle(&self, shared: &mut Shared) {
        shared.process = None;
        shared.status.process_id = None;
        shared.status.start_timestamp = None;
        if shared.status.state != ServiceState::Idle {
            self.transition(shared, ServiceState::Idle);
            self.emit(ServiceEvent::Stopped);
        }
    }

    /// Records a start failure, unless a stop or a newer start took over.
    fn fail_start(&self, launch: u64, err: ControlError) -> ControlError {
        let mut shared = self.lock();
        if shared.launch_id == launch && shared.status.state == ServiceState::Starting {
            self.fail(&mut shared, err.to_string());
        }
        err
    }

    async fn sweep_strays(&self) {
        if !self.settings.sweep_strays {
            return;
        }
        let Some(name) = self.engine_config().process_name() else {
            return;
        };
        match tokio::task::spawn_blocking(move || sweep_processes_by_name(&name)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("Stray engine sweep failed: {}", e),
            Err(e) => log::warn!("Stray engine sweep task failed: {}", e),
        }
    }

    /// Body of a start. The caller has already moved the state to Starting.
    async fn launch(self: &Arc<Self>, options: StartOptions, launch: u64) -> ControlResult<ServiceStatus> {
        let engine = self.engine_config();

        // --- Phase 1: clear leftovers from a previous run ---
        if self.settings.sweep_strays {
            self.sweep_strays().await;
            tokio::time::sleep(self.settings.sweep_settle).await;
        }
        {
            let shared = self.lock();
            if !claims_start(&shared, launch) {
                return Err(abandoned(&shared));
            }
        }

        // --- Phase 2: validate inputs ---
        if !engine.executable_path.is_file() {
            return Err(self.fail_start(launch, ControlError::NotFound("executable".to_string())));
        }
        let config_path = options
            .config_path
            .clone()
            .unwrap_or_else(|| engine.default_config_path());
        if let Some(content) = &options.config_content {
            if let Err(e) = write_config(&config_path, content).await {
                return Err(self.fail_start(launch, e));
            }
        }
        if !config_path.is_file() {
            return Err(self.fail_start(launch, ControlError::NotFound("config file".to_string())));
        }
        if options.clear_cache_db {
            let cache_db = engine.working_directory.join(&self.settings.cache_db_name);
            match tokio::fs::remove_file(&cache_db).await {
                Ok(()) => log::info!("Removed engine cache database {:?}", cache_db),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Could not remove {:?}: {}", cache_db, e),
            }
        }

        // --- Phase 3: spawn ---
        let generation = {
            let mut shared = self.lock();
            if !claims_start(&shared, launch) {
                return Err(abandoned(&shared));
            }
            let spawned = match process::spawn_engine(&engine.executable_path, &config_path, &engine.working_directory)
            {
                Ok(spawned) => spawned,
                Err(e) => {
                    let err = ControlError::ProcessCrash(format!("failed to spawn engine: {}", e));
                    self.fail(&mut shared, err.to_string());
                    return Err(err);
                }
            };
            shared.generation += 1;
            let generation = shared.generation;
            log::info!("Spawned engine (pid {:?}) with {:?}", spawned.handle.pid, config_path);

            if let Some(stdout) = spawned.stdout {
                tokio::spawn(Arc::clone(self).pump_output(launch, generation, OutputStream::Stdout, stdout));
            }
            if let Some(stderr) = spawned.stderr {
                tokio::spawn(Arc::clone(self).pump_output(launch, generation, OutputStream::Stderr, stderr));
            }
            let mut exit_rx = spawned.handle.exit_receiver();
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let code = process::wait_for_exit(&mut exit_rx).await;
                inner.on_exit(launch, generation, code);
            });

            shared.status.process_id = spawned.handle.pid;
            shared.process = Some(spawned.handle);
            shared.last_options = Some(StartOptions {
                config_path: Some(config_path.clone()),
                ..options
            });
            generation
        };

        // --- Phase 4: readiness probe ---
        let deadline = Instant::now() + self.settings.probe_timeout;
        loop {
            {
                let shared = self.lock();
                if !launching(&shared, launch, generation) {
                    return Err(abandoned(&shared));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let api = self.api();
            if let Ok(true) = tokio::time::timeout(remaining, api.is_ready()).await {
                return self.mark_running(launch, generation, config_path);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.settings.probe_interval.min(remaining)).await;
        }

        let err = ControlError::Timeout(format!(
            "engine did not become ready within {} ms",
            self.settings.probe_timeout.as_millis()
        ));
        let mut shared = self.lock();
        if !launching(&shared, launch, generation) {
            return Err(abandoned(&shared));
        }
        self.fail(&mut shared, err.to_string());
        if let Some(handle) = &shared.process {
            handle.signal(ProcessSignal::Kill);
        }
        Err(err)
    }

    fn mark_running(&self, launch: u64, generation: u64, config_path: PathBuf) -> ControlResult<ServiceStatus> {
        let mut shared = self.lock();
        if !launching(&shared, launch, generation) {
            return Err(abandoned(&shared));
        }
        shared.retry_count = 0;
        shared.status.start_timestamp = Some(Utc::now());
        shared.status.active_config_path = Some(config_path);
        shared.status.last_error = None;
        self.transition(&mut shared, ServiceState::Running);
        let pid = shared.status.process_id.unwrap_or_default();
        log::info!("Engine is ready (pid {})", pid);
        self.emit(ServiceEvent::Started { pid });
        Ok(shared.status.clone())
    }

    async fn pump_output<R>(self: Arc<Self>, launch: u64, generation: u64, stream: OutputStream, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.on_output(launch, generation, stream, line),
                Ok(None) => break,
                Err(e) => {
                    log::debug!("Engine {:?} closed: {}", stream, e);
                    break;
                }
            }
        }
    }

    fn on_output(&self, launch: u64, generation: u64, stream: OutputStream, line: String) {
        match stream {
            OutputStream::Stdout => log::info!(target: "engine", "{}", line),
            OutputStream::Stderr => log::warn!(target: "engine", "{}", line),
        }
        let fatal = self.settings.fatal_markers.iter().any(|m| line.contains(m.as_str()));
        if fatal {
            let mut shared = self.lock();
            if launching(&shared, launch, generation) {
                self.fail(&mut shared, format!("engine reported a fatal error: {}", line));
                if let Some(handle) = &shared.process {
                    handle.signal(ProcessSignal::Kill);
                }
            }
        }
        self.emit(ServiceEvent::Log { stream, line });
    }

    fn on_exit(self: &Arc<Self>, launch: u64, generation: u64, code: Option<i32>) {
        let mut shared = self.lock();
        if shared.generation != generation {
            log::debug!("Ignoring exit of replaced engine generation {}", generation);
            return;
        }
        shared.process = None;
        shared.status.process_id = None;

        match shared.status.state {
            ServiceState::Stopping => self.settle_idle(&mut shared),
            ServiceState::Running => {
                log::warn!("Engine exited unexpectedly (code {:?})", code);
                shared.status.start_timestamp = None;
                self.emit(ServiceEvent::UnexpectedExit { code });
                self.apply_crash_policy(&mut shared);
            }
            ServiceState::Starting if claims_start(&shared, launch) => {
                self.fail(&mut shared, format!("engine exited during startup (code {:?})", code));
            }
            ServiceState::Starting | ServiceState::Idle | ServiceState::Error => {}
        }
    }

    fn apply_crash_policy(self: &Arc<Self>, shared: &mut Shared) {
        match crash_policy(shared.retry_count, &self.settings, shared.last_options.is_some()) {
            CrashDecision::Restart { attempt, delay } => {
                shared.retry_count = attempt;
                claim_launch(shared);
                shared.next_token += 1;
                let token = shared.next_token;
                shared.pending_restart = Some(token);
                self.transition(shared, ServiceState::Starting);
                log::info!("Restarting engine in {:?} (attempt {})", delay, attempt);
                self.emit(ServiceEvent::RestartScheduled { attempt, delay });

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.run_scheduled_restart(token).await;
                });
            }
            CrashDecision::GiveUp => {
                self.fail(shared, "engine crashed too many times".to_string());
            }
        }
    }

    async fn run_scheduled_restart(self: Arc<Self>, token: u64) {
        let (options, launch) = {
            let mut shared = self.lock();
            if shared.pending_restart != Some(token) || shared.status.state != ServiceState::Starting {
                return;
            }
            shared.pending_restart = None;
            let launch = claim_launch(&mut shared);
            (shared.last_options.clone().unwrap_or_default(), launch)
        };

        if let Err(e) = self.launch(options, launch).await {
            log::warn!("Scheduled engine restart failed: {}", e);
            let mut shared = self.lock();
            // A failed attempt spends the next retry instead of parking in Error.
            if shared.launch_id == launch
                && shared.status.state == ServiceState::Error
                && shared.pending_restart.is_none()
            {
                self.apply_crash_policy(&mut shared);
            }
        }
    }
}

/// Invalidates every launch in flight and returns the id of a new one.
fn claim_launch(shared: &mut Shared) -> u64 {
    shared.launch_id += 1;
    shared.launch_id
}

/// True while `launch` is still the start in charge of the Starting state.
fn claims_start(shared: &Shared, launch: u64) -> bool {
    shared.launch_id == launch
        && shared.status.state == ServiceState::Starting
        && shared.pending_restart.is_none()
}

/// True while the process of `generation`, spawned by `launch`, is still
/// the one being brought up.
fn launching(shared: &Shared, launch: u64, generation: u64) -> bool {
    shared.generation == generation && claims_start(shared, launch)
}

/// Error for a start that was overtaken by a stop or a failure.
fn abandoned(shared: &Shared) -> ControlError {
    match (&shared.status.state, &shared.status.last_error) {
        (ServiceState::Error, Some(message)) => ControlError::ProcessCrash(message.clone()),
        _ => ControlError::ProcessCrash("engine stopped before it became ready".to_string()),
    }
}

async fn write_config(path: &Path, content: &str) -> ControlResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}
