//! Shared fixtures: a mock engine control API and shell-script fake engines.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    routing::{delete, get, patch, put},
    Json, Router,
};
use engine_core::{EngineConfig, SupervisorSettings};
use serde_json::{json, Value};

#[derive(Default)]
pub struct MockState {
    pub ready: AtomicBool,
    pub upload_total: AtomicU64,
    pub download_total: AtomicU64,
    pub connection_ids: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<String>>,
    pub mode: Mutex<Option<String>>,
    pub selected: Mutex<Option<(String, String)>>,
}

pub struct MockApi {
    pub state: Arc<MockState>,
    pub port: u16,
}

impl MockApi {
    pub fn set_ready(&self, ready: bool) {
        self.state.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_totals(&self, up: u64, down: u64) {
        self.state.upload_total.store(up, Ordering::SeqCst);
        self.state.download_total.store(down, Ordering::SeqCst);
    }

    pub fn set_connections(&self, ids: &[&str]) {
        *self.state.connection_ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
    }
}

async fn hello(State(state): State<Arc<MockState>>) -> (StatusCode, Json<Value>) {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(json!({ "hello": "clash" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})))
    }
}

async fn connections(State(state): State<Arc<MockState>>) -> Json<Value> {
    let ids = state.connection_ids.lock().unwrap().clone();
    let list: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "metadata": {
                    "network": "tcp",
                    "type": "Mixed",
                    "sourceIP": "127.0.0.1",
                    "sourcePort": "51000",
                    "destinationIP": "93.184.216.34",
                    "destinationPort": "443",
                    "host": "example.com"
                },
                "upload": 1,
                "download": 2,
                "start": "2024-05-01T10:00:00Z",
                "chains": ["direct"],
                "rule": "final",
                "rulePayload": ""
            })
        })
        .collect();
    let connections = if list.is_empty() { Value::Null } else { Value::Array(list) };
    Json(json!({
        "uploadTotal": state.upload_total.load(Ordering::SeqCst),
        "downloadTotal": state.download_total.load(Ordering::SeqCst),
        "connections": connections
    }))
}

async fn close_one(State(state): State<Arc<MockState>>, UrlPath(id): UrlPath<String>) -> StatusCode {
    let mut ids = state.connection_ids.lock().unwrap();
    match ids.iter().position(|c| *c == id) {
        Some(pos) => {
            ids.remove(pos);
            state.closed.lock().unwrap().push(id);
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn close_all(State(state): State<Arc<MockState>>) -> StatusCode {
    let drained: Vec<String> = state.connection_ids.lock().unwrap().drain(..).collect();
    state.closed.lock().unwrap().extend(drained);
    StatusCode::NO_CONTENT
}

async fn select(
    State(state): State<Arc<MockState>>,
    UrlPath(group): UrlPath<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    *state.selected.lock().unwrap() = Some((group, name));
    StatusCode::NO_CONTENT
}

async fn configs(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> StatusCode {
    *state.mode.lock().unwrap() = body["mode"].as_str().map(|s| s.to_string());
    StatusCode::NO_CONTENT
}

/// Serves a Clash-style control API on an ephemeral port.
pub async fn spawn_mock_api() -> MockApi {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/", get(hello))
        .route("/connections", get(connections).delete(close_all))
        .route("/connections/{id}", delete(close_one))
        .route("/proxies/{group}", put(select))
        .route("/configs", patch(configs))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockApi { state, port }
}

/// A port nothing listens on.
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Writes an executable `/bin/sh` script.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// An engine that runs until signalled.
pub const LONG_RUNNING: &str = "exec sleep 30";

pub fn engine_config(dir: &Path, port: u16) -> EngineConfig {
    EngineConfig {
        executable_path: dir.join("fake-engine"),
        config_directory: dir.join("config"),
        working_directory: dir.to_path_buf(),
        control_api_host: "127.0.0.1".to_string(),
        control_api_port: port,
        control_api_secret: Some("test-secret".to_string()),
    }
}

pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        probe_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(1000),
        stop_timeout: Duration::from_millis(1000),
        restart_pause: Duration::from_millis(10),
        sweep_settle: Duration::ZERO,
        sweep_strays: false,
        max_retries: 3,
        retry_base_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn config_file(dir: &Path) -> PathBuf {
    dir.join("config").join("config.json")
}

/// Polls `cond` until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Everything currently queued on a broadcast receiver.
pub fn drain<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
