//! # Version Manager
//!
//! Discovers, downloads and installs engine binaries, one per channel, with a
//! `.bak` sibling that makes every install reversible.
//!
//! ## Install Workflow
//! 1. **Download** the release archive into the cache directory, streaming
//!    progress against the declared content length.
//! 2. **Back up** the current channel binary to `<binary>.bak`.
//! 3. **Extract** into a scratch directory inside the cache and search it for
//!    the product executable.
//! 4. **Place** the executable at the channel path and delete the archive.
//!
//! A failure at any step puts the backup back, so a channel that had a
//! working binary keeps one.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

mod feed;
mod install;

pub use feed::asset_name;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use lib_common::retrieve::ky_http::{ApiClient, ApiClientOptions};
use lib_common::utils::misc::sys_info::executable_name;
use regex::Regex;
use reqwest::Method;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::config::InstallConfig;
use crate::error::{ControlError, ControlResult};
use crate::events::{InstallEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::{Channel, KernelVersion, RemoteRelease};
use feed::GithubRelease;

/// How many recent releases are scanned for a prerelease.
const PRERELEASE_SCAN: usize = 10;
const FEED_TIMEOUT: Duration = Duration::from_secs(15);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Pulls the semantic version out of `<product> version ...` output.
pub fn parse_version(output: &str) -> Option<String> {
    let re = Regex::new(r"v?(\d+\.\d+\.\d+(?:-[0-9A-Za-z.]+)?)").ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Owner of the installed engine binaries.
pub struct VersionManager {
    config: InstallConfig,
    feed: ApiClient,
    download: ApiClient,
    events: broadcast::Sender<InstallEvent>,
    installing: AtomicBool,
}

/// Clears the in-progress flag when an install ends, however it ends.
struct InstallGuard<'a>(&'a AtomicBool);

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl VersionManager {
    /// Creates a manager for `config`. Fails only on a malformed feed URL.
    pub fn new(config: InstallConfig) -> ControlResult<Self> {
        let mut feed_url = config.release_feed_url.clone();
        if !feed_url.ends_with('/') {
            feed_url.push('/');
        }
        let feed = ApiClient::with_options(
            &feed_url,
            None,
            ApiClientOptions {
                max_retries: 3,
                timeout: Some(FEED_TIMEOUT),
                ..Default::default()
            },
        )
        .map_err(ControlError::network)?;
        // Archives can be large; no whole-request timeout.
        let download = ApiClient::with_options(
            &feed_url,
            None,
            ApiClientOptions {
                max_retries: 3,
                timeout: None,
                ..Default::default()
            },
        )
        .map_err(ControlError::network)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            feed,
            download,
            events,
            installing: AtomicBool::new(false),
        })
    }

    /// Receives install progress notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.events.subscribe()
    }

    /// The install settings in use.
    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    /// Canonical binary path of `channel`.
    pub fn binary_path(&self, channel: Channel) -> PathBuf {
        let stem = match channel {
            Channel::Stable => self.config.product.clone(),
            Channel::Alpha => format!("{}-alpha", self.config.product),
        };
        self.config.install_dir.join(executable_name(&stem))
    }

    /// Backup sibling of the channel binary.
    pub fn backup_path(&self, channel: Channel) -> PathBuf {
        let mut name = self.binary_path(channel).into_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// True iff a backup exists for `channel`.
    pub fn can_rollback(&self, channel: Channel) -> bool {
        self.backup_path(channel).is_file()
    }

    /// Version of the installed binary, or `None` when it is missing or
    /// does not report one.
    pub async fn get_local_version(&self, channel: Channel) -> Option<KernelVersion> {
        let path = self.binary_path(channel);
        if !path.is_file() {
            return None;
        }
        let mut command = tokio::process::Command::new(&path);
        command.arg("version").kill_on_drop(true);
        let output = match tokio::time::timeout(VERSION_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                log::warn!("Could not run {:?} version: {}", path, e);
                return None;
            }
            Err(_) => {
                log::warn!("{:?} version did not answer in time", path);
                return None;
            }
        };
        let mut raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if raw.is_empty() {
            raw = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }
        let version = parse_version(&raw)?;
        Some(KernelVersion {
            version,
            raw_version_output: raw,
            channel,
        })
    }

    /// Latest stable release, plus the newest prerelease when asked for.
    ///
    /// Releases without an asset for this platform are skipped. Any fetch
    /// failure yields an empty list.
    pub async fn get_remote_releases(&self, include_prerelease: bool) -> Vec<RemoteRelease> {
        match self.fetch_releases(include_prerelease).await {
            Ok(releases) => releases,
            Err(e) => {
                log::warn!("Release discovery failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn fetch_releases(&self, include_prerelease: bool) -> ControlResult<Vec<RemoteRelease>> {
        let product = &self.config.product;
        let platform = &self.config.platform;
        let mut releases = Vec::new();

        let latest: GithubRelease = self.fetch_json("releases/latest").await?;
        if let Some(release) = latest.for_platform(product, platform) {
            releases.push(release);
        }

        if include_prerelease {
            let recent: Vec<GithubRelease> = self.fetch_json(&format!("releases?per_page={}", PRERELEASE_SCAN)).await?;
            if let Some(pre) = recent.iter().find(|r| r.prerelease) {
                if pre.tag_name != latest.tag_name {
                    if let Some(release) = pre.for_platform(product, platform) {
                        releases.push(release);
                    }
                }
            }
        }
        Ok(releases)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> ControlResult<T> {
        let res = self
            .feed
            .request::<serde_json::Value, ()>(Method::GET, path, None, None)
            .await
            .map_err(ControlError::network)?;
        if !res.success {
            return Err(ControlError::Network(format!("release feed answered {}", res.status)));
        }
        let value = res.data.unwrap_or_default();
        serde_json::from_value(value).map_err(|e| ControlError::DownloadFailure(format!("malformed release feed: {}", e)))
    }

    /// Downloads `release` and installs it as the `channel` binary.
    ///
    /// Returns the installed path. On failure the previous binary is back in
    /// place and a `Failed` event carries the message.
    pub async fn download_and_install(&self, release: &RemoteRelease, channel: Channel) -> ControlResult<PathBuf> {
        if self.installing.swap(true, Ordering::SeqCst) {
            return Err(ControlError::AlreadyInProgress("install"));
        }
        let _guard = InstallGuard(&self.installing);

        let _ = self.events.send(InstallEvent::Started {
            version: release.version.clone(),
        });
        log::info!("Installing {} {} ({})", self.config.product, release.version, channel.as_str());

        let binary = self.binary_path(channel);
        let backup = self.backup_path(channel);
        let archive = self.config.cache_dir.join(&release.asset_name);
        let mut backed_up = false;

        let result = self.install_steps(release, &binary, &backup, &archive, &mut backed_up).await;

        // The archive never outlives the attempt.
        if archive.exists() {
            if let Err(e) = tokio::fs::remove_file(&archive).await {
                log::warn!("Could not remove archive {:?}: {}", archive, e);
            }
        }

        match result {
            Ok(()) => {
                log::info!("Installed {} at {:?}", release.version, binary);
                let _ = self.events.send(InstallEvent::Completed {
                    version: release.version.clone(),
                });
                Ok(binary)
            }
            Err(e) => {
                log::error!("Install of {} failed: {}", release.version, e);
                if backed_up {
                    let (b, k) = (binary.clone(), backup.clone());
                    match tokio::task::spawn_blocking(move || install::restore_backup(&b, &k)).await {
                        Ok(Ok(())) => log::info!("Restored previous binary at {:?}", binary),
                        Ok(Err(err)) => log::error!("Could not restore backup {:?}: {}", backup, err),
                        Err(err) => log::error!("Backup restore task failed: {}", err),
                    }
                }
                let _ = self.events.send(InstallEvent::Failed { message: e.to_string() });
                Err(e)
            }
        }
    }

    async fn install_steps(
        &self,
        release: &RemoteRelease,
        binary: &Path,
        backup: &Path,
        archive: &Path,
        backed_up: &mut bool,
    ) -> ControlResult<()> {
        // --- Phase 1: Download ---
        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        tokio::fs::create_dir_all(&self.config.install_dir).await?;
        self.download_archive(&release.download_url, archive).await?;

        // --- Phase 2: Back up ---
        let (b, k) = (binary.to_path_buf(), backup.to_path_buf());
        *backed_up = blocking(move || install::backup_current(&b, &k)).await?;

        // --- Phase 3: Extract and search ---
        let scratch = tempfile::Builder::new()
            .prefix("extract-")
            .tempdir_in(&self.config.cache_dir)?;
        let (a, d) = (archive.to_path_buf(), scratch.path().to_path_buf());
        blocking(move || install::extract_archive(&a, &d)).await?;

        let wanted = executable_name(&self.config.product);
        let root = scratch.path().to_path_buf();
        let found = blocking(move || Ok(install::find_executable(&root, &wanted)))
            .await?
            .ok_or_else(|| ControlError::InstallFailure("executable not found in archive".to_string()))?;

        // --- Phase 4: Place ---
        let target = binary.to_path_buf();
        blocking(move || install::place_binary(&found, &target)).await?;
        Ok(())
    }

    async fn download_archive(&self, url: &str, dest: &Path) -> ControlResult<()> {
        let response = self.download.get_stream(url).await.map_err(ControlError::network)?;
        if !response.status().is_success() {
            return Err(ControlError::DownloadFailure(format!("HTTP {}", response.status())));
        }
        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ControlError::network)?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            let _ = self.events.send(InstallEvent::Progress { downloaded, total });
        }
        file.flush().await?;

        if let Some(total) = total {
            if downloaded != total {
                return Err(ControlError::DownloadFailure(format!(
                    "received {} of {} bytes",
                    downloaded, total
                )));
            }
        }
        Ok(())
    }

    /// Swaps the backup back in for `channel`.
    pub async fn rollback(&self, channel: Channel) -> ControlResult<()> {
        let binary = self.binary_path(channel);
        let backup = self.backup_path(channel);
        if !backup.is_file() {
            return Err(ControlError::NotFound("backup".to_string()));
        }
        if binary.exists() {
            tokio::fs::remove_file(&binary).await?;
        }
        tokio::fs::rename(&backup, &binary).await?;
        log::info!("Rolled back {} binary from {:?}", channel.as_str(), backup);
        Ok(())
    }

    /// Empties the download cache and removes the runtime cache database.
    ///
    /// Returns the bytes freed. Individual failures are logged and skipped.
    pub async fn clear_cache(&self) -> u64 {
        let cache_dir = self.config.cache_dir.clone();
        let cache_db = self.config.runtime_cache_db.clone();
        let freed = tokio::task::spawn_blocking(move || {
            let mut freed = install::clear_dir(&cache_dir);
            if let Some(db) = cache_db.filter(|p| p.exists()) {
                freed += install::remove_counted(&db);
            }
            freed
        })
        .await
        .unwrap_or_else(|e| {
            log::warn!("Cache clear task failed: {}", e);
            0
        });
        log::info!("Cleared {} bytes of cache", freed);
        freed
    }
}

/// Runs a fallible filesystem step on the blocking pool.
async fn blocking<T, F>(f: F) -> ControlResult<T>
where
    F: FnOnce() -> ControlResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ControlError::InstallFailure(format!("worker task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_version_output() {
        let out = "sing-box version 1.10.3\n\nEnvironment: go1.23.1 linux/amd64";
        assert_eq!(parse_version(out).as_deref(), Some("1.10.3"));
        assert_eq!(parse_version("sing-box version 1.11.0-beta.5").as_deref(), Some("1.11.0-beta.5"));
        assert_eq!(parse_version("no version here"), None);
    }

    #[test]
    fn channel_paths() {
        let dir = tempfile::tempdir().unwrap();
        let vm = VersionManager::new(InstallConfig {
            install_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let stable = vm.binary_path(Channel::Stable);
        let alpha = vm.binary_path(Channel::Alpha);
        assert_eq!(stable, dir.path().join(executable_name("sing-box")));
        assert_eq!(alpha, dir.path().join(executable_name("sing-box-alpha")));
        assert_eq!(
            vm.backup_path(Channel::Stable).file_name().unwrap().to_string_lossy(),
            format!("{}.bak", executable_name("sing-box"))
        );
    }
}
