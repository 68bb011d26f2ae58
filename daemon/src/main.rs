//! # Engine Daemon
//!
//! Command-line host for the engine control plane.
//!
//! ## Workflow
//! 1. Parse CLI/env, layer them over the JSON config file and defaults.
//! 2. Install file + console logging.
//! 3. Build the `Orchestrator` with a file-backed system proxy store.
//! 4. Run the requested subcommand. `run` keeps the engine up until Ctrl-C
//!    or SIGTERM and then tears everything down.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use engine_core::{
    Channel, ControlEvent, FileSettingsStore, InstallEvent, Orchestrator, ServiceEvent, StartOptions,
};
use lib_common::loggers::logger::setup_logging;
use tokio::signal;

mod config;
use config::{DaemonConfig, load_config};

#[derive(Parser, Debug)]
#[command(about = "Local control plane for a sing-box compatible proxy engine", version)]
struct Cli {
    #[command(flatten)]
    config: DaemonConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the engine and keep it supervised until interrupted.
    Run {
        #[arg(long, help = "Engine config file. Defaults to config.json in the data directory.")]
        engine_config: Option<PathBuf>,
        #[arg(long, help = "Run the alpha channel binary.")]
        alpha: bool,
        #[arg(long, help = "Delete the engine cache database before starting.")]
        clear_cache_db: bool,
    },
    /// Print the system proxy settings and installed engine versions as JSON.
    ///
    /// Engine state lives in the `run` process and is not visible here.
    Status,
    /// List installed and downloadable engine versions.
    Versions {
        #[arg(long)]
        prerelease: bool,
    },
    /// Download and install the newest release.
    Install {
        #[arg(long, help = "Install into the alpha channel.")]
        alpha: bool,
        #[arg(long, help = "Take the newest prerelease instead of the latest stable.")]
        prerelease: bool,
    },
    /// Restore the binary that the last install replaced.
    Rollback {
        #[arg(long)]
        alpha: bool,
    },
    /// Remove downloaded archives and the engine cache database.
    ClearCache,
}

fn channel(alpha: bool) -> Channel {
    if alpha { Channel::Alpha } else { Channel::Stable }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config);
    let log_path = setup_logging(&config.log_dir(), config.log_level(), "engine_daemon")
        .context("Failed to set up logging")?;
    log::debug!("Logging to {}", log_path.display());

    let store = Arc::new(FileSettingsStore::new(config.proxy_settings_path()));
    let orch = Orchestrator::new(config.to_orchestrator_config(), store).context("Failed to build orchestrator")?;

    match cli.command {
        Command::Run {
            engine_config,
            alpha,
            clear_cache_db,
        } => {
            let options = StartOptions {
                config_path: engine_config,
                config_content: None,
                clear_cache_db,
            };
            run(&orch, channel(alpha), options).await
        }
        Command::Status => status(&orch).await,
        Command::Versions { prerelease } => versions(&orch, prerelease).await,
        Command::Install { alpha, prerelease } => install(&orch, channel(alpha), prerelease).await,
        Command::Rollback { alpha } => {
            let channel = channel(alpha);
            orch.versions()
                .rollback(channel)
                .await
                .with_context(|| format!("Rollback of {} channel failed", channel.as_str()))?;
            println!("Restored previous {} binary", channel.as_str());
            Ok(())
        }
        Command::ClearCache => {
            let freed = orch.versions().clear_cache().await;
            println!("Freed {} bytes", freed);
            Ok(())
        }
    }
}

async fn run(orch: &Orchestrator, channel: Channel, options: StartOptions) -> Result<()> {
    // --- Phase 1: point the supervisor at the channel binary ---
    let mut engine = orch.supervisor().engine_config();
    engine.executable_path = orch.versions().binary_path(channel);
    orch.update_engine_config(engine)?;
    orch.init();

    let mut events = orch.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ControlEvent::Service(ServiceEvent::StateChanged { from, to }) => {
                    log::info!("Engine {} -> {}", from.as_str(), to.as_str());
                }
                ControlEvent::Service(ServiceEvent::RestartScheduled { attempt, delay }) => {
                    log::warn!("Engine restart #{} in {:?}", attempt, delay);
                }
                ControlEvent::Service(ServiceEvent::Error { message }) => {
                    log::error!("Engine error: {}", message);
                }
                _ => {}
            }
        }
    });

    // --- Phase 2: start ---
    if let Err(e) = orch.start(options).await {
        orch.shutdown().await;
        reporter.abort();
        bail!("Engine failed to start: {}", e);
    }
    log::info!("Engine running. Press Ctrl-C to stop.");

    // --- Phase 3: wait for a shutdown signal ---
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate_signal() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    // --- Phase 4: teardown ---
    orch.shutdown().await;
    reporter.abort();
    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            log::warn!("Could not listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// What a short-lived process can observe: the persisted system proxy and
/// the binaries on disk. The engine itself is owned by `run`.
async fn status_report(orch: &Orchestrator) -> serde_json::Value {
    let versions = orch.versions();
    serde_json::json!({
        "systemProxy": orch.system_proxy().status(),
        "stable": versions.get_local_version(Channel::Stable).await,
        "alpha": versions.get_local_version(Channel::Alpha).await,
    })
}

async fn status(orch: &Orchestrator) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&status_report(orch).await)?);
    Ok(())
}

async fn versions(orch: &Orchestrator, prerelease: bool) -> Result<()> {
    let versions = orch.versions();
    for channel in [Channel::Stable, Channel::Alpha] {
        match versions.get_local_version(channel).await {
            Some(local) => println!(
                "installed {:<6} {}{}",
                channel.as_str(),
                local.version,
                if versions.can_rollback(channel) { " (rollback available)" } else { "" }
            ),
            None => println!("installed {:<6} -", channel.as_str()),
        }
    }

    let releases = versions.get_remote_releases(prerelease).await;
    if releases.is_empty() {
        println!("No releases found for {}", versions.config().platform);
    }
    for release in releases {
        println!(
            "available {:<20} {}{}",
            release.version,
            release.published_at.as_deref().unwrap_or("-"),
            if release.is_prerelease { " prerelease" } else { "" }
        );
    }
    Ok(())
}

async fn install(orch: &Orchestrator, channel: Channel, prerelease: bool) -> Result<()> {
    let versions = orch.versions();
    let releases = versions.get_remote_releases(prerelease).await;
    let release = if prerelease {
        releases.iter().find(|r| r.is_prerelease).or_else(|| releases.first())
    } else {
        releases.iter().find(|r| !r.is_prerelease)
    };
    let Some(release) = release else {
        bail!("No {} release found for {}", if prerelease { "prerelease" } else { "stable" }, versions.config().platform);
    };

    let mut events = versions.subscribe();
    let progress = tokio::spawn(async move {
        let mut last_percent = 0;
        while let Ok(event) = events.recv().await {
            if let InstallEvent::Progress {
                downloaded,
                total: Some(total),
            } = event
            {
                let percent = downloaded.saturating_mul(100) / total.max(1);
                if percent >= last_percent + 10 {
                    last_percent = percent;
                    log::info!("Downloaded {}%", percent);
                }
            }
        }
    });

    let result = versions.download_and_install(release, channel).await;
    progress.abort();
    let path = result.with_context(|| format!("Installing {} failed", release.version))?;
    println!("Installed {} ({}) at {}", release.version, channel.as_str(), path.display());
    Ok(())
}
