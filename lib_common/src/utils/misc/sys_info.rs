use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
/// # Process Info Error
///
/// Errors raised while inspecting or signalling host processes.
pub enum ProcessInfoError {
    /// An I/O error occurred, typically when spawning the helper command.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// A helper command failed with an unexpected exit status.
    #[error("Command failed with non-zero exit status ({status}): {stderr}")]
    ExitStatusError {
        /// Exit code of the helper, `-1` when terminated by a signal.
        status: i32,
        /// Trimmed stderr of the helper.
        stderr: String,
    },
}

/// Linux truncates `comm` (what `pkill -x` matches against) to 15 bytes.
const COMM_MAX_LEN: usize = 15;

/// Appends the platform executable suffix to `stem` (`.exe` on Windows).
pub fn executable_name(stem: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", stem)
    } else {
        stem.to_string()
    }
}

/// The `{os}-{arch}` tag used in release asset names, e.g. `linux-amd64`.
///
/// Returns `None` on hosts no release is published for.
pub fn platform_tag() -> Option<String> {
    let os = match std::env::consts::OS {
        "windows" => "windows",
        "macos" => "darwin",
        "linux" => "linux",
        _ => return None,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        _ => return None,
    };
    Some(format!("{}-{}", os, arch))
}

/// # Sweep Processes By Name
///
/// Forcefully terminates every process whose executable name is `name`.
/// Used to clear engine instances left behind by a previous crash of the
/// control plane before a new one is spawned.
///
/// Uses `taskkill /F /IM` on Windows and `pkill -KILL -x` elsewhere.
///
/// # Returns
/// `Ok(true)` when at least one process was signalled, `Ok(false)` when none
/// matched.
pub fn sweep_processes_by_name(name: &str) -> Result<bool, ProcessInfoError> {
    let output = if cfg!(target_os = "windows") {
        Command::new("taskkill").args(["/F", "/IM", name]).output()?
    } else {
        Command::new("pkill").args(["-KILL", "-x", &comm_name(name)]).output()?
    };

    match output.status.code() {
        Some(0) => {
            log::info!("Swept stray '{}' processes", name);
            Ok(true)
        }
        // pkill: no match; taskkill: process not found
        Some(1) | Some(128) => Ok(false),
        code => Err(ProcessInfoError::ExitStatusError {
            status: code.unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}

/// The name `pkill -x` will actually see for an executable called `name`.
fn comm_name(name: &str) -> String {
    if cfg!(target_os = "linux") && name.len() > COMM_MAX_LEN {
        name.chars().take(COMM_MAX_LEN).collect()
    } else {
        name.to_string()
    }
}
