use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Maps a configured level string onto a `log::LevelFilter`.
///
/// Unknown strings fall back to `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Installs the global logger: stdout plus a timestamped file in `log_dir`.
///
/// Older `<app_name>_*.log` files are removed first so that only the most
/// recent previous run is kept next to the new one.
///
/// Returns the path of the log file that was opened.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Clean up old log files, keeping only the most recent one
    cleanup_old_logs(log_dir, app_name)?;

    let log_file_name = format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        // Chatty HTTP internals stay at warn unless explicitly asked for.
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

/// Deletes every `<app_name>_*.log` in `log_dir` except the newest one.
///
/// Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str) -> Result<usize> {
    let prefix = format!("{}_", app_name);
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "log"))
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(1) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn parses_levels() {
        assert_eq!(parse_level("TRACE"), log::LevelFilter::Trace);
        assert_eq!(parse_level("debug"), log::LevelFilter::Debug);
        assert_eq!(parse_level("warning"), log::LevelFilter::Warn);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Error);
        assert_eq!(parse_level("bogus"), log::LevelFilter::Info);
    }

    #[test]
    fn keeps_only_newest_log_of_the_app() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("daemon_2024-01-01_00-00-00.log");
        let new = dir.path().join("daemon_2024-01-02_00-00-00.log");
        let other = dir.path().join("other_2024-01-01_00-00-00.log");
        for p in [&old, &new, &other] {
            fs::write(p, b"x").unwrap();
        }
        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options().write(true).open(&old).unwrap().set_modified(past).unwrap();

        let removed = cleanup_old_logs(dir.path(), "daemon").unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(new.exists());
        assert!(other.exists());
    }
}
