//! Blocking filesystem steps of an install: backup, extraction, search,
//! placement and cache cleanup. Callers run them on the blocking pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{ControlError, ControlResult};

/// Moves `binary` to `backup`, replacing an older backup.
///
/// Returns whether a backup was made (false when there was no binary).
pub(crate) fn backup_current(binary: &Path, backup: &Path) -> ControlResult<bool> {
    if !binary.is_file() {
        return Ok(false);
    }
    if backup.exists() {
        fs::remove_file(backup)?;
    }
    fs::rename(binary, backup)?;
    Ok(true)
}

/// Puts the backup back in place of a failed install. The backup itself
/// stays, so a later rollback still works.
pub(crate) fn restore_backup(binary: &Path, backup: &Path) -> io::Result<()> {
    if binary.exists() {
        fs::remove_file(binary)?;
    }
    fs::copy(backup, binary)?;
    Ok(())
}

/// Unpacks `archive` into `dest`.
pub(crate) fn extract_archive(archive: &Path, dest: &Path) -> ControlResult<()> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ControlError::ExtractFailure(e.to_string()))?;
    zip.extract(dest)
        .map_err(|e| ControlError::ExtractFailure(e.to_string()))
}

/// First regular file named `file_name` under `root`, in file-name order.
pub(crate) fn find_executable(root: &Path, file_name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == file_name)
        .map(|e| e.into_path())
}

/// Moves `found` to `target` and makes it executable.
pub(crate) fn place_binary(found: &Path, target: &Path) -> ControlResult<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if target.exists() {
        fs::remove_file(target)?;
    }
    // Rename fails across filesystems; fall back to a copy.
    if fs::rename(found, target).is_err() {
        fs::copy(found, target).map_err(|e| ControlError::InstallFailure(e.to_string()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Total size of the files under `path` (or of `path` itself).
fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Removes `path` (file or tree) and returns the bytes it held, or 0 when
/// the removal failed.
pub(crate) fn remove_counted(path: &Path) -> u64 {
    let size = disk_usage(path);
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => size,
        Err(e) => {
            log::warn!("Could not remove {:?}: {}", path, e);
            0
        }
    }
}

/// Empties `dir` without removing it. Returns the bytes freed.
pub(crate) fn clear_dir(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| remove_counted(&e.path()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_executable_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a-first");
        let b = dir.path().join("b-second");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("sing-box"), b"1").unwrap();
        fs::write(b.join("sing-box"), b"2").unwrap();
        fs::create_dir_all(dir.path().join("sing-box.d")).unwrap();

        let found = find_executable(dir.path(), "sing-box").unwrap();
        assert_eq!(found, a.join("sing-box"));
        assert!(find_executable(dir.path(), "missing").is_none());
    }

    #[test]
    fn backup_replaces_previous_backup() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("sing-box");
        let bak = dir.path().join("sing-box.bak");
        fs::write(&bin, b"new").unwrap();
        fs::write(&bak, b"old").unwrap();

        assert!(backup_current(&bin, &bak).unwrap());
        assert!(!bin.exists());
        assert_eq!(fs::read(&bak).unwrap(), b"new");
        assert!(!backup_current(&bin, &bak).unwrap());
    }

    #[test]
    fn clear_dir_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.zip"), vec![0u8; 100]).unwrap();
        let nested = dir.path().join("tmp");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("b"), vec![0u8; 28]).unwrap();

        assert_eq!(clear_dir(dir.path()), 128);
        assert!(dir.path().exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
