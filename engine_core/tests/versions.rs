mod common;

use std::io::Write;
use std::path::Path;

use axum::{body::Body, http::StatusCode, response::Response, routing::get, Json, Router};
use engine_core::{Channel, ControlError, InstallConfig, InstallEvent, RemoteRelease, VersionManager};
use lib_common::utils::misc::sys_info::executable_name;
use serde_json::json;
use zip::write::SimpleFileOptions;

const PLATFORM: &str = "test-amd64";

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default().unix_permissions(0o755))
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn zip_response(bytes: Vec<u8>) -> Response {
    Response::builder()
        .header("content-type", "application/zip")
        .header("content-length", bytes.len())
        .body(Body::from(bytes))
        .unwrap()
}

/// Serves a GitHub-style release feed plus the archives it links to.
async fn spawn_feed() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/", listener.local_addr().unwrap());

    let exe_entry = format!("sing-box-1.2.3-test-amd64/{}", executable_name("sing-box"));
    let good = build_zip(&[
        ("sing-box-1.2.3-test-amd64/LICENSE", b"license".as_slice()),
        (exe_entry.as_str(), b"new-engine".as_slice()),
    ]);
    let hollow = build_zip(&[("README.md", b"nothing to see".as_slice())]);

    let latest = json!({
        "tag_name": "v1.2.3",
        "prerelease": false,
        "published_at": "2024-06-01T00:00:00Z",
        "assets": [
            { "name": "sing-box-1.2.3-test-amd64.tar.gz", "browser_download_url": format!("{}download/wrong", base) },
            { "name": "sing-box-1.2.3-test-amd64.zip", "browser_download_url": format!("{}download/good.zip", base) }
        ]
    });
    let recent = json!([
        {
            "tag_name": "v1.3.0-alpha.1",
            "prerelease": true,
            "assets": [
                { "name": "sing-box-1.3.0-alpha.1-test-amd64.zip", "browser_download_url": format!("{}download/good.zip", base) }
            ]
        },
        latest.clone()
    ]);

    let app = Router::new()
        .route("/releases/latest", get(move || async move { Json(latest) }))
        .route("/releases", get(move || async move { Json(recent) }))
        .route("/download/good.zip", get(move || async move { zip_response(good) }))
        .route("/download/hollow.zip", get(move || async move { zip_response(hollow) }))
        .route("/download/missing.zip", get(|| async { StatusCode::NOT_FOUND }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

fn manager(root: &Path, feed: &str) -> VersionManager {
    VersionManager::new(InstallConfig {
        install_dir: root.join("core"),
        cache_dir: root.join("cache"),
        product: "sing-box".to_string(),
        release_feed_url: feed.to_string(),
        platform: PLATFORM.to_string(),
        runtime_cache_db: Some(root.join("cache.db")),
    })
    .unwrap()
}

fn release(feed: &str, file: &str) -> RemoteRelease {
    RemoteRelease {
        version: "1.2.3".to_string(),
        tag: "v1.2.3".to_string(),
        published_at: None,
        is_prerelease: false,
        download_url: format!("{}download/{}", feed, file),
        asset_name: "sing-box-1.2.3-test-amd64.zip".to_string(),
    }
}

fn put_binary(vm: &VersionManager, channel: Channel, content: &[u8]) {
    let path = vm.binary_path(channel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn lists_stable_and_prerelease() {
    let feed = spawn_feed().await;
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), &feed);

    let stable_only = vm.get_remote_releases(false).await;
    assert_eq!(stable_only.len(), 1);
    assert_eq!(stable_only[0].version, "1.2.3");
    assert_eq!(stable_only[0].asset_name, "sing-box-1.2.3-test-amd64.zip");
    assert!(stable_only[0].download_url.ends_with("download/good.zip"));

    let with_pre = vm.get_remote_releases(true).await;
    assert_eq!(with_pre.len(), 2);
    assert!(with_pre[1].is_prerelease);
    assert_eq!(with_pre[1].version, "1.3.0-alpha.1");
}

#[tokio::test]
async fn unreachable_feed_yields_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let feed = format!("http://127.0.0.1:{}/", common::dead_port());
    let vm = manager(dir.path(), &feed);

    assert!(vm.get_remote_releases(true).await.is_empty());
}

#[tokio::test]
async fn fresh_install_has_no_backup() {
    let feed = spawn_feed().await;
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), &feed);
    let mut rx = vm.subscribe();

    let installed = vm.download_and_install(&release(&feed, "good.zip"), Channel::Stable).await.unwrap();

    assert_eq!(installed, vm.binary_path(Channel::Stable));
    assert_eq!(std::fs::read(&installed).unwrap(), b"new-engine");
    assert!(!vm.can_rollback(Channel::Stable));
    assert!(!dir.path().join("cache").join("sing-box-1.2.3-test-amd64.zip").exists());

    let events = common::drain(&mut rx);
    assert_eq!(events.first(), Some(&InstallEvent::Started { version: "1.2.3".into() }));
    assert!(events.iter().any(|e| matches!(e, InstallEvent::Progress { total: Some(_), .. })));
    assert_eq!(events.last(), Some(&InstallEvent::Completed { version: "1.2.3".into() }));
}

#[tokio::test]
async fn install_over_existing_keeps_a_backup_for_rollback() {
    let feed = spawn_feed().await;
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), &feed);
    put_binary(&vm, Channel::Stable, b"old-engine");

    vm.download_and_install(&release(&feed, "good.zip"), Channel::Stable).await.unwrap();

    assert!(vm.can_rollback(Channel::Stable));
    assert_eq!(std::fs::read(vm.backup_path(Channel::Stable)).unwrap(), b"old-engine");

    vm.rollback(Channel::Stable).await.unwrap();

    assert_eq!(std::fs::read(vm.binary_path(Channel::Stable)).unwrap(), b"old-engine");
    assert!(!vm.can_rollback(Channel::Stable));
}

#[tokio::test]
async fn channels_install_side_by_side() {
    let feed = spawn_feed().await;
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), &feed);
    put_binary(&vm, Channel::Stable, b"stable-engine");

    vm.download_and_install(&release(&feed, "good.zip"), Channel::Alpha).await.unwrap();

    assert_eq!(std::fs::read(vm.binary_path(Channel::Alpha)).unwrap(), b"new-engine");
    assert_eq!(std::fs::read(vm.binary_path(Channel::Stable)).unwrap(), b"stable-engine");
    assert!(!vm.can_rollback(Channel::Stable));
}

#[tokio::test]
async fn archive_without_executable_restores_previous_binary() {
    let feed = spawn_feed().await;
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), &feed);
    put_binary(&vm, Channel::Stable, b"old-engine");
    let mut rx = vm.subscribe();

    let err = vm
        .download_and_install(&release(&feed, "hollow.zip"), Channel::Stable)
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::InstallFailure(_)));
    assert_eq!(std::fs::read(vm.binary_path(Channel::Stable)).unwrap(), b"old-engine");
    assert!(matches!(common::drain(&mut rx).last(), Some(InstallEvent::Failed { .. })));
}

#[tokio::test]
async fn failed_download_leaves_binary_untouched() {
    let feed = spawn_feed().await;
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), &feed);
    put_binary(&vm, Channel::Stable, b"old-engine");

    let err = vm
        .download_and_install(&release(&feed, "missing.zip"), Channel::Stable)
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::DownloadFailure(_)));
    assert_eq!(std::fs::read(vm.binary_path(Channel::Stable)).unwrap(), b"old-engine");
    assert!(!vm.can_rollback(Channel::Stable));
}

#[tokio::test]
async fn rollback_without_backup_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), "http://127.0.0.1:1/");

    let err = vm.rollback(Channel::Alpha).await.unwrap_err();

    assert!(matches!(err, ControlError::NotFound(_)));
}

#[tokio::test]
async fn clear_cache_reports_freed_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), "http://127.0.0.1:1/");
    let cache = dir.path().join("cache");
    std::fs::create_dir_all(cache.join("extract-old")).unwrap();
    std::fs::write(cache.join("stale.zip"), vec![0u8; 300]).unwrap();
    std::fs::write(cache.join("extract-old").join("sing-box"), vec![0u8; 200]).unwrap();
    std::fs::write(dir.path().join("cache.db"), vec![0u8; 24]).unwrap();

    let freed = vm.clear_cache().await;

    assert_eq!(freed, 524);
    assert!(cache.exists());
    assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 0);
    assert!(!dir.path().join("cache.db").exists());
}

#[tokio::test]
async fn clear_cache_on_missing_dirs_is_zero() {
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), "http://127.0.0.1:1/");

    assert_eq!(vm.clear_cache().await, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn local_version_comes_from_the_binary() {
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), "http://127.0.0.1:1/");
    assert!(vm.get_local_version(Channel::Stable).await.is_none());

    common::write_script(
        &vm.binary_path(Channel::Stable),
        "echo 'sing-box version 1.10.1'\necho ''\necho 'Environment: go1.22.5 linux/amd64'",
    );
    let version = vm.get_local_version(Channel::Stable).await.unwrap();
    assert_eq!(version.version, "1.10.1");
    assert_eq!(version.channel, Channel::Stable);
    assert!(version.raw_version_output.starts_with("sing-box version"));

    common::write_script(&vm.binary_path(Channel::Alpha), "echo garbage");
    assert!(vm.get_local_version(Channel::Alpha).await.is_none());
}

#[tokio::test]
async fn rollback_after_a_failed_upgrade_keeps_the_last_good_binary() {
    let feed = spawn_feed().await;
    let dir = tempfile::tempdir().unwrap();
    let vm = manager(dir.path(), &feed);
    put_binary(&vm, Channel::Stable, b"old-engine");

    vm.download_and_install(&release(&feed, "good.zip"), Channel::Stable).await.unwrap();
    let err = vm
        .download_and_install(&release(&feed, "hollow.zip"), Channel::Stable)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InstallFailure(_)));

    // The failed attempt backed up the binary it was about to replace.
    assert_eq!(std::fs::read(vm.binary_path(Channel::Stable)).unwrap(), b"new-engine");
    assert!(vm.can_rollback(Channel::Stable));

    vm.rollback(Channel::Stable).await.unwrap();

    assert_eq!(std::fs::read(vm.binary_path(Channel::Stable)).unwrap(), b"new-engine");
    assert!(!vm.can_rollback(Channel::Stable));
}
