use std::sync::Arc;

use engine_core::sysproxy::default_bypass_list;
use engine_core::sysproxy::store::{KEY_PROXY_ENABLE, KEY_PROXY_OVERRIDE, KEY_PROXY_SERVER};
use engine_core::{ControlError, MemorySettingsStore, SettingsStore, SystemProxyCoordinator};

fn coordinator() -> (Arc<MemorySettingsStore>, SystemProxyCoordinator) {
    let store = Arc::new(MemorySettingsStore::new());
    let coord = SystemProxyCoordinator::new(store.clone(), default_bypass_list());
    (store, coord)
}

/// A store whose every operation fails.
struct BrokenStore;

impl SettingsStore for BrokenStore {
    fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        anyhow::bail!("registry unavailable")
    }
    fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
        anyhow::bail!("registry unavailable")
    }
    fn delete(&self, _key: &str) -> anyhow::Result<()> {
        anyhow::bail!("registry unavailable")
    }
    fn notify_changed(&self) -> anyhow::Result<()> {
        anyhow::bail!("registry unavailable")
    }
}

#[test]
fn enable_writes_all_three_settings() {
    let (store, coord) = coordinator();

    coord.enable("127.0.0.1", 2080).unwrap();

    let values = store.snapshot();
    assert_eq!(values[KEY_PROXY_ENABLE], "1");
    assert_eq!(values[KEY_PROXY_SERVER], "127.0.0.1:2080");
    assert_eq!(values[KEY_PROXY_OVERRIDE], "localhost;127.*;10.*;172.16-31.*;192.168.*;<local>");
    assert_eq!(store.notifications(), 1);

    let status = coord.status();
    assert!(status.enabled);
    assert_eq!(status.server_host, "127.0.0.1");
    assert_eq!(status.server_port, 2080);
}

#[test]
fn enable_is_idempotent() {
    let (store, coord) = coordinator();

    coord.enable("127.0.0.1", 7890).unwrap();
    let after_first = store.snapshot();
    coord.enable("127.0.0.1", 7890).unwrap();

    assert_eq!(store.snapshot(), after_first);
}

#[test]
fn disable_clears_flag_and_server() {
    let (store, coord) = coordinator();
    coord.enable("10.0.0.5", 1080).unwrap();

    coord.disable().unwrap();

    assert_eq!(store.get(KEY_PROXY_ENABLE).unwrap().as_deref(), Some("0"));
    assert_eq!(store.get(KEY_PROXY_SERVER).unwrap(), None);
    let status = coord.status();
    assert!(!status.enabled);
    assert_eq!((status.server_host.as_str(), status.server_port), ("127.0.0.1", 7890));
}

#[test]
fn unparsable_server_falls_back_to_default() {
    let (store, coord) = coordinator();
    store.set(KEY_PROXY_ENABLE, "1").unwrap();
    store.set(KEY_PROXY_SERVER, "socks=proxy").unwrap();
    store.set(KEY_PROXY_OVERRIDE, "intranet.local; *.corp").unwrap();

    let status = coord.status();

    assert!(status.enabled);
    assert_eq!(status.server_port, 7890);
    assert_eq!(status.bypass_list, vec!["intranet.local", "*.corp"]);
}

#[test]
fn notification_failure_is_not_fatal() {
    let (store, coord) = coordinator();
    store.set_fail_notify(true);

    coord.enable("127.0.0.1", 7890).unwrap();
    coord.disable().unwrap();

    assert_eq!(store.notifications(), 0);
}

#[test]
fn unreadable_store_reports_disabled_defaults() {
    let coord = SystemProxyCoordinator::new(Arc::new(BrokenStore), default_bypass_list());

    let status = coord.status();
    assert!(!status.enabled);
    assert_eq!(status.server_port, 7890);
    assert_eq!(status.bypass_list, default_bypass_list());

    assert!(matches!(coord.enable("127.0.0.1", 7890), Err(ControlError::Settings(_))));
}
