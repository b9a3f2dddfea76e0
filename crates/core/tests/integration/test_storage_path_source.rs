//! Integration tests for the file-system storage path source
//!
//! Each test builds a version tree in a temp directory and observes the
//! aspired-versions callback through a channel.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use modelserve_core::sources::{
    aspired_versions_channel, AspiredVersionsCallback, AspiredVersionsMessage,
    FileSystemStoragePathSource, FileSystemStoragePathSourceConfig, ServableToMonitor,
    ServableVersionPolicy,
};
use modelserve_core::{AspiredVersion, Error};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tempfile::TempDir;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn version_tree(children: &[&str]) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    for child in children {
        fs::create_dir(dir.path().join(child)).expect("Failed to create child");
    }
    dir
}

/// Config that never polls in the background; tests drive `poll_now`
fn manual_config(servables: &[(&str, &Path)]) -> FileSystemStoragePathSourceConfig {
    servables.iter().fold(
        FileSystemStoragePathSourceConfig::new().with_poll_wait_seconds(-1),
        |config, (name, path)| config.with_servable(ServableToMonitor::new(*name, *path)),
    )
}

fn versions_of(message: &AspiredVersionsMessage) -> Vec<u64> {
    message.versions.iter().map(AspiredVersion::version).collect()
}

fn expect_message(rx: &Receiver<AspiredVersionsMessage>) -> AspiredVersionsMessage {
    rx.recv_timeout(RECV_TIMEOUT)
        .expect("Expected an aspired-versions notification")
}

#[test]
fn test_aspires_largest_numeric_version() {
    let dir = version_tree(&["1", "2", "abc", "10"]);
    let source = FileSystemStoragePathSource::create(manual_config(&[("foo", dir.path())]))
        .expect("Failed to create source");
    let (callback, rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    source.poll_now();
    let message = expect_message(&rx);
    assert_eq!(message.servable_name, "foo");
    assert_eq!(
        message.versions,
        vec![AspiredVersion::new("foo", 10, dir.path().join("10"))]
    );
}

#[test]
fn test_no_numeric_children_aspires_nothing() {
    let dir = version_tree(&["abc", "v2"]);
    let source =
        FileSystemStoragePathSource::create(manual_config(&[("foo", dir.path())])).unwrap();
    let (callback, rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    source.poll_now();
    assert!(expect_message(&rx).versions.is_empty());
}

#[test]
fn test_missing_base_path_skips_notification() {
    let dir = version_tree(&["3"]);
    let missing = dir.path().join("not-there");
    let source = FileSystemStoragePathSource::create(manual_config(&[
        ("gone", missing.as_path()),
        ("foo", dir.path()),
    ]))
    .unwrap();
    let (callback, rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    source.poll_now();
    let message = expect_message(&rx);
    assert_eq!(message.servable_name, "foo");
    assert!(rx.try_recv().is_err(), "No notification for a missing base path");
}

#[test]
fn test_zero_poll_wait_polls_once_in_background() {
    let dir = version_tree(&["4"]);
    let config = FileSystemStoragePathSourceConfig::new()
        .with_poll_wait_seconds(0)
        .with_servable(ServableToMonitor::new("foo", dir.path()));
    let source = FileSystemStoragePathSource::create(config).unwrap();
    let (callback, rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    assert_eq!(versions_of(&expect_message(&rx)), vec![4]);
    assert!(source.is_polling_started());
    assert!(matches!(
        rx.recv_timeout(Duration::from_millis(300)),
        Err(RecvTimeoutError::Timeout)
    ));
}

#[test]
fn test_periodic_polling_stops_on_shutdown() {
    let dir = version_tree(&["1"]);
    let config = FileSystemStoragePathSourceConfig::new()
        .with_poll_wait_seconds(1)
        .with_servable(ServableToMonitor::new("foo", dir.path()));
    let source = FileSystemStoragePathSource::create(config).unwrap();
    let (callback, rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    assert_eq!(versions_of(&expect_message(&rx)), vec![1]);
    fs::create_dir(dir.path().join("2")).unwrap();
    assert_eq!(versions_of(&expect_message(&rx)), vec![2]);

    source.shutdown();
    while rx.try_recv().is_ok() {}
    assert!(matches!(
        rx.recv_timeout(Duration::from_millis(1500)),
        Err(RecvTimeoutError::Timeout)
    ));

    source.poll_now();
    assert!(rx.try_recv().is_err(), "No delivery after shutdown");
}

#[test]
fn test_removed_servable_is_unaspired_before_update_returns() {
    let foo = version_tree(&["1"]);
    let bar = version_tree(&["7"]);
    let source = FileSystemStoragePathSource::create(manual_config(&[
        ("foo", foo.path()),
        ("bar", bar.path()),
    ]))
    .unwrap();
    let (callback, rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    source
        .update_config(manual_config(&[("bar", bar.path())]))
        .expect("Update should succeed");

    let message = rx.try_recv().expect("Unaspire must be delivered synchronously");
    assert_eq!(message.servable_name, "foo");
    assert!(message.versions.is_empty());

    source.poll_now();
    let message = expect_message(&rx);
    assert_eq!(message.servable_name, "bar");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_changing_poll_period_after_callback_fails() {
    let dir = version_tree(&["1"]);
    let config = manual_config(&[("foo", dir.path())]);
    let source = FileSystemStoragePathSource::create(config.clone()).unwrap();

    // Before a callback is registered the period may change freely.
    source
        .update_config(config.clone().with_poll_wait_seconds(-5))
        .unwrap();

    let (callback, _rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    let err = source
        .update_config(config.with_poll_wait_seconds(30))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(err.is_configuration_error());
    assert_eq!(source.config().file_system_poll_wait_seconds, -5);
}

#[test]
fn test_fail_if_zero_versions_at_startup() {
    let empty = version_tree(&["not-a-version"]);
    let mut config = manual_config(&[("foo", empty.path())]);
    config.fail_if_zero_versions_at_startup = true;

    let result = FileSystemStoragePathSource::create(config);
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn test_versions_always_present_suppresses_empty_update() {
    let dir = version_tree(&["1"]);
    let mut config = manual_config(&[("foo", dir.path())]);
    config.servable_versions_always_present = true;
    let source = FileSystemStoragePathSource::create(config).unwrap();
    let (callback, rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    source.poll_now();
    assert_eq!(versions_of(&expect_message(&rx)), vec![1]);

    fs::remove_dir(dir.path().join("1")).unwrap();
    source.poll_now();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_version_policies() {
    let dir = version_tree(&["1", "2", "3"]);
    let config = FileSystemStoragePathSourceConfig::new()
        .with_poll_wait_seconds(-1)
        .with_servable(
            ServableToMonitor::new("all", dir.path())
                .with_version_policy(ServableVersionPolicy::All),
        )
        .with_servable(
            ServableToMonitor::new("pinned", dir.path()).with_version_policy(
                ServableVersionPolicy::Specific {
                    versions: vec![1, 9],
                },
            ),
        );
    let source = FileSystemStoragePathSource::create(config).unwrap();
    let (callback, rx) = aspired_versions_channel(8);
    source.set_aspired_versions_callback(callback).unwrap();

    source.poll_now();
    assert_eq!(versions_of(&expect_message(&rx)), vec![1, 2, 3]);
    assert_eq!(versions_of(&expect_message(&rx)), vec![1]);
}

#[test]
fn test_callback_may_reenter_update_config() {
    let foo = version_tree(&["1"]);
    let bar = version_tree(&["2"]);
    let source = Arc::new(
        FileSystemStoragePathSource::create(manual_config(&[
            ("foo", foo.path()),
            ("bar", bar.path()),
        ]))
        .unwrap(),
    );

    let handle: Arc<OnceLock<Weak<FileSystemStoragePathSource>>> = Arc::new(OnceLock::new());
    let seen: Arc<Mutex<Vec<(String, Vec<u64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let only_bar = manual_config(&[("bar", bar.path())]);

    let callback: AspiredVersionsCallback = {
        let handle = Arc::clone(&handle);
        let seen = Arc::clone(&seen);
        Arc::new(move |name: &str, versions: Vec<AspiredVersion>| {
            let first_foo = name == "foo" && !versions.is_empty();
            seen.lock()
                .unwrap()
                .push((name.to_string(), versions.iter().map(|v| v.version()).collect()));
            if first_foo {
                let source = handle.get().and_then(Weak::upgrade).expect("source alive");
                source
                    .update_config(only_bar.clone())
                    .expect("Re-entrant update should succeed");
            }
        })
    };
    handle.set(Arc::downgrade(&source)).unwrap();
    source.set_aspired_versions_callback(callback).unwrap();

    source.poll_now();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("foo".to_string(), vec![1]),
            ("foo".to_string(), vec![]),
            ("bar".to_string(), vec![2]),
        ]
    );
    assert!(!source.config().contains("foo"));
}
