//! Real Docker integration tests for the sandbox engine.
//! Run with: cargo test --test docker_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use dockyard_common::Error;
use dockyard_engine::rebalance::{CFS_PERIOD_US, MEMORY_BUDGET_BYTES};
use dockyard_engine::{SandboxManager, Settings, TerminalEvent, TerminalMultiplexer};
use futures::StreamExt;
use serial_test::serial;
use uuid::Uuid;

const TEST_IMAGE: &str = "ubuntu";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_user() -> String {
    // Valid as an in-container account name: starts with a letter, short.
    format!("u{}", &Uuid::new_v4().simple().to_string()[..12])
}

async fn pull_image(docker: &Docker) -> Result<()> {
    let mut pull = docker.create_image(
        Some(CreateImageOptions {
            from_image: TEST_IMAGE,
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(step) = pull.next().await {
        step?;
    }
    Ok(())
}

async fn manager() -> Arc<SandboxManager> {
    init_tracing();
    let docker = Docker::connect_with_defaults().unwrap();
    pull_image(&docker).await.unwrap();
    Arc::new(SandboxManager::new(Arc::new(docker), Settings::default()))
}

async fn cleanup(manager: &SandboxManager, user: &str) {
    for view in manager.list_for_user(user).await.unwrap_or_default() {
        let _ = manager.delete(user, &view.name).await;
    }
}

#[tokio::test]
async fn create_rejects_bad_input_before_engine_io() {
    // No daemon needed: validation fails before any engine call.
    let Ok(docker) = Docker::connect_with_defaults() else {
        return;
    };
    let manager = SandboxManager::new(Arc::new(docker), Settings::default());

    let err = manager.create("alice", TEST_IMAGE, "bad name!").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = manager.create("alice", TEST_IMAGE, "").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = manager.create("alice", "fedora", "dev").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn lifecycle_create_conflict_start_stop_delete() {
    let manager = manager().await;
    let user = test_user();

    let record = manager.create(&user, TEST_IMAGE, "dev").await.unwrap();
    assert_eq!(record.name, "dev");
    assert_eq!(record.user, user);

    // Same logical name for the same user is a conflict; the first
    // container stays resolvable.
    let err = manager.create(&user, TEST_IMAGE, "dev").await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(manager.find_by_name(&user, "dev").await.unwrap().is_some());

    // A different user may reuse the logical name.
    let other = test_user();
    manager.create(&other, TEST_IMAGE, "dev").await.unwrap();

    // Idempotent in both directions.
    manager.start(&user, "dev").await.unwrap();
    manager.stop(&user, "dev").await.unwrap();
    manager.stop(&user, "dev").await.unwrap();
    manager.start(&user, "dev").await.unwrap();

    let views = manager.list_for_user(&user).await.unwrap();
    assert_eq!(views.len(), 1);
    assert!(views[0].running);
    assert!(views[0].last_started.is_some());

    manager.delete(&user, "dev").await.unwrap();
    let err = manager.delete(&user, "dev").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    cleanup(&manager, &other).await;
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn listing_unknown_user_is_empty_success() {
    let manager = manager().await;
    let views = manager.list_for_user(&test_user()).await.unwrap();
    assert!(views.is_empty());
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn rebalancing_splits_the_budget_equally() {
    let manager = manager().await;
    let user = test_user();

    manager.create(&user, TEST_IMAGE, "one").await.unwrap();
    manager.create(&user, TEST_IMAGE, "two").await.unwrap();
    manager.rebalance(&user).await.unwrap();

    for name in ["one", "two"] {
        let summary = manager.find_by_name(&user, name).await.unwrap().unwrap();
        let inspect = manager
            .docker()
            .inspect_container(summary.id.as_deref().unwrap(), None)
            .await
            .unwrap();
        let host = inspect.host_config.unwrap();
        assert_eq!(host.memory, Some(MEMORY_BUDGET_BYTES / 2));
        assert_eq!(host.cpu_quota, Some(CFS_PERIOD_US / 2));
        assert_eq!(host.cpu_period, Some(CFS_PERIOD_US));
    }

    cleanup(&manager, &user).await;
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn file_crud_round_trip() {
    let manager = manager().await;
    let user = test_user();
    manager.create(&user, TEST_IMAGE, "files").await.unwrap();

    manager
        .write_file(&user, "files", "a.txt", "hello")
        .await
        .unwrap();
    let file = manager.read_file(&user, "files", "a.txt").await.unwrap();
    assert_eq!(file.content, "hello");
    assert!(file.mime_type.starts_with("text/"));

    manager.create_folder(&user, "files", "notes").await.unwrap();
    let listing = manager.list_files(&user, "files").await.unwrap();
    assert!(listing.iter().any(|entry| entry == "a.txt"));
    assert!(listing.iter().any(|entry| entry == "notes/"));

    let download = manager
        .download_file(&user, "files", "a.txt")
        .await
        .unwrap();
    assert_eq!(download.filename, "a.txt");
    assert_eq!(download.content_base64, "aGVsbG8=");

    manager.delete_file(&user, "files", "a.txt").await.unwrap();
    let err = manager
        .read_file(&user, "files", "a.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // Removal of a missing path surfaces the command's stderr.
    let err = manager
        .delete_file(&user, "files", "missing.txt")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing.txt"));

    cleanup(&manager, &user).await;
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn terminal_sessions_are_created_once_and_purged_on_disconnect() {
    let manager = manager().await;
    let user = test_user();
    manager.create(&user, TEST_IMAGE, "dev").await.unwrap();

    let mux = TerminalMultiplexer::new(manager.clone());
    let mut events = mux.register_connection("C1");

    mux.send_input("C1", "T1", &user, "dev", b"echo terminal-ready\n")
        .await
        .unwrap();
    assert_eq!(mux.session_count(), 1);

    // Same key reuses the backing process.
    mux.send_input("C1", "T1", &user, "dev", b"pwd\n").await.unwrap();
    assert_eq!(mux.session_count(), 1);

    // A second tab gets its own session.
    mux.send_input("C1", "T2", &user, "dev", b"pwd\n").await.unwrap();
    assert_eq!(mux.session_count(), 2);

    let mut saw_output = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(TerminalEvent::Output { data, .. })) if data.contains("terminal-ready") => {
                saw_output = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_output, "expected echoed shell output");

    mux.disconnect("C1");
    assert_eq!(mux.session_count(), 0);
    // Double disconnect is a no-op.
    mux.disconnect("C1");

    // Input on a dropped connection is a typed stream error.
    let err = mux
        .send_input("C1", "T1", &user, "dev", b"ls\n")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Stream(_)));

    cleanup(&manager, &user).await;
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker"]
async fn terminal_errors_are_events_not_panics() {
    let manager = manager().await;
    let user = test_user();

    let mux = TerminalMultiplexer::new(manager.clone());
    let mut events = mux.register_connection("C9");

    // No such container: the call succeeds, the failure arrives as an
    // error event tagged with the tab.
    mux.send_input("C9", "T1", &user, "ghost", b"ls\n").await.unwrap();
    assert_eq!(mux.session_count(), 0);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        TerminalEvent::Error { tab, message } => {
            assert_eq!(tab, "T1");
            assert!(message.contains("ghost"));
        }
        other => panic!("expected error event, got {other:?}"),
    }
}
