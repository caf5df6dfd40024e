//! Integration tests for the named child-process group.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stagehand::process::{ProcessGroup, STDOUT_FILENAME};
use stagehand::supervisor::Supervisor;
use stagehand::AppError;

const GRACE: Duration = Duration::from_millis(200);

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("stat").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let group = ProcessGroup::new(Supervisor::new(), GRACE);

    group
        .add("synth", "/bin/true", &[], dir.path())
        .await
        .expect("first add");
    let err = group
        .add("synth", "/bin/true", &[], dir.path())
        .await
        .expect_err("second add under the same name must fail");
    assert!(matches!(err, AppError::AlreadyExists(_)));

    group.wait().await.expect("both processes exit cleanly");
}

#[tokio::test]
async fn output_paths_for_unknown_name_is_not_found() {
    let group = ProcessGroup::new(Supervisor::new(), GRACE);
    let err = group
        .output_paths("ghost")
        .await
        .expect_err("never-added name");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn stdout_is_captured_into_the_sink_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "talker.sh", "echo hello from the child");
    let group = ProcessGroup::new(Supervisor::new(), GRACE);

    group
        .add("talker", script.to_str().expect("utf8 path"), &[], dir.path())
        .await
        .expect("add");
    group.wait().await.expect("clean exit");

    let captured =
        std::fs::read_to_string(dir.path().join(STDOUT_FILENAME)).expect("read capture");
    assert!(captured.contains("hello from the child"));
}

#[tokio::test]
async fn injected_environment_reaches_the_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "env.sh", "echo url=$STAGEHAND_URL");
    let group = ProcessGroup::new(Supervisor::new(), GRACE);

    let env = vec![("STAGEHAND_URL".to_owned(), "127.0.0.1:7777".to_owned())];
    group
        .add("env", script.to_str().expect("utf8 path"), &env, dir.path())
        .await
        .expect("add");
    group.wait().await.expect("clean exit");

    let captured =
        std::fs::read_to_string(dir.path().join(STDOUT_FILENAME)).expect("read capture");
    assert!(captured.contains("url=127.0.0.1:7777"));
}

#[tokio::test]
async fn wait_aggregates_non_clean_exits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ok_dir = dir.path().join("ok");
    let bad_dir = dir.path().join("bad");
    std::fs::create_dir_all(&ok_dir).expect("mkdir");
    std::fs::create_dir_all(&bad_dir).expect("mkdir");
    let failing = write_script(dir.path(), "fail.sh", "exit 3");
    let group = ProcessGroup::new(Supervisor::new(), GRACE);

    group.add("ok", "/bin/true", &[], &ok_dir).await.expect("add ok");
    group
        .add("bad", failing.to_str().expect("utf8 path"), &[], &bad_dir)
        .await
        .expect("add bad");

    let err = group.wait().await.expect_err("one child failed");
    assert!(matches!(err, AppError::Process(_)));
    let text = err.to_string();
    assert!(text.contains("bad"));
    assert!(text.contains("exited with code 3"));
    assert!(!text.contains("ok:"), "clean exits are not reported: {text}");
}

#[tokio::test]
async fn failing_output_sink_trips_the_supervisor() {
    if !Path::new("/dev/full").exists() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    // Route the stdout sink at a device whose writes always fail.
    std::os::unix::fs::symlink("/dev/full", dir.path().join(STDOUT_FILENAME))
        .expect("symlink");
    let script = write_script(dir.path(), "talker.sh", "echo overflow");
    let supervisor = Supervisor::new();
    let group = ProcessGroup::new(supervisor.clone(), GRACE);

    group
        .add("talker", script.to_str().expect("utf8 path"), &[], dir.path())
        .await
        .expect("add");

    tokio::time::timeout(Duration::from_secs(5), supervisor.cancelled())
        .await
        .expect("copy failure must cancel the scope");
    let err = supervisor.take_error().expect("copy failure recorded");
    assert!(matches!(err, AppError::Io(_)));
    assert!(err.to_string().contains("stdout"));

    let _ = group.wait().await;
}

#[tokio::test]
async fn has_running_tracks_liveness_and_cancellation_reaps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "sleeper.sh", "sleep 10");
    let supervisor = Supervisor::new();
    let group = ProcessGroup::new(supervisor.clone(), GRACE);

    group
        .add("sleeper", script.to_str().expect("utf8 path"), &[], dir.path())
        .await
        .expect("add");
    assert!(group.has_running().await);

    supervisor.shutdown();
    // The sleeper outlives the grace period and is force-killed.
    let err = group.wait().await.expect_err("killed child is a failure");
    assert!(matches!(err, AppError::Process(_)));
    assert!(err.to_string().contains("terminated by signal"));
    assert!(!group.has_running().await);
}
