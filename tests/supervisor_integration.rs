//! End-to-end supervisor tests using a shell script in place of the java
//! runtime. The script echoes stdin lines back to stdout and exits when it
//! receives `stop`, which exercises the real spawn / relay / graceful-stop
//! paths without a JVM.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use tempfile::TempDir;

use mcsm_core::config::GlobalConfig;
use mcsm_core::detector;
use mcsm_core::supervisor::{ServerEvent, Supervisor};

const FAKE_JAVA: &str = "#!/bin/sh\n\
echo \"server starting\"\n\
while IFS= read -r line; do\n\
    if [ \"$line\" = \"stop\" ]; then\n\
        echo \"server stopping\"\n\
        exit 0\n\
    fi\n\
    echo \"$line\"\n\
done\n";

struct Fixture {
    _root: TempDir,
    supervisor: Supervisor,
    id: String,
    server_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    fixture_with_script(FAKE_JAVA)
}

fn fixture_with_script(script: &str) -> Fixture {
    let root = TempDir::new().unwrap();
    let servers_dir = root.path().join("servers");
    let server_dir = servers_dir.join("alpha");
    fs::create_dir_all(&server_dir).unwrap();
    fs::write(server_dir.join("server.jar"), b"jar").unwrap();
    fs::write(server_dir.join("server.properties"), "level-name=world\n").unwrap();

    let java = root.path().join("fake-java");
    fs::write(&java, script).unwrap();
    let mut perms = fs::metadata(&java).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&java, perms).unwrap();

    let config = GlobalConfig {
        servers_dir: servers_dir.to_string_lossy().into_owned(),
        java_path: java.to_string_lossy().into_owned(),
        ..GlobalConfig::default()
    };
    let id = detector::server_id(&server_dir).unwrap();
    Fixture {
        _root: root,
        supervisor: Supervisor::new(config),
        id,
        server_dir,
    }
}

/// Wait until the fake server's greeting line has landed in the buffer.
async fn wait_for_startup(supervisor: &Supervisor, id: &str) {
    for _ in 0..50 {
        let status = supervisor.status(id).await.unwrap();
        if !status.console.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("server never produced output");
}

#[tokio::test]
async fn test_start_twice_yields_single_entry() {
    let f = fixture();
    assert!(f.supervisor.start(&f.id).await);
    // second start fails and changes nothing
    assert!(!f.supervisor.start(&f.id).await);

    let status = f.supervisor.status(&f.id).await.unwrap();
    assert!(status.running);
    assert_eq!(status.name, "alpha");

    assert!(f.supervisor.stop(&f.id).await);
    assert!(!f.supervisor.is_running(&f.id).await);
}

#[tokio::test]
async fn test_graceful_stop_emits_one_notice() {
    let f = fixture();
    let mut events = f.supervisor.subscribe_events();

    assert!(f.supervisor.start(&f.id).await);
    wait_for_startup(&f.supervisor, &f.id).await;
    assert!(f.supervisor.stop(&f.id).await);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no termination notice")
        .unwrap();
    assert_eq!(event, ServerEvent::Stopped { id: f.id.clone() });

    // exactly one notice, even though stop() raced the exit watcher
    assert!(
        tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_self_exit_removes_entry() {
    let f = fixture();
    let mut events = f.supervisor.subscribe_events();

    assert!(f.supervisor.start(&f.id).await);
    wait_for_startup(&f.supervisor, &f.id).await;

    // the process exits on its own; the exit watcher must clean up
    assert!(f.supervisor.send_command(&f.id, "stop").await);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no termination notice")
        .unwrap();
    assert_eq!(event, ServerEvent::Stopped { id: f.id.clone() });
    assert!(!f.supervisor.is_running(&f.id).await);

    let status = f.supervisor.status(&f.id).await.unwrap();
    assert!(!status.running);
    assert_eq!(status.uptime, 0);
}

#[tokio::test]
async fn test_console_replay_then_live() {
    let f = fixture();
    assert!(f.supervisor.start(&f.id).await);
    wait_for_startup(&f.supervisor, &f.id).await;

    let attach = f.supervisor.attach_console(&f.id).await.unwrap();
    assert_eq!(attach.replay, vec!["server starting"]);
    let mut rx = attach.live.expect("running server has a live stream");

    // live lines follow the replay with no duplicates
    assert!(f.supervisor.send_command(&f.id, "say hello").await);
    let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no live line")
        .unwrap();
    assert_eq!(line, "say hello");

    assert!(f.supervisor.stop(&f.id).await);
    // the buffered output survives the process; only the live stream ends
    let attach = f.supervisor.attach_console(&f.id).await.unwrap();
    assert!(attach.live.is_none());
    assert!(attach.replay.contains(&"say hello".to_string()));
}

#[tokio::test]
async fn test_status_reports_recent_console_and_uptime() {
    let f = fixture();
    assert!(f.supervisor.start(&f.id).await);
    wait_for_startup(&f.supervisor, &f.id).await;

    for i in 0..25 {
        assert!(f.supervisor.send_command(&f.id, &format!("line {}", i)).await);
    }
    // let the relay drain the echoes
    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = f.supervisor.status(&f.id).await.unwrap();
    assert!(status.running);
    assert!(status.uptime < 60);
    // capped at the last 20 lines, newest last
    assert_eq!(status.console.len(), 20);
    assert_eq!(status.console.last().map(String::as_str), Some("line 24"));

    assert!(f.supervisor.stop(&f.id).await);
}

#[tokio::test]
async fn test_properties_write_rejected_while_running() {
    let f = fixture();
    assert!(f.supervisor.start(&f.id).await);

    let props_path = f.server_dir.join("server.properties");
    let sidecar_path = f.server_dir.join("mcsm_info.json");
    let props_before = fs::read_to_string(&props_path).unwrap();
    // start() already recorded last_started in the sidecar
    let sidecar_before = fs::read_to_string(&sidecar_path).unwrap();

    let mut patch = std::collections::HashMap::new();
    patch.insert("difficulty".to_string(), "hard".to_string());
    patch.insert("memory".to_string(), "4G".to_string());
    assert!(!f.supervisor.write_properties(&f.id, patch.clone()).await);

    // both files untouched by the refused write
    assert_eq!(fs::read_to_string(&props_path).unwrap(), props_before);
    assert_eq!(fs::read_to_string(&sidecar_path).unwrap(), sidecar_before);

    assert!(f.supervisor.stop(&f.id).await);
    assert!(f.supervisor.write_properties(&f.id, patch).await);

    let props = f.supervisor.read_properties(&f.id).unwrap();
    assert_eq!(props["difficulty"], "hard");
    assert_eq!(props["memory"], "4G");
}

#[tokio::test]
async fn test_console_history_survives_stop() {
    let f = fixture();
    assert!(f.supervisor.start(&f.id).await);
    wait_for_startup(&f.supervisor, &f.id).await;
    assert!(f.supervisor.send_command(&f.id, "final words").await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(f.supervisor.stop(&f.id).await);

    // status still serves the last output after the process is gone
    let status = f.supervisor.status(&f.id).await.unwrap();
    assert!(!status.running);
    assert!(status.console.contains(&"final words".to_string()));

    // a restart begins with a fresh buffer
    assert!(f.supervisor.start(&f.id).await);
    wait_for_startup(&f.supervisor, &f.id).await;
    let status = f.supervisor.status(&f.id).await.unwrap();
    assert!(!status.console.contains(&"final words".to_string()));
    assert!(f.supervisor.stop(&f.id).await);
}

#[tokio::test]
async fn test_concurrent_starts_single_winner() {
    let f = fixture();
    let (a, b) = tokio::join!(f.supervisor.start(&f.id), f.supervisor.start(&f.id));
    assert!(a != b, "exactly one of two simultaneous starts may win");
    assert!(f.supervisor.is_running(&f.id).await);
    assert!(f.supervisor.stop(&f.id).await);
}

#[tokio::test]
async fn test_send_command_fails_when_stdin_closed() {
    // the script drops its stdin immediately, so every injected command
    // must be reported as a failed write rather than a silent success
    let f = fixture_with_script(
        "#!/bin/sh\n\
         exec 0<&-\n\
         echo \"stdin closed\"\n\
         sleep 30\n",
    );
    assert!(f.supervisor.start(&f.id).await);
    wait_for_startup(&f.supervisor, &f.id).await;

    assert!(!f.supervisor.send_command(&f.id, "say hi").await);

    // stop cannot deliver `stop` either; it falls back to killing the
    // process and reports the failure while still cleaning up
    assert!(!f.supervisor.stop(&f.id).await);
    assert!(!f.supervisor.is_running(&f.id).await);
}

#[tokio::test]
async fn test_start_records_last_started() {
    let f = fixture();
    assert!(f.supervisor.start(&f.id).await);

    let props = f.supervisor.read_properties(&f.id).unwrap();
    assert!(props.contains_key("memory"));

    let metadata = mcsm_core::properties::read_metadata(&f.server_dir);
    assert!(metadata.last_started.unwrap() > 0);

    assert!(f.supervisor.stop(&f.id).await);
}
