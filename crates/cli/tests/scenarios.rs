mod common;

use std::time::{Duration, Instant};

use common::TestDaemon;

#[test]
fn scenario_switching_workspaces_keeps_one_engine() {
    let daemon = TestDaemon::start();
    let ws_a = daemon.workspace_dir("ws-a");
    let ws_b = daemon.workspace_dir("ws-b");
    let id_a = daemon.add(&ws_a);
    let id_b = daemon.add(&ws_b);

    let pid = daemon.engine_pid();

    let path_a = daemon.ok(&["workspace", "path", &id_a]);
    let path_b = daemon.ok(&["workspace", "path", &id_b]);

    assert_eq!(daemon.engine_pid(), pid);
    assert_eq!(path_a["path"]["directory"], ws_a.to_str().unwrap());
    assert_eq!(path_b["path"]["directory"], ws_b.to_str().unwrap());
}

#[test]
fn scenario_dispose_then_path_recreates_instance() {
    let daemon = TestDaemon::start();
    let ws_a = daemon.workspace_dir("ws-a");
    let id_a = daemon.add(&ws_a);
    daemon.ok(&["workspace", "path", &id_a]);

    let disposed = daemon.ok(&["instance", "dispose", &id_a]);
    assert_eq!(disposed["disposed"], true);
    assert_eq!(disposed["id"], id_a.as_str());

    let again = daemon.ok(&["workspace", "path", &id_a]);
    assert_eq!(again["path"]["directory"], ws_a.to_str().unwrap());
}

#[test]
fn scenario_status_after_stop_fails_fast_with_json() {
    let mut daemon = TestDaemon::start();
    daemon.stop();

    let started = Instant::now();
    let body = daemon.fail(&["daemon", "status"]);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(body["error"].as_str().unwrap().contains("no daemon running"));
}
