//! Shared harness: a daemon per test with its own data dir and port, using
//! the stub engine.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

const CONDUCTOR_ENV: &[&str] = &[
    "CONDUCTOR_DATA_DIR",
    "CONDUCTOR_CONFIG",
    "CONDUCTOR_DAEMON_HOST",
    "CONDUCTOR_DAEMON_PORT",
    "CONDUCTOR_ENGINE_BIN",
    "CONDUCTOR_ENGINE_HOST",
    "CONDUCTOR_ENGINE_PORT",
    "CONDUCTOR_TOKEN",
    "CONDUCTOR_IDLE_DISPOSE_AFTER",
];

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn stub_engine() -> &'static str {
    env!("CARGO_BIN_EXE_conductor-engine-stub")
}

/// A `conductor` invocation with a clean environment.
pub fn conductor() -> Command {
    let mut cmd = Command::cargo_bin("conductor").unwrap();
    for key in CONDUCTOR_ENV {
        cmd.env_remove(key);
    }
    cmd.env("RUST_LOG", "warn");
    cmd.timeout(Duration::from_secs(60));
    cmd
}

pub fn parse_stdout(output: &std::process::Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {stdout:?}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

pub struct TestDaemon {
    pub root: TempDir,
    pub data_dir: PathBuf,
    pub port: u16,
    stopped: bool,
}

impl TestDaemon {
    pub fn start() -> Self {
        Self::start_with(&[])
    }

    pub fn start_with(extra: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let data_dir = root.path().join("data");
        let port = free_port();
        let daemon = Self {
            root,
            data_dir,
            port,
            stopped: false,
        };

        let output = daemon
            .cmd()
            .args(["daemon", "start", "--engine-bin", stub_engine()])
            .args(extra)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "daemon start failed: {}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let body = parse_stdout(&output);
        assert_eq!(body["started"], true);
        daemon
    }

    /// `conductor --json` pointed at this daemon.
    pub fn cmd(&self) -> Command {
        let mut cmd = conductor();
        cmd.arg("--json")
            .arg("--data-dir")
            .arg(&self.data_dir)
            .arg("--daemon-port")
            .arg(self.port.to_string());
        cmd
    }

    /// Run a command that must succeed and return its JSON body.
    pub fn ok(&self, args: &[&str]) -> Value {
        let output = self.cmd().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "{:?} failed: {}\n{}",
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        parse_stdout(&output)
    }

    /// Run a command that must fail and return its JSON error body.
    pub fn fail(&self, args: &[&str]) -> Value {
        let output = self.cmd().args(args).output().unwrap();
        assert_eq!(output.status.code(), Some(1), "{:?} should fail", args);
        let body = parse_stdout(&output);
        assert!(body["error"].is_string(), "missing error key: {body}");
        body
    }

    /// Create a directory under the test root and return its canonical path.
    pub fn workspace_dir(&self, name: &str) -> PathBuf {
        let dir = self.root.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::canonicalize(dir).unwrap()
    }

    pub fn add(&self, dir: &Path) -> String {
        let body = self.ok(&["workspace", "add", dir.to_str().unwrap()]);
        body["workspace"]["id"].as_str().unwrap().to_string()
    }

    /// Wait for the engine to be up and return its pid.
    pub fn engine_pid(&self) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let status = self.ok(&["daemon", "status"]);
            if status["engineRunning"] == true {
                return status["engine"]["pid"].as_u64().unwrap();
            }
            assert!(Instant::now() < deadline, "engine never came up: {status}");
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let body = self.ok(&["daemon", "stop"]);
        assert_eq!(body["stopped"], true);
        self.wait_for_exit();
    }

    /// The port closes before the daemon clears its record and releases its
    /// lock; wait for the record so a restart does not race the old process.
    pub fn wait_for_exit(&self) {
        let state_path = self.data_dir.join("conductor-state.json");
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let cleared = std::fs::read_to_string(&state_path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .map(|state| state.get("daemon").is_none())
                .unwrap_or(false);
            if cleared {
                std::thread::sleep(Duration::from_millis(200));
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("daemon record was never cleared");
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.cmd().args(["daemon", "stop"]).output();
        }
    }
}
