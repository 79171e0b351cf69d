use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn accord_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_accord"))
}

fn accord_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(accord_bin());
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

struct DaemonProcess {
    child: Child,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(home: &Path) -> Self {
        let child = accord_cmd(home)
            .args(["daemon", "run"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self {
            child,
            home: home.to_path_buf(),
        }
    }

    fn stop(&mut self) {
        let _ = accord_cmd(&self.home).args(["daemon", "stop"]).status();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn daemon_running(home: &Path) -> bool {
    let Ok(output) = accord_cmd(home).args(["daemon", "status"]).output() else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(&output.stdout)
        .ok()
        .and_then(|v| v.get("running").and_then(|r| r.as_bool()))
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn submitted_change_is_repaired_by_the_daemon() {
    let home = TempDir::new().expect("home");
    let spec = home.path().join("specs").join("SPEC-1.md");
    fs::create_dir_all(spec.parent().unwrap()).expect("mkdir specs");
    fs::write(
        &spec,
        r#"---
id: SPEC-1
title: Login
status: active
type: feature
priority: high
tasks:
  - id: T1
    title: Form
    status: in_progress
    assigned_agent: alice
    updated: "2026-01-01T10:00:00Z"
---
# Login
"#,
    )
    .expect("write spec");

    let mut daemon = DaemonProcess::start(home.path());
    assert!(
        wait_until(Duration::from_secs(10), || daemon_running(home.path())),
        "daemon did not report running state in time",
    );

    accord_cmd(home.path())
        .args([
            "change",
            "--file",
            spec.to_str().unwrap(),
            "--source",
            "document",
            "--spec",
            "SPEC-1",
            "--task",
            "T1",
            "--field",
            "assigned_agent=alice",
        ])
        .assert()
        .success()
        .stdout(contains("change submitted"));

    let assignments = home.path().join(".accord/state/assignments.json");
    let repaired = wait_until(Duration::from_secs(10), || {
        fs::read_to_string(&assignments)
            .map(|content| content.contains("alice"))
            .unwrap_or(false)
    });
    assert!(repaired, "daemon did not write the assignment record in time");

    accord_cmd(home.path())
        .args(["tickets", "--json"])
        .assert()
        .success()
        .stdout(contains("[]"));
    accord_cmd(home.path())
        .args(["dead-letters"])
        .assert()
        .success()
        .stdout(contains("empty"));
    accord_cmd(home.path())
        .args(["replay"])
        .assert()
        .success()
        .stdout(contains("nothing to replay"));
    accord_cmd(home.path())
        .args(["resolve", "no-such-ticket", "--dismiss"])
        .assert()
        .failure()
        .stderr(contains("no-such-ticket"));

    daemon.stop();
    assert!(
        wait_until(Duration::from_secs(5), || !daemon_running(home.path())),
        "daemon still reports running after stop",
    );
}
