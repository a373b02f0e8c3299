#![cfg(unix)]

use std::{
    fs,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tempfile::tempdir;

const DAEMON: &str = env!("CARGO_BIN_EXE_irrigo-daemon");
const PATIENCE: Duration = Duration::from_secs(10);

fn spawn_daemon(lock: &Path) -> Child {
    Command::new(DAEMON)
        .arg("--lock-file")
        .arg(lock)
        .arg("run")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

fn wait_for_marker(lock: &Path, pid: u32) {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if fs::read_to_string(lock).is_ok_and(|c| c == pid.to_string()) {
            // handlers are installed right after the marker is written
            thread::sleep(Duration::from_millis(250));
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("daemon {pid} never wrote {}", lock.display());
}

fn wait_exit(child: &mut Child) -> ExitStatus {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        thread::sleep(Duration::from_millis(20));
    }
    child.kill().unwrap();
    panic!("daemon did not exit in time");
}

fn signal(child: &Child, sig: Signal) {
    kill(Pid::from_raw(i32::try_from(child.id()).unwrap()), sig).unwrap();
}

fn assert_singleton_cycle(sig: Signal) {
    let dir = tempdir().unwrap();
    let lock = dir.path().join("daemon.pid");

    let mut first = spawn_daemon(&lock);
    wait_for_marker(&lock, first.id());

    let mut second = spawn_daemon(&lock);
    let refused = wait_exit(&mut second);
    assert_eq!(refused.code(), Some(1));
    assert_eq!(fs::read_to_string(&lock).unwrap(), first.id().to_string());

    let status = Command::new(DAEMON)
        .arg("--lock-file")
        .arg(&lock)
        .arg("status")
        .stdout(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());

    signal(&first, sig);
    let stopped = wait_exit(&mut first);
    assert!(stopped.success(), "first instance exited with {stopped}");
    assert!(!lock.exists());

    let mut third = spawn_daemon(&lock);
    wait_for_marker(&lock, third.id());
    signal(&third, Signal::SIGTERM);
    assert!(wait_exit(&mut third).success());
}

#[test]
fn sigterm_releases_lock_for_next_instance() {
    assert_singleton_cycle(Signal::SIGTERM);
}

#[test]
fn sigint_releases_lock_for_next_instance() {
    assert_singleton_cycle(Signal::SIGINT);
}

#[test]
fn status_reports_not_running_without_marker() {
    let dir = tempdir().unwrap();
    let status = Command::new(DAEMON)
        .arg("--lock-file")
        .arg(dir.path().join("daemon.pid"))
        .arg("status")
        .stdout(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn closing_stdin_ends_the_service_and_cleans_up() {
    let dir = tempdir().unwrap();
    let lock = dir.path().join("daemon.pid");
    let mut daemon = spawn_daemon(&lock);
    wait_for_marker(&lock, daemon.id());
    drop(daemon.stdin.take());
    assert!(wait_exit(&mut daemon).success());
    assert!(!lock.exists());
}

#[test]
fn events_file_records_the_stop_before_exit() {
    let dir = tempdir().unwrap();
    let lock = dir.path().join("daemon.pid");
    let events = dir.path().join("events.jsonl");
    let config = dir.path().join("daemon.toml");
    fs::write(
        &config,
        format!(
            "lock_path = {:?}\nevents_path = {:?}\nconsole_log = false\n",
            lock.display().to_string(),
            events.display().to_string(),
        ),
    )
    .unwrap();

    for _ in 0..5 {
        let _ = fs::remove_file(&events);
        let mut daemon = Command::new(DAEMON)
            .arg("--config")
            .arg(&config)
            .arg("run")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        wait_for_marker(&lock, daemon.id());
        drop(daemon.stdin.take());
        assert!(wait_exit(&mut daemon).success());

        let recorded = fs::read_to_string(&events).unwrap();
        assert!(recorded.contains("daemon.started"), "{recorded}");
        assert!(recorded.contains("daemon.stopped"), "{recorded}");
    }
}
