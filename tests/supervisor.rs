#![cfg(unix)]

mod common;

use std::fs;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use common::{wait_until, write_file, LONG_RUNNING};
use oniboxcore_lib::engine::{read_log_tail, EngineEvent, ProcessSupervisor};
use oniboxcore_lib::Error;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    supervisor: ProcessSupervisor,
    events: mpsc::Receiver<EngineEvent>,
}

impl Fixture {
    fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("run"), script);
        write_file(&dir.path().join("runtime-config.json"), "{}");
        let (sender, events) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(
            "/bin/sh",
            dir.path(),
            dir.path().join("logs/singbox.log"),
            sender,
        );
        Self {
            dir,
            supervisor,
            events,
        }
    }

    fn config(&self) -> std::path::PathBuf {
        self.dir.path().join("runtime-config.json")
    }

    fn log(&self) -> String {
        fs::read_to_string(self.supervisor.log_path()).unwrap_or_default()
    }
}

#[test]
fn start_captures_output_and_stop_is_solicited() {
    let fixture = Fixture::new(LONG_RUNNING);
    fixture.supervisor.start(&fixture.config()).unwrap();
    assert!(fixture.supervisor.is_running());
    let pid = fixture.supervisor.pid();
    assert!(pid.is_some());

    // starting again keeps the same process
    fixture.supervisor.start(&fixture.config()).unwrap();
    assert_eq!(fixture.supervisor.pid(), pid);

    assert!(wait_until(Duration::from_secs(3), || {
        let log = fixture.log();
        log.contains("[STDOUT] sing-box started -c") && log.contains("[STDERR] warming up")
    }));

    let started = Instant::now();
    fixture.supervisor.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!fixture.supervisor.is_running());
    assert_eq!(fixture.supervisor.pid(), None);

    let log = fixture.log();
    assert!(log.contains("[INFO] Starting sing-box."));
    assert!(log.contains("[INFO] sing-box stopped."));
    assert!(fixture.events.recv_timeout(Duration::from_millis(600)).is_err());

    fixture.supervisor.stop();
}

#[test]
fn engine_ignoring_sigterm_is_killed() {
    let fixture = Fixture::new("trap '' TERM\necho ready\nwhile :; do sleep 0.1; done\n");
    fixture.supervisor.start(&fixture.config()).unwrap();
    assert!(wait_until(Duration::from_secs(3), || fixture.log().contains("ready")));

    fixture.supervisor.stop();
    assert!(!fixture.supervisor.is_running());
    assert!(fixture.log().contains("Force killing sing-box process."));
}

#[test]
fn unexpected_exit_is_reported_once() {
    let fixture = Fixture::new("sleep 0.2\nexit 7\n");
    fixture.supervisor.start(&fixture.config()).unwrap();
    let generation = fixture.supervisor.generation();

    let event = fixture.events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        event,
        EngineEvent {
            generation,
            code: Some(7),
        }
    );
    assert!(!fixture.supervisor.is_running());
    assert!(fixture.events.recv_timeout(Duration::from_millis(600)).is_err());

    let tail = read_log_tail(fixture.supervisor.log_path(), 1).unwrap();
    assert_eq!(tail.len(), 1);
    assert!(tail[0].ends_with("[INFO] sing-box exited. ExitCode=7"));
}

#[test]
fn start_validates_config_and_binary() {
    let fixture = Fixture::new(LONG_RUNNING);
    let err = fixture
        .supervisor
        .start(&fixture.dir.path().join("absent.json"))
        .unwrap_err();
    assert!(matches!(err, Error::ConfigMissing(_)));

    let (sender, _events) = mpsc::channel();
    let missing = ProcessSupervisor::new(
        fixture.dir.path().join("sing-box"),
        fixture.dir.path(),
        fixture.dir.path().join("singbox.log"),
        sender,
    );
    let err = missing.start(&fixture.config()).unwrap_err();
    assert!(matches!(err, Error::EngineBinaryMissing(_)));
    assert!(!missing.is_running());
}

#[test]
fn unlaunchable_binary_is_launch_failure() {
    let fixture = Fixture::new(LONG_RUNNING);
    // a file without the execute bit
    let binary = write_file(&fixture.dir.path().join("sing-box"), "not a program");
    let (sender, _events) = mpsc::channel();
    let supervisor = ProcessSupervisor::new(
        binary,
        fixture.dir.path(),
        fixture.dir.path().join("singbox.log"),
        sender,
    );
    let err = supervisor.start(&fixture.config()).unwrap_err();
    assert!(matches!(err, Error::LaunchFailed(_)));
    let log = fs::read_to_string(fixture.dir.path().join("singbox.log")).unwrap();
    assert!(log.contains("[ERROR] Failed to start sing-box"));
}
