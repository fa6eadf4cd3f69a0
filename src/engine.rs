use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

use crate::error::{Error, Result};

#[cfg(target_os = "windows")]
use std::os::windows::io::AsRawHandle;
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
#[cfg(target_os = "windows")]
use windows_sys::Win32::Foundation::CloseHandle;
#[cfg(target_os = "windows")]
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};

#[cfg(target_os = "windows")]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x08000000;

pub const LOG_MAX_BYTES: u64 = 8 * 1024 * 1024;
pub const LOG_KEEP_BYTES: u64 = 6 * 1024 * 1024;
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const MONITOR_INTERVAL: Duration = Duration::from_millis(250);
const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineEvent {
    /// Watch token of the engine run that exited.
    pub generation: u64,
    pub code: Option<i32>,
}

#[derive(Debug)]
pub struct EngineLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EngineLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, level: &str, message: &str) {
        let line = format!(
            "{} [{level}] {message}\n",
            chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false)
        );
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = file.write_all(line.as_bytes());
    }

    pub fn info(&self, message: &str) {
        self.write("INFO", message);
    }

    pub fn error(&self, message: &str) {
        self.write("ERROR", message);
    }
}

#[cfg(target_os = "windows")]
#[derive(Debug)]
struct JobHandle(isize);

#[cfg(target_os = "windows")]
impl Drop for JobHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

#[cfg(target_os = "windows")]
fn create_job_object() -> std::io::Result<JobHandle> {
    let handle = unsafe { CreateJobObjectW(std::ptr::null_mut(), std::ptr::null()) };
    if handle == 0 {
        return Err(std::io::Error::last_os_error());
    }
    let job = JobHandle(handle);
    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
    info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
    let result = unsafe {
        SetInformationJobObject(
            job.0,
            JobObjectExtendedLimitInformation,
            &mut info as *mut _ as *mut _,
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if result == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(job)
}

#[derive(Default)]
struct EngineState {
    child: Option<Child>,
    log: Option<Arc<EngineLog>>,
    watch_token: u64,
    #[cfg(target_os = "windows")]
    job: Option<JobHandle>,
}

type SharedState = Arc<Mutex<EngineState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An exit not requested through [`ProcessSupervisor::stop`] is reported once
/// on the event channel.
pub struct ProcessSupervisor {
    binary: PathBuf,
    working_dir: PathBuf,
    log_path: PathBuf,
    events: Sender<EngineEvent>,
    state: SharedState,
}

impl ProcessSupervisor {
    pub fn new(
        binary: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        events: Sender<EngineEvent>,
    ) -> Self {
        Self {
            binary: binary.into(),
            working_dir: working_dir.into(),
            log_path: log_path.into(),
            events,
            state: SharedState::default(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn start(&self, config_path: &Path) -> Result<()> {
        let mut guard = lock(&self.state);
        if is_alive(&mut guard) {
            return Ok(());
        }
        guard.child = None;

        if !config_path.is_file() {
            return Err(Error::config_missing(config_path));
        }
        if !self.binary.is_file() {
            return Err(Error::EngineBinaryMissing(self.binary.display().to_string()));
        }

        if let Err(error) = trim_log_file(&self.log_path, LOG_KEEP_BYTES, LOG_MAX_BYTES) {
            tracing::warn!(target: "engine", %error, "engine log trim failed");
        }
        let log = Arc::new(EngineLog::open(&self.log_path)?);
        log.info("Starting sing-box.");
        log.info(&format!("Config: {}", config_path.display()));

        let mut cmd = Command::new(&self.binary);
        cmd.arg("run")
            .arg("-c")
            .arg(config_path)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| {
            log.error(&format!("Failed to start sing-box: {e}"));
            Error::LaunchFailed(e.to_string())
        })?;

        #[cfg(target_os = "windows")]
        {
            if guard.job.is_none() {
                match create_job_object() {
                    Ok(job) => guard.job = Some(job),
                    Err(error) => tracing::warn!(target: "engine", %error, "job object unavailable"),
                }
            }
            if let Some(job) = guard.job.as_ref() {
                let _ = unsafe { AssignProcessToJobObject(job.0, child.as_raw_handle() as isize) };
            }
        }

        spawn_output_readers(&log, child.stdout.take(), child.stderr.take());

        let pid = child.id();
        guard.watch_token = guard.watch_token.wrapping_add(1);
        let token = guard.watch_token;
        guard.child = Some(child);
        guard.log = Some(log.clone());
        drop(guard);

        tracing::info!(target: "engine", pid, config = %config_path.display(), "engine started");
        spawn_monitor(self.state.clone(), log, self.events.clone(), token);
        Ok(())
    }

    pub fn stop(&self) {
        let (child, log) = {
            let mut guard = lock(&self.state);
            guard.watch_token = guard.watch_token.wrapping_add(1);
            (guard.child.take(), guard.log.take())
        };
        let Some(mut child) = child else {
            return;
        };
        let pid = child.id();
        let note = |message: &str| {
            if let Some(log) = log.as_ref() {
                log.info(message);
            }
        };
        note("Stopping sing-box.");

        if !matches!(child.try_wait(), Ok(Some(_))) {
            request_shutdown(pid);
            if !wait_with_timeout(&mut child, STOP_TIMEOUT) {
                note("Force killing sing-box process.");
                tracing::warn!(target: "engine", pid, "engine ignored shutdown request, killing");
                kill_descendants(pid);
                let _ = child.kill();
                wait_with_timeout(&mut child, STOP_TIMEOUT);
            }
        }
        note("sing-box stopped.");
        tracing::info!(target: "engine", pid, "engine stopped");
    }

    pub fn is_running(&self) -> bool {
        is_alive(&mut lock(&self.state))
    }

    pub fn pid(&self) -> Option<u32> {
        let mut guard = lock(&self.state);
        if is_alive(&mut guard) {
            guard.child.as_ref().map(Child::id)
        } else {
            None
        }
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).watch_token
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_alive(state: &mut EngineState) -> bool {
    state
        .child
        .as_mut()
        .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
}

fn spawn_monitor(state: SharedState, log: Arc<EngineLog>, events: Sender<EngineEvent>, token: u64) {
    std::thread::spawn(move || loop {
        std::thread::sleep(MONITOR_INTERVAL);
        let code = {
            let mut guard = lock(&state);
            if guard.watch_token != token {
                return;
            }
            let Some(child) = guard.child.as_mut() else {
                return;
            };
            let code = match child.try_wait() {
                Ok(Some(status)) => status.code(),
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(target: "engine", %error, "engine wait failed");
                    Some(-1)
                }
            };
            guard.child = None;
            guard.log = None;
            code
        };
        log.info(&format!(
            "sing-box exited. ExitCode={}",
            code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        ));
        tracing::warn!(target: "engine", code = ?code, "engine exited unexpectedly");
        let _ = events.send(EngineEvent {
            generation: token,
            code,
        });
        return;
    });
}

fn spawn_output_readers(log: &Arc<EngineLog>, stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) {
    if let Some(stdout) = stdout {
        let log = log.clone();
        std::thread::spawn(move || pump_lines(stdout, &log, "STDOUT"));
    }
    if let Some(stderr) = stderr {
        let log = log.clone();
        std::thread::spawn(move || pump_lines(stderr, &log, "STDERR"));
    }
}

fn pump_lines(stream: impl Read, log: &EngineLog, level: &str) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                log.write(level, line.trim_end_matches(['\r', '\n']));
            }
        }
    }
}

#[cfg(unix)]
fn request_shutdown(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(target_os = "windows")]
fn request_shutdown(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .status();
}

#[cfg(not(any(unix, target_os = "windows")))]
fn request_shutdown(_pid: u32) {}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return true,
            Ok(None) if Instant::now() >= deadline => return false,
            Ok(None) => std::thread::sleep(WAIT_POLL),
        }
    }
}

fn kill_descendants(root: u32) {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    let mut frontier = vec![Pid::from_u32(root)];
    let mut found = Vec::new();
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !found.contains(pid) {
                found.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    for pid in found.iter().rev() {
        if let Some(process) = system.process(*pid) {
            process.kill();
        }
    }
}

pub fn trim_log_file(path: &Path, keep_bytes: u64, max_bytes: u64) -> Result<bool> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(false),
    };
    if len <= max_bytes {
        return Ok(false);
    }
    let start = len.saturating_sub(keep_bytes.min(len));
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut out = OpenOptions::new().write(true).truncate(true).open(path)?;
    out.write_all(&buf)?;
    Ok(true)
}

pub fn read_log_tail(path: &Path, limit: usize) -> Result<Vec<String>> {
    let limit = limit.max(1);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len == 0 {
        return Ok(Vec::new());
    }

    let mut read_size: u64 = 64 * 1024;
    let mut lines: Vec<String> = Vec::new();
    loop {
        let start = file_len.saturating_sub(read_size);
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        lines.clear();
        lines.extend(text.lines().map(str::to_string));
        if lines.len() > limit || start == 0 {
            break;
        }
        read_size = (read_size * 2).min(file_len);
    }

    if lines.len() > limit {
        lines = lines.split_off(lines.len() - limit);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn trim_keeps_tail_only_past_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.log");
        fs::write(&path, b"0123456789").unwrap();
        assert!(!trim_log_file(&path, 4, 10).unwrap());
        assert!(trim_log_file(&path, 4, 8).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"6789");
        assert!(!trim_log_file(&dir.path().join("absent.log"), 4, 8).unwrap());
    }

    #[test]
    fn tail_returns_last_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.log");
        let content: String = (1..=500).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, content).unwrap();
        let tail = read_log_tail(&path, 3).unwrap();
        assert_eq!(tail, ["line 498", "line 499", "line 500"]);
        assert!(read_log_tail(&dir.path().join("absent.log"), 3).unwrap().is_empty());
    }

    #[test]
    fn log_lines_are_timestamped_and_tagged() {
        let dir = TempDir::new().unwrap();
        let log = EngineLog::open(&dir.path().join("logs").join("engine.log")).unwrap();
        log.write("STDERR", "listen failed");
        let text = fs::read_to_string(log.path()).unwrap();
        let (stamp, rest) = text.trim_end().split_once(' ').unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok(), "{stamp}");
        assert_eq!(rest, "[STDERR] listen failed");
    }
}
