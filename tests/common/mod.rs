//! Shared fixtures for the scenario tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use oniboxcore_lib::autostart::AutostartBackend;
use oniboxcore_lib::credential::{Credential, MemorySecretStore};
use oniboxcore_lib::fetch::{ConfigFetcher, ConfigSource};
use oniboxcore_lib::orchestrator::CredentialPrompt;
use oniboxcore_lib::settings::JsonSettingsStore;
use oniboxcore_lib::system_proxy::{MemoryProxyBackend, ProxySnapshot};
use oniboxcore_lib::{
    AppPaths, Collaborators, ConnectionOrchestrator, ConnectionState, Error, Result,
    StatusNotifier, Warning,
};
use tempfile::TempDir;

pub const SUBSCRIPTION: &str = "https://sub.example.com/c.json";
pub const SUBSCRIPTION_TARGET: &str = "https://sub.example.com:443";

/// Source config with both inbounds, comments and a trailing comma.
pub const SOURCE_CONFIG: &str = r#"{
  // downloaded profile
  "log": { "level": "info" },
  "inbounds": [
    { "type": "mixed", "tag": "mixed-in", "listen": "0.0.0.0", "listen_port": 7890 },
    { "type": "tun", "tag": "tun-in", "address": ["172.19.0.1/30"], "auto_route": true },
  ],
  "outbounds": [{ "type": "direct", "tag": "direct" }],
  "experimental": { "cache_file": { "enabled": true, "path": "~/old/place/cache.db" } }
}"#;

/// Engine script that stays up until signalled.
pub const LONG_RUNNING: &str = "echo \"sing-box started $*\"\necho \"warming up\" >&2\nexec sleep 30\n";

pub fn write_file(path: &Path, contents: &str) -> PathBuf {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).unwrap();
    }
    fs::write(path, contents).unwrap();
    path.to_path_buf()
}

/// Points the engine binary at `/bin/sh`, which runs `<install>/run` with the
/// engine arguments.
pub fn shell_engine_paths(root: &Path, script: &str) -> AppPaths {
    let install = root.join("install");
    write_file(&install.join("run"), script);
    AppPaths::new(root.join("data"), install).with_engine_binary("/bin/sh")
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    done()
}

#[derive(Default)]
struct FetcherInner {
    body: Vec<u8>,
    basic: Option<Credential>,
    fail: bool,
    calls: Vec<Option<Credential>>,
}

/// Serves one body, optionally behind Basic auth.
#[derive(Clone, Default)]
pub struct FakeFetcher {
    inner: Arc<Mutex<FetcherInner>>,
}

impl FakeFetcher {
    pub fn serving(body: &str) -> Self {
        let fetcher = Self::default();
        fetcher.inner.lock().unwrap().body = body.as_bytes().to_vec();
        fetcher
    }

    pub fn require_basic(&self, credential: Credential) {
        self.inner.lock().unwrap().basic = Some(credential);
    }

    pub fn set_failing(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }

    pub fn set_body(&self, body: &str) {
        self.inner.lock().unwrap().body = body.as_bytes().to_vec();
    }

    pub fn calls(&self) -> Vec<Option<Credential>> {
        self.inner.lock().unwrap().calls.clone()
    }
}

impl ConfigFetcher for FakeFetcher {
    fn fetch(&self, source: &ConfigSource, credential: Option<&Credential>) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(credential.cloned());
        if inner.fail {
            return Err(Error::Transport("connection refused".into()));
        }
        let origin = source.auth_target().unwrap_or_default();
        match (&inner.basic, credential) {
            (None, _) => Ok(inner.body.clone()),
            (Some(_), None) => Err(Error::AuthRequired(origin)),
            (Some(accepted), Some(given)) if accepted == given => Ok(inner.body.clone()),
            (Some(_), Some(_)) => Err(Error::AuthInvalid(origin)),
        }
    }
}

/// Answers credential requests from a script; an exhausted script cancels.
#[derive(Clone, Default)]
pub struct ScriptedPrompt {
    answers: Arc<Mutex<VecDeque<Option<Credential>>>>,
    asked: Arc<Mutex<Vec<(String, bool)>>>,
}

impl ScriptedPrompt {
    pub fn answering(answers: Vec<Option<Credential>>) -> Self {
        let prompt = Self::default();
        *prompt.answers.lock().unwrap() = answers.into();
        prompt
    }

    pub fn asked(&self) -> Vec<(String, bool)> {
        self.asked.lock().unwrap().clone()
    }
}

impl CredentialPrompt for ScriptedPrompt {
    fn request(&self, origin: &str, rejected: bool) -> Option<Credential> {
        self.asked.lock().unwrap().push((origin.to_string(), rejected));
        self.answers.lock().unwrap().pop_front().flatten()
    }
}

#[derive(Clone)]
pub struct FakeAutostart {
    accept: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeAutostart {
    pub fn accepting(accept: bool) -> Self {
        Self {
            accept: Arc::new(AtomicBool::new(accept)),
            calls: Arc::default(),
        }
    }

    pub fn set_accepting(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl AutostartBackend for FakeAutostart {
    fn enable(&self, executable: &Path) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push(format!("enable {}", executable.display()));
        self.accept.load(Ordering::SeqCst)
    }

    fn disable(&self) -> bool {
        self.calls.lock().unwrap().push("disable".into());
        self.accept.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    states: Mutex<Vec<ConnectionState>>,
    warnings: Mutex<Vec<Warning>>,
}

impl RecordingNotifier {
    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.states.lock().unwrap().clear();
        self.warnings.lock().unwrap().clear();
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings.lock().unwrap().clone()
    }
}

impl StatusNotifier for RecordingNotifier {
    fn state_changed(&self, state: ConnectionState) {
        self.states.lock().unwrap().push(state);
    }

    fn warning(&self, warning: &Warning) {
        self.warnings.lock().unwrap().push(warning.clone());
    }
}

/// An orchestrator wired to in-memory collaborators, with handles kept for
/// inspection.
pub struct Harness {
    pub dir: TempDir,
    pub orchestrator: Arc<ConnectionOrchestrator>,
    pub fetcher: FakeFetcher,
    pub prompt: ScriptedPrompt,
    pub secrets: MemorySecretStore,
    pub proxy: MemoryProxyBackend,
    pub autostart: FakeAutostart,
    pub notifier: Arc<RecordingNotifier>,
}

pub struct HarnessBuilder {
    script: String,
    fetcher: FakeFetcher,
    prompt: ScriptedPrompt,
    secrets: MemorySecretStore,
    proxy: MemoryProxyBackend,
    autostart: FakeAutostart,
    engine_binary: Option<PathBuf>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            script: LONG_RUNNING.to_string(),
            fetcher: FakeFetcher::serving(SOURCE_CONFIG),
            prompt: ScriptedPrompt::default(),
            secrets: MemorySecretStore::new(),
            proxy: MemoryProxyBackend::with_state(original_proxy_state()),
            autostart: FakeAutostart::accepting(true),
            engine_binary: None,
        }
    }
}

impl HarnessBuilder {
    pub fn script(mut self, script: &str) -> Self {
        self.script = script.to_string();
        self
    }

    pub fn prompt(mut self, prompt: ScriptedPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn engine_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.engine_binary = Some(binary.into());
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = shell_engine_paths(dir.path(), &self.script);
        if let Some(binary) = self.engine_binary {
            paths = paths.with_engine_binary(binary);
        }
        let notifier = Arc::new(RecordingNotifier::default());
        let collaborators = Collaborators {
            fetcher: Box::new(self.fetcher.clone()),
            secrets: Box::new(self.secrets.clone()),
            settings: Box::new(JsonSettingsStore::new(paths.settings_file())),
            autostart: Box::new(self.autostart.clone()),
            proxy_backend: Box::new(self.proxy.clone()),
            prompt: Box::new(self.prompt.clone()),
            notifier: notifier.clone(),
        };
        let orchestrator = Arc::new(ConnectionOrchestrator::new(paths, collaborators));
        orchestrator.spawn_event_loop();
        Harness {
            dir,
            orchestrator,
            fetcher: self.fetcher,
            prompt: self.prompt,
            secrets: self.secrets,
            proxy: self.proxy,
            autostart: self.autostart,
            notifier,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        HarnessBuilder::default().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn settings_store(&self) -> JsonSettingsStore {
        JsonSettingsStore::new(self.orchestrator.paths().settings_file())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.orchestrator.shutdown();
    }
}

/// A user proxy that existed before the app touched anything.
pub fn original_proxy_state() -> ProxySnapshot {
    ProxySnapshot {
        proxy_enable: Some(0),
        proxy_server: Some("corp-proxy:3128".into()),
    }
}
