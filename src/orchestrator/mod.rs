mod auth;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::thread::JoinHandle;

use chrono::{DateTime, Local};
use serde::Serialize;

pub use self::auth::{AuthFlow, AuthStep, CredentialPrompt, FetchOutcome, NoPrompt};

use crate::autostart::AutostartBackend;
use crate::credential::SecretBackend;
use crate::engine::{EngineEvent, ProcessSupervisor};
use crate::error::{Error, Result};
use crate::fetch::{ConfigFetcher, ConfigSource};
use crate::import::parse_import_argument;
use crate::inspector;
use crate::jsonc;
use crate::paths::AppPaths;
use crate::runtime_config::RuntimeConfigBuilder;
use crate::settings::{write_atomic, InboundMode, Settings, SettingsStore};
use crate::system_proxy::{SystemProxyBackend, SystemProxyController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Warning {
    #[error("could not read the proxy inbound: {0}")]
    ProxyDetectFailed(String),
    #[error("could not enable the system proxy: {0}")]
    ProxyEnableFailed(String),
    #[error("could not restore the system proxy: {0}")]
    ProxyRestoreFailed(String),
    #[error("could not reconnect with the previous config: {0}")]
    ReconnectFailed(String),
}

impl Warning {
    pub fn tag(&self) -> &'static str {
        match self {
            Warning::ProxyDetectFailed(_) => "PROXY_DETECT_FAILED",
            Warning::ProxyEnableFailed(_) => "PROXY_ENABLE_FAILED",
            Warning::ProxyRestoreFailed(_) => "PROXY_RESTORE_FAILED",
            Warning::ReconnectFailed(_) => "RECONNECT_FAILED",
        }
    }
}

pub trait StatusNotifier: Send + Sync {
    fn state_changed(&self, _state: ConnectionState) {}
    fn warning(&self, _warning: &Warning) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl StatusNotifier for NoopNotifier {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(PathBuf),
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub inbound_mode: InboundMode,
    pub running: bool,
    pub pid: Option<u32>,
    pub config_url: Option<String>,
    pub last_config_path: Option<String>,
    pub last_updated_at: Option<DateTime<Local>>,
    pub auto_start: bool,
    pub system_proxy_managed: bool,
    pub log_path: String,
}

pub struct Collaborators {
    pub fetcher: Box<dyn ConfigFetcher>,
    pub secrets: Box<dyn SecretBackend>,
    pub settings: Box<dyn SettingsStore>,
    pub autostart: Box<dyn AutostartBackend>,
    pub proxy_backend: Box<dyn SystemProxyBackend>,
    pub prompt: Box<dyn CredentialPrompt>,
    pub notifier: Arc<dyn StatusNotifier>,
}

struct Session {
    proxy: SystemProxyController,
    fetcher: Box<dyn ConfigFetcher>,
    secrets: Box<dyn SecretBackend>,
    store: Box<dyn SettingsStore>,
    autostart: Box<dyn AutostartBackend>,
    prompt: Box<dyn CredentialPrompt>,
    settings: Settings,
}

pub struct ConnectionOrchestrator {
    paths: AppPaths,
    builder: RuntimeConfigBuilder,
    supervisor: ProcessSupervisor,
    session: Mutex<Session>,
    notifier: Arc<dyn StatusNotifier>,
    events: Mutex<Option<Receiver<EngineEvent>>>,
    // Lock-free mirrors read by `status()`.
    state: RwLock<ConnectionState>,
    settings: RwLock<Settings>,
    proxy_managed: AtomicBool,
}

impl ConnectionOrchestrator {
    pub fn new(paths: AppPaths, collaborators: Collaborators) -> Self {
        let (sender, receiver) = mpsc::channel();
        let supervisor = ProcessSupervisor::new(
            paths.engine_binary(),
            paths.install_dir(),
            paths.engine_log_file(),
            sender,
        );
        let builder = RuntimeConfigBuilder::new(paths.engine_log_file());
        let settings = collaborators.settings.load();

        Self {
            paths,
            builder,
            supervisor,
            session: Mutex::new(Session {
                proxy: SystemProxyController::new(collaborators.proxy_backend),
                fetcher: collaborators.fetcher,
                secrets: collaborators.secrets,
                store: collaborators.settings,
                autostart: collaborators.autostart,
                prompt: collaborators.prompt,
                settings: settings.clone(),
            }),
            notifier: collaborators.notifier,
            events: Mutex::new(Some(receiver)),
            state: RwLock::new(ConnectionState::Disconnected),
            settings: RwLock::new(settings),
            proxy_managed: AtomicBool::new(false),
        }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn status(&self) -> ConnectionStatus {
        let settings = self.settings();
        ConnectionStatus {
            state: self.state(),
            inbound_mode: settings.inbound_mode,
            running: self.supervisor.is_running(),
            pid: self.supervisor.pid(),
            config_url: settings.config_url,
            last_config_path: settings.last_config_path,
            last_updated_at: settings.last_updated_at,
            auto_start: settings.auto_start,
            system_proxy_managed: self.proxy_managed.load(Ordering::SeqCst),
            log_path: self.supervisor.log_path().display().to_string(),
        }
    }

    pub fn connect(&self) -> Result<()> {
        let mut session = self.begin()?;
        self.connect_locked(&mut session)
    }

    pub fn disconnect(&self) -> Result<()> {
        let mut session = self.begin()?;
        self.disconnect_locked(&mut session)
    }

    pub fn toggle(&self) -> Result<()> {
        let mut session = self.begin()?;
        if self.supervisor.is_running() {
            self.disconnect_locked(&mut session)
        } else {
            self.connect_locked(&mut session)
        }
    }

    /// A running connection is stopped for the download and brought back
    /// afterwards, with the old config if the update failed.
    pub fn update_config(&self, input: &str) -> Result<UpdateOutcome> {
        let mut session = self.begin()?;
        let source_text = parse_import_argument(input).unwrap_or_else(|| input.trim().to_string());
        let source = ConfigSource::parse(&source_text)?;

        let was_running = self.supervisor.is_running();
        if was_running {
            if let Err(error) = self.disconnect_locked(&mut session) {
                self.warn(Warning::ProxyRestoreFailed(error.to_string()));
            }
        }

        tracing::info!(target: "orchestrator", source = %source, "updating config");
        let fetched = AuthFlow::new(
            session.fetcher.as_ref(),
            session.secrets.as_ref(),
            session.prompt.as_ref(),
        )
        .run(&source);
        let result = match fetched {
            Ok(FetchOutcome::Fetched(bytes)) => self
                .install_config(&mut session, &source_text, &bytes)
                .map(UpdateOutcome::Updated),
            Ok(FetchOutcome::Cancelled) => Ok(UpdateOutcome::Cancelled),
            Err(error) => Err(error),
        };

        if was_running {
            if let Err(reconnect) = self.connect_locked(&mut session) {
                match &result {
                    Ok(_) => return Err(reconnect),
                    Err(_) => self.warn(Warning::ReconnectFailed(reconnect.to_string())),
                }
            }
        }
        if let Err(error) = &result {
            tracing::warn!(target: "orchestrator", %error, "config update failed");
        }
        result
    }

    pub fn switch_inbound_mode(&self, mode: InboundMode) -> Result<()> {
        let mut session = self.begin()?;
        let running = self.supervisor.is_running();
        if session.settings.inbound_mode != mode {
            self.save_settings(&mut session, |settings| settings.inbound_mode = mode)?;
            tracing::info!(target: "orchestrator", mode = mode.as_str(), "inbound mode changed");

            if running {
                if let Err(error) = self.disconnect_locked(&mut session) {
                    self.warn(Warning::ProxyRestoreFailed(error.to_string()));
                }
                return self.connect_locked(&mut session);
            }
        }
        // A snapshot left behind by a failed restore is retried even when the
        // mode is already Tun.
        if mode == InboundMode::Tun && !running {
            self.restore_proxy(&mut session)?;
        }
        Ok(())
    }

    /// The setting only changes when the registrar agrees.
    pub fn set_autostart(&self, enabled: bool, executable: &Path) -> Result<()> {
        let mut session = self.begin()?;
        let accepted = if enabled {
            session.autostart.enable(executable)
        } else {
            session.autostart.disable()
        };
        if !accepted {
            let action = if enabled { "registration" } else { "removal" };
            return Err(Error::Autostart(format!("{action} was refused")));
        }
        self.save_settings(&mut session, |settings| settings.auto_start = enabled)
    }

    pub fn reconcile_autostart(&self, executable: &Path) -> Result<bool> {
        let mut session = self.begin()?;
        if !session.settings.auto_start {
            return Ok(false);
        }
        if session.autostart.enable(executable) {
            return Ok(true);
        }
        tracing::warn!(target: "autostart", "autostart registration refused, turning setting off");
        self.save_settings(&mut session, |settings| settings.auto_start = false)?;
        Ok(false)
    }

    /// Events from an engine run that was since stopped or replaced are
    /// ignored.
    pub fn handle_engine_event(&self, event: EngineEvent) {
        let mut session = self.lock_session();
        if event.generation != self.supervisor.generation() || self.supervisor.is_running() {
            tracing::debug!(target: "orchestrator", generation = event.generation, "stale engine event ignored");
            return;
        }
        tracing::warn!(target: "orchestrator", code = ?event.code, "engine exited, tearing down connection");
        self.restore_or_warn(&mut session);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Only the first call spawns a thread.
    pub fn spawn_event_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let orchestrator = Arc::downgrade(self);
        Some(std::thread::spawn(move || {
            for event in events {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    return;
                };
                orchestrator.handle_engine_event(event);
            }
        }))
    }

    /// Waits for an in-flight operation instead of failing with `Busy`.
    pub fn shutdown(&self) {
        let mut session = self.lock_session();
        self.supervisor.stop();
        if let Err(error) = self.restore_proxy(&mut session) {
            tracing::warn!(target: "orchestrator", %error, "system proxy restore failed during shutdown");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn begin(&self) -> Result<MutexGuard<'_, Session>> {
        match self.session.try_lock() {
            Ok(session) => Ok(session),
            Err(TryLockError::WouldBlock) => Err(Error::Busy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_locked(&self, session: &mut Session) -> Result<()> {
        if self.supervisor.is_running() {
            self.set_state(ConnectionState::Connected);
            return Ok(());
        }
        let source = self.active_config(&session.settings).ok_or(Error::NoConfigAvailable)?;

        self.set_state(ConnectionState::Connecting);
        match self.start_engine(session, &source) {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                tracing::info!(target: "orchestrator", mode = session.settings.inbound_mode.as_str(), "connected");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(target: "orchestrator", %error, "connect failed");
                self.restore_or_warn(session);
                self.set_state(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    fn start_engine(&self, session: &mut Session, source: &Path) -> Result<()> {
        let runtime = self.paths.runtime_config_file();
        let mode = session.settings.inbound_mode;
        self.builder.build(source, mode, &runtime)?;

        match mode {
            InboundMode::Proxy => self.apply_system_proxy(session, &runtime),
            InboundMode::Tun => self.restore_or_warn(session),
        }
        self.supervisor.start(&runtime)
    }

    fn apply_system_proxy(&self, session: &mut Session, runtime: &Path) {
        match inspector::inspect(runtime) {
            Ok(Some(proxy)) => {
                if let Err(error) = session.proxy.enable(&proxy.host, proxy.port) {
                    self.warn(Warning::ProxyEnableFailed(error.to_string()));
                }
                self.sync_proxy_flag(session);
            }
            Ok(None) => self.restore_or_warn(session),
            Err(error) => {
                self.warn(Warning::ProxyDetectFailed(error.to_string()));
                self.restore_or_warn(session);
            }
        }
    }

    fn disconnect_locked(&self, session: &mut Session) -> Result<()> {
        self.set_state(ConnectionState::Disconnecting);
        self.supervisor.stop();
        let restored = self.restore_proxy(session);
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(target: "orchestrator", "disconnected");
        restored
    }

    fn restore_proxy(&self, session: &mut Session) -> Result<()> {
        let restored = session.proxy.restore();
        self.sync_proxy_flag(session);
        restored
    }

    fn restore_or_warn(&self, session: &mut Session) {
        if let Err(error) = self.restore_proxy(session) {
            self.warn(Warning::ProxyRestoreFailed(error.to_string()));
        }
    }

    fn sync_proxy_flag(&self, session: &Session) {
        self.proxy_managed
            .store(session.proxy.is_managed(), Ordering::SeqCst);
    }

    fn active_config(&self, settings: &Settings) -> Option<PathBuf> {
        let path = settings
            .last_config_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.paths.config_file());
        path.is_file().then_some(path)
    }

    fn install_config(&self, session: &mut Session, source: &str, bytes: &[u8]) -> Result<PathBuf> {
        jsonc::parse_bytes(bytes)?;
        let path = self.paths.config_file();
        write_atomic(&path, bytes)?;
        let stored = path.display().to_string();
        self.save_settings(session, |settings| {
            settings.config_url = Some(source.to_string());
            settings.last_config_path = Some(stored);
            settings.last_updated_at = Some(Local::now());
        })?;
        tracing::info!(target: "orchestrator", path = %path.display(), "config updated");
        Ok(path)
    }

    /// The in-memory settings change only after the save succeeded.
    fn save_settings(&self, session: &mut Session, change: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut next = session.settings.clone();
        change(&mut next);
        session.store.save(&next)?;
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        session.settings = next;
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state == next {
                return;
            }
            *state = next;
        }
        tracing::debug!(target: "orchestrator", state = ?next, "state changed");
        self.notifier.state_changed(next);
    }

    fn warn(&self, warning: Warning) {
        tracing::warn!(target: "orchestrator", tag = warning.tag(), "{warning}");
        self.notifier.warning(&warning);
    }
}
