use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Error, Result};

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "windows")]
pub use self::windows::RegistryProxyBackend;

const DEFAULT_PROXY_HOST: &str = "127.0.0.1";

/// Raw OS proxy fields. `None` means the field is absent, and writing a
/// snapshot deletes absent fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySnapshot {
    pub proxy_enable: Option<u32>,
    pub proxy_server: Option<String>,
}

pub trait SystemProxyBackend: Send {
    fn read_state(&self) -> Result<ProxySnapshot>;
    fn write_state(&self, state: &ProxySnapshot) -> Result<()>;
    fn notify_settings_changed(&self) -> Result<()>;
}

pub fn default_backend() -> Box<dyn SystemProxyBackend> {
    #[cfg(target_os = "windows")]
    {
        Box::new(RegistryProxyBackend::new())
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(UnsupportedProxyBackend)
    }
}

/// Holding a snapshot means the OS proxy is managed.
pub struct SystemProxyController {
    backend: Box<dyn SystemProxyBackend>,
    snapshot: Option<ProxySnapshot>,
}

impl SystemProxyController {
    pub fn new(backend: Box<dyn SystemProxyBackend>) -> Self {
        Self {
            backend,
            snapshot: None,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn enable(&mut self, host: &str, port: u16) -> Result<()> {
        let target = build_proxy_server(host, port);

        if self.snapshot.is_some() {
            let live = self.backend.read_state()?;
            if is_current_target(&live, &target) {
                return Ok(());
            }
            // Different listener: the original snapshot stays authoritative.
            self.apply(&target)?;
            tracing::info!(target: "system_proxy", %target, "system proxy retargeted");
            return Ok(());
        }

        let snapshot = self.backend.read_state()?;
        if let Err(error) = self.apply(&target) {
            if let Err(rollback) = self.write_and_notify(&snapshot) {
                tracing::warn!(target: "system_proxy", error = %rollback, "rollback after failed enable failed");
            }
            return Err(error);
        }
        tracing::info!(target: "system_proxy", %target, "system proxy enabled");
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Writes the snapshot back. The snapshot is kept if that fails so a later
    /// restore can retry.
    pub fn restore(&mut self) -> Result<()> {
        let Some(snapshot) = self.snapshot.as_ref() else {
            return Ok(());
        };
        self.write_and_notify(snapshot)?;
        self.snapshot = None;
        tracing::info!(target: "system_proxy", "system proxy restored");
        Ok(())
    }

    fn apply(&self, target: &str) -> Result<()> {
        self.write_and_notify(&ProxySnapshot {
            proxy_enable: Some(1),
            proxy_server: Some(target.to_string()),
        })
    }

    fn write_and_notify(&self, state: &ProxySnapshot) -> Result<()> {
        self.backend.write_state(state)?;
        self.backend.notify_settings_changed()
    }
}

pub fn build_proxy_server(host: &str, port: u16) -> String {
    let host = host.trim();
    let host = if host.is_empty() { DEFAULT_PROXY_HOST } else { host };
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn is_current_target(state: &ProxySnapshot, target: &str) -> bool {
    state.proxy_enable == Some(1)
        && state
            .proxy_server
            .as_deref()
            .is_some_and(|server| proxy_server_matches(server, target))
}

/// Accepts `host:port` or `proto=host:port;proto=host:port`. Every segment
/// must name the target and at least one must exist.
pub fn proxy_server_matches(current: &str, target: &str) -> bool {
    let current = current.trim();
    if current.is_empty() {
        return false;
    }
    if !current.contains('=') {
        return current.eq_ignore_ascii_case(target);
    }

    let mut any = false;
    for segment in current.split(';') {
        let value = match segment.split_once('=') {
            Some((_, value)) => value,
            None => segment,
        }
        .trim();
        if value.is_empty() {
            continue;
        }
        if !value.eq_ignore_ascii_case(target) {
            return false;
        }
        any = true;
    }
    any
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProxyBackend;

impl UnsupportedProxyBackend {
    fn unavailable() -> Error {
        Error::SystemProxyUnavailable(format!(
            "system proxy control is not supported on {}",
            std::env::consts::OS
        ))
    }
}

impl SystemProxyBackend for UnsupportedProxyBackend {
    fn read_state(&self) -> Result<ProxySnapshot> {
        Err(Self::unavailable())
    }

    fn write_state(&self, _state: &ProxySnapshot) -> Result<()> {
        Err(Self::unavailable())
    }

    fn notify_settings_changed(&self) -> Result<()> {
        Err(Self::unavailable())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: ProxySnapshot,
    writes: usize,
    notifications: usize,
    fail_writes: bool,
}

/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryProxyBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryProxyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ProxySnapshot) -> Self {
        let backend = Self::default();
        backend.lock().state = state;
        backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ProxySnapshot {
        self.lock().state.clone()
    }

    /// Changes the live state without counting it as a write.
    pub fn set_state(&self, state: ProxySnapshot) {
        self.lock().state = state;
    }

    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn notifications(&self) -> usize {
        self.lock().notifications
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

impl SystemProxyBackend for MemoryProxyBackend {
    fn read_state(&self) -> Result<ProxySnapshot> {
        Ok(self.state())
    }

    fn write_state(&self, state: &ProxySnapshot) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(Error::SystemProxyUnavailable("settings key is read-only".into()));
        }
        inner.state = ProxySnapshot {
            proxy_enable: state.proxy_enable,
            proxy_server: state
                .proxy_server
                .clone()
                .filter(|server| !server.trim().is_empty()),
        };
        inner.writes += 1;
        Ok(())
    }

    fn notify_settings_changed(&self) -> Result<()> {
        self.lock().notifications += 1;
        Ok(())
    }
}
