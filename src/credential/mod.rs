//! Basic-auth credentials and the stores that keep them between runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "windows")]
pub use self::windows::WindowsCredentialStore;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// Opaque credential storage keyed by an auth target (`scheme://host:port`).
pub trait SecretBackend: Send {
    fn try_read(&self, target: &str) -> Option<Credential>;
    fn write(&self, target: &str, credential: &Credential) -> Result<()>;
    fn delete(&self, target: &str) -> Result<()>;
}

/// Credential Manager on Windows, process memory elsewhere.
pub fn default_secret_store() -> Box<dyn SecretBackend> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsCredentialStore::new())
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(MemorySecretStore::new())
    }
}

/// Credentials kept in memory; clones share one map.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    entries: Arc<Mutex<HashMap<String, Credential>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Credential>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, target: &str) -> Option<Credential> {
        self.entries().get(target).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl SecretBackend for MemorySecretStore {
    fn try_read(&self, target: &str) -> Option<Credential> {
        if target.trim().is_empty() {
            return None;
        }
        self.get(target)
    }

    fn write(&self, target: &str, credential: &Credential) -> Result<()> {
        if !target.trim().is_empty() {
            self.entries().insert(target.to_string(), credential.clone());
        }
        Ok(())
    }

    fn delete(&self, target: &str) -> Result<()> {
        self.entries().remove(target);
        Ok(())
    }
}
