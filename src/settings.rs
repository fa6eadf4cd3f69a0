use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::Result;

/// Which inbound of the source config the engine is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InboundMode {
    #[default]
    Proxy,
    Tun,
}

impl InboundMode {
    /// The inbound `type` discriminator this mode selects.
    pub fn inbound_type(self) -> &'static str {
        match self {
            InboundMode::Proxy => "mixed",
            InboundMode::Tun => "tun",
        }
    }

    /// Persisted form.
    pub fn as_str(self) -> &'static str {
        match self {
            InboundMode::Proxy => "proxy",
            InboundMode::Tun => "tun",
        }
    }

    /// Lenient parse of a persisted value; anything unknown is `Proxy`.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("tun") {
            InboundMode::Tun
        } else {
            InboundMode::Proxy
        }
    }
}

impl Serialize for InboundMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for InboundMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(match raw {
            Value::String(value) => InboundMode::parse(&value),
            Value::Number(value) if value.as_i64() == Some(1) => InboundMode::Tun,
            _ => InboundMode::Proxy,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub config_url: Option<String>,
    pub last_config_path: Option<String>,
    pub last_updated_at: Option<DateTime<Local>>,
    pub auto_start: bool,
    pub inbound_mode: InboundMode,
}

/// Persistence for [`Settings`].
pub trait SettingsStore: Send {
    /// Never fails; unreadable state yields defaults.
    fn load(&self) -> Settings;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// `settings.json` on disk, replaced atomically on every save.
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Settings {
        if !self.path.exists() {
            return Settings::default();
        }
        let raw = match fs::read_to_string(&self.path) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(target: "settings", path = %self.path.display(), %error, "settings unreadable, using defaults");
                return Settings::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(target: "settings", path = %self.path.display(), %error, "settings corrupt, using defaults");
                Settings::default()
            }
        }
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;
        write_atomic(&self.path, content.as_bytes())?;
        tracing::debug!(target: "settings", path = %self.path.display(), "settings saved");
        Ok(())
    }
}

/// Writes `<path>.tmp` and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn inbound_mode_tolerates_legacy_values() {
        let cases = [
            (r#""tun""#, InboundMode::Tun),
            (r#""TUN""#, InboundMode::Tun),
            (r#""mixed""#, InboundMode::Proxy),
            (r#""socks""#, InboundMode::Proxy),
            ("1", InboundMode::Tun),
            ("0", InboundMode::Proxy),
            ("null", InboundMode::Proxy),
        ];
        for (raw, expected) in cases {
            let mode: InboundMode = serde_json::from_str(raw).unwrap();
            assert_eq!(mode, expected, "input {raw}");
        }
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"configUrl":"https://x/c.json"}"#).unwrap();
        assert_eq!(settings.config_url.as_deref(), Some("https://x/c.json"));
        assert_eq!(settings.inbound_mode, InboundMode::Proxy);
        assert!(!settings.auto_start);
    }

    #[test]
    fn store_round_trips_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = JsonSettingsStore::new(dir.path().join("nested").join("settings.json"));
        let settings = Settings {
            config_url: Some("https://example.com/config.json".into()),
            last_config_path: Some("/tmp/config.json".into()),
            last_updated_at: Some(Local::now()),
            auto_start: true,
            inbound_mode: InboundMode::Tun,
        };
        store.save(&settings).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains(r#""inboundMode": "tun""#));
        assert!(!dir.path().join("nested").join("settings.json.tmp").exists());
        assert_eq!(store.load(), settings);
    }

    #[test]
    fn corrupt_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(JsonSettingsStore::new(&path).load(), Settings::default());
    }
}
