use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "settings.json";
const CONFIG_FILE: &str = "config.json";
const RUNTIME_CONFIG_FILE: &str = "runtime-config.json";
const LOGS_DIR: &str = "logs";
const ENGINE_LOG_FILE: &str = "singbox.log";
const APP_LOG_FILE: &str = "app.log";

#[cfg(target_os = "windows")]
pub const ENGINE_EXE: &str = "sing-box.exe";
#[cfg(not(target_os = "windows"))]
pub const ENGINE_EXE: &str = "sing-box";

/// File layout of one orchestrator instance.
///
/// `data_dir` holds everything the orchestrator writes; `install_dir` is where
/// the engine binary ships and is used as the engine's working directory.
#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
    install_dir: PathBuf,
    engine_binary: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: impl Into<PathBuf>, install_dir: impl Into<PathBuf>) -> Self {
        let install_dir = install_dir.into();
        let engine_binary = install_dir.join(ENGINE_EXE);
        Self {
            data_dir: data_dir.into(),
            install_dir,
            engine_binary,
        }
    }

    /// Overrides the engine executable, keeping the install dir as working dir.
    pub fn with_engine_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.engine_binary = binary.into();
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn engine_binary(&self) -> &Path {
        &self.engine_binary
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn runtime_config_file(&self) -> PathBuf {
        self.data_dir.join(RUNTIME_CONFIG_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_DIR)
    }

    pub fn engine_log_file(&self) -> PathBuf {
        self.logs_dir().join(ENGINE_LOG_FILE)
    }

    pub fn app_log_file(&self) -> PathBuf {
        self.logs_dir().join(APP_LOG_FILE)
    }
}

/// Replaces a leading `~` (alone or followed by a separator) with the home dir.
pub fn expand_user_home(path: &str) -> String {
    let Some(rest) = path.strip_prefix('~') else {
        return path.to_string();
    };
    let Some(home) = dirs::home_dir() else {
        return path.to_string();
    };
    if rest.is_empty() {
        return home.display().to_string();
    }
    match rest.strip_prefix(['/', '\\']) {
        Some("") => home.display().to_string(),
        Some(suffix) => home.join(suffix).display().to_string(),
        None => path.to_string(),
    }
}

/// Expands `%VAR%`, `${VAR}` and `$VAR`. Unknown variables are left verbatim.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find(['%', '$']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let (name, consumed) = match tail.as_bytes()[0] {
            b'%' => match tail[1..].find('%') {
                Some(end) if end > 0 => (&tail[1..1 + end], end + 2),
                _ => ("", 0),
            },
            _ if tail[1..].starts_with('{') => match tail[2..].find('}') {
                Some(end) if end > 0 => (&tail[2..2 + end], end + 3),
                _ => ("", 0),
            },
            _ => {
                let len = tail[1..]
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(tail.len() - 1);
                (&tail[1..1 + len], len + 1)
            }
        };
        match (consumed, std::env::var(name)) {
            (n, Ok(value)) if n > 0 && !name.is_empty() => {
                out.push_str(&value);
                rest = &tail[n..];
            }
            _ => {
                out.push_str(&tail[..1]);
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Last component of a path written with either separator style.
pub fn file_name_component(path: &str) -> Option<&str> {
    path.rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())
}
