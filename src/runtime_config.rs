//! Derives the engine's runtime config from a downloaded source config.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::jsonc;
use crate::paths::{expand_env_vars, expand_user_home, file_name_component};
use crate::settings::InboundMode;

const DEFAULT_CACHE_FILE: &str = "cache.db";

/// Turns a source config into a single-inbound runtime config.
#[derive(Debug, Clone)]
pub struct RuntimeConfigBuilder {
    log_output: PathBuf,
}

impl RuntimeConfigBuilder {
    /// `log_output` is written into every runtime config as `log.output`.
    pub fn new(log_output: impl Into<PathBuf>) -> Self {
        Self {
            log_output: log_output.into(),
        }
    }

    pub fn build(&self, source: &Path, mode: InboundMode, destination: &Path) -> Result<()> {
        let text = fs::read_to_string(source).map_err(|_| Error::config_missing(source))?;
        let mut config = jsonc::parse(&text).map_err(|_| Error::config_missing(source))?;
        let root = config
            .as_object_mut()
            .ok_or_else(|| Error::config_missing(source))?;

        let inbound = select_inbound(root, mode).ok_or(Error::InboundNotFound(mode))?;
        root.insert("inbounds".into(), Value::Array(vec![inbound]));
        self.set_log_output(root);
        relocate_cache_file(root, destination);

        if let Some(dir) = destination.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let content = serde_json::to_string_pretty(&config)?;
        fs::write(destination, content)?;
        tracing::debug!(
            target: "engine",
            source = %source.display(),
            destination = %destination.display(),
            mode = mode.as_str(),
            "runtime config written"
        );
        Ok(())
    }

    fn set_log_output(&self, root: &mut Map<String, Value>) {
        let output = json!(self.log_output.display().to_string());
        match root.get_mut("log").and_then(Value::as_object_mut) {
            Some(log) => {
                log.insert("output".into(), output);
            }
            None => {
                root.insert("log".into(), json!({ "output": output }));
            }
        }
    }
}

/// Deep copy of the first inbound whose `type` matches the mode.
fn select_inbound(root: &Map<String, Value>, mode: InboundMode) -> Option<Value> {
    root.get("inbounds")?
        .as_array()?
        .iter()
        .find(|inbound| {
            inbound
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|kind| kind.eq_ignore_ascii_case(mode.inbound_type()))
        })
        .cloned()
}

/// Points `experimental.cache_file.path` next to the runtime config, keeping
/// only the configured file name.
fn relocate_cache_file(root: &mut Map<String, Value>, destination: &Path) {
    let Some(cache_file) = root
        .get_mut("experimental")
        .and_then(Value::as_object_mut)
        .and_then(|experimental| experimental.get_mut("cache_file"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    let configured = cache_file
        .get("path")
        .and_then(Value::as_str)
        .map(|raw| expand_env_vars(&expand_user_home(raw.trim())));
    let name = configured
        .as_deref()
        .and_then(file_name_component)
        .unwrap_or(DEFAULT_CACHE_FILE)
        .to_string();

    let path = match destination.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        Some(dir) => dir.join(&name),
        None => std::path::absolute(&name).unwrap_or_else(|_| PathBuf::from(&name)),
    };
    cache_file.insert("path".into(), json!(path.display().to_string()));
}
