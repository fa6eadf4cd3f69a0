//! Crate-wide error type.
//!
//! Every fallible operation in the orchestrator returns [`Result`]. The desktop
//! shell turns errors into `"TAG|detail"` strings through [`err`], so each
//! variant carries a stable tag in addition to its display message.

use std::path::Path;

use crate::settings::InboundMode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file is missing or invalid: {0}")]
    ConfigMissing(String),

    #[error("config has no `{}` inbound for {} mode", .0.inbound_type(), .0.as_str())]
    InboundNotFound(InboundMode),

    #[error("mixed inbound has no valid port (expected 1..65535)")]
    InvalidPort,

    #[error("proxy engine binary not found: {0}")]
    EngineBinaryMissing(String),

    #[error("failed to launch proxy engine: {0}")]
    LaunchFailed(String),

    #[error("authentication required by {0}")]
    AuthRequired(String),

    #[error("credentials rejected by {0}")]
    AuthInvalid(String),

    #[error("no config available, update the config first")]
    NoConfigAvailable,

    #[error("system proxy unavailable: {0}")]
    SystemProxyUnavailable(String),

    #[error("another operation is in progress")]
    Busy,

    #[error("invalid config source: {0}")]
    InvalidSource(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("download failed: {0}")]
    Transport(String),

    #[error("autostart registration failed: {0}")]
    Autostart(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn config_missing(path: &Path) -> Self {
        Error::ConfigMissing(path.display().to_string())
    }

    /// Stable machine-readable tag, independent of the display text.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::ConfigMissing(_) => "CONFIG_MISSING",
            Error::InboundNotFound(_) => "INBOUND_NOT_FOUND",
            Error::InvalidPort => "INVALID_PORT",
            Error::EngineBinaryMissing(_) => "ENGINE_MISSING",
            Error::LaunchFailed(_) => "START_FAILED",
            Error::AuthRequired(_) => "AUTH_REQUIRED",
            Error::AuthInvalid(_) => "AUTH_INVALID",
            Error::NoConfigAvailable => "NO_CONFIG",
            Error::SystemProxyUnavailable(_) => "SYSTEM_PROXY_UNAVAILABLE",
            Error::Busy => "BUSY",
            Error::InvalidSource(_) => "SOURCE_INVALID",
            Error::Parse(_) => "CONFIG_INVALID",
            Error::Transport(_) => "DOWNLOAD_FAILED",
            Error::Autostart(_) => "AUTOSTART_FAILED",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
        }
    }

    /// True for the two Basic-auth signals raised by the fetcher.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::AuthRequired(_) | Error::AuthInvalid(_))
    }
}

/// Formats an error the way the desktop shell expects: `TAG|detail`.
pub fn err(tag: &str, detail: impl AsRef<str>) -> String {
    format!("{tag}|{}", detail.as_ref())
}

impl From<Error> for String {
    fn from(error: Error) -> Self {
        err(error.tag(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_string_carries_tag_and_message() {
        let message: String = Error::InboundNotFound(InboundMode::Tun).into();
        assert_eq!(message, "INBOUND_NOT_FOUND|config has no `tun` inbound for tun mode");
    }

    #[test]
    fn auth_errors_are_classified() {
        assert!(Error::AuthRequired("https://a:443".into()).is_auth());
        assert!(Error::AuthInvalid("https://a:443".into()).is_auth());
        assert!(!Error::Busy.is_auth());
    }
}
