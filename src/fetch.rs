//! Retrieval of the raw config document from a URL or a local file.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use url::Url;

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::paths::expand_env_vars;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Where a config comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Local(PathBuf),
    Remote(Url),
}

impl ConfigSource {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidSource("config source is empty".into()));
        }

        if looks_like_uri(trimmed) {
            let url = Url::parse(trimmed).map_err(|e| Error::InvalidSource(e.to_string()))?;
            return match url.scheme() {
                "http" | "https" => Ok(ConfigSource::Remote(url)),
                other => Err(Error::InvalidSource(format!("unsupported scheme `{other}`"))),
            };
        }

        let unquoted = trimmed.trim_matches('"').trim();
        if unquoted.is_empty() {
            return Err(Error::InvalidSource("config source is empty".into()));
        }
        let path = PathBuf::from(expand_env_vars(unquoted));
        let path = std::path::absolute(&path).unwrap_or(path);
        if !path.is_file() {
            return Err(Error::config_missing(&path));
        }
        Ok(ConfigSource::Local(path))
    }

    /// `scheme://host:port` of a remote source, the key for stored credentials.
    pub fn auth_target(&self) -> Option<String> {
        match self {
            ConfigSource::Local(_) => None,
            ConfigSource::Remote(url) => {
                let host = url.host_str()?;
                let port = url.port_or_known_default()?;
                Some(format!("{}://{host}:{port}", url.scheme()))
            }
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Local(path) => write!(f, "{}", path.display()),
            ConfigSource::Remote(url) => write!(f, "{url}"),
        }
    }
}

fn looks_like_uri(value: &str) -> bool {
    if value.find("://").is_some_and(|index| index > 0) {
        return true;
    }
    let lower = value.get(..6).unwrap_or(value).to_ascii_lowercase();
    lower.starts_with("http:") || lower.starts_with("https:")
}

/// Produces the bytes of a config document.
pub trait ConfigFetcher: Send {
    /// Fails with `AuthRequired`/`AuthInvalid` when the server asks for Basic
    /// credentials, depending on whether `credential` was supplied.
    fn fetch(&self, source: &ConfigSource, credential: Option<&Credential>) -> Result<Vec<u8>>;
}

/// Reads local files and downloads over HTTP(S) with a blocking client.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_builder(reqwest::blocking::Client::builder())
    }

    /// Ignores proxy environment variables, so a proxy we manage is never used
    /// to download its own config.
    pub fn without_system_proxy() -> Result<Self> {
        Self::with_builder(reqwest::blocking::Client::builder().no_proxy())
    }

    fn with_builder(builder: reqwest::blocking::ClientBuilder) -> Result<Self> {
        let client = builder
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn download(&self, url: &Url, origin: String, credential: Option<&Credential>) -> Result<Vec<u8>> {
        let mut request = self.client.get(url.clone());
        if let Some(credential) = credential {
            request = request.header(AUTHORIZATION, basic_auth_header(credential));
        }
        let response = request.send().map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED && has_basic_challenge(response.headers()) {
            tracing::info!(target: "fetch", %origin, retried = credential.is_some(), "server requires basic auth");
            return Err(match credential {
                Some(_) => Error::AuthInvalid(origin),
                None => Error::AuthRequired(origin),
            });
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("server answered {status}")));
        }
        let body = response.bytes().map_err(|e| Error::Transport(e.to_string()))?;
        tracing::info!(target: "fetch", %url, bytes = body.len(), "config downloaded");
        Ok(body.to_vec())
    }
}

impl ConfigFetcher for HttpFetcher {
    fn fetch(&self, source: &ConfigSource, credential: Option<&Credential>) -> Result<Vec<u8>> {
        match source {
            ConfigSource::Local(path) => {
                std::fs::read(path).map_err(|_| Error::config_missing(path))
            }
            ConfigSource::Remote(url) => {
                let origin = source.auth_target().unwrap_or_else(|| url.to_string());
                self.download(url, origin, credential)
            }
        }
    }
}

pub fn basic_auth_header(credential: &Credential) -> String {
    let raw = format!("{}:{}", credential.username, credential.secret);
    format!("Basic {}", STANDARD.encode(raw.as_bytes()))
}

fn has_basic_challenge(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|challenge| challenge.split_whitespace().next())
        .any(|scheme| scheme.eq_ignore_ascii_case("basic"))
}
