//! Local connection orchestrator for a sing-box engine.
//!
//! The core (config derivation, engine supervision, system proxy ownership and
//! the [`ConnectionOrchestrator`] state machine) builds without a GUI toolkit.
//! The desktop shell lives behind the `tauri-app` feature.

pub mod autostart;
pub mod credential;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod import;
pub mod inspector;
pub mod jsonc;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod runtime_config;
pub mod settings;
pub mod system_proxy;

#[cfg(feature = "tauri-app")]
mod app;
#[cfg(feature = "tauri-app")]
pub use app::run;

pub use error::{Error, Result};
pub use inspector::MixedInboundProxy;
pub use orchestrator::{
    Collaborators, ConnectionOrchestrator, ConnectionState, ConnectionStatus, StatusNotifier,
    UpdateOutcome, Warning,
};
pub use paths::AppPaths;
pub use settings::{InboundMode, Settings};
