use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, EnvFilter};

const APP_LOG_FILE: &str = "app.log";

/// Installs the global `tracing` subscriber.
///
/// Writes to `<log_dir>/app.log` when a directory is given and can be opened,
/// stderr otherwise. Filter comes from `RUST_LOG`, defaulting to `info`.
/// Calling it again after a subscriber is set does nothing.
pub fn init_logging(log_dir: Option<&Path>) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file = log_dir.and_then(|dir| {
        fs::create_dir_all(dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(APP_LOG_FILE))
            .ok()
    });

    let installed = match file {
        Some(file) => {
            let subscriber = fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber).is_ok()
        }
        None => {
            let subscriber = fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber).is_ok()
        }
    };
    if installed {
        tracing::info!(target: "app", "tracing initialized");
    }
}
