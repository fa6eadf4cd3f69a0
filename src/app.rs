//! Desktop shell: tray, window and the command bridge to the orchestrator.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tauri::menu::{Menu, MenuItem, MenuItemBuilder};
use tauri::tray::{MouseButton, MouseButtonState, TrayIconBuilder, TrayIconEvent};
use tauri::{AppHandle, Emitter, Manager, State, Wry};
use tauri_plugin_autostart::MacosLauncher;
use tauri_plugin_dialog::{DialogExt, MessageDialogKind};
use tauri_plugin_opener::OpenerExt;

use crate::autostart::{AutostartBackend, AUTOSTART_ARG};
use crate::credential::{default_secret_store, Credential};
use crate::engine::read_log_tail as read_engine_log_tail;
use crate::error::{err, Error};
use crate::fetch::HttpFetcher;
use crate::import::find_import_source;
use crate::logging::init_logging;
use crate::orchestrator::{
    Collaborators, ConnectionOrchestrator, ConnectionState, ConnectionStatus, CredentialPrompt,
    StatusNotifier, UpdateOutcome, Warning,
};
use crate::paths::{AppPaths, ENGINE_EXE};
use crate::settings::{InboundMode, JsonSettingsStore};
use crate::system_proxy::default_backend;

const TRAY_OPEN_ID: &str = "tray-open";
const TRAY_TOGGLE_ID: &str = "tray-toggle";
const TRAY_UPDATE_ID: &str = "tray-update";
const TRAY_LOGS_ID: &str = "tray-logs";
const TRAY_EXIT_ID: &str = "tray-exit";
const APP_TITLE: &str = "Onibox";

const EVENT_STATE: &str = "connection-state";
const EVENT_WARNING: &str = "orchestrator-warning";
const EVENT_CREDENTIAL: &str = "credential-required";

type SharedOrchestrator = Arc<ConnectionOrchestrator>;

#[derive(Default)]
struct ExitFlag(AtomicBool);

impl ExitFlag {
    fn allow_exit(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_allowed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct TrayState {
    _tray: tauri::tray::TrayIcon,
    toggle: MenuItem<Wry>,
}

#[derive(Clone, Serialize)]
struct WarningPayload {
    tag: &'static str,
    message: String,
}

#[derive(Clone, Serialize)]
struct CredentialRequestPayload {
    origin: String,
    rejected: bool,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    cancelled: bool,
    status: ConnectionStatus,
}

/// Re-emits orchestrator notifications as window events.
struct EventBridge {
    app: AppHandle,
}

impl StatusNotifier for EventBridge {
    fn state_changed(&self, state: ConnectionState) {
        let _ = self.app.emit(EVENT_STATE, state);
        // Must not wait on the main thread: it may be blocked in `shutdown`.
        let app = self.app.clone();
        let _ = self.app.run_on_main_thread(move || {
            if let Some(tray) = app.try_state::<TrayState>() {
                let (label, enabled) = toggle_label(state);
                let _ = tray.toggle.set_text(label);
                let _ = tray.toggle.set_enabled(enabled);
            }
        });
    }

    fn warning(&self, warning: &Warning) {
        let _ = self.app.emit(
            EVENT_WARNING,
            WarningPayload {
                tag: warning.tag(),
                message: warning.to_string(),
            },
        );
    }
}

fn toggle_label(state: ConnectionState) -> (&'static str, bool) {
    match state {
        ConnectionState::Connected => ("Disconnect", true),
        ConnectionState::Disconnected => ("Connect", true),
        ConnectionState::Connecting => ("Connecting...", false),
        ConnectionState::Disconnecting => ("Disconnecting...", false),
    }
}

/// Answer channel of the credential dialog currently shown, if any.
#[derive(Default)]
struct PendingCredential(Mutex<Option<Sender<Option<Credential>>>>);

impl PendingCredential {
    fn answer(&self, credential: Option<Credential>) -> Result<(), String> {
        let sender = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match sender {
            Some(sender) => {
                let _ = sender.send(credential);
                Ok(())
            }
            None => Err(err("NO_PROMPT", "no credential request is pending")),
        }
    }
}

/// Shows the window's credential dialog and blocks until it is answered.
struct WindowPrompt {
    app: AppHandle,
    pending: Arc<PendingCredential>,
}

impl CredentialPrompt for WindowPrompt {
    fn request(&self, origin: &str, rejected: bool) -> Option<Credential> {
        let (sender, receiver) = mpsc::channel();
        *self.pending.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        show_main_window(&self.app);
        let payload = CredentialRequestPayload {
            origin: origin.to_string(),
            rejected,
        };
        if self.app.emit(EVENT_CREDENTIAL, payload).is_err() {
            return None;
        }
        receiver.recv().ok().flatten()
    }
}

#[cfg(not(target_os = "windows"))]
struct PluginAutostart(AppHandle);

#[cfg(not(target_os = "windows"))]
impl AutostartBackend for PluginAutostart {
    fn enable(&self, _executable: &Path) -> bool {
        use tauri_plugin_autostart::ManagerExt;
        self.0.autolaunch().enable().is_ok()
    }

    fn disable(&self) -> bool {
        use tauri_plugin_autostart::ManagerExt;
        self.0.autolaunch().disable().is_ok()
    }
}

fn autostart_backend(_app: &AppHandle) -> Box<dyn AutostartBackend> {
    #[cfg(target_os = "windows")]
    {
        Box::new(crate::autostart::ScheduledTaskAutostart)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(PluginAutostart(_app.clone()))
    }
}

/// Directory holding the bundled engine binary.
fn resolve_install_dir(app: &AppHandle) -> PathBuf {
    let mut candidates = Vec::new();
    if let Ok(resource_dir) = app.path().resource_dir() {
        candidates.push(resource_dir.join("resources"));
        candidates.push(resource_dir);
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(exe_dir);
    }
    candidates
        .iter()
        .find(|dir| dir.join(ENGINE_EXE).is_file())
        .or_else(|| candidates.last())
        .cloned()
        .unwrap_or_default()
}

fn show_main_window(app: &AppHandle) {
    if let Some(window) = app.get_webview_window("main") {
        let _ = window.show();
        let _ = window.unminimize();
        let _ = window.set_focus();
    }
}

fn hide_main_window(app: &AppHandle) {
    if let Some(window) = app.get_webview_window("main") {
        let _ = window.hide();
    }
}

fn show_error(app: &AppHandle, error: Error) {
    if matches!(error, Error::Busy) {
        return;
    }
    app.dialog()
        .message(error.to_string())
        .kind(MessageDialogKind::Error)
        .title(APP_TITLE)
        .show(|_| {});
}

/// Runs a tray action off the event loop, reporting failures in a dialog.
fn run_in_background(app: &AppHandle, action: impl FnOnce(&ConnectionOrchestrator) -> Result<(), Error> + Send + 'static) {
    let app = app.clone();
    std::thread::spawn(move || {
        let orchestrator = app.state::<SharedOrchestrator>().inner().clone();
        if let Err(error) = action(&orchestrator) {
            show_error(&app, error);
        }
    });
}

fn update_from_settings(orchestrator: &ConnectionOrchestrator) -> Result<(), Error> {
    let source = orchestrator
        .settings()
        .config_url
        .ok_or(Error::NoConfigAvailable)?;
    orchestrator.update_config(&source).map(|_| ())
}

async fn blocking<T, F>(orchestrator: &State<'_, SharedOrchestrator>, job: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&ConnectionOrchestrator) -> Result<T, Error> + Send + 'static,
{
    let orchestrator = orchestrator.inner().clone();
    tauri::async_runtime::spawn_blocking(move || job(&orchestrator).map_err(String::from))
        .await
        .map_err(|e| err("TASK_FAILED", e.to_string()))?
}

#[tauri::command]
fn get_status(orchestrator: State<SharedOrchestrator>) -> ConnectionStatus {
    orchestrator.status()
}

#[tauri::command]
async fn connect(orchestrator: State<'_, SharedOrchestrator>) -> Result<ConnectionStatus, String> {
    blocking(&orchestrator, |o| o.connect().map(|_| o.status())).await
}

#[tauri::command]
async fn disconnect(orchestrator: State<'_, SharedOrchestrator>) -> Result<ConnectionStatus, String> {
    blocking(&orchestrator, |o| o.disconnect().map(|_| o.status())).await
}

#[tauri::command]
async fn toggle_connection(
    orchestrator: State<'_, SharedOrchestrator>,
) -> Result<ConnectionStatus, String> {
    blocking(&orchestrator, |o| o.toggle().map(|_| o.status())).await
}

#[tauri::command]
async fn update_config(
    source: String,
    orchestrator: State<'_, SharedOrchestrator>,
) -> Result<UpdateResponse, String> {
    blocking(&orchestrator, move |o| {
        let outcome = o.update_config(&source)?;
        Ok(UpdateResponse {
            cancelled: outcome == UpdateOutcome::Cancelled,
            status: o.status(),
        })
    })
    .await
}

#[tauri::command]
async fn set_inbound_mode(
    mode: InboundMode,
    orchestrator: State<'_, SharedOrchestrator>,
) -> Result<ConnectionStatus, String> {
    blocking(&orchestrator, move |o| o.switch_inbound_mode(mode).map(|_| o.status())).await
}

#[tauri::command]
async fn set_autostart(
    enabled: bool,
    orchestrator: State<'_, SharedOrchestrator>,
) -> Result<ConnectionStatus, String> {
    blocking(&orchestrator, move |o| {
        let exe = std::env::current_exe()?;
        o.set_autostart(enabled, &exe)?;
        Ok(o.status())
    })
    .await
}

#[tauri::command]
fn read_log_tail(
    limit: Option<usize>,
    orchestrator: State<SharedOrchestrator>,
) -> Result<Vec<String>, String> {
    read_engine_log_tail(&orchestrator.paths().engine_log_file(), limit.unwrap_or(200)).map_err(String::from)
}

#[tauri::command]
fn submit_credential(
    username: String,
    secret: String,
    pending: State<Arc<PendingCredential>>,
) -> Result<(), String> {
    pending.answer(Some(Credential::new(username, secret)))
}

#[tauri::command]
fn cancel_credential(pending: State<Arc<PendingCredential>>) -> Result<(), String> {
    pending.answer(None)
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let autostart_launch = std::env::args().any(|arg| arg == AUTOSTART_ARG);
    let import_source = find_import_source(std::env::args().skip(1));
    let app = tauri::Builder::default()
        .plugin(tauri_plugin_autostart::init(
            MacosLauncher::LaunchAgent,
            Some(vec![AUTOSTART_ARG]),
        ))
        .plugin(tauri_plugin_dialog::init())
        .plugin(tauri_plugin_opener::init())
        .manage(ExitFlag::default())
        .manage(Arc::new(PendingCredential::default()))
        .setup(move |app| {
            let app_handle = app.handle().clone();
            let paths = AppPaths::new(app.path().app_data_dir()?, resolve_install_dir(&app_handle));
            init_logging(Some(&paths.logs_dir()));
            tracing::info!(target: "app", data_dir = %paths.data_dir().display(), "starting");

            let pending = app.state::<Arc<PendingCredential>>().inner().clone();
            let collaborators = Collaborators {
                fetcher: Box::new(HttpFetcher::without_system_proxy()?),
                secrets: default_secret_store(),
                settings: Box::new(JsonSettingsStore::new(paths.settings_file())),
                autostart: autostart_backend(&app_handle),
                proxy_backend: default_backend(),
                prompt: Box::new(WindowPrompt {
                    app: app_handle.clone(),
                    pending,
                }),
                notifier: Arc::new(EventBridge {
                    app: app_handle.clone(),
                }),
            };
            let orchestrator = Arc::new(ConnectionOrchestrator::new(paths, collaborators));
            orchestrator.spawn_event_loop();
            app.manage(orchestrator.clone());

            let tray_menu = Menu::new(app)?;
            let open_item = MenuItemBuilder::with_id(TRAY_OPEN_ID, "Open Onibox").build(app)?;
            let toggle_item = MenuItemBuilder::with_id(TRAY_TOGGLE_ID, "Connect").build(app)?;
            let update_item = MenuItemBuilder::with_id(TRAY_UPDATE_ID, "Update config").build(app)?;
            let logs_item = MenuItemBuilder::with_id(TRAY_LOGS_ID, "Open logs").build(app)?;
            let exit_item = MenuItemBuilder::with_id(TRAY_EXIT_ID, "Exit").build(app)?;
            tray_menu.append_items(&[&open_item, &toggle_item, &update_item, &logs_item, &exit_item])?;

            let mut tray_builder = TrayIconBuilder::new()
                .menu(&tray_menu)
                .tooltip(APP_TITLE)
                .show_menu_on_left_click(false)
                .on_menu_event(|app, event| match event.id().as_ref() {
                    TRAY_OPEN_ID => show_main_window(app),
                    TRAY_TOGGLE_ID => run_in_background(app, |o| o.toggle()),
                    TRAY_UPDATE_ID => run_in_background(app, update_from_settings),
                    TRAY_LOGS_ID => {
                        let logs = app.state::<SharedOrchestrator>().paths().logs_dir();
                        let _ = app.opener().open_path(logs.display().to_string(), None::<&str>);
                    }
                    TRAY_EXIT_ID => {
                        let exit_flag = app.state::<ExitFlag>();
                        exit_flag.allow_exit();
                        app.exit(0);
                    }
                    _ => {}
                })
                .on_tray_icon_event(|tray, event| {
                    if let TrayIconEvent::Click {
                        button: MouseButton::Left,
                        button_state: MouseButtonState::Up,
                        ..
                    } = event
                    {
                        show_main_window(tray.app_handle());
                    }
                });

            if let Some(icon) = app.default_window_icon() {
                tray_builder = tray_builder.icon(icon.clone());
            }

            let tray = tray_builder.build(app)?;
            app.manage(TrayState {
                _tray: tray,
                toggle: toggle_item,
            });

            if let Ok(exe) = std::env::current_exe() {
                if let Err(error) = orchestrator.reconcile_autostart(&exe) {
                    tracing::warn!(target: "autostart", %error, "autostart reconcile failed");
                }
            }

            match import_source.clone() {
                Some(source) => {
                    show_main_window(&app_handle);
                    run_in_background(&app_handle, move |o| o.update_config(&source).map(|_| ()));
                }
                None if autostart_launch => hide_main_window(&app_handle),
                None => {}
            }

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            get_status,
            connect,
            disconnect,
            toggle_connection,
            update_config,
            set_inbound_mode,
            set_autostart,
            read_log_tail,
            submit_credential,
            cancel_credential
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(|app_handle, event| match event {
        tauri::RunEvent::WindowEvent { label, event, .. } => {
            if let tauri::WindowEvent::CloseRequested { api, .. } = event {
                let exit_flag = app_handle.state::<ExitFlag>();
                if exit_flag.is_allowed() {
                    return;
                }
                api.prevent_close();
                if label == "main" {
                    hide_main_window(app_handle);
                }
            }
        }
        tauri::RunEvent::ExitRequested { .. } | tauri::RunEvent::Exit => {
            if let Some(pending) = app_handle.try_state::<Arc<PendingCredential>>() {
                let _ = pending.answer(None);
            }
            if let Some(orchestrator) = app_handle.try_state::<SharedOrchestrator>() {
                orchestrator.shutdown();
            }
        }
        _ => {}
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_is_disabled_only_while_transitioning() {
        assert_eq!(toggle_label(ConnectionState::Connected), ("Disconnect", true));
        assert_eq!(toggle_label(ConnectionState::Disconnected), ("Connect", true));
        assert!(!toggle_label(ConnectionState::Connecting).1);
        assert!(!toggle_label(ConnectionState::Disconnecting).1);
    }
}
