// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

#[cfg(feature = "tauri-app")]
fn main() {
    oniboxcore_lib::run();
}

#[cfg(not(feature = "tauri-app"))]
fn main() {}
