#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod app_runtime;
mod tauri_window;

fn main() {
    app_runtime::run();
}
