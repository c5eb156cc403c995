use tauri_plugin_opener::OpenerExt;
use tracing::warn;

use crate::config::PublicAppConfig;
use crate::login::LoginFlowState;
use crate::page::{PageSnapshot, SelectedFile};
use crate::AppState;

#[tauri::command]
pub fn page_snapshot(state: tauri::State<'_, AppState>) -> PageSnapshot {
    state.page().snapshot()
}

#[tauri::command]
pub fn app_config(state: tauri::State<'_, AppState>) -> PublicAppConfig {
    state.config().public_profile()
}

#[tauri::command]
pub fn login_url(state: tauri::State<'_, AppState>) -> Result<String, String> {
    state
        .page()
        .login_url()
        .map(|url| url.to_string())
        .map_err(|err| err.to_string())
}

#[tauri::command]
pub async fn start_login(
    app: tauri::AppHandle,
    state: tauri::State<'_, AppState>,
) -> Result<LoginFlowState, String> {
    let flow = state.start_login().await.map_err(|err| err.to_string())?;
    if let Err(err) = app.opener().open_url(flow.login_url.clone(), None::<&str>) {
        warn!(?err, "failed to open Moodle login page");
        return Err(err.to_string());
    }
    Ok(flow)
}

#[tauri::command]
pub async fn complete_login(
    state: tauri::State<'_, AppState>,
    timeout_secs: Option<u64>,
) -> Result<PageSnapshot, String> {
    state
        .complete_login(timeout_secs)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command]
pub fn select_file_bytes(
    state: tauri::State<'_, AppState>,
    file_name: String,
    bytes: Vec<u8>,
) -> PageSnapshot {
    state
        .page()
        .select_file(SelectedFile::from_bytes(file_name, bytes))
}

#[tauri::command]
pub fn clear_file(state: tauri::State<'_, AppState>) -> PageSnapshot {
    state.page().clear_file()
}

#[tauri::command]
pub async fn upload_file(state: tauri::State<'_, AppState>) -> Result<PageSnapshot, String> {
    let page = state.page();
    Ok(page.upload().await)
}

#[tauri::command]
pub fn sign_out(state: tauri::State<'_, AppState>) -> PageSnapshot {
    state.sign_out()
}
