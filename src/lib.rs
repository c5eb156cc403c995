#[cfg(feature = "desktop")]
mod commands;
mod config;
mod errors;
mod login;
mod moodle;
mod page;
mod secrets;
mod session;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::errors::{AppError, AppResult};
pub use crate::login::{LoginFlow, LoginFlowState};
pub use crate::moodle::{MoodleApi, MoodleClient, MoodleUser, Submission, SubmissionReceipt};
pub use crate::page::{
    PageSnapshot, SelectedFile, UploadPage, LOADING_NAME, MOODLE_ID_MISSING, NAMELESS_USER,
    SELECT_FILE_FIRST, SIGN_IN_FIRST, UNIDENTIFIED_USER, USER_LOAD_FAILED,
};
pub use crate::secrets::SecretVault;
pub use crate::session::{LaunchParams, SessionStore};

pub struct AppState {
    config: AppConfig,
    page: Arc<UploadPage>,
    login: LoginFlow,
}

impl AppState {
    pub fn new(config: AppConfig, vault: SecretVault) -> AppResult<Self> {
        let api: Arc<dyn MoodleApi> = Arc::new(MoodleClient::new(&config)?);
        Ok(Self::with_api(config, vault, api))
    }

    pub fn with_api(config: AppConfig, vault: SecretVault, api: Arc<dyn MoodleApi>) -> Self {
        let session = SessionStore::new(vault);
        let page = Arc::new(UploadPage::new(
            Arc::clone(&api),
            session,
            config.assignment_id.clone(),
        ));
        let login = LoginFlow::new(api, config.login_timeout_secs);
        Self {
            config,
            page,
            login,
        }
    }

    pub fn from_env() -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        let vault = SecretVault::new(config.storage_service.clone());
        info!(
            api_base = %config.api_base,
            assignment_id = %config.assignment_id,
            "moodle uploader configured"
        );
        Self::new(config, vault)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn page(&self) -> Arc<UploadPage> {
        Arc::clone(&self.page)
    }

    /// Launch parameters from the first command-line argument, falling
    /// back to `MOODLE_LAUNCH_URL`. Anything unparseable counts as absent.
    pub fn launch_params(&self, cli_arg: Option<&str>) -> LaunchParams {
        let raw = cli_arg
            .map(str::to_string)
            .or_else(|| self.config.launch_url.clone());
        match raw {
            Some(raw) => LaunchParams::from_url(&raw).unwrap_or_else(|err| {
                warn!(?err, "ignoring unparseable launch url");
                LaunchParams::default()
            }),
            None => LaunchParams::default(),
        }
    }

    pub async fn load_launch_url(&self, raw: &str) -> AppResult<PageSnapshot> {
        let params = LaunchParams::from_url(raw)?;
        Ok(self.page.load(&params).await)
    }

    pub async fn start_login(&self) -> AppResult<LoginFlowState> {
        self.login.start().await
    }

    /// Waits for the backend redirect and loads the page with it, as if the
    /// redirect URL had been the launch URL.
    pub async fn complete_login(&self, timeout_secs: Option<u64>) -> AppResult<PageSnapshot> {
        let params = self.login.complete(timeout_secs).await?;
        Ok(self.page.load(&params).await)
    }

    pub fn sign_out(&self) -> PageSnapshot {
        self.login.cancel();
        self.page.sign_out()
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,moodle_uploader_lib=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use tauri::Manager;

    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .setup(|app| {
            let state = AppState::from_env()
                .map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;
            let launch_arg = std::env::args().nth(1);
            let params = state.launch_params(launch_arg.as_deref());
            let page = state.page();
            tauri::async_runtime::spawn(async move {
                page.load(&params).await;
            });
            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::page_snapshot,
            commands::app_config,
            commands::login_url,
            commands::start_login,
            commands::complete_login,
            commands::select_file_bytes,
            commands::clear_file,
            commands::upload_file,
            commands::sign_out
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
