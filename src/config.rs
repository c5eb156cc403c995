use std::{env, io};

use serde::Serialize;
use tracing::debug;

const DEFAULT_API_BASE: &str = "http://localhost:3000";
const DEFAULT_ASSIGNMENT_ID: &str = "1";
const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 180;
const MIN_LOGIN_TIMEOUT_SECS: u64 = 5;
const DEFAULT_STORAGE_SERVICE: &str = "MoodleUploader";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base: String,
    pub assignment_id: String,
    pub login_timeout_secs: u64,
    pub storage_service: String,
    pub launch_url: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAppConfig {
    pub api_base: String,
    pub assignment_id: String,
    pub login_timeout_secs: u64,
    pub has_launch_url: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            api_base: normalize_base(
                &env::var("MOODLE_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            ),
            assignment_id: env::var("MOODLE_ASSIGNMENT_ID")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_ASSIGNMENT_ID.to_string()),
            login_timeout_secs: parse_u64("MOODLE_LOGIN_TIMEOUT_SECS", DEFAULT_LOGIN_TIMEOUT_SECS)
                .max(MIN_LOGIN_TIMEOUT_SECS),
            storage_service: env::var("MOODLE_STORAGE_SERVICE")
                .unwrap_or_else(|_| DEFAULT_STORAGE_SERVICE.to_string()),
            launch_url: env::var("MOODLE_LAUNCH_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    /// Config pointed at an explicit backend, everything else defaulted.
    pub fn with_api_base(api_base: &str) -> Self {
        Self {
            api_base: normalize_base(api_base),
            assignment_id: DEFAULT_ASSIGNMENT_ID.to_string(),
            login_timeout_secs: DEFAULT_LOGIN_TIMEOUT_SECS,
            storage_service: DEFAULT_STORAGE_SERVICE.to_string(),
            launch_url: None,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            api_base: self.api_base.clone(),
            assignment_id: self.assignment_id.clone(),
            login_timeout_secs: self.login_timeout_secs,
            has_launch_url: self.launch_url.is_some(),
        }
    }
}

fn normalize_base(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
