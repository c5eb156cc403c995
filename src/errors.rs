use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("request failed with status code {status}")]
    Backend {
        status: u16,
        message: Option<String>,
    },
    #[cfg(feature = "desktop")]
    #[error(transparent)]
    Tauri(#[from] tauri::Error),
}

impl AppError {
    /// Text surfaced on the page: the backend's own message when it sent
    /// one, otherwise the error description.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Backend {
                message: Some(message),
                ..
            } if !message.trim().is_empty() => message.clone(),
            other => other.to_string(),
        }
    }
}
