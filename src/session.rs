use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::secrets::SecretVault;

pub const SESSION_TOKEN_KEY: &str = "sessionToken";
pub const MOODLE_USER_ID_KEY: &str = "moodleUserId";

/// Values the backend redirect appends to the page URL after sign-in.
#[derive(Debug, Clone, Default)]
pub struct LaunchParams {
    pub session_token: Option<SecretString>,
    pub moodle_user_id: Option<String>,
}

impl LaunchParams {
    pub fn from_url(raw: &str) -> AppResult<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|err| AppError::Config(format!("invalid launch url: {err}")))?;
        Ok(Self::from_parsed(&url))
    }

    /// Accepts a bare query string, with or without the leading `?`.
    pub fn from_query(query: &str) -> AppResult<Self> {
        let query = query.trim().trim_start_matches('?');
        Self::from_url(&format!("http://localhost/?{query}"))
    }

    pub(crate) fn from_parsed(url: &Url) -> Self {
        let lookup = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            session_token: lookup(SESSION_TOKEN_KEY).map(|v| SecretString::new(v.into())),
            moodle_user_id: lookup(MOODLE_USER_ID_KEY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.session_token.is_none() && self.moodle_user_id.is_none()
    }
}

#[derive(Clone)]
pub struct SessionStore {
    vault: SecretVault,
}

impl SessionStore {
    pub fn new(vault: SecretVault) -> Self {
        Self { vault }
    }

    /// Overwrites every value present in `params`; absent ones keep
    /// whatever an earlier launch stored.
    pub fn remember(&self, params: &LaunchParams) -> AppResult<()> {
        if let Some(token) = &params.session_token {
            self.vault.write_secret(SESSION_TOKEN_KEY, token)?;
        }
        if let Some(user_id) = &params.moodle_user_id {
            self.vault
                .write_secret(MOODLE_USER_ID_KEY, &SecretString::new(user_id.clone().into()))?;
        }
        if !params.is_empty() {
            info!(
                target: "session",
                has_token = params.session_token.is_some(),
                has_user_id = params.moodle_user_id.is_some(),
                "stored launch parameters"
            );
        }
        Ok(())
    }

    pub fn session_token(&self) -> AppResult<Option<SecretString>> {
        self.vault.read_secret(SESSION_TOKEN_KEY)
    }

    pub fn moodle_user_id(&self) -> AppResult<Option<String>> {
        Ok(self
            .vault
            .read_secret(MOODLE_USER_ID_KEY)?
            .map(|value| value.expose_secret().to_string()))
    }

    pub fn forget(&self) -> AppResult<()> {
        self.vault.delete(SESSION_TOKEN_KEY)?;
        self.vault.delete(MOODLE_USER_ID_KEY)?;
        info!(target: "session", "cleared stored session");
        Ok(())
    }
}
