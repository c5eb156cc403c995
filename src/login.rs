use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::Url;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::moodle::MoodleApi;
use crate::session::LaunchParams;

const CALLBACK_PATH: &str = "/moodle/callback";
const LOOPBACK_HOST: &str = "127.0.0.1";
const FLOW_LIFETIME_MINUTES: i64 = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginFlowState {
    pub login_url: String,
    pub redirect_url: String,
    pub expires_at: DateTime<Utc>,
}

struct PendingLogin {
    receiver: oneshot::Receiver<AppResult<LaunchParams>>,
    listener: JoinHandle<()>,
    expires_at: DateTime<Utc>,
}

impl Drop for PendingLogin {
    // Closes the loopback port once the flow is completed, replaced,
    // cancelled or timed out.
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Sends the user to the backend login page and waits on a loopback port
/// for the redirect that carries `sessionToken` and `moodleUserId`.
#[derive(Clone)]
pub struct LoginFlow {
    api: Arc<dyn MoodleApi>,
    default_timeout_secs: u64,
    pending: Arc<Mutex<Option<PendingLogin>>>,
}

impl LoginFlow {
    pub fn new(api: Arc<dyn MoodleApi>, default_timeout_secs: u64) -> Self {
        Self {
            api,
            default_timeout_secs,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn start(&self) -> AppResult<LoginFlowState> {
        let listener = TcpListener::bind((LOOPBACK_HOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let redirect_url = format!("http://{LOOPBACK_HOST}:{port}{CALLBACK_PATH}");
        let login_url = self.api.login_url(Some(&redirect_url))?;
        let expires_at = Utc::now() + Duration::minutes(FLOW_LIFETIME_MINUTES);

        let (tx, rx) = oneshot::channel();
        let listener = tokio::spawn(async move {
            let result = handle_redirect(listener).await;
            let _ = tx.send(result);
        });

        let previous = self.pending.lock().replace(PendingLogin {
            receiver: rx,
            listener,
            expires_at,
        });
        if previous.is_some() {
            debug!(target: "login", "replaced pending sign-in");
        }
        info!(target: "login", %redirect_url, "waiting for Moodle sign-in redirect");

        Ok(LoginFlowState {
            login_url: login_url.to_string(),
            redirect_url,
            expires_at,
        })
    }

    pub async fn complete(&self, timeout_secs: Option<u64>) -> AppResult<LaunchParams> {
        let mut pending = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| AppError::Config("start Moodle sign-in before completing it".into()))?;

        if Utc::now() > pending.expires_at {
            return Err(AppError::Config(
                "moodle sign-in expired; restart the flow.".into(),
            ));
        }

        let wait_secs = timeout_secs.unwrap_or(self.default_timeout_secs).max(1);
        let params = timeout(StdDuration::from_secs(wait_secs), &mut pending.receiver)
            .await
            .map_err(|_| AppError::Config("timed out waiting for Moodle sign-in".into()))?
            .map_err(|_| AppError::Config("moodle sign-in listener cancelled".into()))??;

        info!(
            target: "login",
            has_token = params.session_token.is_some(),
            has_user_id = params.moodle_user_id.is_some(),
            "received sign-in redirect"
        );
        Ok(params)
    }

    pub fn cancel(&self) {
        if self.pending.lock().take().is_some() {
            warn!(target: "login", "pending sign-in cancelled");
        }
    }
}

async fn handle_redirect(listener: TcpListener) -> AppResult<LaunchParams> {
    let (mut socket, _) = listener.accept().await?;
    let mut buffer = [0u8; 4096];
    let read = socket.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..read]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| AppError::Config("invalid redirect request".into()))?;

    let url = Url::parse(&format!("http://{LOOPBACK_HOST}{path}"))
        .map_err(|err| AppError::Config(format!("failed to parse redirect: {err}")))?;
    let error = url
        .query_pairs()
        .find(|(k, _)| k == "error")
        .map(|(_, v)| v.to_string());
    let params = LaunchParams::from_parsed(&url);

    let (status, body, result) = match error {
        Some(err) => (
            "400 Bad Request",
            error_body("Moodle sign-in was denied."),
            Err(AppError::Config(format!("moodle sign-in failed: {err}"))),
        ),
        None if params.is_empty() => (
            "400 Bad Request",
            error_body("The redirect carried no session."),
            Err(AppError::Config(
                "moodle sign-in redirect missing sessionToken and moodleUserId".into(),
            )),
        ),
        None => (
            "200 OK",
            success_body("Moodle sign-in complete."),
            Ok(params),
        ),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;

    result
}

fn success_body(message: &str) -> String {
    format!("<html><body><h3>{message}</h3><p>You can return to the app.</p></body></html>")
}

fn error_body(message: &str) -> String {
    format!(
        "<html><body><h3>{message}</h3><p>Close this window and restart sign-in.</p></body></html>"
    )
}
