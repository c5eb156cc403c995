use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const USER_AGENT: &str = concat!("moodle-uploader/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MoodleUser {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub assignment_id: String,
    pub user_id: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// The three backend calls the page makes.
#[async_trait]
pub trait MoodleApi: Send + Sync {
    async fn fetch_user(&self, user_id: &str) -> AppResult<MoodleUser>;

    fn login_url(&self, redirect_uri: Option<&str>) -> AppResult<Url>;

    async fn submit_assignment(
        &self,
        token: &SecretString,
        submission: Submission,
    ) -> AppResult<SubmissionReceipt>;
}

#[derive(Clone)]
pub struct MoodleClient {
    http: Client,
    api_base: String,
}

impl MoodleClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            api_base: config.api_base.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|err| AppError::Config(format!("invalid Moodle API base URL: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config("invalid Moodle API base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl MoodleApi for MoodleClient {
    async fn fetch_user(&self, user_id: &str) -> AppResult<MoodleUser> {
        let url = self.endpoint(&["moodle", user_id])?;
        debug!(target: "moodle", %url, "fetching user");
        let response = self.http.get(url).send().await?;
        read_json(response).await
    }

    fn login_url(&self, redirect_uri: Option<&str>) -> AppResult<Url> {
        let mut url = self.endpoint(&["moodle", "login"])?;
        if let Some(redirect) = redirect_uri {
            url.query_pairs_mut().append_pair("redirect_uri", redirect);
        }
        Ok(url)
    }

    async fn submit_assignment(
        &self,
        token: &SecretString,
        submission: Submission,
    ) -> AppResult<SubmissionReceipt> {
        let url = self.endpoint(&["moodle", "submit"])?;
        let size = submission.bytes.len();
        let file = Part::bytes(submission.bytes).file_name(submission.file_name.clone());
        let form = Form::new()
            .part("file", file)
            .text("assignmentId", submission.assignment_id.clone())
            .text("userId", submission.user_id.clone());

        let response = self
            .http
            .post(url)
            .bearer_auth(token.expose_secret())
            .multipart(form)
            .send()
            .await?;
        let receipt: SubmissionReceipt = read_json(response).await?;
        info!(
            target: "moodle",
            assignment_id = %submission.assignment_id,
            file_name = %submission.file_name,
            bytes = size,
            "assignment submitted"
        );
        Ok(receipt)
    }
}

/// Success bodies are read leniently: an empty or non-JSON 2xx reply is
/// still a success and yields `T::default()`.
async fn read_json<T: DeserializeOwned + Default>(response: Response) -> AppResult<T> {
    let status = response.status();
    if status.is_success() {
        let body = response.text().await?;
        return Ok(parse_success_body(status.as_u16(), &body));
    }

    let body = response.text().await.unwrap_or_default();
    Err(AppError::Backend {
        status: status.as_u16(),
        message: extract_message(&body),
    })
}

fn parse_success_body<T: DeserializeOwned + Default>(status: u16, body: &str) -> T {
    if body.trim().is_empty() {
        return T::default();
    }
    serde_json::from_str(body).unwrap_or_else(|err| {
        debug!(target: "moodle", status, ?err, "success reply without a JSON body");
        T::default()
    })
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<BackendMessage>,
}

/// NestJS validation failures send a list of messages instead of one.
#[derive(Deserialize)]
#[serde(untagged)]
enum BackendMessage {
    One(String),
    Many(Vec<String>),
}

fn extract_message(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let text = match parsed.message? {
        BackendMessage::One(message) => message,
        BackendMessage::Many(messages) => messages.join(", "),
    };
    Some(text).filter(|t| !t.trim().is_empty())
}
