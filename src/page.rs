use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::moodle::{MoodleApi, Submission};
use crate::session::{LaunchParams, SessionStore};

pub const LOADING_NAME: &str = "Loading...";
pub const UNIDENTIFIED_USER: &str = "Unidentified user";
pub const NAMELESS_USER: &str = "No name";
pub const USER_LOAD_FAILED: &str = "Error loading user";
pub const SIGN_IN_FIRST: &str = "⚠️ You must sign in first.";
pub const MOODLE_ID_MISSING: &str = "⚠️ Moodle ID not found.";
pub const SELECT_FILE_FIRST: &str = "⚠️ Select a file first.";
const UPLOAD_OK_FALLBACK: &str = "File submitted";
const UPLOAD_FAILED_PREFIX: &str = "❌ Error uploading file: ";
const SIGN_OUT_FAILED_PREFIX: &str = "❌ Error signing out: ";

/// A file chosen for upload, either on disk or already in memory
/// (what a webview file input hands over).
#[derive(Debug, Clone)]
pub struct SelectedFile {
    file_name: String,
    source: FileSource,
}

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl SelectedFile {
    pub fn from_path(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| AppError::Config(format!("{} is not a file", path.display())))?;
        Ok(Self {
            file_name,
            source: FileSource::Path(path),
        })
    }

    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            source: FileSource::Bytes(bytes),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Bytes(_) => None,
        }
    }

    async fn read(&self) -> AppResult<Vec<u8>> {
        match &self.source {
            FileSource::Path(path) => Ok(tokio::fs::read(path).await?),
            FileSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct PageState {
    user_name: String,
    moodle_id: Option<String>,
    file: Option<SelectedFile>,
    message: String,
    loading: bool,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            user_name: LOADING_NAME.to_string(),
            moodle_id: None,
            file: None,
            message: String::new(),
            loading: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    pub user_name: String,
    pub moodle_id: Option<String>,
    pub file_name: Option<String>,
    pub message: String,
    pub loading: bool,
}

impl From<&PageState> for PageSnapshot {
    fn from(state: &PageState) -> Self {
        Self {
            user_name: state.user_name.clone(),
            moodle_id: state.moodle_id.clone(),
            file_name: state.file.as_ref().map(|f| f.file_name.clone()),
            message: state.message.clone(),
            loading: state.loading,
        }
    }
}

pub struct UploadPage {
    api: Arc<dyn MoodleApi>,
    session: SessionStore,
    assignment_id: String,
    state: Mutex<PageState>,
}

impl UploadPage {
    pub fn new(
        api: Arc<dyn MoodleApi>,
        session: SessionStore,
        assignment_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            session,
            assignment_id: assignment_id.into(),
            state: Mutex::new(PageState::default()),
        }
    }

    pub fn snapshot(&self) -> PageSnapshot {
        PageSnapshot::from(&*self.state.lock())
    }

    /// Stores whatever the launch URL carried, then resolves the display
    /// name when a Moodle user id is among the parameters. Loading ends in
    /// every branch, including storage failures.
    pub async fn load(&self, params: &LaunchParams) -> PageSnapshot {
        if let Err(err) = self.session.remember(params) {
            warn!(target: "page", ?err, "failed to store launch parameters");
        }

        let Some(user_id) = params.moodle_user_id.clone() else {
            let mut state = self.state.lock();
            state.user_name = UNIDENTIFIED_USER.to_string();
            state.moodle_id = None;
            state.loading = false;
            return PageSnapshot::from(&*state);
        };

        {
            let mut state = self.state.lock();
            state.moodle_id = Some(user_id.clone());
            state.loading = true;
        }

        let user_name = match self.api.fetch_user(&user_id).await {
            Ok(user) => user
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| NAMELESS_USER.to_string()),
            Err(err) => {
                warn!(target: "page", ?err, user_id = %user_id, "failed to load Moodle user");
                USER_LOAD_FAILED.to_string()
            }
        };

        let mut state = self.state.lock();
        state.user_name = user_name;
        state.loading = false;
        PageSnapshot::from(&*state)
    }

    pub fn login_url(&self) -> AppResult<Url> {
        self.api.login_url(None)
    }

    pub fn select_file(&self, file: SelectedFile) -> PageSnapshot {
        debug!(target: "page", file_name = %file.file_name, "file selected");
        let mut state = self.state.lock();
        state.file = Some(file);
        PageSnapshot::from(&*state)
    }

    /// An emptied file input drops the previous selection.
    pub fn clear_file(&self) -> PageSnapshot {
        let mut state = self.state.lock();
        state.file = None;
        PageSnapshot::from(&*state)
    }

    /// Submits the selected file. Every outcome, storage failures
    /// included, ends up as the page message.
    pub async fn upload(&self) -> PageSnapshot {
        let stored = self
            .session
            .session_token()
            .and_then(|token| Ok((token, self.session.moodle_user_id()?)));
        let (token, user_id) = match stored {
            Ok(stored) => stored,
            Err(err) => {
                warn!(target: "page", ?err, "failed to read stored session");
                return self.set_message(format!("{UPLOAD_FAILED_PREFIX}{}", err.user_message()));
            }
        };
        let file = self.state.lock().file.clone();

        let (token, user_id, file) = match (token, user_id, file) {
            (None, _, _) => return self.set_message(SIGN_IN_FIRST),
            (_, None, _) => return self.set_message(MOODLE_ID_MISSING),
            (_, _, None) => return self.set_message(SELECT_FILE_FIRST),
            (Some(token), Some(user_id), Some(file)) => (token, user_id, file),
        };

        let result = match file.read().await {
            Ok(bytes) => {
                let submission = Submission {
                    assignment_id: self.assignment_id.clone(),
                    user_id,
                    file_name: file.file_name.clone(),
                    bytes,
                };
                self.api.submit_assignment(&token, submission).await
            }
            Err(err) => Err(err),
        };

        let message = match result {
            Ok(receipt) => format!(
                "✅ {}",
                receipt
                    .message
                    .unwrap_or_else(|| UPLOAD_OK_FALLBACK.to_string())
            ),
            Err(err) => {
                warn!(target: "page", ?err, file_name = %file.file_name, "upload failed");
                format!("{UPLOAD_FAILED_PREFIX}{}", err.user_message())
            }
        };
        self.set_message(message)
    }

    pub fn sign_out(&self) -> PageSnapshot {
        let forgotten = self.session.forget();
        let mut state = self.state.lock();
        state.user_name = UNIDENTIFIED_USER.to_string();
        state.moodle_id = None;
        state.loading = false;
        state.message = match forgotten {
            Ok(()) => String::new(),
            Err(err) => {
                warn!(target: "page", ?err, "failed to clear stored session");
                format!("{SIGN_OUT_FAILED_PREFIX}{}", err.user_message())
            }
        };
        PageSnapshot::from(&*state)
    }

    fn set_message(&self, message: impl Into<String>) -> PageSnapshot {
        let mut state = self.state.lock();
        state.message = message.into();
        PageSnapshot::from(&*state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use secrecy::{ExposeSecret, SecretString};

    use super::*;
    use crate::moodle::{MoodleUser, SubmissionReceipt};
    use crate::secrets::SecretVault;

    #[derive(Default)]
    struct FakeMoodle {
        user: Mutex<Option<AppResult<MoodleUser>>>,
        receipt: Mutex<Option<AppResult<SubmissionReceipt>>>,
        fetch_calls: AtomicUsize,
        submissions: Mutex<Vec<(String, Submission)>>,
    }

    impl FakeMoodle {
        fn with_user(user: AppResult<MoodleUser>) -> Self {
            Self {
                user: Mutex::new(Some(user)),
                ..Self::default()
            }
        }

        fn with_receipt(receipt: AppResult<SubmissionReceipt>) -> Self {
            Self {
                receipt: Mutex::new(Some(receipt)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MoodleApi for FakeMoodle {
        async fn fetch_user(&self, _user_id: &str) -> AppResult<MoodleUser> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.user
                .lock()
                .take()
                .unwrap_or_else(|| Ok(MoodleUser::default()))
        }

        fn login_url(&self, _redirect_uri: Option<&str>) -> AppResult<Url> {
            Ok(Url::parse("http://localhost:3000/moodle/login").unwrap())
        }

        async fn submit_assignment(
            &self,
            token: &SecretString,
            submission: Submission,
        ) -> AppResult<SubmissionReceipt> {
            self.submissions
                .lock()
                .push((token.expose_secret().to_string(), submission));
            self.receipt
                .lock()
                .take()
                .unwrap_or_else(|| Ok(SubmissionReceipt::default()))
        }
    }

    fn build_page(api: Arc<FakeMoodle>) -> (UploadPage, SessionStore) {
        let session = SessionStore::new(SecretVault::in_memory());
        (UploadPage::new(api, session.clone(), "1"), session)
    }

    fn signed_in(session: &SessionStore) {
        session
            .remember(&LaunchParams::from_query("sessionToken=tok-1&moodleUserId=42").unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn starts_in_loading_state() {
        let (page, _) = build_page(Arc::new(FakeMoodle::default()));
        let snapshot = page.snapshot();
        assert!(snapshot.loading);
        assert_eq!(snapshot.user_name, LOADING_NAME);
        assert!(snapshot.message.is_empty());
    }

    #[tokio::test]
    async fn load_with_params_stores_them_and_fetches_name() {
        let api = Arc::new(FakeMoodle::with_user(Ok(MoodleUser {
            name: Some("Ada Lovelace".into()),
        })));
        let (page, session) = build_page(api.clone());

        let params = LaunchParams::from_query("sessionToken=tok-1&moodleUserId=42").unwrap();
        let snapshot = page.load(&params).await;

        assert_eq!(snapshot.user_name, "Ada Lovelace");
        assert_eq!(snapshot.moodle_id.as_deref(), Some("42"));
        assert!(!snapshot.loading);
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            session.session_token().unwrap().unwrap().expose_secret(),
            "tok-1"
        );
        assert_eq!(session.moodle_user_id().unwrap().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn load_without_params_shows_placeholder_and_skips_network() {
        let api = Arc::new(FakeMoodle::default());
        let (page, _) = build_page(api.clone());

        let snapshot = page.load(&LaunchParams::default()).await;

        assert_eq!(snapshot.user_name, UNIDENTIFIED_USER);
        assert_eq!(snapshot.moodle_id, None);
        assert!(!snapshot.loading);
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_or_failed_name_falls_back() {
        let (page, _) = build_page(Arc::new(FakeMoodle::with_user(Ok(MoodleUser {
            name: Some(String::new()),
        }))));
        let params = LaunchParams::from_query("moodleUserId=42").unwrap();
        assert_eq!(page.load(&params).await.user_name, NAMELESS_USER);

        let (page, _) = build_page(Arc::new(FakeMoodle::with_user(Err(AppError::Backend {
            status: 404,
            message: None,
        }))));
        let snapshot = page.load(&params).await;
        assert_eq!(snapshot.user_name, USER_LOAD_FAILED);
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn upload_without_token_warns_and_sends_nothing() {
        let api = Arc::new(FakeMoodle::default());
        let (page, session) = build_page(api.clone());
        session
            .remember(&LaunchParams::from_query("moodleUserId=42").unwrap())
            .unwrap();
        page.select_file(SelectedFile::from_bytes("essay.pdf", b"%PDF".to_vec()));

        let snapshot = page.upload().await;

        assert_eq!(snapshot.message, SIGN_IN_FIRST);
        assert!(api.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn upload_without_user_id_warns() {
        let api = Arc::new(FakeMoodle::default());
        let (page, session) = build_page(api.clone());
        session
            .remember(&LaunchParams::from_query("sessionToken=tok-1").unwrap())
            .unwrap();

        let snapshot = page.upload().await;

        assert_eq!(snapshot.message, MOODLE_ID_MISSING);
        assert!(api.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn upload_without_file_warns_and_sends_nothing() {
        let api = Arc::new(FakeMoodle::default());
        let (page, session) = build_page(api.clone());
        signed_in(&session);

        let snapshot = page.upload().await;

        assert_eq!(snapshot.message, SELECT_FILE_FIRST);
        assert!(api.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn successful_upload_shows_backend_message() {
        let api = Arc::new(FakeMoodle::with_receipt(Ok(SubmissionReceipt {
            message: Some("Archivo enviado".into()),
        })));
        let (page, session) = build_page(api.clone());
        signed_in(&session);
        page.select_file(SelectedFile::from_bytes("essay.pdf", b"%PDF-1.7".to_vec()));

        let snapshot = page.upload().await;

        assert_eq!(snapshot.message, "✅ Archivo enviado");
        let submissions = api.submissions.lock();
        assert_eq!(submissions.len(), 1);
        let (token, submission) = &submissions[0];
        assert_eq!(token, "tok-1");
        assert_eq!(submission.assignment_id, "1");
        assert_eq!(submission.user_id, "42");
        assert_eq!(submission.file_name, "essay.pdf");
        assert_eq!(submission.bytes, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn failed_upload_surfaces_backend_or_generic_text() {
        let api = Arc::new(FakeMoodle::with_receipt(Err(AppError::Backend {
            status: 401,
            message: Some("Invalid session".into()),
        })));
        let (page, session) = build_page(api);
        signed_in(&session);
        page.select_file(SelectedFile::from_bytes("essay.pdf", vec![1, 2, 3]));
        assert_eq!(
            page.upload().await.message,
            "❌ Error uploading file: Invalid session"
        );

        let api = Arc::new(FakeMoodle::with_receipt(Err(AppError::Backend {
            status: 500,
            message: None,
        })));
        let (page, session) = build_page(api);
        signed_in(&session);
        page.select_file(SelectedFile::from_bytes("essay.pdf", vec![1, 2, 3]));
        assert_eq!(
            page.upload().await.message,
            "❌ Error uploading file: request failed with status code 500"
        );
    }

    #[tokio::test]
    async fn reads_selected_path_at_upload_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "hello moodle").unwrap();

        let api = Arc::new(FakeMoodle::default());
        let (page, session) = build_page(api.clone());
        signed_in(&session);
        let snapshot = page.select_file(SelectedFile::from_path(&path).unwrap());
        assert_eq!(snapshot.file_name.as_deref(), Some("report.txt"));

        let snapshot = page.upload().await;
        assert_eq!(snapshot.message, "✅ File submitted");
        assert_eq!(api.submissions.lock()[0].1.bytes, b"hello moodle");
    }

    #[tokio::test]
    async fn unreadable_path_reports_upload_error() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeMoodle::default());
        let (page, session) = build_page(api.clone());
        signed_in(&session);
        page.select_file(SelectedFile::from_path(dir.path().join("gone.pdf")).unwrap());

        let snapshot = page.upload().await;
        assert!(snapshot.message.starts_with(UPLOAD_FAILED_PREFIX));
        assert!(api.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn sign_out_clears_session() {
        let (page, session) = build_page(Arc::new(FakeMoodle::default()));
        signed_in(&session);
        page.load(&LaunchParams::from_query("moodleUserId=42").unwrap())
            .await;

        let snapshot = page.sign_out();
        assert_eq!(snapshot.moodle_id, None);
        assert!(session.session_token().unwrap().is_none());
        assert_eq!(page.upload().await.message, SIGN_IN_FIRST);
    }

    #[tokio::test]
    async fn storage_failure_still_finishes_loading() {
        let api = Arc::new(FakeMoodle::with_user(Ok(MoodleUser {
            name: Some("Ada Lovelace".into()),
        })));
        let page = UploadPage::new(
            api.clone(),
            SessionStore::new(SecretVault::unavailable()),
            "1",
        );

        let params = LaunchParams::from_query("sessionToken=tok-1&moodleUserId=42").unwrap();
        let snapshot = page.load(&params).await;

        assert!(!snapshot.loading);
        assert_eq!(snapshot.user_name, "Ada Lovelace");
        assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn storage_failure_on_upload_becomes_message() {
        let api = Arc::new(FakeMoodle::default());
        let page = UploadPage::new(
            api.clone(),
            SessionStore::new(SecretVault::unavailable()),
            "1",
        );
        page.select_file(SelectedFile::from_bytes("essay.pdf", vec![1]));

        let snapshot = page.upload().await;

        assert!(snapshot.message.starts_with(UPLOAD_FAILED_PREFIX));
        assert!(snapshot.message.contains("dbus"));
        assert!(api.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn load_without_user_id_drops_previous_id() {
        let (page, _) = build_page(Arc::new(FakeMoodle::default()));
        let snapshot = page
            .load(&LaunchParams::from_query("sessionToken=a&moodleUserId=42").unwrap())
            .await;
        assert_eq!(snapshot.moodle_id.as_deref(), Some("42"));

        let snapshot = page
            .load(&LaunchParams::from_query("sessionToken=b").unwrap())
            .await;
        assert_eq!(snapshot.user_name, UNIDENTIFIED_USER);
        assert_eq!(snapshot.moodle_id, None);
    }

    #[tokio::test]
    async fn cleared_selection_blocks_upload() {
        let api = Arc::new(FakeMoodle::default());
        let (page, session) = build_page(api.clone());
        signed_in(&session);
        page.select_file(SelectedFile::from_bytes("essay.pdf", vec![1, 2]));

        let snapshot = page.clear_file();
        assert_eq!(snapshot.file_name, None);
        assert_eq!(page.upload().await.message, SELECT_FILE_FIRST);
        assert!(api.submissions.lock().is_empty());
    }

    #[test]
    fn sign_out_reports_storage_failure() {
        let page = UploadPage::new(
            Arc::new(FakeMoodle::default()),
            SessionStore::new(SecretVault::unavailable()),
            "1",
        );

        let snapshot = page.sign_out();
        assert!(snapshot.message.starts_with(SIGN_OUT_FAILED_PREFIX));
        assert_eq!(snapshot.moodle_id, None);
        assert!(!snapshot.loading);
    }

    #[test]
    fn login_url_is_the_plain_backend_path() {
        let (page, _) = build_page(Arc::new(FakeMoodle::default()));
        assert_eq!(
            page.login_url().unwrap().as_str(),
            "http://localhost:3000/moodle/login"
        );
    }
}
