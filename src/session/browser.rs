//! Browser session management
//!
//! Owns the single Chromium context for a run. The profile directory is
//! persistent, so a login survives across runs; credentials are never
//! requested, only captured passively off the wire as the web client makes
//! its own API calls.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventRequestWillBeSent, GetRequestPostDataParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::session::credentials::SlackCredentials;
use crate::sync::client::ApiClient;
use crate::sync::types::SyncError;
use crate::workspace::WorkspaceContext;

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(15);
const CAPTURE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub headless: bool,
    /// Whether a human is available to complete a login in the window.
    pub interactive: bool,
    /// How long to wait for credential capture (or manual login).
    pub login_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            headless: true,
            interactive: false,
            login_timeout: Duration::from_secs(300),
        }
    }
}

pub struct SessionManager {
    ctx: WorkspaceContext,
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
    credentials: Arc<Mutex<SlackCredentials>>,
    credentials_path: PathBuf,
    closed: bool,
}

impl SessionManager {
    /// Launch the browser bound to the persistent profile and attach the
    /// passive credential listener.
    pub async fn start(ctx: WorkspaceContext, opts: &SessionOptions) -> Result<Self, SyncError> {
        let profile = ctx.browser_profile_dir();
        std::fs::create_dir_all(&profile)?;

        let mut config = BrowserConfig::builder().user_data_dir(&profile);
        if !opts.headless {
            config = config.with_head();
        }
        let config = config.build().map_err(SyncError::Browser)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| SyncError::Browser(e.to_string()))?;

        // The CDP handler must be polled for the connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| SyncError::Browser(e.to_string()))?;
        page.execute(network::EnableParams::default())
            .await
            .map_err(|e| SyncError::Browser(e.to_string()))?;

        let credentials_path = ctx.credentials_file();
        let credentials = Arc::new(Mutex::new(SlackCredentials::load(&credentials_path)));
        let listener_task =
            spawn_credential_listener(&page, &ctx, credentials.clone(), credentials_path.clone())
                .await?;

        Ok(Self {
            ctx,
            browser,
            page,
            handler_task,
            listener_task,
            credentials,
            credentials_path,
            closed: false,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn context(&self) -> &WorkspaceContext {
        &self.ctx
    }

    /// Current snapshot of the captured credentials.
    pub fn credentials(&self) -> SlackCredentials {
        self.credentials.lock().expect("credentials lock").clone()
    }

    /// Navigate to the workspace and wait until fresh credentials have been
    /// captured. Loading the app client makes the web client fire the API
    /// traffic the listener feeds on; an existing profile login needs no
    /// human at all. Without a login and without `interactive`, this is
    /// `AuthRequired`.
    pub async fn ensure_logged_in(&self, opts: &SessionOptions) -> Result<(), SyncError> {
        self.goto(&self.ctx.app_client_url()).await?;

        let deadline = tokio::time::Instant::now()
            + if opts.interactive {
                opts.login_timeout
            } else {
                // a stored session authenticates within a page load or not at all
                Duration::from_secs(30)
            };

        loop {
            tokio::time::sleep(CAPTURE_POLL_INTERVAL).await;
            let now = chrono::Utc::now().timestamp();
            if self.credentials().is_fresh(now) {
                tracing::info!("Captured fresh session credentials");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SyncError::AuthRequired(if opts.interactive {
                    "login not completed before timeout".into()
                } else {
                    "no stored session and interactive login unavailable".into()
                }));
            }
            if opts.interactive {
                tracing::info!("Waiting for sign-in to complete in the browser window");
            }
        }
    }

    /// Cheap probe of the captured credentials via `auth.test`. A 401/403
    /// marks the stored material expired.
    pub async fn is_valid(&self) -> Result<bool, SyncError> {
        let creds = self.credentials();
        let client = match ApiClient::new(&self.ctx, &creds) {
            Ok(c) => c,
            Err(SyncError::AuthRequired(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        match client.auth_test().await {
            Ok((user_id, team_id)) => {
                let mut guard = self.credentials.lock().expect("credentials lock");
                guard.absorb_identity(Some(&user_id), Some(&team_id));
                if let Err(e) = guard.save(&self.credentials_path) {
                    tracing::warn!("Failed to save credentials: {}", e);
                }
                Ok(true)
            }
            Err(SyncError::AuthExpired) => {
                let mut guard = self.credentials.lock().expect("credentials lock");
                guard.invalidate();
                if let Err(e) = guard.save(&self.credentials_path) {
                    tracing::warn!("Failed to save credentials: {}", e);
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Navigation with an explicit timeout; a hung load is a browser error,
    /// not a hang of the whole run.
    pub async fn goto(&self, url: &str) -> Result<(), SyncError> {
        tokio::time::timeout(NAVIGATION_TIMEOUT, self.page.goto(url))
            .await
            .map_err(|_| SyncError::Timeout(format!("navigation to {} timed out", url)))?
            .map_err(|e| SyncError::Browser(e.to_string()))?;
        Ok(())
    }

    /// Release the browser. Safe to call more than once; also runs on drop
    /// so the context is returned on every exit path.
    pub async fn close(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.listener_task.abort();

        if let Err(e) = self.browser.close().await {
            tracing::warn!("Browser close: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        tracing::debug!("Browser session released");
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if !self.closed {
            // last-resort release when close() was skipped by an early return;
            // the browser's own drop reaps the child process
            self.listener_task.abort();
            self.handler_task.abort();
        }
    }
}

/// Attach the passive network listener: every outgoing request against the
/// workspace's `/api/` prefix is mined for the bearer token and session
/// cookies, which overwrite whatever the store held before.
async fn spawn_credential_listener(
    page: &Page,
    ctx: &WorkspaceContext,
    credentials: Arc<Mutex<SlackCredentials>>,
    credentials_path: PathBuf,
) -> Result<JoinHandle<()>, SyncError> {
    let mut events = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(|e| SyncError::Browser(e.to_string()))?;

    let api_prefix = ctx.api_base();
    let page = page.clone();

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let url = event.request.url.as_str();
            if !(url.starts_with(&api_prefix) || url.contains(".slack.com/api/")) {
                continue;
            }

            let headers = event.request.headers.inner();
            let cookie_header = headers
                .get("Cookie")
                .or_else(|| headers.get("cookie"))
                .and_then(|v| v.as_str());

            // The event itself only flags that a body exists; the bearer
            // token rides in that body, so pull it by request id. A miss
            // (body already gone) just means waiting for the next call.
            let post_data = if event.request.has_post_data.unwrap_or(false) {
                page.execute(GetRequestPostDataParams {
                    request_id: event.request_id.clone(),
                })
                .await
                .ok()
                .map(|resp| resp.result.post_data.clone())
            } else {
                None
            };

            let now = chrono::Utc::now().timestamp();
            let mut guard = credentials.lock().expect("credentials lock");
            if guard.absorb_request(post_data.as_deref(), cookie_header, now) {
                tracing::debug!("Captured credentials from {}", url);
                if let Err(e) = guard.save(&credentials_path) {
                    tracing::warn!("Failed to save captured credentials: {}", e);
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_noninteractive() {
        let opts = SessionOptions::default();
        assert!(opts.headless);
        assert!(!opts.interactive);
    }

    #[test]
    fn test_token_capture_requires_fetched_body() {
        let mut creds = SlackCredentials::default();

        // events without a body yield cookies only; that never freshens
        // the session on its own
        assert!(creds.absorb_request(None, Some("d=xoxd-1; b=lossless"), 10));
        assert!(!creds.is_fresh(10));

        // the body pulled for a has_post_data request carries the token
        assert!(creds.absorb_request(Some("token=xoxc-1234-abcd&blocks=%5B%5D"), None, 20));
        assert_eq!(creds.token, "xoxc-1234-abcd");
        assert!(creds.is_fresh(20));
    }

    #[test]
    fn test_captured_request_matching_prefix() {
        // The listener's URL filter, exercised without a browser.
        let ctx = WorkspaceContext::new("https://acme.slack.com", "T123", "/tmp/sv");
        let api_prefix = ctx.api_base();

        let matching = "https://acme.slack.com/api/conversations.history";
        let edge = "https://edgeapi.slack.com/api/client.userBoot";
        let other = "https://acme.slack.com/messages";

        assert!(matching.starts_with(&api_prefix));
        assert!(edge.contains(".slack.com/api/"));
        assert!(!other.starts_with(&api_prefix) && !other.contains(".slack.com/api/"));
    }
}
