//! Captured browser-session credentials
//!
//! Slack's web client authenticates API calls with a bearer token (`xoxc-…`)
//! sent in request bodies plus a session cookie (`d`, an `xoxd-…` value).
//! Both are captured passively from intercepted traffic and cached here;
//! they go stale roughly an hour after capture.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::workspace::atomic_write;

/// Captured material older than this is treated as expired.
const MAX_AGE_SECS: i64 = 3600;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"xox[a-z]-[A-Za-z0-9-]+").expect("valid token regex"));

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackCredentials {
    pub token: String,
    /// Cookie name -> value, ordered so the rendered header is stable.
    pub cookies: BTreeMap<String, String>,
    pub user_id: String,
    pub team_id: String,
    /// Unix seconds of the last useful capture.
    pub captured_at: i64,
}

impl SlackCredentials {
    /// Load from disk; a missing or unreadable file yields empty credentials
    /// rather than an error, since they are refreshed opportunistically.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Ignoring corrupt credentials file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).expect("credentials serialize");
        atomic_write(path, &json)
    }

    /// Both pieces present and captured within the last hour.
    pub fn is_fresh(&self, now: i64) -> bool {
        !self.token.is_empty() && !self.cookies.is_empty() && now - self.captured_at < MAX_AGE_SECS
    }

    /// Drop the captured material after a 401/403 so the next run knows a
    /// relaunch is needed.
    pub fn invalidate(&mut self) {
        self.token.clear();
        self.captured_at = 0;
    }

    /// Absorb one intercepted request against the workspace API prefix.
    /// Returns true when something useful was captured.
    pub fn absorb_request(
        &mut self,
        post_body: Option<&str>,
        cookie_header: Option<&str>,
        now: i64,
    ) -> bool {
        let mut captured = false;

        if let Some(body) = post_body {
            if let Some(m) = TOKEN_RE.find(body) {
                self.token = m.as_str().to_string();
                captured = true;
            }
        }

        if let Some(header) = cookie_header {
            for pair in header.split(';') {
                if let Some((key, value)) = pair.trim().split_once('=') {
                    self.cookies.insert(key.to_string(), value.to_string());
                    captured = true;
                }
            }
        }

        if captured {
            self.captured_at = now;
        }
        captured
    }

    /// Record identity fields seen in API responses (`auth.test`,
    /// `client.userBoot`).
    pub fn absorb_identity(&mut self, user_id: Option<&str>, team_id: Option<&str>) {
        if let Some(uid) = user_id {
            self.user_id = uid.to_string();
        }
        if let Some(tid) = team_id {
            self.team_id = tid.to_string();
        }
    }

    /// Render the cookie map as a `Cookie:` header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
