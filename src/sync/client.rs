//! Fast-path Slack web API client
//!
//! Speaks the same form-POST dialect the web client itself uses, with the
//! captured `xoxc` bearer token in the body and the session cookies on the
//! request. All calls go through the workspace's own `/api` prefix.

use serde_json::Value;

use crate::session::credentials::SlackCredentials;
use crate::sync::types::{
    ChannelInfo, HistoryPage, Provenance, RawMessage, SlackUser, SyncError,
};
use crate::workspace::WorkspaceContext;

const PAGE_LIMIT: usize = 200;
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct ApiClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    cookie_header: String,
}

impl ApiClient {
    /// Build a client over captured credentials. Empty credentials cannot
    /// make a single authenticated call, so they fail fast here.
    pub fn new(ctx: &WorkspaceContext, creds: &SlackCredentials) -> Result<Self, SyncError> {
        if creds.token.is_empty() || creds.cookies.is_empty() {
            return Err(SyncError::AuthRequired(
                "no captured token/cookie pair".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            api_base: ctx.api_base(),
            token: creds.token.clone(),
            cookie_header: creds.cookie_header(),
        })
    }

    async fn post_form(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Value, SyncError> {
        let mut form: Vec<(&str, String)> = vec![("token", self.token.clone())];
        form.extend_from_slice(params);

        let response = self
            .http
            .post(format!("{}/{}", self.api_base, endpoint))
            .header("cookie", &self.cookie_header)
            .header("user-agent", "Mozilla/5.0")
            .header("accept", "application/json, text/plain, */*")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout(format!("{} timed out", endpoint))
                } else {
                    SyncError::Http(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(SyncError::Throttled { retry_after_secs });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SyncError::AuthExpired);
        }
        if !status.is_success() {
            return Err(SyncError::Api(format!("{}: HTTP {}", endpoint, status)));
        }

        let json: Value = response.json().await?;
        if !json["ok"].as_bool().unwrap_or(false) {
            let error = json["error"].as_str().unwrap_or("unknown error");
            return Err(classify_api_error(endpoint, error));
        }
        Ok(json)
    }

    /// Cheap session probe. `Ok` carries the authed user/team IDs.
    pub async fn auth_test(&self) -> Result<(String, String), SyncError> {
        let json = self.post_form("auth.test", &[]).await?;
        Ok((
            json["user_id"].as_str().unwrap_or_default().to_string(),
            json["team_id"].as_str().unwrap_or_default().to_string(),
        ))
    }

    /// One page of `conversations.history`, oldest-bounded, API-cursor
    /// paginated. Slack returns pages newest-first.
    pub async fn history_page(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, SyncError> {
        let mut params = vec![
            ("channel", channel_id.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
            ("inclusive", "false".to_string()),
        ];
        if let Some(ts) = oldest {
            params.push(("oldest", ts.to_string()));
        }
        if let Some(c) = cursor {
            params.push(("cursor", c.to_string()));
        }

        let json = self.post_form("conversations.history", &params).await?;
        Ok(parse_history_page(&json))
    }

    /// Replies for one thread, parent excluded.
    pub async fn thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> Result<Vec<RawMessage>, SyncError> {
        let params = vec![
            ("channel", channel_id.to_string()),
            ("ts", thread_ts.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let json = self.post_form("conversations.replies", &params).await?;

        let replies = json["messages"]
            .as_array()
            .map(|msgs| {
                msgs.iter()
                    .skip(1) // first entry is the parent
                    .filter_map(|m| RawMessage::from_json(m, Provenance::Api))
                    .collect()
            })
            .unwrap_or_default();
        Ok(replies)
    }

    /// All conversations visible to the session, across types, fully
    /// paginated.
    pub async fn list_conversations(&self) -> Result<Vec<ChannelInfo>, SyncError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![
                ("types", "public_channel,private_channel,mpim,im".to_string()),
                ("limit", "1000".to_string()),
                ("exclude_archived", "false".to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }

            let json = self.post_form("conversations.list", &params).await?;
            if let Some(channels) = json["channels"].as_array() {
                for ch in channels {
                    let is_private = ch["is_private"].as_bool().unwrap_or(false);
                    let is_group = ch["is_group"].as_bool().unwrap_or(false);
                    all.push(ChannelInfo {
                        id: ch["id"].as_str().unwrap_or_default().to_string(),
                        name: ch["name"].as_str().unwrap_or_default().to_string(),
                        // legacy private channels carry is_group instead
                        is_private: is_private || is_group,
                        is_im: ch["is_im"].as_bool().unwrap_or(false),
                        is_mpim: ch["is_mpim"].as_bool().unwrap_or(false),
                        user: ch["user"].as_str().map(String::from),
                    });
                }
            }

            cursor = next_cursor(&json);
            if cursor.is_none() {
                break;
            }
        }

        tracing::debug!("Listed {} conversations", all.len());
        Ok(all)
    }

    /// Workspace user directory, bots and deleted accounts skipped.
    pub async fn list_users(&self) -> Result<Vec<SlackUser>, SyncError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![("limit", "1000".to_string())];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }

            let json = self.post_form("users.list", &params).await?;
            if let Some(members) = json["members"].as_array() {
                for member in members {
                    if member["is_bot"].as_bool().unwrap_or(false)
                        || member["deleted"].as_bool().unwrap_or(false)
                    {
                        continue;
                    }
                    all.push(SlackUser {
                        id: member["id"].as_str().unwrap_or_default().to_string(),
                        name: member["name"].as_str().unwrap_or_default().to_string(),
                        real_name: member["real_name"].as_str().map(String::from),
                        display_name: member["profile"]["display_name"]
                            .as_str()
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                    });
                }
            }

            cursor = next_cursor(&json);
            if cursor.is_none() {
                break;
            }
        }

        tracing::debug!("Listed {} users", all.len());
        Ok(all)
    }
}

fn next_cursor(json: &Value) -> Option<String> {
    json["response_metadata"]["next_cursor"]
        .as_str()
        .filter(|c| !c.is_empty())
        .map(String::from)
}

pub(crate) fn parse_history_page(json: &Value) -> HistoryPage {
    let messages = json["messages"]
        .as_array()
        .map(|msgs| {
            msgs.iter()
                .filter_map(|m| RawMessage::from_json(m, Provenance::Api))
                .collect()
        })
        .unwrap_or_default();

    HistoryPage {
        messages,
        has_more: json["has_more"].as_bool().unwrap_or(false),
        next_cursor: next_cursor(json),
    }
}

/// Map Slack's `ok: false` error strings onto the error taxonomy. Permission
/// shapes trigger the DOM fallback upstream; auth shapes end the session.
fn classify_api_error(endpoint: &str, error: &str) -> SyncError {
    match error {
        "invalid_auth" | "not_authed" | "token_revoked" | "token_expired" => SyncError::AuthExpired,
        "not_in_channel" | "missing_scope" | "channel_not_found" | "access_denied"
        | "restricted_action" => SyncError::PermissionDenied(error.to_string()),
        "ratelimited" => SyncError::Throttled {
            retry_after_secs: None,
        },
        _ => SyncError::Api(format!("{}: {}", endpoint, error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_requires_credentials() {
        let ctx = WorkspaceContext::new("https://acme.slack.com", "T123", "/tmp/sv");
        let creds = SlackCredentials::default();
        assert!(matches!(
            ApiClient::new(&ctx, &creds),
            Err(SyncError::AuthRequired(_))
        ));
    }

    #[test]
    fn test_new_with_captured_credentials() {
        let ctx = WorkspaceContext::new("https://acme.slack.com", "T123", "/tmp/sv");
        let mut creds = SlackCredentials::default();
        creds.absorb_request(Some("token=xoxc-123"), Some("d=xoxd-1"), 0);
        assert!(ApiClient::new(&ctx, &creds).is_ok());
    }

    #[test]
    fn test_parse_history_page() {
        let json = json!({
            "ok": true,
            "messages": [
                {"ts": "200.000000", "user": "U1", "text": "newest"},
                {"ts": "100.000000", "user": "U2", "text": "oldest"},
                {"no_ts": "dropped"}
            ],
            "has_more": true,
            "response_metadata": {"next_cursor": "abc"}
        });
        let page = parse_history_page(&json);
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].ts, "200.000000");
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_history_page_empty_cursor_is_none() {
        let json = json!({"ok": true, "messages": [], "has_more": false,
                          "response_metadata": {"next_cursor": ""}});
        let page = parse_history_page(&json);
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_classify_permission_errors() {
        for e in ["not_in_channel", "missing_scope", "access_denied"] {
            assert!(matches!(
                classify_api_error("conversations.history", e),
                SyncError::PermissionDenied(_)
            ));
        }
    }

    #[test]
    fn test_classify_auth_errors() {
        for e in ["invalid_auth", "not_authed", "token_revoked"] {
            assert!(matches!(
                classify_api_error("auth.test", e),
                SyncError::AuthExpired
            ));
        }
    }

    #[test]
    fn test_classify_ratelimited_body() {
        assert!(matches!(
            classify_api_error("users.list", "ratelimited"),
            SyncError::Throttled { .. }
        ));
    }

    #[test]
    fn test_classify_unknown_error() {
        let err = classify_api_error("conversations.history", "fatal_error");
        assert!(matches!(err, SyncError::Api(_)));
        assert!(err.to_string().contains("conversations.history"));
    }
}
