//! Message data model and error definitions

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("credentials expired, relaunch the session to refresh them")]
    AuthExpired,

    #[error("unable to resolve '{target}' (near matches: {candidates:?})")]
    Resolution {
        target: String,
        candidates: Vec<String>,
    },

    #[error("'{target}' matches multiple conversations: {candidates:?}")]
    AmbiguousTarget {
        target: String,
        candidates: Vec<String>,
    },

    /// Transient 429 from one call; retried locally by the fetcher.
    #[error("throttled (retry-after: {retry_after_secs:?}s)")]
    Throttled { retry_after_secs: Option<u64> },

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network timeout: {0}")]
    Timeout(String),

    #[error("write failure: {0}")]
    Write(std::io::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where a message was obtained. The fallback scraper must produce records
/// indistinguishable from the fast path apart from this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Api,
    Dom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub url: Option<String>,
}

/// One message as retrieved from either source, immutable once produced.
/// `ts` is Slack's per-channel timestamp key: unique, totally ordered,
/// formatted `"<unix-seconds>.<serial>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub ts: String,
    pub user: Option<String>,
    pub text: String,
    pub thread_ts: Option<String>,
    pub reply_count: Option<i64>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
    pub subtype: Option<String>,
    /// Posting bot's username when the message came from a bot.
    pub bot_name: Option<String>,
    pub provenance: Provenance,
}

impl RawMessage {
    /// Build a message from one entry of a `conversations.history` or
    /// `conversations.replies` payload. Missing fields default rather than
    /// fail; a message without a `ts` is useless and yields `None`.
    pub fn from_json(m: &serde_json::Value, provenance: Provenance) -> Option<Self> {
        let ts = m["ts"].as_str()?.to_string();

        let reactions = m["reactions"]
            .as_array()
            .map(|rs| {
                rs.iter()
                    .filter_map(|r| {
                        Some(Reaction {
                            name: r["name"].as_str()?.to_string(),
                            count: r["count"].as_i64().unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let files = m["files"]
            .as_array()
            .map(|fs| {
                fs.iter()
                    .map(|f| FileAttachment {
                        name: f["name"].as_str().unwrap_or("unnamed file").to_string(),
                        url: f["url_private"].as_str().map(String::from),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let bot_name = if m.get("bot_id").and_then(|b| b.as_str()).is_some()
            || m["subtype"].as_str() == Some("bot_message")
        {
            Some(m["username"].as_str().unwrap_or("Bot").to_string())
        } else {
            None
        };

        Some(Self {
            ts,
            user: m["user"].as_str().map(String::from),
            text: m["text"].as_str().unwrap_or_default().to_string(),
            thread_ts: m["thread_ts"].as_str().map(String::from),
            reply_count: m["reply_count"].as_i64(),
            reactions,
            files,
            subtype: m["subtype"].as_str().map(String::from),
            bot_name,
            provenance,
        })
    }

    /// True for a thread reply (carries a `thread_ts` different from its own
    /// `ts`; Slack sets `thread_ts == ts` on the parent itself).
    pub fn is_thread_reply(&self) -> bool {
        matches!(&self.thread_ts, Some(parent) if parent != &self.ts)
    }
}

/// Numeric value of a `ts` key for ordering and cursor comparisons.
pub fn ts_value(ts: &str) -> f64 {
    ts.parse().unwrap_or(0.0)
}

/// One page of channel history from the fast path.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<RawMessage>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// A conversation as listed by `conversations.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub is_private: bool,
    pub is_im: bool,
    pub is_mpim: bool,
    /// For DMs, the user ID of the other person.
    pub user: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlackUser {
    pub id: String,
    pub name: String,
    pub real_name: Option<String>,
    pub display_name: Option<String>,
}

impl SlackUser {
    /// Preferred human name: display name, then real name, then handle.
    pub fn best_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.real_name.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or(&self.name)
    }
}
