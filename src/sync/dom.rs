//! DOM fallback history collection
//!
//! When the API path is closed (membership or scope restrictions), history
//! is collected from the rendered client instead: navigate to the channel,
//! scroll the message pane toward the beginning, and lift whatever message
//! nodes the virtual list has materialized. The result is shaped like the
//! API output so everything downstream is path-agnostic.

use std::time::Duration;

use chromiumoxide::Page;
use serde::Deserialize;

use crate::sync::types::{ts_value, Provenance, RawMessage, Reaction, SyncError};

const MAX_SCROLL_PASSES: usize = 60;
const SETTLE_AFTER_SCROLL: Duration = Duration::from_millis(900);
const SETTLE_AFTER_NAVIGATION: Duration = Duration::from_secs(3);
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive passes without new messages before history is considered
/// fully materialized.
const STALL_LIMIT: usize = 3;

/// Message fields the extraction script lifts from one rendered node.
#[derive(Debug, Deserialize)]
struct DomNode {
    ts: Option<String>,
    user: Option<String>,
    sender_name: Option<String>,
    text: Option<String>,
    #[serde(default)]
    reactions: Vec<DomReaction>,
}

#[derive(Debug, Deserialize)]
struct DomReaction {
    name: String,
    count: i64,
}

/// Runs entirely in the page. Timestamps come from `data-item-key`, the
/// sender id from the message sender button, and reactions from the pill
/// labels. Nodes without a timestamp (day dividers, typing rows) yield null
/// entries the Rust side drops.
const EXTRACT_SCRIPT: &str = r#"
() => {
    const items = document.querySelectorAll('[data-qa="virtual-list-item"]');
    const out = [];
    for (const item of items) {
        const ts = item.getAttribute('data-item-key');
        if (!ts || !/^\d+\.\d+$/.test(ts)) continue;
        const sender = item.querySelector('[data-message-sender]');
        const senderName = item.querySelector('[data-qa="message_sender_name"]');
        const body = item.querySelector('[data-qa="message-text"]');
        const reactions = [];
        for (const pill of item.querySelectorAll('[data-qa="reaction"]')) {
            const label = pill.getAttribute('aria-label') || '';
            const m = label.match(/^(\d+)\s+react(?:ion|ed)s?.*:([^:]+):/);
            if (m) reactions.push({ name: m[2], count: parseInt(m[1], 10) });
        }
        out.push({
            ts: ts,
            user: sender ? sender.getAttribute('data-message-sender') : null,
            sender_name: senderName ? senderName.textContent : null,
            text: body ? body.innerText : null,
            reactions: reactions,
        });
    }
    return JSON.stringify(out);
}
"#;

const SCROLL_SCRIPT: &str = r#"
() => {
    const pane = document.querySelector('.c-scrollbar__hider')
        || document.querySelector('[data-qa="slack_kit_scrollbar"]');
    if (!pane) return false;
    pane.scrollTop = 0;
    return true;
}
"#;

/// Collects channel history from the rendered client. Borrows the session's
/// page; one scraper per channel visit.
pub struct DomScraper<'a> {
    page: &'a Page,
    app_client_url: String,
}

impl<'a> DomScraper<'a> {
    pub fn new(page: &'a Page, app_client_url: String) -> Self {
        Self {
            page,
            app_client_url,
        }
    }

    /// Navigate to the channel and scroll-collect until either the oldest
    /// wanted timestamp is on screen, the pane stops yielding new messages,
    /// or the pass budget runs out. A script timeout during a pass ends the
    /// collection with what was gathered rather than failing the channel.
    pub async fn fetch_channel(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
    ) -> Result<Vec<RawMessage>, SyncError> {
        let url = format!("{}/{}", self.app_client_url, channel_id);
        self.page
            .goto(url.as_str())
            .await
            .map_err(|e| SyncError::Browser(e.to_string()))?;
        tokio::time::sleep(SETTLE_AFTER_NAVIGATION).await;

        let cut = oldest.map(ts_value);
        let mut collected: Vec<RawMessage> = Vec::new();
        let mut stalled = 0usize;

        for pass in 0..MAX_SCROLL_PASSES {
            let nodes = match self.extract_pass().await {
                Ok(nodes) => nodes,
                Err(SyncError::Timeout(_)) => {
                    tracing::warn!(
                        "Extraction pass {} timed out in {}, treating as end of history",
                        pass,
                        channel_id
                    );
                    break;
                }
                Err(e) => return Err(e),
            };

            let before = collected.len();
            merge_nodes(&mut collected, nodes);
            let oldest_seen = collected.first().map(|m| ts_value(&m.ts));

            if let (Some(cut), Some(seen)) = (cut, oldest_seen) {
                if seen <= cut {
                    tracing::debug!("Reached incremental boundary in {}", channel_id);
                    break;
                }
            }
            if collected.len() == before {
                stalled += 1;
                if stalled >= STALL_LIMIT {
                    tracing::debug!(
                        "No new messages after {} passes in {}, history exhausted",
                        stalled,
                        channel_id
                    );
                    break;
                }
            } else {
                stalled = 0;
            }

            if !self.scroll_to_top().await? {
                // no scroll pane means the conversation fits on one screen
                break;
            }
            tokio::time::sleep(SETTLE_AFTER_SCROLL).await;
        }

        tracing::info!(
            "DOM collection gathered {} messages from {}",
            collected.len(),
            channel_id
        );
        Ok(collected)
    }

    async fn extract_pass(&self) -> Result<Vec<DomNode>, SyncError> {
        let result =
            tokio::time::timeout(SCRIPT_TIMEOUT, self.page.evaluate_function(EXTRACT_SCRIPT))
            .await
            .map_err(|_| SyncError::Timeout("message extraction script".into()))?
            .map_err(|e| SyncError::Browser(e.to_string()))?;
        let json: String = result
            .into_value()
            .map_err(|e| SyncError::Browser(format!("extraction result: {}", e)))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn scroll_to_top(&self) -> Result<bool, SyncError> {
        let result =
            tokio::time::timeout(SCRIPT_TIMEOUT, self.page.evaluate_function(SCROLL_SCRIPT))
            .await
            .map_err(|_| SyncError::Timeout("scroll script".into()))?
            .map_err(|e| SyncError::Browser(e.to_string()))?;
        Ok(result.into_value().unwrap_or(false))
    }
}

/// Fold one pass's nodes into the accumulated set, dropping nodes already
/// seen and keeping the whole set ordered oldest-first.
fn merge_nodes(collected: &mut Vec<RawMessage>, nodes: Vec<DomNode>) {
    for node in nodes {
        if let Some(msg) = node_to_message(node) {
            if collected.iter().any(|m| m.ts == msg.ts) {
                continue;
            }
            collected.push(msg);
        }
    }
    collected.sort_by(|a, b| {
        ts_value(&a.ts)
            .partial_cmp(&ts_value(&b.ts))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn node_to_message(node: DomNode) -> Option<RawMessage> {
    let ts = node.ts?;
    // continuation rows repeat the previous sender without a name label;
    // the id attribute is still present on authored rows
    let bot_name = match (&node.user, &node.sender_name) {
        (None, Some(name)) if !name.trim().is_empty() => Some(name.trim().to_string()),
        _ => None,
    };
    Some(RawMessage {
        ts,
        user: node.user,
        text: node.text.unwrap_or_default(),
        thread_ts: None,
        reply_count: None,
        reactions: node
            .reactions
            .into_iter()
            .map(|r| Reaction {
                name: r.name,
                count: r.count,
            })
            .collect(),
        files: Vec::new(),
        subtype: None,
        bot_name,
        provenance: Provenance::Dom,
    })
}
