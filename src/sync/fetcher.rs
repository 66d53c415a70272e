//! Conversation history retrieval state machine
//!
//! Drives one channel through `Idle -> FastPathAttempt -> {FastPathSuccess |
//! FastPathDenied -> DomFallback} -> Merged -> Done`. The fast path is the
//! paginated web API; a permission denial switches to scraping the channel
//! view through the browser. Both paths feed the same `RawMessage` shape, so
//! everything downstream is source-agnostic.
//!
//! The machine runs over the narrow [`SlackAccess`] capability trait rather
//! than concrete clients, which keeps it testable with fakes.

use std::time::Duration;

use tokio::time::sleep;

use crate::sync::types::{ts_value, HistoryPage, Provenance, RawMessage, SyncError};

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 2000;

/// The three retrieval capabilities the fetcher needs from the outside
/// world. Implemented for real by the API client + browser session pair.
#[allow(async_fn_in_trait)]
pub trait SlackAccess {
    async fn fetch_history_page(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, SyncError>;

    async fn fetch_thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> Result<Vec<RawMessage>, SyncError>;

    async fn fetch_via_dom(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
    ) -> Result<Vec<RawMessage>, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Idle,
    FastPathAttempt,
    FastPathSuccess,
    FastPathDenied,
    DomFallback,
    Merged,
    Done,
}

#[derive(Debug)]
pub struct FetchOutcome {
    /// Render-ready ordering: parents ascending by ts, each immediately
    /// followed by its replies.
    pub messages: Vec<RawMessage>,
    /// Which path produced the data.
    pub via: Provenance,
}

/// Retry behavior for transient failures (429, timeouts). Tests shrink the
/// delay to zero.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
        }
    }
}

pub struct HistoryFetcher<A: SlackAccess> {
    access: A,
    retry: RetryPolicy,
    phase: FetchPhase,
}

impl<A: SlackAccess> HistoryFetcher<A> {
    pub fn new(access: A) -> Self {
        Self {
            access,
            retry: RetryPolicy::default(),
            phase: FetchPhase::Idle,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn phase(&self) -> FetchPhase {
        self.phase
    }

    /// Fetch everything newer than `boundary` for one channel. An empty
    /// result is the `Idle -> Done` shortcut: the cursor is already at the
    /// head of the conversation.
    pub async fn fetch_channel(
        &mut self,
        channel_id: &str,
        boundary: Option<&str>,
    ) -> Result<FetchOutcome, SyncError> {
        self.phase = FetchPhase::FastPathAttempt;

        let (mut messages, via) = match self.fast_path(channel_id, boundary).await {
            Ok(msgs) => {
                self.phase = FetchPhase::FastPathSuccess;
                (msgs, Provenance::Api)
            }
            Err(SyncError::PermissionDenied(reason)) => {
                self.phase = FetchPhase::FastPathDenied;
                tracing::warn!(
                    "Fast path denied for {} ({}), falling back to DOM scrape",
                    channel_id,
                    reason
                );
                self.phase = FetchPhase::DomFallback;
                let msgs = self.access.fetch_via_dom(channel_id, boundary).await?;
                (msgs, Provenance::Dom)
            }
            Err(e) => return Err(e),
        };

        // The DOM path can over-fetch past the boundary; filter uniformly.
        if let Some(boundary) = boundary {
            let cut = ts_value(boundary);
            messages.retain(|m| ts_value(&m.ts) > cut);
        }

        self.phase = FetchPhase::Merged;
        let messages = group_for_render(messages);
        self.phase = FetchPhase::Done;

        tracing::debug!(
            "Fetched {} new messages for {} via {:?}",
            messages.len(),
            channel_id,
            via
        );
        Ok(FetchOutcome { messages, via })
    }

    /// Paginated API retrieval plus per-thread reply calls, deduplicated by
    /// `ts`. Pages arrive newest-first; pagination stops at the cursor
    /// boundary or when Slack reports no more pages.
    async fn fast_path(
        &self,
        channel_id: &str,
        boundary: Option<&str>,
    ) -> Result<Vec<RawMessage>, SyncError> {
        let mut collected: Vec<RawMessage> = Vec::new();
        let mut cursor: Option<String> = None;
        let boundary_value = boundary.map(ts_value);

        loop {
            let page = self
                .with_retry(|| {
                    self.access
                        .fetch_history_page(channel_id, boundary, cursor.as_deref())
                })
                .await?;

            let page_oldest = page
                .messages
                .iter()
                .map(|m| ts_value(&m.ts))
                .fold(f64::INFINITY, f64::min);
            collected.extend(page.messages);

            // Stop once the page reaches back to already-exported history.
            if let Some(cut) = boundary_value {
                if page_oldest <= cut {
                    break;
                }
            }
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        // Thread replies for every parent that has them. A failed reply
        // fetch degrades to the parent alone rather than failing the channel.
        let parents_with_threads: Vec<String> = collected
            .iter()
            .filter(|m| m.reply_count.unwrap_or(0) > 0 && !m.is_thread_reply())
            .map(|m| m.thread_ts.clone().unwrap_or_else(|| m.ts.clone()))
            .collect();

        for thread_ts in parents_with_threads {
            match self
                .with_retry(|| self.access.fetch_thread_replies(channel_id, &thread_ts))
                .await
            {
                Ok(replies) => collected.extend(replies),
                Err(e @ SyncError::RateLimited { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!("Skipping replies for thread {}: {}", thread_ts, e);
                }
            }
        }

        Ok(dedup_by_ts(collected))
    }

    /// Bounded retry for transient failures. 429s honor the server's
    /// retry-after hint; exhausting the budget surfaces `RateLimited` for
    /// this channel only.
    async fn with_retry<T, F, Fut>(&self, f: F) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        let mut attempts = 0;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(SyncError::Throttled { retry_after_secs }) => {
                    attempts += 1;
                    if attempts > self.retry.max_attempts {
                        return Err(SyncError::RateLimited { attempts });
                    }
                    let delay = match retry_after_secs {
                        Some(secs) => Duration::from_secs(secs),
                        None => self.retry.base_delay * (1 << attempts),
                    };
                    tracing::warn!(
                        "Rate limited, retry {}/{} after {:?}",
                        attempts,
                        self.retry.max_attempts,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(SyncError::Timeout(msg)) => {
                    attempts += 1;
                    if attempts > self.retry.max_attempts {
                        return Err(SyncError::Timeout(msg));
                    }
                    tracing::warn!(
                        "Timeout ({}), retry {}/{}",
                        msg,
                        attempts,
                        self.retry.max_attempts
                    );
                    sleep(self.retry.base_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn dedup_by_ts(messages: Vec<RawMessage>) -> Vec<RawMessage> {
    let mut seen = std::collections::HashSet::new();
    messages
        .into_iter()
        .filter(|m| seen.insert(m.ts.clone()))
        .collect()
}

/// Arrange messages for rendering: top-level messages ascending by `ts`,
/// each parent immediately followed by its replies (ascending by `ts`).
/// This grouping is a deliberate presentation choice, not fetch-order
/// fallout. A reply whose parent is not in the batch (parent already
/// exported in an earlier run) keeps its own timeline position.
pub fn group_for_render(messages: Vec<RawMessage>) -> Vec<RawMessage> {
    use std::collections::BTreeMap;

    let parent_ts: std::collections::HashSet<String> = messages
        .iter()
        .filter(|m| !m.is_thread_reply())
        .map(|m| m.ts.clone())
        .collect();

    // Keyed by the anchor ts: a parent anchors itself, a reply anchors on
    // its parent when present, otherwise on its own ts.
    let mut slots: BTreeMap<(u64, String), (Option<RawMessage>, Vec<RawMessage>)> = BTreeMap::new();

    let anchor_key = |ts: &str| ((ts_value(ts) * 1_000_000.0) as u64, ts.to_string());

    for msg in messages {
        if msg.is_thread_reply() {
            let parent = msg.thread_ts.clone().unwrap_or_default();
            let anchor = if parent_ts.contains(&parent) {
                anchor_key(&parent)
            } else {
                anchor_key(&msg.ts)
            };
            slots.entry(anchor).or_default().1.push(msg);
        } else {
            let key = anchor_key(&msg.ts);
            slots.entry(key).or_default().0 = Some(msg);
        }
    }

    let mut out = Vec::new();
    for (_, (parent, mut replies)) in slots {
        if let Some(p) = parent {
            out.push(p);
        }
        replies.sort_by(|a, b| {
            ts_value(&a.ts)
                .partial_cmp(&ts_value(&b.ts))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.extend(replies);
    }
    out
}
