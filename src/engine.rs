//! Export orchestration
//!
//! Wires the session, API client, resolver, tracker, rolodex, renderer and
//! writer into one run: resolve each requested target, fetch what is newer
//! than its cursor, render, write, and only then advance the cursor.
//! Channels are processed sequentially; one channel failing does not stop
//! the rest, but an expired session does.

use std::path::PathBuf;

use chrono::Utc;

use crate::export::{self, WriteMode};
use crate::render;
use crate::resolve::ConversationResolver;
use crate::rolodex::Rolodex;
use crate::session::{SessionManager, SessionOptions};
use crate::sync::client::ApiClient;
use crate::sync::dom::DomScraper;
use crate::sync::fetcher::{HistoryFetcher, SlackAccess};
use crate::sync::types::{ts_value, HistoryPage, Provenance, RawMessage, SyncError};
use crate::tracker::IncrementalTracker;
use crate::workspace::WorkspaceContext;

/// One run's request: which conversations, and whether to ignore the
/// stored cursors and rebuild the files from the beginning.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub targets: Vec<String>,
    pub full: bool,
}

#[derive(Debug)]
pub struct ChannelExport {
    pub target: String,
    pub channel_id: String,
    pub display_name: String,
    pub path: PathBuf,
    pub new_messages: usize,
    pub via: Provenance,
}

#[derive(Debug)]
pub struct ChannelFailure {
    pub target: String,
    pub error: SyncError,
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub exported: Vec<ChannelExport>,
    /// Targets already at the head of their conversation.
    pub up_to_date: Vec<String>,
    pub failures: Vec<ChannelFailure>,
}

/// Real retrieval capabilities: web API for the fast path, the live
/// browser page for the fallback.
struct LiveAccess<'a> {
    api: &'a ApiClient,
    session: &'a SessionManager,
}

impl SlackAccess for LiveAccess<'_> {
    async fn fetch_history_page(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, SyncError> {
        self.api.history_page(channel_id, oldest, cursor).await
    }

    async fn fetch_thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> Result<Vec<RawMessage>, SyncError> {
        self.api.thread_replies(channel_id, thread_ts).await
    }

    async fn fetch_via_dom(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
    ) -> Result<Vec<RawMessage>, SyncError> {
        let scraper = DomScraper::new(
            self.session.page(),
            self.session.context().app_client_url(),
        );
        scraper.fetch_channel(channel_id, oldest).await
    }
}

/// Run a full export pass. The browser is released on every exit path.
pub async fn run_export(
    ctx: &WorkspaceContext,
    session_opts: &SessionOptions,
    request: &ExportRequest,
) -> Result<ExportReport, SyncError> {
    std::fs::create_dir_all(ctx.export_dir())?;

    let mut session = SessionManager::start(ctx.clone(), session_opts).await?;
    let result = export_with_session(ctx, &session, session_opts, request).await;
    session.close().await?;
    result
}

async fn export_with_session(
    ctx: &WorkspaceContext,
    session: &SessionManager,
    session_opts: &SessionOptions,
    request: &ExportRequest,
) -> Result<ExportReport, SyncError> {
    authenticate(session, session_opts).await?;
    let api = ApiClient::new(ctx, &session.credentials())?;

    let rolodex = refreshed_rolodex(ctx, &api).await;
    let resolver = refreshed_resolver(ctx, &api, &rolodex, &request.targets).await?;
    let mut tracker = IncrementalTracker::load(&ctx.tracker_file())?;

    let mut report = ExportReport::default();
    for target in &request.targets {
        let resolved = match resolver.resolve(target) {
            Ok(r) => r,
            Err(error) => {
                tracing::error!("Cannot resolve '{}': {}", target, error);
                report.failures.push(ChannelFailure {
                    target: target.clone(),
                    error,
                });
                continue;
            }
        };

        match export_channel(
            ctx,
            LiveAccess { api: &api, session },
            &mut tracker,
            &rolodex,
            target,
            &resolved.channel_id,
            &resolved.display_name,
            request.full,
        )
        .await
        {
            Ok(Some(exported)) => report.exported.push(exported),
            Ok(None) => {
                tracing::info!("{} is up to date", resolved.display_name);
                report.up_to_date.push(target.clone());
            }
            // a dead session fails every remaining channel the same way
            Err(SyncError::AuthExpired) => return Err(SyncError::AuthExpired),
            Err(error) => {
                tracing::error!("Export of '{}' failed: {}", target, error);
                report.failures.push(ChannelFailure {
                    target: target.clone(),
                    error,
                });
            }
        }
    }

    Ok(report)
}

async fn authenticate(
    session: &SessionManager,
    opts: &SessionOptions,
) -> Result<(), SyncError> {
    session.ensure_logged_in(opts).await?;
    if session.is_valid().await? {
        return Ok(());
    }
    if !opts.interactive {
        return Err(SyncError::AuthRequired(
            "stored session rejected; re-run with a visible window to sign in".into(),
        ));
    }
    // stale profile: let the user sign in again in the open window
    tracing::info!("Stored session rejected, waiting for a fresh sign-in");
    session.ensure_logged_in(opts).await?;
    if session.is_valid().await? {
        Ok(())
    } else {
        Err(SyncError::AuthRequired(
            "sign-in did not produce usable credentials".into(),
        ))
    }
}

/// Refresh the name cache from the API, degrading to whatever is on disk
/// when the member list is not readable with this token.
async fn refreshed_rolodex(ctx: &WorkspaceContext, api: &ApiClient) -> Rolodex {
    let mut rolodex = Rolodex::load(&ctx.rolodex_file());
    match api.list_users().await {
        Ok(users) => {
            rolodex.merge_live(&users);
            if let Err(e) = rolodex.save() {
                tracing::warn!("Failed to save rolodex: {}", e);
            }
        }
        Err(e) => {
            tracing::warn!(
                "User list refresh failed ({}), using {} cached names",
                e,
                rolodex.len()
            );
        }
    }
    rolodex
}

/// The channel map refreshes only when a requested target is not already
/// resolvable from the cache; `conversations.list` is the most expensive
/// call in a run.
async fn refreshed_resolver(
    ctx: &WorkspaceContext,
    api: &ApiClient,
    rolodex: &Rolodex,
    targets: &[String],
) -> Result<ConversationResolver, SyncError> {
    let mut resolver = ConversationResolver::load(&ctx.channel_map_file());
    if resolver.needs_refresh(targets) {
        tracing::info!("Refreshing conversation map");
        let channels = api.list_conversations().await?;
        resolver.absorb(&channels, rolodex);
        resolver.save().map_err(SyncError::Write)?;
    }
    Ok(resolver)
}

#[allow(clippy::too_many_arguments)]
async fn export_channel<A: SlackAccess>(
    ctx: &WorkspaceContext,
    access: A,
    tracker: &mut IncrementalTracker,
    rolodex: &Rolodex,
    target: &str,
    channel_id: &str,
    display_name: &str,
    full: bool,
) -> Result<Option<ChannelExport>, SyncError> {
    let boundary = if full {
        tracker.clear(channel_id);
        None
    } else {
        tracker.boundary_for(channel_id).map(String::from)
    };

    let mut fetcher = HistoryFetcher::new(access);
    let outcome = fetcher.fetch_channel(channel_id, boundary.as_deref()).await?;

    let path = ctx.export_path(&export::safe_filename(display_name, channel_id));
    if outcome.messages.is_empty() && !full {
        return Ok(None);
    }

    // no boundary means the whole history was fetched, whether via --full
    // or a cleared cursor; rewriting keeps the file free of duplicates
    let mode = if boundary.is_none() || !path.exists() {
        WriteMode::Fresh
    } else {
        WriteMode::Append
    };
    let rendered = render::render(
        display_name,
        channel_id,
        &outcome.messages,
        rolodex,
        Utc::now(),
    );
    let written = export::write(&path, &rendered, mode)?;

    // the cursor moves only after the bytes are durably on disk
    if let Some(ts) = newest_ts(&outcome.messages) {
        tracker.advance(channel_id, &ts);
        tracker.flush()?;
    }

    tracing::info!(
        "Exported {} new messages from {} to {}",
        written.messages_written,
        display_name,
        written.path.display()
    );
    Ok(Some(ChannelExport {
        target: target.to_string(),
        channel_id: channel_id.to_string(),
        display_name: display_name.to_string(),
        path: written.path,
        new_messages: written.messages_written,
        via: outcome.via,
    }))
}

/// Highest timestamp in the batch, replies included; this is what the
/// cursor advances to.
fn newest_ts(messages: &[RawMessage]) -> Option<String> {
    messages
        .iter()
        .max_by(|a, b| {
            ts_value(&a.ts)
                .partial_cmp(&ts_value(&b.ts))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|m| m.ts.clone())
}
