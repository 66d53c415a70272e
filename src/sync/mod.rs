//! Conversation retrieval module

pub mod client;
pub mod dom;
pub mod fetcher;
pub mod types;

// Re-export commonly used types
pub use client::ApiClient;
pub use dom::DomScraper;
pub use fetcher::{FetchOutcome, FetchPhase, HistoryFetcher, RetryPolicy, SlackAccess};
pub use types::{
    ts_value, ChannelInfo, FileAttachment, HistoryPage, Provenance, RawMessage, Reaction,
    SlackUser, SyncError,
};
