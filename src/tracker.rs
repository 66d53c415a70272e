//! Per-channel incremental sync cursor
//!
//! Maps channel ID to the `ts` of the newest message already exported. The
//! cursor only ever moves forward, and only after the corresponding file
//! write has been confirmed durable. Deleting an entry (or the file) forces
//! the next run to do a full backfill for that channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sync::types::{ts_value, SyncError};
use crate::workspace::atomic_write;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerFile {
    #[serde(default)]
    channels: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct IncrementalTracker {
    path: PathBuf,
    state: TrackerFile,
}

impl IncrementalTracker {
    /// Load once at run start. Missing file means every channel is a full
    /// backfill; a corrupt file is reported rather than silently wiped.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let state = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrackerFile::default(),
            Err(e) => return Err(SyncError::Io(e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// The fetch boundary for a channel, `None` for a full backfill.
    pub fn boundary_for(&self, channel_id: &str) -> Option<&str> {
        self.state.channels.get(channel_id).map(String::as_str)
    }

    /// Advance the cursor. Only called after `ExportWriter` confirms the
    /// write; a `ts` at or behind the current cursor is ignored so the
    /// cursor never moves backward.
    pub fn advance(&mut self, channel_id: &str, ts: &str) {
        let current = self.boundary_for(channel_id).map(ts_value).unwrap_or(0.0);
        if ts_value(ts) > current {
            self.state
                .channels
                .insert(channel_id.to_string(), ts.to_string());
        } else {
            tracing::debug!(
                "Ignoring non-advancing cursor for {}: {} <= {}",
                channel_id,
                ts,
                current
            );
        }
    }

    /// Drop a channel's cursor, forcing a full backfill next run.
    pub fn clear(&mut self, channel_id: &str) {
        self.state.channels.remove(channel_id);
    }

    /// Persist the current state atomically. Called after each channel
    /// completes, so a crash mid-run loses at most the in-flight channel.
    pub fn flush(&self) -> Result<(), SyncError> {
        let json = serde_json::to_string_pretty(&self.state)?;
        atomic_write(&self.path, &json).map_err(SyncError::Write)
    }
}
