//! Markdown export files
//!
//! One file per conversation. A fresh export writes the header block plus
//! rendered lines; an incremental run appends new lines and rewrites only
//! the header's message count. Every write lands atomically (full new
//! contents or the untouched previous file), which is what lets the caller
//! advance the cursor afterwards.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::render::RenderedConversation;
use crate::sync::types::SyncError;
use crate::workspace::atomic_write;

static COUNT_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\*\*Message Count:\*\* (\d+)$").expect("count line regex"));
static UNSAFE_CHARS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*@\s]+"#).expect("filename regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// First export, or a forced full backfill: the file is written from
    /// scratch. Rewriting on backfill is what keeps a re-export free of
    /// duplicate entries.
    Fresh,
    /// Incremental run against an existing file.
    Append,
}

#[derive(Debug, Clone)]
pub struct WriteResult {
    pub path: PathBuf,
    pub messages_written: usize,
}

/// Filesystem-safe file stem for a conversation, `channel_<id>` fallback.
pub fn safe_filename(channel_name: &str, channel_id: &str) -> String {
    let base = channel_name.trim_start_matches(['#', '@']);
    let safe = UNSAFE_CHARS_RE.replace_all(base, "_");
    let safe = safe.trim_matches('_');
    if safe.is_empty() {
        format!("channel_{}", channel_id)
    } else {
        safe.to_string()
    }
}

pub fn write(
    path: &Path,
    rendered: &RenderedConversation,
    mode: WriteMode,
) -> Result<WriteResult, SyncError> {
    let contents = match mode {
        WriteMode::Fresh => compose_fresh(rendered),
        WriteMode::Append => {
            let existing = std::fs::read_to_string(path).map_err(SyncError::Write)?;
            compose_append(&existing, rendered)?
        }
    };

    atomic_write(path, &contents).map_err(SyncError::Write)?;
    tracing::debug!(
        "Wrote {} message lines to {}",
        rendered.lines.len(),
        path.display()
    );

    Ok(WriteResult {
        path: path.to_path_buf(),
        messages_written: rendered.lines.len(),
    })
}

fn compose_fresh(rendered: &RenderedConversation) -> String {
    let mut out = String::new();
    for line in &rendered.header {
        out.push_str(line);
        out.push('\n');
    }
    for line in &rendered.lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn compose_append(existing: &str, rendered: &RenderedConversation) -> Result<String, SyncError> {
    // Bump the header count by the number of appended messages.
    let caps = COUNT_LINE_RE.captures(existing).ok_or_else(|| {
        SyncError::Write(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "existing export has no message-count header",
        ))
    })?;
    let old_count: usize = caps[1].parse().unwrap_or(0);
    let new_count = old_count + rendered.message_count;

    let mut out = COUNT_LINE_RE
        .replace(existing, format!("**Message Count:** {}", new_count))
        .into_owned();

    if !out.ends_with('\n') {
        out.push('\n');
    }
    for line in &rendered.lines {
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderedConversation;

    fn rendered(lines: &[&str]) -> RenderedConversation {
        RenderedConversation {
            header: vec![
                "# #general".into(),
                String::new(),
                "**Channel ID:** C123".into(),
                "**Exported:** 2026-01-01 00:00:00".into(),
                format!("**Message Count:** {}", lines.len()),
                String::new(),
                "---".into(),
                String::new(),
            ],
            lines: lines.iter().map(|s| s.to_string()).collect(),
            message_count: lines.len(),
        }
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("#general", "C123"), "general");
        assert_eq!(safe_filename("proj: q1/q2 plan", "C123"), "proj_q1_q2_plan");
        assert_eq!(safe_filename("@", "C123"), "channel_C123");
        assert_eq!(safe_filename("", "D456"), "channel_D456");
    }

    #[test]
    fn test_fresh_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("general.md");

        let result = write(&path, &rendered(&["- **t** *a*: one"]), WriteMode::Fresh).unwrap();
        assert_eq!(result.messages_written, 1);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# #general\n"));
        assert!(contents.contains("**Message Count:** 1"));
        assert!(contents.ends_with("- **t** *a*: one\n"));
    }

    #[test]
    fn test_append_updates_only_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("general.md");

        write(&path, &rendered(&["- **t** *a*: one"]), WriteMode::Fresh).unwrap();
        write(
            &path,
            &rendered(&["- **t** *a*: two", "- **t** *b*: three"]),
            WriteMode::Append,
        )
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("**Message Count:** 3"));
        assert!(!contents.contains("**Message Count:** 1"));
        // original export timestamp untouched
        assert!(contents.contains("**Exported:** 2026-01-01 00:00:00"));
        let idx_one = contents.find("one").unwrap();
        let idx_three = contents.find("three").unwrap();
        assert!(idx_one < idx_three);
    }

    #[test]
    fn test_append_to_missing_file_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.md");
        let err = write(&path, &rendered(&["x"]), WriteMode::Append).unwrap_err();
        assert!(matches!(err, SyncError::Write(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_append_without_header_fails_without_touching_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.md");
        std::fs::write(&path, "not an export file\n").unwrap();

        let err = write(&path, &rendered(&["x"]), WriteMode::Append).unwrap_err();
        assert!(matches!(err, SyncError::Write(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not an export file\n");
    }

    #[test]
    fn test_fresh_rewrite_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("general.md");

        write(&path, &rendered(&["- **t** *a*: old"]), WriteMode::Fresh).unwrap();
        write(&path, &rendered(&["- **t** *a*: rebuilt"]), WriteMode::Fresh).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("old"));
        assert!(contents.contains("rebuilt"));
        assert!(contents.contains("**Message Count:** 1"));
    }
}
