//! Workspace identity and derived paths
//!
//! Every component takes a `WorkspaceContext` explicitly instead of reaching
//! for ambient path constants, so a second workspace only needs a second
//! context value.

use std::path::{Path, PathBuf};

/// Identity of the Slack workspace being archived plus the local data root.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    /// Workspace base URL, e.g. `https://acme-corp.slack.com`
    pub url: String,
    /// Slack team ID, e.g. `T0123ABCD`
    pub team_id: String,
    /// Root directory for everything this tool persists.
    pub data_dir: PathBuf,
}

impl WorkspaceContext {
    pub fn new(url: impl Into<String>, team_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            team_id: team_id.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Default data root under the platform data directory.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("slackvault")
    }

    /// URL for the universal Slack app client, preferred for navigation
    /// because workspace sub-domain URLs redirect to the desktop app.
    pub fn app_client_url(&self) -> String {
        format!("https://app.slack.com/client/{}", self.team_id)
    }

    /// `https://<workspace-domain>/api` - the route prefix watched by the
    /// credential listener and used for fast-path calls.
    pub fn api_base(&self) -> String {
        format!("{}/api", self.url)
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn tracker_file(&self) -> PathBuf {
        self.data_dir.join("tracker.json")
    }

    pub fn channel_map_file(&self) -> PathBuf {
        self.data_dir.join("channel_map.json")
    }

    pub fn rolodex_file(&self) -> PathBuf {
        self.data_dir.join("rolodex.json")
    }

    pub fn browser_profile_dir(&self) -> PathBuf {
        self.data_dir.join("browser_profile")
    }

    pub fn export_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }

    pub fn export_path(&self, file_stem: &str) -> PathBuf {
        self.export_dir().join(format!("{}.md", file_stem))
    }
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the target. Callers rely on either seeing the
/// full new contents or the unmodified previous file.
pub fn atomic_write(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(contents.as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WorkspaceContext {
        WorkspaceContext::new("https://acme.slack.com/", "T0123ABCD", "/tmp/sv-test")
    }

    #[test]
    fn test_url_trailing_slash_stripped() {
        assert_eq!(ctx().url, "https://acme.slack.com");
    }

    #[test]
    fn test_app_client_url() {
        assert_eq!(ctx().app_client_url(), "https://app.slack.com/client/T0123ABCD");
    }

    #[test]
    fn test_api_base() {
        assert_eq!(ctx().api_base(), "https://acme.slack.com/api");
    }

    #[test]
    fn test_derived_paths_live_under_data_dir() {
        let c = ctx();
        assert!(c.tracker_file().starts_with(&c.data_dir));
        assert!(c.export_path("general").ends_with("exports/general.md"));
    }

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");

        atomic_write(&path, "first").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");

        atomic_write(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }
}
