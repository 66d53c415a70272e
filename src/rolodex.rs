//! User directory cache ("rolodex")
//!
//! Maps Slack user IDs to display names for mention resolution and DM
//! naming. Live API data takes precedence over cached entries; the cache
//! fills gaps when the API is unavailable and persists newly discovered
//! users for future runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sync::types::SlackUser;
use crate::workspace::atomic_write;

#[derive(Debug, Serialize, Deserialize)]
struct RolodexFile {
    #[serde(default)]
    people: Vec<Person>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Person {
    user_id: String,
    name: String,
}

#[derive(Debug, Default)]
pub struct Rolodex {
    path: Option<PathBuf>,
    users: BTreeMap<String, String>,
}

impl Rolodex {
    /// Load the cache; missing or corrupt files degrade to an empty map.
    pub fn load(path: &Path) -> Self {
        let users = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<RolodexFile>(&raw).ok())
            .map(|f| {
                f.people
                    .into_iter()
                    .map(|p| (p.user_id, p.name))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        tracing::debug!("Loaded {} cached user names", users.len());
        Self {
            path: Some(path.to_path_buf()),
            users,
        }
    }

    /// In-memory rolodex for tests and render-only callers.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            path: None,
            users: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn display_name(&self, user_id: &str) -> Option<&str> {
        self.users.get(user_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Merge freshly fetched users. Live names overwrite cached ones; the
    /// cache only fills IDs the API did not return.
    pub fn merge_live(&mut self, users: &[SlackUser]) {
        for user in users {
            self.users
                .insert(user.id.clone(), user.best_name().to_string());
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = RolodexFile {
            people: self
                .users
                .iter()
                .map(|(id, name)| Person {
                    user_id: id.clone(),
                    name: name.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file).expect("rolodex serialize");
        atomic_write(path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, display: &str) -> SlackUser {
        SlackUser {
            id: id.into(),
            name: "handle".into(),
            real_name: None,
            display_name: Some(display.into()),
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let rolodex = Rolodex::load(Path::new("/nonexistent/rolodex.json"));
        assert!(rolodex.is_empty());
    }

    #[test]
    fn test_live_names_overwrite_cached() {
        let mut rolodex = Rolodex::from_entries([("U1", "Stale Name"), ("U2", "Only Cached")]);
        rolodex.merge_live(&[user("U1", "Fresh Name")]);

        assert_eq!(rolodex.display_name("U1"), Some("Fresh Name"));
        assert_eq!(rolodex.display_name("U2"), Some("Only Cached"));
    }

    #[test]
    fn test_save_and_load_original_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rolodex.json");

        let mut rolodex = Rolodex::load(&path);
        rolodex.merge_live(&[user("U1", "Ada"), user("U2", "Grace")]);
        rolodex.save().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["people"][0]["user_id"], "U1");
        assert_eq!(raw["people"][0]["name"], "Ada");

        let reloaded = Rolodex::load(&path);
        assert_eq!(reloaded.display_name("U2"), Some("Grace"));
        assert_eq!(reloaded.len(), 2);
    }
}
