//! Conversation target resolution
//!
//! Turns whatever the user typed (`#general`, `general`, `C04KQBBPPLN`,
//! `dm_with_ada`) into a canonical channel ID, backed by a persistent
//! name→ID cache refreshed from `conversations.list`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::rolodex::Rolodex;
use crate::sync::types::{ChannelInfo, SyncError};
use crate::workspace::atomic_write;

static SLACK_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[CDG][A-Z0-9]{8,10}$").expect("slack id regex"));

/// True when the string already is a conversation ID (C/D/G prefix).
pub fn is_slack_id(s: &str) -> bool {
    SLACK_ID_RE.is_match(s)
}

/// A user-supplied target after resolution. Read-only from here on.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub input: String,
    pub channel_id: String,
    pub display_name: String,
}

#[derive(Debug)]
pub struct ConversationResolver {
    path: PathBuf,
    /// channel ID -> display name (no `#` prefix).
    map: BTreeMap<String, String>,
}

impl ConversationResolver {
    /// Load the cached map; missing or corrupt files degrade to empty.
    pub fn load(path: &Path) -> Self {
        let map = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<BTreeMap<String, String>>(&raw).ok())
            .map(|m| {
                // bookkeeping keys like "_updated" are not channels
                m.into_iter()
                    .filter(|(k, _)| !k.starts_with('_'))
                    .collect::<BTreeMap<String, String>>()
            })
            .unwrap_or_default();

        tracing::debug!("Loaded {} cached channel names", map.len());
        Self {
            path: path.to_path_buf(),
            map,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// True when any non-ID target has no exact entry in the cache, meaning
    /// a refresh from the channel listing is worth attempting.
    pub fn needs_refresh(&self, targets: &[String]) -> bool {
        targets.iter().any(|t| {
            let name = normalize(t);
            !is_slack_id(&name) && !self.map.values().any(|n| n == &name)
        })
    }

    /// Fold a fresh channel listing into the cache. DMs get a `dm_with_…`
    /// alias derived from the other participant's name.
    pub fn absorb(&mut self, channels: &[ChannelInfo], rolodex: &Rolodex) {
        for ch in channels {
            if ch.id.is_empty() {
                continue;
            }
            let name = if ch.is_im {
                let other = ch.user.as_deref().unwrap_or("unknown");
                let display = rolodex.display_name(other).unwrap_or(other);
                format!("dm_with_{}", display.to_lowercase().replace(' ', "_"))
            } else if !ch.name.is_empty() {
                ch.name.clone()
            } else {
                continue;
            };
            self.map.insert(ch.id.clone(), name);
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&self.map).expect("channel map serialize");
        atomic_write(&self.path, &json)
    }

    /// Resolve one target. Order: explicit ID pattern (no lookup), exact
    /// name match, case-insensitive alias match. No match yields near
    /// matches; several equally-ranked matches are ambiguous.
    pub fn resolve(&self, target: &str) -> Result<ResolvedTarget, SyncError> {
        let cleaned = normalize(target);
        if cleaned.is_empty() {
            return Err(SyncError::Resolution {
                target: target.to_string(),
                candidates: vec![],
            });
        }

        if is_slack_id(&cleaned) {
            let display_name = self
                .map
                .get(&cleaned)
                .cloned()
                .unwrap_or_else(|| format!("channel_{}", cleaned));
            return Ok(ResolvedTarget {
                input: target.to_string(),
                channel_id: cleaned,
                display_name,
            });
        }

        // Exact name match first.
        let exact: Vec<(&String, &String)> =
            self.map.iter().filter(|(_, n)| *n == &cleaned).collect();
        if let Some(resolved) = self.pick(target, &cleaned, exact)? {
            return Ok(resolved);
        }

        // Then case-insensitive.
        let lowered = cleaned.to_lowercase();
        let folded: Vec<(&String, &String)> = self
            .map
            .iter()
            .filter(|(_, n)| n.to_lowercase() == lowered)
            .collect();
        if let Some(resolved) = self.pick(target, &cleaned, folded)? {
            return Ok(resolved);
        }

        // Nothing matched: offer near matches by substring.
        let candidates: Vec<String> = self
            .map
            .values()
            .filter(|n| n.to_lowercase().contains(&lowered))
            .cloned()
            .collect();
        Err(SyncError::Resolution {
            target: target.to_string(),
            candidates,
        })
    }

    fn pick(
        &self,
        input: &str,
        _cleaned: &str,
        matches: Vec<(&String, &String)>,
    ) -> Result<Option<ResolvedTarget>, SyncError> {
        match matches.len() {
            0 => Ok(None),
            1 => {
                let (id, name) = matches[0];
                Ok(Some(ResolvedTarget {
                    input: input.to_string(),
                    channel_id: id.clone(),
                    display_name: name.clone(),
                }))
            }
            _ => Err(SyncError::AmbiguousTarget {
                target: input.to_string(),
                candidates: matches.iter().map(|(_, n)| (*n).clone()).collect(),
            }),
        }
    }
}

fn normalize(target: &str) -> String {
    target.trim().trim_start_matches(['#', '@']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ConversationResolver {
        let mut r = ConversationResolver {
            path: PathBuf::from("/tmp/unused.json"),
            map: BTreeMap::new(),
        };
        r.map.insert("C04KQBBPPLN".into(), "general".into());
        r.map.insert("C04KQBBPPLM".into(), "General".into());
        r.map.insert("C0AAAAAAAAA".into(), "release-party".into());
        r.map.insert("D0BBBBBBBBB".into(), "dm_with_ada".into());
        r
    }

    #[test]
    fn test_slack_id_pattern() {
        assert!(is_slack_id("C04KQBBPPLN"));
        assert!(is_slack_id("D0BBBBBBBBB"));
        assert!(is_slack_id("G012345678"));
        assert!(!is_slack_id("U04KQBBPPLN")); // user, not conversation
        assert!(!is_slack_id("general"));
        assert!(!is_slack_id("C04"));
    }

    #[test]
    fn test_explicit_id_needs_no_lookup() {
        let r = resolver();
        let resolved = r.resolve("C0ZZZZZZZZZ").unwrap();
        assert_eq!(resolved.channel_id, "C0ZZZZZZZZZ");
        assert_eq!(resolved.display_name, "channel_C0ZZZZZZZZZ");
    }

    #[test]
    fn test_known_id_resolves_to_itself_with_cached_name() {
        let r = resolver();
        let resolved = r.resolve("C0AAAAAAAAA").unwrap();
        assert_eq!(resolved.channel_id, "C0AAAAAAAAA");
        assert_eq!(resolved.display_name, "release-party");
    }

    #[test]
    fn test_exact_name_match_wins_over_case_fold() {
        let r = resolver();
        // "general" matches C04KQBBPPLN exactly even though "General" also
        // exists case-insensitively.
        let resolved = r.resolve("#general").unwrap();
        assert_eq!(resolved.channel_id, "C04KQBBPPLN");
    }

    #[test]
    fn test_case_insensitive_alias() {
        let r = resolver();
        let resolved = r.resolve("RELEASE-PARTY").unwrap();
        assert_eq!(resolved.channel_id, "C0AAAAAAAAA");
    }

    #[test]
    fn test_dm_alias() {
        let r = resolver();
        let resolved = r.resolve("dm_with_ada").unwrap();
        assert_eq!(resolved.channel_id, "D0BBBBBBBBB");
    }

    #[test]
    fn test_ambiguous_case_insensitive_match() {
        let r = resolver();
        let err = r.resolve("GENERAL").unwrap_err();
        match err {
            SyncError::AmbiguousTarget { candidates, .. } => {
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected AmbiguousTarget, got {:?}", other),
        }
    }

    #[test]
    fn test_no_match_lists_near_candidates() {
        let r = resolver();
        let err = r.resolve("release").unwrap_err();
        match err {
            SyncError::Resolution { candidates, .. } => {
                assert_eq!(candidates, vec!["release-party".to_string()]);
            }
            other => panic!("expected Resolution, got {:?}", other),
        }
    }

    #[test]
    fn test_needs_refresh() {
        let r = resolver();
        assert!(!r.needs_refresh(&["#general".into(), "C0ZZZZZZZZZ".into()]));
        assert!(r.needs_refresh(&["unknown-channel".into()]));
    }

    #[test]
    fn test_absorb_channels_and_dms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_map.json");
        let mut r = ConversationResolver::load(&path);
        let rolodex = Rolodex::from_entries([("U1", "Ada Lovelace")]);

        r.absorb(
            &[
                ChannelInfo {
                    id: "C1AAAAAAAAA".into(),
                    name: "general".into(),
                    is_private: false,
                    is_im: false,
                    is_mpim: false,
                    user: None,
                },
                ChannelInfo {
                    id: "D1BBBBBBBBB".into(),
                    name: "".into(),
                    is_private: false,
                    is_im: true,
                    is_mpim: false,
                    user: Some("U1".into()),
                },
            ],
            &rolodex,
        );

        assert_eq!(r.resolve("general").unwrap().channel_id, "C1AAAAAAAAA");
        assert_eq!(
            r.resolve("dm_with_ada_lovelace").unwrap().channel_id,
            "D1BBBBBBBBB"
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_map.json");
        let mut r = ConversationResolver::load(&path);
        r.map.insert("C1AAAAAAAAA".into(), "general".into());
        r.save().unwrap();

        let reloaded = ConversationResolver::load(&path);
        assert_eq!(reloaded.resolve("general").unwrap().channel_id, "C1AAAAAAAAA");
    }

    #[test]
    fn test_bookkeeping_keys_filtered_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_map.json");
        std::fs::write(
            &path,
            r#"{"C1AAAAAAAAA": "general", "_updated": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let r = ConversationResolver::load(&path);
        assert_eq!(r.map.len(), 1);
    }
}
