//! Key Pattern Module
//!
//! Wildcard-capable key prefixes used to bulk-invalidate related entries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;

// == Key Pattern ==
/// A cache key pattern.
///
/// - `family:*` matches `family` itself and anything starting with `family:`
/// - `prefix*` matches anything starting with `prefix`
/// - `*` matches everything
/// - anything else is an exact match
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPattern(String);

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Pattern covering a whole key family, e.g. `family("cat:list")` is `cat:list:*`.
    pub fn family(base: impl AsRef<str>) -> Self {
        Self(format!("{}:*", base.as_ref()))
    }

    pub fn exact(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key or tag a family or exact pattern is anchored on: `cat:list`
    /// for `cat:list:*`. `None` for bare prefix wildcards.
    pub fn family_base(&self) -> Option<&str> {
        match self.0.strip_suffix(":*") {
            Some(base) => Some(base),
            None if self.is_wildcard() => None,
            None => Some(&self.0),
        }
    }

    /// True if the pattern contains a wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.0.ends_with('*')
    }

    // == Matching ==
    /// Matches a single key or tag.
    pub fn matches(&self, candidate: &str) -> bool {
        let pattern = self.0.as_str();
        if pattern == "*" {
            return true;
        }
        if let Some(base) = pattern.strip_suffix(":*") {
            return candidate == base
                || (candidate.len() > base.len()
                    && candidate.starts_with(base)
                    && candidate.as_bytes()[base.len()] == b':');
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return candidate.starts_with(prefix);
        }
        candidate == pattern
    }

    /// Matches an entry by its key or any of its tags.
    pub fn matches_entry(&self, entry: &CacheEntry) -> bool {
        self.matches(&entry.key) || entry.tags.iter().any(|tag| self.matches(tag))
    }

    /// True if some key could match both patterns.
    pub fn overlaps(&self, other: &KeyPattern) -> bool {
        match (self.prefix(), other.prefix()) {
            (Some(a), Some(b)) => a.starts_with(b) || b.starts_with(a),
            (Some(_), None) => self.matches(other.as_str()),
            (None, Some(_)) => other.matches(self.as_str()),
            (None, None) => self == other,
        }
    }

    /// Literal prefix of a wildcard pattern; `base:*` yields `base:`.
    fn prefix(&self) -> Option<&str> {
        self.0.strip_suffix('*')
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyPattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for KeyPattern {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_matches_base_and_children() {
        let pattern = KeyPattern::new("cat:list:*");
        assert!(pattern.matches("cat:list"));
        assert!(pattern.matches("cat:list:active=true"));
        assert!(!pattern.matches("cat:listing"));
        assert!(!pattern.matches("cat:lis"));
    }

    #[test]
    fn test_raw_prefix() {
        let pattern = KeyPattern::new("agg*");
        assert!(pattern.matches("agg:counts"));
        assert!(pattern.matches("aggregate"));
        assert!(!pattern.matches("cat:agg"));
    }

    #[test]
    fn test_exact_and_star() {
        assert!(KeyPattern::exact("cat:path:X").matches("cat:path:X"));
        assert!(!KeyPattern::exact("cat:path:X").matches("cat:path:XY"));
        assert!(KeyPattern::new("*").matches("anything"));
    }

    #[test]
    fn test_family_constructor() {
        assert_eq!(KeyPattern::family("cat:children:7").as_str(), "cat:children:7:*");
    }

    #[test]
    fn test_family_base() {
        assert_eq!(KeyPattern::new("cat:list:*").family_base(), Some("cat:list"));
        assert_eq!(KeyPattern::exact("cat:detail:X").family_base(), Some("cat:detail:X"));
        assert_eq!(KeyPattern::new("cat*").family_base(), None);
        assert_eq!(KeyPattern::new("*").family_base(), None);
    }

    #[test]
    fn test_overlaps() {
        let list = KeyPattern::new("cat:list:*");
        assert!(list.overlaps(&KeyPattern::new("cat:*")));
        assert!(list.overlaps(&KeyPattern::new("cat:list:active=true")));
        assert!(list.overlaps(&KeyPattern::new("*")));
        assert!(!list.overlaps(&KeyPattern::new("cat:hierarchy:*")));
        assert!(!list.overlaps(&KeyPattern::new("prop:list")));
        assert!(KeyPattern::exact("a").overlaps(&KeyPattern::exact("a")));
    }

    #[test]
    fn test_serde_is_transparent() {
        let pattern: KeyPattern = serde_json::from_str("\"cat:list:*\"").unwrap();
        assert_eq!(pattern, KeyPattern::new("cat:list:*"));
    }
}
