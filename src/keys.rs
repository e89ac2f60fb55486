//! Cache key derivation.
//!
//! Queries are a closed sum type. Each one is normalized to canonical JSON
//! (recursively sorted object keys, nulls dropped), hashed with SHA-256 and
//! rendered as `{version}:{queryType}:{hash}`. The registry remembers the
//! canonical form behind every key it has recently handed out, so a hash
//! collision is reported instead of silently merging two result sets. Keys
//! idle past the retention window, or beyond the capacity, are forgotten.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::cache::KeyPattern;
use crate::error::{CacheError, Result};
use crate::ttl::TtlClass;

// == Query ==
/// Every query shape the engine caches, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    CategoryDetail {
        id: String,
    },
    CategoryList {
        #[serde(default)]
        parent_id: Option<String>,
        #[serde(default)]
        active: Option<bool>,
        #[serde(default)]
        filters: BTreeMap<String, Value>,
    },
    CategoryHierarchy {
        #[serde(default)]
        root_id: Option<String>,
    },
    Breadcrumb {
        id: String,
    },
    CategoryPath {
        id: String,
    },
    Children {
        parent_id: String,
    },
    PropertyDetail {
        id: String,
    },
    PropertyList {
        #[serde(default)]
        category_id: Option<String>,
    },
    ValidationRules {
        #[serde(default)]
        category_id: Option<String>,
    },
    Aggregate {
        name: String,
        #[serde(default)]
        params: BTreeMap<String, Value>,
    },
}

impl Query {
    /// Human-readable key segment for this query shape.
    pub fn query_type(&self) -> &'static str {
        match self {
            Query::CategoryDetail { .. } => "cat:detail",
            Query::CategoryList { .. } => "cat:list",
            Query::CategoryHierarchy { .. } => "cat:hierarchy",
            Query::Breadcrumb { .. } => "cat:breadcrumb",
            Query::CategoryPath { .. } => "cat:path",
            Query::Children { .. } => "cat:children",
            Query::PropertyDetail { .. } => "prop:detail",
            Query::PropertyList { .. } => "prop:list",
            Query::ValidationRules { .. } => "rule:list",
            Query::Aggregate { .. } => "agg",
        }
    }

    /// Volatility class used when the caller does not pick one.
    pub fn ttl_class(&self) -> TtlClass {
        match self {
            Query::CategoryList { .. } | Query::PropertyList { .. } | Query::Aggregate { .. } => {
                TtlClass::Dynamic
            }
            _ => TtlClass::Static,
        }
    }

    /// Invalidation tags implied by the query's static structure.
    pub fn tags(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        match self {
            Query::CategoryDetail { id } => {
                tags.insert(format!("cat:detail:{id}"));
                tags.insert(format!("cat:{id}"));
            }
            Query::CategoryList { parent_id, .. } => {
                tags.insert("cat:list".to_string());
                if let Some(parent) = parent_id {
                    tags.insert(format!("cat:children:{parent}"));
                }
            }
            Query::CategoryHierarchy { root_id } => {
                tags.insert("cat:hierarchy".to_string());
                if let Some(root) = root_id {
                    tags.insert(format!("cat:hierarchy:{root}"));
                }
            }
            Query::Breadcrumb { id } => {
                tags.insert(format!("cat:breadcrumb:{id}"));
                tags.insert(format!("cat:{id}"));
            }
            Query::CategoryPath { id } => {
                tags.insert(format!("cat:path:{id}"));
                tags.insert(format!("cat:{id}"));
            }
            Query::Children { parent_id } => {
                tags.insert(format!("cat:children:{parent_id}"));
            }
            Query::PropertyDetail { id } => {
                tags.insert(format!("prop:detail:{id}"));
                tags.insert(format!("prop:{id}"));
            }
            Query::PropertyList { category_id } => {
                tags.insert("prop:list".to_string());
                if let Some(category) = category_id {
                    tags.insert(format!("cat:{category}:props"));
                }
            }
            Query::ValidationRules { category_id } => {
                tags.insert("rule:list".to_string());
                if let Some(category) = category_id {
                    tags.insert(format!("rule:category:{category}"));
                }
            }
            Query::Aggregate { name, .. } => {
                tags.insert(format!("agg:{name}"));
            }
        }
        tags
    }

    /// Canonical parameter serialization used for hashing and collision checks.
    pub fn canonical_params(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let mut out = String::new();
        write_canonical(&value, &mut out);
        out
    }
}

// == Derived Key ==
/// A derived cache key and the tags its entry must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedKey {
    pub key: String,
    pub tags: BTreeSet<String>,
}

impl DerivedKey {
    /// A key supplied directly by a caller, with explicit tags.
    pub fn manual(key: impl Into<String>, tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            key: key.into(),
            tags: tags.into_iter().collect(),
        }
    }

    /// True if `pattern` matches this key or any of its tags.
    pub fn matches(&self, pattern: &KeyPattern) -> bool {
        pattern.matches(&self.key) || self.tags.iter().any(|t| pattern.matches(t))
    }
}

// == Key Registry ==
/// Keys remembered for collision checks by default.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 100_000;

/// How long an unused key stays remembered by default.
pub const DEFAULT_REGISTRY_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct SeenKey {
    canonical: String,
    last_used: Instant,
}

#[derive(Debug)]
pub struct KeyRegistry {
    version: String,
    hash_len: usize,
    /// key -> canonical form that produced it
    seen: DashMap<String, SeenKey>,
    capacity: usize,
    retention: Duration,
}

impl KeyRegistry {
    /// Creates a registry emitting `{version}:...` keys with `hash_len` hex
    /// characters of digest (clamped to 1..=64).
    pub fn new(version: impl Into<String>, hash_len: usize) -> Self {
        Self {
            version: version.into(),
            hash_len: hash_len.clamp(1, 64),
            seen: DashMap::new(),
            capacity: DEFAULT_REGISTRY_CAPACITY,
            retention: DEFAULT_REGISTRY_RETENTION,
        }
    }

    /// Caps the remembered keys at `capacity` and forgets keys unused for
    /// `retention` on [`prune`](Self::prune).
    pub fn with_limits(mut self, capacity: usize, retention: Duration) -> Self {
        self.capacity = capacity.max(1);
        self.retention = retention;
        self
    }

    // == Derive Key ==
    /// Derives the key and tags for `query`.
    ///
    /// Returns `KeyCollision` if a different canonical query already owns the
    /// resulting key.
    pub fn derive(&self, query: &Query) -> Result<DerivedKey> {
        let query_type = query.query_type();
        let canonical = query.canonical_params();

        let mut hasher = Sha256::new();
        hasher.update(query_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        let digest = hex::encode(hasher.finalize());
        let key = format!("{}:{}:{}", self.version, query_type, &digest[..self.hash_len]);

        let now = Instant::now();
        match self.seen.entry(key.clone()) {
            Entry::Occupied(existing) if existing.get().canonical != canonical => {
                let err = CacheError::KeyCollision {
                    key,
                    existing: existing.get().canonical.clone(),
                    incoming: canonical,
                };
                error!(error = %err, "cache key collision detected");
                return Err(err);
            }
            Entry::Occupied(mut existing) => existing.get_mut().last_used = now,
            Entry::Vacant(slot) => {
                slot.insert(SeenKey {
                    canonical,
                    last_used: now,
                });
            }
        }
        if self.seen.len() > self.capacity {
            self.evict_oldest();
        }

        Ok(DerivedKey {
            key,
            tags: query.tags(),
        })
    }

    /// Forgets keys unused for longer than the retention window. Returns the
    /// number forgotten.
    pub fn prune(&self) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen| seen.last_used.elapsed() < self.retention);
        before.saturating_sub(self.seen.len())
    }

    /// Drops the least recently used tenth of the capacity.
    fn evict_oldest(&self) {
        let target = self.capacity - self.capacity / 10;
        let mut by_age: Vec<(Instant, String)> = self
            .seen
            .iter()
            .map(|entry| (entry.value().last_used, entry.key().clone()))
            .collect();
        if by_age.len() <= target {
            return;
        }
        by_age.sort_unstable();
        let excess = by_age.len() - target;
        for (_, key) in by_age.into_iter().take(excess) {
            self.seen.remove(&key);
        }
        debug!(evicted = excess, remaining = self.seen.len(), "key registry trimmed");
    }

    /// Number of distinct keys currently remembered.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new("v1", 16)
    }
}

// == Canonical JSON ==
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars reuse serde_json's escaping and number formatting.
        other => out.push_str(&other.to_string()),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, _)| k)
        .collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key.as_str()], out);
    }
    out.push('}');
}
