//! Source-of-truth boundary.
//!
//! The cache never talks to the relational store directly. It calls a
//! [`Loader`] on a miss; a [`SourceOfTruth`] answers typed queries and
//! [`QueryLoader`] binds the two. [`MemorySource`] is an in-process
//! collaborator holding a category tree with its properties and validation
//! rules. It publishes a [`ChangeEvent`] for every mutation.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::events::{ChangeEvent, ChangeEventPublisher, EntityType, Operation};
use crate::keys::Query;

// == Source Error ==
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl From<SourceError> for CacheError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(what) => CacheError::KeyNotFound(what),
            SourceError::Unavailable(reason) => CacheError::SourceUnavailable(reason),
        }
    }
}

// == Traits ==
/// Answers typed queries against the authoritative data.
#[async_trait]
pub trait SourceOfTruth: Send + Sync + 'static {
    async fn load(&self, query: &Query) -> std::result::Result<Vec<u8>, SourceError>;
}

/// Produces the serialized value for one cache key on a miss.
#[async_trait]
pub trait Loader: Send + Sync + 'static {
    async fn load(&self) -> std::result::Result<Vec<u8>, SourceError>;
}

/// Loads one query from a source.
pub struct QueryLoader {
    source: Arc<dyn SourceOfTruth>,
    query: Query,
}

impl QueryLoader {
    pub fn new(source: Arc<dyn SourceOfTruth>, query: Query) -> Self {
        Self { source, query }
    }
}

#[async_trait]
impl Loader for QueryLoader {
    async fn load(&self) -> std::result::Result<Vec<u8>, SourceError> {
        self.source.load(&self.query).await
    }
}

struct FnLoader<F>(F);

#[async_trait]
impl<F, Fut> Loader for FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Vec<u8>, SourceError>> + Send + 'static,
{
    async fn load(&self) -> std::result::Result<Vec<u8>, SourceError> {
        (self.0)().await
    }
}

/// Wraps an async closure as a loader.
pub fn loader_fn<F, Fut>(f: F) -> Arc<dyn Loader>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Vec<u8>, SourceError>> + Send + 'static,
{
    Arc::new(FnLoader(f))
}

// == Records ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id: None,
            active: true,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub category_id: String,
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: String,
    pub category_id: String,
    pub expression: String,
}

#[derive(Debug, Default)]
struct SourceData {
    categories: BTreeMap<String, Category>,
    properties: BTreeMap<String, Property>,
    rules: BTreeMap<String, ValidationRule>,
}

impl SourceData {
    /// Root-first ancestor ids of `id`, not including `id`.
    ///
    /// Stops after `limit` steps. On a cycle the repeated id is kept, so the
    /// caller can detect it.
    fn ancestors(&self, id: &str, limit: usize) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id.to_string()]);
        let mut cursor = self.categories.get(id).and_then(|c| c.parent_id.clone());

        while let Some(parent) = cursor {
            chain.push(parent.clone());
            if !seen.insert(parent.clone()) || chain.len() > limit {
                break;
            }
            cursor = self.categories.get(&parent).and_then(|c| c.parent_id.clone());
        }
        chain.reverse();
        chain
    }

    fn children(&self, parent_id: &str) -> Vec<&Category> {
        self.categories
            .values()
            .filter(|c| c.parent_id.as_deref() == Some(parent_id))
            .collect()
    }

    fn subtree(&self, category: &Category, depth: usize, limit: usize) -> Value {
        let children: Vec<Value> = if depth >= limit {
            Vec::new()
        } else {
            self.children(&category.id)
                .into_iter()
                .map(|child| self.subtree(child, depth + 1, limit))
                .collect()
        };
        json!({ "id": category.id, "name": category.name, "children": children })
    }
}

// == Memory Source ==
pub struct MemorySource {
    data: RwLock<SourceData>,
    available: AtomicBool,
    loads: AtomicU64,
    publisher: Option<ChangeEventPublisher>,
    max_depth: usize,
}

impl MemorySource {
    pub fn new(max_depth: usize) -> Self {
        Self {
            data: RwLock::new(SourceData::default()),
            available: AtomicBool::new(true),
            loads: AtomicU64::new(0),
            publisher: None,
            max_depth,
        }
    }

    /// Publishes a change event for every mutation to `publisher`.
    pub fn with_publisher(mut self, publisher: ChangeEventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Simulates an outage: every load fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Loads served so far.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub async fn category(&self, id: &str) -> Option<Category> {
        self.data.read().await.categories.get(id).cloned()
    }

    // == Category Mutations ==
    /// Inserts or replaces a category. Returns the published event.
    pub async fn upsert_category(&self, category: Category) -> Result<ChangeEvent> {
        let event = {
            let mut data = self.data.write().await;
            let previous = data.categories.insert(category.id.clone(), category.clone());

            let mut event = match &previous {
                None => ChangeEvent::new(EntityType::Category, &category.id, Operation::Create),
                Some(old) => {
                    let mut changed = Vec::new();
                    if old.name != category.name {
                        changed.push("name");
                    }
                    if old.active != category.active {
                        changed.push("active");
                    }
                    if old.parent_id != category.parent_id {
                        changed.push("parent_category_id");
                    }
                    let mut event =
                        ChangeEvent::new(EntityType::Category, &category.id, Operation::Update)
                            .with_changed_fields(changed);
                    if old.parent_id != category.parent_id {
                        if let Some(old_parent) = &old.parent_id {
                            event = event.with_previous_parent(old_parent.clone());
                        }
                    }
                    event
                }
            };
            if let Some(parent) = &category.parent_id {
                event = event.with_parent(parent.clone());
            }
            event.with_ancestors(data.ancestors(&category.id, self.max_depth))
        };

        self.publish(event.clone()).await?;
        Ok(event)
    }

    /// Removes a category. Its children keep their dangling parent pointer,
    /// as the relational store would with a deferred constraint.
    pub async fn delete_category(&self, id: &str) -> Result<Option<ChangeEvent>> {
        let event = {
            let mut data = self.data.write().await;
            let ancestors = data.ancestors(id, self.max_depth);
            let Some(removed) = data.categories.remove(id) else {
                return Ok(None);
            };
            let mut event = ChangeEvent::new(EntityType::Category, id, Operation::Delete)
                .with_ancestors(ancestors);
            if let Some(parent) = removed.parent_id {
                event = event.with_parent(parent);
            }
            event
        };

        self.publish(event.clone()).await?;
        Ok(Some(event))
    }

    // == Property Mutations ==
    pub async fn upsert_property(&self, property: Property) -> Result<ChangeEvent> {
        let previous = self
            .data
            .write()
            .await
            .properties
            .insert(property.id.clone(), property.clone());
        let event = owned_event(
            EntityType::Property,
            &property.id,
            &property.category_id,
            previous.is_some(),
        );
        self.publish(event.clone()).await?;
        Ok(event)
    }

    pub async fn delete_property(&self, id: &str) -> Result<Option<ChangeEvent>> {
        let Some(removed) = self.data.write().await.properties.remove(id) else {
            return Ok(None);
        };
        let event = ChangeEvent::new(EntityType::Property, id, Operation::Delete)
            .with_parent(removed.category_id);
        self.publish(event.clone()).await?;
        Ok(Some(event))
    }

    // == Validation Rule Mutations ==
    pub async fn upsert_rule(&self, rule: ValidationRule) -> Result<ChangeEvent> {
        let previous = self
            .data
            .write()
            .await
            .rules
            .insert(rule.id.clone(), rule.clone());
        let event = owned_event(
            EntityType::ValidationRule,
            &rule.id,
            &rule.category_id,
            previous.is_some(),
        );
        self.publish(event.clone()).await?;
        Ok(event)
    }

    pub async fn delete_rule(&self, id: &str) -> Result<Option<ChangeEvent>> {
        let Some(removed) = self.data.write().await.rules.remove(id) else {
            return Ok(None);
        };
        let event = ChangeEvent::new(EntityType::ValidationRule, id, Operation::Delete)
            .with_parent(removed.category_id);
        self.publish(event.clone()).await?;
        Ok(Some(event))
    }

    async fn publish(&self, event: ChangeEvent) -> Result<()> {
        match &self.publisher {
            Some(publisher) => publisher.publish(event).await,
            None => Ok(()),
        }
    }

    // == Query Evaluation ==
    fn evaluate(&self, data: &SourceData, query: &Query) -> std::result::Result<Value, SourceError> {
        let missing = |what: &str, id: &str| SourceError::NotFound(format!("{what} {id}"));

        let value = match query {
            Query::CategoryDetail { id } => {
                let category = data.categories.get(id).ok_or_else(|| missing("category", id))?;
                to_value(category)?
            }
            Query::CategoryList {
                parent_id,
                active,
                filters,
            } => {
                let mut items = Vec::new();
                for category in data.categories.values() {
                    if parent_id.is_some() && category.parent_id != *parent_id {
                        continue;
                    }
                    if active.is_some_and(|a| category.active != a) {
                        continue;
                    }
                    let record = to_value(category)?;
                    if filters.iter().all(|(field, want)| record.get(field) == Some(want)) {
                        items.push(record);
                    }
                }
                Value::Array(items)
            }
            Query::CategoryHierarchy { root_id } => {
                let roots: Vec<&Category> = match root_id {
                    Some(id) => vec![data.categories.get(id).ok_or_else(|| missing("category", id))?],
                    None => data
                        .categories
                        .values()
                        .filter(|c| c.parent_id.is_none())
                        .collect(),
                };
                Value::Array(
                    roots
                        .into_iter()
                        .map(|root| data.subtree(root, 0, self.max_depth))
                        .collect(),
                )
            }
            Query::Breadcrumb { id } => {
                let category = data.categories.get(id).ok_or_else(|| missing("category", id))?;
                let mut crumbs: Vec<Value> = data
                    .ancestors(id, self.max_depth)
                    .iter()
                    .filter_map(|a| data.categories.get(a))
                    .map(|c| json!({ "id": c.id, "name": c.name }))
                    .collect();
                crumbs.push(json!({ "id": category.id, "name": category.name }));
                Value::Array(crumbs)
            }
            Query::CategoryPath { id } => {
                if !data.categories.contains_key(id) {
                    return Err(missing("category", id));
                }
                let mut path = data.ancestors(id, self.max_depth);
                path.push(id.clone());
                Value::String(path.join("/"))
            }
            Query::Children { parent_id } => Value::Array(
                data.children(parent_id)
                    .into_iter()
                    .map(to_value)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Query::PropertyDetail { id } => {
                to_value(data.properties.get(id).ok_or_else(|| missing("property", id))?)?
            }
            Query::PropertyList { category_id } => Value::Array(
                data.properties
                    .values()
                    .filter(|p| category_id.as_ref().map_or(true, |c| &p.category_id == c))
                    .map(to_value)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Query::ValidationRules { category_id } => Value::Array(
                data.rules
                    .values()
                    .filter(|r| category_id.as_ref().map_or(true, |c| &r.category_id == c))
                    .map(to_value)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Query::Aggregate { name, .. } => match name.as_str() {
                "category_count" => json!({ "count": data.categories.len() }),
                "property_count" => json!({ "count": data.properties.len() }),
                "rule_count" => json!({ "count": data.rules.len() }),
                other => return Err(missing("aggregate", other)),
            },
        };
        Ok(value)
    }
}

#[async_trait]
impl SourceOfTruth for MemorySource {
    async fn load(&self, query: &Query) -> std::result::Result<Vec<u8>, SourceError> {
        if !self.available.load(Ordering::Relaxed) {
            warn!(query_type = query.query_type(), "source of truth unavailable");
            return Err(SourceError::Unavailable("source offline".to_string()));
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(query_type = query.query_type(), "loading from source");

        let data = self.data.read().await;
        let value = self.evaluate(&data, query)?;
        serde_json::to_vec(&value).map_err(|err| SourceError::Unavailable(err.to_string()))
    }
}

fn owned_event(entity_type: EntityType, id: &str, category_id: &str, existed: bool) -> ChangeEvent {
    let operation = if existed {
        Operation::Update
    } else {
        Operation::Create
    };
    ChangeEvent::new(entity_type, id, operation).with_parent(category_id)
}

fn to_value<T: Serialize>(record: &T) -> std::result::Result<Value, SourceError> {
    serde_json::to_value(record).map_err(|err| SourceError::Unavailable(err.to_string()))
}
