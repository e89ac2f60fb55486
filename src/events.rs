//! Change events and the bus that carries them.
//!
//! The source of truth publishes a [`ChangeEvent`] after every administrative
//! write; the invalidation engine drains the bus. The bus is a bounded mpsc
//! channel, so a slow consumer applies backpressure to publishers instead of
//! dropping events.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

/// Field names that move a category within the tree.
pub const HIERARCHY_FIELDS: &[&str] = &["parent_category_id", "parent_id", "path", "hierarchy_path"];

/// Category fields rendered inside other categories' tree views.
pub const TREE_VIEW_FIELDS: &[&str] = &["name", "active"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Category,
    Property,
    ValidationRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

// == Change Event ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    /// Populated for updates
    #[serde(default)]
    pub changed_fields: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
    /// Parent after the change: the category's parent, or the owning category
    /// of a property or rule
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Parent before a re-parenting update
    #[serde(default)]
    pub previous_parent_id: Option<String>,
    /// Root-first ancestor chain after the change
    #[serde(default)]
    pub ancestors: Vec<String>,
}

impl ChangeEvent {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            operation,
            changed_fields: BTreeSet::new(),
            timestamp: Utc::now(),
            parent_id: None,
            previous_parent_id: None,
            ancestors: Vec::new(),
        }
    }

    pub fn with_changed_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_previous_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.previous_parent_id = Some(parent_id.into());
        self
    }

    pub fn with_ancestors<I, S>(mut self, ancestors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ancestors = ancestors.into_iter().map(Into::into).collect();
        self
    }

    /// True when the event changes tree shape: category create/delete or a
    /// parent/path update.
    pub fn is_structural(&self) -> bool {
        if self.entity_type != EntityType::Category {
            return false;
        }
        match self.operation {
            Operation::Create | Operation::Delete => true,
            Operation::Update => {
                self.previous_parent_id.is_some()
                    || self
                        .changed_fields
                        .iter()
                        .any(|f| HIERARCHY_FIELDS.contains(&f.as_str()))
            }
        }
    }

    /// True when a category update changes what ancestors' hierarchies and
    /// descendants' breadcrumbs display. An update that lists no fields is
    /// assumed to.
    pub fn alters_tree_views(&self) -> bool {
        self.entity_type == EntityType::Category
            && self.operation == Operation::Update
            && (self.changed_fields.is_empty()
                || self
                    .changed_fields
                    .iter()
                    .any(|f| TREE_VIEW_FIELDS.contains(&f.as_str())))
    }
}

// == Change Event Bus ==
/// Creates a bus with room for `capacity` undelivered events.
pub fn change_event_bus(capacity: usize) -> (ChangeEventPublisher, ChangeEventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChangeEventPublisher { tx }, ChangeEventStream { rx })
}

/// Producer half, held by the source-of-truth collaborator.
#[derive(Debug, Clone)]
pub struct ChangeEventPublisher {
    tx: mpsc::Sender<ChangeEvent>,
}

impl ChangeEventPublisher {
    /// Publishes an event, waiting for capacity if the bus is full.
    pub async fn publish(&self, event: ChangeEvent) -> Result<()> {
        debug!(
            entity = %event.entity_id,
            entity_type = ?event.entity_type,
            operation = ?event.operation,
            "publishing change event"
        );
        self.tx.send(event).await.map_err(|err| {
            warn!(entity = %err.0.entity_id, "change event bus closed");
            CacheError::Internal("change event bus closed".to_string())
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, drained by the invalidation engine.
#[derive(Debug)]
pub struct ChangeEventStream {
    rx: mpsc::Receiver<ChangeEvent>,
}

impl ChangeEventStream {
    /// Next event, or `None` once every publisher is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}
