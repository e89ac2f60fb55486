//! Invalidation plans: which patterns a change event purges, when, and what
//! gets preloaded afterwards.

use std::collections::HashSet;

use serde::Serialize;

use crate::cache::KeyPattern;
use crate::error::{CacheError, Result};
use crate::events::{ChangeEvent, EntityType, Operation};
use crate::keys::Query;

/// Family patterns covering every tree-shaped view.
const HIERARCHY_FAMILIES: &[&str] = &["cat:hierarchy", "cat:breadcrumb", "cat:path", "cat:children"];

// == Invalidation Plan ==
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvalidationPlan {
    /// Purged on Local and Regional before the change is acknowledged
    pub immediate: Vec<KeyPattern>,
    /// Purged on Local and Regional in the background, with retries
    pub batched: Vec<KeyPattern>,
    /// Forwarded to the edge purge API and broadcast to other instances
    pub propagate: Vec<KeyPattern>,
    /// Repopulated after the purge
    pub preload: Vec<Query>,
}

impl InvalidationPlan {
    /// Plan for a manual invalidation: everything immediate and propagated.
    pub fn manual(patterns: Vec<KeyPattern>) -> Self {
        let mut plan = Self::default();
        for pattern in patterns {
            plan.push_immediate(pattern);
        }
        plan.seal();
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.immediate.is_empty() && self.batched.is_empty() && self.propagate.is_empty()
    }

    /// Every pattern the plan purges anywhere.
    pub fn all_patterns(&self) -> impl Iterator<Item = &KeyPattern> {
        self.immediate.iter().chain(self.batched.iter())
    }

    fn push_immediate(&mut self, pattern: KeyPattern) {
        push_unique(&mut self.immediate, pattern);
    }

    fn push_batched(&mut self, pattern: KeyPattern) {
        push_unique(&mut self.batched, pattern);
    }

    /// Derives `propagate` and drops batched patterns already purged
    /// immediately.
    fn seal(&mut self) {
        let immediate: HashSet<&KeyPattern> = self.immediate.iter().collect();
        self.batched.retain(|p| !immediate.contains(p));
        let mut propagate = Vec::with_capacity(self.immediate.len() + self.batched.len());
        for pattern in self.immediate.iter().chain(self.batched.iter()) {
            push_unique(&mut propagate, pattern.clone());
        }
        self.propagate = propagate;
    }
}

fn push_unique(patterns: &mut Vec<KeyPattern>, pattern: KeyPattern) {
    if !patterns.contains(&pattern) {
        patterns.push(pattern);
    }
}

// == Plan Builder ==
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    max_depth: usize,
}

impl PlanBuilder {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    /// Builds the plan for one change event.
    ///
    /// Fails with `HierarchyDepthExceeded` if the event's ancestor chain is
    /// longer than the depth cap or revisits a category.
    pub fn build(&self, event: &ChangeEvent) -> Result<InvalidationPlan> {
        self.check_ancestors(event)?;
        let mut plan = InvalidationPlan::default();
        match event.entity_type {
            EntityType::Category => self.category(event, &mut plan, true),
            EntityType::Property => Self::property(event, &mut plan),
            EntityType::ValidationRule => Self::rule(event, &mut plan),
        }
        plan.seal();
        Ok(plan)
    }

    /// Plan that skips ancestor traversal entirely, purging every hierarchy
    /// family instead. Used when the ancestor chain cannot be trusted.
    pub fn conservative(&self, event: &ChangeEvent) -> InvalidationPlan {
        let mut plan = InvalidationPlan::default();
        match event.entity_type {
            EntityType::Category => {
                self.category(event, &mut plan, false);
                for family in HIERARCHY_FAMILIES {
                    plan.push_immediate(KeyPattern::family(family));
                }
            }
            EntityType::Property => Self::property(event, &mut plan),
            EntityType::ValidationRule => Self::rule(event, &mut plan),
        }
        plan.seal();
        plan
    }

    fn check_ancestors(&self, event: &ChangeEvent) -> Result<()> {
        let depth = event.ancestors.len();
        let mut seen = HashSet::with_capacity(depth + 1);
        seen.insert(event.entity_id.as_str());
        let cyclic = !event.ancestors.iter().all(|a| seen.insert(a.as_str()));

        if depth > self.max_depth || cyclic {
            return Err(CacheError::HierarchyDepthExceeded {
                entity_id: event.entity_id.clone(),
                depth,
            });
        }
        Ok(())
    }

    fn category(&self, event: &ChangeEvent, plan: &mut InvalidationPlan, with_ancestors: bool) {
        let id = &event.entity_id;
        plan.push_immediate(KeyPattern::family(format!("cat:detail:{id}")));
        plan.push_immediate(KeyPattern::family(format!("cat:{id}")));
        plan.push_immediate(KeyPattern::family(format!("cat:breadcrumb:{id}")));
        plan.push_immediate(KeyPattern::family(format!("cat:path:{id}")));
        if let Some(parent) = &event.parent_id {
            plan.push_immediate(KeyPattern::family(format!("cat:children:{parent}")));
        }

        if event.is_structural() {
            // A tree change is never partially invalidated.
            for family in HIERARCHY_FAMILIES {
                plan.push_immediate(KeyPattern::family(family));
            }
            plan.push_immediate(KeyPattern::family(format!("cat:children:{id}")));
            plan.push_immediate(KeyPattern::family(format!("cat:hierarchy:{id}")));
            if let Some(previous) = &event.previous_parent_id {
                plan.push_immediate(KeyPattern::family(format!("cat:children:{previous}")));
            }
            if with_ancestors {
                for ancestor in &event.ancestors {
                    plan.push_immediate(KeyPattern::family(format!("cat:hierarchy:{ancestor}")));
                }
            }
        } else if event.alters_tree_views() {
            // Names and flags show up in every ancestor's hierarchy and every
            // descendant's breadcrumb.
            plan.push_immediate(KeyPattern::family("cat:hierarchy"));
            plan.push_immediate(KeyPattern::family("cat:breadcrumb"));
        }

        plan.push_batched(KeyPattern::family("cat:list"));
        plan.push_batched(KeyPattern::family("agg"));

        if event.operation != Operation::Delete {
            plan.preload.push(Query::CategoryDetail { id: id.clone() });
        }
    }

    fn property(event: &ChangeEvent, plan: &mut InvalidationPlan) {
        let id = &event.entity_id;
        plan.push_immediate(KeyPattern::family(format!("prop:detail:{id}")));
        plan.push_immediate(KeyPattern::family(format!("prop:{id}")));
        if let Some(category) = &event.parent_id {
            plan.push_immediate(KeyPattern::family(format!("cat:{category}:props")));
        }
        plan.push_batched(KeyPattern::family("prop:list"));
        plan.push_batched(KeyPattern::family("agg"));

        if event.operation != Operation::Delete {
            plan.preload.push(Query::PropertyDetail { id: id.clone() });
        }
    }

    fn rule(event: &ChangeEvent, plan: &mut InvalidationPlan) {
        match &event.parent_id {
            Some(category) => {
                plan.push_immediate(KeyPattern::family(format!("rule:category:{category}")));
                plan.preload.push(Query::ValidationRules {
                    category_id: Some(category.clone()),
                });
            }
            None => plan.push_immediate(KeyPattern::family("rule:list")),
        }
        plan.push_batched(KeyPattern::family("rule:list"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[KeyPattern]) -> Vec<&str> {
        list.iter().map(KeyPattern::as_str).collect()
    }

    #[test]
    fn test_category_rename_plan() {
        let event = ChangeEvent::new(EntityType::Category, "X", Operation::Update)
            .with_changed_fields(["name"])
            .with_parent("P");
        let plan = PlanBuilder::new(64).build(&event).unwrap();

        let immediate = patterns(&plan.immediate);
        assert!(immediate.contains(&"cat:detail:X:*"));
        assert!(immediate.contains(&"cat:children:P:*"));
        assert!(immediate.contains(&"cat:hierarchy:*"));
        assert!(immediate.contains(&"cat:breadcrumb:*"));
        assert!(!immediate.contains(&"cat:path:*"));
        assert_eq!(patterns(&plan.batched), vec!["cat:list:*", "agg:*"]);
        assert_eq!(plan.preload, vec![Query::CategoryDetail { id: "X".into() }]);
        assert_eq!(plan.propagate.len(), plan.immediate.len() + plan.batched.len());
    }

    #[test]
    fn test_field_outside_tree_views_keeps_hierarchy() {
        let event = ChangeEvent::new(EntityType::Category, "X", Operation::Update)
            .with_changed_fields(["description"]);
        let plan = PlanBuilder::new(64).build(&event).unwrap();
        let immediate = patterns(&plan.immediate);
        assert!(immediate.contains(&"cat:breadcrumb:X:*"));
        assert!(!immediate.contains(&"cat:hierarchy:*"));
        assert!(!immediate.contains(&"cat:breadcrumb:*"));
    }

    #[test]
    fn test_reparent_invalidates_whole_hierarchy() {
        let event = ChangeEvent::new(EntityType::Category, "X", Operation::Update)
            .with_changed_fields(["parent_category_id"])
            .with_previous_parent("OLD")
            .with_parent("NEW")
            .with_ancestors(["ROOT", "NEW"]);
        let plan = PlanBuilder::new(64).build(&event).unwrap();

        let immediate = patterns(&plan.immediate);
        for expected in [
            "cat:hierarchy:*",
            "cat:breadcrumb:*",
            "cat:path:*",
            "cat:children:*",
            "cat:breadcrumb:X:*",
            "cat:path:X:*",
            "cat:children:OLD:*",
            "cat:children:NEW:*",
            "cat:hierarchy:ROOT:*",
        ] {
            assert!(immediate.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_create_is_structural() {
        let event = ChangeEvent::new(EntityType::Category, "GRANITE", Operation::Create);
        let plan = PlanBuilder::new(64).build(&event).unwrap();
        assert!(plan.immediate.contains(&KeyPattern::new("cat:hierarchy:*")));
        assert!(plan.batched.contains(&KeyPattern::new("cat:list:*")));
    }

    #[test]
    fn test_delete_skips_preload() {
        let event = ChangeEvent::new(EntityType::Category, "X", Operation::Delete);
        let plan = PlanBuilder::new(64).build(&event).unwrap();
        assert!(plan.preload.is_empty());
    }

    #[test]
    fn test_property_and_rule_plans() {
        let prop = ChangeEvent::new(EntityType::Property, "p1", Operation::Update).with_parent("C");
        let plan = PlanBuilder::new(64).build(&prop).unwrap();
        assert!(plan.immediate.contains(&KeyPattern::new("cat:C:props:*")));
        assert!(plan.batched.contains(&KeyPattern::new("prop:list:*")));

        let rule = ChangeEvent::new(EntityType::ValidationRule, "r1", Operation::Create);
        let plan = PlanBuilder::new(64).build(&rule).unwrap();
        assert_eq!(patterns(&plan.immediate), vec!["rule:list:*"]);
        assert!(plan.batched.is_empty());
        assert_eq!(patterns(&plan.propagate), vec!["rule:list:*"]);
    }

    #[test]
    fn test_cycle_and_depth_are_fatal() {
        let builder = PlanBuilder::new(3);
        let cyclic = ChangeEvent::new(EntityType::Category, "A", Operation::Update)
            .with_changed_fields(["parent_id"])
            .with_ancestors(["B", "A"]);
        let err = builder.build(&cyclic).unwrap_err();
        assert!(matches!(err, CacheError::HierarchyDepthExceeded { .. }));
        assert!(err.is_fatal());

        let deep = ChangeEvent::new(EntityType::Category, "Z", Operation::Create)
            .with_ancestors(["A", "B", "C", "D"]);
        assert!(builder.build(&deep).is_err());

        let fallback = builder.conservative(&deep);
        assert!(fallback.immediate.contains(&KeyPattern::new("cat:hierarchy:*")));
        assert!(!fallback.immediate.contains(&KeyPattern::new("cat:hierarchy:A:*")));
    }

    #[test]
    fn test_manual_plan() {
        let plan = InvalidationPlan::manual(vec!["a:*".into(), "a:*".into(), "b".into()]);
        assert_eq!(patterns(&plan.immediate), vec!["a:*", "b"]);
        assert_eq!(plan.propagate, plan.immediate);
        assert!(plan.batched.is_empty());
    }
}
