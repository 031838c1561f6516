//! Deployment planning: kind tiers, ordered by dependency rank then name.

mod graph;

pub use graph::{DependencyGraphBuilder, GraphNode, GraphOrder, NodeTag};

use crate::error::{MigrateError, Result};
use crate::schema::{ObjectKind, SchemaDescription, SchemaObject};
use graph::layered_topological_order;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// A schema object with its position inside its tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedObject {
    #[serde(flatten)]
    pub object: SchemaObject,
    /// Dependency wave within the tier.
    pub rank: usize,
}

/// All objects of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub kind: ObjectKind,
    pub objects: Vec<PlannedObject>,
}

/// Ordered deployment of every transformed object plus the data-load order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// One tier per kind, in tier order. Empty tiers are kept.
    pub tiers: Vec<Tier>,

    /// Constraints on cyclic or self-referencing tables, applied after the data load.
    pub deferred_constraints: Vec<PlannedObject>,

    /// Tables in parent-before-child order for the data load.
    pub data_order: Vec<String>,

    /// Tables that reference each other in a cycle.
    pub deferred_groups: Vec<Vec<String>>,

    /// Tables with a foreign key to themselves.
    pub self_referencing: Vec<String>,

    /// Non-fatal findings from planning.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl DeploymentPlan {
    /// Build the plan from introspected metadata and transformed objects.
    ///
    /// Fails when an object depends on a name that is neither a described
    /// table nor another object, or when an object appears twice.
    pub fn build(
        schema: &SchemaDescription,
        objects: Vec<SchemaObject>,
        builder: &DependencyGraphBuilder,
    ) -> Result<Self> {
        let graph = builder.build(&schema.tables)?;
        let mut warnings = Vec::new();

        let mut seen = BTreeSet::new();
        for object in &objects {
            if !seen.insert(object.key()) {
                return Err(MigrateError::Plan(format!(
                    "{} '{}' appears more than once",
                    object.kind, object.name
                )));
            }
        }

        // Name -> kinds, to resolve dependencies and catch cross-tier inversions
        let mut kinds_by_name: BTreeMap<&str, BTreeSet<ObjectKind>> = BTreeMap::new();
        for table in &schema.tables {
            kinds_by_name.entry(table.name.as_str()).or_default().insert(ObjectKind::Table);
        }
        for object in &objects {
            kinds_by_name.entry(object.name.as_str()).or_default().insert(object.kind);
        }
        for object in &objects {
            for dep in &object.depends_on {
                if dep == &object.name {
                    continue;
                }
                let kinds = kinds_by_name.get(dep.as_str()).ok_or_else(|| {
                    MigrateError::Plan(format!(
                        "{} '{}' depends on unknown object '{}'",
                        object.kind, object.name, dep
                    ))
                })?;
                if kinds.iter().all(|k| *k > object.kind) {
                    warnings.push(format!(
                        "{} '{}' depends on '{}', which deploys in a later tier",
                        object.kind, object.name, dep
                    ));
                }
            }
        }

        for kind in [ObjectKind::Table, ObjectKind::View, ObjectKind::Trigger, ObjectKind::Routine] {
            for name in schema.described_names(kind) {
                if !seen.contains(&format!("{}:{}", kind, name)) {
                    warnings.push(format!("no transformed {} for '{}'", kind, name));
                }
            }
        }

        let mut by_kind: BTreeMap<ObjectKind, Vec<SchemaObject>> = BTreeMap::new();
        for object in objects {
            by_kind.entry(object.kind).or_default().push(object);
        }

        let mut tiers = Vec::with_capacity(ObjectKind::TIERS.len());
        let mut deferred_constraints = Vec::new();
        for kind in ObjectKind::TIERS {
            let members = by_kind.remove(&kind).unwrap_or_default();
            let ordered = match kind {
                ObjectKind::Table => order_tables(members, &graph),
                _ => order_within_tier(kind, members, &mut warnings),
            };

            let objects = if kind == ObjectKind::Constraint {
                let (deferred, immediate): (Vec<_>, Vec<_>) =
                    ordered.into_iter().partition(|p| {
                        p.object.depends_on.iter().any(|dep| graph.defers_constraints(dep))
                    });
                deferred_constraints = deferred;
                immediate
            } else {
                ordered
            };

            tiers.push(Tier { kind, objects });
        }

        for warning in &warnings {
            warn!("Plan: {}", warning);
        }

        let plan = Self {
            tiers,
            deferred_constraints,
            data_order: graph.order().into_iter().map(String::from).collect(),
            deferred_groups: graph.deferred_groups.clone(),
            self_referencing: graph.self_referencing().into_iter().map(String::from).collect(),
            warnings,
        };

        info!(
            "Plan: {} objects in {} tiers ({} deferred constraints), {} tables to load",
            plan.object_count(),
            plan.tiers.iter().filter(|t| !t.objects.is_empty()).count(),
            plan.deferred_constraints.len(),
            plan.data_order.len()
        );

        Ok(plan)
    }

    pub fn tier(&self, kind: ObjectKind) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.kind == kind)
    }

    /// Every planned object in execution order, deferred constraints last.
    pub fn objects(&self) -> impl Iterator<Item = &PlannedObject> {
        self.tiers
            .iter()
            .flat_map(|t| t.objects.iter())
            .chain(self.deferred_constraints.iter())
    }

    pub fn object_count(&self) -> usize {
        self.objects().count()
    }

    /// Object keys in execution order, for comparing runs.
    pub fn ordering(&self) -> Vec<String> {
        self.objects().map(|p| p.object.key()).collect()
    }
}

/// Tables follow the foreign-key graph. Tables without metadata go first.
fn order_tables(members: Vec<SchemaObject>, graph: &GraphOrder) -> Vec<PlannedObject> {
    let mut planned: Vec<(usize, usize, SchemaObject)> = members
        .into_iter()
        .map(|object| {
            let position = graph
                .nodes
                .iter()
                .position(|n| n.name == object.name)
                .map(|p| p + 1)
                .unwrap_or(0);
            let rank = graph.rank_of(&object.name).unwrap_or(0);
            (position, rank, object)
        })
        .collect();
    planned.sort_by(|a, b| (a.0, &a.2.name).cmp(&(b.0, &b.2.name)));
    planned
        .into_iter()
        .map(|(_, rank, object)| PlannedObject { object, rank })
        .collect()
}

/// Kahn waves over dependencies between objects of the same tier
/// (views on views, routines calling routines). Cycles go last, by name.
fn order_within_tier(
    kind: ObjectKind,
    mut members: Vec<SchemaObject>,
    warnings: &mut Vec<String>,
) -> Vec<PlannedObject> {
    members.sort_by(|a, b| a.name.cmp(&b.name));
    let index: BTreeMap<&str, usize> = members
        .iter()
        .enumerate()
        .map(|(i, o)| (o.name.as_str(), i))
        .collect();
    let parents: Vec<BTreeSet<usize>> = members
        .iter()
        .enumerate()
        .map(|(i, o)| {
            o.depends_on
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .filter(|&p| p != i)
                .collect()
        })
        .collect();
    let keys: Vec<&str> = members.iter().map(|o| o.name.as_str()).collect();

    let (ordered, leftover) = layered_topological_order(&keys, &parents);
    let last_rank = ordered.last().map(|(_, r)| r + 1).unwrap_or(0);
    if !leftover.is_empty() {
        let names: Vec<&str> = leftover.iter().map(|&i| keys[i]).collect();
        warnings.push(format!(
            "cyclic {} dependencies between {}; applying by name",
            kind,
            names.join(", ")
        ));
    }

    let placement: Vec<(usize, usize)> = ordered
        .into_iter()
        .chain(leftover.into_iter().map(|i| (i, last_rank)))
        .collect();

    let mut slots: Vec<Option<SchemaObject>> = members.into_iter().map(Some).collect();
    placement
        .into_iter()
        .filter_map(|(i, rank)| slots[i].take().map(|object| PlannedObject { object, rank }))
        .collect()
}
