//! Flush ordering for the unit of work.
//!
//! Pending change sets are turned into a [`FlushPlan`] whose phases run in
//! a fixed order:
//!
//! 1. INSERT, parent-first, in dependency layers
//! 2. cycle fixups: UPDATEs populating FKs that were inserted as NULL
//! 3. UPDATE of changed columns
//! 4. cycle null-outs: UPDATEs clearing FKs between rows about to be deleted
//! 5. DELETE, child-first, in dependency layers
//!
//! Ordering is per entity instance, not per table, so self-referencing and
//! mutually referencing types are handled. A cycle is broken by deferring its
//! nullable edges; a cycle made only of required edges is rejected before
//! the store sees a single statement.

use crate::change_tracker::{ChangeSet, ChangeValue, SnapshotValue};
use crate::entity::{EntityArena, EntityHandle, RelationRef};
use crate::graph::{DependencyGraph, Edge};
use crate::identity_map::IdentityMap;
use flushwork_core::{ChangeKind, CycleError, Error, MetadataRegistry, Result, Value};
use std::collections::HashMap;

/// A foreign key written in a separate statement to break a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeferredForeignKey {
    /// Entity owning the FK.
    pub entity: EntityHandle,
    /// Index of the to-one property on that entity's descriptor.
    pub property: usize,
}

/// Ordered write plan for one flush.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// All change sets; the phase lists below index into this.
    pub change_sets: Vec<ChangeSet>,
    /// Creates grouped in dependency layers (parents first).
    pub insert_layers: Vec<Vec<usize>>,
    /// FKs inserted as NULL, populated after all inserts.
    pub cycle_fixups: Vec<DeferredForeignKey>,
    pub updates: Vec<usize>,
    /// FKs nulled before the deletes of a delete cycle.
    pub cycle_null_outs: Vec<DeferredForeignKey>,
    /// Deletes grouped in dependency layers (children first).
    pub delete_layers: Vec<Vec<usize>>,
}

impl FlushPlan {
    /// Check if the plan has any operations.
    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    /// Number of change sets in the plan.
    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.change_sets.iter().filter(|cs| cs.kind == kind).count()
    }

    /// Creates in execution order.
    pub fn inserts(&self) -> impl Iterator<Item = &ChangeSet> {
        self.insert_layers
            .iter()
            .flatten()
            .map(|&i| &self.change_sets[i])
    }

    /// Deletes in execution order.
    pub fn deletes(&self) -> impl Iterator<Item = &ChangeSet> {
        self.delete_layers
            .iter()
            .flatten()
            .map(|&i| &self.change_sets[i])
    }

    /// Is this FK inserted as NULL and populated by a fixup?
    pub fn is_deferred(&self, entity: EntityHandle, property: usize) -> bool {
        self.cycle_fixups.contains(&DeferredForeignKey { entity, property })
    }
}

/// Builds the instance-level dependency graph and orders change sets.
#[derive(Debug)]
pub struct FlushOrderer<'a> {
    registry: &'a MetadataRegistry,
    identity: &'a IdentityMap,
}

/// A dependency discovered between two change sets of the same phase.
struct Dependency {
    before: usize,
    after: usize,
    nullable: bool,
    property: usize,
}

impl<'a> FlushOrderer<'a> {
    pub fn new(registry: &'a MetadataRegistry, identity: &'a IdentityMap) -> Self {
        Self { registry, identity }
    }

    /// Order change sets into a flush plan.
    #[tracing::instrument(level = "debug", skip_all, fields(change_sets = change_sets.len()))]
    pub(crate) fn order(
        &self,
        arena: &EntityArena,
        change_sets: Vec<ChangeSet>,
    ) -> Result<FlushPlan> {
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for (i, cs) in change_sets.iter().enumerate() {
            match cs.kind {
                ChangeKind::Create => creates.push(i),
                ChangeKind::Update => updates.push(i),
                ChangeKind::Delete => deletes.push(i),
            }
        }

        let create_deps = self.create_dependencies(arena, &change_sets, &creates);
        let (insert_layers, cycle_fixups) = order_phase(
            arena,
            &change_sets,
            &creates,
            create_deps,
            ChangeKind::Create,
        )?;

        let delete_deps = self.delete_dependencies(arena, &change_sets, &deletes);
        let (delete_layers, cycle_null_outs) = order_phase(
            arena,
            &change_sets,
            &deletes,
            delete_deps,
            ChangeKind::Delete,
        )?;

        tracing::debug!(
            inserts = creates.len(),
            insert_layers = insert_layers.len(),
            cycle_fixups = cycle_fixups.len(),
            updates = updates.len(),
            cycle_null_outs = cycle_null_outs.len(),
            deletes = deletes.len(),
            delete_layers = delete_layers.len(),
            "Flush plan ordered"
        );

        Ok(FlushPlan {
            change_sets,
            insert_layers,
            cycle_fixups,
            updates,
            cycle_null_outs,
            delete_layers,
        })
    }

    /// A new row must be inserted after every new row it references.
    fn create_dependencies(
        &self,
        arena: &EntityArena,
        change_sets: &[ChangeSet],
        creates: &[usize],
    ) -> Vec<Dependency> {
        let local: HashMap<EntityHandle, usize> = creates
            .iter()
            .enumerate()
            .map(|(local, &i)| (change_sets[i].entity, local))
            .collect();

        let mut deps = Vec::new();
        for (referrer, &i) in creates.iter().enumerate() {
            let cs = &change_sets[i];
            for change in &cs.changes {
                let ChangeValue::Reference(reference) = &change.value else {
                    continue;
                };
                let prop = cs.descriptor.property_at(change.index);
                let target = match reference {
                    RelationRef::Entity(target) => Some(*target),
                    // A bare key may name a new row that claimed its identity on persist.
                    RelationRef::Key(key) => prop.target().and_then(|t| self.lookup(t, key)),
                    RelationRef::None => None,
                };
                let Some(&target_local) = target.as_ref().and_then(|t| local.get(t)) else {
                    continue;
                };
                // A row may reference itself in one statement when its key is
                // known up front.
                if target_local == referrer && arena.key_of(cs.entity).is_some() {
                    continue;
                }
                deps.push(Dependency {
                    before: target_local,
                    after: referrer,
                    nullable: prop.nullable && !prop.primary_key,
                    property: change.index,
                });
            }
        }
        deps
    }

    /// A removed row must be deleted before every removed row it references.
    /// Edges follow the FK values persisted in the store, i.e. the snapshot.
    fn delete_dependencies(
        &self,
        arena: &EntityArena,
        change_sets: &[ChangeSet],
        deletes: &[usize],
    ) -> Vec<Dependency> {
        let local: HashMap<EntityHandle, usize> = deletes
            .iter()
            .enumerate()
            .map(|(local, &i)| (change_sets[i].entity, local))
            .collect();

        let mut deps = Vec::new();
        for (referrer, &i) in deletes.iter().enumerate() {
            let cs = &change_sets[i];
            let entity = arena.get(cs.entity);
            for (p, prop) in cs.descriptor.properties().iter().enumerate() {
                let Some(target_type) = prop.target().filter(|_| prop.is_to_one()) else {
                    continue;
                };
                let target = match entity.snapshot.as_ref().map(|s| s.value(p)) {
                    Some(SnapshotValue::ForeignKey(Some(key))) => self.lookup(target_type, key),
                    Some(_) => None,
                    None => entity.reference(p).handle(),
                };
                let Some(&target_local) = target.as_ref().and_then(|t| local.get(t)) else {
                    continue;
                };
                if target_local == referrer {
                    continue;
                }
                deps.push(Dependency {
                    before: referrer,
                    after: target_local,
                    nullable: prop.nullable && !prop.primary_key,
                    property: p,
                });
            }
        }
        deps
    }

    fn lookup(&self, entity_type: &str, key: &[Value]) -> Option<EntityHandle> {
        let desc = self.registry.get(entity_type)?;
        self.identity.get(desc.id(), key)
    }
}

/// Layer one phase, deferring nullable edges inside cycles.
///
/// Returns the layers (as change-set indices) and the deferred FKs.
fn order_phase(
    arena: &EntityArena,
    change_sets: &[ChangeSet],
    nodes: &[usize],
    deps: Vec<Dependency>,
    phase: ChangeKind,
) -> Result<(Vec<Vec<usize>>, Vec<DeferredForeignKey>)> {
    if nodes.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut graph = DependencyGraph::new(nodes.len());
    for dep in &deps {
        graph.add_edge(dep.before, dep.after, dep.nullable, dep.property);
    }
    let all = |_: usize, _: &Edge| true;

    let mut component_of = vec![0usize; nodes.len()];
    let components = graph.strongly_connected_components(all);
    let mut deferred = vec![false; graph.edges().len()];
    for (c, component) in components.iter().enumerate() {
        for &node in component {
            component_of[node] = c;
        }
        if !graph.is_cycle(component, all) {
            continue;
        }
        for (id, edge) in graph.edges().iter().enumerate() {
            if edge.nullable && component_of[edge.from] == c && component_of[edge.to] == c {
                deferred[id] = true;
            }
        }
    }

    let kept = |id: usize, _: &Edge| !deferred[id];
    let layers = match graph.layers(kept) {
        Ok(layers) => layers,
        Err(stuck) => {
            return Err(cycle_error(arena, change_sets, nodes, &graph, &stuck, &deferred, phase));
        }
    };

    let mut deferred_fks: Vec<DeferredForeignKey> = graph
        .edges()
        .iter()
        .enumerate()
        .filter(|(id, _)| deferred[*id])
        .map(|(_, edge)| {
            // The FK lives on the inserting referrer (Create) or on the row
            // deleted first (Delete).
            let owner = match phase {
                ChangeKind::Delete => edge.from,
                _ => edge.to,
            };
            DeferredForeignKey {
                entity: change_sets[nodes[owner]].entity,
                property: edge.label,
            }
        })
        .collect();
    deferred_fks.sort_unstable();
    deferred_fks.dedup();

    if !deferred_fks.is_empty() {
        tracing::debug!(
            phase = %phase,
            deferred = deferred_fks.len(),
            "Breaking dependency cycle with nullable foreign keys"
        );
    }

    let layers = layers
        .into_iter()
        .map(|layer| layer.into_iter().map(|local| nodes[local]).collect())
        .collect();
    Ok((layers, deferred_fks))
}

fn cycle_error(
    arena: &EntityArena,
    change_sets: &[ChangeSet],
    nodes: &[usize],
    graph: &DependencyGraph,
    stuck: &[usize],
    deferred: &[bool],
    phase: ChangeKind,
) -> Error {
    let required = |id: usize, edge: &Edge| {
        !deferred[id] && stuck.contains(&edge.from) && stuck.contains(&edge.to)
    };
    let cycle = graph
        .strongly_connected_components(required)
        .into_iter()
        .find(|c| graph.is_cycle(c, required))
        .unwrap_or_else(|| stuck.to_vec());

    let mut entity_types: Vec<String> = Vec::new();
    let mut members = Vec::new();
    for local in cycle {
        let cs = &change_sets[nodes[local]];
        if !entity_types.iter().any(|t| t == cs.entity_type()) {
            entity_types.push(cs.entity_type().to_string());
        }
        members.push(arena.describe(cs.entity));
    }
    tracing::warn!(
        phase = %phase,
        types = ?entity_types,
        members = ?members,
        "Unbreakable dependency cycle"
    );
    Error::CircularDependency(CycleError {
        phase,
        entity_types,
        members,
    })
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated (cycle fixups and null-outs not included).
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Number of statement batches sent to the store.
    pub batches: usize,
    /// Number of committed transactions, including deferred flushes.
    pub transactions: usize,
    /// Inserted rows whose key was already claimed by another managed
    /// instance. They stay out of the identity map.
    pub identity_conflicts: usize,
    /// Deferred flush requests dropped at the `max_deferred_flushes` bound.
    pub dropped_flush_requests: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub(crate) fn absorb(&mut self, other: FlushResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.batches += other.batches;
        self.transactions += other.transactions;
        self.identity_conflicts += other.identity_conflicts;
        self.dropped_flush_requests += other.dropped_flush_requests;
    }
}
