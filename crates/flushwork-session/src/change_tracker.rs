//! Snapshot-based change detection.
//!
//! Each managed entity carries an [`EntitySnapshot`] of its last persisted
//! state. A flush compares current values against that snapshot to build a
//! [`ChangeSet`]. Detection is value-based: a property mutated and then
//! restored produces no change.

use crate::entity::{EntityArena, EntityHandle, EntityState, ForeignKey, RelationRef, Slot, TentativeKeys};
use flushwork_core::{ChangeKind, EntityDescriptor, Value};
use std::sync::Arc;
use std::time::Instant;

/// Last known persisted value of one property.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SnapshotValue {
    Scalar(Value),
    /// FK values of an owning relationship; `None` is NULL.
    ForeignKey(Option<Vec<Value>>),
    /// Membership of a to-many relationship.
    Members(Vec<EntityHandle>),
}

/// Snapshot of an entity's persisted state at a point in time.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    values: Vec<SnapshotValue>,
    taken_at: Instant,
}

impl EntitySnapshot {
    /// Capture the current state of `handle`.
    pub(crate) fn capture(arena: &EntityArena, handle: EntityHandle) -> Self {
        let entity = arena.get(handle);
        let values = entity
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Scalar(v) => SnapshotValue::Scalar(v.clone()),
                Slot::Reference(r) => match arena.foreign_key(r, &TentativeKeys::new()) {
                    ForeignKey::Known(values) => SnapshotValue::ForeignKey(Some(values)),
                    ForeignKey::Null => SnapshotValue::ForeignKey(None),
                    ForeignKey::Pending(target) => {
                        tracing::warn!(
                            entity = %arena.describe(handle),
                            target = %target,
                            "Snapshot taken while a referenced key is unknown"
                        );
                        SnapshotValue::ForeignKey(None)
                    }
                },
                Slot::Collection(members) => SnapshotValue::Members(members.clone()),
            })
            .collect();
        tracing::trace!(entity = %arena.describe(handle), "Taking entity snapshot");
        Self {
            values,
            taken_at: Instant::now(),
        }
    }

    /// When the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    pub(crate) fn value(&self, index: usize) -> &SnapshotValue {
        &self.values[index]
    }

    pub(crate) fn scalar(&self, index: usize) -> Option<&Value> {
        match &self.values[index] {
            SnapshotValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn members(&self, index: usize) -> &[EntityHandle] {
        match &self.values[index] {
            SnapshotValue::Members(m) => m,
            _ => &[],
        }
    }

    pub(crate) fn set(&mut self, index: usize, value: SnapshotValue) {
        self.values[index] = value;
    }

    pub(crate) fn remove_member(&mut self, handle: EntityHandle) {
        for value in &mut self.values {
            if let SnapshotValue::Members(m) = value {
                m.retain(|h| *h != handle);
            }
        }
    }
}

/// New value of one changed property.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeValue {
    Scalar(Value),
    Reference(RelationRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub property: String,
    pub index: usize,
    pub value: ChangeValue,
}

/// Pending write for one entity, rebuilt on every flush.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub entity: EntityHandle,
    pub descriptor: Arc<EntityDescriptor>,
    pub kind: ChangeKind,
    pub changes: Vec<PropertyChange>,
    /// Primary key, when already known.
    pub primary_key: Option<Vec<Value>>,
    /// Version the row carries in the store (Update/Delete) or is inserted with (Create).
    pub version: Option<Value>,
}

impl ChangeSet {
    pub fn entity_type(&self) -> &str {
        self.descriptor.name()
    }

    pub fn changed_properties(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.property.as_str()).collect()
    }

    pub fn change(&self, property: &str) -> Option<&ChangeValue> {
        self.changes
            .iter()
            .find(|c| c.property == property)
            .map(|c| &c.value)
    }
}

pub(crate) fn fk_matches(current: &ForeignKey, snapshot: &SnapshotValue) -> bool {
    match (current, snapshot) {
        (ForeignKey::Null, SnapshotValue::ForeignKey(None)) => true,
        (ForeignKey::Known(now), SnapshotValue::ForeignKey(Some(then))) => {
            now.len() == then.len()
                && now
                    .iter()
                    .zip(then)
                    .all(|(a, b)| a.canonical() == b.canonical())
        }
        _ => false,
    }
}

/// Compute the change set of `handle`, if it has anything to write.
pub(crate) fn compute(arena: &EntityArena, handle: EntityHandle) -> Option<ChangeSet> {
    let entity = arena.get(handle);
    let desc = &entity.descriptor;

    match entity.state {
        EntityState::Transient | EntityState::Detached => None,
        EntityState::Removed => {
            let version = match (&entity.snapshot, desc.version_index()) {
                (Some(snap), Some(v)) => snap.scalar(v).cloned(),
                (None, Some(_)) => entity.version().cloned(),
                _ => None,
            };
            Some(ChangeSet {
                entity: handle,
                descriptor: Arc::clone(desc),
                kind: ChangeKind::Delete,
                changes: Vec::new(),
                primary_key: entity.identity.clone().or_else(|| arena.key_of(handle)),
                version,
            })
        }
        EntityState::New => {
            let mut changes = Vec::new();
            let mut version = None;
            for (i, prop) in desc.properties().iter().enumerate() {
                let value = match &entity.slots[i] {
                    Slot::Collection(_) => continue,
                    Slot::Scalar(Value::Null) if prop.generated => continue,
                    Slot::Scalar(v) if prop.version => {
                        let initial = if v.is_null() { Value::BigInt(1) } else { v.clone() };
                        version = Some(initial.clone());
                        ChangeValue::Scalar(initial)
                    }
                    Slot::Scalar(v) => ChangeValue::Scalar(v.clone()),
                    Slot::Reference(r) => ChangeValue::Reference(r.clone()),
                };
                changes.push(PropertyChange {
                    property: prop.name.clone(),
                    index: i,
                    value,
                });
            }
            Some(ChangeSet {
                entity: handle,
                descriptor: Arc::clone(desc),
                kind: ChangeKind::Create,
                changes,
                primary_key: arena.key_of(handle),
                version,
            })
        }
        EntityState::Managed => {
            let changes = diff(arena, handle);
            if changes.is_empty() {
                return None;
            }
            let version = desc
                .version_index()
                .and_then(|v| entity.snapshot.as_ref().and_then(|s| s.scalar(v)).cloned());
            Some(ChangeSet {
                entity: handle,
                descriptor: Arc::clone(desc),
                kind: ChangeKind::Update,
                changes,
                primary_key: entity.identity.clone().or_else(|| arena.key_of(handle)),
                version,
            })
        }
    }
}

/// Properties of `handle` whose current value differs from its snapshot.
/// Collections and the version property are never reported.
pub(crate) fn diff(arena: &EntityArena, handle: EntityHandle) -> Vec<PropertyChange> {
    let entity = arena.get(handle);
    let snapshot = entity.snapshot.as_ref();
    let mut changes = Vec::new();
    for (i, prop) in entity.descriptor.properties().iter().enumerate() {
        if prop.version {
            continue;
        }
        let change = match &entity.slots[i] {
            Slot::Collection(_) => None,
            Slot::Scalar(current) => {
                let unchanged = snapshot
                    .and_then(|s| s.scalar(i))
                    .is_some_and(|old| prop.values_equal(old, current));
                (!unchanged).then(|| ChangeValue::Scalar(current.clone()))
            }
            Slot::Reference(r) => {
                let current = arena.foreign_key(r, &TentativeKeys::new());
                let unchanged = snapshot.is_some_and(|s| fk_matches(&current, s.value(i)));
                (!unchanged).then(|| ChangeValue::Reference(r.clone()))
            }
        };
        if let Some(value) = change {
            tracing::trace!(
                entity = %arena.describe(handle),
                property = %prop.name,
                "Property changed"
            );
            changes.push(PropertyChange {
                property: prop.name.clone(),
                index: i,
                value,
            });
        }
    }
    changes
}

/// Does any collection of `handle` differ from its snapshot membership?
pub(crate) fn membership_changed(arena: &EntityArena, handle: EntityHandle) -> bool {
    let entity = arena.get(handle);
    let Some(snapshot) = &entity.snapshot else {
        return entity
            .slots
            .iter()
            .any(|s| matches!(s, Slot::Collection(m) if !m.is_empty()));
    };
    entity.slots.iter().enumerate().any(|(i, slot)| match slot {
        Slot::Collection(members) => {
            let before = snapshot.members(i);
            members.len() != before.len() || members.iter().any(|m| !before.contains(m))
        }
        _ => false,
    })
}
