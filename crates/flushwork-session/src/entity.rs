//! Per-session entity arena.
//!
//! Entities are owned by the session and addressed through [`EntityHandle`]
//! indices. Relationships hold handles or bare key values, never pointers,
//! so arbitrary (cyclic) object graphs need no shared ownership.

use crate::change_tracker::EntitySnapshot;
use flushwork_core::{EntityDescriptor, Error, Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Opaque handle to an entity owned by a session.
///
/// Slots are reused once an entity is released; the generation tells a
/// stale handle apart from the entity now occupying its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle {
    index: u32,
    generation: u32,
}

impl EntityHandle {
    pub const fn index(self) -> usize {
        self.index as usize
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "#{}", self.index)
        } else {
            write!(f, "#{}.{}", self.index, self.generation)
        }
    }
}

/// Lifecycle state of an entity within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Instantiated but not scheduled for persistence.
    Transient,
    /// Scheduled for insert on the next flush.
    New,
    /// Persistent and tracked against its snapshot.
    Managed,
    /// Scheduled for delete on the next flush.
    Removed,
    /// No longer tracked by the session.
    Detached,
}

impl EntityState {
    /// Will this entity exist in the store after the next flush?
    pub const fn is_live(self) -> bool {
        matches!(self, EntityState::New | EntityState::Managed)
    }
}

/// Value of a to-one relationship.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationRef {
    /// NULL foreign key.
    None,
    /// Foreign key to a row that is not loaded in this session.
    Key(Vec<Value>),
    /// Reference to an entity in this session.
    Entity(EntityHandle),
}

impl RelationRef {
    pub const fn is_none(&self) -> bool {
        matches!(self, RelationRef::None)
    }

    pub const fn handle(&self) -> Option<EntityHandle> {
        match self {
            RelationRef::Entity(h) => Some(*h),
            _ => None,
        }
    }
}

/// Storage for one property of one entity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    Scalar(Value),
    Reference(RelationRef),
    Collection(Vec<EntityHandle>),
}

/// Resolved foreign-key value of a reference.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ForeignKey {
    Null,
    Known(Vec<Value>),
    /// Points at an entity whose key is not known yet.
    Pending(EntityHandle),
}

#[derive(Debug)]
pub(crate) struct ManagedEntity {
    pub descriptor: Arc<EntityDescriptor>,
    pub state: EntityState,
    pub slots: Vec<Slot>,
    pub snapshot: Option<EntitySnapshot>,
    /// Key under which this entity is registered in the identity map.
    pub identity: Option<Vec<Value>>,
}

impl ManagedEntity {
    pub fn new(descriptor: Arc<EntityDescriptor>) -> Self {
        let slots = descriptor
            .properties()
            .iter()
            .map(|p| {
                if p.is_collection() {
                    Slot::Collection(Vec::new())
                } else if p.is_to_one() {
                    Slot::Reference(RelationRef::None)
                } else {
                    Slot::Scalar(Value::Null)
                }
            })
            .collect();
        Self {
            descriptor,
            state: EntityState::Transient,
            slots,
            snapshot: None,
            identity: None,
        }
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn scalar(&self, index: usize) -> &Value {
        match &self.slots[index] {
            Slot::Scalar(v) => v,
            _ => &Value::Null,
        }
    }

    pub fn reference(&self, index: usize) -> &RelationRef {
        match &self.slots[index] {
            Slot::Reference(r) => r,
            _ => &RelationRef::None,
        }
    }

    pub fn members(&self, index: usize) -> &[EntityHandle] {
        match &self.slots[index] {
            Slot::Collection(m) => m,
            _ => &[],
        }
    }

    /// Handles this entity points at through to-one references.
    pub fn referenced_handles(&self) -> impl Iterator<Item = (usize, EntityHandle)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Reference(RelationRef::Entity(h)) => Some((i, *h)),
            _ => None,
        })
    }

    pub fn version(&self) -> Option<&Value> {
        self.descriptor.version_index().map(|i| self.scalar(i))
    }
}

/// Generated key values assigned during an in-flight flush, not yet committed.
pub(crate) type TentativeKeys = HashMap<EntityHandle, Value>;

#[derive(Debug)]
struct Entry {
    generation: u32,
    entity: Option<ManagedEntity>,
}

/// Owns every entity of a session.
#[derive(Debug, Default)]
pub(crate) struct EntityArena {
    entries: Vec<Entry>,
    /// Vacant slots, reused by the next inserts.
    free: Vec<usize>,
    live: usize,
}

impl EntityArena {
    pub fn insert(&mut self, entity: ManagedEntity) -> EntityHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index];
            entry.entity = Some(entity);
            return EntityHandle {
                index: index as u32,
                generation: entry.generation,
            };
        }
        self.entries.push(Entry {
            generation: 0,
            entity: Some(entity),
        });
        EntityHandle {
            index: (self.entries.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Number of entities held.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Allocated slots, vacant ones included.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.entries
            .get(handle.index())
            .is_some_and(|e| e.generation == handle.generation && e.entity.is_some())
    }

    /// Was `handle` issued by this arena for an entity since released?
    pub fn is_released(&self, handle: EntityHandle) -> bool {
        self.entries
            .get(handle.index())
            .is_some_and(|e| handle.generation < e.generation)
    }

    pub fn check(&self, handle: EntityHandle) -> Result<()> {
        if self.contains(handle) {
            Ok(())
        } else if self.is_released(handle) {
            Err(Error::Custom(format!(
                "entity handle {handle} was released from this session"
            )))
        } else {
            Err(Error::Custom(format!(
                "entity handle {handle} does not belong to this session"
            )))
        }
    }

    /// Entity behind a handle that [`check`](Self::check) accepted.
    pub fn get(&self, handle: EntityHandle) -> &ManagedEntity {
        match &self.entries[handle.index()] {
            Entry {
                generation,
                entity: Some(entity),
            } if *generation == handle.generation => entity,
            _ => panic!("stale entity handle {handle}"),
        }
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> &mut ManagedEntity {
        match &mut self.entries[handle.index()] {
            Entry {
                generation,
                entity: Some(entity),
            } if *generation == handle.generation => entity,
            _ => panic!("stale entity handle {handle}"),
        }
    }

    /// Free the slot of `handle`. Later uses of the handle are rejected.
    pub fn remove(&mut self, handle: EntityHandle) -> Option<ManagedEntity> {
        if !self.contains(handle) {
            return None;
        }
        let entry = &mut self.entries[handle.index()];
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.live -= 1;
        entry.entity.take()
    }

    /// Release every entity.
    pub fn clear(&mut self) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.entity.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index);
            }
        }
        self.live = 0;
    }

    pub fn handles(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.iter().map(|(h, _)| h)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityHandle, &ManagedEntity)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.entity.as_ref().map(|entity| {
                (
                    EntityHandle {
                        index: i as u32,
                        generation: e.generation,
                    },
                    entity,
                )
            })
        })
    }

    /// State per slot; vacant slots read as detached.
    pub fn states(&self) -> Vec<EntityState> {
        self.entries
            .iter()
            .map(|e| e.entity.as_ref().map_or(EntityState::Detached, |e| e.state))
            .collect()
    }

    pub fn restore_states(&mut self, states: &[EntityState]) {
        for (entry, state) in self.entries.iter_mut().zip(states) {
            if let Some(entity) = &mut entry.entity {
                entity.state = *state;
            }
        }
    }

    /// Current primary key of `handle`, or `None` while any part is unknown.
    pub fn key_of(&self, handle: EntityHandle) -> Option<Vec<Value>> {
        self.key_with(handle, &TentativeKeys::new())
    }

    /// Like [`key_of`](Self::key_of), consulting keys generated earlier in
    /// the running flush.
    pub fn key_with(&self, handle: EntityHandle, tentative: &TentativeKeys) -> Option<Vec<Value>> {
        let entity = self.get(handle);
        let desc = &entity.descriptor;
        let mut key = Vec::with_capacity(desc.key_columns().len());
        for &pk in desc.primary_key() {
            match &entity.slots[pk] {
                Slot::Scalar(Value::Null) => key.push(tentative.get(&handle)?.clone()),
                Slot::Scalar(v) => key.push(v.clone()),
                Slot::Reference(r) => match self.foreign_key(r, tentative) {
                    ForeignKey::Known(values) => key.extend(values),
                    ForeignKey::Null | ForeignKey::Pending(_) => return None,
                },
                Slot::Collection(_) => return None,
            }
        }
        Some(key)
    }

    /// Resolve the FK values a reference stands for.
    pub fn foreign_key(&self, reference: &RelationRef, tentative: &TentativeKeys) -> ForeignKey {
        match reference {
            RelationRef::None => ForeignKey::Null,
            RelationRef::Key(values) => ForeignKey::Known(values.clone()),
            RelationRef::Entity(target) => match self.key_with(*target, tentative) {
                Some(values) => ForeignKey::Known(values),
                None => ForeignKey::Pending(*target),
            },
        }
    }

    /// Short human-readable label: `Type#key` or `Type(new #n)`.
    pub fn describe(&self, handle: EntityHandle) -> String {
        let entity = self.get(handle);
        match self.key_of(handle) {
            Some(key) => format!("{}#{}", entity.type_name(), flushwork_core::format_key(&key)),
            None => format!("{}(new {})", entity.type_name(), handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flushwork_core::{MetadataRegistry, PropertyInfo, SqlType};

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityDescriptor::new("Order", "orders").property(
                    PropertyInfo::scalar("id", SqlType::BigInt)
                        .primary_key(true)
                        .generated(true),
                ),
            )
            .entity(
                EntityDescriptor::new("Line", "lines")
                    .property(
                        PropertyInfo::many_to_one("order", "Order", &["order_id"])
                            .primary_key(true),
                    )
                    .property(PropertyInfo::scalar("no", SqlType::Integer).primary_key(true)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_entity_has_empty_slots() {
        let reg = registry();
        let entity = ManagedEntity::new(Arc::clone(reg.get("Line").unwrap()));
        assert_eq!(entity.state, EntityState::Transient);
        assert_eq!(entity.reference(0), &RelationRef::None);
        assert_eq!(entity.scalar(1), &Value::Null);
    }

    #[test]
    fn test_embedded_key_resolution() {
        let reg = registry();
        let mut arena = EntityArena::default();
        let order = arena.insert(ManagedEntity::new(Arc::clone(reg.get("Order").unwrap())));
        let mut line = ManagedEntity::new(Arc::clone(reg.get("Line").unwrap()));
        line.slots[0] = Slot::Reference(RelationRef::Entity(order));
        line.slots[1] = Slot::Scalar(Value::Int(1));
        let line = arena.insert(line);

        // Parent key not generated yet.
        assert_eq!(arena.key_of(line), None);
        assert_eq!(
            arena.foreign_key(&RelationRef::Entity(order), &TentativeKeys::new()),
            ForeignKey::Pending(order)
        );

        let mut tentative = TentativeKeys::new();
        tentative.insert(order, Value::BigInt(10));
        assert_eq!(
            arena.key_with(line, &tentative),
            Some(vec![Value::BigInt(10), Value::Int(1)])
        );
        assert_eq!(arena.describe(line), "Line(new #1)");
    }

    #[test]
    fn test_released_slot_is_reused_with_new_generation() {
        let reg = registry();
        let mut arena = EntityArena::default();
        let first = arena.insert(ManagedEntity::new(Arc::clone(reg.get("Order").unwrap())));
        assert!(arena.remove(first).is_some());
        assert!(!arena.contains(first));
        assert!(arena.is_released(first));
        assert!(arena.check(first).is_err());

        let second = arena.insert(ManagedEntity::new(Arc::clone(reg.get("Order").unwrap())));
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert!(arena.contains(second));
        assert!(!arena.contains(first));
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.capacity(), 1);
    }

    #[test]
    fn test_clear_invalidates_every_handle() {
        let reg = registry();
        let mut arena = EntityArena::default();
        let handles: Vec<EntityHandle> = (0..3)
            .map(|_| arena.insert(ManagedEntity::new(Arc::clone(reg.get("Order").unwrap()))))
            .collect();
        arena.clear();
        assert_eq!(arena.len(), 0);
        assert_eq!(arena.handles().count(), 0);
        assert!(handles.iter().all(|h| arena.is_released(*h)));

        for _ in 0..3 {
            arena.insert(ManagedEntity::new(Arc::clone(reg.get("Order").unwrap())));
        }
        assert_eq!(arena.capacity(), 3);
        assert!(handles.iter().all(|h| !arena.contains(*h)));
    }

    #[test]
    fn test_restore_states() {
        let reg = registry();
        let mut arena = EntityArena::default();
        let h = arena.insert(ManagedEntity::new(Arc::clone(reg.get("Order").unwrap())));
        let saved = arena.states();
        arena.get_mut(h).state = EntityState::New;
        arena.restore_states(&saved);
        assert_eq!(arena.get(h).state, EntityState::Transient);
    }
}
