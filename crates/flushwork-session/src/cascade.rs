//! Cascade resolution across relationships.
//!
//! - **persist**: reachable transient entities become new.
//! - **remove**: dependents of a removed entity are removed too.
//! - **orphan removal**: elements dropped from a collection are removed
//!   unless something else still holds them. Orphan removal also implies
//!   remove-on-owner-removal.
//!
//! Every traversal carries a visited set, so bidirectional and cyclic graphs
//! terminate and no entity is scheduled twice.

use crate::entity::{EntityArena, EntityHandle, EntityState, RelationRef, Slot};
use flushwork_core::{EntityContext, ValidationError};
use std::collections::{HashMap, HashSet};

/// An entity whose state a cascade changed, with its state before the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub handle: EntityHandle,
    pub previous: EntityState,
}

/// Handles reachable from `handle` through relationships accepted by `follow`.
fn related(
    arena: &EntityArena,
    handle: EntityHandle,
    follow: impl Fn(&flushwork_core::CascadeFlags) -> bool,
) -> Vec<EntityHandle> {
    let entity = arena.get(handle);
    let mut out = Vec::new();
    for (i, prop) in entity.descriptor.properties().iter().enumerate() {
        if !prop.is_relationship() || !follow(&prop.cascade_flags()) {
            continue;
        }
        match &entity.slots[i] {
            Slot::Reference(RelationRef::Entity(target)) => out.push(*target),
            Slot::Collection(members) => out.extend(members.iter().copied()),
            _ => {}
        }
    }
    out
}

/// Schedule `roots` and everything reachable through `persist` cascades.
///
/// Transient entities become new. Removed entities reached through a cascade
/// stay removed; detached ones are not traversed.
pub(crate) fn cascade_persist(arena: &mut EntityArena, roots: &[EntityHandle]) -> Vec<Transition> {
    let mut visited = HashSet::new();
    let mut stack: Vec<EntityHandle> = roots.to_vec();
    let mut transitions = Vec::new();

    while let Some(handle) = stack.pop() {
        if !visited.insert(handle) {
            continue;
        }
        let previous = arena.get(handle).state;
        match previous {
            EntityState::Transient => {
                arena.get_mut(handle).state = EntityState::New;
                transitions.push(Transition { handle, previous });
                tracing::trace!(entity = %arena.describe(handle), "Cascade persist");
            }
            EntityState::New | EntityState::Managed => {}
            EntityState::Removed | EntityState::Detached => continue,
        }
        stack.extend(related(arena, handle, |c| c.persist));
    }
    transitions
}

/// Remove `roots` and everything reachable through `remove` or
/// `orphan_removal` cascades.
///
/// Managed entities become removed; new entities fall back to transient.
pub(crate) fn cascade_remove(arena: &mut EntityArena, roots: &[EntityHandle]) -> Vec<Transition> {
    let mut visited = HashSet::new();
    let mut stack: Vec<EntityHandle> = roots.to_vec();
    let mut transitions = Vec::new();

    while let Some(handle) = stack.pop() {
        if !visited.insert(handle) {
            continue;
        }
        let previous = arena.get(handle).state;
        let next = match previous {
            EntityState::Managed => EntityState::Removed,
            EntityState::New => EntityState::Transient,
            EntityState::Removed => EntityState::Removed,
            EntityState::Transient | EntityState::Detached => continue,
        };
        if next != previous {
            arena.get_mut(handle).state = next;
            transitions.push(Transition { handle, previous });
            tracing::trace!(entity = %arena.describe(handle), ?next, "Cascade remove");
        }
        stack.extend(related(arena, handle, |c| c.cascades_remove()));
    }
    transitions
}

/// Is `via_property` on `holder` the back-pointer of one of `element`'s own
/// collections? Such references come from the element's children and do not
/// keep it alive.
fn is_child_back_pointer(
    arena: &EntityArena,
    element: EntityHandle,
    holder: EntityHandle,
    via_property: &str,
) -> bool {
    let holder_type = arena.get(holder).type_name();
    arena
        .get(element)
        .descriptor
        .properties()
        .iter()
        .filter(|p| p.is_collection())
        .filter_map(|p| p.relationship.as_ref())
        .any(|rel| rel.target == holder_type && rel.mapped_by.as_deref() == Some(via_property))
}

/// Find collection elements dropped from orphan-removal collections that no
/// live entity still holds.
pub(crate) fn find_orphans(arena: &EntityArena) -> Vec<EntityHandle> {
    let mut candidates: Vec<(EntityHandle, EntityHandle)> = Vec::new();
    for (owner, entity) in arena.iter() {
        if entity.state != EntityState::Managed {
            continue;
        }
        let Some(snapshot) = &entity.snapshot else {
            continue;
        };
        for (i, prop) in entity.descriptor.properties().iter().enumerate() {
            if !prop.is_collection() || !prop.cascade_flags().orphan_removal {
                continue;
            }
            let current = entity.members(i);
            for dropped in snapshot.members(i).iter().filter(|m| !current.contains(m)) {
                candidates.push((owner, *dropped));
            }
        }
    }
    if candidates.is_empty() {
        return Vec::new();
    }

    // First owner per managed candidate, in discovery order.
    let mut owners: HashMap<EntityHandle, EntityHandle> = HashMap::new();
    let mut order = Vec::new();
    for (owner, element) in candidates {
        if arena.get(element).state == EntityState::Managed && !owners.contains_key(&element) {
            owners.insert(element, owner);
            order.push(element);
        }
    }

    let mut held: HashSet<EntityHandle> = HashSet::new();
    for (holder, entity) in arena.iter() {
        if !entity.state.is_live() {
            continue;
        }
        for (i, prop) in entity.descriptor.properties().iter().enumerate() {
            match &entity.slots[i] {
                Slot::Collection(members) => held.extend(
                    members
                        .iter()
                        .filter(|m| **m != holder && owners.contains_key(m)),
                ),
                Slot::Reference(RelationRef::Entity(t))
                    if *t != holder
                        && owners.contains_key(t)
                        && !is_child_back_pointer(arena, *t, holder, &prop.name) =>
                {
                    held.insert(*t);
                }
                _ => {}
            }
        }
    }

    let mut orphans = Vec::new();
    for element in order {
        if held.contains(&element) {
            tracing::debug!(
                element = %arena.describe(element),
                owner = %arena.describe(owners[&element]),
                "Dropped element still referenced; not an orphan"
            );
        } else {
            orphans.push(element);
        }
    }
    orphans
}

/// Report live entities referencing transient ones through relationships
/// without a persist cascade.
pub(crate) fn check_transient_references(arena: &EntityArena, errors: &mut ValidationError) {
    for (handle, entity) in arena.iter() {
        if !entity.state.is_live() {
            continue;
        }
        for (i, prop) in entity.descriptor.properties().iter().enumerate() {
            let targets: Vec<EntityHandle> = match &entity.slots[i] {
                Slot::Reference(RelationRef::Entity(t)) => vec![*t],
                Slot::Collection(members) => members.clone(),
                _ => continue,
            };
            for target in targets {
                if arena.get(target).state == EntityState::Transient {
                    let mut ctx = EntityContext::new(entity.type_name());
                    if let Some(key) = arena.key_of(handle) {
                        ctx = ctx.with_key(key);
                    }
                    errors.add_transient_reference(
                        ctx,
                        prop.name.clone(),
                        arena.get(target).type_name(),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_tracker::EntitySnapshot;
    use crate::entity::ManagedEntity;
    use flushwork_core::{
        CascadeFlags, EntityDescriptor, MetadataRegistry, PropertyInfo, SqlType, Value,
        ValidationErrorKind,
    };
    use std::sync::Arc;

    fn registry(children: CascadeFlags) -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityDescriptor::new("Parent", "parents")
                    .property(PropertyInfo::scalar("id", SqlType::BigInt).primary_key(true))
                    .property(PropertyInfo::one_to_many("children", "Child", "parent").cascade(children)),
            )
            .entity(
                EntityDescriptor::new("Child", "children")
                    .property(PropertyInfo::scalar("id", SqlType::BigInt).primary_key(true))
                    .property(
                        PropertyInfo::many_to_one("parent", "Parent", &["parent_id"])
                            .nullable(true)
                            .cascade(CascadeFlags::PERSIST),
                    ),
            )
            .build()
            .unwrap()
    }

    fn entity(
        arena: &mut EntityArena,
        reg: &MetadataRegistry,
        ty: &str,
        id: i64,
        state: EntityState,
    ) -> EntityHandle {
        let mut e = ManagedEntity::new(Arc::clone(reg.get(ty).unwrap()));
        e.slots[0] = Slot::Scalar(Value::BigInt(id));
        e.state = state;
        arena.insert(e)
    }

    fn link(arena: &mut EntityArena, parent: EntityHandle, child: EntityHandle) {
        if let Slot::Collection(m) = &mut arena.get_mut(parent).slots[1] {
            m.push(child);
        }
        arena.get_mut(child).slots[1] = Slot::Reference(RelationRef::Entity(parent));
    }

    fn snapshot_all(arena: &mut EntityArena) {
        let handles: Vec<EntityHandle> = arena.handles().collect();
        for h in handles {
            let snap = EntitySnapshot::capture(arena, h);
            arena.get_mut(h).snapshot = Some(snap);
        }
    }

    #[test]
    fn test_cascade_persist_reaches_children() {
        let reg = registry(CascadeFlags::PERSIST);
        let mut arena = EntityArena::default();
        let p = entity(&mut arena, &reg, "Parent", 1, EntityState::Transient);
        let c = entity(&mut arena, &reg, "Child", 2, EntityState::Transient);
        link(&mut arena, p, c);

        let transitions = cascade_persist(&mut arena, &[p]);
        assert_eq!(transitions.len(), 2);
        assert_eq!(arena.get(c).state, EntityState::New);
    }

    #[test]
    fn test_cascade_persist_without_flag_stops() {
        let reg = registry(CascadeFlags::NONE);
        let mut arena = EntityArena::default();
        let p = entity(&mut arena, &reg, "Parent", 1, EntityState::Transient);
        let c = entity(&mut arena, &reg, "Child", 2, EntityState::Transient);
        link(&mut arena, p, c);

        cascade_persist(&mut arena, &[p]);
        assert_eq!(arena.get(c).state, EntityState::Transient);

        let mut errors = ValidationError::new();
        check_transient_references(&arena, &mut errors);
        assert!(errors.has_kind(ValidationErrorKind::TransientReference));
    }

    #[test]
    fn test_cascade_remove_bidirectional_terminates() {
        let reg = registry(CascadeFlags::ALL);
        let mut arena = EntityArena::default();
        let p = entity(&mut arena, &reg, "Parent", 1, EntityState::Managed);
        let c1 = entity(&mut arena, &reg, "Child", 2, EntityState::Managed);
        let c2 = entity(&mut arena, &reg, "Child", 3, EntityState::Managed);
        link(&mut arena, p, c1);
        link(&mut arena, p, c2);

        let transitions = cascade_remove(&mut arena, &[p]);
        assert_eq!(transitions.len(), 3);
        assert!(
            [p, c1, c2]
                .iter()
                .all(|h| arena.get(*h).state == EntityState::Removed)
        );
    }

    #[test]
    fn test_removing_new_entity_unschedules_it() {
        let reg = registry(CascadeFlags::ALL);
        let mut arena = EntityArena::default();
        let p = entity(&mut arena, &reg, "Parent", 1, EntityState::New);
        let transitions = cascade_remove(&mut arena, &[p]);
        assert_eq!(transitions[0].previous, EntityState::New);
        assert_eq!(arena.get(p).state, EntityState::Transient);
    }

    #[test]
    fn test_orphans_detected_unless_held_elsewhere() {
        let reg = registry(CascadeFlags::PERSIST.with_orphan_removal());
        let mut arena = EntityArena::default();
        let p = entity(&mut arena, &reg, "Parent", 1, EntityState::Managed);
        let other = entity(&mut arena, &reg, "Parent", 2, EntityState::Managed);
        let y1 = entity(&mut arena, &reg, "Child", 10, EntityState::Managed);
        let y2 = entity(&mut arena, &reg, "Child", 11, EntityState::Managed);
        link(&mut arena, p, y1);
        link(&mut arena, p, y2);
        snapshot_all(&mut arena);

        // Drop both; move y2 under another parent.
        if let Slot::Collection(m) = &mut arena.get_mut(p).slots[1] {
            m.clear();
        }
        link(&mut arena, other, y2);

        assert_eq!(find_orphans(&arena), vec![y1]);
    }

    #[test]
    fn test_orphans_reported_in_collection_order() {
        let reg = registry(CascadeFlags::PERSIST.with_orphan_removal());
        let mut arena = EntityArena::default();
        let p = entity(&mut arena, &reg, "Parent", 1, EntityState::Managed);
        let keeper = entity(&mut arena, &reg, "Parent", 2, EntityState::Managed);
        let children: Vec<EntityHandle> = (0..500)
            .map(|i| {
                let c = entity(&mut arena, &reg, "Child", 100 + i, EntityState::Managed);
                link(&mut arena, p, c);
                c
            })
            .collect();
        snapshot_all(&mut arena);

        if let Slot::Collection(m) = &mut arena.get_mut(p).slots[1] {
            m.clear();
        }
        // Every tenth child moves to another parent.
        for c in children.iter().step_by(10) {
            link(&mut arena, keeper, *c);
        }

        let expected: Vec<EntityHandle> = children
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 10 != 0)
            .map(|(_, c)| *c)
            .collect();
        assert_eq!(find_orphans(&arena), expected);
    }
}
