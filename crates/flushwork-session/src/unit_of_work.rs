//! Unit of Work bookkeeping for a session.
//!
//! The Unit of Work:
//! - Tracks where a flush is in its pipeline ([`FlushState`])
//! - Remembers entity states from before the flush so a failed or abandoned
//!   flush can restore them
//! - Queues flush requests raised while a flush is running
//! - Prepares the change sets of a flush: cascades, validation, diffing

use crate::SessionConfig;
use crate::cascade;
use crate::change_tracker::{self, ChangeSet, ChangeValue};
use crate::entity::{EntityArena, EntityState, RelationRef};
use crate::identity_map::{EntityKey, IdentityMap};
use flushwork_core::{
    ChangeKind, DuplicateIdentityError, EntityContext, Error, Result, ValidationError,
    ValidationErrorKind,
};
use std::collections::HashMap;

/// Phase of the flush pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushState {
    #[default]
    Idle,
    /// Running cascades, validation and change detection.
    Computing,
    /// Building the dependency graph.
    Ordering,
    /// Transaction open, batches being sent.
    Executing,
    Committing,
    RollingBack,
}

impl FlushState {
    pub const fn is_idle(self) -> bool {
        matches!(self, FlushState::Idle)
    }

    /// Has the store seen a `begin` in this state?
    pub const fn has_open_transaction(self) -> bool {
        matches!(
            self,
            FlushState::Executing | FlushState::Committing | FlushState::RollingBack
        )
    }
}

/// Flush bookkeeping owned by the session.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    state: FlushState,
    /// A flush call is running (hooks included).
    in_flush: bool,
    deferred_requests: usize,
    /// Entity states from before the running flush.
    saved_states: Option<Vec<EntityState>>,
    completed_flushes: u64,
}

impl UnitOfWork {
    /// Create a new idle Unit of Work.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    /// Is a flush call running?
    pub fn in_flush(&self) -> bool {
        self.in_flush
    }

    /// Flush requests queued by the running flush.
    pub fn deferred_requests(&self) -> usize {
        self.deferred_requests
    }

    /// Number of flush transactions committed so far.
    pub fn completed_flushes(&self) -> u64 {
        self.completed_flushes
    }

    /// Did a previous flush stop without reaching a terminal state?
    pub fn is_abandoned(&self) -> bool {
        self.in_flush || !self.state.is_idle()
    }

    pub(crate) fn transition(&mut self, next: FlushState) {
        tracing::trace!(from = ?self.state, to = ?next, "Flush state transition");
        self.state = next;
    }

    pub(crate) fn enter(&mut self) {
        self.in_flush = true;
        self.deferred_requests = 0;
    }

    pub(crate) fn leave(&mut self) {
        self.in_flush = false;
        self.deferred_requests = 0;
    }

    /// Queue a flush to run after the current one. Returns `false` when no
    /// flush is running.
    pub(crate) fn request_flush(&mut self) -> bool {
        if self.in_flush {
            self.deferred_requests += 1;
            true
        } else {
            false
        }
    }

    /// Take the queued requests, returning how many there were.
    pub(crate) fn take_deferred(&mut self) -> usize {
        std::mem::take(&mut self.deferred_requests)
    }

    pub(crate) fn save_states(&mut self, states: Vec<EntityState>) {
        self.saved_states = Some(states);
    }

    pub(crate) fn take_saved_states(&mut self) -> Option<Vec<EntityState>> {
        self.saved_states.take()
    }

    /// Back to idle after commit.
    pub(crate) fn committed(&mut self) {
        self.saved_states = None;
        self.completed_flushes += 1;
        self.transition(FlushState::Idle);
    }

    pub(crate) fn reset(&mut self) {
        self.state = FlushState::Idle;
        self.in_flush = false;
        self.deferred_requests = 0;
        self.saved_states = None;
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub new: usize,
    /// Entities pending UPDATE.
    pub dirty: usize,
    /// Entities pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

/// Run cascades, then compute and validate the change sets of a flush.
///
/// Mutates entity states (cascade transitions); the caller restores them if
/// this or any later stage fails.
#[tracing::instrument(level = "debug", skip_all)]
pub(crate) fn prepare(
    arena: &mut EntityArena,
    identity: &IdentityMap,
    config: &SessionConfig,
) -> Result<Vec<ChangeSet>> {
    let live: Vec<_> = arena
        .iter()
        .filter(|(_, e)| e.state.is_live())
        .map(|(h, _)| h)
        .collect();
    let persisted = cascade::cascade_persist(arena, &live);

    let orphans = cascade::find_orphans(arena);
    let orphaned = cascade::cascade_remove(arena, &orphans);

    let removed: Vec<_> = arena
        .iter()
        .filter(|(_, e)| e.state == EntityState::Removed)
        .map(|(h, _)| h)
        .collect();
    let cascaded = cascade::cascade_remove(arena, &removed);

    if !persisted.is_empty() || !orphaned.is_empty() || !cascaded.is_empty() {
        tracing::debug!(
            persisted = persisted.len(),
            orphans = orphans.len(),
            removed = orphaned.len() + cascaded.len(),
            "Cascades resolved"
        );
    }

    let change_sets: Vec<ChangeSet> = arena
        .handles()
        .filter_map(|h| change_tracker::compute(arena, h))
        .collect();

    validate(arena, &change_sets, config)?;
    check_identities(arena, identity, &change_sets)?;
    Ok(change_sets)
}

fn context_of(arena: &EntityArena, cs: &ChangeSet) -> EntityContext {
    let ctx = EntityContext::new(cs.entity_type()).with_operation(cs.kind);
    match cs.primary_key.clone().or_else(|| arena.key_of(cs.entity)) {
        Some(key) => ctx.with_key(key),
        None => ctx,
    }
}

fn validate(arena: &EntityArena, change_sets: &[ChangeSet], config: &SessionConfig) -> Result<()> {
    let mut errors = ValidationError::new();
    cascade::check_transient_references(arena, &mut errors);

    if config.validate_before_flush {
        for cs in change_sets.iter().filter(|cs| cs.kind != ChangeKind::Delete) {
            let desc = &cs.descriptor;
            for change in &cs.changes {
                let prop = desc.property_at(change.index);
                match &change.value {
                    ChangeValue::Scalar(v) if v.is_null() => {
                        if !prop.nullable && !prop.generated && !prop.version {
                            errors.add_required(context_of(arena, cs), prop.name.clone());
                        }
                    }
                    ChangeValue::Scalar(v) => {
                        if let Some(sql_type) = &prop.sql_type {
                            if !sql_type.accepts(v) {
                                errors.add(
                                    Some(context_of(arena, cs)),
                                    prop.name.clone(),
                                    ValidationErrorKind::Type,
                                    format!(
                                        "'{}' expects {}, got {}",
                                        prop.name,
                                        sql_type.sql_name(),
                                        v.type_name()
                                    ),
                                );
                            }
                        }
                    }
                    ChangeValue::Reference(RelationRef::None) => {
                        if !prop.nullable {
                            errors.add_required(context_of(arena, cs), prop.name.clone());
                        }
                    }
                    ChangeValue::Reference(_) => {}
                }
            }
        }
    }

    errors.into_result().map_err(|e| {
        tracing::debug!(failures = e.len(), "Flush validation failed");
        Error::Validation(e)
    })
}

/// A create must not claim an identity held by another instance.
fn check_identities(
    arena: &EntityArena,
    identity: &IdentityMap,
    change_sets: &[ChangeSet],
) -> Result<()> {
    let mut claimed = HashMap::new();
    for cs in change_sets.iter().filter(|cs| cs.kind == ChangeKind::Create) {
        let Some(key) = arena.key_of(cs.entity) else {
            continue;
        };
        let type_id = cs.descriptor.id();
        let taken_by_other = identity
            .get(type_id, &key)
            .is_some_and(|existing| existing != cs.entity);
        let claimed_twice = claimed
            .insert(EntityKey::new(type_id, &key), cs.entity)
            .is_some();
        if taken_by_other || claimed_twice {
            return Err(Error::DuplicateIdentity(DuplicateIdentityError {
                entity_type: cs.entity_type().to_string(),
                primary_key: key,
            }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ManagedEntity, Slot};
    use flushwork_core::{EntityDescriptor, MetadataRegistry, PropertyInfo, SqlType, Value};
    use std::sync::Arc;

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityDescriptor::new("Hero", "heroes")
                    .property(PropertyInfo::scalar("id", SqlType::BigInt).primary_key(true))
                    .property(PropertyInfo::scalar("name", SqlType::VarChar(5)))
                    .property(PropertyInfo::scalar("age", SqlType::Integer).nullable(true)),
            )
            .build()
            .unwrap()
    }

    fn new_hero(arena: &mut EntityArena, reg: &MetadataRegistry, id: i64, name: Value) -> crate::EntityHandle {
        let mut e = ManagedEntity::new(Arc::clone(reg.get("Hero").unwrap()));
        e.slots[0] = Slot::Scalar(Value::BigInt(id));
        e.slots[1] = Slot::Scalar(name);
        e.state = EntityState::New;
        arena.insert(e)
    }

    #[test]
    fn test_flush_state_flags() {
        assert!(FlushState::Idle.is_idle());
        assert!(FlushState::Executing.has_open_transaction());
        assert!(!FlushState::Computing.has_open_transaction());
    }

    #[test]
    fn test_request_flush_only_while_flushing() {
        let mut uow = UnitOfWork::new();
        assert!(!uow.request_flush());
        uow.enter();
        assert!(uow.request_flush());
        assert!(uow.request_flush());
        assert_eq!(uow.take_deferred(), 2);
        assert_eq!(uow.take_deferred(), 0);
        uow.leave();
        assert!(!uow.is_abandoned());
    }

    #[test]
    fn test_abandoned_detection() {
        let mut uow = UnitOfWork::new();
        uow.enter();
        uow.transition(FlushState::Executing);
        assert!(uow.is_abandoned());
        uow.reset();
        assert!(!uow.is_abandoned());
    }

    #[test]
    fn test_pending_counts() {
        let counts = PendingCounts {
            new: 3,
            dirty: 2,
            deleted: 1,
        };
        assert_eq!(counts.total(), 6);
        assert!(!counts.is_empty());
        assert!(PendingCounts::default().is_empty());
    }

    #[test]
    fn test_prepare_reports_required_and_type_errors() {
        let reg = registry();
        let mut arena = EntityArena::default();
        new_hero(&mut arena, &reg, 1, Value::Null);
        new_hero(&mut arena, &reg, 2, Value::from("far too long"));

        let err = prepare(&mut arena, &IdentityMap::new(), &SessionConfig::default()).unwrap_err();
        let Error::Validation(v) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(v.has_kind(ValidationErrorKind::Required));
        assert!(v.has_kind(ValidationErrorKind::Type));
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn test_prepare_skips_checks_when_disabled() {
        let reg = registry();
        let mut arena = EntityArena::default();
        new_hero(&mut arena, &reg, 1, Value::Null);
        let config = SessionConfig::default().with_validate_before_flush(false);
        let change_sets = prepare(&mut arena, &IdentityMap::new(), &config).unwrap();
        assert_eq!(change_sets.len(), 1);
    }

    #[test]
    fn test_duplicate_new_keys_rejected() {
        let reg = registry();
        let mut arena = EntityArena::default();
        new_hero(&mut arena, &reg, 1, Value::from("a"));
        new_hero(&mut arena, &reg, 1, Value::from("b"));
        let err = prepare(&mut arena, &IdentityMap::new(), &SessionConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity(_)));
    }
}
