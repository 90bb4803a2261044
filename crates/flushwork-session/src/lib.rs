//! Session and Unit of Work for flushwork.
//!
//! `flushwork-session` is the **unit-of-work layer**. A [`Session`] owns an
//! arena of entities, an identity map and a snapshot per managed entity, and
//! turns the difference between in-memory state and the last persisted
//! state into ordered, batched statements on [`Session::flush`].
//!
//! # Flush pipeline
//!
//! 1. `before_flush` hooks
//! 2. cascades (persist, orphan removal, remove) and validation
//! 3. change sets computed against snapshots
//! 4. instance-level dependency ordering, cycles broken through nullable FKs
//! 5. batches executed in one store transaction
//! 6. on commit: generated keys, versions, identities and snapshots updated
//! 7. `after_flush` hooks, then any flush they requested
//!
//! A failure at any step rolls back and restores every entity state the
//! flush changed. Nothing about an entity is updated until commit.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(store, Arc::new(registry));
//!
//! let team = session.instantiate("Team")?;
//! session.set(team, "name", "Avengers")?;
//! let hero = session.instantiate("Hero")?;
//! session.set_reference(hero, "team", RelationRef::Entity(team))?;
//! session.persist(hero)?; // team follows through cascade persist
//!
//! session.flush(&cx).await?;
//! ```

pub(crate) mod cascade;
pub mod change_tracker;
pub mod entity;
pub mod flush;
pub mod graph;
pub mod identity_map;
pub mod persister;
pub mod unit_of_work;

pub use change_tracker::{ChangeSet, ChangeValue, EntitySnapshot, PropertyChange};
pub use entity::{EntityHandle, EntityState, RelationRef};
pub use flush::{DeferredForeignKey, FlushOrderer, FlushPlan, FlushResult};
pub use graph::{DependencyGraph, Edge};
pub use identity_map::{EntityKey, IdentityMap};
pub use persister::{BatchPersister, PersisterOptions};
pub use unit_of_work::{FlushState, PendingCounts, UnitOfWork};

use asupersync::{Cx, Outcome};
use change_tracker::SnapshotValue;
use entity::{EntityArena, ManagedEntity, Slot, TentativeKeys};
use flushwork_core::{
    Dialect, DuplicateIdentityError, EntityContext, EntityDescriptor, Error, MetadataRegistry,
    Result, Row, Store, TransactionError, TransactionErrorKind, ValidationError,
    ValidationErrorKind, Value,
};
use persister::PendingWrites;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive the session and return `Result<(), Error>`. A
/// `before_flush` callback returning `Err` aborts the flush before anything
/// is computed.
type SessionEventFn<S> = Box<dyn FnMut(&mut Session<S>) -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
pub struct SessionEventCallbacks<S: Store> {
    before_flush: Vec<SessionEventFn<S>>,
    after_flush: Vec<SessionEventFn<S>>,
    after_rollback: Vec<SessionEventFn<S>>,
}

impl<S: Store> Default for SessionEventCallbacks<S> {
    fn default() -> Self {
        Self {
            before_flush: Vec::new(),
            after_flush: Vec::new(),
            after_rollback: Vec::new(),
        }
    }
}

impl<S: Store> std::fmt::Debug for SessionEventCallbacks<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl<S: Store> SessionEventCallbacks<S> {
    fn slot(&mut self, event: SessionEvent) -> &mut Vec<SessionEventFn<S>> {
        match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        }
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before a flush computes its change sets.
    BeforeFlush,
    /// Fired after a flush commits.
    AfterFlush,
    /// Fired after a failed flush has been rolled back.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Dialect override; the store's own dialect is used when unset.
    pub dialect: Option<Dialect>,
    /// Upper bound on rows per statement batch.
    pub max_batch_rows: usize,
    /// How many flushes requested from flush hooks may run after the outer one.
    pub max_deferred_flushes: usize,
    /// Check required properties and column types before touching the store.
    pub validate_before_flush: bool,
    /// Any UPDATE or DELETE affecting the wrong number of rows fails the
    /// flush, versioned or not.
    pub strict_row_counts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dialect: None,
            max_batch_rows: 500,
            max_deferred_flushes: 8,
            validate_before_flush: true,
            strict_row_counts: true,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Custom(format!("invalid session configuration: {e}")))
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }

    pub fn with_max_batch_rows(mut self, rows: usize) -> Self {
        self.max_batch_rows = rows.max(1);
        self
    }

    pub fn with_max_deferred_flushes(mut self, flushes: usize) -> Self {
        self.max_deferred_flushes = flushes;
        self
    }

    pub fn with_validate_before_flush(mut self, value: bool) -> Self {
        self.validate_before_flush = value;
        self
    }

    pub fn with_strict_row_counts(mut self, value: bool) -> Self {
        self.strict_row_counts = value;
        self
    }
}

/// A property value read from a store row.
enum Loaded {
    Scalar(Value),
    ForeignKey(Option<Vec<Value>>),
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It owns every entity it tracks. Entities are addressed through
/// [`EntityHandle`]s and read or written by property name.
pub struct Session<S: Store> {
    store: S,
    registry: Arc<MetadataRegistry>,
    config: SessionConfig,
    arena: EntityArena,
    identity_map: IdentityMap,
    /// Loaded references whose target row is not in the session yet.
    unresolved: HashMap<EntityKey, Vec<(EntityHandle, usize)>>,
    unit_of_work: UnitOfWork,
    event_callbacks: SessionEventCallbacks<S>,
}

impl<S: Store> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("entities", &self.arena.len())
            .field("identity_map", &self.identity_map.len())
            .field("unit_of_work", &self.unit_of_work)
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Session<S> {
    /// Create a new session over `store` for the entity types in `registry`.
    pub fn new(store: S, registry: Arc<MetadataRegistry>) -> Self {
        Self::with_config(store, registry, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(store: S, registry: Arc<MetadataRegistry>, config: SessionConfig) -> Self {
        Self {
            store,
            registry,
            config,
            arena: EntityArena::default(),
            identity_map: IdentityMap::new(),
            unresolved: HashMap::new(),
            unit_of_work: UnitOfWork::new(),
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Dialect statements are rendered in.
    pub fn dialect(&self) -> Dialect {
        self.config.dialect.unwrap_or_else(|| self.store.dialect())
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.unit_of_work
    }

    pub fn flush_state(&self) -> FlushState {
        self.unit_of_work.state()
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before each flush.
    ///
    /// The callback may modify the session; its changes are part of the
    /// flush. Returning `Err` aborts the flush.
    pub fn on_before_flush(
        &mut self,
        f: impl FnMut(&mut Session<S>) -> Result<()> + Send + 'static,
    ) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after each committed flush.
    ///
    /// Changes made here are written by the next flush, or by a deferred
    /// flush if the callback calls [`request_flush`](Self::request_flush).
    pub fn on_after_flush(
        &mut self,
        f: impl FnMut(&mut Session<S>) -> Result<()> + Send + 'static,
    ) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run after a failed flush was rolled back.
    pub fn on_after_rollback(
        &mut self,
        f: impl FnMut(&mut Session<S>) -> Result<()> + Send + 'static,
    ) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let mut callbacks = std::mem::take(self.event_callbacks.slot(event));
        let mut result = Ok(());
        for cb in &mut callbacks {
            if let Err(e) = cb(self) {
                result = Err(e);
                break;
            }
        }
        // Keep callbacks registered while firing, after the existing ones.
        let slot = self.event_callbacks.slot(event);
        callbacks.append(slot);
        *slot = callbacks;
        result
    }

    // ========================================================================
    // Entity Lifecycle
    // ========================================================================

    /// Create a transient entity of `entity_type`. It is not scheduled for
    /// persistence until [`persist`](Self::persist) or a persist cascade
    /// reaches it.
    pub fn instantiate(&mut self, entity_type: &str) -> Result<EntityHandle> {
        let descriptor = Arc::clone(self.registry.descriptor(entity_type)?);
        Ok(self.arena.insert(ManagedEntity::new(descriptor)))
    }

    /// Schedule an entity for insertion, or cancel a pending removal.
    ///
    /// Entities with a known primary key claim their identity immediately.
    pub fn persist(&mut self, handle: EntityHandle) -> Result<()> {
        self.arena.check(handle)?;
        match self.arena.get(handle).state {
            EntityState::Transient => {
                if let Some(key) = self.arena.key_of(handle) {
                    let descriptor = Arc::clone(&self.arena.get(handle).descriptor);
                    self.identity_map.register(&descriptor, &key, handle)?;
                    self.arena.get_mut(handle).identity = Some(key);
                }
                self.arena.get_mut(handle).state = EntityState::New;
                tracing::debug!(entity = %self.arena.describe(handle), "Persist");
            }
            EntityState::Removed => {
                self.arena.get_mut(handle).state = EntityState::Managed;
                tracing::debug!(entity = %self.arena.describe(handle), "Removal cancelled");
            }
            EntityState::New | EntityState::Managed => {}
            EntityState::Detached => return Err(detached(&self.arena, handle)),
        }
        Ok(())
    }

    /// Schedule an entity for deletion. A new entity simply stops being
    /// scheduled for insertion.
    pub fn remove(&mut self, handle: EntityHandle) -> Result<()> {
        self.arena.check(handle)?;
        match self.arena.get(handle).state {
            EntityState::Managed => {
                self.arena.get_mut(handle).state = EntityState::Removed;
                tracing::debug!(entity = %self.arena.describe(handle), "Remove");
            }
            EntityState::New => {
                self.forget_identity(handle);
                self.arena.get_mut(handle).state = EntityState::Transient;
                tracing::debug!(entity = %self.arena.describe(handle), "Insert cancelled");
            }
            EntityState::Removed | EntityState::Transient => {}
            EntityState::Detached => return Err(detached(&self.arena, handle)),
        }
        Ok(())
    }

    /// Stop tracking an entity. Its pending changes are discarded.
    pub fn detach(&mut self, handle: EntityHandle) -> Result<()> {
        if self.arena.is_released(handle) {
            return Ok(());
        }
        self.arena.check(handle)?;
        if self.arena.get(handle).state == EntityState::Detached {
            return Ok(());
        }
        self.forget_identity(handle);
        self.release(handle);
        tracing::debug!(handle = %handle, "Detached entity");
        Ok(())
    }

    /// Register a row loaded from the store.
    ///
    /// If the identity is already managed, the row is merged into the
    /// existing instance: properties without local modifications take the
    /// loaded values, locally modified ones keep theirs, and the snapshot is
    /// refreshed (the version only while the entity has no local changes).
    /// Loaded references are resolved against the identity map, now and as
    /// their targets are loaded later.
    #[tracing::instrument(level = "debug", skip(self, row))]
    pub fn hydrate(&mut self, entity_type: &str, row: &Row) -> Result<EntityHandle> {
        let descriptor = Arc::clone(self.registry.descriptor(entity_type)?);
        let loaded = read_row(&descriptor, row);
        let key = loaded_key(&descriptor, &loaded)?;

        if let Some(existing) = self.identity_map.get(descriptor.id(), &key) {
            if self.arena.get(existing).state == EntityState::New {
                return Err(Error::DuplicateIdentity(DuplicateIdentityError {
                    entity_type: descriptor.name().to_string(),
                    primary_key: key,
                }));
            }
            self.merge_loaded(existing, &loaded);
            return Ok(existing);
        }

        let mut entity = ManagedEntity::new(Arc::clone(&descriptor));
        entity.state = EntityState::Managed;
        entity.identity = Some(key.clone());
        for (i, value) in loaded.iter().enumerate() {
            match value {
                Some(Loaded::Scalar(v)) => entity.slots[i] = Slot::Scalar(v.clone()),
                Some(Loaded::ForeignKey(Some(k))) => {
                    entity.slots[i] = Slot::Reference(RelationRef::Key(k.clone()));
                }
                Some(Loaded::ForeignKey(None)) | None => {}
            }
        }
        let handle = self.arena.insert(entity);
        self.identity_map.register(&descriptor, &key, handle)?;

        for i in 0..descriptor.properties().len() {
            self.link_loaded(handle, i);
        }
        if let Some(waiting) = self.unresolved.remove(&EntityKey::new(descriptor.id(), &key)) {
            let wanted = EntityKey::new(descriptor.id(), &key);
            for (holder, i) in waiting {
                if !self.arena.contains(holder)
                    || self.arena.get(holder).state == EntityState::Detached
                {
                    continue;
                }
                let still_pointing = matches!(
                    self.arena.get(holder).reference(i),
                    RelationRef::Key(k) if EntityKey::new(descriptor.id(), k) == wanted
                );
                if still_pointing {
                    self.arena.get_mut(holder).slots[i] =
                        Slot::Reference(RelationRef::Entity(handle));
                    self.link_inverse(holder, i, true);
                }
            }
        }

        let snapshot = EntitySnapshot::capture(&self.arena, handle);
        self.arena.get_mut(handle).snapshot = Some(snapshot);
        tracing::debug!(entity = %self.arena.describe(handle), "Hydrated entity");
        Ok(handle)
    }

    fn merge_loaded(&mut self, handle: EntityHandle, loaded: &[Option<Loaded>]) {
        let descriptor = Arc::clone(&self.arena.get(handle).descriptor);
        let modified: HashSet<usize> = change_tracker::diff(&self.arena, handle)
            .into_iter()
            .map(|c| c.index)
            .collect();
        let dirty = !modified.is_empty();

        for (i, value) in loaded.iter().enumerate() {
            let Some(value) = value else {
                continue;
            };
            let prop = descriptor.property_at(i);
            match value {
                Loaded::Scalar(v) => {
                    if prop.version && dirty {
                        continue;
                    }
                    let entity = self.arena.get_mut(handle);
                    if !modified.contains(&i) {
                        entity.slots[i] = Slot::Scalar(v.clone());
                    }
                    if let Some(snapshot) = &mut entity.snapshot {
                        snapshot.set(i, SnapshotValue::Scalar(v.clone()));
                    }
                }
                Loaded::ForeignKey(fk) => {
                    let loaded_fk = SnapshotValue::ForeignKey(fk.clone());
                    if !modified.contains(&i) {
                        let current = self
                            .arena
                            .foreign_key(self.arena.get(handle).reference(i), &TentativeKeys::new());
                        if !change_tracker::fk_matches(&current, &loaded_fk) {
                            self.unlink_inverse(handle, i, true);
                            self.arena.get_mut(handle).slots[i] = Slot::Reference(match fk {
                                Some(k) => RelationRef::Key(k.clone()),
                                None => RelationRef::None,
                            });
                            self.link_loaded(handle, i);
                        }
                    }
                    if let Some(snapshot) = &mut self.arena.get_mut(handle).snapshot {
                        snapshot.set(i, loaded_fk);
                    }
                }
            }
        }
        tracing::debug!(
            entity = %self.arena.describe(handle),
            kept_local = modified.len(),
            "Merged loaded row into managed entity"
        );
    }

    /// Resolve a loaded `Key` reference to a managed entity, or remember it
    /// until the target is loaded.
    fn link_loaded(&mut self, holder: EntityHandle, index: usize) {
        let RelationRef::Key(key) = self.arena.get(holder).reference(index).clone() else {
            return;
        };
        let descriptor = Arc::clone(&self.arena.get(holder).descriptor);
        let Some(target_id) = descriptor
            .property_at(index)
            .target()
            .and_then(|t| self.registry.get(t))
            .map(|d| d.id())
        else {
            return;
        };
        match self.identity_map.get(target_id, &key) {
            Some(target) => {
                self.arena.get_mut(holder).slots[index] =
                    Slot::Reference(RelationRef::Entity(target));
                self.link_inverse(holder, index, true);
            }
            None => {
                self.unresolved
                    .entry(EntityKey::new(target_id, &key))
                    .or_default()
                    .push((holder, index));
            }
        }
    }

    /// Indices of the collections on `target` mirroring `holder`'s to-one
    /// property `index`.
    fn inverse_collections(&self, holder: EntityHandle, index: usize, target: EntityHandle) -> Vec<usize> {
        let holder_entity = self.arena.get(holder);
        let property = &holder_entity.descriptor.property_at(index).name;
        let holder_type = holder_entity.type_name();
        self.arena
            .get(target)
            .descriptor
            .properties()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_collection())
            .filter(|(_, p)| {
                p.relationship.as_ref().is_some_and(|r| {
                    r.target == holder_type && r.mapped_by.as_deref() == Some(property.as_str())
                })
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Add `holder` to the inverse collections of its reference target.
    /// `loaded` also records the membership in the target's snapshot.
    fn link_inverse(&mut self, holder: EntityHandle, index: usize, loaded: bool) {
        let Some(target) = self.arena.get(holder).reference(index).handle() else {
            return;
        };
        for c in self.inverse_collections(holder, index, target) {
            let entity = self.arena.get_mut(target);
            if let Slot::Collection(members) = &mut entity.slots[c] {
                if !members.contains(&holder) {
                    members.push(holder);
                }
            }
            if loaded {
                if let Some(snapshot) = &mut entity.snapshot {
                    let mut members = snapshot.members(c).to_vec();
                    if !members.contains(&holder) {
                        members.push(holder);
                        snapshot.set(c, SnapshotValue::Members(members));
                    }
                }
            }
        }
    }

    /// Remove `holder` from the inverse collections of its current target.
    fn unlink_inverse(&mut self, holder: EntityHandle, index: usize, loaded: bool) {
        let Some(target) = self.arena.get(holder).reference(index).handle() else {
            return;
        };
        for c in self.inverse_collections(holder, index, target) {
            let entity = self.arena.get_mut(target);
            if let Slot::Collection(members) = &mut entity.slots[c] {
                members.retain(|m| *m != holder);
            }
            if loaded {
                if let Some(snapshot) = &mut entity.snapshot {
                    let members: Vec<EntityHandle> = snapshot
                        .members(c)
                        .iter()
                        .copied()
                        .filter(|m| *m != holder)
                        .collect();
                    snapshot.set(c, SnapshotValue::Members(members));
                }
            }
        }
    }

    /// Point `holder`'s to-one property at `target`, keeping inverse
    /// collections in sync.
    fn relink(&mut self, holder: EntityHandle, index: usize, target: RelationRef) {
        self.unlink_inverse(holder, index, false);
        self.arena.get_mut(holder).slots[index] = Slot::Reference(target);
        self.link_inverse(holder, index, false);
    }

    fn forget_identity(&mut self, handle: EntityHandle) {
        let entity = self.arena.get_mut(handle);
        if let Some(key) = entity.identity.take() {
            self.identity_map.remove(entity.descriptor.id(), &key);
        }
    }

    /// Look up the managed instance of `entity_type` with primary key `key`.
    pub fn get(&self, entity_type: &str, key: &[Value]) -> Option<EntityHandle> {
        let descriptor = self.registry.get(entity_type)?;
        self.identity_map.get(descriptor.id(), key)
    }

    pub fn state(&self, handle: EntityHandle) -> Result<EntityState> {
        if self.arena.is_released(handle) {
            return Ok(EntityState::Detached);
        }
        self.arena.check(handle)?;
        Ok(self.arena.get(handle).state)
    }

    /// Entity type name of `handle`.
    pub fn entity_type(&self, handle: EntityHandle) -> Result<&str> {
        self.arena.check(handle)?;
        Ok(self.arena.get(handle).type_name())
    }

    /// Current primary key, if every part of it is known.
    pub fn primary_key(&self, handle: EntityHandle) -> Option<Vec<Value>> {
        if !self.arena.contains(handle) {
            return None;
        }
        self.arena.key_of(handle)
    }

    // ========================================================================
    // Property Access
    // ========================================================================

    fn resolve(&self, handle: EntityHandle, property: &str) -> Result<(Arc<EntityDescriptor>, usize)> {
        self.arena.check(handle)?;
        let descriptor = Arc::clone(&self.arena.get(handle).descriptor);
        match descriptor.property_index(property) {
            Some(index) => Ok((descriptor, index)),
            None => Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::UnknownProperty,
                "is not declared",
            )),
        }
    }

    /// Set a scalar property.
    pub fn set(&mut self, handle: EntityHandle, property: &str, value: impl Into<Value>) -> Result<()> {
        let (descriptor, index) = self.resolve(handle, property)?;
        let prop = descriptor.property_at(index);
        if prop.is_relationship() {
            return Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::Type,
                "is a relationship",
            ));
        }
        if prop.version {
            return Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::Custom,
                "is the version property and is maintained by the session",
            ));
        }
        let value = value.into();
        if prop.primary_key {
            let unchanged = self.arena.get(handle).scalar(index) == &value;
            self.check_key_change(handle, &descriptor, property, unchanged)?;
        }
        self.arena.get_mut(handle).slots[index] = Slot::Scalar(value);
        Ok(())
    }

    /// Read a scalar property.
    pub fn value(&self, handle: EntityHandle, property: &str) -> Result<&Value> {
        let (descriptor, index) = self.resolve(handle, property)?;
        if descriptor.property_at(index).is_relationship() {
            return Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::Type,
                "is a relationship",
            ));
        }
        Ok(self.arena.get(handle).scalar(index))
    }

    /// Set a to-one relationship. Inverse collections follow.
    pub fn set_reference(
        &mut self,
        handle: EntityHandle,
        property: &str,
        target: RelationRef,
    ) -> Result<()> {
        let (descriptor, index) = self.resolve(handle, property)?;
        let prop = descriptor.property_at(index);
        let Some(rel) = prop.relationship.as_ref().filter(|_| prop.is_to_one()) else {
            return Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::Type,
                "is not a to-one relationship",
            ));
        };
        match &target {
            RelationRef::Entity(t) => {
                self.arena.check(*t)?;
                let actual = self.arena.get(*t).type_name();
                if actual != rel.target {
                    return Err(property_error(
                        &descriptor,
                        property,
                        ValidationErrorKind::Type,
                        &format!("expects {}, got {actual}", rel.target),
                    ));
                }
            }
            RelationRef::Key(key) => {
                let width = self.registry.descriptor(&rel.target)?.key_columns().len();
                if key.len() != width {
                    return Err(property_error(
                        &descriptor,
                        property,
                        ValidationErrorKind::Type,
                        &format!("expects a {width}-column key of {}", rel.target),
                    ));
                }
            }
            RelationRef::None => {}
        }
        if prop.primary_key {
            let unchanged = self.same_foreign_key(self.arena.get(handle).reference(index), &target);
            self.check_key_change(handle, &descriptor, property, unchanged)?;
        }
        self.relink(handle, index, target);
        Ok(())
    }

    /// Read a to-one relationship.
    pub fn reference(&self, handle: EntityHandle, property: &str) -> Result<&RelationRef> {
        let (descriptor, index) = self.resolve(handle, property)?;
        if !descriptor.property_at(index).is_to_one() {
            return Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::Type,
                "is not a to-one relationship",
            ));
        }
        Ok(self.arena.get(handle).reference(index))
    }

    /// Members of a collection.
    pub fn collection(&self, handle: EntityHandle, property: &str) -> Result<&[EntityHandle]> {
        let (descriptor, index) = self.resolve(handle, property)?;
        if !descriptor.property_at(index).is_collection() {
            return Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::Type,
                "is not a collection",
            ));
        }
        Ok(self.arena.get(handle).members(index))
    }

    /// Add `member` to a collection and point its owning reference at `owner`.
    pub fn add_to_collection(
        &mut self,
        owner: EntityHandle,
        property: &str,
        member: EntityHandle,
    ) -> Result<()> {
        let (descriptor, index, mapped_by) = self.collection_property(owner, property, member)?;
        if let Slot::Collection(members) = &mut self.arena.get_mut(owner).slots[index] {
            if !members.contains(&member) {
                members.push(member);
            }
        }
        let member_desc = Arc::clone(&self.arena.get(member).descriptor);
        if let Some(back) = mapped_by.and_then(|m| member_desc.property_index(&m)) {
            let target = RelationRef::Entity(owner);
            if self.arena.get(member).reference(back) != &target {
                let back_prop = member_desc.property_at(back);
                if back_prop.primary_key {
                    let unchanged =
                        self.same_foreign_key(self.arena.get(member).reference(back), &target);
                    self.check_key_change(member, &member_desc, &back_prop.name, unchanged)?;
                }
                self.relink(member, back, target);
            }
        }
        tracing::trace!(owner = %owner, collection = %descriptor.property_at(index).name, member = %member, "Collection add");
        Ok(())
    }

    /// Remove `member` from a collection.
    ///
    /// With orphan removal the member is deleted on flush unless something
    /// else holds it; otherwise its owning reference is cleared.
    pub fn remove_from_collection(
        &mut self,
        owner: EntityHandle,
        property: &str,
        member: EntityHandle,
    ) -> Result<()> {
        let (descriptor, index, mapped_by) = self.collection_property(owner, property, member)?;
        let removed = match &mut self.arena.get_mut(owner).slots[index] {
            Slot::Collection(members) => {
                let before = members.len();
                members.retain(|m| *m != member);
                members.len() != before
            }
            _ => false,
        };
        if !removed {
            return Ok(());
        }
        let orphan_removal = descriptor.property_at(index).cascade_flags().orphan_removal;
        let member_desc = Arc::clone(&self.arena.get(member).descriptor);
        if let Some(back) = mapped_by.and_then(|m| member_desc.property_index(&m)) {
            let points_here = self.arena.get(member).reference(back) == &RelationRef::Entity(owner);
            if points_here && !orphan_removal && !member_desc.property_at(back).primary_key {
                self.arena.get_mut(member).slots[back] = Slot::Reference(RelationRef::None);
            }
        }
        Ok(())
    }

    /// Validate a collection operation; returns the owner descriptor, the
    /// collection index and its `mapped_by`.
    fn collection_property(
        &self,
        owner: EntityHandle,
        property: &str,
        member: EntityHandle,
    ) -> Result<(Arc<EntityDescriptor>, usize, Option<String>)> {
        let (descriptor, index) = self.resolve(owner, property)?;
        let prop = descriptor.property_at(index);
        let Some(rel) = prop.relationship.as_ref().filter(|_| prop.is_collection()) else {
            return Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::Type,
                "is not a collection",
            ));
        };
        self.arena.check(member)?;
        let actual = self.arena.get(member).type_name();
        if actual != rel.target {
            return Err(property_error(
                &descriptor,
                property,
                ValidationErrorKind::Type,
                &format!("holds {}, got {actual}", rel.target),
            ));
        }
        let mapped_by = rel.mapped_by.clone();
        Ok((descriptor, index, mapped_by))
    }

    fn same_foreign_key(&self, current: &RelationRef, target: &RelationRef) -> bool {
        let tentative = TentativeKeys::new();
        let wanted = match self.arena.foreign_key(target, &tentative) {
            entity::ForeignKey::Known(values) => SnapshotValue::ForeignKey(Some(values)),
            entity::ForeignKey::Null => SnapshotValue::ForeignKey(None),
            entity::ForeignKey::Pending(_) => return current == target,
        };
        change_tracker::fk_matches(&self.arena.foreign_key(current, &tentative), &wanted)
    }

    /// Primary keys of persistent entities are immutable. A new entity may
    /// change its key, giving up the identity it claimed on persist.
    fn check_key_change(
        &mut self,
        handle: EntityHandle,
        descriptor: &EntityDescriptor,
        property: &str,
        unchanged: bool,
    ) -> Result<()> {
        match self.arena.get(handle).state {
            EntityState::Managed | EntityState::Removed => {
                if unchanged {
                    Ok(())
                } else {
                    Err(property_error(
                        descriptor,
                        property,
                        ValidationErrorKind::Custom,
                        "is part of the primary key of a persistent entity",
                    ))
                }
            }
            EntityState::New => {
                if !unchanged {
                    self.forget_identity(handle);
                }
                Ok(())
            }
            EntityState::Transient | EntityState::Detached => Ok(()),
        }
    }

    // ========================================================================
    // Change Inspection
    // ========================================================================

    /// Change sets as they stand now, before cascades run.
    pub fn compute_change_sets(&self) -> Vec<ChangeSet> {
        self.arena
            .handles()
            .filter_map(|h| change_tracker::compute(&self.arena, h))
            .collect()
    }

    /// Does the entity have anything to write?
    pub fn is_modified(&self, handle: EntityHandle) -> bool {
        if !self.arena.contains(handle) {
            return false;
        }
        match self.arena.get(handle).state {
            EntityState::New | EntityState::Removed => true,
            EntityState::Managed => {
                !change_tracker::diff(&self.arena, handle).is_empty()
                    || change_tracker::membership_changed(&self.arena, handle)
            }
            EntityState::Transient | EntityState::Detached => false,
        }
    }

    /// Names of properties changed since the last snapshot.
    pub fn modified_properties(&self, handle: EntityHandle) -> Vec<String> {
        if !self.arena.contains(handle) || self.arena.get(handle).state != EntityState::Managed {
            return Vec::new();
        }
        change_tracker::diff(&self.arena, handle)
            .into_iter()
            .map(|c| c.property)
            .collect()
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Ask for another flush once the running one commits. Only meaningful
    /// from flush callbacks; returns `false` when no flush is running.
    pub fn request_flush(&mut self) -> bool {
        let queued = self.unit_of_work.request_flush();
        if queued {
            tracing::debug!("Deferred flush requested");
        }
        queued
    }

    /// Write all pending changes in one transaction.
    ///
    /// On any failure the transaction is rolled back, entity states are
    /// restored to what they were before the call and the error is
    /// returned. Flushes requested by callbacks run afterwards, each in its
    /// own transaction.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if self.unit_of_work.is_abandoned() {
            match self.recover_abandoned(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.unit_of_work.enter();
        let mut total = FlushResult::default();
        let mut deferred_rounds = 0usize;
        loop {
            match self.flush_once(cx).await {
                Outcome::Ok(result) => total.absorb(result),
                Outcome::Err(e) => {
                    self.unit_of_work.leave();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.unit_of_work.leave();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.unit_of_work.leave();
                    return Outcome::Panicked(p);
                }
            }
            let requested = self.unit_of_work.take_deferred();
            if requested == 0 {
                break;
            }
            if deferred_rounds >= self.config.max_deferred_flushes {
                tracing::warn!(
                    limit = self.config.max_deferred_flushes,
                    dropped = requested,
                    "Deferred flush limit reached; remaining requests dropped"
                );
                total.dropped_flush_requests += requested;
                break;
            }
            deferred_rounds += 1;
            tracing::debug!(round = deferred_rounds, "Running deferred flush");
        }
        self.unit_of_work.leave();
        Outcome::Ok(total)
    }

    /// One flush transaction.
    async fn flush_once(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let saved = self.arena.states();
        self.unit_of_work.transition(FlushState::Computing);
        let change_sets =
            match unit_of_work::prepare(&mut self.arena, &self.identity_map, &self.config) {
                Ok(change_sets) => change_sets,
                Err(e) => {
                    self.abort_before_store(&saved);
                    return Outcome::Err(e);
                }
            };

        self.unit_of_work.transition(FlushState::Ordering);
        let ordered = FlushOrderer::new(&self.registry, &self.identity_map)
            .order(&self.arena, change_sets);
        let plan = match ordered {
            Ok(plan) => plan,
            Err(e) => {
                self.abort_before_store(&saved);
                return Outcome::Err(e);
            }
        };

        if plan.is_empty() {
            self.refresh_snapshots(&HashSet::new());
            self.unit_of_work.transition(FlushState::Idle);
            tracing::debug!("Nothing to flush");
            return match self.fire(SessionEvent::AfterFlush) {
                Ok(()) => Outcome::Ok(FlushResult::default()),
                Err(e) => Outcome::Err(e),
            };
        }

        if let Some(reason) = cx.cancel_reason() {
            self.abort_before_store(&saved);
            return Outcome::Cancelled(reason);
        }

        self.unit_of_work.save_states(saved);
        self.unit_of_work.transition(FlushState::Executing);
        match self.store.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.restore_saved_states();
                return Outcome::Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::Begin,
                    message: format!("failed to begin flush transaction: {e}"),
                }));
            }
            Outcome::Cancelled(r) => {
                self.restore_saved_states();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.restore_saved_states();
                return Outcome::Panicked(p);
            }
        }

        let options = PersisterOptions {
            dialect: self.dialect(),
            max_batch_rows: self.config.max_batch_rows,
            strict_row_counts: self.config.strict_row_counts,
        };
        let executed = BatchPersister::new(&self.store, options)
            .execute(cx, &self.arena, &plan)
            .await;
        let writes = match executed {
            Outcome::Ok(writes) => writes,
            Outcome::Err(e) => {
                self.rollback_flush(cx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.rollback_flush(cx).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.rollback_flush(cx).await;
                return Outcome::Panicked(p);
            }
        };

        self.unit_of_work.transition(FlushState::Committing);
        match self.store.commit(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.rollback_flush(cx).await;
                return Outcome::Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::Commit,
                    message: format!("failed to commit flush transaction: {e}"),
                }));
            }
            Outcome::Cancelled(r) => {
                self.rollback_flush(cx).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.rollback_flush(cx).await;
                return Outcome::Panicked(p);
            }
        }

        let mut result = writes.result;
        result.transactions = 1;
        result.identity_conflicts = self.apply_commit(&plan, writes);
        self.unit_of_work.committed();
        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            batches = result.batches,
            identity_conflicts = result.identity_conflicts,
            "Flush committed"
        );

        match self.fire(SessionEvent::AfterFlush) {
            Ok(()) => Outcome::Ok(result),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Failure before the store was touched.
    fn abort_before_store(&mut self, saved: &[EntityState]) {
        self.arena.restore_states(saved);
        self.unit_of_work.transition(FlushState::Idle);
    }

    fn restore_saved_states(&mut self) {
        if let Some(saved) = self.unit_of_work.take_saved_states() {
            self.arena.restore_states(&saved);
        }
        self.unit_of_work.transition(FlushState::Idle);
    }

    /// Roll the open transaction back and restore entity states.
    async fn rollback_flush(&mut self, cx: &Cx) {
        self.unit_of_work.transition(FlushState::RollingBack);
        match self.store.rollback(cx).await {
            Outcome::Ok(()) => tracing::debug!("Flush transaction rolled back"),
            Outcome::Err(e) => tracing::warn!(error = %e, "Rollback failed"),
            Outcome::Cancelled(r) => tracing::warn!(reason = ?r, "Rollback cancelled"),
            Outcome::Panicked(p) => tracing::warn!(panic = ?p, "Rollback panicked"),
        }
        self.restore_saved_states();
        if let Err(e) = self.fire(SessionEvent::AfterRollback) {
            tracing::warn!(error = %e, "after_rollback callback failed");
        }
    }

    /// A previous flush future was dropped mid-way: roll back whatever it
    /// left open and restore entity states.
    async fn recover_abandoned(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let state = self.unit_of_work.state();
        tracing::warn!(state = ?state, "Recovering from an abandoned flush");
        if state.has_open_transaction() {
            match self.store.rollback(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => tracing::warn!(error = %e, "Rollback of abandoned flush failed"),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        if let Some(saved) = self.unit_of_work.take_saved_states() {
            self.arena.restore_states(&saved);
        }
        self.unit_of_work.reset();
        Outcome::Ok(())
    }

    /// Make a committed flush visible on the entities.
    ///
    /// Returns how many inserted entities could not claim their identity.
    fn apply_commit(&mut self, plan: &FlushPlan, writes: PendingWrites) -> usize {
        for (handle, key) in &writes.keys {
            if let Some(gk) = self.arena.get(*handle).descriptor.generated_key() {
                self.arena.get_mut(*handle).slots[gk] = Slot::Scalar(key.clone());
            }
        }
        for (handle, version) in writes.versions {
            if let Some(vi) = self.arena.get(handle).descriptor.version_index() {
                self.arena.get_mut(handle).slots[vi] = Slot::Scalar(version);
            }
        }

        let mut conflicts = 0;
        for cs in plan.inserts() {
            self.arena.get_mut(cs.entity).state = EntityState::Managed;
            if !self.register_identity(cs.entity) {
                conflicts += 1;
            }
        }
        let deleted: Vec<EntityHandle> = plan.deletes().map(|cs| cs.entity).collect();
        for &handle in &deleted {
            self.evict(handle);
        }
        // New entities a remove cascade unscheduled give up their identity.
        let unscheduled: Vec<EntityHandle> = self
            .arena
            .iter()
            .filter(|(_, e)| e.state == EntityState::Transient && e.identity.is_some())
            .map(|(h, _)| h)
            .collect();
        for handle in unscheduled {
            self.forget_identity(handle);
        }

        let touched: HashSet<EntityHandle> = plan
            .inserts()
            .map(|cs| cs.entity)
            .chain(plan.updates.iter().map(|&i| plan.change_sets[i].entity))
            .chain(plan.cycle_fixups.iter().map(|f| f.entity))
            .collect();
        self.refresh_snapshots(&touched);
        conflicts
    }

    /// Re-snapshot `touched` entities and owners whose collections changed.
    fn refresh_snapshots(&mut self, touched: &HashSet<EntityHandle>) {
        let stale: Vec<EntityHandle> = self
            .arena
            .iter()
            .filter(|(_, e)| e.state == EntityState::Managed)
            .map(|(h, _)| h)
            .filter(|h| {
                touched.contains(h) || change_tracker::membership_changed(&self.arena, *h)
            })
            .collect();
        for handle in stale {
            let snapshot = EntitySnapshot::capture(&self.arena, handle);
            self.arena.get_mut(handle).snapshot = Some(snapshot);
        }
    }

    /// Claim the identity of a freshly inserted entity. False when another
    /// managed instance already holds the key.
    fn register_identity(&mut self, handle: EntityHandle) -> bool {
        let Some(key) = self.arena.key_of(handle) else {
            tracing::warn!(handle = %handle, "Inserted entity has no primary key");
            return true;
        };
        if self.arena.get(handle).identity.as_ref() == Some(&key) {
            return true;
        }
        self.forget_identity(handle);
        let descriptor = Arc::clone(&self.arena.get(handle).descriptor);
        match self.identity_map.register(&descriptor, &key, handle) {
            Ok(()) => {
                self.arena.get_mut(handle).identity = Some(key);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Inserted entity collides with a managed identity");
                false
            }
        }
    }

    /// A deleted row: out of the identity map and every collection, then
    /// released from the arena.
    fn evict(&mut self, handle: EntityHandle) {
        self.forget_identity(handle);
        self.release(handle);
    }

    /// Drop an entity from the arena.
    ///
    /// Collections lose it and references to it fall back to its key. When
    /// the key is unknown and something still points at it, the entry is
    /// kept as a detached instance.
    fn release(&mut self, handle: EntityHandle) {
        let key = self.arena.key_of(handle);
        let type_id = self.arena.get(handle).descriptor.id();
        let mut pinned = false;
        let mut rewritten = Vec::new();
        let others: Vec<EntityHandle> = self.arena.handles().filter(|h| *h != handle).collect();
        for other in others {
            let entity = self.arena.get_mut(other);
            for (i, slot) in entity.slots.iter_mut().enumerate() {
                match slot {
                    Slot::Collection(members) => members.retain(|m| *m != handle),
                    Slot::Reference(reference) if reference.handle() == Some(handle) => {
                        match &key {
                            Some(key) => {
                                *reference = RelationRef::Key(key.clone());
                                rewritten.push((other, i));
                            }
                            None => pinned = true,
                        }
                    }
                    Slot::Reference(_) | Slot::Scalar(_) => {}
                }
            }
            if let Some(snapshot) = &mut entity.snapshot {
                snapshot.remove_member(handle);
            }
        }
        self.unresolved.retain(|_, waiting| {
            waiting.retain(|(holder, _)| *holder != handle);
            !waiting.is_empty()
        });
        // Rewritten references relink when the row is loaded again.
        if let Some(key) = &key {
            if !rewritten.is_empty() {
                self.unresolved
                    .entry(EntityKey::new(type_id, key))
                    .or_default()
                    .extend(rewritten);
            }
        }

        if pinned {
            let entity = self.arena.get_mut(handle);
            entity.state = EntityState::Detached;
            entity.snapshot = None;
        } else {
            self.arena.remove(handle);
        }
    }

    /// Detach every entity and clear the identity map.
    ///
    /// Not allowed while a flush is running (from a flush callback).
    pub fn reset(&mut self) -> Result<()> {
        if self.unit_of_work.in_flush() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::FlushInProgress,
                message: "cannot reset the session while a flush is running".to_string(),
            }));
        }
        self.arena.clear();
        self.identity_map.clear();
        self.unresolved.clear();
        self.unit_of_work.reset();
        tracing::debug!("Session reset");
        Ok(())
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Pending operations as they stand now, before cascades run.
    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for (handle, entity) in self.arena.iter() {
            match entity.state {
                EntityState::New => counts.new += 1,
                EntityState::Removed => counts.deleted += 1,
                EntityState::Managed => {
                    if !change_tracker::diff(&self.arena, handle).is_empty() {
                        counts.dirty += 1;
                    }
                }
                EntityState::Transient | EntityState::Detached => {}
            }
        }
        counts
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let mut info = SessionDebugInfo {
            tracked: 0,
            transient: 0,
            new: 0,
            managed: 0,
            removed: 0,
            detached: 0,
            slots: self.arena.capacity(),
            identities: self.identity_map.len(),
            unresolved_references: self.unresolved.values().map(Vec::len).sum(),
            flush_state: self.unit_of_work.state(),
        };
        for (_, entity) in self.arena.iter() {
            match entity.state {
                EntityState::Transient => info.transient += 1,
                EntityState::New => info.new += 1,
                EntityState::Managed => info.managed += 1,
                EntityState::Removed => info.removed += 1,
                EntityState::Detached => info.detached += 1,
            }
        }
        info.tracked = info.new + info.managed + info.removed;
        info
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Entities the next flush will look at (new, managed, removed).
    pub tracked: usize,
    pub transient: usize,
    pub new: usize,
    pub managed: usize,
    pub removed: usize,
    /// Detached instances still held because a new entity points at them.
    pub detached: usize,
    /// Arena slots allocated, vacant ones included.
    pub slots: usize,
    /// Identity map entries.
    pub identities: usize,
    /// Loaded references waiting for their target row.
    pub unresolved_references: usize,
    pub flush_state: FlushState,
}

fn property_error(
    descriptor: &EntityDescriptor,
    property: &str,
    kind: ValidationErrorKind,
    reason: &str,
) -> Error {
    let mut errors = ValidationError::new();
    errors.add(
        Some(EntityContext::new(descriptor.name())),
        property,
        kind,
        format!("{}.{property} {reason}", descriptor.name()),
    );
    Error::Validation(errors)
}

fn detached(arena: &EntityArena, handle: EntityHandle) -> Error {
    Error::Custom(format!(
        "{} is detached from this session",
        arena.describe(handle)
    ))
}

/// Values of `row` per property; `None` where the row has no column for it.
fn read_row(descriptor: &EntityDescriptor, row: &Row) -> Vec<Option<Loaded>> {
    descriptor
        .properties()
        .iter()
        .map(|prop| {
            if prop.is_collection() {
                return None;
            }
            if prop.is_to_one() {
                let mut values = Vec::new();
                for column in prop.columns() {
                    values.push(row.get_by_name(column)?.clone());
                }
                // A partially NULL composite FK references nothing.
                if values.iter().any(Value::is_null) {
                    return Some(Loaded::ForeignKey(None));
                }
                return Some(Loaded::ForeignKey(Some(values)));
            }
            prop.column
                .as_deref()
                .and_then(|c| row.get_by_name(c))
                .map(|v| Loaded::Scalar(v.clone()))
        })
        .collect()
}

fn loaded_key(descriptor: &EntityDescriptor, loaded: &[Option<Loaded>]) -> Result<Vec<Value>> {
    let mut key = Vec::with_capacity(descriptor.key_columns().len());
    for &pk in descriptor.primary_key() {
        match &loaded[pk] {
            Some(Loaded::Scalar(v)) if !v.is_null() => key.push(v.clone()),
            Some(Loaded::ForeignKey(Some(values))) => key.extend(values.iter().cloned()),
            _ => {
                let mut errors = ValidationError::new();
                errors.add_required(
                    EntityContext::new(descriptor.name()),
                    descriptor.property_at(pk).name.clone(),
                );
                return Err(Error::Validation(errors));
            }
        }
    }
    Ok(key)
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use flushwork_core::{
        BatchResult, CascadeFlags, ChangeKind, PropertyInfo, SqlType, StatementBatch,
    };
    use std::future::Future;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct MockState {
        calls: Vec<String>,
        batches: Vec<StatementBatch>,
        next_id: i64,
        fail_on_batch: Option<usize>,
    }

    #[derive(Debug, Clone, Default)]
    struct MockStore {
        state: Arc<Mutex<MockState>>,
    }

    impl MockStore {
        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn batches(&self) -> Vec<StatementBatch> {
            self.state.lock().unwrap().batches.clone()
        }
    }

    impl Store for MockStore {
        fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            self.state.lock().unwrap().calls.push("begin".to_string());
            async { Outcome::Ok(()) }
        }

        fn execute_batch(
            &self,
            _cx: &Cx,
            batch: &StatementBatch,
        ) -> impl Future<Output = Outcome<BatchResult, Error>> + Send {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("{:?}:{}", batch.purpose, batch.entity_type));
            state.batches.push(batch.clone());
            let result = if state.fail_on_batch == Some(state.batches.len()) {
                Outcome::Err(Error::Store(flushwork_core::StoreError::constraint(
                    "23505",
                    "duplicate key value",
                )))
            } else {
                let mut result = BatchResult::affected(batch.rows.len() as u64);
                if !batch.returning.is_empty() {
                    for _ in &batch.rows {
                        state.next_id += 1;
                        result.generated_keys.push(vec![Value::BigInt(state.next_id)]);
                    }
                }
                Outcome::Ok(result)
            };
            async move { result }
        }

        fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            self.state.lock().unwrap().calls.push("commit".to_string());
            async { Outcome::Ok(()) }
        }

        fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            self.state.lock().unwrap().calls.push("rollback".to_string());
            async { Outcome::Ok(()) }
        }
    }

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn registry() -> Arc<MetadataRegistry> {
        Arc::new(
            MetadataRegistry::builder()
                .entity(
                    EntityDescriptor::new("Team", "teams")
                        .property(
                            PropertyInfo::scalar("id", SqlType::BigInt)
                                .primary_key(true)
                                .generated(true),
                        )
                        .property(PropertyInfo::scalar("name", SqlType::Text))
                        .property(
                            PropertyInfo::one_to_many("heroes", "Hero", "team")
                                .cascade(CascadeFlags::ALL.with_orphan_removal()),
                        ),
                )
                .entity(
                    EntityDescriptor::new("Hero", "heroes")
                        .property(
                            PropertyInfo::scalar("id", SqlType::BigInt)
                                .primary_key(true)
                                .generated(true),
                        )
                        .property(PropertyInfo::scalar("name", SqlType::Text))
                        .property(
                            PropertyInfo::many_to_one("team", "Team", &["team_id"])
                                .nullable(true)
                                .cascade(CascadeFlags::PERSIST),
                        ),
                )
                .build()
                .unwrap(),
        )
    }

    fn session() -> (Session<MockStore>, MockStore) {
        let store = MockStore::default();
        (Session::new(store.clone(), registry()), store)
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.dialect, None);
        assert_eq!(config.max_batch_rows, 500);
        assert!(config.validate_before_flush);
        assert!(config.strict_row_counts);
    }

    #[test]
    fn test_session_config_from_json() {
        let config =
            SessionConfig::from_json(r#"{"dialect": "sqlite", "max_batch_rows": 10}"#).unwrap();
        assert_eq!(config.dialect, Some(Dialect::Sqlite));
        assert_eq!(config.max_batch_rows, 10);
        assert_eq!(config.max_deferred_flushes, 8);
        assert!(SessionConfig::from_json("{\"max_batch_rows\": \"x\"}").is_err());
    }

    #[test]
    fn test_dialect_override() {
        let (session, _) = session();
        assert_eq!(session.dialect(), Dialect::Postgres);
        let session = Session::with_config(
            MockStore::default(),
            registry(),
            SessionConfig::default().with_dialect(Dialect::Mysql),
        );
        assert_eq!(session.dialect(), Dialect::Mysql);
    }

    #[test]
    fn test_unknown_property_rejected() {
        let (mut session, _) = session();
        let team = session.instantiate("Team").unwrap();
        let err = session.set(team, "motto", "x").unwrap_err();
        let Error::Validation(v) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(v.has_kind(ValidationErrorKind::UnknownProperty));
        assert!(session.instantiate("Villain").is_err());
    }

    #[test]
    fn test_flush_inserts_with_generated_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, store) = session();

        let team = session.instantiate("Team").unwrap();
        session.set(team, "name", "Avengers").unwrap();
        let hero = session.instantiate("Hero").unwrap();
        session.set(hero, "name", "Thor").unwrap();
        session.add_to_collection(team, "heroes", hero).unwrap();
        assert_eq!(session.reference(hero, "team").unwrap(), &RelationRef::Entity(team));
        session.persist(team).unwrap();

        rt.block_on(async {
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.inserted, 2);
            assert_eq!(result.transactions, 1);
        });

        assert_eq!(
            store.calls(),
            vec!["begin", "Insert:Team", "Insert:Hero", "commit"]
        );
        let batches = store.batches();
        assert_eq!(batches[1].rows[0].values, vec![Value::from("Thor"), Value::BigInt(1)]);
        assert_eq!(session.value(team, "id").unwrap(), &Value::BigInt(1));
        assert_eq!(session.value(hero, "id").unwrap(), &Value::BigInt(2));
        assert_eq!(session.state(hero).unwrap(), EntityState::Managed);
        assert_eq!(session.get("Hero", &[Value::BigInt(2)]), Some(hero));
        assert!(!session.is_modified(team));
    }

    #[test]
    fn test_empty_flush_touches_nothing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, store) = session();
        rt.block_on(async {
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result, FlushResult::default());
        });
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_failed_batch_rolls_back_and_restores_states() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, store) = session();
        store.state.lock().unwrap().fail_on_batch = Some(2);

        let team = session.instantiate("Team").unwrap();
        session.set(team, "name", "Avengers").unwrap();
        let hero = session.instantiate("Hero").unwrap();
        session.set(hero, "name", "Thor").unwrap();
        session.add_to_collection(team, "heroes", hero).unwrap();
        session.persist(team).unwrap();

        let rollbacks = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&rollbacks);
        session.on_after_rollback(move |_| {
            *seen.lock().unwrap() += 1;
            Ok(())
        });

        rt.block_on(async {
            match session.flush(&cx).await {
                Outcome::Err(Error::ConstraintViolation(e)) => {
                    assert_eq!(e.context.entity_type, "Hero");
                    assert_eq!(e.sqlstate.as_deref(), Some("23505"));
                }
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
        });

        assert_eq!(store.calls().last().map(String::as_str), Some("rollback"));
        assert_eq!(*rollbacks.lock().unwrap(), 1);
        // Cascade-persisted hero is transient again; no key was assigned.
        assert_eq!(session.state(team).unwrap(), EntityState::New);
        assert_eq!(session.state(hero).unwrap(), EntityState::Transient);
        assert_eq!(session.value(team, "id").unwrap(), &Value::Null);
        assert_eq!(session.flush_state(), FlushState::Idle);
    }

    #[test]
    fn test_before_flush_hook_changes_are_included() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, store) = session();

        session.on_before_flush(|s| {
            if s.debug_state().new == 0 {
                let team = s.instantiate("Team")?;
                s.set(team, "name", "Audit")?;
                s.persist(team)?;
            }
            Ok(())
        });
        rt.block_on(async {
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.inserted, 1);
        });
        assert_eq!(store.calls(), vec!["begin", "Insert:Team", "commit"]);
    }

    #[test]
    fn test_request_flush_outside_flush_is_ignored() {
        let (mut session, _) = session();
        assert!(!session.request_flush());
    }

    #[test]
    fn test_deferred_flush_runs_in_own_transaction() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, store) = session();

        let team = session.instantiate("Team").unwrap();
        session.set(team, "name", "Avengers").unwrap();
        session.persist(team).unwrap();

        let mut fired = false;
        session.on_after_flush(move |s| {
            if !fired {
                fired = true;
                let hero = s.instantiate("Hero")?;
                s.set(hero, "name", "Vision")?;
                s.persist(hero)?;
                assert!(s.request_flush());
            }
            Ok(())
        });

        rt.block_on(async {
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.inserted, 2);
            assert_eq!(result.transactions, 2);
        });
        assert_eq!(
            store.calls(),
            vec!["begin", "Insert:Team", "commit", "begin", "Insert:Hero", "commit"]
        );
    }

    #[test]
    fn test_reset_rejected_inside_flush_callback() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, _) = session();
        session.on_before_flush(|s| s.reset());
        rt.block_on(async {
            match session.flush(&cx).await {
                Outcome::Err(Error::Transaction(e)) => {
                    assert_eq!(e.kind, TransactionErrorKind::FlushInProgress);
                }
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
        });
        assert!(session.reset().is_ok());
    }

    #[test]
    fn test_hydrate_resolves_references_in_any_order() {
        let (mut session, _) = session();
        let hero = session
            .hydrate(
                "Hero",
                &Row::from_pairs([("id", Value::BigInt(5)), ("name", Value::from("Thor")), ("team_id", Value::BigInt(1))]),
            )
            .unwrap();
        assert_eq!(
            session.reference(hero, "team").unwrap(),
            &RelationRef::Key(vec![Value::BigInt(1)])
        );
        assert_eq!(session.debug_state().unresolved_references, 1);

        let team = session
            .hydrate(
                "Team",
                &Row::from_pairs([("id", Value::Int(1)), ("name", Value::from("Avengers"))]),
            )
            .unwrap();
        assert_eq!(session.reference(hero, "team").unwrap(), &RelationRef::Entity(team));
        assert_eq!(session.collection(team, "heroes").unwrap(), &[hero]);
        assert!(!session.is_modified(team));
        assert!(!session.is_modified(hero));
        assert_eq!(session.debug_state().unresolved_references, 0);
    }

    #[test]
    fn test_hydrate_merges_into_existing_instance() {
        let (mut session, _) = session();
        let row = Row::from_pairs([("id", Value::BigInt(1)), ("name", Value::from("Avengers"))]);
        let team = session.hydrate("Team", &row).unwrap();
        session.set(team, "name", "Local").unwrap();

        let reloaded = Row::from_pairs([("id", Value::BigInt(1)), ("name", Value::from("Remote"))]);
        assert_eq!(session.hydrate("Team", &reloaded).unwrap(), team);
        // Local edit survives; snapshot now reflects the store.
        assert_eq!(session.value(team, "name").unwrap(), &Value::from("Local"));
        assert_eq!(session.modified_properties(team), vec!["name".to_string()]);

        session.set(team, "name", "Remote").unwrap();
        assert!(!session.is_modified(team));
    }

    #[test]
    fn test_persistent_primary_key_is_immutable() {
        let (mut session, _) = session();
        let row = Row::from_pairs([("id", Value::BigInt(1)), ("name", Value::from("Avengers"))]);
        let team = session.hydrate("Team", &row).unwrap();
        assert!(session.set(team, "id", 2i64).is_err());
        assert!(session.set(team, "id", 1i64).is_ok());
    }

    #[test]
    fn test_remove_from_collection_without_orphan_removal_clears_reference() {
        let registry = Arc::new(
            MetadataRegistry::builder()
                .entity(
                    EntityDescriptor::new("Team", "teams")
                        .property(PropertyInfo::scalar("id", SqlType::BigInt).primary_key(true))
                        .property(PropertyInfo::one_to_many("heroes", "Hero", "team")),
                )
                .entity(
                    EntityDescriptor::new("Hero", "heroes")
                        .property(PropertyInfo::scalar("id", SqlType::BigInt).primary_key(true))
                        .property(
                            PropertyInfo::many_to_one("team", "Team", &["team_id"]).nullable(true),
                        ),
                )
                .build()
                .unwrap(),
        );
        let mut session = Session::new(MockStore::default(), registry);
        let team = session
            .hydrate("Team", &Row::from_pairs([("id", Value::BigInt(1))]))
            .unwrap();
        let hero = session
            .hydrate(
                "Hero",
                &Row::from_pairs([("id", Value::BigInt(2)), ("team_id", Value::BigInt(1))]),
            )
            .unwrap();
        session.remove_from_collection(team, "heroes", hero).unwrap();
        assert_eq!(session.reference(hero, "team").unwrap(), &RelationRef::None);
        let change_sets = session.compute_change_sets();
        assert_eq!(change_sets.len(), 1);
        assert_eq!(change_sets[0].kind, ChangeKind::Update);
        assert_eq!(change_sets[0].changed_properties(), vec!["team"]);
    }

    #[test]
    fn test_pending_counts_and_debug_state() {
        let (mut session, _) = session();
        let row = Row::from_pairs([("id", Value::BigInt(1)), ("name", Value::from("A"))]);
        let loaded = session.hydrate("Team", &row).unwrap();
        let fresh = session.instantiate("Team").unwrap();
        session.persist(fresh).unwrap();
        session.set(loaded, "name", "B").unwrap();

        let counts = session.pending_counts();
        assert_eq!(counts, PendingCounts { new: 1, dirty: 1, deleted: 0 });

        session.remove(loaded).unwrap();
        let info = session.debug_state();
        assert_eq!(info.new, 1);
        assert_eq!(info.removed, 1);
        assert_eq!(info.identities, 1);
        assert_eq!(info.flush_state, FlushState::Idle);
    }

    #[test]
    fn test_reset_releases_entities() {
        let (mut session, _) = session();
        let mut first = Vec::new();
        for round in 0..3 {
            let handles: Vec<EntityHandle> = (0..1000)
                .map(|i| {
                    let row = Row::from_pairs([
                        ("id", Value::BigInt(i)),
                        ("name", Value::from(format!("team {i}"))),
                    ]);
                    session.hydrate("Team", &row).unwrap()
                })
                .collect();
            if round == 0 {
                first = handles;
            }
            session.reset().unwrap();

            let info = session.debug_state();
            assert_eq!(info.tracked, 0);
            assert_eq!(info.detached, 0);
            assert_eq!(info.identities, 0);
            assert_eq!(info.slots, 1000);
        }

        // Handles from before a reset never reach the entity now in their slot.
        let stale = first[0];
        assert_eq!(session.state(stale).unwrap(), EntityState::Detached);
        assert!(session.value(stale, "name").is_err());
        assert!(session.persist(stale).is_err());
        let row = Row::from_pairs([("id", Value::BigInt(0)), ("name", Value::from("again"))]);
        let fresh = session.hydrate("Team", &row).unwrap();
        assert_ne!(fresh, stale);
        assert_eq!(session.value(fresh, "name").unwrap(), &Value::from("again"));
        assert_eq!(session.state(stale).unwrap(), EntityState::Detached);
        assert_eq!(session.debug_state().slots, 1000);
    }

    #[test]
    fn test_detach_keeps_references_by_key() {
        let (mut session, _) = session();
        let team_row = Row::from_pairs([("id", Value::BigInt(1)), ("name", Value::from("A"))]);
        let team = session.hydrate("Team", &team_row).unwrap();
        let hero_row = Row::from_pairs([
            ("id", Value::BigInt(7)),
            ("name", Value::from("Deadpond")),
            ("team_id", Value::BigInt(1)),
        ]);
        let hero = session.hydrate("Hero", &hero_row).unwrap();
        assert_eq!(session.reference(hero, "team").unwrap(), &RelationRef::Entity(team));

        session.detach(team).unwrap();
        assert_eq!(session.state(team).unwrap(), EntityState::Detached);
        assert!(session.value(team, "name").is_err());
        assert_eq!(
            session.reference(hero, "team").unwrap(),
            &RelationRef::Key(vec![Value::BigInt(1)])
        );
        assert!(!session.is_modified(hero));
        let info = session.debug_state();
        assert_eq!(info.detached, 0);
        assert_eq!(info.managed, 1);
        assert_eq!(info.unresolved_references, 1);

        // Loading the row again links the hero to the new instance.
        let reloaded = session.hydrate("Team", &team_row).unwrap();
        assert_ne!(reloaded, team);
        assert_eq!(session.reference(hero, "team").unwrap(), &RelationRef::Entity(reloaded));
        assert_eq!(session.collection(reloaded, "heroes").unwrap(), &[hero]);
        assert_eq!(session.get("Team", &[Value::BigInt(1)]), Some(reloaded));
        assert!(!session.is_modified(hero));
    }
}
