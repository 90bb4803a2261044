//! Identity Map: at most one managed instance per (entity type, primary key).
//!
//! Keys are canonicalized on construction so a key loaded as `Int(7)` and
//! one assigned as `BigInt(7)` address the same slot.

use crate::entity::EntityHandle;
use flushwork_core::{DuplicateIdentityError, EntityDescriptor, EntityTypeId, Error, Result, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Identity of a persistent row: entity type plus canonical key values.
#[derive(Debug, Clone)]
pub struct EntityKey {
    type_id: EntityTypeId,
    values: Vec<Value>,
}

impl EntityKey {
    pub fn new(type_id: EntityTypeId, values: &[Value]) -> Self {
        Self {
            type_id,
            values: values.iter().map(Value::canonical).collect(),
        }
    }

    pub fn type_id(&self) -> EntityTypeId {
        self.type_id
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.values == other.values
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        for v in &self.values {
            v.hash_into(state);
        }
    }
}

/// Identity map from [`EntityKey`] to the handle of the managed instance.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityHandle>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Look up the managed instance for `(type, key)`.
    pub fn get(&self, type_id: EntityTypeId, key: &[Value]) -> Option<EntityHandle> {
        self.entries.get(&EntityKey::new(type_id, key)).copied()
    }

    pub fn contains(&self, type_id: EntityTypeId, key: &[Value]) -> bool {
        self.entries.contains_key(&EntityKey::new(type_id, key))
    }

    /// Register `handle` under `(descriptor, key)`.
    ///
    /// Re-registering the same handle is a no-op. Fails with
    /// [`Error::DuplicateIdentity`] if another handle occupies the slot.
    #[tracing::instrument(level = "trace", skip(self, descriptor, key))]
    pub fn register(
        &mut self,
        descriptor: &EntityDescriptor,
        key: &[Value],
        handle: EntityHandle,
    ) -> Result<()> {
        let entity_key = EntityKey::new(descriptor.id(), key);
        match self.entries.get(&entity_key) {
            Some(existing) if *existing == handle => Ok(()),
            Some(_) => Err(Error::DuplicateIdentity(DuplicateIdentityError {
                entity_type: descriptor.name().to_string(),
                primary_key: key.to_vec(),
            })),
            None => {
                tracing::trace!(
                    entity = descriptor.name(),
                    key = %flushwork_core::format_key(key),
                    handle = %handle,
                    "Registered identity"
                );
                self.entries.insert(entity_key, handle);
                Ok(())
            }
        }
    }

    /// Remove the entry for `(type, key)`, returning the handle it held.
    pub fn remove(&mut self, type_id: EntityTypeId, key: &[Value]) -> Option<EntityHandle> {
        self.entries.remove(&EntityKey::new(type_id, key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, EntityHandle)> {
        self.entries.iter().map(|(k, h)| (k, *h))
    }
}
