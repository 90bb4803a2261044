//! Entity metadata: descriptors, properties, relationships and the frozen registry.
//!
//! Descriptors are assembled with builder methods, then frozen into a
//! [`MetadataRegistry`]. Building the registry validates cross-entity
//! consistency once; afterwards descriptors are shared read-only behind
//! `Arc` by every session.

use crate::error::{Error, MetadataError, Result};
use crate::types::SqlType;
use crate::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Projects property values into a form compared for change detection.
///
/// Properties without a comparator use structural [`Value`] equality.
pub trait ValueComparator: Send + Sync + fmt::Debug {
    fn to_comparable_form(&self, value: &Value) -> Value;

    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        self.to_comparable_form(a) == self.to_comparable_form(b)
    }
}

/// Compares text values ignoring ASCII case.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseInsensitive;

impl ValueComparator for CaseInsensitive {
    fn to_comparable_form(&self, value: &Value) -> Value {
        match value {
            Value::Text(s) => Value::Text(s.to_ascii_lowercase()),
            other => other.clone(),
        }
    }
}

/// Which lifecycle operations propagate across a relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeFlags {
    pub persist: bool,
    pub remove: bool,
    pub orphan_removal: bool,
}

impl CascadeFlags {
    pub const NONE: Self = Self {
        persist: false,
        remove: false,
        orphan_removal: false,
    };

    pub const PERSIST: Self = Self {
        persist: true,
        remove: false,
        orphan_removal: false,
    };

    /// Persist and remove.
    pub const ALL: Self = Self {
        persist: true,
        remove: true,
        orphan_removal: false,
    };

    #[must_use]
    pub const fn with_remove(mut self) -> Self {
        self.remove = true;
        self
    }

    #[must_use]
    pub const fn with_orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }

    /// Does removing the owner remove the related entities?
    ///
    /// Orphan removal implies it: an owner going away orphans every element.
    pub const fn cascades_remove(&self) -> bool {
        self.remove || self.orphan_removal
    }
}

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// Many rows of this entity reference one target row (owning FK).
    ManyToOne,
    /// One row of this entity references one target row (owning FK).
    OneToOne,
    /// Inverse collection of a to-one relationship declared on the target.
    OneToMany,
}

/// Relationship metadata carried by a relationship property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipInfo {
    pub kind: RelationshipKind,
    /// Target entity type name.
    pub target: String,
    /// Owning FK columns, aligned with the target's key columns. Empty for
    /// collections.
    pub columns: Vec<String>,
    /// For collections: the to-one property on the target that owns the FK.
    pub mapped_by: Option<String>,
    pub cascade: CascadeFlags,
}

impl RelationshipInfo {
    pub const fn is_owning(&self) -> bool {
        !matches!(self.kind, RelationshipKind::OneToMany)
    }
}

/// A persistent property of an entity: a scalar column, an owning to-one
/// relationship, or an inverse collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    /// Column for scalar properties.
    pub column: Option<String>,
    pub sql_type: Option<SqlType>,
    pub nullable: bool,
    pub primary_key: bool,
    /// The store generates this key on insert.
    pub generated: bool,
    /// Optimistic-lock version column.
    pub version: bool,
    pub relationship: Option<RelationshipInfo>,
    #[serde(skip)]
    pub comparator: Option<Arc<dyn ValueComparator>>,
}

impl PropertyInfo {
    /// A scalar property stored in a column of the same name.
    pub fn scalar(name: impl Into<String>, sql_type: SqlType) -> Self {
        let name = name.into();
        Self {
            column: Some(name.clone()),
            name,
            sql_type: Some(sql_type),
            nullable: false,
            primary_key: false,
            generated: false,
            version: false,
            relationship: None,
            comparator: None,
        }
    }

    /// Owning many-to-one relationship stored in `columns`.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>, columns: &[&str]) -> Self {
        Self::to_one(name.into(), target.into(), columns, RelationshipKind::ManyToOne)
    }

    /// Owning one-to-one relationship stored in `columns`.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>, columns: &[&str]) -> Self {
        Self::to_one(name.into(), target.into(), columns, RelationshipKind::OneToOne)
    }

    fn to_one(name: String, target: String, columns: &[&str], kind: RelationshipKind) -> Self {
        Self {
            name,
            column: None,
            sql_type: None,
            nullable: false,
            primary_key: false,
            generated: false,
            version: false,
            relationship: Some(RelationshipInfo {
                kind,
                target,
                columns: columns.iter().map(|c| (*c).to_string()).collect(),
                mapped_by: None,
                cascade: CascadeFlags::NONE,
            }),
            comparator: None,
        }
    }

    /// Inverse collection of the to-one property `mapped_by` on `target`.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: None,
            sql_type: None,
            nullable: true,
            primary_key: false,
            generated: false,
            version: false,
            relationship: Some(RelationshipInfo {
                kind: RelationshipKind::OneToMany,
                target: target.into(),
                columns: Vec::new(),
                mapped_by: Some(mapped_by.into()),
                cascade: CascadeFlags::NONE,
            }),
            comparator: None,
        }
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column = Some(name.into());
        self
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    pub fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    pub fn cascade(mut self, flags: CascadeFlags) -> Self {
        if let Some(rel) = self.relationship.as_mut() {
            rel.cascade = flags;
        }
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn ValueComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn is_relationship(&self) -> bool {
        self.relationship.is_some()
    }

    /// Owning to-one relationship (holds FK columns).
    pub fn is_to_one(&self) -> bool {
        self.relationship.as_ref().is_some_and(RelationshipInfo::is_owning)
    }

    pub fn is_collection(&self) -> bool {
        self.relationship
            .as_ref()
            .is_some_and(|r| r.kind == RelationshipKind::OneToMany)
    }

    pub fn cascade_flags(&self) -> CascadeFlags {
        self.relationship
            .as_ref()
            .map_or(CascadeFlags::NONE, |r| r.cascade)
    }

    pub fn target(&self) -> Option<&str> {
        self.relationship.as_ref().map(|r| r.target.as_str())
    }

    /// Columns written for this property, in order.
    pub fn columns(&self) -> Vec<&str> {
        match &self.relationship {
            Some(rel) => rel.columns.iter().map(String::as_str).collect(),
            None => self.column.iter().map(String::as_str).collect(),
        }
    }

    /// Compare two values of this property for change detection.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match &self.comparator {
            Some(cmp) => cmp.values_equal(a, b),
            None => a == b,
        }
    }
}

/// Index of a descriptor inside its [`MetadataRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityTypeId(usize);

impl EntityTypeId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Resolved, read-only description of one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    name: String,
    table: String,
    properties: Vec<PropertyInfo>,
    #[serde(skip)]
    id: usize,
    #[serde(skip)]
    primary_key: Vec<usize>,
    #[serde(skip)]
    version: Option<usize>,
    #[serde(skip)]
    key_columns: Vec<String>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            properties: Vec::new(),
            id: 0,
            primary_key: Vec::new(),
            version: None,
            key_columns: Vec::new(),
        }
    }

    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id(&self) -> EntityTypeId {
        EntityTypeId(self.id)
    }

    pub fn properties(&self) -> &[PropertyInfo] {
        &self.properties
    }

    pub fn property_at(&self, index: usize) -> &PropertyInfo {
        &self.properties[index]
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Indices of primary-key properties, in declaration order.
    pub fn primary_key(&self) -> &[usize] {
        &self.primary_key
    }

    pub fn primary_key_names(&self) -> Vec<&str> {
        self.primary_key
            .iter()
            .map(|&i| self.properties[i].name.as_str())
            .collect()
    }

    pub fn version_index(&self) -> Option<usize> {
        self.version
    }

    /// Flattened key columns; key-embedding relationships contribute their
    /// FK columns.
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// The single store-generated key property, if any.
    pub fn generated_key(&self) -> Option<usize> {
        match self.primary_key.as_slice() {
            [only] if self.properties[*only].generated => Some(*only),
            _ => None,
        }
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    /// The version column name, if the type is versioned.
    pub fn version_column(&self) -> Option<&str> {
        self.version
            .and_then(|i| self.properties[i].column.as_deref())
    }
}

/// Frozen set of entity descriptors shared by sessions.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: Vec<Arc<EntityDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl MetadataRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntityDescriptor>> {
        self.by_name.get(name).map(|&i| &self.entities[i])
    }

    /// Look up a descriptor, failing with a metadata error if unknown.
    pub fn descriptor(&self, name: &str) -> Result<&Arc<EntityDescriptor>> {
        self.get(name).ok_or_else(|| {
            Error::Metadata(MetadataError {
                entity_type: Some(name.to_string()),
                message: "unknown entity type".to_string(),
            })
        })
    }

    pub fn by_id(&self, id: EntityTypeId) -> &Arc<EntityDescriptor> {
        &self.entities[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Collects descriptors and validates them into a [`MetadataRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entities: Vec<EntityDescriptor>,
}

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Is `name` usable as an unqualified SQL identifier?
pub fn is_valid_identifier(name: &str) -> bool {
    name.len() <= 63 && identifier_regex().is_some_and(|re| re.is_match(name))
}

fn metadata_err(entity: &str, message: impl Into<String>) -> Error {
    Error::Metadata(MetadataError {
        entity_type: Some(entity.to_string()),
        message: message.into(),
    })
}

impl RegistryBuilder {
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities.push(descriptor);
        self
    }

    /// Validate all descriptors and freeze them.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn build(mut self) -> Result<MetadataRegistry> {
        let mut by_name = HashMap::new();
        for (i, desc) in self.entities.iter().enumerate() {
            if by_name.insert(desc.name.clone(), i).is_some() {
                return Err(metadata_err(&desc.name, "entity type registered twice"));
            }
        }

        for (i, desc) in self.entities.iter_mut().enumerate() {
            desc.id = i;
            desc.primary_key = desc
                .properties
                .iter()
                .enumerate()
                .filter(|(_, p)| p.primary_key)
                .map(|(i, _)| i)
                .collect();
            let versions: Vec<usize> = desc
                .properties
                .iter()
                .enumerate()
                .filter(|(_, p)| p.version)
                .map(|(i, _)| i)
                .collect();
            if versions.len() > 1 {
                return Err(metadata_err(&desc.name, "more than one version property"));
            }
            desc.version = versions.first().copied();
        }

        for desc in &self.entities {
            validate_descriptor(desc, &self.entities, &by_name)?;
        }

        let mut key_columns = Vec::with_capacity(self.entities.len());
        for i in 0..self.entities.len() {
            let mut stack = Vec::new();
            key_columns.push(flatten_key_columns(i, &self.entities, &by_name, &mut stack)?);
        }

        for (desc, columns) in self.entities.iter_mut().zip(key_columns) {
            desc.key_columns = columns;
        }

        // FK widths must match the target's flattened key.
        for desc in &self.entities {
            for prop in desc.properties.iter().filter(|p| p.is_to_one()) {
                if let Some(rel) = &prop.relationship {
                    let target = &self.entities[by_name[&rel.target]];
                    if rel.columns.len() != target.key_columns.len() {
                        return Err(metadata_err(
                            &desc.name,
                            format!(
                                "relationship '{}' has {} column(s) but {} has a {}-column key",
                                prop.name,
                                rel.columns.len(),
                                target.name,
                                target.key_columns.len()
                            ),
                        ));
                    }
                }
            }
        }

        tracing::debug!(entities = self.entities.len(), "Metadata registry frozen");

        Ok(MetadataRegistry {
            entities: self.entities.into_iter().map(Arc::new).collect(),
            by_name,
        })
    }
}

fn validate_descriptor(
    desc: &EntityDescriptor,
    all: &[EntityDescriptor],
    by_name: &HashMap<String, usize>,
) -> Result<()> {
    if !is_valid_identifier(&desc.table) {
        return Err(metadata_err(
            &desc.name,
            format!("invalid table name '{}'", desc.table),
        ));
    }
    if desc.primary_key.is_empty() {
        return Err(metadata_err(&desc.name, "no primary key property"));
    }

    let mut seen_props = HashSet::new();
    let mut seen_columns = HashSet::new();
    for prop in &desc.properties {
        if !seen_props.insert(prop.name.as_str()) {
            return Err(metadata_err(
                &desc.name,
                format!("duplicate property '{}'", prop.name),
            ));
        }
        for column in prop.columns() {
            if !is_valid_identifier(column) {
                return Err(metadata_err(
                    &desc.name,
                    format!("invalid column name '{}' on '{}'", column, prop.name),
                ));
            }
            if !seen_columns.insert(column) {
                return Err(metadata_err(
                    &desc.name,
                    format!("column '{}' mapped twice", column),
                ));
            }
        }

        if prop.primary_key && prop.nullable {
            return Err(metadata_err(
                &desc.name,
                format!("primary key property '{}' is nullable", prop.name),
            ));
        }
        if prop.generated && (!prop.primary_key || prop.is_relationship()) {
            return Err(metadata_err(
                &desc.name,
                format!("generated property '{}' must be a scalar key", prop.name),
            ));
        }
        if prop.generated && desc.primary_key.len() > 1 {
            return Err(metadata_err(
                &desc.name,
                "generated keys are only supported on single-property keys",
            ));
        }
        if prop.version {
            if prop.is_relationship() || prop.primary_key {
                return Err(metadata_err(
                    &desc.name,
                    format!("version property '{}' must be a plain scalar", prop.name),
                ));
            }
            if prop.sql_type.as_ref().is_some_and(|t| !t.is_integer()) {
                return Err(metadata_err(
                    &desc.name,
                    format!("version property '{}' must be an integer", prop.name),
                ));
            }
        }
        if prop.relationship.is_none() && prop.column.is_none() {
            return Err(metadata_err(
                &desc.name,
                format!("scalar property '{}' has no column", prop.name),
            ));
        }

        let Some(rel) = &prop.relationship else {
            continue;
        };
        let Some(&target_idx) = by_name.get(&rel.target) else {
            return Err(metadata_err(
                &desc.name,
                format!(
                    "relationship '{}' targets unknown entity type {}",
                    prop.name, rel.target
                ),
            ));
        };
        let target = &all[target_idx];

        match rel.kind {
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne => {
                if rel.columns.is_empty() {
                    return Err(metadata_err(
                        &desc.name,
                        format!("relationship '{}' has no FK columns", prop.name),
                    ));
                }
            }
            RelationshipKind::OneToMany => {
                if prop.primary_key {
                    return Err(metadata_err(
                        &desc.name,
                        format!("collection '{}' cannot be part of the key", prop.name),
                    ));
                }
                let mapped_by = rel.mapped_by.as_deref().unwrap_or_default();
                let back = target.find_property(mapped_by);
                let valid = back.is_some_and(|b| {
                    b.is_to_one() && b.target() == Some(desc.name.as_str())
                });
                if !valid {
                    return Err(metadata_err(
                        &desc.name,
                        format!(
                            "collection '{}' is mapped by '{}.{}', which is not a to-one relationship back to {}",
                            prop.name, target.name, mapped_by, desc.name
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn flatten_key_columns(
    idx: usize,
    all: &[EntityDescriptor],
    by_name: &HashMap<String, usize>,
    stack: &mut Vec<usize>,
) -> Result<Vec<String>> {
    let desc = &all[idx];
    if stack.contains(&idx) {
        return Err(metadata_err(
            &desc.name,
            "primary key embeds itself through key relationships",
        ));
    }
    stack.push(idx);
    let mut columns = Vec::new();
    for &pk in &desc.primary_key {
        let prop = &desc.properties[pk];
        match &prop.relationship {
            Some(rel) => {
                // Width check of the embedded key happens against the target.
                let target = by_name[&rel.target];
                let target_cols = flatten_key_columns(target, all, by_name, stack)?;
                if target_cols.len() != rel.columns.len() {
                    return Err(metadata_err(
                        &desc.name,
                        format!(
                            "key relationship '{}' has {} column(s), target key has {}",
                            prop.name,
                            rel.columns.len(),
                            target_cols.len()
                        ),
                    ));
                }
                columns.extend(rel.columns.iter().cloned());
            }
            None => columns.extend(prop.column.iter().cloned()),
        }
    }
    stack.pop();
    Ok(columns)
}
