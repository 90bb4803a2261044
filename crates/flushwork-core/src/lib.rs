//! Core types and traits for flushwork.
//!
//! This crate provides the foundations the unit of work builds on:
//!
//! - `Value` for dynamically typed column values
//! - `Error` taxonomy with entity/operation context
//! - Entity metadata (`EntityDescriptor`, `PropertyInfo`, `MetadataRegistry`)
//! - `Store` trait for the relational backend, plus statement batches and dialects
//! - `Outcome` / `Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod metadata;
pub mod row;
pub mod store;
pub mod types;
pub mod value;

pub use error::{
    CycleError, DuplicateIdentityError, EntityContext, Error, FieldValidationError, MetadataError,
    OptimisticLockError, Result, StatementError, StoreError, StoreErrorKind, TransactionError,
    TransactionErrorKind, ValidationError, ValidationErrorKind,
};
pub use metadata::{
    CascadeFlags, CaseInsensitive, EntityDescriptor, EntityTypeId, MetadataRegistry,
    PropertyInfo, RegistryBuilder, RelationshipInfo, RelationshipKind, ValueComparator,
    is_valid_identifier,
};
pub use row::{ColumnInfo, Row};
pub use store::{
    BatchPurpose, BatchResult, BatchRow, ChangeKind, Dialect, StatementBatch, Store,
};
pub use types::SqlType;
pub use value::{Value, format_key};
