//! flushwork - a unit-of-work persistence engine.
//!
//! flushwork tracks in-memory entities against their last persisted state and
//! writes the difference to a relational store in one transaction:
//!
//! - Identity map guaranteeing one in-memory instance per persistent row
//! - Value-based change detection against per-entity snapshots
//! - Cascade persist, cascade remove and orphan removal
//! - Instance-level dependency ordering, with nullable cycles broken in two phases
//! - Batched INSERT / UPDATE (CASE) / DELETE statements with optimistic locking
//! - Cancel-correct async flushing on asupersync
//!
//! # Quick Start
//!
//! ```ignore
//! use flushwork::prelude::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityDescriptor::new("Team", "teams")
//!             .property(PropertyInfo::scalar("id", SqlType::BigInt).primary_key(true).generated(true))
//!             .property(PropertyInfo::scalar("name", SqlType::Text))
//!             .property(PropertyInfo::one_to_many("heroes", "Hero", "team").cascade(CascadeFlags::ALL)),
//!     )
//!     .entity(
//!         EntityDescriptor::new("Hero", "heroes")
//!             .property(PropertyInfo::scalar("id", SqlType::BigInt).primary_key(true).generated(true))
//!             .property(PropertyInfo::scalar("name", SqlType::Text))
//!             .property(PropertyInfo::many_to_one("team", "Team", &["team_id"])),
//!     )
//!     .build()?;
//!
//! async fn save(cx: &Cx, session: &mut Session<impl Store>) -> Outcome<FlushResult, Error> {
//!     let team = session.instantiate("Team")?;
//!     session.set(team, "name", "Avengers")?;
//!     let hero = session.instantiate("Hero")?;
//!     session.set(hero, "name", "Thor")?;
//!     session.add_to_collection(team, "heroes", hero)?;
//!     session.persist(team)?;
//!
//!     // INSERT teams, then INSERT heroes with the generated team id
//!     session.flush(cx).await
//! }
//! ```

// Re-export all public types from sub-crates
pub use flushwork_core::{
    // asupersync
    Cx,
    Outcome,
    // Errors
    CycleError,
    DuplicateIdentityError,
    EntityContext,
    Error,
    FieldValidationError,
    MetadataError,
    OptimisticLockError,
    Result,
    StatementError,
    StoreError,
    StoreErrorKind,
    TransactionError,
    TransactionErrorKind,
    ValidationError,
    ValidationErrorKind,
    // Metadata
    CascadeFlags,
    CaseInsensitive,
    EntityDescriptor,
    EntityTypeId,
    MetadataRegistry,
    PropertyInfo,
    RegistryBuilder,
    RelationshipInfo,
    RelationshipKind,
    ValueComparator,
    // Store
    BatchPurpose,
    BatchResult,
    BatchRow,
    ChangeKind,
    ColumnInfo,
    Dialect,
    Row,
    SqlType,
    StatementBatch,
    Store,
    Value,
    format_key,
};

pub use flushwork_session::{
    ChangeSet, ChangeValue, DeferredForeignKey, DependencyGraph, Edge, EntityHandle, EntityKey,
    EntitySnapshot, EntityState, FlushOrderer, FlushPlan, FlushResult, FlushState, IdentityMap,
    PendingCounts, PropertyChange, RelationRef, Session, SessionConfig, SessionDebugInfo,
    SessionEvent, SessionEventCallbacks, UnitOfWork,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use flushwork::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Metadata
        CascadeFlags,
        EntityDescriptor,
        MetadataRegistry,
        PropertyInfo,
        SqlType,
        // Store
        BatchResult,
        Dialect,
        Row,
        StatementBatch,
        Store,
        Value,
        // Errors
        Error,
        Result,
        // Session
        EntityHandle,
        EntityState,
        FlushResult,
        RelationRef,
        Session,
        SessionConfig,
    };
}
