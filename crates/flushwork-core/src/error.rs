//! Error types for flush operations.

use crate::store::ChangeKind;
use crate::value::{Value, format_key};
use std::fmt;

/// The primary error type for all flushwork operations.
#[derive(Debug)]
pub enum Error {
    /// Pre-flush validation failed; the store was never touched
    Validation(ValidationError),
    /// A versioned or row-count-checked statement affected the wrong number of rows
    OptimisticLock(OptimisticLockError),
    /// The change graph contains a cycle that cannot be broken
    CircularDependency(CycleError),
    /// The store rejected a statement with an integrity-constraint failure
    ConstraintViolation(StatementError),
    /// Two managed instances claim the same identity
    DuplicateIdentity(DuplicateIdentityError),
    /// Any other statement failure during execution
    Statement(StatementError),
    /// Entity metadata is inconsistent
    Metadata(MetadataError),
    /// Transaction control errors (begin/commit/rollback, re-entrancy)
    Transaction(TransactionError),
    /// Raw error reported by a store implementation
    Store(StoreError),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

/// Identifies the entity and operation an error originated from.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityContext {
    pub entity_type: String,
    pub primary_key: Option<Vec<Value>>,
    pub operation: Option<ChangeKind>,
}

impl EntityContext {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key: None,
            operation: None,
        }
    }

    pub fn with_key(mut self, key: Vec<Value>) -> Self {
        self.primary_key = Some(key);
        self
    }

    pub fn with_operation(mut self, op: ChangeKind) -> Self {
        self.operation = Some(op);
        self
    }
}

impl fmt::Display for EntityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_type)?;
        if let Some(key) = &self.primary_key {
            write!(f, "#{}", format_key(key))?;
        }
        if let Some(op) = self.operation {
            write!(f, " ({op})")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct OptimisticLockError {
    pub context: EntityContext,
    pub sql: String,
    pub expected_rows: u64,
    pub actual_rows: u64,
}

#[derive(Debug)]
pub struct CycleError {
    /// The operation whose ordering failed (Create or Delete)
    pub phase: ChangeKind,
    /// Entity types participating in the cycle, in discovery order
    pub entity_types: Vec<String>,
    /// Human-readable description of each cycle member
    pub members: Vec<String>,
}

#[derive(Debug)]
pub struct StatementError {
    pub context: EntityContext,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug)]
pub struct DuplicateIdentityError {
    pub entity_type: String,
    pub primary_key: Vec<Value>,
}

#[derive(Debug)]
pub struct MetadataError {
    pub entity_type: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Failed to start the flush transaction
    Begin,
    /// Commit failed
    Commit,
    /// Rollback failed
    Rollback,
    /// A flush was requested while another one is executing
    FlushInProgress,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Unique, foreign key, not-null or check constraint
    Constraint,
    /// Transport lost or unusable
    Connection,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sqlstate: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn constraint(sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Constraint,
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
            source: None,
        }
    }

    /// SQLSTATE class 23 or an explicit constraint kind.
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == StoreErrorKind::Constraint
            || self.sqlstate.as_deref().is_some_and(|s| s.starts_with("23"))
    }
}

/// Validation error collected before any statement is executed.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub errors: Vec<FieldValidationError>,
}

/// A single validation failure on one property of one entity.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    pub entity: Option<EntityContext>,
    pub field: String,
    pub kind: ValidationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Required field is missing/null
    Required,
    /// Value does not fit the column's SQL type
    Type,
    /// Relationship points at an entity that will never be persisted
    TransientReference,
    /// Property name not declared on the descriptor
    UnknownProperty,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn add(
        &mut self,
        entity: Option<EntityContext>,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            entity,
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    pub fn add_required(&mut self, entity: EntityContext, field: impl Into<String>) {
        let field = field.into();
        let message = format!("'{field}' is required");
        self.add(Some(entity), field, ValidationErrorKind::Required, message);
    }

    pub fn add_transient_reference(
        &mut self,
        entity: EntityContext,
        field: impl Into<String>,
        target_type: &str,
    ) {
        let field = field.into();
        let message = format!(
            "'{field}' references an unsaved transient entity of type {target_type}; \
             persist it first or enable cascade persist"
        );
        self.add(
            Some(entity),
            field,
            ValidationErrorKind::TransientReference,
            message,
        );
    }

    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(None, field, ValidationErrorKind::Custom, message);
    }

    /// Does any recorded failure have the given kind?
    pub fn has_kind(&self, kind: ValidationErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Entity context carried by this error, if any.
    pub fn context(&self) -> Option<&EntityContext> {
        match self {
            Error::OptimisticLock(e) => Some(&e.context),
            Error::ConstraintViolation(e) | Error::Statement(e) => Some(&e.context),
            Error::Validation(e) => e.errors.first().and_then(|f| f.entity.as_ref()),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::ConstraintViolation(e) | Error::Statement(e) => e.sqlstate.as_deref(),
            Error::Store(e) => e.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::ConstraintViolation(e) | Error::Statement(e) => e.sql.as_deref(),
            Error::OptimisticLock(e) => Some(&e.sql),
            _ => None,
        }
    }

    /// Is this a timeout, either raw or reported by the store?
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Store(e) => e.kind == StoreErrorKind::Timeout,
            Error::Statement(e) => e.source.as_deref().is_some_and(Error::is_timeout),
            _ => false,
        }
    }

    /// Wrap a failure raised while executing a statement for `context`.
    ///
    /// Constraint failures become [`Error::ConstraintViolation`]; cancellation
    /// and already-contextualized errors pass through unchanged.
    pub fn in_statement(self, context: EntityContext, sql: &str) -> Error {
        match self {
            Error::Cancelled
            | Error::OptimisticLock(_)
            | Error::ConstraintViolation(_)
            | Error::Statement(_) => self,
            Error::Store(store) => {
                let constraint = store.is_constraint_violation();
                let err = StatementError {
                    context,
                    sql: Some(sql.to_string()),
                    sqlstate: store.sqlstate.clone(),
                    message: store.message.clone(),
                    source: Some(Box::new(Error::Store(store))),
                };
                if constraint {
                    Error::ConstraintViolation(err)
                } else {
                    Error::Statement(err)
                }
            }
            other => Error::Statement(StatementError {
                context,
                sql: Some(sql.to_string()),
                sqlstate: None,
                message: other.to_string(),
                source: Some(Box::new(other)),
            }),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::OptimisticLock(e) => write!(
                f,
                "Optimistic lock failure on {}: expected {} row(s) affected, got {}",
                e.context, e.expected_rows, e.actual_rows
            ),
            Error::CircularDependency(e) => write!(
                f,
                "Circular dependency between required relationships ({}): {}",
                e.phase,
                e.members.join(" -> ")
            ),
            Error::ConstraintViolation(e) => {
                write!(f, "Constraint violation on {}: {}", e.context, e.message)
            }
            Error::DuplicateIdentity(e) => write!(
                f,
                "Duplicate identity: another {} with key {} is already managed",
                e.entity_type,
                format_key(&e.primary_key)
            ),
            Error::Statement(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(
                        f,
                        "Statement failed on {} (SQLSTATE {}): {}",
                        e.context, sqlstate, e.message
                    )
                } else {
                    write!(f, "Statement failed on {}: {}", e.context, e.message)
                }
            }
            Error::Metadata(e) => match &e.entity_type {
                Some(ty) => write!(f, "Metadata error on {}: {}", ty, e.message),
                None => write!(f, "Metadata error: {}", e.message),
            },
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Store(e) => write!(f, "Store error: {}", e.message),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConstraintViolation(e) | Error::Statement(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            match &err.entity {
                Some(ctx) => write!(f, "{} on {}: {}", err.field, ctx, err.message),
                None => write!(f, "validation error on '{}': {}", err.field, err.message),
            }
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                match &err.entity {
                    Some(ctx) => writeln!(f, "  - {} {}: {}", ctx, err.field, err.message)?,
                    None => writeln!(f, "  - {}: {}", err.field, err.message)?,
                }
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::CircularDependency(err)
    }
}

impl From<DuplicateIdentityError> for Error {
    fn from(err: DuplicateIdentityError) -> Self {
        Error::DuplicateIdentity(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

/// Result type alias for flushwork operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_failures_are_classified() {
        let ctx = EntityContext::new("users")
            .with_key(vec![Value::BigInt(1)])
            .with_operation(ChangeKind::Create);
        let err = Error::Store(StoreError::constraint("23505", "duplicate key"))
            .in_statement(ctx.clone(), "INSERT INTO users");

        assert!(matches!(err, Error::ConstraintViolation(_)));
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.sql(), Some("INSERT INTO users"));
        assert_eq!(err.context(), Some(&ctx));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn other_store_failures_become_statement_errors() {
        let ctx = EntityContext::new("users").with_operation(ChangeKind::Update);
        let err = Error::Store(StoreError::new(StoreErrorKind::Timeout, "statement timeout"))
            .in_statement(ctx, "UPDATE users");

        assert!(matches!(err, Error::Statement(_)));
        assert!(err.is_timeout());
    }

    #[test]
    fn cancellation_passes_through() {
        let err = Error::Cancelled.in_statement(EntityContext::new("users"), "DELETE");
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn validation_display() {
        let mut v = ValidationError::new();
        assert_eq!(v.to_string(), "validation passed");

        v.add_transient_reference(
            EntityContext::new("Post").with_key(vec![Value::BigInt(3)]),
            "author",
            "User",
        );
        assert!(v.has_kind(ValidationErrorKind::TransientReference));
        let text = v.to_string();
        assert!(text.contains("Post#3"));
        assert!(text.contains("unsaved transient entity"));

        v.add_custom("x", "bad");
        assert!(v.to_string().starts_with("validation errors:"));
        assert!(v.into_result().is_err());
    }

    #[test]
    fn entity_context_display() {
        let ctx = EntityContext::new("Line")
            .with_key(vec![Value::BigInt(1), Value::Int(2)])
            .with_operation(ChangeKind::Delete);
        assert_eq!(ctx.to_string(), "Line#(1, 2) (delete)");
    }
}
