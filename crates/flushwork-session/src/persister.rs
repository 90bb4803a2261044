//! Batch persister: turns an ordered [`FlushPlan`] into statement batches
//! and executes them against the [`Store`].
//!
//! SQL is rendered just before each batch runs, so keys the store generated
//! for earlier batches are available to later ones. Nothing produced here
//! touches the entities; generated keys and bumped versions are collected in
//! [`PendingWrites`] and applied by the session once the transaction commits.

use crate::change_tracker::{ChangeSet, ChangeValue};
use crate::entity::{EntityArena, EntityHandle, ForeignKey, RelationRef, TentativeKeys};
use crate::flush::{DeferredForeignKey, FlushPlan, FlushResult};
use asupersync::{Cx, Outcome};
use flushwork_core::{
    BatchPurpose, BatchResult, BatchRow, ChangeKind, Dialect, EntityContext, EntityDescriptor,
    Error, OptimisticLockError, Result, StatementBatch, StatementError, Store, Value,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Results of an executed plan awaiting commit.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    /// Generated key per inserted entity.
    pub keys: TentativeKeys,
    /// Version each created or updated entity carries after the flush.
    pub versions: HashMap<EntityHandle, Value>,
    pub result: FlushResult,
}

/// Knobs controlling batch shape and row-count checking.
#[derive(Debug, Clone, Copy)]
pub struct PersisterOptions {
    pub dialect: Dialect,
    /// Upper bound on rows per statement.
    pub max_batch_rows: usize,
    /// Treat any row-count mismatch as a concurrent modification, not only
    /// on versioned types.
    pub strict_row_counts: bool,
}

/// Rows of one entity type sharing a column shape.
struct Group {
    descriptor: Arc<EntityDescriptor>,
    columns: Vec<String>,
    /// The store generates the key of every row.
    generated: bool,
    entities: Vec<EntityHandle>,
    rows: Vec<BatchRow>,
}

impl Group {
    fn new(descriptor: Arc<EntityDescriptor>, columns: Vec<String>, generated: bool) -> Self {
        Self {
            descriptor,
            columns,
            generated,
            entities: Vec::new(),
            rows: Vec::new(),
        }
    }
}

/// Collects rows into groups keyed by entity type and column shape, keeping
/// first-appearance order.
#[derive(Default)]
struct Grouper {
    index: HashMap<(String, Vec<String>, bool), usize>,
    groups: Vec<Group>,
}

impl Grouper {
    fn push(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        columns: Vec<String>,
        generated: bool,
        entity: EntityHandle,
        row: BatchRow,
    ) {
        let key = (descriptor.name().to_string(), columns, generated);
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = self.groups.len();
                self.groups
                    .push(Group::new(Arc::clone(descriptor), key.1.clone(), generated));
                self.index.insert(key, slot);
                slot
            }
        };
        self.groups[slot].entities.push(entity);
        self.groups[slot].rows.push(row);
    }

    fn finish(self) -> Vec<Group> {
        self.groups
    }
}

/// Executes flush plans against a store.
pub struct BatchPersister<'a, S: Store> {
    store: &'a S,
    options: PersisterOptions,
}

impl<'a, S: Store> BatchPersister<'a, S> {
    pub fn new(store: &'a S, options: PersisterOptions) -> Self {
        Self { store, options }
    }

    /// Execute every phase of `plan` inside the already open transaction.
    #[tracing::instrument(level = "info", skip_all, fields(change_sets = plan.len()))]
    pub(crate) async fn execute(
        &self,
        cx: &Cx,
        arena: &EntityArena,
        plan: &FlushPlan,
    ) -> Outcome<PendingWrites, Error> {
        let start = std::time::Instant::now();
        let mut pending = PendingWrites::default();

        // 1. Inserts, layer by layer
        for layer in &plan.insert_layers {
            let groups = match self.insert_groups(arena, plan, layer, &pending) {
                Ok(groups) => groups,
                Err(e) => return Outcome::Err(e),
            };
            for group in groups {
                match self
                    .execute_group(cx, ChangeKind::Create, BatchPurpose::Insert, group, &mut pending)
                    .await
                {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        for cs in plan.inserts() {
            if let Some(version) = &cs.version {
                pending.versions.insert(cs.entity, version.clone());
            }
        }

        // 2. Cycle fixups
        let groups = match self.fixup_groups(arena, &plan.cycle_fixups, &pending) {
            Ok(groups) => groups,
            Err(e) => return Outcome::Err(e),
        };
        for group in groups {
            match self
                .execute_group(cx, ChangeKind::Update, BatchPurpose::CycleFixup, group, &mut pending)
                .await
            {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 3. Updates
        let groups = match self.update_groups(arena, plan, &mut pending) {
            Ok(groups) => groups,
            Err(e) => return Outcome::Err(e),
        };
        for group in groups {
            match self
                .execute_group(cx, ChangeKind::Update, BatchPurpose::Update, group, &mut pending)
                .await
            {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 4. Null-outs breaking delete cycles
        let groups = match self.null_out_groups(plan) {
            Ok(groups) => groups,
            Err(e) => return Outcome::Err(e),
        };
        for group in groups {
            match self
                .execute_group(cx, ChangeKind::Update, BatchPurpose::CycleNullOut, group, &mut pending)
                .await
            {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 5. Deletes, layer by layer
        for layer in &plan.delete_layers {
            let groups = match delete_groups(plan, layer) {
                Ok(groups) => groups,
                Err(e) => return Outcome::Err(e),
            };
            for group in groups {
                match self
                    .execute_group(cx, ChangeKind::Delete, BatchPurpose::Delete, group, &mut pending)
                    .await
                {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = pending.result.inserted,
            updated = pending.result.updated,
            deleted = pending.result.deleted,
            batches = pending.result.batches,
            "Flush plan executed"
        );
        Outcome::Ok(pending)
    }

    fn insert_groups(
        &self,
        arena: &EntityArena,
        plan: &FlushPlan,
        layer: &[usize],
        pending: &PendingWrites,
    ) -> Result<Vec<Group>> {
        let mut grouper = Grouper::default();
        for &i in layer {
            let cs = &plan.change_sets[i];
            let desc = &cs.descriptor;
            let mut columns = Vec::new();
            let mut values = Vec::new();
            for change in &cs.changes {
                let prop = desc.property_at(change.index);
                match &change.value {
                    ChangeValue::Scalar(v) => {
                        columns.extend(prop.columns().into_iter().map(str::to_string));
                        values.push(v.clone());
                    }
                    ChangeValue::Reference(r) => {
                        let fk_columns = prop.columns();
                        let fk = if plan.is_deferred(cs.entity, change.index) {
                            vec![Value::Null; fk_columns.len()]
                        } else {
                            resolve_fk(arena, cs.entity, &prop.name, r, fk_columns.len(), &pending.keys)?
                        };
                        columns.extend(fk_columns.into_iter().map(str::to_string));
                        values.extend(fk);
                    }
                }
            }

            let generated = desc
                .generated_key()
                .is_some_and(|gk| arena.get(cs.entity).scalar(gk).is_null());
            let key = if generated {
                Vec::new()
            } else {
                arena
                    .key_with(cs.entity, &pending.keys)
                    .ok_or_else(|| unknown_key(arena, cs.entity))?
            };
            grouper.push(
                desc,
                columns,
                generated,
                cs.entity,
                BatchRow {
                    key,
                    values,
                    expected_version: None,
                },
            );
        }
        Ok(grouper.finish())
    }

    fn fixup_groups(
        &self,
        arena: &EntityArena,
        fixups: &[DeferredForeignKey],
        pending: &PendingWrites,
    ) -> Result<Vec<Group>> {
        let mut grouper = Grouper::default();
        for fixup in fixups {
            let entity = arena.get(fixup.entity);
            let prop = entity.descriptor.property_at(fixup.property);
            let columns: Vec<String> = prop.columns().into_iter().map(str::to_string).collect();
            let values = resolve_fk(
                arena,
                fixup.entity,
                &prop.name,
                entity.reference(fixup.property),
                columns.len(),
                &pending.keys,
            )?;
            let key = arena
                .key_with(fixup.entity, &pending.keys)
                .ok_or_else(|| unknown_key(arena, fixup.entity))?;
            grouper.push(
                &entity.descriptor,
                columns,
                false,
                fixup.entity,
                BatchRow {
                    key,
                    values,
                    expected_version: None,
                },
            );
        }
        Ok(grouper.finish())
    }

    fn update_groups(
        &self,
        arena: &EntityArena,
        plan: &FlushPlan,
        pending: &mut PendingWrites,
    ) -> Result<Vec<Group>> {
        let mut grouper = Grouper::default();
        for &i in &plan.updates {
            let cs = &plan.change_sets[i];
            let desc = &cs.descriptor;
            let mut columns = Vec::new();
            let mut values = Vec::new();
            for change in &cs.changes {
                let prop = desc.property_at(change.index);
                match &change.value {
                    ChangeValue::Scalar(v) => {
                        columns.extend(prop.columns().into_iter().map(str::to_string));
                        values.push(v.clone());
                    }
                    ChangeValue::Reference(r) => {
                        let fk_columns = prop.columns();
                        let fk = resolve_fk(
                            arena,
                            cs.entity,
                            &prop.name,
                            r,
                            fk_columns.len(),
                            &pending.keys,
                        )?;
                        columns.extend(fk_columns.into_iter().map(str::to_string));
                        values.extend(fk);
                    }
                }
            }

            let expected_version = if let Some(version_column) = desc.version_column() {
                let next = next_version(cs)?;
                columns.push(version_column.to_string());
                values.push(next.clone());
                pending.versions.insert(cs.entity, next);
                Some(cs.version.clone().unwrap_or(Value::Null))
            } else {
                None
            };

            let key = cs
                .primary_key
                .clone()
                .ok_or_else(|| unknown_key(arena, cs.entity))?;
            grouper.push(
                desc,
                columns,
                false,
                cs.entity,
                BatchRow {
                    key,
                    values,
                    expected_version,
                },
            );
        }
        Ok(grouper.finish())
    }

    fn null_out_groups(&self, plan: &FlushPlan) -> Result<Vec<Group>> {
        let deletes: HashMap<EntityHandle, &ChangeSet> =
            plan.deletes().map(|cs| (cs.entity, cs)).collect();
        let mut grouper = Grouper::default();
        for null_out in &plan.cycle_null_outs {
            let Some(cs) = deletes.get(&null_out.entity) else {
                continue;
            };
            let prop = cs.descriptor.property_at(null_out.property);
            let columns: Vec<String> = prop.columns().into_iter().map(str::to_string).collect();
            let key = cs.primary_key.clone().ok_or_else(|| {
                Error::Custom(format!("removed {} has no primary key", cs.entity_type()))
            })?;
            let values = vec![Value::Null; columns.len()];
            grouper.push(
                &cs.descriptor,
                columns,
                false,
                cs.entity,
                BatchRow {
                    key,
                    values,
                    expected_version: versioned_expectation(cs),
                },
            );
        }
        Ok(grouper.finish())
    }

    /// Split a group into batches, execute them and record their effects.
    async fn execute_group(
        &self,
        cx: &Cx,
        kind: ChangeKind,
        purpose: BatchPurpose,
        group: Group,
        pending: &mut PendingWrites,
    ) -> Outcome<(), Error> {
        let single_row = group.generated
            && (!self.options.dialect.supports_returning() || group.columns.is_empty());
        let chunk_size = if single_row || (kind == ChangeKind::Create && group.columns.is_empty()) {
            1
        } else {
            self.options.max_batch_rows.max(1)
        };

        for (entities, rows) in group
            .entities
            .chunks(chunk_size)
            .zip(group.rows.chunks(chunk_size))
        {
            let batch = self.render(kind, purpose, &group, rows.to_vec());
            let mut context = EntityContext::new(group.descriptor.name()).with_operation(kind);
            if let [row] = rows {
                if !row.key.is_empty() {
                    context = context.with_key(row.key.clone());
                }
            }

            let result = match self.run(cx, &batch, context.clone()).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            pending.result.batches += 1;

            if let Err(e) = self.check_result(&batch, &result, context, entities, pending) {
                return Outcome::Err(e);
            }
            match purpose {
                BatchPurpose::Insert => pending.result.inserted += rows.len(),
                BatchPurpose::Update => pending.result.updated += rows.len(),
                BatchPurpose::Delete => pending.result.deleted += rows.len(),
                BatchPurpose::CycleFixup | BatchPurpose::CycleNullOut => {}
            }
        }
        Outcome::Ok(())
    }

    /// Execute one batch, attaching entity context and SQL to failures.
    async fn run(
        &self,
        cx: &Cx,
        batch: &StatementBatch,
        context: EntityContext,
    ) -> Outcome<BatchResult, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        tracing::debug!(
            entity = %batch.entity_type,
            purpose = ?batch.purpose,
            rows = batch.row_count(),
            "Executing statement batch"
        );
        tracing::trace!(sql = %batch.sql, params = batch.params.len(), "Batch SQL");

        match self.store.execute_batch(cx, batch).await {
            Outcome::Ok(result) => Outcome::Ok(result),
            Outcome::Err(e) => {
                let e = e.in_statement(context, &batch.sql);
                tracing::warn!(error = %e, "Statement batch failed");
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn check_result(
        &self,
        batch: &StatementBatch,
        result: &BatchResult,
        context: EntityContext,
        entities: &[EntityHandle],
        pending: &mut PendingWrites,
    ) -> Result<()> {
        let expected = batch.rows.len() as u64;

        if !batch.returning.is_empty() {
            if result.generated_keys.len() != batch.rows.len() {
                return Err(Error::Statement(StatementError {
                    context,
                    sql: Some(batch.sql.clone()),
                    sqlstate: None,
                    message: format!(
                        "store returned {} generated keys for {} inserted rows",
                        result.generated_keys.len(),
                        batch.rows.len()
                    ),
                    source: None,
                }));
            }
            for (entity, key) in entities.iter().zip(&result.generated_keys) {
                let Some(value) = key.first() else {
                    return Err(Error::Statement(StatementError {
                        context,
                        sql: Some(batch.sql.clone()),
                        sqlstate: None,
                        message: "store returned an empty generated key".to_string(),
                        source: None,
                    }));
                };
                pending.keys.insert(*entity, value.clone());
            }
        }

        if batch.kind != ChangeKind::Create {
            let versioned = batch.rows.iter().any(|r| r.expected_version.is_some());
            if result.affected != expected && (versioned || self.options.strict_row_counts) {
                tracing::warn!(
                    context = %context,
                    expected,
                    actual = result.affected,
                    "Row count mismatch"
                );
                return Err(Error::OptimisticLock(OptimisticLockError {
                    context,
                    sql: batch.sql.clone(),
                    expected_rows: expected,
                    actual_rows: result.affected,
                }));
            }
        }
        Ok(())
    }

    fn render(
        &self,
        kind: ChangeKind,
        purpose: BatchPurpose,
        group: &Group,
        rows: Vec<BatchRow>,
    ) -> StatementBatch {
        let desc = &group.descriptor;
        let returning: Vec<String> = if group.generated {
            desc.key_columns().to_vec()
        } else {
            Vec::new()
        };
        let version_column = desc.version_column().map(str::to_string);

        let mut w = SqlWriter::new(self.options.dialect);
        match kind {
            ChangeKind::Create => render_insert(&mut w, desc, &group.columns, &rows, &returning),
            ChangeKind::Update => render_update(&mut w, desc, &group.columns, &rows),
            ChangeKind::Delete => render_delete(&mut w, desc, &rows),
        }
        let (sql, params) = w.finish();

        StatementBatch {
            kind,
            purpose,
            entity_type: desc.name().to_string(),
            table: desc.table().to_string(),
            key_columns: desc.key_columns().to_vec(),
            columns: group.columns.clone(),
            rows,
            version_column,
            returning,
            sql,
            params,
        }
    }
}

fn delete_groups(plan: &FlushPlan, layer: &[usize]) -> Result<Vec<Group>> {
    let mut grouper = Grouper::default();
    for &i in layer {
        let cs = &plan.change_sets[i];
        let key = cs.primary_key.clone().ok_or_else(|| {
            Error::Custom(format!("removed {} has no primary key", cs.entity_type()))
        })?;
        grouper.push(
            &cs.descriptor,
            Vec::new(),
            false,
            cs.entity,
            BatchRow {
                key,
                values: Vec::new(),
                expected_version: versioned_expectation(cs),
            },
        );
    }
    Ok(grouper.finish())
}

fn versioned_expectation(cs: &ChangeSet) -> Option<Value> {
    cs.descriptor
        .is_versioned()
        .then(|| cs.version.clone().unwrap_or(Value::Null))
}

fn next_version(cs: &ChangeSet) -> Result<Value> {
    match &cs.version {
        None | Some(Value::Null) => Ok(Value::BigInt(1)),
        Some(current) => current.incremented().ok_or_else(|| {
            Error::Custom(format!(
                "version of {} cannot be incremented past {current}",
                cs.entity_type()
            ))
        }),
    }
}

/// FK values written for a reference, one per FK column.
fn resolve_fk(
    arena: &EntityArena,
    holder: EntityHandle,
    property: &str,
    reference: &RelationRef,
    width: usize,
    keys: &TentativeKeys,
) -> Result<Vec<Value>> {
    match arena.foreign_key(reference, keys) {
        ForeignKey::Null => Ok(vec![Value::Null; width]),
        ForeignKey::Known(values) => Ok(values),
        ForeignKey::Pending(target) => Err(Error::Custom(format!(
            "{}.{property} references {} before its key is known",
            arena.describe(holder),
            arena.describe(target)
        ))),
    }
}

fn unknown_key(arena: &EntityArena, entity: EntityHandle) -> Error {
    Error::Custom(format!(
        "primary key of {} is not known",
        arena.describe(entity)
    ))
}

/// Accumulates SQL text and positional parameters.
struct SqlWriter {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn ident(&mut self, name: &str) {
        let quoted = self.dialect.quote_identifier(name);
        self.sql.push_str(&quoted);
    }

    fn param(&mut self, value: Value) {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }

    /// `"a" = $1 AND "b" = $2`
    fn key_match(&mut self, columns: &[String], key: &[Value]) {
        for (i, (column, value)) in columns.iter().zip(key).enumerate() {
            if i > 0 {
                self.push(" AND ");
            }
            self.ident(column);
            self.push(" = ");
            self.param(value.clone());
        }
    }

    /// Key match plus the version predicate, if any.
    fn row_match(&mut self, desc: &EntityDescriptor, row: &BatchRow) {
        self.key_match(desc.key_columns(), &row.key);
        if let (Some(column), Some(expected)) = (desc.version_column(), &row.expected_version) {
            self.push(" AND ");
            self.ident(column);
            if expected.is_null() {
                self.push(" IS NULL");
            } else {
                self.push(" = ");
                self.param(expected.clone());
            }
        }
    }

    /// WHERE clause selecting exactly `rows`.
    fn row_filter(&mut self, desc: &EntityDescriptor, rows: &[BatchRow]) {
        let key_columns = desc.key_columns();
        let versioned = rows.iter().any(|r| r.expected_version.is_some());
        match rows {
            [row] => self.row_match(desc, row),
            _ if key_columns.len() == 1 && !versioned => {
                self.ident(&key_columns[0]);
                self.push(" IN (");
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    if let Some(value) = row.key.first() {
                        self.param(value.clone());
                    }
                }
                self.push(")");
            }
            _ => {
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        self.push(" OR ");
                    }
                    self.push("(");
                    self.row_match(desc, row);
                    self.push(")");
                }
            }
        }
    }

    fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}

/// `INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4) RETURNING id`
fn render_insert(
    w: &mut SqlWriter,
    desc: &EntityDescriptor,
    columns: &[String],
    rows: &[BatchRow],
    returning: &[String],
) {
    w.push("INSERT INTO ");
    w.ident(desc.table());
    if columns.is_empty() {
        w.push(" DEFAULT VALUES");
    } else {
        w.push(" (");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.ident(column);
        }
        w.push(") VALUES ");
        for (r, row) in rows.iter().enumerate() {
            if r > 0 {
                w.push(", ");
            }
            w.push("(");
            for (i, value) in row.values.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.param(value.clone());
            }
            w.push(")");
        }
    }
    if !returning.is_empty() && w.dialect.supports_returning() {
        w.push(" RETURNING ");
        for (i, column) in returning.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.ident(column);
        }
    }
}

/// Single row: `UPDATE t SET a = $1 WHERE id = $2`.
/// Several rows: columns whose value differs per row become
/// `CASE WHEN <key> THEN <value> ... ELSE <column> END`.
fn render_update(w: &mut SqlWriter, desc: &EntityDescriptor, columns: &[String], rows: &[BatchRow]) {
    w.push("UPDATE ");
    w.ident(desc.table());
    w.push(" SET ");
    for (c, column) in columns.iter().enumerate() {
        if c > 0 {
            w.push(", ");
        }
        w.ident(column);
        w.push(" = ");
        let first = rows.first().and_then(|r| r.values.get(c));
        let uniform = rows.iter().all(|r| r.values.get(c) == first);
        match first {
            Some(value) if uniform => w.param(value.clone()),
            _ => {
                w.push("CASE");
                for row in rows {
                    w.push(" WHEN ");
                    w.key_match(desc.key_columns(), &row.key);
                    w.push(" THEN ");
                    w.param(row.values.get(c).cloned().unwrap_or(Value::Null));
                }
                w.push(" ELSE ");
                w.ident(column);
                w.push(" END");
            }
        }
    }
    w.push(" WHERE ");
    w.row_filter(desc, rows);
}

/// `DELETE FROM t WHERE id IN ($1, $2)`, or one predicate per row for
/// composite keys and versioned rows.
fn render_delete(w: &mut SqlWriter, desc: &EntityDescriptor, rows: &[BatchRow]) {
    w.push("DELETE FROM ");
    w.ident(desc.table());
    w.push(" WHERE ");
    w.row_filter(desc, rows);
}
