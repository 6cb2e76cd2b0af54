// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory implementation of [Database], for tests.
//!
//! The model is small but keeps the properties the engine relies on: every
//! operation is a transaction (it runs against a copy of the catalog that only
//! replaces the original on success), inserts fire mirroring triggers inside
//! the inserting transaction, partitioned tables route rows by their bounds,
//! and primary keys and checks are enforced. Every lock an engine operation
//! would take is recorded, and failures can be injected at the points the
//! engine has to survive.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::cutover::{CutoverFailure, CutoverOptions, CutoverStep};
use crate::db::{
    BatchRange, BatchResult, ConflictPolicy, Database, MissingRows, ObjectState, RowText, Side,
    TableSummary,
};
use crate::dual_write::DualWriteLink;
use crate::error::DbError;
use crate::plan::{MigrationPlan, PartitionBound};
use crate::types::{
    CheckDesc, CheckPredicate, ColumnDesc, ColumnType, Datum, IdentityKey, IndexDesc, Row,
    SequenceDesc, TableDesc, TableName,
};

/// Table lock modes, weakest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    AccessShare,
    RowExclusive,
    ShareUpdateExclusive,
    Share,
    ShareRowExclusive,
    AccessExclusive,
}

impl LockMode {
    /// Whether this mode blocks plain inserts, updates and deletes.
    pub fn blocks_writes(&self) -> bool {
        *self >= LockMode::Share
    }
}

/// A lock taken by an engine operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub table: TableName,
    pub mode: LockMode,
    /// Whether the lock was held while reading the table's rows, as opposed to
    /// only for a catalog change.
    pub scans_rows: bool,
    /// How long the operation was willing to wait for the lock.
    pub wait_limit: Option<Duration>,
}

#[derive(Clone, Debug)]
struct Partitioning {
    key: usize,
    bounds: Vec<PartitionBound>,
    default: Option<TableName>,
}

impl Partitioning {
    fn route(&self, value: &Datum) -> Option<&TableName> {
        self.bounds
            .iter()
            .find(|b| b.contains(value))
            .map(|b| &b.name)
            .or(self.default.as_ref())
    }

    fn tables(&self) -> impl Iterator<Item = &TableName> {
        self.bounds
            .iter()
            .map(|b| &b.name)
            .chain(self.default.iter())
    }
}

#[derive(Clone, Debug)]
struct MemIndex {
    columns: Vec<String>,
    unique: bool,
    valid: bool,
    /// The parent index this partition index is attached to.
    attached_to: Option<String>,
}

#[derive(Clone, Debug)]
struct MemCheck {
    predicate: CheckPredicate,
    validated: bool,
}

#[derive(Clone, Debug)]
struct MemTable {
    name: TableName,
    columns: Vec<ColumnDesc>,
    primary_key: Vec<String>,
    /// Rows by primary key, or by insertion order for tables without one.
    rows: BTreeMap<IdentityKey, Row>,
    next_ordinal: i64,
    partitioning: Option<Partitioning>,
    indexes: BTreeMap<String, MemIndex>,
    checks: BTreeMap<String, MemCheck>,
}

impl MemTable {
    fn new(name: TableName, columns: Vec<ColumnDesc>, primary_key: Vec<String>) -> Self {
        MemTable {
            name,
            columns,
            primary_key,
            rows: BTreeMap::new(),
            next_ordinal: 0,
            partitioning: None,
            indexes: BTreeMap::new(),
            checks: BTreeMap::new(),
        }
    }

    fn position(&self, column: &str) -> Result<usize, DbError> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| {
                DbError::Other(anyhow!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    column,
                    self.name
                ))
            })
    }

    fn row_key(&mut self, row: &Row) -> Result<IdentityKey, DbError> {
        if self.primary_key.is_empty() {
            self.next_ordinal += 1;
            return Ok(IdentityKey(vec![Datum::Int(self.next_ordinal)]));
        }
        let mut key = Vec::with_capacity(self.primary_key.len());
        for column in &self.primary_key {
            key.push(row[self.position(column)?].clone());
        }
        Ok(IdentityKey(key))
    }

    fn check_row(&self, row: &Row) -> Result<(), DbError> {
        if row.len() != self.columns.len() {
            return Err(DbError::Other(anyhow!(
                "INSERT into \"{}\" has {} values for {} columns",
                self.name,
                row.len(),
                self.columns.len()
            )));
        }
        for (column, datum) in self.columns.iter().zip(row) {
            if datum.is_null() && !column.nullable {
                return Err(DbError::Other(anyhow!(
                    "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                    column.name,
                    self.name
                )));
            }
            let typed = matches!(column.ty, ColumnType::Other(_)) || datum.fits(&column.ty);
            if !typed {
                return Err(DbError::Other(anyhow!(
                    "value {} is not a valid {} for column \"{}\"",
                    datum,
                    column.ty,
                    column.name
                )));
            }
        }
        for (name, check) in &self.checks {
            if !check_holds(&check.predicate, &self.columns, row) {
                return Err(DbError::Other(anyhow!(
                    "new row for relation \"{}\" violates check constraint \"{}\"",
                    self.name,
                    name
                )));
            }
        }
        Ok(())
    }
}

fn check_holds(predicate: &CheckPredicate, columns: &[ColumnDesc], row: &Row) -> bool {
    let value = |column: &str| {
        columns
            .iter()
            .position(|c| c.name == column)
            .map(|i| &row[i])
    };
    match predicate {
        CheckPredicate::NotNull { column } => value(column.as_str()).map_or(true, |v| !v.is_null()),
        // Like SQL, a comparison with NULL does not violate the check.
        CheckPredicate::Compare { column, op, value: rhs } => match value(column.as_str()) {
            Some(v) if !v.is_null() => op.apply(v, rhs),
            _ => true,
        },
        // Arbitrary SQL is beyond this model.
        CheckPredicate::Sql(_) => true,
    }
}

#[derive(Clone, Debug)]
struct MemTrigger {
    table: TableName,
    name: String,
    function: TableName,
    target: TableName,
    columns: Vec<(String, String)>,
    conflict: ConflictPolicy,
}

#[derive(Clone, Debug, Default)]
struct MemCatalog {
    tables: BTreeMap<TableName, MemTable>,
    triggers: Vec<MemTrigger>,
    /// Sequence to owning (table, column).
    sequences: BTreeMap<TableName, Option<(TableName, String)>>,
}

impl MemCatalog {
    fn table(&self, name: &TableName) -> Result<&MemTable, DbError> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::Other(anyhow!("relation \"{}\" does not exist", name)))
    }

    fn table_mut(&mut self, name: &TableName) -> Result<&mut MemTable, DbError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::Other(anyhow!("relation \"{}\" does not exist", name)))
    }

    /// All rows of a table, including those of its partitions.
    fn scan(&self, name: &TableName) -> Result<Vec<Row>, DbError> {
        let table = self.table(name)?;
        match &table.partitioning {
            None => Ok(table.rows.values().cloned().collect()),
            Some(p) => {
                let mut rows = vec![];
                for partition in p.tables() {
                    rows.extend(self.scan(partition)?);
                }
                Ok(rows)
            }
        }
    }

    /// Inserts a row, routing it through partitions and firing triggers.
    /// Returns whether a row was inserted.
    fn insert(
        &mut self,
        name: &TableName,
        row: Row,
        conflict: ConflictPolicy,
        fire_triggers: bool,
    ) -> Result<bool, DbError> {
        let table = self.table(name)?;
        table.check_row(&row)?;
        if let Some(p) = &table.partitioning {
            let partition = p.route(&row[p.key]).cloned().ok_or_else(|| {
                DbError::Other(anyhow!(
                    "no partition of relation \"{}\" found for row",
                    name
                ))
            })?;
            let inserted = self.insert(&partition, row.clone(), conflict, false)?;
            if inserted && fire_triggers {
                self.fire_triggers(name, &row)?;
            }
            return Ok(inserted);
        }

        let table = self.table_mut(name)?;
        let key = table.row_key(&row)?;
        if table.rows.contains_key(&key) {
            return match conflict {
                ConflictPolicy::SkipOnDuplicateIdentity => Ok(false),
                ConflictPolicy::Fail => Err(DbError::Other(anyhow!(
                    "duplicate key value {} violates unique constraint on \"{}\"",
                    key,
                    name
                ))),
            };
        }
        table.rows.insert(key, row.clone());
        if fire_triggers {
            self.fire_triggers(name, &row)?;
        }
        Ok(true)
    }

    fn fire_triggers(&mut self, name: &TableName, row: &Row) -> Result<(), DbError> {
        let triggers: Vec<MemTrigger> = self
            .triggers
            .iter()
            .filter(|t| &t.table == name)
            .cloned()
            .collect();
        for trigger in triggers {
            let source = self.table(name)?;
            let target = self.table(&trigger.target)?;
            let mut mirrored = vec![Datum::Null; target.columns.len()];
            for (from, to) in &trigger.columns {
                mirrored[target.position(to)?] = row[source.position(from)?].clone();
            }
            self.insert(&trigger.target, mirrored, trigger.conflict, true)?;
        }
        Ok(())
    }

    fn rename_table(&mut self, from: &TableName, to: &TableName) -> Result<(), DbError> {
        if self.tables.contains_key(to) {
            return Err(DbError::Other(anyhow!("relation \"{}\" already exists", to)));
        }
        let mut table = self
            .tables
            .remove(from)
            .ok_or_else(|| DbError::Other(anyhow!("relation \"{}\" does not exist", from)))?;
        table.name = to.clone();
        self.tables.insert(to.clone(), table);
        for trigger in &mut self.triggers {
            if &trigger.table == from {
                trigger.table = to.clone();
            }
        }
        for (table, _) in self.sequences.values_mut().flatten() {
            if table == from {
                *table = to.clone();
            }
        }
        Ok(())
    }

    fn keyed_rows(
        &self,
        plan: &MigrationPlan,
        table: &TableName,
    ) -> Result<BTreeMap<IdentityKey, Row>, DbError> {
        let positions = plan.identity_positions();
        Ok(self
            .scan(table)?
            .into_iter()
            .map(|row| {
                let key = IdentityKey(positions.iter().map(|i| row[*i].clone()).collect());
                (key, row)
            })
            .collect())
    }

    fn summary(&self, plan: &MigrationPlan, table: &TableName) -> Result<TableSummary, DbError> {
        let rows = self.keyed_rows(plan, table)?;
        let checksum = rows.keys().fold(0i64, |acc, key| {
            let hash = seahash::hash(key.to_text().as_bytes());
            acc.wrapping_add(i64::from_ne_bytes(hash.to_ne_bytes()))
        });
        Ok(TableSummary {
            rows: u64::try_from(rows.len()).unwrap_or(u64::MAX),
            checksum,
        })
    }
}

#[derive(Debug, Default)]
struct Failpoints {
    cutover_step: Option<CutoverStep>,
    copy_failures: u32,
    index_build_failures: u32,
    lock_wait_failures: u32,
}

#[derive(Debug, Default)]
struct MemCore {
    catalog: MemCatalog,
    failpoints: Failpoints,
    locks: Vec<LockRecord>,
}

impl MemCore {
    fn lock(&mut self, table: &TableName, mode: LockMode, scans_rows: bool) {
        self.locks.push(LockRecord {
            table: table.clone(),
            mode,
            scans_rows,
            wait_limit: None,
        });
    }

    /// Records a catalog-only lock taken under `lock_timeout`. Fails like a
    /// lock wait that ran out if a failure is pending.
    fn lock_bounded(
        &mut self,
        table: &TableName,
        mode: LockMode,
        lock_timeout: Duration,
    ) -> Result<(), DbError> {
        if self.failpoints.lock_wait_failures > 0 {
            self.failpoints.lock_wait_failures -= 1;
            return Err(DbError::Unavailable(format!(
                "canceling statement due to lock timeout on \"{}\"",
                table
            )));
        }
        self.locks.push(LockRecord {
            table: table.clone(),
            mode,
            scans_rows: false,
            wait_limit: Some(lock_timeout),
        });
        Ok(())
    }
}

type Hook = Box<dyn FnMut(&MemDatabase) + Send>;

/// An in-memory implementation of [Database].
#[derive(Clone, Default)]
pub struct MemDatabase {
    core: Arc<Mutex<MemCore>>,
    before_copy: Arc<Mutex<Option<Hook>>>,
    before_validate: Arc<Mutex<Option<Hook>>>,
}

impl std::fmt::Debug for MemDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDatabase").finish_non_exhaustive()
    }
}

impl MemDatabase {
    pub fn new() -> Self {
        MemDatabase::default()
    }

    fn core(&self) -> MutexGuard<'_, MemCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` against a copy of the catalog, keeping the copy only if `f`
    /// succeeds.
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut MemCatalog, &mut Vec<LockRecord>) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let mut core = self.core();
        let mut tx = core.catalog.clone();
        let res = f(&mut tx, &mut core.locks)?;
        core.catalog = tx;
        Ok(res)
    }

    /// Creates a plain table, with the indexes, checks and owned sequences
    /// named in `desc`.
    pub fn create_table(&self, desc: TableDesc) -> Result<(), DbError> {
        self.transact(|catalog, _| {
            if catalog.tables.contains_key(&desc.name) {
                return Err(DbError::Other(anyhow!(
                    "relation \"{}\" already exists",
                    desc.name
                )));
            }
            let mut table = MemTable::new(desc.name.clone(), desc.columns, desc.primary_key);
            for index in desc.indexes {
                table.indexes.insert(
                    index.name,
                    MemIndex {
                        columns: index.columns,
                        unique: index.unique,
                        valid: true,
                        attached_to: None,
                    },
                );
            }
            for check in desc.checks {
                table.checks.insert(
                    check.name,
                    MemCheck {
                        predicate: check.predicate,
                        validated: true,
                    },
                );
            }
            for SequenceDesc { name, column } in desc.sequences {
                catalog
                    .sequences
                    .insert(name, Some((desc.name.clone(), column)));
            }
            catalog.tables.insert(desc.name, table);
            Ok(())
        })
    }

    /// Inserts a row as an application would, firing triggers.
    pub fn insert(&self, table: &TableName, row: Row) -> Result<(), DbError> {
        self.transact(|catalog, _| {
            catalog
                .insert(table, row, ConflictPolicy::Fail, true)
                .map(|_| ())
        })
    }

    /// Inserts a row without firing triggers, like a transaction that started
    /// before dual-write was enabled and commits after.
    pub fn insert_bypassing_triggers(&self, table: &TableName, row: Row) -> Result<(), DbError> {
        self.transact(|catalog, _| {
            catalog
                .insert(table, row, ConflictPolicy::Fail, false)
                .map(|_| ())
        })
    }

    /// All rows of a table (including its partitions'), ordered by primary key
    /// within each partition.
    pub fn rows(&self, table: &TableName) -> Result<Vec<Row>, DbError> {
        self.core().catalog.scan(table)
    }

    pub fn table_names(&self) -> Vec<TableName> {
        self.core().catalog.tables.keys().cloned().collect()
    }

    pub fn is_partitioned(&self, table: &TableName) -> bool {
        self.core()
            .catalog
            .tables
            .get(table)
            .map_or(false, |t| t.partitioning.is_some())
    }

    pub fn trigger_names(&self, table: &TableName) -> Vec<String> {
        self.core()
            .catalog
            .triggers
            .iter()
            .filter(|t| &t.table == table)
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn sequence_owner(&self, sequence: &TableName) -> Option<(TableName, String)> {
        self.core().catalog.sequences.get(sequence).cloned().flatten()
    }

    /// Locks taken by engine operations so far.
    pub fn lock_log(&self) -> Vec<LockRecord> {
        self.core().locks.clone()
    }

    pub fn clear_lock_log(&self) {
        self.core().locks.clear();
    }

    /// Makes the cutover transaction fail at `step`, or stops doing so.
    pub fn fail_cutover_at(&self, step: Option<CutoverStep>) {
        self.core().failpoints.cutover_step = step;
    }

    /// Makes the next `n` batch copies fail with a transient error.
    pub fn fail_next_copies(&self, n: u32) {
        self.core().failpoints.copy_failures = n;
    }

    /// Makes the next `n` partition index builds fail after creating an
    /// invalid index, like an interrupted `CREATE INDEX CONCURRENTLY`.
    pub fn fail_next_index_builds(&self, n: u32) {
        self.core().failpoints.index_build_failures = n;
    }

    /// Makes the next `n` lock waits bounded by a lock timeout run out.
    pub fn fail_next_lock_waits(&self, n: u32) {
        self.core().failpoints.lock_wait_failures = n;
    }

    /// Runs `hook` before every batch copy, outside of any transaction.
    pub fn before_copy_batch(&self, hook: impl FnMut(&MemDatabase) + Send + 'static) {
        *self.before_copy.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    /// Runs `hook` before every check validation, after the scan for the
    /// first violating row.
    pub fn before_validate_check(&self, hook: impl FnMut(&MemDatabase) + Send + 'static) {
        *self.before_validate.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    fn run_hook(&self, slot: &Mutex<Option<Hook>>) {
        let hook = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut hook) = hook {
            hook(self);
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn side<'a>(plan: &'a MigrationPlan, side: Side) -> &'a TableName {
        match side {
            Side::Source => &plan.source,
            Side::Target => &plan.target,
        }
    }
}

#[async_trait]
impl Database for MemDatabase {
    async fn describe_table(&self, table: &TableName) -> Result<TableDesc, DbError> {
        let core = self.core();
        let t = core.catalog.table(table)?;
        let mut desc = TableDesc::new(t.name.clone(), t.columns.clone(), t.primary_key.clone());
        desc.indexes = t
            .indexes
            .iter()
            .map(|(name, index)| IndexDesc {
                name: name.clone(),
                columns: index.columns.clone(),
                unique: index.unique,
            })
            .collect();
        desc.checks = t
            .checks
            .iter()
            .map(|(name, check)| CheckDesc {
                name: name.clone(),
                predicate: check.predicate.clone(),
            })
            .collect();
        desc.sequences = core
            .catalog
            .sequences
            .iter()
            .filter_map(|(seq, owner)| match owner {
                Some((owner, column)) if owner == table => Some(SequenceDesc {
                    name: seq.clone(),
                    column: column.clone(),
                }),
                _ => None,
            })
            .collect();
        desc.partition_key = t
            .partitioning
            .as_ref()
            .map(|p| t.columns[p.key].name.clone());
        Ok(desc)
    }

    async fn table_exists(&self, table: &TableName) -> Result<bool, DbError> {
        Ok(self.core().catalog.tables.contains_key(table))
    }

    async fn create_target(&self, plan: &MigrationPlan) -> Result<(), DbError> {
        self.transact(|catalog, _| {
            if !catalog.tables.contains_key(&plan.target) {
                let key = plan.partition_key_position().ok_or_else(|| {
                    DbError::Other(anyhow!("unknown partition key {}", plan.partition_key))
                })?;
                let mut parent =
                    MemTable::new(plan.target.clone(), plan.columns.clone(), plan.identity.clone());
                parent.partitioning = Some(Partitioning {
                    key,
                    bounds: plan.partitions.clone(),
                    default: plan.default_partition.clone(),
                });
                catalog.tables.insert(plan.target.clone(), parent);
            }
            for partition in plan.partition_tables() {
                if !catalog.tables.contains_key(partition) {
                    catalog.tables.insert(
                        partition.clone(),
                        MemTable::new(
                            partition.clone(),
                            plan.columns.clone(),
                            plan.identity.clone(),
                        ),
                    );
                }
            }
            Ok(())
        })
    }

    async fn install_dual_write(
        &self,
        plan: &MigrationPlan,
        link: &DualWriteLink,
    ) -> Result<(), DbError> {
        self.transact(|catalog, locks| {
            catalog.table(&plan.source)?;
            catalog.table(&plan.target)?;
            locks.push(LockRecord {
                table: plan.source.clone(),
                mode: LockMode::ShareRowExclusive,
                scans_rows: false,
                wait_limit: None,
            });
            catalog
                .triggers
                .retain(|t| !(t.table == plan.source && t.name == link.trigger));
            catalog.triggers.push(MemTrigger {
                table: plan.source.clone(),
                name: link.trigger.clone(),
                function: link.function.clone(),
                target: plan.target.clone(),
                columns: link.columns.clone(),
                conflict: link.conflict,
            });
            Ok(())
        })
    }

    async fn dual_write_installed(
        &self,
        plan: &MigrationPlan,
        link: &DualWriteLink,
    ) -> Result<bool, DbError> {
        Ok(self
            .core()
            .catalog
            .triggers
            .iter()
            .any(|t| t.table == plan.source && t.name == link.trigger && t.function == link.function))
    }

    async fn remove_dual_write(
        &self,
        plan: &MigrationPlan,
        link: &DualWriteLink,
    ) -> Result<(), DbError> {
        self.transact(|catalog, locks| {
            locks.push(LockRecord {
                table: plan.source.clone(),
                mode: LockMode::AccessExclusive,
                scans_rows: false,
                wait_limit: None,
            });
            catalog
                .triggers
                .retain(|t| !(t.table == plan.source && t.name == link.trigger));
            Ok(())
        })
    }

    async fn copy_batch(
        &self,
        plan: &MigrationPlan,
        range: &BatchRange,
        limit: usize,
        conflict: ConflictPolicy,
    ) -> Result<BatchResult, DbError> {
        self.run_hook(&self.before_copy);
        {
            let mut core = self.core();
            if core.failpoints.copy_failures > 0 {
                core.failpoints.copy_failures -= 1;
                return Err(DbError::Unavailable("connection reset during batch copy".into()));
            }
        }
        self.transact(|catalog, locks| {
            locks.push(LockRecord {
                table: plan.source.clone(),
                mode: LockMode::AccessShare,
                scans_rows: true,
                wait_limit: None,
            });
            locks.push(LockRecord {
                table: plan.target.clone(),
                mode: LockMode::RowExclusive,
                scans_rows: false,
                wait_limit: None,
            });
            let batch: Vec<(IdentityKey, Row)> = catalog
                .keyed_rows(plan, &plan.source)?
                .into_iter()
                .filter(|(key, _)| range.contains(key))
                .take(limit)
                .collect();
            let mut result = BatchResult::default();
            for (key, row) in batch {
                result.scanned += 1;
                if catalog.insert(&plan.target, row, conflict, true)? {
                    result.copied += 1;
                }
                result.last_key = Some(key);
            }
            Ok(result)
        })
    }

    async fn max_key(&self, plan: &MigrationPlan) -> Result<Option<IdentityKey>, DbError> {
        let core = self.core();
        let rows = core.catalog.keyed_rows(plan, &plan.source)?;
        Ok(rows.into_keys().next_back())
    }

    async fn split_points(
        &self,
        plan: &MigrationPlan,
        upto: Option<&IdentityKey>,
        parts: usize,
    ) -> Result<Vec<IdentityKey>, DbError> {
        let core = self.core();
        let keys: Vec<IdentityKey> = core
            .catalog
            .keyed_rows(plan, &plan.source)?
            .into_keys()
            .filter(|k| upto.map_or(true, |u| k <= u))
            .collect();
        if parts <= 1 || keys.len() < 2 {
            return Ok(vec![]);
        }
        let chunk = keys.len().div_ceil(parts);
        Ok((1..parts)
            .filter_map(|i| keys.get(i * chunk - 1))
            .filter(|k| Some(*k) != keys.last())
            .cloned()
            .collect())
    }

    async fn missing_from_target(
        &self,
        plan: &MigrationPlan,
        sample_limit: usize,
    ) -> Result<MissingRows, DbError> {
        let core = self.core();
        let source = core.catalog.keyed_rows(plan, &plan.source)?;
        let target = core.catalog.keyed_rows(plan, &plan.target)?;
        let missing: Vec<&IdentityKey> =
            source.keys().filter(|k| !target.contains_key(*k)).collect();
        Ok(MissingRows {
            count: u64::try_from(missing.len()).unwrap_or(u64::MAX),
            sample: missing.into_iter().take(sample_limit).cloned().collect(),
        })
    }

    async fn count_unroutable(
        &self,
        plan: &MigrationPlan,
        sample_limit: usize,
    ) -> Result<MissingRows, DbError> {
        let Some(key) = plan.partition_key_position() else {
            return Ok(MissingRows::default());
        };
        let core = self.core();
        let unroutable: Vec<IdentityKey> = core
            .catalog
            .keyed_rows(plan, &plan.source)?
            .into_iter()
            .filter(|(_, row)| plan.partition_for(&row[key]).is_none())
            .map(|(k, _)| k)
            .collect();
        Ok(MissingRows {
            count: u64::try_from(unroutable.len()).unwrap_or(u64::MAX),
            sample: unroutable.into_iter().take(sample_limit).collect(),
        })
    }

    async fn summarize(
        &self,
        plan: &MigrationPlan,
    ) -> Result<(TableSummary, TableSummary), DbError> {
        let core = self.core();
        Ok((
            core.catalog.summary(plan, &plan.source)?,
            core.catalog.summary(plan, &plan.target)?,
        ))
    }

    async fn sample_keys(
        &self,
        plan: &MigrationPlan,
        n: usize,
    ) -> Result<Vec<IdentityKey>, DbError> {
        let core = self.core();
        let keys: Vec<IdentityKey> = core
            .catalog
            .keyed_rows(plan, &plan.source)?
            .into_keys()
            .collect();
        if n == 0 {
            return Ok(vec![]);
        }
        let step = (keys.len() / n).max(1);
        Ok(keys.into_iter().step_by(step).take(n).collect())
    }

    async fn fetch_rows(
        &self,
        plan: &MigrationPlan,
        side: Side,
        keys: &[IdentityKey],
    ) -> Result<BTreeMap<IdentityKey, RowText>, DbError> {
        let wanted: BTreeSet<&IdentityKey> = keys.iter().collect();
        let core = self.core();
        Ok(core
            .catalog
            .keyed_rows(plan, Self::side(plan, side))?
            .into_iter()
            .filter(|(k, _)| wanted.contains(k))
            .map(|(k, row)| (k, row.iter().map(Datum::to_text).collect()))
            .collect())
    }

    async fn index_state(
        &self,
        plan: &MigrationPlan,
        index: &IndexDesc,
    ) -> Result<ObjectState, DbError> {
        let core = self.core();
        let target = core.catalog.table(&plan.target)?;
        Ok(match target.indexes.get(&plan.target_index_name(index)) {
            None => ObjectState::Missing,
            Some(i) if i.valid => ObjectState::Valid,
            Some(_) => ObjectState::Invalid,
        })
    }

    async fn build_index(
        &self,
        plan: &MigrationPlan,
        index: &IndexDesc,
        lock_timeout: Duration,
        _statement_timeout: Duration,
    ) -> Result<(), DbError> {
        let parent_name = plan.target_index_name(index);
        let new_index = |valid| MemIndex {
            columns: index.columns.clone(),
            unique: index.unique,
            valid,
            attached_to: None,
        };

        // The invalid parent index, on the parent only.
        {
            let mut core = self.core();
            core.lock_bounded(&plan.target, LockMode::Share, lock_timeout)?;
            core.catalog
                .table_mut(&plan.target)?
                .indexes
                .entry(parent_name.clone())
                .or_insert_with(|| new_index(false));
        }

        for partition in plan.partition_tables() {
            let name = plan.partition_index_name(index, partition);
            let mut core = self.core();
            let existing = core
                .catalog
                .table(partition)?
                .indexes
                .get(&name)
                .map(|i| i.valid);
            if existing == Some(true) {
                continue;
            }
            if existing == Some(false) {
                core.lock(partition, LockMode::ShareUpdateExclusive, false);
                core.catalog.table_mut(partition)?.indexes.remove(&name);
            }
            core.lock(partition, LockMode::ShareUpdateExclusive, true);
            let fail = core.failpoints.index_build_failures > 0;
            if fail {
                core.failpoints.index_build_failures -= 1;
            }
            core.catalog
                .table_mut(partition)?
                .indexes
                .insert(name.clone(), new_index(!fail));
            if fail {
                return Err(DbError::Other(anyhow!(
                    "index build of {} interrupted",
                    name
                )));
            }
        }

        self.transact(|catalog, locks| {
            for partition in plan.partition_tables() {
                let name = plan.partition_index_name(index, partition);
                locks.push(LockRecord {
                    table: partition.clone(),
                    mode: LockMode::ShareUpdateExclusive,
                    scans_rows: false,
                    wait_limit: None,
                });
                if let Some(i) = catalog.table_mut(partition)?.indexes.get_mut(&name) {
                    i.attached_to = Some(parent_name.clone());
                }
            }
            let all_attached = plan.partition_tables().all(|p| {
                catalog.tables.get(p).map_or(false, |t| {
                    t.indexes
                        .values()
                        .any(|i| i.valid && i.attached_to.as_ref() == Some(&parent_name))
                })
            });
            if let Some(parent) = catalog.table_mut(&plan.target)?.indexes.get_mut(&parent_name) {
                parent.valid = all_attached;
            }
            Ok(())
        })
    }

    async fn check_state(
        &self,
        plan: &MigrationPlan,
        check: &CheckDesc,
    ) -> Result<ObjectState, DbError> {
        let core = self.core();
        let target = core.catalog.table(&plan.target)?;
        Ok(match target.checks.get(&plan.target_check_name(check)) {
            None => ObjectState::Missing,
            Some(c) if c.validated => ObjectState::Valid,
            Some(_) => ObjectState::Invalid,
        })
    }

    async fn add_check_not_valid(
        &self,
        plan: &MigrationPlan,
        check: &CheckDesc,
        lock_timeout: Duration,
    ) -> Result<(), DbError> {
        let mut core = self.core();
        core.lock_bounded(&plan.target, LockMode::AccessExclusive, lock_timeout)?;
        core.catalog
            .table_mut(&plan.target)?
            .checks
            .entry(plan.target_check_name(check))
            .or_insert_with(|| MemCheck {
                predicate: check.predicate.clone(),
                validated: false,
            });
        Ok(())
    }

    async fn first_check_violation(
        &self,
        plan: &MigrationPlan,
        check: &CheckDesc,
    ) -> Result<Option<IdentityKey>, DbError> {
        let mut core = self.core();
        core.lock(&plan.target, LockMode::AccessShare, true);
        Ok(core
            .catalog
            .keyed_rows(plan, &plan.target)?
            .into_iter()
            .find(|(_, row)| !check_holds(&check.predicate, &plan.columns, row))
            .map(|(key, _)| key))
    }

    async fn validate_check(
        &self,
        plan: &MigrationPlan,
        check: &CheckDesc,
        _statement_timeout: Duration,
    ) -> Result<(), DbError> {
        self.run_hook(&self.before_validate);
        let name = plan.target_check_name(check);
        self.transact(|catalog, locks| {
            locks.push(LockRecord {
                table: plan.target.clone(),
                mode: LockMode::ShareUpdateExclusive,
                scans_rows: true,
                wait_limit: None,
            });
            let violated = catalog
                .scan(&plan.target)?
                .iter()
                .any(|row| !check_holds(&check.predicate, &plan.columns, row));
            if violated {
                return Err(DbError::CheckViolation(name.clone()));
            }
            match catalog.table_mut(&plan.target)?.checks.get_mut(&name) {
                Some(c) => {
                    c.validated = true;
                    Ok(())
                }
                None => Err(DbError::Other(anyhow!(
                    "constraint \"{}\" of relation \"{}\" does not exist",
                    name,
                    plan.target
                ))),
            }
        })
    }

    async fn cutover(
        &self,
        plan: &MigrationPlan,
        link: &DualWriteLink,
        options: &CutoverOptions,
    ) -> Result<(), CutoverFailure> {
        let mut core = self.core();
        let fail_at = core.failpoints.cutover_step;
        let check = |step: CutoverStep| match fail_at {
            Some(fail) if fail == step => Err(CutoverFailure::new(
                step,
                DbError::Other(anyhow!("cutover failed at {}", step)),
            )),
            _ => Ok(()),
        };
        let mut tx = core.catalog.clone();

        for table in [&plan.source, &plan.target] {
            core.locks.push(LockRecord {
                table: table.clone(),
                mode: LockMode::AccessExclusive,
                scans_rows: false,
                wait_limit: Some(options.lock_timeout),
            });
        }
        check(CutoverStep::AcquireLocks)?;

        for seq in &plan.sequences {
            let owner = tx.sequences.get_mut(&seq.name).ok_or_else(|| {
                CutoverFailure::new(
                    CutoverStep::RetargetSequences,
                    DbError::Other(anyhow!("sequence \"{}\" does not exist", seq.name)),
                )
            })?;
            *owner = Some((plan.target.clone(), seq.column.clone()));
        }
        check(CutoverStep::RetargetSequences)?;

        tx.triggers
            .retain(|t| !(t.table == plan.source && t.name == link.trigger));
        check(CutoverStep::DropDualWrite)?;

        tx.rename_table(&plan.source, &plan.retired)
            .map_err(|e| CutoverFailure::new(CutoverStep::RenameSource, e))?;
        check(CutoverStep::RenameSource)?;

        tx.rename_table(&plan.target, &plan.source)
            .map_err(|e| CutoverFailure::new(CutoverStep::RenameTarget, e))?;
        check(CutoverStep::RenameTarget)?;

        check(CutoverStep::Commit)?;
        core.catalog = tx;
        Ok(())
    }

    async fn cutover_applied(&self, plan: &MigrationPlan) -> Result<bool, DbError> {
        let core = self.core();
        let tables = &core.catalog.tables;
        Ok(tables.contains_key(&plan.retired)
            && tables.contains_key(&plan.source)
            && !tables.contains_key(&plan.target))
    }

    async fn estimate_rows(&self, table: &TableName) -> Result<u64, DbError> {
        let rows = self.core().catalog.scan(table)?.len();
        Ok(u64::try_from(rows).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{plan, PartitionRequest, RangeSpec};

    fn date(m: u32, d: u32) -> Datum {
        Datum::date(2024, m, d).unwrap()
    }

    fn setup() -> (MemDatabase, MigrationPlan) {
        let desc = TableDesc::new(
            TableName::parse("events"),
            vec![
                ColumnDesc::new("id", ColumnType::Int8, false),
                ColumnDesc::new("created_on", ColumnType::Date, false),
            ],
            vec!["id".into()],
        );
        let db = MemDatabase::new();
        db.create_table(desc.clone()).unwrap();
        let req = PartitionRequest {
            name: "events_by_month".into(),
            target: TableName::parse("events_partitioned"),
            retired: None,
            partition_key: "created_on".into(),
            ranges: RangeSpec::contiguous(&[date(1, 1), date(2, 1), date(3, 1)]),
            default_partition: false,
            identity: Some(vec!["id".into(), "created_on".into()]),
        };
        (db, plan(&desc, &req).unwrap())
    }

    #[tokio::test]
    async fn triggers_mirror_inside_the_inserting_transaction() {
        let (db, plan) = setup();
        db.create_target(&plan).await.unwrap();
        db.install_dual_write(&plan, &DualWriteLink::for_plan(&plan))
            .await
            .unwrap();

        db.insert(&plan.source, vec![Datum::Int(1), date(1, 5)]).unwrap();
        assert_eq!(db.rows(&plan.partitions[0].name).unwrap().len(), 1);

        // Not routable in the target, so the source insert fails too.
        assert!(db
            .insert(&plan.source, vec![Datum::Int(2), date(4, 1)])
            .is_err());
        assert_eq!(db.rows(&plan.source).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_cutover_changes_nothing() {
        let (db, plan) = setup();
        db.create_target(&plan).await.unwrap();
        let link = DualWriteLink::for_plan(&plan);
        db.install_dual_write(&plan, &link).await.unwrap();
        db.fail_cutover_at(Some(CutoverStep::RenameTarget));
        let err = db
            .cutover(&plan, &link, &CutoverOptions {
                lock_timeout: Duration::from_secs(1),
            })
            .await
            .unwrap_err();
        assert_eq!(err.step, CutoverStep::RenameTarget);
        assert!(!db.cutover_applied(&plan).await.unwrap());
        assert_eq!(db.trigger_names(&plan.source), vec![link.trigger.clone()]);
        assert!(db.table_exists(&plan.target).await.unwrap());
    }

    #[tokio::test]
    async fn split_points_divide_the_key_space() {
        let (db, plan) = setup();
        for i in 1..=10 {
            db.insert(&plan.source, vec![Datum::Int(i), date(1, 1)])
                .unwrap();
        }
        let points = db.split_points(&plan, None, 3).await.unwrap();
        let key = |i| IdentityKey(vec![Datum::Int(i), date(1, 1)]);
        assert_eq!(points, vec![key(4), key(8)]);
        assert_eq!(
            db.split_points(&plan, Some(&key(5)), 2).await.unwrap(),
            vec![key(3)]
        );
    }
}
