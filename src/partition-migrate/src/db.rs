// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The interface between the engine and the database it migrates.
//!
//! [`Database`] expresses the engine's needs as semantic operations rather
//! than SQL strings, so that the same phase logic drives both
//! [`PostgresDatabase`](crate::postgres::PostgresDatabase) and the in-memory
//! [`MemDatabase`](crate::mem::MemDatabase) used in tests. Every operation is
//! a single transaction unless documented otherwise.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cutover::{CutoverFailure, CutoverOptions};
use crate::dual_write::DualWriteLink;
use crate::error::DbError;
use crate::plan::MigrationPlan;
use crate::types::{CheckDesc, IdentityKey, IndexDesc, TableDesc, TableName};

/// What a write does when the target already has a row with the same identity
/// key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Keep the existing row. Used by backfill and dual-write, which can both
    /// deliver the same row.
    SkipOnDuplicateIdentity,
    /// Fail the whole write.
    Fail,
}

/// Which table of a migration an operation reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

/// A half-open range of identity keys, `(after, upto]`. `None` is unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchRange {
    pub after: Option<IdentityKey>,
    pub upto: Option<IdentityKey>,
}

impl BatchRange {
    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.after.as_ref().map_or(true, |a| key > a) && self.upto.as_ref().map_or(true, |u| key <= u)
    }
}

/// The outcome of copying one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Source rows read.
    pub scanned: u64,
    /// Rows actually inserted into the target.
    pub copied: u64,
    /// The greatest identity key read, `None` if the batch was empty.
    pub last_key: Option<IdentityKey>,
}

/// Source rows that a condition picked out, with a few of their keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MissingRows {
    pub count: u64,
    /// The smallest matching identity keys, in order.
    pub sample: Vec<IdentityKey>,
}

/// Row count and identity key checksum of one table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub rows: u64,
    pub checksum: i64,
}

/// The build state of an index or check constraint on the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    Missing,
    /// Exists but cannot be relied on: an index whose build did not finish or
    /// whose partitions are not all attached, or a `NOT VALID` check.
    Invalid,
    Valid,
}

/// The text rendering of each column of a row, `None` for NULL.
pub type RowText = Vec<Option<String>>;

/// The transactional command interface of the database being migrated.
#[async_trait]
pub trait Database: Debug + Send + Sync {
    /// Describes an existing table.
    async fn describe_table(&self, table: &TableName) -> Result<TableDesc, DbError>;

    async fn table_exists(&self, table: &TableName) -> Result<bool, DbError>;

    /// Creates the partitioned target and its partitions. Idempotent.
    async fn create_target(&self, plan: &MigrationPlan) -> Result<(), DbError>;

    /// Installs the mirroring trigger described by `link` on the source.
    /// Replaces any previous installation of the same link.
    async fn install_dual_write(
        &self,
        plan: &MigrationPlan,
        link: &DualWriteLink,
    ) -> Result<(), DbError>;

    async fn dual_write_installed(
        &self,
        plan: &MigrationPlan,
        link: &DualWriteLink,
    ) -> Result<bool, DbError>;

    /// Removes the mirroring trigger. Removing one that is absent succeeds.
    async fn remove_dual_write(
        &self,
        plan: &MigrationPlan,
        link: &DualWriteLink,
    ) -> Result<(), DbError>;

    /// Copies up to `limit` source rows in `range`, in identity key order,
    /// into the target.
    async fn copy_batch(
        &self,
        plan: &MigrationPlan,
        range: &BatchRange,
        limit: usize,
        conflict: ConflictPolicy,
    ) -> Result<BatchResult, DbError>;

    /// The greatest identity key in the source.
    async fn max_key(&self, plan: &MigrationPlan) -> Result<Option<IdentityKey>, DbError>;

    /// Up to `parts - 1` source keys, in order, that split `(None, upto]` into
    /// ranges of roughly equal size.
    async fn split_points(
        &self,
        plan: &MigrationPlan,
        upto: Option<&IdentityKey>,
        parts: usize,
    ) -> Result<Vec<IdentityKey>, DbError>;

    /// Source rows with no row of the same identity in the target.
    async fn missing_from_target(
        &self,
        plan: &MigrationPlan,
        sample_limit: usize,
    ) -> Result<MissingRows, DbError>;

    /// Source rows whose partition key no partition of the plan accepts.
    async fn count_unroutable(
        &self,
        plan: &MigrationPlan,
        sample_limit: usize,
    ) -> Result<MissingRows, DbError>;

    /// Summaries of source and target, taken from the same snapshot.
    async fn summarize(
        &self,
        plan: &MigrationPlan,
    ) -> Result<(TableSummary, TableSummary), DbError>;

    /// Up to `n` identity keys spread over the source.
    async fn sample_keys(&self, plan: &MigrationPlan, n: usize)
        -> Result<Vec<IdentityKey>, DbError>;

    /// The rows of one side with the given identity keys. Keys without a row
    /// are absent from the result.
    async fn fetch_rows(
        &self,
        plan: &MigrationPlan,
        side: Side,
        keys: &[IdentityKey],
    ) -> Result<BTreeMap<IdentityKey, RowText>, DbError>;

    async fn index_state(
        &self,
        plan: &MigrationPlan,
        index: &IndexDesc,
    ) -> Result<ObjectState, DbError>;

    /// Builds `index` on the target without blocking writes, then attaches
    /// the per-partition builds to it. Picks up after a partial earlier build.
    /// Not a single transaction.
    ///
    /// The invalid parent index briefly takes a lock writers queue behind;
    /// waiting for it is bounded by `lock_timeout`.
    async fn build_index(
        &self,
        plan: &MigrationPlan,
        index: &IndexDesc,
        lock_timeout: Duration,
        statement_timeout: Duration,
    ) -> Result<(), DbError>;

    async fn check_state(
        &self,
        plan: &MigrationPlan,
        check: &CheckDesc,
    ) -> Result<ObjectState, DbError>;

    /// Adds `check` to the target without checking existing rows. The
    /// catalog-only exclusive lock this takes is waited for at most
    /// `lock_timeout`.
    async fn add_check_not_valid(
        &self,
        plan: &MigrationPlan,
        check: &CheckDesc,
        lock_timeout: Duration,
    ) -> Result<(), DbError>;

    /// The smallest identity key of a target row that violates `check`.
    async fn first_check_violation(
        &self,
        plan: &MigrationPlan,
        check: &CheckDesc,
    ) -> Result<Option<IdentityKey>, DbError>;

    /// Validates a `NOT VALID` check against existing rows. Fails with an error
    /// for which [`DbError::is_check_violation`] holds if some row violates it.
    async fn validate_check(
        &self,
        plan: &MigrationPlan,
        check: &CheckDesc,
        statement_timeout: Duration,
    ) -> Result<(), DbError>;

    /// The atomic swap. On error nothing has changed.
    async fn cutover(
        &self,
        plan: &MigrationPlan,
        link: &DualWriteLink,
        options: &CutoverOptions,
    ) -> Result<(), CutoverFailure>;

    /// Whether the swap performed by [`Database::cutover`] is visible.
    async fn cutover_applied(&self, plan: &MigrationPlan) -> Result<bool, DbError>;

    /// A cheap estimate of a table's row count.
    async fn estimate_rows(&self, table: &TableName) -> Result<u64, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datum;

    #[test]
    fn batch_range_is_half_open() {
        let key = |i| IdentityKey(vec![Datum::Int(i)]);
        let range = BatchRange {
            after: Some(key(1)),
            upto: Some(key(3)),
        };
        assert!(!range.contains(&key(1)));
        assert!(range.contains(&key(2)));
        assert!(range.contains(&key(3)));
        assert!(!range.contains(&key(4)));
        assert!(BatchRange::default().contains(&key(-5)));
    }
}
