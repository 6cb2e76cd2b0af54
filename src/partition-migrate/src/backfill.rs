// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Copying of pre-existing source rows into the target.
//!
//! The main pass walks the source in identity key order, in batches, up to the
//! greatest key that existed when it started; anything inserted later is
//! mirrored by dual-write. Every batch inserts with
//! [`ConflictPolicy::SkipOnDuplicateIdentity`] and the cursor is checkpointed
//! after it commits, so a crash at any point is recovered by simply running the
//! backfill again.
//!
//! Rows can still slip through: a transaction that began before dual-write was
//! enabled can commit a row below the cursor afterwards. The reconciliation
//! pass that follows the main pass rescans the whole source to catch those.

use std::time::{Instant, SystemTime};

use futures::stream::{self, StreamExt};
use itertools::Itertools;
use tracing::{debug, info, instrument};

use crate::cfg::{
    ConfigSet, BACKFILL_BATCH_MAX_ATTEMPTS, BACKFILL_BATCH_SIZE, BACKFILL_PARALLELISM,
    BACKFILL_RECONCILIATION_RETRIES,
};
use crate::db::{BatchRange, BatchResult, ConflictPolicy, Database, MissingRows};
use crate::error::{DbError, MigrationError};
use crate::plan::MigrationPlan;
use crate::retry::{retry_transient, Retry};
use crate::state::{BatchCursor, Phase, SyncState};
use crate::store::Checkpointer;
use crate::types::IdentityKey;

/// Keys of still-missing rows reported in errors.
const MISSING_SAMPLE: usize = 10;

#[derive(Clone, Debug)]
pub struct BackfillOptions {
    pub batch_size: usize,
    pub parallelism: usize,
    /// Reconciliation passes beyond the first.
    pub reconciliation_retries: u32,
    pub retry: Retry,
}

impl BackfillOptions {
    pub fn from_config(cfg: &ConfigSet) -> Self {
        BackfillOptions {
            batch_size: BACKFILL_BATCH_SIZE.get(cfg).max(1),
            parallelism: BACKFILL_PARALLELISM.get(cfg).max(1),
            reconciliation_retries: BACKFILL_RECONCILIATION_RETRIES.get(cfg),
            retry: Retry::batch_defaults(SystemTime::now(), BACKFILL_BATCH_MAX_ATTEMPTS.get(cfg)),
        }
    }

    fn is_short(&self, batch: &BatchResult) -> bool {
        batch.scanned < u64::try_from(self.batch_size).unwrap_or(u64::MAX)
    }
}

/// Everything a backfill needs besides the state it advances.
#[derive(Clone, Copy, Debug)]
pub struct BackfillContext<'a> {
    pub db: &'a dyn Database,
    pub plan: &'a MigrationPlan,
    pub checkpoint: &'a Checkpointer,
    pub options: &'a BackfillOptions,
}

impl<'a> BackfillContext<'a> {
    /// Copies one batch of `range`, retrying transient failures.
    async fn copy(&self, range: &BatchRange) -> Result<BatchResult, DbError> {
        let metrics = self.checkpoint.metrics();
        let start = Instant::now();
        let batch = retry_transient(
            "backfill batch",
            self.options.retry.clone(),
            |_| metrics.batch_retries.inc(),
            || {
                self.db.copy_batch(
                    self.plan,
                    range,
                    self.options.batch_size,
                    ConflictPolicy::SkipOnDuplicateIdentity,
                )
            },
        )
        .await?;
        metrics.observe_batch(batch.scanned, batch.copied, start.elapsed());
        Ok(batch)
    }

    /// Copies all of `range`, batch by batch.
    async fn copy_range(&self, mut range: BatchRange) -> Result<BatchResult, MigrationError> {
        let mut total = BatchResult::default();
        loop {
            let batch = self.copy(&range).await?;
            ensure_progress(range.after.as_ref(), &batch)?;
            total.scanned += batch.scanned;
            total.copied += batch.copied;
            if batch.last_key.is_some() {
                total.last_key.clone_from(&batch.last_key);
            }
            if self.options.is_short(&batch) {
                return Ok(total);
            }
            range.after = batch.last_key;
        }
    }
}

/// A batch must end past the key it started after. Otherwise the database
/// orders identity keys differently than [`IdentityKey`] does, and reading on
/// from the cursor would return the same rows forever.
fn ensure_progress(after: Option<&IdentityKey>, batch: &BatchResult) -> Result<(), MigrationError> {
    match (after, &batch.last_key) {
        (Some(after), Some(last)) if last <= after => Err(MigrationError::CursorStalled {
            high_water: after.clone(),
            returned: last.clone(),
        }),
        _ => Ok(()),
    }
}

fn cursor_range(cursor: &BatchCursor) -> BatchRange {
    BatchRange {
        after: cursor.high_water().cloned(),
        upto: cursor.upper_bound().cloned(),
    }
}

/// Copies the next batch after `cursor` and advances it past the rows read.
///
/// Running the same batch twice (with the cursor from before the first run)
/// copies nothing the second time and leaves the cursor where the first run
/// left it.
pub async fn run_batch(
    db: &dyn Database,
    plan: &MigrationPlan,
    cursor: &mut BatchCursor,
    batch_size: usize,
) -> Result<BatchResult, DbError> {
    let batch = db
        .copy_batch(
            plan,
            &cursor_range(cursor),
            batch_size.max(1),
            ConflictPolicy::SkipOnDuplicateIdentity,
        )
        .await?;
    if let Some(key) = &batch.last_key {
        cursor.advance(key.clone());
    }
    Ok(batch)
}

/// Runs (or resumes) the backfill phase through to VERIFYING.
///
/// Fails with [`MigrationError::IncompleteBackfill`], staying in BACKFILLING,
/// if rows are still missing from the target after the configured number of
/// reconciliation passes.
#[instrument(level = "info", skip_all, fields(migration = %cx.plan.name))]
pub async fn run(cx: BackfillContext<'_>, state: &mut SyncState) -> Result<(), MigrationError> {
    begin(cx, state).await?;

    if !state.backfill.main_pass_complete {
        if cx.options.parallelism > 1 {
            main_pass_parallel(cx, state).await?;
        } else {
            main_pass(cx, state).await?;
        }
        state.backfill.main_pass_complete = true;
        state.touch();
        cx.checkpoint.save(cx.plan, state).await?;
        info!(
            rows_copied = state.backfill.rows_copied,
            rows_scanned = state.backfill.rows_scanned,
            "backfill main pass complete"
        );
    }

    let passes = 1 + cx.options.reconciliation_retries;
    let missing = reconcile(cx, state, passes).await?;
    if missing.count > 0 {
        return Err(MigrationError::IncompleteBackfill {
            passes,
            missing: missing.count,
            sample: missing.sample,
        });
    }
    cx.checkpoint.advance(cx.plan, state, Phase::Verifying).await
}

/// Enters BACKFILLING and fixes the main pass upper bound, unless that
/// already happened.
async fn begin(cx: BackfillContext<'_>, state: &mut SyncState) -> Result<(), MigrationError> {
    state.expect_phase("backfill", &[Phase::DualWriteActive, Phase::Backfilling])?;
    if state.dual_write.is_none() {
        return Err(MigrationError::DualWriteMissing);
    }
    if state.phase == Phase::DualWriteActive {
        cx.checkpoint
            .advance(cx.plan, state, Phase::Backfilling)
            .await?;
    }

    if !state.backfill.main_pass_started {
        let upper = retry_transient("max key", cx.options.retry.clone(), |_| {}, || {
            cx.db.max_key(cx.plan)
        })
        .await?;
        info!(upper_bound = ?upper, "starting backfill main pass");
        state.cursor.reset(upper);
        state.backfill.main_pass_started = true;
        state.touch();
        cx.checkpoint.save(cx.plan, state).await?;
    }
    Ok(())
}

/// Copies a single main pass batch and checkpoints the cursor. Returns an
/// empty batch once the main pass is complete.
pub async fn step(
    cx: BackfillContext<'_>,
    state: &mut SyncState,
) -> Result<BatchResult, MigrationError> {
    begin(cx, state).await?;
    if state.backfill.main_pass_complete {
        return Ok(BatchResult::default());
    }
    let batch = if state.cursor.upper_bound().is_some() && !state.cursor.is_exhausted() {
        cx.copy(&cursor_range(&state.cursor)).await?
    } else {
        BatchResult::default()
    };
    ensure_progress(state.cursor.high_water(), &batch)?;
    if let Some(key) = &batch.last_key {
        state.cursor.advance(key.clone());
    }
    state.backfill.rows_scanned += batch.scanned;
    state.backfill.rows_copied += batch.copied;
    if cx.options.is_short(&batch) {
        state.backfill.main_pass_complete = true;
    }
    state.touch();
    cx.checkpoint.save(cx.plan, state).await?;
    Ok(batch)
}

async fn main_pass(cx: BackfillContext<'_>, state: &mut SyncState) -> Result<(), MigrationError> {
    while state.cursor.upper_bound().is_some() && !state.cursor.is_exhausted() {
        let batch = cx.copy(&cursor_range(&state.cursor)).await?;
        ensure_progress(state.cursor.high_water(), &batch)?;
        if let Some(key) = &batch.last_key {
            state.cursor.advance(key.clone());
        }
        state.backfill.rows_scanned += batch.scanned;
        state.backfill.rows_copied += batch.copied;
        state.touch();
        cx.checkpoint.save(cx.plan, state).await?;
        debug!(
            scanned = batch.scanned,
            copied = batch.copied,
            high_water = ?state.cursor.high_water(),
            "backfill batch committed"
        );
        if cx.options.is_short(&batch) {
            break;
        }
    }
    Ok(())
}

/// The main pass over disjoint identity ranges, several at a time.
///
/// Ranges complete out of order, so the durable cursor only moves to the end
/// of the longest prefix of completed ranges. A resumed pass recopies the rest,
/// which is harmless.
async fn main_pass_parallel(
    cx: BackfillContext<'_>,
    state: &mut SyncState,
) -> Result<(), MigrationError> {
    let Some(upto) = state.cursor.upper_bound().cloned() else {
        return Ok(());
    };
    if state.cursor.is_exhausted() {
        return Ok(());
    }
    let after = state.cursor.high_water().cloned();
    let points = retry_transient("split points", cx.options.retry.clone(), |_| {}, || {
        cx.db
            .split_points(cx.plan, Some(&upto), cx.options.parallelism)
    })
    .await?;

    let mut bounds = vec![after.clone()];
    bounds.extend(
        points
            .into_iter()
            .filter(|p| after.as_ref().map_or(true, |a| p > a) && *p < upto)
            .dedup()
            .map(Some),
    );
    let ranges: Vec<BatchRange> = bounds
        .iter()
        .enumerate()
        .map(|(i, start)| BatchRange {
            after: start.clone(),
            upto: bounds.get(i + 1).cloned().unwrap_or_else(|| Some(upto.clone())),
        })
        .collect();
    info!(ranges = ranges.len(), "starting parallel backfill main pass");

    let mut done = vec![false; ranges.len()];
    let mut low_water = 0;
    let mut copies = stream::iter(ranges.iter().cloned().enumerate())
        .map(|(i, range)| async move { cx.copy_range(range).await.map(|total| (i, total)) })
        .buffer_unordered(cx.options.parallelism);
    while let Some(result) = copies.next().await {
        let (i, total) = result?;
        state.backfill.rows_scanned += total.scanned;
        state.backfill.rows_copied += total.copied;
        done[i] = true;
        while low_water < ranges.len() && done[low_water] {
            if let Some(end) = &ranges[low_water].upto {
                state.cursor.advance(end.clone());
            }
            low_water += 1;
        }
        state.touch();
        cx.checkpoint.save(cx.plan, state).await?;
        debug!(
            range = i,
            copied = total.copied,
            low_water = ?state.cursor.high_water(),
            "backfill range complete"
        );
    }
    Ok(())
}

/// Rescans the whole source, copying anything missing from the target, up to
/// `passes` times or until nothing is missing. Returns what is still missing.
pub async fn reconcile(
    cx: BackfillContext<'_>,
    state: &mut SyncState,
    passes: u32,
) -> Result<MissingRows, MigrationError> {
    let mut missing = MissingRows::default();
    for pass in 1..=passes.max(1) {
        let found = cx.copy_range(BatchRange::default()).await?;
        state.backfill.reconciliation_passes += 1;
        state.backfill.stragglers += found.copied;
        state.backfill.rows_copied += found.copied;
        state.touch();
        cx.checkpoint.save(cx.plan, state).await?;
        cx.checkpoint.metrics().stragglers.inc_by(found.copied);

        missing = retry_transient("missing rows", cx.options.retry.clone(), |_| {}, || {
            cx.db.missing_from_target(cx.plan, MISSING_SAMPLE)
        })
        .await?;
        info!(
            migration = %cx.plan.name,
            pass,
            stragglers = found.copied,
            missing = missing.count,
            "reconciliation pass complete"
        );
        if missing.count == 0 {
            break;
        }
    }
    Ok(missing)
}

/// Rewinds the backfill to the start. Rows already copied stay in the target.
pub fn restart(state: &mut SyncState) -> Result<(), MigrationError> {
    state.expect_phase("restart backfill", &[Phase::Backfilling])?;
    state.cursor.reset(None);
    state.backfill.main_pass_started = false;
    state.backfill.main_pass_complete = false;
    state.touch();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datum;

    fn key(id: &str) -> IdentityKey {
        IdentityKey(vec![Datum::Text(id.into())])
    }

    #[test]
    fn batch_that_does_not_move_forward_is_refused() {
        let batch = |last: &str| BatchResult {
            scanned: 1,
            copied: 0,
            last_key: Some(key(last)),
        };
        assert!(ensure_progress(None, &batch("B")).is_ok());
        assert!(ensure_progress(Some(&key("B")), &batch("a")).is_ok());
        assert!(ensure_progress(Some(&key("a")), &BatchResult::default()).is_ok());

        // "a" sorts after "B" bytewise, but a case-insensitive collation
        // returns "B" again.
        match ensure_progress(Some(&key("a")), &batch("B")) {
            Err(MigrationError::CursorStalled { high_water, returned }) => {
                assert_eq!(high_water, key("a"));
                assert_eq!(returned, key("B"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(ensure_progress(Some(&key("a")), &batch("a")).is_err());
    }
}
