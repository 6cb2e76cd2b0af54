// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The atomic swap that makes the target authoritative, and the way back.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cfg::{ConfigSet, CUTOVER_LOCK_TIMEOUT};
use crate::db::Database;
use crate::dual_write;
use crate::error::{DbError, MigrationError};
use crate::plan::MigrationPlan;
use crate::state::{Phase, SyncState};
use crate::store::Checkpointer;
use crate::verify::Gate;

/// The steps of the cutover transaction, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CutoverStep {
    /// Exclusive locks on source and target.
    AcquireLocks,
    /// Owned sequences now belong to the target's columns.
    RetargetSequences,
    /// The mirroring trigger and its function are dropped.
    DropDualWrite,
    /// The source takes its retired name.
    RenameSource,
    /// The target takes the source's name.
    RenameTarget,
    Commit,
}

impl CutoverStep {
    pub fn all() -> [CutoverStep; 6] {
        [
            CutoverStep::AcquireLocks,
            CutoverStep::RetargetSequences,
            CutoverStep::DropDualWrite,
            CutoverStep::RenameSource,
            CutoverStep::RenameTarget,
            CutoverStep::Commit,
        ]
    }
}

impl fmt::Display for CutoverStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CutoverStep::AcquireLocks => "acquire locks",
            CutoverStep::RetargetSequences => "retarget sequences",
            CutoverStep::DropDualWrite => "drop dual-write",
            CutoverStep::RenameSource => "rename source",
            CutoverStep::RenameTarget => "rename target",
            CutoverStep::Commit => "commit",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CutoverOptions {
    /// Upper bound on waiting for the exclusive locks.
    pub lock_timeout: Duration,
}

impl CutoverOptions {
    pub fn from_config(cfg: &ConfigSet) -> Self {
        CutoverOptions {
            lock_timeout: CUTOVER_LOCK_TIMEOUT.get(cfg),
        }
    }
}

/// Why the cutover transaction was rolled back.
#[derive(Debug)]
pub struct CutoverFailure {
    pub step: CutoverStep,
    pub error: DbError,
}

impl CutoverFailure {
    pub fn new(step: CutoverStep, error: impl Into<DbError>) -> Self {
        CutoverFailure {
            step,
            error: error.into(),
        }
    }
}

/// Swaps the target in for the source.
///
/// Requires READY_FOR_CUTOVER and a clean post-restore verification report. On
/// failure the database is unchanged, the migration stays READY_FOR_CUTOVER
/// and the cutover can simply be retried.
#[instrument(level = "info", skip_all, fields(migration = %plan.name))]
pub async fn cutover(
    db: &dyn Database,
    plan: &MigrationPlan,
    state: &mut SyncState,
    checkpoint: &Checkpointer,
    options: &CutoverOptions,
) -> Result<(), MigrationError> {
    state.expect_phase("cutover", &[Phase::ReadyForCutover])?;
    match &state.last_report {
        Some(report) if report.gate == Gate::ConstraintsRestored && report.is_clean() => {}
        Some(report) if report.gate == Gate::ConstraintsRestored => {
            return Err(MigrationError::VerificationFailed(Box::new(report.clone())));
        }
        _ => return Err(MigrationError::NotVerified),
    }

    // Without mirroring the target may be missing writes made since the
    // last verification.
    let Some(link) = state.dual_write.clone() else {
        return Err(MigrationError::DualWriteMissing);
    };
    let metrics = checkpoint.metrics();
    metrics.cutover_attempts.inc();
    let start = Instant::now();
    let result = db.cutover(plan, &link, options).await;
    metrics
        .cutover_seconds
        .observe(start.elapsed().as_secs_f64());
    if let Err(CutoverFailure { step, error }) = result {
        metrics.cutover_aborts.inc();
        warn!(%step, "cutover aborted and reverted: {}", error);
        return Err(MigrationError::CutoverAborted {
            step,
            source: error,
        });
    }

    info!(
        source = %plan.source,
        retired = %plan.retired,
        elapsed = ?start.elapsed(),
        "cutover committed"
    );
    state.dual_write = None;
    checkpoint.advance(plan, state, Phase::CutOver).await
}

/// Completes a cutover that committed in the database but was not recorded,
/// e.g. because the engine crashed in between. Returns whether it did.
pub async fn finalize_if_applied(
    db: &dyn Database,
    plan: &MigrationPlan,
    state: &mut SyncState,
    checkpoint: &Checkpointer,
) -> Result<bool, MigrationError> {
    if state.phase != Phase::ReadyForCutover || !db.cutover_applied(plan).await? {
        return Ok(false);
    }
    info!(migration = %plan.name, "found committed cutover, finalizing");
    state.dual_write = None;
    checkpoint.advance(plan, state, Phase::CutOver).await?;
    Ok(true)
}

/// Abandons the migration: stops mirroring and marks it ROLLED_BACK. The
/// target and everything copied to it are left in place.
///
/// The phase change is saved before dual-write is removed, so an interrupted
/// rollback is finished by running it again.
#[instrument(level = "info", skip_all, fields(migration = %plan.name))]
pub async fn rollback(
    db: &dyn Database,
    plan: &MigrationPlan,
    state: &mut SyncState,
    checkpoint: &Checkpointer,
) -> Result<(), MigrationError> {
    if finalize_if_applied(db, plan, state, checkpoint).await? {
        return Err(MigrationError::InvalidTransition {
            from: Phase::CutOver,
            to: Phase::RolledBack,
        });
    }
    if state.phase != Phase::RolledBack {
        checkpoint.roll_back(plan, state).await?;
    }
    dual_write::disable(db, plan, state).await?;
    checkpoint.save(plan, state).await?;
    info!("migration rolled back, target {} left in place", plan.target);
    Ok(())
}
