// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Driving a migration through its phases.
//!
//! An [`Engine`] creates and resumes migrations. A [`Migration`] owns the plan
//! and [`SyncState`] of one of them, enforces the order of the phases, and
//! checkpoints its state after every step, so that any process that resumes
//! it (and thereby fences out the previous one) continues exactly where the
//! last checkpoint left off.

use std::fmt;
use std::sync::Arc;

use prometheus::Registry;
use serde::Serialize;
use tracing::{info, instrument};

use crate::backfill::{self, BackfillContext, BackfillOptions};
use crate::cfg::{ConfigError, ConfigSet, ConfigUpdates};
use crate::cutover::{self, CutoverOptions};
use crate::db::{BatchResult, Database, MissingRows};
use crate::dual_write;
use crate::error::{
    BoundaryProblem, EngineError, ErrorContext, MigrationError, PlanError, StoreError,
};
use crate::metrics::Metrics;
use crate::plan::{self, MigrationPlan, PartitionRequest};
use crate::restore::{self, RestoreOptions};
use crate::state::{Phase, SyncState};
use crate::store::{Checkpointer, StateStore};
use crate::types::{IdentityKey, TableName};
use crate::verify::{self, Gate, VerificationReport, VerifyOptions};

/// Creates and resumes migrations against one database.
#[derive(Clone)]
pub struct Engine {
    db: Arc<dyn Database>,
    store: Arc<dyn StateStore>,
    cfg: ConfigSet,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("db", &self.db)
            .field("store", &self.store)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Returns an engine whose metrics are registered with `registry`.
    pub fn new(
        db: Arc<dyn Database>,
        store: Arc<dyn StateStore>,
        cfg: ConfigSet,
        registry: &Registry,
    ) -> Result<Self, prometheus::Error> {
        Ok(Engine {
            db,
            store,
            cfg,
            metrics: Arc::new(Metrics::new(registry)?),
        })
    }

    pub fn config(&self) -> &ConfigSet {
        &self.cfg
    }

    /// Applies configuration overrides. Migrations pick them up at their next
    /// operation.
    pub fn update_config(&self, updates: &ConfigUpdates) -> Result<(), ConfigError> {
        updates.apply(&self.cfg)
    }

    /// Plans a new migration of `source` and persists it in PLANNED.
    ///
    /// Besides the checks of [`plan::plan`], refuses boundaries that would
    /// leave existing source rows without a partition.
    #[instrument(level = "info", skip_all, fields(migration = %request.name))]
    pub async fn create(
        &self,
        source: &TableName,
        request: &PartitionRequest,
    ) -> Result<Migration, EngineError> {
        let fail = |error: MigrationError| EngineError {
            error,
            context: ErrorContext {
                migration: request.name.clone(),
                phase: Phase::Planned,
                high_water: None,
            },
        };

        let plan = plan_checked(self.db.as_ref(), source, request)
            .await
            .map_err(fail)?;
        let existing = self
            .store
            .list()
            .await
            .map_err(|e| fail(e.into()))?;
        if existing.contains(&plan.name) {
            return Err(fail(StoreError::AlreadyExists(plan.name.clone()).into()));
        }
        let (epoch, record) = self
            .store
            .open(&plan.name)
            .await
            .map_err(|e| fail(e.into()))?;
        if record.is_some() {
            return Err(fail(StoreError::AlreadyExists(plan.name.clone()).into()));
        }

        let metrics = self.metrics.migration(&plan.name);
        let checkpoint = Checkpointer::new(
            Arc::clone(&self.store),
            plan.name.clone(),
            epoch,
            metrics.clone(),
        );
        let state = SyncState::new();
        checkpoint
            .save(&plan, &state)
            .await
            .map_err(|e| fail(e.into()))?;
        metrics.set_phase(state.phase);
        info!(
            source = %plan.source,
            target = %plan.target,
            partitions = plan.partitions.len(),
            epoch,
            "migration planned"
        );
        Ok(Migration {
            db: Arc::clone(&self.db),
            cfg: self.cfg.clone(),
            checkpoint,
            plan,
            state,
        })
    }

    /// Takes over an existing migration, fencing out whichever process drove
    /// it before.
    #[instrument(level = "info", skip(self))]
    pub async fn resume(&self, name: &str) -> Result<Migration, EngineError> {
        let fail = |error: MigrationError| EngineError {
            error,
            context: ErrorContext {
                migration: name.to_owned(),
                phase: Phase::Planned,
                high_water: None,
            },
        };
        let (epoch, record) = self.store.open(name).await.map_err(|e| fail(e.into()))?;
        let Some(record) = record else {
            return Err(fail(StoreError::NotFound(name.to_owned()).into()));
        };

        let metrics = self.metrics.migration(name);
        metrics.set_phase(record.state.phase);
        let mut migration = Migration {
            db: Arc::clone(&self.db),
            cfg: self.cfg.clone(),
            checkpoint: Checkpointer::new(
                Arc::clone(&self.store),
                name.to_owned(),
                epoch,
                metrics,
            ),
            plan: record.plan,
            state: record.state,
        };
        info!(
            epoch,
            phase = %migration.state.phase,
            high_water = ?migration.state.cursor.high_water(),
            "resumed migration"
        );
        let Migration {
            db,
            checkpoint,
            plan,
            state,
            ..
        } = &mut migration;
        let finalized = cutover::finalize_if_applied(db.as_ref(), plan, state, checkpoint).await;
        migration.wrap(finalized)?;
        Ok(migration)
    }

    /// Names of all persisted migrations.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.store.list().await
    }
}

/// Plans the migration of `source` and checks that its existing rows all have
/// a partition.
async fn plan_checked(
    db: &dyn Database,
    source: &TableName,
    request: &PartitionRequest,
) -> Result<MigrationPlan, MigrationError> {
    let desc = db.describe_table(source).await?;
    let plan = plan::plan(&desc, request)?;
    let unroutable = db.count_unroutable(&plan, 1).await?;
    if let Some(example) = unroutable.sample.into_iter().next() {
        return Err(PlanError::InvalidBoundary(BoundaryProblem::UncoveredRows {
            count: unroutable.count,
            example,
        })
        .into());
    }
    Ok(plan)
}

/// A point-in-time summary of a migration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub name: String,
    pub phase: Phase,
    /// Rows written to the target by backfill.
    pub rows_migrated: u64,
    /// How many source rows backfill has yet to copy, from table statistics.
    pub rows_remaining_estimate: u64,
    pub high_water: Option<IdentityKey>,
    pub dual_write_active: bool,
    pub last_report: Option<VerificationReport>,
}

/// One migration, driven by this process.
pub struct Migration {
    db: Arc<dyn Database>,
    cfg: ConfigSet,
    checkpoint: Checkpointer,
    plan: MigrationPlan,
    state: SyncState,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.plan.name)
            .field("epoch", &self.checkpoint.epoch())
            .field("phase", &self.state.phase)
            .finish_non_exhaustive()
    }
}

impl Migration {
    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    fn wrap<T>(&self, res: Result<T, MigrationError>) -> Result<T, EngineError> {
        res.map_err(|error| EngineError {
            error,
            context: ErrorContext {
                migration: self.plan.name.clone(),
                phase: self.state.phase,
                high_water: self.state.cursor.high_water().cloned(),
            },
        })
    }

    /// Replaces the plan with one made from `request`. Only allowed before
    /// dual-write is enabled. The migration keeps its name.
    #[instrument(level = "info", skip_all, fields(migration = %self.plan.name))]
    pub async fn replan(&mut self, request: &PartitionRequest) -> Result<(), EngineError> {
        let res = async {
            if self.state.phase != Phase::Planned {
                return Err(MigrationError::PlanImmutable(self.state.phase));
            }
            let request = PartitionRequest {
                name: self.plan.name.clone(),
                ..request.clone()
            };
            let plan = plan_checked(self.db.as_ref(), &self.plan.source, &request).await?;
            self.state.touch();
            self.checkpoint.save(&plan, &self.state).await?;
            self.plan = plan;
            info!(target = %self.plan.target, "migration replanned");
            Ok(())
        }
        .await;
        self.wrap(res)
    }

    /// Creates the target and starts mirroring inserts into it.
    #[instrument(level = "info", skip_all, fields(migration = %self.plan.name))]
    pub async fn enable_dual_write(&mut self) -> Result<(), EngineError> {
        let from = self.state.phase;
        let res = async {
            dual_write::enable(self.db.as_ref(), &self.plan, &mut self.state).await?;
            self.checkpoint.save(&self.plan, &self.state).await?;
            if from != self.state.phase {
                self.checkpoint.record_transition(from, self.state.phase);
            }
            Ok(())
        }
        .await;
        self.wrap(res)
    }

    /// Stops mirroring, once the target is ready or after a rollback.
    #[instrument(level = "info", skip_all, fields(migration = %self.plan.name))]
    pub async fn disable_dual_write(&mut self) -> Result<(), EngineError> {
        let res = async {
            dual_write::disable(self.db.as_ref(), &self.plan, &mut self.state).await?;
            self.state.touch();
            self.checkpoint.save(&self.plan, &self.state).await?;
            Ok(())
        }
        .await;
        self.wrap(res)
    }

    /// Runs the backfill through to VERIFYING.
    pub async fn backfill(&mut self) -> Result<(), EngineError> {
        let options = BackfillOptions::from_config(&self.cfg);
        let cx = BackfillContext {
            db: self.db.as_ref(),
            plan: &self.plan,
            checkpoint: &self.checkpoint,
            options: &options,
        };
        let res = backfill::run(cx, &mut self.state).await;
        self.wrap(res)
    }

    /// Copies a single main pass batch.
    pub async fn run_batch(&mut self) -> Result<BatchResult, EngineError> {
        let options = BackfillOptions::from_config(&self.cfg);
        let cx = BackfillContext {
            db: self.db.as_ref(),
            plan: &self.plan,
            checkpoint: &self.checkpoint,
            options: &options,
        };
        let res = backfill::step(cx, &mut self.state).await;
        self.wrap(res)
    }

    /// Runs one reconciliation pass and reports what is still missing.
    pub async fn reconcile(&mut self) -> Result<MissingRows, EngineError> {
        let options = BackfillOptions::from_config(&self.cfg);
        let res = self.reconcile_inner(&options).await;
        self.wrap(res)
    }

    async fn reconcile_inner(
        &mut self,
        options: &BackfillOptions,
    ) -> Result<MissingRows, MigrationError> {
        self.state
            .expect_phase("reconcile", &[Phase::Backfilling])?;
        let cx = BackfillContext {
            db: self.db.as_ref(),
            plan: &self.plan,
            checkpoint: &self.checkpoint,
            options,
        };
        backfill::reconcile(cx, &mut self.state, 1).await
    }

    /// Starts the backfill over from the lowest key.
    pub async fn restart_backfill(&mut self) -> Result<(), EngineError> {
        let res = async {
            backfill::restart(&mut self.state)?;
            self.checkpoint.save(&self.plan, &self.state).await?;
            info!(migration = %self.plan.name, "backfill restarted");
            Ok(())
        }
        .await;
        self.wrap(res)
    }

    /// Runs the verification due in the current phase.
    ///
    /// In VERIFYING and CONSTRAINTS_RESTORING a clean report moves the
    /// migration on. In READY_FOR_CUTOVER it refreshes the report that cutover
    /// requires, without a phase change.
    pub async fn verify(&mut self) -> Result<VerificationReport, EngineError> {
        let options = VerifyOptions::from_config(&self.cfg);
        let res = self.verify_inner(&options).await;
        self.wrap(res)
    }

    async fn verify_inner(
        &mut self,
        options: &VerifyOptions,
    ) -> Result<VerificationReport, MigrationError> {
        let gate = match self.state.phase {
            Phase::Verifying => Gate::Backfilled,
            Phase::ConstraintsRestoring => {
                let pending = restore::pending(self.db.as_ref(), &self.plan).await?;
                if !pending.is_empty() {
                    return Err(MigrationError::ConstraintsPending(pending));
                }
                Gate::ConstraintsRestored
            }
            Phase::ReadyForCutover => {
                let report = verify::run(
                    self.db.as_ref(),
                    &self.plan,
                    &self.checkpoint,
                    options,
                    Gate::ConstraintsRestored,
                )
                .await?;
                self.state.last_report = Some(report.clone());
                self.state.touch();
                self.checkpoint.save(&self.plan, &self.state).await?;
                if !report.is_clean() {
                    return Err(MigrationError::VerificationFailed(Box::new(report)));
                }
                return Ok(report);
            }
            actual => {
                return Err(MigrationError::WrongPhase {
                    operation: "verify",
                    expected: vec![
                        Phase::Verifying,
                        Phase::ConstraintsRestoring,
                        Phase::ReadyForCutover,
                    ],
                    actual,
                })
            }
        };
        verify::pass_gate(
            self.db.as_ref(),
            &self.plan,
            &mut self.state,
            &self.checkpoint,
            options,
            gate,
        )
        .await
    }

    /// Restores indexes and checks on the target, then runs the post-restore
    /// verification.
    pub async fn restore_constraints(&mut self) -> Result<VerificationReport, EngineError> {
        let res = self.restore_inner().await;
        self.wrap(res)
    }

    async fn restore_inner(&mut self) -> Result<VerificationReport, MigrationError> {
        let db = self.db.as_ref();
        restore::restore(
            db,
            &self.plan,
            &self.state,
            &RestoreOptions::from_config(&self.cfg),
        )
        .await?;
        verify::pass_gate(
            db,
            &self.plan,
            &mut self.state,
            &self.checkpoint,
            &VerifyOptions::from_config(&self.cfg),
            Gate::ConstraintsRestored,
        )
        .await
    }

    /// Swaps the target in for the source.
    pub async fn cutover(&mut self) -> Result<(), EngineError> {
        let options = CutoverOptions::from_config(&self.cfg);
        let res = cutover::cutover(
            self.db.as_ref(),
            &self.plan,
            &mut self.state,
            &self.checkpoint,
            &options,
        )
        .await;
        self.wrap(res)
    }

    /// Abandons the migration, leaving the source authoritative.
    pub async fn rollback(&mut self) -> Result<(), EngineError> {
        let res = cutover::rollback(
            self.db.as_ref(),
            &self.plan,
            &mut self.state,
            &self.checkpoint,
        )
        .await;
        self.wrap(res)
    }

    pub async fn status(&self) -> Result<MigrationStatus, EngineError> {
        let res = async {
            let rows_remaining_estimate = match self.state.phase {
                Phase::Planned | Phase::DualWriteActive | Phase::Backfilling => {
                    let source = self.db.estimate_rows(&self.plan.source).await?;
                    let target = if self.state.phase == Phase::Planned {
                        0
                    } else {
                        self.db.estimate_rows(&self.plan.target).await?
                    };
                    source.saturating_sub(target)
                }
                _ => 0,
            };
            Ok(MigrationStatus {
                name: self.plan.name.clone(),
                phase: self.state.phase,
                rows_migrated: self.state.backfill.rows_copied,
                rows_remaining_estimate,
                high_water: self.state.cursor.high_water().cloned(),
                dual_write_active: self.state.dual_write.is_some(),
                last_report: self.state.last_report.clone(),
            })
        }
        .await;
        self.wrap(res)
    }

    /// Drives the migration from wherever it is through cutover.
    #[instrument(level = "info", skip_all, fields(migration = %self.plan.name))]
    pub async fn run(&mut self) -> Result<(), EngineError> {
        loop {
            match self.state.phase {
                Phase::Planned => self.enable_dual_write().await?,
                Phase::DualWriteActive | Phase::Backfilling => self.backfill().await?,
                Phase::Verifying => {
                    self.verify().await?;
                }
                Phase::ConstraintsRestoring => {
                    self.restore_constraints().await?;
                }
                Phase::ReadyForCutover => self.cutover().await?,
                Phase::CutOver => return Ok(()),
                Phase::RolledBack => {
                    return self.wrap(Err(MigrationError::InvalidTransition {
                        from: Phase::RolledBack,
                        to: Phase::CutOver,
                    }))
                }
            }
        }
    }
}
