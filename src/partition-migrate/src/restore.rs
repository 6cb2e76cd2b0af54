// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Recreating the source's indexes and check constraints on the target.
//!
//! Nothing here blocks writers for the duration of a scan. Indexes are built
//! per partition without write locks and attached to an initially invalid
//! parent index; checks are added `NOT VALID` (which only touches the catalog)
//! and validated afterwards. The two catalog steps that do make writers wait
//! run under a lock timeout and are retried when it runs out. Progress lives in the database itself, so a
//! restore that failed half way is resumed by running it again: objects that
//! are already valid are skipped, and built indexes are never dropped.

use std::time::{Duration, SystemTime};

use tracing::{debug, info, instrument, warn};

use crate::cfg::{
    ConfigSet, RESTORE_LOCK_MAX_ATTEMPTS, RESTORE_LOCK_TIMEOUT, RESTORE_STATEMENT_TIMEOUT,
};
use crate::db::{Database, ObjectState};
use crate::error::{DbError, MigrationError};
use crate::plan::MigrationPlan;
use crate::retry::{retry_transient, Retry};
use crate::state::{Phase, SyncState};

#[derive(Clone, Debug)]
pub struct RestoreOptions {
    pub statement_timeout: Duration,
    /// Bounds every wait for a lock that blocks writers to the target.
    pub lock_timeout: Duration,
    pub retry: Retry,
}

impl RestoreOptions {
    pub fn from_config(cfg: &ConfigSet) -> Self {
        RestoreOptions {
            statement_timeout: RESTORE_STATEMENT_TIMEOUT.get(cfg),
            lock_timeout: RESTORE_LOCK_TIMEOUT.get(cfg),
            retry: Retry::batch_defaults(SystemTime::now(), RESTORE_LOCK_MAX_ATTEMPTS.get(cfg)),
        }
    }
}

/// Restores every index and check of `plan` on the target.
///
/// Fails with [`MigrationError::ConstraintViolation`] naming the first
/// offending row if a check does not hold for the copied data. The check is
/// left `NOT VALID` so the offending rows can be fixed and the restore rerun.
#[instrument(level = "info", skip_all, fields(migration = %plan.name))]
pub async fn restore(
    db: &dyn Database,
    plan: &MigrationPlan,
    state: &SyncState,
    options: &RestoreOptions,
) -> Result<(), MigrationError> {
    state.expect_phase("restore constraints", &[Phase::ConstraintsRestoring])?;

    for index in &plan.indexes {
        let name = plan.target_index_name(index);
        match db.index_state(plan, index).await? {
            ObjectState::Valid => debug!(index = %name, "index already valid"),
            ObjectState::Missing | ObjectState::Invalid => {
                retry_transient("build index", options.retry.clone(), |_| {}, || {
                    db.build_index(plan, index, options.lock_timeout, options.statement_timeout)
                })
                .await?;
                info!(index = %name, "index built");
            }
        }
    }

    for check in &plan.checks {
        let name = plan.target_check_name(check);
        match db.check_state(plan, check).await? {
            ObjectState::Valid => {
                debug!(check = %name, "check already valid");
                continue;
            }
            ObjectState::Missing => {
                retry_transient("add check", options.retry.clone(), |_| {}, || {
                    db.add_check_not_valid(plan, check, options.lock_timeout)
                })
                .await?
            }
            ObjectState::Invalid => {}
        }
        if let Some(key) = db.first_check_violation(plan, check).await? {
            return Err(MigrationError::ConstraintViolation {
                constraint: name,
                key,
            });
        }
        match db
            .validate_check(plan, check, options.statement_timeout)
            .await
        {
            Ok(()) => info!(check = %name, "check validated"),
            // A violating row showed up after the scan above.
            Err(err) if err.is_check_violation() => {
                warn!(check = %name, "validation failed: {}", err);
                return match db.first_check_violation(plan, check).await? {
                    Some(key) => Err(MigrationError::ConstraintViolation {
                        constraint: name,
                        key,
                    }),
                    None => Err(err.into()),
                };
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Names of the indexes and checks of `plan` that are not yet valid on the
/// target.
pub async fn pending(db: &dyn Database, plan: &MigrationPlan) -> Result<Vec<String>, DbError> {
    let mut pending = vec![];
    for index in &plan.indexes {
        if db.index_state(plan, index).await? != ObjectState::Valid {
            pending.push(plan.target_index_name(index));
        }
    }
    for check in &plan.checks {
        if db.check_state(plan, check).await? != ObjectState::Valid {
            pending.push(plan.target_check_name(check));
        }
    }
    Ok(pending)
}
