// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Consistency checks between source and target.
//!
//! A migration passes two gates: after backfill, and again after constraints
//! are restored. Each produces a fresh [`VerificationReport`] and the migration
//! only moves on when the report is clean.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::cfg::{ConfigSet, VERIFY_DEEP_CHECK, VERIFY_SAMPLE_SIZE};
use crate::db::{Database, Side, TableSummary};
use crate::error::{DbError, MigrationError};
use crate::plan::MigrationPlan;
use crate::state::{Phase, SyncState};
use crate::store::Checkpointer;
use crate::types::IdentityKey;

/// Mismatched keys kept in a report.
const MAX_REPORTED_MISMATCHES: usize = 20;

/// The point in a migration a verification was taken for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gate {
    /// After backfill, before constraints are restored.
    Backfilled,
    /// After constraints are restored, before cutover.
    ConstraintsRestored,
}

impl Gate {
    /// The phase a migration is in while this gate is pending.
    pub fn phase(&self) -> Phase {
        match self {
            Gate::Backfilled => Phase::Verifying,
            Gate::ConstraintsRestored => Phase::ConstraintsRestoring,
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::Backfilled => f.write_str("post-backfill"),
            Gate::ConstraintsRestored => f.write_str("post-restore"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub gate: Gate,
    pub source: TableSummary,
    pub target: TableSummary,
    /// Target rows minus source rows.
    pub row_count_delta: i64,
    /// Target checksum minus source checksum, wrapping.
    pub checksum_delta: i64,
    /// Number of rows compared column by column, zero for a shallow check.
    pub sampled: usize,
    /// Sampled keys whose target row is missing or differs.
    pub mismatched: Vec<IdentityKey>,
    pub taken_at: DateTime<Utc>,
}

impl VerificationReport {
    fn new(gate: Gate, source: TableSummary, target: TableSummary) -> Self {
        let rows = |s: &TableSummary| i64::try_from(s.rows).unwrap_or(i64::MAX);
        VerificationReport {
            gate,
            source,
            target,
            row_count_delta: rows(&target) - rows(&source),
            checksum_delta: target.checksum.wrapping_sub(source.checksum),
            sampled: 0,
            mismatched: vec![],
            taken_at: Utc::now(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.row_count_delta == 0 && self.checksum_delta == 0 && self.mismatched.is_empty()
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} check: {} source rows, {} target rows (delta {}), checksum delta {}",
            self.gate, self.source.rows, self.target.rows, self.row_count_delta, self.checksum_delta
        )?;
        if self.sampled > 0 {
            write!(
                f,
                ", {} of {} sampled rows mismatched",
                self.mismatched.len(),
                self.sampled
            )?;
            if let Some(first) = self.mismatched.first() {
                write!(f, " (first {})", first)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct VerifyOptions {
    pub sample_size: usize,
    pub deep: bool,
}

impl VerifyOptions {
    pub fn from_config(cfg: &ConfigSet) -> Self {
        VerifyOptions {
            sample_size: VERIFY_SAMPLE_SIZE.get(cfg),
            deep: VERIFY_DEEP_CHECK.get(cfg),
        }
    }
}

/// Compares row counts and identity key checksums, from one snapshot.
pub async fn check(
    db: &dyn Database,
    plan: &MigrationPlan,
    gate: Gate,
) -> Result<VerificationReport, DbError> {
    let (source, target) = db.summarize(plan).await?;
    Ok(VerificationReport::new(gate, source, target))
}

/// [`check`], plus a column by column comparison of up to `sample_size`
/// source rows with their target counterparts.
pub async fn deep_check(
    db: &dyn Database,
    plan: &MigrationPlan,
    gate: Gate,
    sample_size: usize,
) -> Result<VerificationReport, DbError> {
    let mut report = check(db, plan, gate).await?;
    let keys = db.sample_keys(plan, sample_size).await?;
    let source = db.fetch_rows(plan, Side::Source, &keys).await?;
    let target = db.fetch_rows(plan, Side::Target, &keys).await?;
    report.sampled = source.len();
    report.mismatched = source
        .iter()
        .filter(|(key, row)| target.get(*key) != Some(*row))
        .map(|(key, _)| key.clone())
        .take(MAX_REPORTED_MISMATCHES)
        .collect();
    Ok(report)
}

/// Runs the verification `gate` for a migration in the gate's phase, records
/// the report and, if it is clean, moves to the next phase.
#[instrument(level = "info", skip_all, fields(migration = %plan.name, %gate))]
pub async fn pass_gate(
    db: &dyn Database,
    plan: &MigrationPlan,
    state: &mut SyncState,
    checkpoint: &Checkpointer,
    options: &VerifyOptions,
    gate: Gate,
) -> Result<VerificationReport, MigrationError> {
    state.expect_phase("verify", &[gate.phase()])?;
    let report = run(db, plan, checkpoint, options, gate).await?;
    state.last_report = Some(report.clone());
    state.touch();
    if !report.is_clean() {
        checkpoint.save(plan, state).await?;
        return Err(MigrationError::VerificationFailed(Box::new(report)));
    }
    match gate.phase().next() {
        Some(next) => checkpoint.advance(plan, state, next).await?,
        None => checkpoint.save(plan, state).await?,
    }
    Ok(report)
}

/// Takes a fresh report for `gate` without any phase change.
pub async fn run(
    db: &dyn Database,
    plan: &MigrationPlan,
    checkpoint: &Checkpointer,
    options: &VerifyOptions,
    gate: Gate,
) -> Result<VerificationReport, DbError> {
    let report = if options.deep {
        deep_check(db, plan, gate, options.sample_size).await?
    } else {
        check(db, plan, gate).await?
    };
    let metrics = checkpoint.metrics();
    metrics.verifications.inc();
    if report.is_clean() {
        info!(migration = %plan.name, "{}", report);
    } else {
        metrics.verification_failures.inc();
        warn!(migration = %plan.name, "{}", report);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datum;

    #[test]
    fn deltas_and_cleanliness() {
        let source = TableSummary {
            rows: 4,
            checksum: i64::MAX,
        };
        let clean = VerificationReport::new(Gate::Backfilled, source, source);
        assert!(clean.is_clean());

        let target = TableSummary {
            rows: 3,
            checksum: i64::MIN,
        };
        let report = VerificationReport::new(Gate::Backfilled, source, target);
        assert_eq!(report.row_count_delta, -1);
        assert_eq!(report.checksum_delta, 1);
        assert!(!report.is_clean());

        let mut sampled = VerificationReport::new(Gate::ConstraintsRestored, source, source);
        sampled.sampled = 2;
        sampled.mismatched = vec![IdentityKey(vec![Datum::Int(9)])];
        assert!(!sampled.is_clean());
        let msg = sampled.to_string();
        assert!(msg.starts_with("post-restore check"), "{}", msg);
        assert!(msg.contains("1 of 2 sampled rows mismatched (first (9))"), "{}", msg);
    }
}
