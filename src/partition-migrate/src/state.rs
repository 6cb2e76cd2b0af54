// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The persisted state machine of a migration.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dual_write::DualWriteLink;
use crate::error::MigrationError;
use crate::types::IdentityKey;
use crate::verify::VerificationReport;

/// The lifecycle of a migration.
///
/// Phases only ever move forward, one step at a time, except that any
/// non-terminal phase may move to [`Phase::RolledBack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Planned,
    DualWriteActive,
    Backfilling,
    Verifying,
    ConstraintsRestoring,
    ReadyForCutover,
    CutOver,
    RolledBack,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planned => "PLANNED",
            Phase::DualWriteActive => "DUAL_WRITE_ACTIVE",
            Phase::Backfilling => "BACKFILLING",
            Phase::Verifying => "VERIFYING",
            Phase::ConstraintsRestoring => "CONSTRAINTS_RESTORING",
            Phase::ReadyForCutover => "READY_FOR_CUTOVER",
            Phase::CutOver => "CUT_OVER",
            Phase::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::CutOver | Phase::RolledBack)
    }

    /// The phase that follows this one on the forward path.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Planned => Some(Phase::DualWriteActive),
            Phase::DualWriteActive => Some(Phase::Backfilling),
            Phase::Backfilling => Some(Phase::Verifying),
            Phase::Verifying => Some(Phase::ConstraintsRestoring),
            Phase::ConstraintsRestoring => Some(Phase::ReadyForCutover),
            Phase::ReadyForCutover => Some(Phase::CutOver),
            Phase::CutOver | Phase::RolledBack => None,
        }
    }

    /// All phases, in lifecycle order.
    pub fn all() -> [Phase; 8] {
        [
            Phase::Planned,
            Phase::DualWriteActive,
            Phase::Backfilling,
            Phase::Verifying,
            Phase::ConstraintsRestoring,
            Phase::ReadyForCutover,
            Phase::CutOver,
            Phase::RolledBack,
        ]
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backfill progress through the source's identity key space.
///
/// The high-water mark only moves forward. The upper bound is captured when the
/// main pass starts: rows above it were written after dual-write was enabled
/// and are mirrored by it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCursor {
    high_water: Option<IdentityKey>,
    upper_bound: Option<IdentityKey>,
}

impl BatchCursor {
    /// A cursor positioned before the first key.
    pub fn new() -> Self {
        BatchCursor::default()
    }

    /// A cursor that stops at (and includes) `upper_bound`.
    pub fn bounded(upper_bound: Option<IdentityKey>) -> Self {
        BatchCursor {
            high_water: None,
            upper_bound,
        }
    }

    /// The greatest identity key confirmed migrated.
    pub fn high_water(&self) -> Option<&IdentityKey> {
        self.high_water.as_ref()
    }

    pub fn upper_bound(&self) -> Option<&IdentityKey> {
        self.upper_bound.as_ref()
    }

    /// Moves the high-water mark to `key` if that is forward. Returns whether
    /// the cursor moved.
    pub fn advance(&mut self, key: IdentityKey) -> bool {
        match &self.high_water {
            Some(current) if *current >= key => false,
            _ => {
                self.high_water = Some(key);
                true
            }
        }
    }

    /// Whether the cursor has reached its upper bound.
    pub fn is_exhausted(&self) -> bool {
        match (&self.high_water, &self.upper_bound) {
            (Some(hw), Some(upper)) => hw >= upper,
            _ => false,
        }
    }

    /// Rewinds to the start. Only used for an explicit restart from scratch.
    pub fn reset(&mut self, upper_bound: Option<IdentityKey>) {
        self.high_water = None;
        self.upper_bound = upper_bound;
    }
}

/// Bookkeeping for the backfill phase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillProgress {
    /// Whether the main pass has started, i.e. the cursor's upper bound is set.
    pub main_pass_started: bool,
    pub main_pass_complete: bool,
    /// Rows inserted into the target by backfill (not by dual-write).
    pub rows_copied: u64,
    /// Rows scanned by the main pass.
    pub rows_scanned: u64,
    pub reconciliation_passes: u32,
    /// Stragglers found by reconciliation passes.
    pub stragglers: u64,
}

/// The durable state of one migration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub phase: Phase,
    pub cursor: BatchCursor,
    pub backfill: BackfillProgress,
    pub dual_write: Option<DualWriteLink>,
    /// The report from the most recent verification gate.
    pub last_report: Option<VerificationReport>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new() -> Self {
        SyncState {
            phase: Phase::Planned,
            cursor: BatchCursor::new(),
            backfill: BackfillProgress::default(),
            dual_write: None,
            last_report: None,
            updated_at: Utc::now(),
        }
    }

    /// Moves to `to`, which must directly follow the current phase.
    pub fn advance(&mut self, to: Phase) -> Result<(), MigrationError> {
        if self.phase.next() != Some(to) {
            return Err(MigrationError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.touch();
        Ok(())
    }

    /// Moves to [`Phase::RolledBack`] from any non-terminal phase.
    pub fn roll_back(&mut self) -> Result<(), MigrationError> {
        if self.phase.is_terminal() {
            return Err(MigrationError::InvalidTransition {
                from: self.phase,
                to: Phase::RolledBack,
            });
        }
        self.phase = Phase::RolledBack;
        self.touch();
        Ok(())
    }

    /// Fails unless the current phase is one of `expected`.
    pub fn expect_phase(
        &self,
        operation: &'static str,
        expected: &[Phase],
    ) -> Result<(), MigrationError> {
        if expected.contains(&self.phase) {
            Ok(())
        } else {
            Err(MigrationError::WrongPhase {
                operation,
                expected: expected.to_vec(),
                actual: self.phase,
            })
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::new()
    }
}
