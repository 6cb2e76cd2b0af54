// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors for partition migrations.
//!
//! ```text
//! EngineError                          - what operators see: error + phase + cursor
//!   └── MigrationError
//!         ├── Plan(PlanError)          - planning time, nothing was changed
//!         ├── IncompleteBackfill       - stays BACKFILLING
//!         ├── ConstraintViolation      - stays CONSTRAINTS_RESTORING
//!         ├── VerificationFailed       - blocks forward progress, re-checkable
//!         ├── CutoverAborted           - reverted, safe to retry
//!         ├── Database(DbError)
//!         └── Store(StoreError)
//! ```

use std::fmt;

use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::cutover::CutoverStep;
use crate::state::Phase;
use crate::types::{ColumnType, Datum, IdentityKey};
use crate::verify::VerificationReport;

/// Why a set of partition bounds was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryProblem {
    /// No ranges were requested.
    NoPartitions,
    /// A range whose lower bound is not below its upper bound.
    EmptyRange { lower: Datum, upper: Datum },
    /// Two ranges share some values.
    Overlap { first: usize, second: usize },
    /// Values between two ranges would have nowhere to go.
    Gap { after: Datum, before: Datum },
    /// An unbounded end anywhere but the outermost ranges.
    UnboundedInterior { range: usize },
    /// A bound whose type does not match the partition key column.
    TypeMismatch { value: Datum, expected: ColumnType },
    /// Existing rows that no range covers.
    UncoveredRows { count: u64, example: IdentityKey },
}

impl fmt::Display for BoundaryProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryProblem::NoPartitions => f.write_str("no partition ranges given"),
            BoundaryProblem::EmptyRange { lower, upper } => {
                write!(f, "range [{}, {}) is empty", lower, upper)
            }
            BoundaryProblem::Overlap { first, second } => {
                write!(f, "ranges {} and {} overlap", first, second)
            }
            BoundaryProblem::Gap { after, before } => write!(
                f,
                "values in [{}, {}) are not covered and there is no default partition",
                after, before
            ),
            BoundaryProblem::UnboundedInterior { range } => {
                write!(f, "range {} is unbounded but is not an outermost range", range)
            }
            BoundaryProblem::TypeMismatch { value, expected } => {
                write!(f, "bound {} is not a valid {}", value, expected)
            }
            BoundaryProblem::UncoveredRows { count, example } => write!(
                f,
                "{} existing rows fall outside every range, e.g. key {}",
                count, example
            ),
        }
    }
}

/// Errors produced while planning. Planning has no side effects, so none of
/// these leave anything behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("invalid partition boundaries: {0}")]
    InvalidBoundary(BoundaryProblem),
    #[error("{constraint} ({}) does not include partition key {partition_key}", .columns.join(", "))]
    MissingKeyInIdentity {
        constraint: String,
        columns: Vec<String>,
        partition_key: String,
    },
    #[error("unknown column {column} in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("column {column} has type {ty}, which cannot be part of a key")]
    UnsupportedKeyType { column: String, ty: ColumnType },
    #[error("identity column {column} is nullable")]
    NullableIdentityColumn { column: String },
    #[error("identity key ({}) does not cover any unique key of {table}", .columns.join(", "))]
    IdentityNotUnique { table: String, columns: Vec<String> },
    #[error("invalid migration name {0:?}: use lowercase letters, digits and underscores")]
    InvalidName(String),
    #[error("source and target are both {0}")]
    SameTable(String),
}

/// An error from the database an engine operates on.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("connection pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    /// The backend could not serve the request right now, e.g. its
    /// connection dropped or a lock wait ran out.
    #[error("backend temporarily unavailable: {0}")]
    Unavailable(String),
    /// Existing rows violate the named check constraint.
    #[error("check constraint {0} is violated by some row")]
    CheckViolation(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    /// Whether retrying the same operation may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Postgres(e) => {
                if e.is_closed() {
                    return true;
                }
                match e.code() {
                    Some(code) => {
                        *code == SqlState::T_R_SERIALIZATION_FAILURE
                            || *code == SqlState::T_R_DEADLOCK_DETECTED
                            || *code == SqlState::LOCK_NOT_AVAILABLE
                            || *code == SqlState::QUERY_CANCELED
                            || *code == SqlState::ADMIN_SHUTDOWN
                            || *code == SqlState::CONNECTION_FAILURE
                    }
                    // No SQLSTATE means the error happened below the
                    // protocol, e.g. in the socket.
                    None => true,
                }
            }
            DbError::Pool(_) => true,
            DbError::Unavailable(_) => true,
            DbError::CheckViolation(_) | DbError::Other(_) => false,
        }
    }

    /// Whether existing rows violate a check constraint being validated.
    pub fn is_check_violation(&self) -> bool {
        match self {
            DbError::CheckViolation(_) => true,
            DbError::Postgres(e) => e.code() == Some(&SqlState::CHECK_VIOLATION),
            _ => false,
        }
    }
}

/// An error from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another engine process opened this migration after we did.
    #[error("migration {migration} is fenced: epoch {current} supersedes our epoch {ours}")]
    Fenced {
        migration: String,
        ours: u64,
        current: u64,
    },
    #[error("migration {0} does not exist")]
    NotFound(String),
    #[error("migration {0} already exists")]
    AlreadyExists(String),
    #[error("encoding migration record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("state store: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("state store connection pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("connecting to state store: {0}")]
    Connection(#[source] DbError),
}

impl StoreError {
    /// Whether this engine process must stop driving the migration.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, StoreError::Fenced { .. })
    }
}

/// The error taxonomy of a migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(
        "backfill incomplete after {passes} reconciliation passes: {missing} rows missing from target, e.g. {}",
        format_keys(.sample)
    )]
    IncompleteBackfill {
        passes: u32,
        missing: u64,
        sample: Vec<IdentityKey>,
    },
    #[error("constraint {constraint} is violated by row {key}")]
    ConstraintViolation { constraint: String, key: IdentityKey },
    #[error("verification failed: {0}")]
    VerificationFailed(Box<VerificationReport>),
    #[error("cutover aborted during {step} and reverted: {source}")]
    CutoverAborted {
        step: CutoverStep,
        #[source]
        source: DbError,
    },
    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("{operation} requires phase {}, but migration is {actual}", format_phases(.expected))]
    WrongPhase {
        operation: &'static str,
        expected: Vec<Phase>,
        actual: Phase,
    },
    #[error("the plan can no longer change once the migration is {0}")]
    PlanImmutable(Phase),
    #[error("dual-write link is missing")]
    DualWriteMissing,
    /// The database returned a batch that ends at or before where it was
    /// asked to start, so it orders identity keys differently than the engine.
    #[error("backfill batch after {high_water} ended at {returned}: the cursor cannot move forward")]
    CursorStalled {
        high_water: IdentityKey,
        returned: IdentityKey,
    },
    #[error("cutover requires a clean post-restore verification report")]
    NotVerified,
    #[error("constraints not yet restored: {}", .0.join(", "))]
    ConstraintsPending(Vec<String>),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// Whether simply retrying the phase operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrationError::CutoverAborted { .. } => true,
            MigrationError::Database(e) => e.is_transient(),
            _ => false,
        }
    }
}

fn format_keys(keys: &[IdentityKey]) -> String {
    if keys.is_empty() {
        return "<none sampled>".into();
    }
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_phases(phases: &[Phase]) -> String {
    phases
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Where a migration stood when an error occurred.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub migration: String,
    pub phase: Phase,
    /// The backfill high-water mark, if backfill has made progress.
    pub high_water: Option<IdentityKey>,
}

/// A [`MigrationError`] together with the state needed to diagnose or resume.
#[derive(Debug, Error)]
pub struct EngineError {
    #[source]
    pub error: MigrationError,
    pub context: ErrorContext,
}

impl EngineError {
    pub fn error(&self) -> &MigrationError {
        &self.error
    }

    pub fn phase(&self) -> Phase {
        self.context.phase
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "migration {} ({}): {}",
            self.context.migration, self.context.phase, self.error
        )?;
        if let Some(key) = &self.context.high_water {
            write!(f, " [high-water mark {}]", key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_names_phase_and_cursor() {
        let err = EngineError {
            error: MigrationError::IncompleteBackfill {
                passes: 2,
                missing: 1,
                sample: vec![IdentityKey(vec![Datum::Int(3)])],
            },
            context: ErrorContext {
                migration: "events_by_month".into(),
                phase: Phase::Backfilling,
                high_water: Some(IdentityKey(vec![Datum::Int(40)])),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("BACKFILLING"), "{}", msg);
        assert!(msg.contains("(3)"), "{}", msg);
        assert!(msg.contains("high-water mark (40)"), "{}", msg);
    }

    #[test]
    fn retryable_classification() {
        let aborted = MigrationError::CutoverAborted {
            step: CutoverStep::AcquireLocks,
            source: DbError::Unavailable("lock timeout".into()),
        };
        assert!(aborted.is_retryable());
        let violation = MigrationError::ConstraintViolation {
            constraint: "amount_positive".into(),
            key: IdentityKey(vec![Datum::Int(1)]),
        };
        assert!(!violation.is_retryable());
        assert!(DbError::Unavailable("connection reset".into()).is_transient());
        let violated = DbError::CheckViolation("amount_positive".into());
        assert!(!violated.is_transient());
        assert!(violated.is_check_violation());
        assert!(!DbError::Unavailable("connection reset".into()).is_check_violation());
    }
}
