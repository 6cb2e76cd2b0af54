// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Online migration of a live table to a range-partitioned layout.
//!
//! A migration moves through a persisted sequence of phases:
//!
//! ```text
//! PLANNED -> DUAL_WRITE_ACTIVE -> BACKFILLING -> VERIFYING
//!   -> CONSTRAINTS_RESTORING -> READY_FOR_CUTOVER -> CUT_OVER
//! ```
//!
//! with ROLLED_BACK reachable from every non-terminal phase. The source table
//! keeps serving reads and writes throughout; new inserts are mirrored into
//! the partitioned target by a trigger while pre-existing rows are copied in
//! resumable batches. Only the final swap takes exclusive locks, and only
//! briefly.
//!
//! [`migration::Engine`] is the entry point. The phase logic is written
//! against the [`db::Database`] trait, implemented for Postgres by
//! [`postgres::PostgresDatabase`] and in memory by [`mem::MemDatabase`].

pub mod backfill;
pub mod cfg;
pub mod cutover;
pub mod db;
pub mod dual_write;
pub mod error;
pub mod mem;
pub mod metrics;
pub mod migration;
pub mod plan;
pub mod postgres;
pub mod restore;
pub mod retry;
pub mod state;
pub mod store;
pub mod types;
pub mod verify;

pub use crate::error::{EngineError, MigrationError, PlanError};
pub use crate::migration::{Engine, Migration, MigrationStatus};
pub use crate::plan::{plan, MigrationPlan, PartitionRequest, RangeSpec};
pub use crate::state::{Phase, SyncState};
