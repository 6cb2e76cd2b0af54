// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end migrations against the in-memory database.

use std::sync::Arc;
use std::time::Duration;

use mz_partition_migrate::backfill::{self, BackfillContext, BackfillOptions};
use mz_partition_migrate::cfg::{all_configs, ConfigSet, ConfigUpdates};
use mz_partition_migrate::cutover::{CutoverOptions, CutoverStep};
use mz_partition_migrate::db::Database;
use mz_partition_migrate::dual_write;
use mz_partition_migrate::error::{BoundaryProblem, MigrationError, PlanError, StoreError};
use mz_partition_migrate::mem::MemDatabase;
use mz_partition_migrate::metrics::MigrationMetrics;
use mz_partition_migrate::restore::{self, RestoreOptions};
use mz_partition_migrate::state::BatchCursor;
use mz_partition_migrate::store::{Checkpointer, MemStateStore, StateStore};
use mz_partition_migrate::types::{
    CheckDesc, CheckPredicate, CmpOp, ColumnDesc, ColumnType, Datum, IdentityKey, IndexDesc, Row,
    SequenceDesc, TableDesc, TableName,
};
use mz_partition_migrate::verify::{self, Gate, VerifyOptions};
use mz_partition_migrate::{plan, Engine, Migration, PartitionRequest, Phase, RangeSpec, SyncState};
use prometheus::Registry;
use tracing_subscriber::EnvFilter;

const NAME: &str = "events_by_month";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn date(m: u32, d: u32) -> Datum {
    Datum::date(2024, m, d).expect("valid date")
}

fn events() -> TableName {
    TableName::parse("events")
}

fn events_desc() -> TableDesc {
    let mut desc = TableDesc::new(
        events(),
        vec![
            ColumnDesc::new("id", ColumnType::Int8, false),
            ColumnDesc::new("created_on", ColumnType::Date, false),
            ColumnDesc::new("amount", ColumnType::Int8, true),
        ],
        vec!["id".into()],
    );
    desc.indexes.push(IndexDesc {
        name: "events_amount_idx".into(),
        columns: vec!["amount".into()],
        unique: false,
    });
    desc.checks.push(CheckDesc {
        name: "amount_positive".into(),
        predicate: CheckPredicate::Compare {
            column: "amount".into(),
            op: CmpOp::Gt,
            value: Datum::Int(0),
        },
    });
    desc.sequences.push(SequenceDesc {
        name: TableName::parse("events_id_seq"),
        column: "id".into(),
    });
    desc
}

fn row(id: i64, created_on: Datum) -> Row {
    vec![Datum::Int(id), created_on, Datum::Int(id.abs() * 10 + 1)]
}

fn request() -> PartitionRequest {
    PartitionRequest {
        name: NAME.into(),
        target: TableName::parse("events_partitioned"),
        retired: None,
        partition_key: "created_on".into(),
        ranges: RangeSpec::contiguous(&[date(1, 1), date(2, 1), date(3, 1)]),
        default_partition: false,
        identity: Some(vec!["id".into(), "created_on".into()]),
    }
}

struct Harness {
    db: MemDatabase,
    engine: Engine,
}

impl Harness {
    fn new() -> Self {
        Harness::with_config(&[])
    }

    fn with_config(overrides: &[(&str, &str)]) -> Self {
        init_logging();
        let cfg = all_configs(ConfigSet::default());
        let mut updates = ConfigUpdates::default();
        for (name, value) in overrides {
            updates.add_str(*name, *value);
        }
        updates.apply(&cfg).expect("valid config");

        let db = MemDatabase::new();
        db.create_table(events_desc()).expect("create events");
        let engine = Engine::new(
            Arc::new(db.clone()),
            Arc::new(MemStateStore::new()),
            cfg,
            &Registry::new(),
        )
        .expect("metrics register");
        Harness { db, engine }
    }

    /// Inserts `n` January rows with ids `1..=n`.
    fn seed(&self, n: i64) {
        for id in 1..=n {
            let day = u32::try_from(id % 28 + 1).expect("small");
            self.db.insert(&events(), row(id, date(1, day))).expect("insert");
        }
    }

    async fn create(&self) -> Migration {
        self.engine.create(&events(), &request()).await.expect("create")
    }

    fn count(&self, table: &str) -> usize {
        self.db.rows(&TableName::parse(table)).expect("table exists").len()
    }
}

/// Drives a fresh migration to READY_FOR_CUTOVER.
async fn ready_for_cutover(m: &mut Migration) {
    m.enable_dual_write().await.expect("enable");
    m.backfill().await.expect("backfill");
    m.verify().await.expect("gate 1");
    m.restore_constraints().await.expect("restore");
    assert_eq!(m.phase(), Phase::ReadyForCutover);
}

#[tokio::test]
async fn january_february_migration() {
    let h = Harness::new();
    h.db.insert(&events(), row(1, date(1, 5))).unwrap();
    h.db.insert(&events(), row(2, date(1, 20))).unwrap();
    h.db.insert(&events(), row(3, date(2, 3))).unwrap();
    h.db.insert(&events(), row(4, date(2, 28))).unwrap();

    let mut m = h.create().await;
    assert_eq!(m.plan().partitions.len(), 2);
    let status = m.status().await.unwrap();
    assert_eq!(status.phase, Phase::Planned);
    assert_eq!(status.rows_remaining_estimate, 4);
    assert!(!status.dual_write_active);

    m.run().await.unwrap();
    assert_eq!(m.phase(), Phase::CutOver);

    let report = m.state().last_report.clone().unwrap();
    assert_eq!(report.gate, Gate::ConstraintsRestored);
    assert_eq!(report.row_count_delta, 0);
    assert_eq!(report.checksum_delta, 0);

    // The partitioned table now answers to the original name.
    assert!(h.db.is_partitioned(&events()));
    assert_eq!(h.count("events"), 4);
    assert_eq!(h.count("events_partitioned_p0"), 2);
    assert_eq!(h.count("events_partitioned_p1"), 2);
    assert_eq!(h.count("events_unpartitioned"), 4);
    assert!(h
        .db
        .trigger_names(&TableName::parse("events_unpartitioned"))
        .is_empty());
    assert_eq!(
        h.db.sequence_owner(&TableName::parse("events_id_seq")),
        Some((events(), "id".to_owned()))
    );

    let status = m.status().await.unwrap();
    assert_eq!(status.rows_migrated, 4);
    assert_eq!(status.rows_remaining_estimate, 0);
    assert!(!status.dual_write_active);
}

#[tokio::test]
async fn repeated_batch_copies_nothing() {
    let h = Harness::new();
    h.seed(5);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    let plan = m.plan().clone();

    let before = BatchCursor::new();
    let mut cursor = before.clone();
    let first = backfill::run_batch(&h.db, &plan, &mut cursor, 2).await.unwrap();
    assert_eq!(first.scanned, 2);
    assert_eq!(first.copied, 2);

    let mut replay = before;
    let second = backfill::run_batch(&h.db, &plan, &mut replay, 2).await.unwrap();
    assert_eq!(second.scanned, 2);
    assert_eq!(second.copied, 0);
    assert_eq!(replay, cursor);
    assert_eq!(h.count("events_partitioned"), 2);
}

#[tokio::test]
async fn writes_during_backfill_are_not_lost() {
    let h = Harness::with_config(&[("backfill_batch_size", "3")]);
    h.seed(10);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();

    let mut next_id = 100;
    while !m.state().backfill.main_pass_complete {
        m.run_batch().await.unwrap();
        h.db.insert(&events(), row(next_id, date(2, 14))).unwrap();
        next_id += 1;
    }
    // A write below the high-water mark, behind the backfill.
    h.db.insert(&events(), row(0, date(1, 1))).unwrap();

    m.backfill().await.unwrap();
    assert_eq!(m.phase(), Phase::Verifying);
    assert_eq!(m.state().backfill.stragglers, 0);

    let report = m.verify().await.unwrap();
    assert!(report.is_clean(), "{report}");
    assert_eq!(h.count("events"), h.count("events_partitioned"));
    assert_eq!(m.phase(), Phase::ConstraintsRestoring);
}

#[tokio::test]
async fn failed_cutover_changes_nothing() {
    for step in CutoverStep::all() {
        let h = Harness::new();
        h.seed(6);
        let mut m = h.create().await;
        ready_for_cutover(&mut m).await;

        h.db.fail_cutover_at(Some(step));
        let err = m.cutover().await.unwrap_err();
        match err.error() {
            MigrationError::CutoverAborted { step: failed, .. } => assert_eq!(*failed, step),
            other => panic!("unexpected error at {step}: {other}"),
        }
        assert_eq!(err.phase(), Phase::ReadyForCutover);
        assert_eq!(m.phase(), Phase::ReadyForCutover);
        assert!(!h.db.is_partitioned(&events()), "{step}");
        assert_eq!(
            h.db.trigger_names(&events()),
            vec![format!("{NAME}_dual_write")]
        );
        assert_eq!(
            h.db.sequence_owner(&TableName::parse("events_id_seq")),
            Some((events(), "id".to_owned()))
        );

        // Dual-write still mirrors.
        h.db.insert(&events(), row(50, date(2, 2))).unwrap();
        assert_eq!(h.count("events_partitioned"), 7);

        h.db.fail_cutover_at(None);
        m.verify().await.unwrap();
        m.cutover().await.unwrap();
        assert_eq!(m.phase(), Phase::CutOver);
        assert!(h.db.is_partitioned(&events()));
        assert_eq!(h.count("events"), 7);
    }
}

#[tokio::test]
async fn constraint_restoration_does_not_block_writers() {
    let h = Harness::new();
    h.seed(8);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    m.backfill().await.unwrap();
    m.verify().await.unwrap();
    assert_eq!(m.phase(), Phase::ConstraintsRestoring);

    h.db.clear_lock_log();
    m.restore_constraints().await.unwrap();
    let locks = h.db.lock_log();
    assert!(!locks.is_empty());
    assert!(locks.iter().all(|l| l.table != events()), "{locks:?}");
    assert!(
        locks
            .iter()
            .filter(|l| l.scans_rows)
            .all(|l| !l.mode.blocks_writes()),
        "{locks:?}"
    );
}

#[tokio::test]
async fn restore_lock_waits_are_bounded_and_retried() {
    let h = Harness::with_config(&[("restore_lock_timeout", "250ms")]);
    h.seed(8);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    m.backfill().await.unwrap();
    m.verify().await.unwrap();

    h.db.clear_lock_log();
    h.db.fail_next_lock_waits(2);
    m.restore_constraints().await.unwrap();
    assert_eq!(m.phase(), Phase::ReadyForCutover);

    let locks = h.db.lock_log();
    let blocking: Vec<_> = locks.iter().filter(|l| l.mode.blocks_writes()).collect();
    // The parent index and the NOT VALID check.
    assert_eq!(blocking.len(), 2, "{locks:?}");
    assert!(
        blocking
            .iter()
            .all(|l| l.wait_limit == Some(Duration::from_millis(250))),
        "{locks:?}"
    );
}

#[tokio::test]
async fn restore_gives_up_after_repeated_lock_timeouts() {
    let h = Harness::with_config(&[("restore_lock_max_attempts", "2")]);
    h.seed(3);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    m.backfill().await.unwrap();
    m.verify().await.unwrap();

    h.db.fail_next_lock_waits(2);
    let err = m.restore_constraints().await.unwrap_err();
    assert!(
        matches!(err.error(), MigrationError::Database(e) if e.is_transient()),
        "{err}"
    );
    assert_eq!(m.phase(), Phase::ConstraintsRestoring);

    m.restore_constraints().await.unwrap();
    assert_eq!(m.phase(), Phase::ReadyForCutover);
}

#[tokio::test]
async fn violation_found_by_validation_names_the_row() {
    let h = Harness::new();
    h.seed(5);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    m.backfill().await.unwrap();
    m.verify().await.unwrap();

    // Writing straight to a partition skips the parent's checks, which stands
    // in for a violating row committed after the scan for violations.
    let mut late = Some(vec![Datum::Int(77), date(1, 3), Datum::Int(-1)]);
    h.db.before_validate_check(move |db| {
        if let Some(row) = late.take() {
            db.insert_bypassing_triggers(&TableName::parse("events_partitioned_p0"), row)
                .expect("insert into partition");
        }
    });

    let err = m.restore_constraints().await.unwrap_err();
    match err.error() {
        MigrationError::ConstraintViolation { constraint, key } => {
            assert_eq!(constraint, "events_partitioned_amount_positive");
            assert_eq!(key, &IdentityKey(vec![Datum::Int(77), date(1, 3)]));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(m.phase(), Phase::ConstraintsRestoring);
}

#[tokio::test]
async fn interrupted_index_build_is_redone() {
    let h = Harness::new();
    h.seed(4);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    m.backfill().await.unwrap();
    m.verify().await.unwrap();

    h.db.fail_next_index_builds(1);
    let err = m.restore_constraints().await.unwrap_err();
    assert!(
        matches!(err.error(), MigrationError::Database(_)),
        "{err}"
    );
    assert_eq!(m.phase(), Phase::ConstraintsRestoring);

    let err = m.verify().await.unwrap_err();
    match err.error() {
        MigrationError::ConstraintsPending(pending) => {
            assert!(pending.contains(&"events_partitioned_events_amount_idx".to_owned()))
        }
        other => panic!("unexpected error: {other}"),
    }

    m.restore_constraints().await.unwrap();
    assert_eq!(m.phase(), Phase::ReadyForCutover);
}

#[tokio::test]
async fn late_straggler_is_reconciled() {
    let h = Harness::with_config(&[("backfill_batch_size", "2")]);
    for id in 10..=20 {
        h.db.insert(&events(), row(id, date(1, 10))).unwrap();
    }
    // A write that committed without firing the trigger, below the cursor.
    let mut copies = 0;
    h.db.before_copy_batch(move |db| {
        copies += 1;
        if copies == 3 {
            db.insert_bypassing_triggers(&events(), row(1, date(1, 2)))
                .unwrap();
        }
    });

    let mut m = h.create().await;
    m.run().await.unwrap();
    assert_eq!(m.phase(), Phase::CutOver);
    assert_eq!(m.state().backfill.stragglers, 1);
    assert_eq!(h.count("events"), 12);
    assert_eq!(h.count("events_unpartitioned"), 12);
}

#[tokio::test]
async fn persistent_stragglers_fail_backfill() {
    let h = Harness::with_config(&[("backfill_batch_size", "3")]);
    h.seed(10);
    let mut next_id = 0;
    h.db.before_copy_batch(move |db| {
        next_id -= 1;
        db.insert_bypassing_triggers(&events(), row(next_id, date(1, 3)))
            .unwrap();
    });

    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    let err = m.backfill().await.unwrap_err();
    match err.error() {
        MigrationError::IncompleteBackfill {
            passes,
            missing,
            sample,
        } => {
            assert_eq!(*passes, 2);
            assert!(*missing > 0);
            assert!(!sample.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(m.phase(), Phase::Backfilling);
    assert_eq!(err.phase(), Phase::Backfilling);
}

#[tokio::test]
async fn newer_driver_fences_older() {
    let h = Harness::new();
    h.seed(4);
    let mut first = h.create().await;
    let mut second = h.engine.resume(NAME).await.unwrap();

    let err = first.enable_dual_write().await.unwrap_err();
    assert!(
        matches!(
            err.error(),
            MigrationError::Store(StoreError::Fenced { .. })
        ),
        "{err}"
    );

    second.run().await.unwrap();
    assert_eq!(second.phase(), Phase::CutOver);
    assert_eq!(h.engine.list().await.unwrap(), vec![NAME.to_owned()]);
}

#[tokio::test]
async fn resumed_backfill_continues_from_checkpoint() {
    let h = Harness::with_config(&[("backfill_batch_size", "2")]);
    h.seed(10);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    m.run_batch().await.unwrap();
    m.run_batch().await.unwrap();
    let high_water = m.state().cursor.high_water().cloned();
    assert_eq!(
        high_water.as_ref().map(|k| k.datums()[0].clone()),
        Some(Datum::Int(4))
    );
    drop(m);

    let mut m = h.engine.resume(NAME).await.unwrap();
    assert_eq!(m.phase(), Phase::Backfilling);
    assert_eq!(m.state().cursor.high_water().cloned(), high_water);
    assert_eq!(m.state().backfill.rows_copied, 4);

    m.run().await.unwrap();
    assert_eq!(m.phase(), Phase::CutOver);
    assert_eq!(m.state().backfill.rows_copied, 10);
    assert_eq!(h.count("events"), 10);
}

#[tokio::test]
async fn committed_cutover_is_finalized_on_resume() {
    let h = Harness::new();
    h.seed(3);
    let mut m = h.create().await;
    ready_for_cutover(&mut m).await;

    // The swap commits but the engine dies before recording it.
    let link = m.state().dual_write.clone().unwrap();
    let options = CutoverOptions::from_config(h.engine.config());
    h.db.cutover(m.plan(), &link, &options).await.unwrap();
    drop(m);

    let m = h.engine.resume(NAME).await.unwrap();
    assert_eq!(m.phase(), Phase::CutOver);
    assert!(m.state().dual_write.is_none());
}

#[tokio::test]
async fn rollback_leaves_source_authoritative() {
    let h = Harness::new();
    h.seed(5);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    m.backfill().await.unwrap();

    m.rollback().await.unwrap();
    assert_eq!(m.phase(), Phase::RolledBack);
    assert!(h.db.trigger_names(&events()).is_empty());
    assert_eq!(h.count("events_partitioned"), 5);

    h.db.insert(&events(), row(42, date(1, 9))).unwrap();
    assert_eq!(h.count("events"), 6);
    assert_eq!(h.count("events_partitioned"), 5);

    m.rollback().await.unwrap();
    let err = m.run().await.unwrap_err();
    assert!(
        matches!(
            err.error(),
            MigrationError::InvalidTransition {
                from: Phase::RolledBack,
                ..
            }
        ),
        "{err}"
    );
    let m = h.engine.resume(NAME).await.unwrap();
    assert_eq!(m.phase(), Phase::RolledBack);
}

#[tokio::test]
async fn parallel_backfill() {
    let h = Harness::with_config(&[("backfill_batch_size", "3"), ("backfill_parallelism", "4")]);
    h.seed(50);
    let mut m = h.create().await;
    m.run().await.unwrap();
    assert_eq!(m.phase(), Phase::CutOver);
    assert_eq!(h.count("events"), 50);
    assert_eq!(m.state().backfill.rows_copied, 50);
    assert_eq!(m.state().backfill.stragglers, 0);
}

#[tokio::test]
async fn transient_copy_failures_are_retried() {
    let h = Harness::new();
    h.seed(7);
    h.db.fail_next_copies(2);
    let mut m = h.create().await;
    m.run().await.unwrap();
    assert_eq!(m.phase(), Phase::CutOver);
    assert_eq!(h.count("events"), 7);
}

#[tokio::test]
async fn uncovered_rows_are_refused() {
    let h = Harness::new();
    h.seed(3);
    h.db.insert(&events(), row(9, date(3, 15))).unwrap();

    let err = h.engine.create(&events(), &request()).await.unwrap_err();
    match err.error() {
        MigrationError::Plan(PlanError::InvalidBoundary(BoundaryProblem::UncoveredRows {
            count,
            example,
        })) => {
            assert_eq!(*count, 1);
            assert_eq!(example, &IdentityKey(vec![Datum::Int(9), date(3, 15)]));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.engine.list().await.unwrap().is_empty());

    // A default partition catches them.
    let mut with_default = request();
    with_default.default_partition = true;
    let mut m = h.engine.create(&events(), &with_default).await.unwrap();
    m.run().await.unwrap();
    assert_eq!(h.count("events_partitioned_default"), 1);
}

#[tokio::test]
async fn plan_is_immutable_after_dual_write() {
    let h = Harness::new();
    h.seed(2);
    let mut m = h.create().await;

    let mut wider = request();
    wider.ranges = RangeSpec::contiguous(&[date(1, 1), date(2, 1), date(3, 1), date(4, 1)]);
    m.replan(&wider).await.unwrap();
    assert_eq!(m.plan().partitions.len(), 3);

    m.enable_dual_write().await.unwrap();
    let err = m.replan(&request()).await.unwrap_err();
    assert!(
        matches!(
            err.error(),
            MigrationError::PlanImmutable(Phase::DualWriteActive)
        ),
        "{err}"
    );

    // A second migration under the same name is refused.
    let err = h.engine.create(&events(), &request()).await.unwrap_err();
    assert!(
        matches!(
            err.error(),
            MigrationError::Store(StoreError::AlreadyExists(_))
        ),
        "{err}"
    );
}

#[tokio::test]
async fn cutover_requires_verification() {
    let h = Harness::new();
    h.seed(2);
    let mut m = h.create().await;
    let err = m.cutover().await.unwrap_err();
    assert!(
        matches!(err.error(), MigrationError::WrongPhase { .. }),
        "{err}"
    );

    let err = m.backfill().await.unwrap_err();
    assert!(
        matches!(err.error(), MigrationError::WrongPhase { .. }),
        "{err}"
    );
    assert_eq!(m.phase(), Phase::Planned);
}

#[tokio::test]
async fn constraint_violation_names_the_row() {
    init_logging();
    // The live table lacks the check the plan restores, so it holds a row the
    // check rejects.
    let db = MemDatabase::new();
    let mut live = events_desc();
    live.checks.clear();
    db.create_table(live).unwrap();
    db.insert(&events(), row(1, date(1, 4))).unwrap();
    db.insert(&events(), vec![Datum::Int(3), date(1, 7), Datum::Int(-5)])
        .unwrap();
    db.insert(&events(), row(5, date(2, 9))).unwrap();

    let cfg = all_configs(ConfigSet::default());
    let plan = plan::plan(&events_desc(), &request()).unwrap();
    let store: Arc<dyn StateStore> = Arc::new(MemStateStore::new());
    let (epoch, _) = store.open(NAME).await.unwrap();
    let checkpoint = Checkpointer::new(store, NAME.into(), epoch, MigrationMetrics::unregistered(NAME));

    let mut state = SyncState::new();
    checkpoint.save(&plan, &state).await.unwrap();
    dual_write::enable(&db, &plan, &mut state).await.unwrap();
    checkpoint.save(&plan, &state).await.unwrap();
    let options = BackfillOptions::from_config(&cfg);
    let cx = BackfillContext {
        db: &db,
        plan: &plan,
        checkpoint: &checkpoint,
        options: &options,
    };
    backfill::run(cx, &mut state).await.unwrap();
    verify::pass_gate(
        &db,
        &plan,
        &mut state,
        &checkpoint,
        &VerifyOptions::from_config(&cfg),
        Gate::Backfilled,
    )
    .await
    .unwrap();

    let options = RestoreOptions::from_config(&cfg);
    let err = restore::restore(&db, &plan, &state, &options)
        .await
        .unwrap_err();
    match err {
        MigrationError::ConstraintViolation { constraint, key } => {
            assert_eq!(constraint, "events_partitioned_amount_positive");
            assert_eq!(key, IdentityKey(vec![Datum::Int(3), date(1, 7)]));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(state.phase, Phase::ConstraintsRestoring);
    assert_eq!(
        restore::pending(&db, &plan).await.unwrap(),
        vec!["events_partitioned_amount_positive".to_owned()]
    );
}

#[tokio::test]
async fn restarted_backfill_recopies_nothing_twice() {
    let h = Harness::with_config(&[("backfill_batch_size", "2")]);
    h.seed(6);
    let mut m = h.create().await;
    m.enable_dual_write().await.unwrap();
    m.run_batch().await.unwrap();
    m.run_batch().await.unwrap();
    assert!(m.state().cursor.high_water().is_some());

    m.restart_backfill().await.unwrap();
    assert_eq!(m.phase(), Phase::Backfilling);
    assert_eq!(m.state().cursor.high_water(), None);
    assert!(!m.state().backfill.main_pass_started);

    m.run().await.unwrap();
    assert_eq!(m.phase(), Phase::CutOver);
    assert_eq!(m.state().backfill.rows_copied, 6);
    assert_eq!(h.count("events"), 6);
}

#[tokio::test]
async fn cutover_after_disabling_dual_write_is_refused() {
    let h = Harness::new();
    h.seed(4);
    let mut m = h.create().await;
    ready_for_cutover(&mut m).await;
    assert!(m.state().last_report.is_some());

    m.disable_dual_write().await.unwrap();
    assert!(m.state().last_report.is_none());
    let err = m.cutover().await.unwrap_err();
    assert!(matches!(err.error(), MigrationError::NotVerified), "{err}");

    // Even a clean report does not make the target safe to swap in: the next
    // write would reach only the source.
    let report = m.verify().await.unwrap();
    assert!(report.is_clean(), "{report}");
    let err = m.cutover().await.unwrap_err();
    assert!(
        matches!(err.error(), MigrationError::DualWriteMissing),
        "{err}"
    );

    h.db.insert(&events(), row(99, date(2, 14))).unwrap();
    assert_eq!(h.count("events_partitioned"), 4);
    let err = m.verify().await.unwrap_err();
    assert!(
        matches!(err.error(), MigrationError::VerificationFailed(_)),
        "{err}"
    );
    assert!(m.cutover().await.is_err());
    assert_eq!(m.phase(), Phase::ReadyForCutover);
    assert!(!h.db.is_partitioned(&events()));
    assert_eq!(h.count("events"), 5);

    m.rollback().await.unwrap();
    assert_eq!(m.phase(), Phase::RolledBack);
}
