// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Migrations against a real Postgres. Skipped unless
//! `MZ_PARTITION_MIGRATE_TEST_POSTGRES_URL` is set.

use std::sync::Arc;

use mz_partition_migrate::cfg::{all_configs, ConfigSet, ConfigUpdates};
use mz_partition_migrate::error::{MigrationError, StoreError};
use mz_partition_migrate::postgres::{PostgresConfig, PostgresDatabase};
use mz_partition_migrate::store::{PostgresStateStore, StateStore};
use mz_partition_migrate::types::{Datum, TableName};
use mz_partition_migrate::{Engine, PartitionRequest, Phase, RangeSpec};
use prometheus::Registry;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SCHEMA: &str = "partition_migrate_test";

async fn setup(test: &str) -> Option<(PostgresDatabase, PostgresStateStore)> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let Some(config) = PostgresConfig::new_for_test() else {
        info!(
            "{} not set, skipping {test}",
            PostgresConfig::TEST_POSTGRES_URL
        );
        return None;
    };
    let db = PostgresDatabase::open(&config).await.expect("connect");
    db.batch_execute(&format!(
        "DROP SCHEMA IF EXISTS {SCHEMA} CASCADE;
         CREATE SCHEMA {SCHEMA};
         CREATE TABLE {SCHEMA}.events (
             id bigserial PRIMARY KEY,
             created_on date NOT NULL,
             amount bigint CHECK (amount > 0)
         );
         CREATE INDEX events_amount_idx ON {SCHEMA}.events (amount);
         INSERT INTO {SCHEMA}.events (created_on, amount)
             SELECT date '2024-01-01' + (g % 59), g FROM generate_series(1, 500) g;"
    ))
    .await
    .expect("schema");
    let store = PostgresStateStore::for_database(&db).await.expect("store");
    store.drop_and_recreate().await.expect("store reset");
    Some((db, store))
}

fn request() -> PartitionRequest {
    let date = |m, d| Datum::date(2024, m, d).expect("valid date");
    PartitionRequest {
        name: "events_by_month".into(),
        target: TableName::new(SCHEMA, "events_partitioned"),
        retired: None,
        partition_key: "created_on".into(),
        ranges: RangeSpec::contiguous(&[date(1, 1), date(2, 1), date(3, 1)]),
        default_partition: false,
        identity: Some(vec!["id".into(), "created_on".into()]),
    }
}

fn engine(db: &PostgresDatabase, store: &PostgresStateStore) -> Engine {
    engine_with(db, store, &[("backfill_batch_size", "64"), ("backfill_parallelism", "2")])
}

fn engine_with(
    db: &PostgresDatabase,
    store: &PostgresStateStore,
    overrides: &[(&str, &str)],
) -> Engine {
    let cfg = all_configs(ConfigSet::default());
    let mut updates = ConfigUpdates::default();
    for (name, value) in overrides {
        updates.add_str(*name, *value);
    }
    updates.apply(&cfg).expect("valid config");
    Engine::new(
        Arc::new(db.clone()),
        Arc::new(store.clone()),
        cfg,
        &Registry::new(),
    )
    .expect("metrics register")
}

#[tokio::test]
async fn postgres_migration() {
    let Some((db, store)) = setup("postgres_migration").await else {
        return;
    };
    let engine = engine(&db, &store);
    let source = TableName::new(SCHEMA, "events");
    let mut stale = engine.create(&source, &request()).await.expect("create");
    let mut m = engine.resume("events_by_month").await.expect("resume");
    assert_eq!(m.phase(), Phase::Planned);

    let err = stale.enable_dual_write().await.unwrap_err();
    assert!(
        matches!(
            err.error(),
            MigrationError::Store(StoreError::Fenced { .. })
        ),
        "{err}"
    );
    assert_eq!(
        store.list().await.expect("list"),
        vec!["events_by_month".to_owned()]
    );

    m.enable_dual_write().await.expect("enable");
    // Writes while the backfill runs go through the trigger.
    db.batch_execute(&format!(
        "INSERT INTO {SCHEMA}.events (created_on, amount) VALUES ('2024-02-10', 7)"
    ))
    .await
    .expect("insert");
    m.run().await.expect("run");
    assert_eq!(m.phase(), Phase::CutOver);

    let client = db.pool().get().await.expect("client");
    let row = client
        .query_one(
            "SELECT c.relkind::text FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = 'events'",
            &[&SCHEMA],
        )
        .await
        .expect("catalog");
    assert_eq!(row.get::<_, String>(0), "p");
    let counts = client
        .query_one(
            &format!(
                "SELECT (SELECT count(*) FROM {SCHEMA}.events),
                        (SELECT count(*) FROM {SCHEMA}.events_unpartitioned)"
            ),
            &[],
        )
        .await
        .expect("counts");
    assert_eq!(counts.get::<_, i64>(0), 501);
    assert_eq!(counts.get::<_, i64>(1), 501);

    // The sequence keeps feeding the renamed table.
    client
        .batch_execute(&format!(
            "INSERT INTO {SCHEMA}.events (created_on, amount) VALUES ('2024-01-15', 3)"
        ))
        .await
        .expect("insert after cutover");

    text_keys_in_mixed_case(&db, &store).await;
}

/// Labels whose bytewise order ("B" < "a") differs from the usual linguistic
/// collations ("a" < "B"), copied one row per batch.
async fn text_keys_in_mixed_case(db: &PostgresDatabase, store: &PostgresStateStore) {
    const TEXT_SCHEMA: &str = "partition_migrate_text_test";
    db.batch_execute(&format!(
        "DROP SCHEMA IF EXISTS {TEXT_SCHEMA} CASCADE;
         CREATE SCHEMA {TEXT_SCHEMA};
         CREATE TABLE {TEXT_SCHEMA}.tags (
             label text NOT NULL,
             created_on date NOT NULL,
             PRIMARY KEY (label, created_on)
         );
         INSERT INTO {TEXT_SCHEMA}.tags VALUES
             ('a', '2024-01-02'), ('B', '2024-01-03'), ('c', '2024-02-04'),
             ('D', '2024-02-05'), ('e', '2024-01-06');"
    ))
    .await
    .expect("schema");

    let engine = engine_with(db, store, &[("backfill_batch_size", "1")]);
    let mut req = request();
    req.name = "tags_by_month".into();
    req.target = TableName::new(TEXT_SCHEMA, "tags_partitioned");
    req.identity = None;
    let mut m = engine
        .create(&TableName::new(TEXT_SCHEMA, "tags"), &req)
        .await
        .expect("create");
    m.run().await.expect("run");
    assert_eq!(m.phase(), Phase::CutOver);
    assert_eq!(m.state().backfill.rows_copied, 5);

    let client = db.pool().get().await.expect("client");
    let row = client
        .query_one(
            &format!("SELECT count(*) FROM {TEXT_SCHEMA}.tags"),
            &[],
        )
        .await
        .expect("count");
    assert_eq!(row.get::<_, i64>(0), 5);
}
