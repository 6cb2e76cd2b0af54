// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable, fenced storage of migration state.
//!
//! Each migration is stored as one [`MigrationRecord`] under its name, next to
//! an epoch. [`StateStore::open`] bumps the epoch and every later
//! [`StateStore::save`] must present it, so once a second engine process opens
//! a migration the first one can no longer write to it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MigrationError, StoreError};
use crate::metrics::MigrationMetrics;
use crate::plan::MigrationPlan;
use crate::postgres::{PostgresConfig, PostgresDatabase};
use crate::state::{Phase, SyncState};

/// The persisted unit: a migration's plan and its state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub plan: MigrationPlan,
    pub state: SyncState,
}

#[derive(Serialize)]
struct MigrationRecordRef<'a> {
    plan: &'a MigrationPlan,
    state: &'a SyncState,
}

fn encode(plan: &MigrationPlan, state: &SyncState) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::to_value(MigrationRecordRef { plan, state })?)
}

/// Where migration records live.
#[async_trait]
pub trait StateStore: Debug + Send + Sync {
    /// Takes ownership of the named migration: bumps and returns its epoch,
    /// along with its record if one was ever saved.
    async fn open(&self, name: &str) -> Result<(u64, Option<MigrationRecord>), StoreError>;

    /// Replaces the record of the named migration, provided `epoch` is still
    /// current.
    async fn save(
        &self,
        name: &str,
        epoch: u64,
        plan: &MigrationPlan,
        state: &SyncState,
    ) -> Result<(), StoreError>;

    /// Names of all migrations with a saved record.
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Saves the state of one opened migration.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    store: Arc<dyn StateStore>,
    name: String,
    epoch: u64,
    metrics: MigrationMetrics,
}

impl Checkpointer {
    pub fn new(
        store: Arc<dyn StateStore>,
        name: String,
        epoch: u64,
        metrics: MigrationMetrics,
    ) -> Self {
        Checkpointer {
            store,
            name,
            epoch,
            metrics,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn metrics(&self) -> &MigrationMetrics {
        &self.metrics
    }

    pub async fn save(&self, plan: &MigrationPlan, state: &SyncState) -> Result<(), StoreError> {
        self.store.save(&self.name, self.epoch, plan, state).await?;
        debug!(
            migration = %self.name,
            epoch = self.epoch,
            phase = %state.phase,
            high_water = ?state.cursor.high_water(),
            "checkpointed"
        );
        Ok(())
    }

    /// Moves `state` to the next phase `to` and saves it.
    pub async fn advance(
        &self,
        plan: &MigrationPlan,
        state: &mut SyncState,
        to: Phase,
    ) -> Result<(), MigrationError> {
        let from = state.phase;
        state.advance(to)?;
        self.save(plan, state).await?;
        self.record_transition(from, to);
        Ok(())
    }

    /// Moves `state` to [`Phase::RolledBack`] and saves it.
    pub async fn roll_back(
        &self,
        plan: &MigrationPlan,
        state: &mut SyncState,
    ) -> Result<(), MigrationError> {
        let from = state.phase;
        state.roll_back()?;
        self.save(plan, state).await?;
        self.record_transition(from, Phase::RolledBack);
        Ok(())
    }

    pub(crate) fn record_transition(&self, from: Phase, to: Phase) {
        self.metrics.phase_transitions.inc();
        self.metrics.set_phase(to);
        info!(migration = %self.name, %from, %to, "phase transition");
    }
}

#[derive(Debug)]
struct MemEntry {
    epoch: u64,
    record: Option<String>,
}

/// An in-memory implementation of [StateStore], for tests.
///
/// Records are kept in their serialized form so that tests exercise the same
/// encoding as the durable store.
#[derive(Debug, Clone, Default)]
pub struct MemStateStore {
    entries: Arc<Mutex<BTreeMap<String, MemEntry>>>,
}

impl MemStateStore {
    pub fn new() -> Self {
        MemStateStore::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StateStore for MemStateStore {
    async fn open(&self, name: &str) -> Result<(u64, Option<MigrationRecord>), StoreError> {
        let mut entries = self.entries();
        let entry = entries.entry(name.to_owned()).or_insert(MemEntry {
            epoch: 0,
            record: None,
        });
        entry.epoch += 1;
        let record = entry
            .record
            .as_deref()
            .map(serde_json::from_str::<MigrationRecord>)
            .transpose()?;
        Ok((entry.epoch, record))
    }

    async fn save(
        &self,
        name: &str,
        epoch: u64,
        plan: &MigrationPlan,
        state: &SyncState,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&encode(plan, state)?)?;
        let mut entries = self.entries();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if entry.epoch != epoch {
            return Err(StoreError::Fenced {
                migration: name.to_owned(),
                ours: epoch,
                current: entry.epoch,
            });
        }
        entry.record = Some(encoded);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries()
            .iter()
            .filter(|(_, e)| e.record.is_some())
            .map(|(name, _)| name.clone())
            .collect())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS partition_migrations (
    name text PRIMARY KEY,
    epoch bigint NOT NULL,
    record jsonb,
    updated_at timestamptz NOT NULL DEFAULT now()
)
";

/// Implementation of [StateStore] over a Postgres table.
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: Pool,
}

impl std::fmt::Debug for PostgresStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStateStore").finish_non_exhaustive()
    }
}

impl PostgresStateStore {
    /// Connects and creates the state table if needed.
    pub async fn open(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = config.build_pool().map_err(StoreError::Connection)?;
        let client = pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        info!("opened partition migration state store");
        Ok(PostgresStateStore { pool })
    }

    /// Shares the connection pool of a database handle.
    pub async fn for_database(db: &PostgresDatabase) -> Result<Self, StoreError> {
        let pool = db.pool().clone();
        let client = pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(PostgresStateStore { pool })
    }

    /// Drops and recreates the state table.
    ///
    /// ONLY FOR TESTING
    pub async fn drop_and_recreate(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS partition_migrations; {}", SCHEMA))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn open(&self, name: &str) -> Result<(u64, Option<MigrationRecord>), StoreError> {
        // Bump the epoch, which will cause any previous opener to fail.
        let q = "INSERT INTO partition_migrations (name, epoch) VALUES ($1, 1)
             ON CONFLICT (name) DO UPDATE SET epoch = partition_migrations.epoch + 1
             RETURNING epoch, record";
        let client = self.pool.get().await?;
        let statement = client.prepare_cached(q).await?;
        let row = client.query_one(&statement, &[&name]).await?;
        let epoch: i64 = row.try_get("epoch")?;
        let record: Option<serde_json::Value> = row.try_get("record")?;
        let record = record.map(serde_json::from_value).transpose()?;
        Ok((u64::try_from(epoch).unwrap_or(0), record))
    }

    async fn save(
        &self,
        name: &str,
        epoch: u64,
        plan: &MigrationPlan,
        state: &SyncState,
    ) -> Result<(), StoreError> {
        let record = encode(plan, state)?;
        let epoch_param = i64::try_from(epoch).unwrap_or(i64::MAX);
        let q = "UPDATE partition_migrations SET record = $3, updated_at = now()
             WHERE name = $1 AND epoch = $2";
        let client = self.pool.get().await?;
        let statement = client.prepare_cached(q).await?;
        let updated = client
            .execute(&statement, &[&name, &epoch_param, &record])
            .await?;
        if updated == 1 {
            return Ok(());
        }
        let current = client
            .query_opt(
                "SELECT epoch FROM partition_migrations WHERE name = $1",
                &[&name],
            )
            .await?;
        match current {
            None => Err(StoreError::NotFound(name.to_owned())),
            Some(row) => {
                let current: i64 = row.try_get("epoch")?;
                Err(StoreError::Fenced {
                    migration: name.to_owned(),
                    ours: epoch,
                    current: u64::try_from(current).unwrap_or(0),
                })
            }
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT name FROM partition_migrations WHERE record IS NOT NULL ORDER BY name",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get("name").map_err(StoreError::from))
            .collect()
    }
}
