// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use std::time::Duration;

use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry,
};

use crate::state::Phase;

/// Prometheus monitoring metrics for partition migrations.
///
/// Intentionally not Clone because we expect this to be passed around in an
/// Arc.
pub struct Metrics {
    batches: IntCounterVec,
    rows_copied: IntCounterVec,
    rows_scanned: IntCounterVec,
    batch_retries: IntCounterVec,
    batch_seconds: CounterVec,
    stragglers: IntCounterVec,
    verifications: IntCounterVec,
    verification_failures: IntCounterVec,
    phase_transitions: IntCounterVec,
    phase: IntGaugeVec,
    cutover_attempts: IntCounterVec,
    cutover_aborts: IntCounterVec,
    cutover_seconds: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Returns a new [Metrics] instance connected to the given registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
            let vec = IntCounterVec::new(Opts::new(name, help), &["migration"])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        }

        let batch_seconds = CounterVec::new(
            Opts::new(
                "mz_partition_migrate_backfill_batch_seconds",
                "time spent copying backfill batches",
            ),
            &["migration"],
        )?;
        registry.register(Box::new(batch_seconds.clone()))?;
        let phase = IntGaugeVec::new(
            Opts::new(
                "mz_partition_migrate_phase",
                "1 for the phase each migration is currently in, 0 otherwise",
            ),
            &["migration", "phase"],
        )?;
        registry.register(Box::new(phase.clone()))?;
        let cutover_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mz_partition_migrate_cutover_seconds",
                "duration of cutover transactions, including lock waits",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["migration"],
        )?;
        registry.register(Box::new(cutover_seconds.clone()))?;

        Ok(Metrics {
            batches: counter(
                registry,
                "mz_partition_migrate_backfill_batches",
                "count of backfill batches committed",
            )?,
            rows_copied: counter(
                registry,
                "mz_partition_migrate_backfill_rows_copied",
                "count of rows inserted into the target by backfill",
            )?,
            rows_scanned: counter(
                registry,
                "mz_partition_migrate_backfill_rows_scanned",
                "count of source rows read by backfill, including ones already present",
            )?,
            batch_retries: counter(
                registry,
                "mz_partition_migrate_backfill_batch_retries",
                "count of backfill batches retried after a transient error",
            )?,
            batch_seconds,
            stragglers: counter(
                registry,
                "mz_partition_migrate_reconciliation_stragglers",
                "count of rows copied by reconciliation passes",
            )?,
            verifications: counter(
                registry,
                "mz_partition_migrate_verifications",
                "count of verification runs",
            )?,
            verification_failures: counter(
                registry,
                "mz_partition_migrate_verification_failures",
                "count of verification runs that found a difference",
            )?,
            phase_transitions: counter(
                registry,
                "mz_partition_migrate_phase_transitions",
                "count of persisted phase transitions",
            )?,
            phase,
            cutover_attempts: counter(
                registry,
                "mz_partition_migrate_cutover_attempts",
                "count of cutover transactions started",
            )?,
            cutover_aborts: counter(
                registry,
                "mz_partition_migrate_cutover_aborts",
                "count of cutover transactions that were reverted",
            )?,
            cutover_seconds,
        })
    }

    /// Metrics for one migration.
    pub fn migration(&self, name: &str) -> MigrationMetrics {
        let labels = &[name];
        MigrationMetrics {
            name: name.to_owned(),
            batches: self.batches.with_label_values(labels),
            rows_copied: self.rows_copied.with_label_values(labels),
            rows_scanned: self.rows_scanned.with_label_values(labels),
            batch_retries: self.batch_retries.with_label_values(labels),
            batch_seconds: self.batch_seconds.with_label_values(labels),
            stragglers: self.stragglers.with_label_values(labels),
            verifications: self.verifications.with_label_values(labels),
            verification_failures: self.verification_failures.with_label_values(labels),
            phase_transitions: self.phase_transitions.with_label_values(labels),
            cutover_attempts: self.cutover_attempts.with_label_values(labels),
            cutover_aborts: self.cutover_aborts.with_label_values(labels),
            cutover_seconds: self.cutover_seconds.with_label_values(labels),
            phase: self.phase.clone(),
        }
    }
}

/// The metrics of a single migration, with the label already applied.
#[derive(Debug, Clone)]
pub struct MigrationMetrics {
    name: String,
    pub batches: IntCounter,
    pub rows_copied: IntCounter,
    pub rows_scanned: IntCounter,
    pub batch_retries: IntCounter,
    pub batch_seconds: prometheus::Counter,
    pub stragglers: IntCounter,
    pub verifications: IntCounter,
    pub verification_failures: IntCounter,
    pub phase_transitions: IntCounter,
    pub cutover_attempts: IntCounter,
    pub cutover_aborts: IntCounter,
    pub cutover_seconds: prometheus::Histogram,
    phase: IntGaugeVec,
}

impl MigrationMetrics {
    /// Metrics that are not reported anywhere.
    pub fn unregistered(name: &str) -> Self {
        // A fresh registry cannot already hold these names.
        match Metrics::new(&Registry::new()) {
            Ok(metrics) => metrics.migration(name),
            Err(err) => unreachable!("registering metrics to an empty registry: {}", err),
        }
    }

    /// Records that the migration is now in `phase`.
    pub fn set_phase(&self, phase: Phase) {
        for p in Phase::all() {
            self.phase
                .with_label_values(&[self.name.as_str(), p.as_str()])
                .set(i64::from(p == phase));
        }
    }

    pub fn observe_batch(&self, scanned: u64, copied: u64, elapsed: Duration) {
        self.batches.inc();
        self.rows_scanned.inc_by(scanned);
        self.rows_copied.inc_by(copied);
        self.batch_seconds.inc_by(elapsed.as_secs_f64());
    }
}
