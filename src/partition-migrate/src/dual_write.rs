// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Mirroring of new source rows into the target.
//!
//! While a migration runs, every row inserted into the source is also inserted
//! into the target by an `AFTER INSERT` row trigger, inside the inserting
//! transaction. Rows already present in the target (by identity key) are
//! skipped, which is what lets backfill and mirroring race safely.
//!
//! Only inserts are mirrored. Updates and deletes on the source while a
//! migration is in flight are not carried over.

use postgres_protocol::escape::escape_identifier;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{ConflictPolicy, Database};
use crate::error::MigrationError;
use crate::plan::MigrationPlan;
use crate::state::{Phase, SyncState};
use crate::types::{quote_columns, TableName};

/// The installed mirroring of one migration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualWriteLink {
    /// Trigger name, on the source table.
    pub trigger: String,
    /// The trigger function, in the source's schema.
    pub function: TableName,
    /// Source column to target column.
    pub columns: Vec<(String, String)>,
    pub conflict: ConflictPolicy,
}

impl DualWriteLink {
    /// The link for `plan`. Names are derived from the migration name, so the
    /// same plan always yields the same link.
    pub fn for_plan(plan: &MigrationPlan) -> Self {
        let name = format!("{}_dual_write", plan.name);
        DualWriteLink {
            trigger: name.clone(),
            function: plan.source.sibling(name),
            columns: plan
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.name.clone()))
                .collect(),
            conflict: ConflictPolicy::SkipOnDuplicateIdentity,
        }
    }

    /// `CREATE FUNCTION` for the trigger function.
    pub fn function_ddl(&self, plan: &MigrationPlan) -> String {
        let targets: Vec<String> = self.columns.iter().map(|(_, t)| t.clone()).collect();
        let values = self
            .columns
            .iter()
            .map(|(s, _)| format!("NEW.{}", escape_identifier(s)))
            .collect::<Vec<_>>()
            .join(", ");
        let on_conflict = match self.conflict {
            ConflictPolicy::SkipOnDuplicateIdentity => {
                format!(" ON CONFLICT ({}) DO NOTHING", quote_columns(&plan.identity))
            }
            ConflictPolicy::Fail => String::new(),
        };
        format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS $mz_dual_write$
BEGIN
    INSERT INTO {target} ({columns}) VALUES ({values}){on_conflict};
    RETURN NULL;
END
$mz_dual_write$",
            function = self.function.quoted(),
            target = plan.target.quoted(),
            columns = quote_columns(&targets),
        )
    }

    /// `CREATE TRIGGER` attaching the function to the source.
    pub fn trigger_ddl(&self, plan: &MigrationPlan) -> String {
        format!(
            "CREATE TRIGGER {} AFTER INSERT ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
            escape_identifier(&self.trigger),
            plan.source.quoted(),
            self.function.quoted()
        )
    }

    /// Statements that remove the trigger and its function, if present.
    pub fn drop_ddl(&self, table: &TableName) -> [String; 2] {
        [
            format!(
                "DROP TRIGGER IF EXISTS {} ON {}",
                escape_identifier(&self.trigger),
                table.quoted()
            ),
            format!("DROP FUNCTION IF EXISTS {}()", self.function.quoted()),
        ]
    }
}

/// Creates the target and starts mirroring source inserts into it.
///
/// Resuming in DUAL_WRITE_ACTIVE reinstalls the trigger if it went missing.
pub async fn enable(
    db: &dyn Database,
    plan: &MigrationPlan,
    state: &mut SyncState,
) -> Result<(), MigrationError> {
    state.expect_phase("enable dual-write", &[Phase::Planned, Phase::DualWriteActive])?;
    let link = state
        .dual_write
        .clone()
        .unwrap_or_else(|| DualWriteLink::for_plan(plan));

    if state.phase == Phase::DualWriteActive && db.dual_write_installed(plan, &link).await? {
        debug!(migration = %plan.name, "dual-write already active");
        return Ok(());
    }

    db.create_target(plan).await?;
    db.install_dual_write(plan, &link).await?;
    info!(
        migration = %plan.name,
        source = %plan.source,
        target = %plan.target,
        trigger = %link.trigger,
        "dual-write enabled"
    );
    state.dual_write = Some(link);
    if state.phase == Phase::Planned {
        state.advance(Phase::DualWriteActive)?;
    }
    Ok(())
}

/// Stops mirroring. Only allowed once the target is ready to take over, or
/// after a rollback. Disabling twice is a no-op.
///
/// Writes after this point reach only the source, so a verification report
/// taken while mirroring no longer describes the target and is dropped.
pub async fn disable(
    db: &dyn Database,
    plan: &MigrationPlan,
    state: &mut SyncState,
) -> Result<(), MigrationError> {
    state.expect_phase(
        "disable dual-write",
        &[Phase::ReadyForCutover, Phase::RolledBack],
    )?;
    let Some(link) = state.dual_write.clone() else {
        debug!(migration = %plan.name, "dual-write already disabled");
        return Ok(());
    };
    db.remove_dual_write(plan, &link).await?;
    info!(migration = %plan.name, trigger = %link.trigger, "dual-write disabled");
    state.dual_write = None;
    if state.phase == Phase::ReadyForCutover {
        state.last_report = None;
    }
    state.touch();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{plan, PartitionRequest, RangeSpec};
    use crate::types::{ColumnDesc, ColumnType, Datum, TableDesc};

    fn test_plan() -> MigrationPlan {
        let desc = TableDesc::new(
            TableName::parse("events"),
            vec![
                ColumnDesc::new("id", ColumnType::Int8, false),
                ColumnDesc::new("created_on", ColumnType::Date, false),
            ],
            vec!["id".into()],
        );
        let req = PartitionRequest {
            name: "events_by_month".into(),
            target: TableName::parse("events_partitioned"),
            retired: None,
            partition_key: "created_on".into(),
            ranges: vec![RangeSpec::new(
                Datum::date(2024, 1, 1).unwrap(),
                Datum::date(2024, 2, 1).unwrap(),
            )],
            default_partition: false,
            identity: Some(vec!["id".into(), "created_on".into()]),
        };
        plan(&desc, &req).unwrap()
    }

    #[test]
    fn trigger_sql() {
        let plan = test_plan();
        let link = DualWriteLink::for_plan(&plan);
        assert_eq!(link.trigger, "events_by_month_dual_write");
        let function = link.function_ddl(&plan);
        assert!(
            function.contains(
                "INSERT INTO \"public\".\"events_partitioned\" (\"id\", \"created_on\") VALUES (NEW.\"id\", NEW.\"created_on\") ON CONFLICT (\"id\", \"created_on\") DO NOTHING;"
            ),
            "{}",
            function
        );
        assert_eq!(
            link.trigger_ddl(&plan),
            "CREATE TRIGGER \"events_by_month_dual_write\" AFTER INSERT ON \"public\".\"events\" FOR EACH ROW EXECUTE FUNCTION \"public\".\"events_by_month_dual_write\"()"
        );
    }
}
