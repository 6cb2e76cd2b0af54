// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The schema planner.
//!
//! Given the description of an existing table and a requested range
//! partitioning, [`plan`] produces a [`MigrationPlan`]: the partitioned target
//! table, its partitions, the identity key used to deduplicate rows between
//! source and target, and the indexes, checks and sequences to carry over.
//! Planning is pure; nothing here talks to a database.

use std::collections::BTreeSet;

use postgres_protocol::escape::escape_identifier;
use serde::{Deserialize, Serialize};

use crate::error::{BoundaryProblem, PlanError};
use crate::types::{
    quote_columns, CheckDesc, ColumnDesc, Datum, IndexDesc, SequenceDesc, TableDesc, TableName,
};

/// Postgres truncates identifiers longer than this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// One requested range. `None` means unbounded (`MINVALUE`/`MAXVALUE`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub lower: Option<Datum>,
    pub upper: Option<Datum>,
}

impl RangeSpec {
    pub fn new(lower: Datum, upper: Datum) -> Self {
        RangeSpec {
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    /// Contiguous ranges between consecutive boundary values.
    pub fn contiguous(boundaries: &[Datum]) -> Vec<RangeSpec> {
        boundaries
            .windows(2)
            .map(|w| RangeSpec::new(w[0].clone(), w[1].clone()))
            .collect()
    }
}

/// What the operator asks for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRequest {
    /// Names the migration, its state record and the objects it creates.
    pub name: String,
    pub target: TableName,
    /// What the source is renamed to at cutover. Defaults to
    /// `<source>_unpartitioned`.
    pub retired: Option<TableName>,
    pub partition_key: String,
    pub ranges: Vec<RangeSpec>,
    /// Whether to add a catch-all partition for values outside every range.
    pub default_partition: bool,
    /// Identity key columns. Defaults to the source's primary key.
    pub identity: Option<Vec<String>>,
}

/// A single partition of the target table, covering `[lower, upper)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBound {
    pub name: TableName,
    pub lower: Option<Datum>,
    pub upper: Option<Datum>,
}

impl PartitionBound {
    pub fn contains(&self, value: &Datum) -> bool {
        if value.is_null() {
            return false;
        }
        let above_lower = self.lower.as_ref().map_or(true, |l| value >= l);
        let below_upper = self.upper.as_ref().map_or(true, |u| value < u);
        above_lower && below_upper
    }

    fn bound_sql(bound: &Option<Datum>, unbounded: &str) -> String {
        match bound {
            Some(d) => d.to_sql_literal(),
            None => unbounded.to_owned(),
        }
    }
}

/// The output of planning. Immutable once backfill starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub name: String,
    pub source: TableName,
    pub target: TableName,
    pub retired: TableName,
    pub columns: Vec<ColumnDesc>,
    pub partition_key: String,
    /// Ordered by lower bound, non-overlapping.
    pub partitions: Vec<PartitionBound>,
    pub default_partition: Option<TableName>,
    pub identity: Vec<String>,
    pub indexes: Vec<IndexDesc>,
    pub checks: Vec<CheckDesc>,
    pub sequences: Vec<SequenceDesc>,
}

impl MigrationPlan {
    pub fn column_names(&self) -> impl Iterator<Item = &String> {
        self.columns.iter().map(|c| &c.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Positions of the identity columns within [`Self::columns`].
    pub fn identity_positions(&self) -> Vec<usize> {
        self.identity
            .iter()
            .filter_map(|id| self.columns.iter().position(|c| &c.name == id))
            .collect()
    }

    pub fn partition_key_position(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name == self.partition_key)
    }

    /// The partition a row with partition key `value` belongs in.
    pub fn partition_for(&self, value: &Datum) -> Option<&TableName> {
        self.partitions
            .iter()
            .find(|p| p.contains(value))
            .map(|p| &p.name)
            .or(self.default_partition.as_ref())
    }

    /// Every partition table, ranges first, then the default partition.
    pub fn partition_tables(&self) -> impl Iterator<Item = &TableName> {
        self.partitions
            .iter()
            .map(|p| &p.name)
            .chain(self.default_partition.iter())
    }

    /// The name of the target's copy of a source index.
    pub fn target_index_name(&self, index: &IndexDesc) -> String {
        truncate_identifier(format!("{}_{}", self.target.name, index.name))
    }

    /// The name of the copy of `index` on one partition.
    pub fn partition_index_name(&self, index: &IndexDesc, partition: &TableName) -> String {
        truncate_identifier(format!("{}_{}", partition.name, index.name))
    }

    /// The name of the target's copy of a source check constraint.
    pub fn target_check_name(&self, check: &CheckDesc) -> String {
        truncate_identifier(format!("{}_{}", self.target.name, check.name))
    }

    /// The statements that create the empty, partitioned target table.
    ///
    /// Every statement is idempotent. The identity key becomes the target's
    /// primary key immediately since both backfill and dual-write depend on it
    /// to skip rows that are already present.
    pub fn target_ddl(&self) -> Vec<String> {
        let mut ddl = vec![format!(
            "CREATE TABLE IF NOT EXISTS {target} (LIKE {source} INCLUDING DEFAULTS INCLUDING STORAGE INCLUDING COMMENTS, PRIMARY KEY ({identity})) PARTITION BY RANGE ({key})",
            target = self.target.quoted(),
            source = self.source.quoted(),
            identity = quote_columns(&self.identity),
            key = escape_identifier(&self.partition_key),
        )];
        for p in &self.partitions {
            ddl.push(format!(
                "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ({}) TO ({})",
                p.name.quoted(),
                self.target.quoted(),
                PartitionBound::bound_sql(&p.lower, "MINVALUE"),
                PartitionBound::bound_sql(&p.upper, "MAXVALUE"),
            ));
        }
        if let Some(default) = &self.default_partition {
            ddl.push(format!(
                "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} DEFAULT",
                default.quoted(),
                self.target.quoted()
            ));
        }
        ddl
    }
}

fn truncate_identifier(mut ident: String) -> String {
    if ident.len() > MAX_IDENTIFIER_LEN {
        let mut end = MAX_IDENTIFIER_LEN;
        while !ident.is_char_boundary(end) {
            end -= 1;
        }
        ident.truncate(end);
    }
    ident
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 40
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Plans the migration of `source` to the partitioning described by `request`.
pub fn plan(source: &TableDesc, request: &PartitionRequest) -> Result<MigrationPlan, PlanError> {
    if !valid_name(&request.name) {
        return Err(PlanError::InvalidName(request.name.clone()));
    }
    if source.name == request.target {
        return Err(PlanError::SameTable(source.name.to_string()));
    }
    let table = source.name.to_string();

    let key_col = source
        .column(&request.partition_key)
        .ok_or_else(|| PlanError::UnknownColumn {
            table: table.clone(),
            column: request.partition_key.clone(),
        })?;
    if !key_col.ty.is_key_compatible() {
        return Err(PlanError::UnsupportedKeyType {
            column: key_col.name.clone(),
            ty: key_col.ty.clone(),
        });
    }

    let identity = match &request.identity {
        Some(identity) => identity.clone(),
        None => source.primary_key.clone(),
    };
    for column in &identity {
        let desc = source
            .column(column)
            .ok_or_else(|| PlanError::UnknownColumn {
                table: table.clone(),
                column: column.clone(),
            })?;
        if !desc.ty.is_key_compatible() {
            return Err(PlanError::UnsupportedKeyType {
                column: desc.name.clone(),
                ty: desc.ty.clone(),
            });
        }
        // The identity key becomes the target's primary key, which makes
        // every column in it NOT NULL.
        if desc.nullable {
            return Err(PlanError::NullableIdentityColumn {
                column: desc.name.clone(),
            });
        }
    }
    // Uniqueness is only enforced within a partition, so a key that omits the
    // partition column cannot be unique across the target.
    if !identity.contains(&request.partition_key) {
        return Err(PlanError::MissingKeyInIdentity {
            constraint: "identity key".into(),
            columns: identity,
            partition_key: request.partition_key.clone(),
        });
    }
    let identity_set: BTreeSet<_> = identity.iter().collect();
    let covers_unique_key = std::iter::once(&source.primary_key)
        .chain(source.indexes.iter().filter(|i| i.unique).map(|i| &i.columns))
        .filter(|cols| !cols.is_empty())
        .any(|cols| cols.iter().all(|c| identity_set.contains(c)));
    if !covers_unique_key {
        return Err(PlanError::IdentityNotUnique {
            table,
            columns: identity,
        });
    }
    for index in source.indexes.iter().filter(|i| i.unique) {
        if !index.columns.contains(&request.partition_key) {
            return Err(PlanError::MissingKeyInIdentity {
                constraint: format!("unique index {}", index.name),
                columns: index.columns.clone(),
                partition_key: request.partition_key.clone(),
            });
        }
    }

    let partitions = plan_partitions(request, key_col)?;
    let default_partition = request
        .default_partition
        .then(|| request.target.sibling(truncate_identifier(format!("{}_default", request.target.name))));

    // The identity key becomes the target's primary key, so an index on the
    // same columns would be redundant.
    let indexes = source
        .indexes
        .iter()
        .filter(|i| i.columns != identity)
        .cloned()
        .collect();

    let retired = request.retired.clone().unwrap_or_else(|| {
        source
            .name
            .sibling(truncate_identifier(format!("{}_unpartitioned", source.name.name)))
    });

    Ok(MigrationPlan {
        name: request.name.clone(),
        source: source.name.clone(),
        target: request.target.clone(),
        retired,
        columns: source.columns.clone(),
        partition_key: request.partition_key.clone(),
        partitions,
        default_partition,
        identity,
        indexes,
        checks: source.checks.clone(),
        sequences: source.sequences.clone(),
    })
}

fn plan_partitions(
    request: &PartitionRequest,
    key_col: &ColumnDesc,
) -> Result<Vec<PartitionBound>, PlanError> {
    let invalid = |p| Err(PlanError::InvalidBoundary(p));

    if request.ranges.is_empty() && !request.default_partition {
        return invalid(BoundaryProblem::NoPartitions);
    }
    for value in request
        .ranges
        .iter()
        .flat_map(|r| r.lower.iter().chain(r.upper.iter()))
    {
        if value.is_null() || !value.fits(&key_col.ty) {
            return invalid(BoundaryProblem::TypeMismatch {
                value: value.clone(),
                expected: key_col.ty.clone(),
            });
        }
    }

    // Sort by lower bound, unbounded first, keeping the caller's numbering
    // for error messages.
    let mut ranges: Vec<(usize, &RangeSpec)> = request.ranges.iter().enumerate().collect();
    ranges.sort_by(|(_, a), (_, b)| match (&a.lower, &b.lower) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b),
    });

    let last = ranges.len().saturating_sub(1);
    for (pos, (idx, range)) in ranges.iter().enumerate() {
        if let (Some(lower), Some(upper)) = (&range.lower, &range.upper) {
            if lower >= upper {
                return invalid(BoundaryProblem::EmptyRange {
                    lower: lower.clone(),
                    upper: upper.clone(),
                });
            }
        }
        if (range.lower.is_none() && pos != 0) || (range.upper.is_none() && pos != last) {
            return invalid(BoundaryProblem::UnboundedInterior { range: *idx });
        }
    }
    for pair in ranges.windows(2) {
        let (first_idx, first) = pair[0];
        let (second_idx, second) = pair[1];
        // Both bounds exist: interior ends were rejected above.
        let (Some(prev_upper), Some(next_lower)) = (&first.upper, &second.lower) else {
            return invalid(BoundaryProblem::Overlap {
                first: first_idx,
                second: second_idx,
            });
        };
        if next_lower < prev_upper {
            return invalid(BoundaryProblem::Overlap {
                first: first_idx,
                second: second_idx,
            });
        }
        if next_lower > prev_upper && !request.default_partition {
            return invalid(BoundaryProblem::Gap {
                after: prev_upper.clone(),
                before: next_lower.clone(),
            });
        }
    }

    Ok(ranges
        .into_iter()
        .enumerate()
        .map(|(i, (_, range))| PartitionBound {
            name: request
                .target
                .sibling(truncate_identifier(format!("{}_p{}", request.target.name, i))),
            lower: range.lower.clone(),
            upper: range.upper.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::types::ColumnType;

    fn events() -> TableDesc {
        let mut desc = TableDesc::new(
            TableName::parse("events"),
            vec![
                ColumnDesc::new("id", ColumnType::Int8, false),
                ColumnDesc::new("created_on", ColumnType::Date, false),
                ColumnDesc::new("payload", ColumnType::Text, true),
            ],
            vec!["id".into()],
        );
        desc.indexes.push(IndexDesc {
            name: "events_payload_idx".into(),
            columns: vec!["payload".into()],
            unique: false,
        });
        desc.sequences.push(SequenceDesc {
            name: TableName::parse("events_id_seq"),
            column: "id".into(),
        });
        desc
    }

    fn date(m: u32) -> Datum {
        Datum::date(2024, m, 1).unwrap()
    }

    fn request(ranges: Vec<RangeSpec>) -> PartitionRequest {
        PartitionRequest {
            name: "events_by_month".into(),
            target: TableName::parse("events_partitioned"),
            retired: None,
            partition_key: "created_on".into(),
            ranges,
            default_partition: false,
            identity: Some(vec!["id".into(), "created_on".into()]),
        }
    }

    #[test]
    fn monthly_plan() {
        let plan = plan(&events(), &request(RangeSpec::contiguous(&[date(1), date(2), date(3)])))
            .unwrap();
        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(plan.partitions[0].name.name, "events_partitioned_p0");
        assert_eq!(plan.retired.name, "events_unpartitioned");
        assert_eq!(
            plan.partition_for(&Datum::date(2024, 1, 31).unwrap()),
            Some(&plan.partitions[0].name)
        );
        assert_eq!(plan.partition_for(&date(2)), Some(&plan.partitions[1].name));
        assert_eq!(plan.partition_for(&date(3)), None);
        assert_eq!(plan.indexes.len(), 1);

        let ddl = plan.target_ddl();
        assert_eq!(ddl.len(), 3);
        assert!(ddl[0].contains("PRIMARY KEY (\"id\", \"created_on\")"), "{}", ddl[0]);
        assert!(ddl[0].ends_with("PARTITION BY RANGE (\"created_on\")"), "{}", ddl[0]);
        assert!(
            ddl[1].ends_with("FOR VALUES FROM ('2024-01-01'::date) TO ('2024-02-01'::date)"),
            "{}",
            ddl[1]
        );
    }

    #[test]
    fn identity_must_include_partition_key() {
        let mut req = request(RangeSpec::contiguous(&[date(1), date(2)]));
        req.identity = None;
        assert!(matches!(
            plan(&events(), &req),
            Err(PlanError::MissingKeyInIdentity { .. })
        ));
    }

    #[test]
    fn unique_index_must_include_partition_key() {
        let mut source = events();
        source.indexes.push(IndexDesc {
            name: "events_payload_key".into(),
            columns: vec!["payload".into()],
            unique: true,
        });
        let err = plan(&source, &request(RangeSpec::contiguous(&[date(1), date(2)]))).unwrap_err();
        assert!(err.to_string().contains("events_payload_key"), "{}", err);
    }

    #[test]
    fn identity_must_be_unique_in_source() {
        let mut req = request(RangeSpec::contiguous(&[date(1), date(2)]));
        req.identity = Some(vec!["created_on".into()]);
        assert!(matches!(
            plan(&events(), &req),
            Err(PlanError::IdentityNotUnique { .. })
        ));
    }

    #[test]
    fn boundary_problems() {
        let overlap = request(vec![
            RangeSpec::new(date(1), date(3)),
            RangeSpec::new(date(2), date(4)),
        ]);
        assert!(matches!(
            plan(&events(), &overlap),
            Err(PlanError::InvalidBoundary(BoundaryProblem::Overlap { .. }))
        ));

        let mut gap = request(vec![
            RangeSpec::new(date(1), date(2)),
            RangeSpec::new(date(3), date(4)),
        ]);
        assert!(matches!(
            plan(&events(), &gap),
            Err(PlanError::InvalidBoundary(BoundaryProblem::Gap { .. }))
        ));
        gap.default_partition = true;
        let p = plan(&events(), &gap).unwrap();
        assert_eq!(
            p.partition_for(&Datum::date(2024, 2, 15).unwrap()),
            p.default_partition.as_ref()
        );

        let empty = request(vec![RangeSpec::new(date(2), date(2))]);
        assert!(matches!(
            plan(&events(), &empty),
            Err(PlanError::InvalidBoundary(BoundaryProblem::EmptyRange { .. }))
        ));

        let wrong_type = request(vec![RangeSpec::new(Datum::Int(1), Datum::Int(2))]);
        assert!(matches!(
            plan(&events(), &wrong_type),
            Err(PlanError::InvalidBoundary(BoundaryProblem::TypeMismatch { .. }))
        ));

        let interior = request(vec![
            RangeSpec::new(date(1), date(2)),
            RangeSpec {
                lower: Some(date(2)),
                upper: None,
            },
            RangeSpec::new(date(5), date(6)),
        ]);
        assert!(matches!(
            plan(&events(), &interior),
            Err(PlanError::InvalidBoundary(BoundaryProblem::UnboundedInterior { .. }))
        ));

        assert!(matches!(
            plan(&events(), &request(vec![])),
            Err(PlanError::InvalidBoundary(BoundaryProblem::NoPartitions))
        ));
    }

    #[test]
    fn nullable_identity_columns_are_rejected() {
        let mut source = events();
        source.columns[1].nullable = true;
        let mut req = request(RangeSpec::contiguous(&[date(1), date(2)]));
        let nullable_key = Err(PlanError::NullableIdentityColumn {
            column: "created_on".into(),
        });
        assert_eq!(plan(&source, &req), nullable_key);
        // A default partition does not help: the target key is NOT NULL.
        req.default_partition = true;
        assert_eq!(plan(&source, &req), nullable_key);

        let mut req = request(RangeSpec::contiguous(&[date(1), date(2)]));
        req.identity = Some(vec!["id".into(), "created_on".into(), "payload".into()]);
        assert_eq!(
            plan(&events(), &req),
            Err(PlanError::NullableIdentityColumn {
                column: "payload".into()
            })
        );
    }

    #[test]
    fn unbounded_outer_ranges() {
        let req = request(vec![
            RangeSpec {
                lower: None,
                upper: Some(date(2)),
            },
            RangeSpec {
                lower: Some(date(2)),
                upper: None,
            },
        ]);
        let p = plan(&events(), &req).unwrap();
        assert!(p.target_ddl()[1].contains("FROM (MINVALUE)"));
        assert!(p.target_ddl()[2].contains("TO (MAXVALUE)"));
        assert_eq!(
            p.partition_for(&Datum::date(1999, 1, 1).unwrap()),
            Some(&p.partitions[0].name)
        );
        assert_eq!(
            p.partition_for(&Datum::date(2999, 1, 1).unwrap()),
            Some(&p.partitions[1].name)
        );
    }

    #[test]
    fn rejects_bad_names() {
        let mut req = request(RangeSpec::contiguous(&[date(1), date(2)]));
        req.name = "Events; DROP".into();
        assert!(matches!(plan(&events(), &req), Err(PlanError::InvalidName(_))));
        let mut req = request(RangeSpec::contiguous(&[date(1), date(2)]));
        req.target = TableName::parse("events");
        assert!(matches!(plan(&events(), &req), Err(PlanError::SameTable(_))));
    }

    proptest! {
        #[test]
        fn contiguous_ranges_route_every_covered_value_once(
            mut points in proptest::collection::btree_set(-1000i64..1000, 2..12),
            value in -1200i64..1200,
        ) {
            let mut source = events();
            source.columns[0].ty = ColumnType::Int8;
            let boundaries: Vec<Datum> = std::mem::take(&mut points).into_iter().map(Datum::Int).collect();
            let mut req = request(RangeSpec::contiguous(&boundaries));
            req.partition_key = "id".into();
            req.identity = None;
            let p = plan(&source, &req).unwrap();

            let value = Datum::Int(value);
            let hits = p.partitions.iter().filter(|b| b.contains(&value)).count();
            let covered = value >= boundaries[0] && value < boundaries[boundaries.len() - 1];
            prop_assert_eq!(hits, usize::from(covered));
            prop_assert_eq!(p.partition_for(&value).is_some(), covered);
        }
    }
}
