// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Descriptions of tables, columns and the values that identify rows.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres_protocol::escape::{escape_identifier, escape_literal};
use serde::{Deserialize, Serialize};

/// A schema-qualified table (or sequence, or index) name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        TableName {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parses `schema.name` or a bare `name`, which is placed in `public`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((schema, name)) => TableName::new(schema, name),
            None => TableName::new("public", s),
        }
    }

    /// A name in the same schema as `self`.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        TableName::new(self.schema.clone(), name)
    }

    /// The quoted, schema-qualified form suitable for splicing into SQL.
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}",
            escape_identifier(&self.schema),
            escape_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// The SQL type of a column, as far as the engine needs to understand it.
///
/// Only identity and partition key columns need a concrete type. Everything
/// else is copied by the database without being decoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int2,
    Int4,
    Int8,
    Text,
    Date,
    Timestamp,
    TimestampTz,
    /// Any other type, by its `format_type` name.
    Other(String),
}

impl ColumnType {
    /// Maps the output of Postgres' `format_type` to a [`ColumnType`].
    pub fn from_pg_name(name: &str) -> Self {
        match name {
            "boolean" => ColumnType::Bool,
            "smallint" => ColumnType::Int2,
            "integer" => ColumnType::Int4,
            "bigint" => ColumnType::Int8,
            "text" => ColumnType::Text,
            "date" => ColumnType::Date,
            "timestamp without time zone" => ColumnType::Timestamp,
            "timestamp with time zone" => ColumnType::TimestampTz,
            n if n.starts_with("character varying") => ColumnType::Text,
            n => ColumnType::Other(n.to_owned()),
        }
    }

    /// Whether values of this type can be decoded into a [`Datum`] and thus
    /// take part in an identity or partition key.
    pub fn is_key_compatible(&self) -> bool {
        !matches!(self, ColumnType::Other(_))
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Bool => f.write_str("boolean"),
            ColumnType::Int2 => f.write_str("smallint"),
            ColumnType::Int4 => f.write_str("integer"),
            ColumnType::Int8 => f.write_str("bigint"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Date => f.write_str("date"),
            ColumnType::Timestamp => f.write_str("timestamp without time zone"),
            ColumnType::TimestampTz => f.write_str("timestamp with time zone"),
            ColumnType::Other(name) => f.write_str(name),
        }
    }
}

/// A single decoded value.
///
/// The derived ordering is only meaningful between values of the same
/// variant, which is all the engine ever compares.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Datum {
    /// Convenience constructor for dates, mostly for tests and examples.
    pub fn date(y: i32, m: u32, d: u32) -> Option<Datum> {
        NaiveDate::from_ymd_opt(y, m, d).map(Datum::Date)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Whether this value can be stored in a column of type `ty`.
    pub fn fits(&self, ty: &ColumnType) -> bool {
        match (self, ty) {
            (Datum::Null, _) => true,
            (Datum::Bool(_), ColumnType::Bool) => true,
            (Datum::Int(i), ColumnType::Int2) => i16::try_from(*i).is_ok(),
            (Datum::Int(i), ColumnType::Int4) => i32::try_from(*i).is_ok(),
            (Datum::Int(_), ColumnType::Int8) => true,
            (Datum::Text(_), ColumnType::Text) => true,
            (Datum::Date(_), ColumnType::Date) => true,
            (Datum::Timestamp(_), ColumnType::Timestamp) => true,
            (Datum::TimestampTz(_), ColumnType::TimestampTz) => true,
            _ => false,
        }
    }

    /// Renders this value as a SQL literal.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Datum::Null => "NULL".into(),
            Datum::Bool(b) => b.to_string(),
            Datum::Int(i) => i.to_string(),
            Datum::Text(s) => escape_literal(s),
            Datum::Date(d) => format!("{}::date", escape_literal(&d.to_string())),
            Datum::Timestamp(ts) => format!(
                "{}::timestamp",
                escape_literal(&ts.format("%Y-%m-%d %H:%M:%S%.f").to_string())
            ),
            Datum::TimestampTz(ts) => {
                format!("{}::timestamptz", escape_literal(&ts.to_rfc3339()))
            }
        }
    }

    /// Renders this value as text, the way row comparisons see it.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Datum::Null => None,
            Datum::Bool(b) => Some(b.to_string()),
            Datum::Int(i) => Some(i.to_string()),
            Datum::Text(s) => Some(s.clone()),
            Datum::Date(d) => Some(d.to_string()),
            Datum::Timestamp(ts) => Some(ts.to_string()),
            Datum::TimestampTz(ts) => Some(ts.to_string()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl From<i64> for Datum {
    fn from(i: i64) -> Self {
        Datum::Int(i)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::Text(s.to_owned())
    }
}

impl From<NaiveDate> for Datum {
    fn from(d: NaiveDate) -> Self {
        Datum::Date(d)
    }
}

/// A row, as an ordered list of values matching a table's columns.
pub type Row = Vec<Datum>;

/// The values of a row's identity key columns, in identity key order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub Vec<Datum>);

impl IdentityKey {
    pub fn datums(&self) -> &[Datum] {
        &self.0
    }

    /// Text form of the key, used when hashing keys for checksums.
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, datum) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", datum)?;
        }
        f.write_str(")")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        ColumnDesc {
            name: name.into(),
            ty,
            nullable,
        }
    }
}

/// A plain (non-expression) btree index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDesc {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Comparison operators usable in structured check predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
        }
    }

    pub fn apply(&self, lhs: &Datum, rhs: &Datum) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }
}

/// The boolean expression of a CHECK constraint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckPredicate {
    /// `column IS NOT NULL`.
    NotNull { column: String },
    /// `column <op> value`.
    Compare {
        column: String,
        op: CmpOp,
        value: Datum,
    },
    /// An arbitrary SQL expression, as reported by the database.
    Sql(String),
}

impl CheckPredicate {
    pub fn to_sql(&self) -> String {
        match self {
            CheckPredicate::NotNull { column } => {
                format!("{} IS NOT NULL", escape_identifier(column))
            }
            CheckPredicate::Compare { column, op, value } => format!(
                "{} {} {}",
                escape_identifier(column),
                op.as_sql(),
                value.to_sql_literal()
            ),
            CheckPredicate::Sql(expr) => expr.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDesc {
    pub name: String,
    pub predicate: CheckPredicate,
}

/// A sequence owned by (i.e. feeding the default of) a table column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDesc {
    pub name: TableName,
    pub column: String,
}

/// Everything the planner needs to know about an existing table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDesc {
    pub name: TableName,
    pub columns: Vec<ColumnDesc>,
    /// Primary key columns, empty if the table has none.
    pub primary_key: Vec<String>,
    /// Secondary indexes, excluding the primary key's.
    pub indexes: Vec<IndexDesc>,
    pub checks: Vec<CheckDesc>,
    pub sequences: Vec<SequenceDesc>,
    /// The range partitioning column, if the table is already partitioned.
    pub partition_key: Option<String>,
}

impl TableDesc {
    /// A description with only columns and a primary key.
    pub fn new(name: TableName, columns: Vec<ColumnDesc>, primary_key: Vec<String>) -> Self {
        TableDesc {
            name,
            columns,
            primary_key,
            indexes: vec![],
            checks: vec![],
            sequences: vec![],
            partition_key: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Joins quoted column identifiers with commas.
pub(crate) fn quote_columns<'a, I>(columns: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    columns
        .into_iter()
        .map(|c| escape_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}
