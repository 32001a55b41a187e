//! Typed filter clauses for view queries.
//!
//! A [`Predicate`] is an ordered list of [`Clause`]s, each added only when the
//! caller supplied the corresponding filter. It folds into a single
//! DataFusion [`Expr`] whose values are literals, never spliced SQL text, and
//! renders a human-readable description used as error context.

use std::{fmt, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use datafusion::{
    logical_expr::{Expr, ident, lit},
    scalar::ScalarValue,
};
use divelake_core::{lake_table::UTC, transaction_log::DataFile};

/// One value or a set of values to match a column against.
///
/// An empty set adds no clause, mirroring an omitted filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FilterValues(Vec<String>);

impl FilterValues {
    /// Values in caller order.
    pub fn values(&self) -> &[String] {
        &self.0
    }

    /// Whether no value was given.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values sorted and de-duplicated, for canonical encodings.
    pub fn canonical(&self) -> Vec<String> {
        let mut values = self.0.clone();
        values.sort();
        values.dedup();
        values
    }

    /// Whether `value` is one of the values.
    pub fn contains(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }
}

impl From<&str> for FilterValues {
    fn from(value: &str) -> Self {
        FilterValues(vec![value.to_string()])
    }
}

impl From<String> for FilterValues {
    fn from(value: String) -> Self {
        FilterValues(vec![value])
    }
}

impl From<Vec<String>> for FilterValues {
    fn from(values: Vec<String>) -> Self {
        FilterValues(values)
    }
}

impl From<Vec<&str>> for FilterValues {
    fn from(values: Vec<&str>) -> Self {
        FilterValues(values.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for FilterValues {
    fn from(values: &[&str]) -> Self {
        FilterValues(values.iter().map(|v| v.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for FilterValues {
    fn from(values: [&str; N]) -> Self {
        FilterValues(values.iter().map(|v| v.to_string()).collect())
    }
}

impl FromIterator<String> for FilterValues {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        FilterValues(iter.into_iter().collect())
    }
}

/// Inclusive time window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    /// First instant included.
    pub start: DateTime<Utc>,
    /// Last instant included.
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Window from `start` to `end`, both included. A reversed window is
    /// accepted and simply matches nothing.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// One filter condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// `column = value` or `column IN (values)`.
    In {
        /// Filtered column.
        column: &'static str,
        /// Accepted values, never empty.
        values: Vec<String>,
    },
    /// `start <= column <= end`.
    TimeRange {
        /// Timestamp column.
        column: &'static str,
        /// Inclusive window.
        range: DateRange,
    },
}

impl Clause {
    fn to_expr(&self) -> Expr {
        match self {
            Clause::In { column, values } => match values.as_slice() {
                [single] => ident(*column).eq(lit(single.as_str())),
                many => {
                    let list = many.iter().map(|v| lit(v.as_str())).collect();
                    ident(*column).in_list(list, false)
                }
            },
            Clause::TimeRange { column, range } => ident(*column)
                .gt_eq(timestamp_literal(range.start))
                .and(ident(*column).lt_eq(timestamp_literal(range.end))),
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Clause::In { column, .. } | Clause::TimeRange { column, .. } => column,
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::In { column, values } => match values.as_slice() {
                [single] => write!(f, "{column} = {single:?}"),
                many => {
                    let list = many.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>();
                    write!(f, "{column} IN ({})", list.join(", "))
                }
            },
            Clause::TimeRange { column, range } => write!(
                f,
                "{column} BETWEEN {} AND {}",
                range.start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                range.end.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ),
        }
    }
}

/// `Timestamp(us, "UTC")` literal for `ts`.
pub(crate) fn timestamp_literal(ts: DateTime<Utc>) -> Expr {
    lit(ScalarValue::TimestampMicrosecond(
        Some(ts.timestamp_micros()),
        Some(Arc::from(UTC)),
    ))
}

/// Conjunction of filter clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    /// A predicate matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `column IN values` when `values` is present and non-empty.
    pub fn with_values(mut self, column: &'static str, values: Option<&FilterValues>) -> Self {
        if let Some(values) = values
            && !values.is_empty()
        {
            self.clauses.push(Clause::In {
                column,
                values: values.values().to_vec(),
            });
        }
        self
    }

    /// Add a time window on `column` when `range` is present.
    pub fn with_time_range(mut self, column: &'static str, range: Option<&DateRange>) -> Self {
        if let Some(range) = range {
            self.clauses.push(Clause::TimeRange {
                column,
                range: *range,
            });
        }
        self
    }

    /// Clauses in insertion order.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Whether no clause was added.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The conjunction as an engine expression, or `None` for "all rows".
    pub fn to_expr(&self) -> Option<Expr> {
        self.clauses
            .iter()
            .map(Clause::to_expr)
            .reduce(|acc, e| acc.and(e))
    }

    /// Whether every clause is a value filter on one of `columns`.
    pub fn only_filters(&self, columns: &[&str]) -> bool {
        self.clauses
            .iter()
            .all(|c| matches!(c, Clause::In { .. }) && columns.contains(&c.column()))
    }

    /// Evaluate the value clauses against a data file's partition values.
    ///
    /// Time clauses are ignored; callers check [`Self::only_filters`] first
    /// when they need an exact answer.
    pub fn matches_partitions(&self, file: &DataFile) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::In { column, values } => match file.partition_value(column) {
                Some(v) => values.iter().any(|accepted| accepted == v),
                None => false,
            },
            Clause::TimeRange { .. } => true,
        })
    }

    /// Human-readable rendering used in error messages and logs.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return f.write_str("all rows");
        }
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{clause}")?;
        }
        Ok(())
    }
}
