//! File-level pruning from pushed-down filters.
//!
//! Every filter handed to [`LakeTableProvider::scan`] is evaluated against the
//! statistics each data file carries in the commit log: its partition values
//! and its time bounds. A file is skipped only when some filter is provably
//! false for every row it could contain.
//!
//! [`LakeTableProvider::scan`]: crate::LakeTableProvider

use datafusion::logical_expr::expr::InList;
use datafusion::logical_expr::{Expr, Operator};
use datafusion::scalar::ScalarValue;
use divelake_core::transaction_log::{DataFile, TableKind};

use crate::lake_table_provider::time_predicate::{compile_time_pred, eval_time_pred_on_interval};

/// Three-valued result of evaluating a filter over every row of a file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Truth {
    AlwaysTrue,
    AlwaysFalse,
    MaybeTrue,
}

impl Truth {
    pub(crate) fn and(self, rhs: Truth) -> Truth {
        use Truth::*;
        match (self, rhs) {
            (AlwaysFalse, _) | (_, AlwaysFalse) => AlwaysFalse,
            (AlwaysTrue, x) | (x, AlwaysTrue) => x,
            _ => MaybeTrue,
        }
    }

    pub(crate) fn or(self, rhs: Truth) -> Truth {
        use Truth::*;
        match (self, rhs) {
            (AlwaysTrue, _) | (_, AlwaysTrue) => AlwaysTrue,
            (AlwaysFalse, x) | (x, AlwaysFalse) => x,
            _ => MaybeTrue,
        }
    }

    pub(crate) fn not(self) -> Truth {
        use Truth::*;
        match self {
            AlwaysTrue => AlwaysFalse,
            AlwaysFalse => AlwaysTrue,
            MaybeTrue => MaybeTrue,
        }
    }

    fn from_bool(b: bool) -> Truth {
        if b { Truth::AlwaysTrue } else { Truth::AlwaysFalse }
    }
}

fn unwrap_expr(expr: &Expr) -> &Expr {
    match expr {
        Expr::Alias(a) => unwrap_expr(&a.expr),
        Expr::Cast(c) => unwrap_expr(&c.expr),
        Expr::TryCast(c) => unwrap_expr(&c.expr),
        other => other,
    }
}

fn string_literal(expr: &Expr) -> Option<&str> {
    match unwrap_expr(expr) {
        Expr::Literal(
            ScalarValue::Utf8(Some(s))
            | ScalarValue::LargeUtf8(Some(s))
            | ScalarValue::Utf8View(Some(s)),
            _,
        ) => Some(s.as_str()),
        _ => None,
    }
}

/// The partition value of `file` that `expr` refers to, if `expr` is a bare
/// partition column.
fn partition_value<'a>(expr: &Expr, file: &'a DataFile) -> Option<&'a str> {
    match unwrap_expr(expr) {
        Expr::Column(c) => file.partition_value(&c.name),
        _ => None,
    }
}

fn eval_comparison(left: &Expr, op: Operator, right: &Expr, file: &DataFile) -> Truth {
    let (value, literal) = match (partition_value(left, file), string_literal(right)) {
        (Some(v), Some(l)) => (v, l),
        _ => match (partition_value(right, file), string_literal(left)) {
            (Some(v), Some(l)) => (v, l),
            _ => return Truth::MaybeTrue,
        },
    };

    match op {
        Operator::Eq => Truth::from_bool(value == literal),
        Operator::NotEq => Truth::from_bool(value != literal),
        _ => Truth::MaybeTrue,
    }
}

fn eval_in_list(il: &InList, file: &DataFile) -> Truth {
    let Some(value) = partition_value(&il.expr, file) else {
        return Truth::MaybeTrue;
    };
    let mut found = false;
    for item in &il.list {
        match string_literal(item) {
            Some(literal) => found |= literal == value,
            None => return Truth::MaybeTrue,
        }
    }
    Truth::from_bool(found != il.negated)
}

/// Evaluate `expr` against the partition values of `file`.
pub(crate) fn eval_partition_filter(expr: &Expr, file: &DataFile) -> Truth {
    match expr {
        Expr::BinaryExpr(be) if be.op == Operator::And => {
            eval_partition_filter(&be.left, file).and(eval_partition_filter(&be.right, file))
        }
        Expr::BinaryExpr(be) if be.op == Operator::Or => {
            eval_partition_filter(&be.left, file).or(eval_partition_filter(&be.right, file))
        }
        Expr::BinaryExpr(be) => eval_comparison(&be.left, be.op, &be.right, file),
        Expr::Not(e) => eval_partition_filter(e, file).not(),
        Expr::Alias(a) => eval_partition_filter(&a.expr, file),
        Expr::InList(il) => eval_in_list(il, file),
        // Partition columns are non-nullable.
        Expr::IsNull(e) if partition_value(e, file).is_some() => Truth::AlwaysFalse,
        Expr::IsNotNull(e) if partition_value(e, file).is_some() => Truth::AlwaysTrue,
        _ => Truth::MaybeTrue,
    }
}

/// Files of a snapshot that may hold rows satisfying every filter.
pub(crate) fn prune_files<'a>(
    kind: TableKind,
    files: impl Iterator<Item = &'a DataFile>,
    filters: &[Expr],
) -> Vec<&'a DataFile> {
    let time_col = kind.time_column();
    let time_preds: Vec<_> = filters
        .iter()
        .map(|f| compile_time_pred(f, time_col))
        .collect();

    files
        .filter(|file| {
            let pruned_by_time = time_preds.iter().any(|p| {
                eval_time_pred_on_interval(p, file.ts_min, file.ts_max) == Truth::AlwaysFalse
            });
            let pruned_by_partition = filters
                .iter()
                .any(|f| eval_partition_filter(f, file) == Truth::AlwaysFalse);
            !(pruned_by_time || pruned_by_partition)
        })
        .collect()
}
