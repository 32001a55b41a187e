//! Compiling filter expressions into predicates over the time column.
//!
//! A [`TimePred`] is a conservative abstraction of a filter restricted to the
//! time column of a table. It is evaluated against the `[ts_min, ts_max]`
//! statistics of each data file to decide whether the file can be skipped.
//! Anything the compiler does not understand becomes `Unknown`, which never
//! prunes.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use datafusion::logical_expr::expr::InList;
use datafusion::logical_expr::{Between, Expr, Operator};
use datafusion::scalar::ScalarValue;

use crate::lake_table_provider::pruning::Truth;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimePred {
    True,
    False,
    Unknown, // mentions the time column but cannot be reasoned about
    NonTime, // does not mention the time column at all
    Cmp { op: Operator, ts: DateTime<Utc> }, // time_col OP literal
    And(Box<TimePred>, Box<TimePred>),
    Or(Box<TimePred>, Box<TimePred>),
    Not(Box<TimePred>),
}

impl TimePred {
    pub(crate) fn and(a: TimePred, b: TimePred) -> TimePred {
        use TimePred::*;
        match (a, b) {
            (False, _) | (_, False) => False,
            (True, x) | (x, True) => x,
            (NonTime, x) | (x, NonTime) => x,
            // Unknown must not erase a usable constraint on the other side.
            (Unknown, x) | (x, Unknown) => x,
            (x, y) => And(Box::new(x), Box::new(y)),
        }
    }

    pub(crate) fn or(a: TimePred, b: TimePred) -> TimePred {
        use TimePred::*;
        match (a, b) {
            (True, _) | (_, True) => True,
            (False, x) | (x, False) => x,
            (NonTime, _) | (_, NonTime) => Unknown,
            (Unknown, _) | (_, Unknown) => Unknown,
            (x, y) => Or(Box::new(x), Box::new(y)),
        }
    }

    pub(crate) fn not(x: TimePred) -> TimePred {
        use TimePred::*;
        match x {
            True => False,
            False => True,
            NonTime | Unknown => Unknown,
            Not(inner) => *inner,
            other => Not(Box::new(other)),
        }
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

fn expr_is_col(expr: &Expr, col: &str) -> bool {
    matches!(unwrap_expr(expr), Expr::Column(c) if c.name == col)
}

/// Whether the expression tree references `col` anywhere.
pub(crate) fn expr_mentions_col(expr: &Expr, col: &str) -> bool {
    match unwrap_expr(expr) {
        Expr::Column(c) => c.name == col,
        Expr::BinaryExpr(be) => {
            expr_mentions_col(&be.left, col) || expr_mentions_col(&be.right, col)
        }
        Expr::Not(e) | Expr::IsNull(e) | Expr::IsNotNull(e) => expr_mentions_col(e, col),
        Expr::Between(b) => {
            expr_mentions_col(&b.expr, col)
                || expr_mentions_col(&b.low, col)
                || expr_mentions_col(&b.high, col)
        }
        Expr::InList(il) => {
            expr_mentions_col(&il.expr, col) || il.list.iter().any(|e| expr_mentions_col(e, col))
        }
        Expr::ScalarFunction(sf) => sf.args.iter().any(|x| expr_mentions_col(x, col)),
        _ => false,
    }
}

fn micros_to_utc(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}

/// Convert a scalar literal into a UTC instant, if it denotes one.
fn scalar_to_utc_datetime(v: &ScalarValue) -> Option<DateTime<Utc>> {
    match v {
        ScalarValue::Utf8(Some(s))
        | ScalarValue::LargeUtf8(Some(s))
        | ScalarValue::Utf8View(Some(s)) => {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    // Date-only strings mean midnight UTC.
                    let d = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
                    Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?))
                })
        }
        ScalarValue::TimestampSecond(Some(x), _) => Utc.timestamp_opt(*x, 0).single(),
        ScalarValue::TimestampMillisecond(Some(x), _) => Utc.timestamp_millis_opt(*x).single(),
        ScalarValue::TimestampMicrosecond(Some(x), _) => micros_to_utc(*x),
        ScalarValue::TimestampNanosecond(Some(x), _) => Some(Utc.timestamp_nanos(*x)),
        _ => None,
    }
}

fn parse_ts_literal(expr: &Expr) -> Option<DateTime<Utc>> {
    match unwrap_expr(expr) {
        Expr::Literal(v, _) => scalar_to_utc_datetime(v),
        _ => None,
    }
}

/// Flip comparison direction when operands are swapped.
fn flip_op(op: Operator) -> Option<Operator> {
    match op {
        Operator::Gt => Some(Operator::Lt),
        Operator::GtEq => Some(Operator::LtEq),
        Operator::Lt => Some(Operator::Gt),
        Operator::LtEq => Some(Operator::GtEq),
        Operator::Eq => Some(Operator::Eq),
        Operator::NotEq => Some(Operator::NotEq),
        _ => None,
    }
}

fn compile_leaf(left: &Expr, op: Operator, right: &Expr, ts_col: &str) -> TimePred {
    if flip_op(op).is_none() {
        return TimePred::Unknown;
    }

    if expr_is_col(left, ts_col)
        && let Some(ts) = parse_ts_literal(right)
    {
        return TimePred::Cmp { op, ts };
    }

    if expr_is_col(right, ts_col)
        && let Some(ts) = parse_ts_literal(left)
        && let Some(op) = flip_op(op)
    {
        return TimePred::Cmp { op, ts };
    }

    TimePred::Unknown
}

fn compile_between(b: &Between, ts_col: &str) -> TimePred {
    if !expr_is_col(&b.expr, ts_col) {
        return TimePred::Unknown;
    }
    let (Some(low), Some(high)) = (parse_ts_literal(&b.low), parse_ts_literal(&b.high)) else {
        return TimePred::Unknown;
    };

    let inner = TimePred::and(
        TimePred::Cmp {
            op: Operator::GtEq,
            ts: low,
        },
        TimePred::Cmp {
            op: Operator::LtEq,
            ts: high,
        },
    );
    if b.negated { TimePred::not(inner) } else { inner }
}

fn compile_in_list(il: &InList, ts_col: &str) -> TimePred {
    if !expr_is_col(&il.expr, ts_col) {
        return TimePred::Unknown;
    }

    let mut pred = TimePred::False;
    for e in &il.list {
        match parse_ts_literal(e) {
            Some(ts) => pred = TimePred::or(pred, TimePred::Cmp { op: Operator::Eq, ts }),
            None => return TimePred::Unknown,
        }
    }

    // `x NOT IN ()` places no constraint.
    if il.negated {
        if il.list.is_empty() { TimePred::Unknown } else { TimePred::not(pred) }
    } else {
        pred
    }
}

/// Compile `expr` into a predicate over `ts_col`.
pub(crate) fn compile_time_pred(expr: &Expr, ts_col: &str) -> TimePred {
    if !expr_mentions_col(expr, ts_col) {
        return TimePred::NonTime;
    }

    match expr {
        Expr::BinaryExpr(be) if be.op == Operator::And => TimePred::and(
            compile_time_pred(&be.left, ts_col),
            compile_time_pred(&be.right, ts_col),
        ),
        Expr::BinaryExpr(be) if be.op == Operator::Or => TimePred::or(
            compile_time_pred(&be.left, ts_col),
            compile_time_pred(&be.right, ts_col),
        ),
        Expr::BinaryExpr(be) => compile_leaf(&be.left, be.op, &be.right, ts_col),
        Expr::Not(e) => TimePred::not(compile_time_pred(e, ts_col)),
        Expr::Alias(a) => compile_time_pred(&a.expr, ts_col),
        Expr::Between(b) => compile_between(b, ts_col),
        Expr::InList(il) => compile_in_list(il, ts_col),
        // The time column is non-nullable in both tables.
        Expr::IsNotNull(e) if expr_is_col(e, ts_col) => TimePred::True,
        Expr::IsNull(e) if expr_is_col(e, ts_col) => TimePred::False,
        _ => TimePred::Unknown,
    }
}

fn eval_cmp_on_interval(
    op: Operator,
    dt: DateTime<Utc>,
    min: DateTime<Utc>,
    max: DateTime<Utc>,
) -> Truth {
    use Truth::*;
    match op {
        Operator::Lt if max < dt => AlwaysTrue,
        Operator::Lt if min >= dt => AlwaysFalse,
        Operator::LtEq if max <= dt => AlwaysTrue,
        Operator::LtEq if min > dt => AlwaysFalse,
        Operator::Gt if min > dt => AlwaysTrue,
        Operator::Gt if max <= dt => AlwaysFalse,
        Operator::GtEq if min >= dt => AlwaysTrue,
        Operator::GtEq if max < dt => AlwaysFalse,
        Operator::Eq if dt < min || dt > max => AlwaysFalse,
        Operator::Eq if min == max && min == dt => AlwaysTrue,
        Operator::NotEq if min == max && min == dt => AlwaysFalse,
        Operator::NotEq if dt < min || dt > max => AlwaysTrue,
        _ => MaybeTrue,
    }
}

/// Evaluate `pred` universally over the closed interval `[min, max]`.
///
/// `AlwaysFalse` means no timestamp in the interval can satisfy the
/// predicate, so a file with those bounds is safe to skip.
pub(crate) fn eval_time_pred_on_interval(
    pred: &TimePred,
    min: DateTime<Utc>,
    max: DateTime<Utc>,
) -> Truth {
    use TimePred::*;
    match pred {
        True => Truth::AlwaysTrue,
        False => Truth::AlwaysFalse,
        Unknown | NonTime => Truth::MaybeTrue,
        Cmp { op, ts } => eval_cmp_on_interval(*op, *ts, min, max),
        And(a, b) => {
            eval_time_pred_on_interval(a, min, max).and(eval_time_pred_on_interval(b, min, max))
        }
        Or(a, b) => {
            eval_time_pred_on_interval(a, min, max).or(eval_time_pred_on_interval(b, min, max))
        }
        Not(x) => eval_time_pred_on_interval(x, min, max).not(),
    }
}
