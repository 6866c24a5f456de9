use std::collections::BTreeMap;
use std::time::Instant;

use crate::error::{ExecutionError, ExecutionReason};
use crate::sql::parser::{Expr, FuncArg, SelectItem, SelectStatement};
use crate::store::{Schema, Value};

#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub max_rows: u64,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Matching rows before LIMIT was applied.
    pub total_rows: u64,
}

const DEADLINE_CHECK_INTERVAL: usize = 1024;

/// Run a validated statement over in-memory rows. The deadline is checked
/// periodically during scans, and the output row count is capped as a second
/// line of defense behind the validator's LIMIT injection.
pub fn execute(
    stmt: &SelectStatement,
    schema: &Schema,
    rows: &[Vec<Value>],
    limits: &ExecLimits,
) -> Result<QueryOutput, ExecutionError> {
    let mut matched: Vec<&Vec<Value>> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if i % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= limits.deadline {
            return Err(ExecutionError::new(
                ExecutionReason::Timeout,
                format!("deadline hit after scanning {i} rows"),
            ));
        }
        let keep = match &stmt.filter {
            Some(expr) => eval_filter(expr, schema, row)?,
            None => true,
        };
        if keep {
            matched.push(row);
        }
    }

    let output = if !stmt.group_by.is_empty() {
        execute_grouped(stmt, schema, &matched, limits)?
    } else if stmt.has_aggregate() {
        execute_aggregate(stmt, schema, &matched)?
    } else {
        execute_projection(stmt, schema, &matched, limits)?
    };

    if output.rows.len() as u64 > limits.max_rows {
        return Err(ExecutionError::new(
            ExecutionReason::ResourceExceeded,
            format!(
                "result has {} rows, cap is {}",
                output.rows.len(),
                limits.max_rows
            ),
        ));
    }
    Ok(output)
}

fn execute_projection(
    stmt: &SelectStatement,
    schema: &Schema,
    matched: &[&Vec<Value>],
    limits: &ExecLimits,
) -> Result<QueryOutput, ExecutionError> {
    let mut ordered: Vec<&Vec<Value>> = matched.to_vec();
    if let Some(ob) = &stmt.order_by {
        let idx = column_index(schema, &ob.column)?;
        ordered.sort_by(|a, b| {
            let ord = a[idx].cmp_for_sort(&b[idx]);
            if ob.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    let total_rows = ordered.len() as u64;
    let take = stmt.limit.map(|n| n as usize).unwrap_or(ordered.len());

    let mut columns = Vec::new();
    for item in &stmt.items {
        match item {
            SelectItem::Star => columns.extend(schema.column_names()),
            SelectItem::Column { name } => {
                let idx = column_index(schema, name)?;
                columns.push(schema.columns[idx].name.clone());
            }
            SelectItem::Function { name, arg, alias } => {
                columns.push(output_name(name, arg, alias));
            }
        }
    }

    let mut out_rows = Vec::with_capacity(take.min(ordered.len()));
    for (i, row) in ordered.iter().take(take).enumerate() {
        if i % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= limits.deadline {
            return Err(ExecutionError::new(
                ExecutionReason::Timeout,
                "deadline hit while projecting rows",
            ));
        }
        let mut out = Vec::with_capacity(columns.len());
        for item in &stmt.items {
            match item {
                SelectItem::Star => out.extend(row.iter().cloned()),
                SelectItem::Column { name } => {
                    let idx = column_index(schema, name)?;
                    out.push(row[idx].clone());
                }
                SelectItem::Function { name, arg, .. } => {
                    let FuncArg::Column(col) = arg else {
                        return Err(engine_fault("scalar function with * argument"));
                    };
                    let idx = column_index(schema, col)?;
                    out.push(apply_scalar(name, &row[idx])?);
                }
            }
        }
        out_rows.push(out);
    }

    Ok(QueryOutput {
        columns,
        rows: out_rows,
        total_rows,
    })
}

fn execute_aggregate(
    stmt: &SelectStatement,
    schema: &Schema,
    matched: &[&Vec<Value>],
) -> Result<QueryOutput, ExecutionError> {
    let mut columns = Vec::new();
    let mut row = Vec::new();
    for item in &stmt.items {
        let SelectItem::Function { name, arg, alias } = item else {
            return Err(engine_fault("non-aggregate item in aggregate query"));
        };
        columns.push(output_name(name, arg, alias));
        row.push(compute_aggregate(name, arg, schema, matched)?);
    }
    Ok(QueryOutput {
        columns,
        rows: vec![row],
        total_rows: 1,
    })
}

fn execute_grouped(
    stmt: &SelectStatement,
    schema: &Schema,
    matched: &[&Vec<Value>],
    limits: &ExecLimits,
) -> Result<QueryOutput, ExecutionError> {
    let key_indices: Vec<usize> = stmt
        .group_by
        .iter()
        .map(|g| column_index(schema, g))
        .collect::<Result<_, _>>()?;

    // BTreeMap keeps group output deterministic when no ORDER BY is given.
    let mut groups: BTreeMap<String, (Vec<Value>, Vec<&Vec<Value>>)> = BTreeMap::new();
    for (i, row) in matched.iter().enumerate() {
        if i % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= limits.deadline {
            return Err(ExecutionError::new(
                ExecutionReason::Timeout,
                "deadline hit while grouping rows",
            ));
        }
        let key_values: Vec<Value> = key_indices.iter().map(|&i| row[i].clone()).collect();
        let key = key_values
            .iter()
            .map(Value::render)
            .collect::<Vec<_>>()
            .join("\u{1f}");
        groups
            .entry(key)
            .or_insert_with(|| (key_values, Vec::new()))
            .1
            .push(row);
    }

    let mut columns = Vec::new();
    for item in &stmt.items {
        match item {
            SelectItem::Column { name } => {
                let idx = column_index(schema, name)?;
                columns.push(schema.columns[idx].name.clone());
            }
            SelectItem::Function { name, arg, alias } => {
                columns.push(output_name(name, arg, alias));
            }
            SelectItem::Star => return Err(engine_fault("star item in grouped query")),
        }
    }

    let mut keyed_rows: Vec<(Vec<Value>, Vec<Value>)> = Vec::with_capacity(groups.len());
    for (_, (key_values, group_rows)) in groups {
        let mut out = Vec::with_capacity(columns.len());
        for item in &stmt.items {
            match item {
                SelectItem::Column { name } => {
                    let pos = stmt
                        .group_by
                        .iter()
                        .position(|g| g.eq_ignore_ascii_case(name))
                        .ok_or_else(|| engine_fault("selected column not a group key"))?;
                    out.push(key_values[pos].clone());
                }
                SelectItem::Function { name, arg, .. } => {
                    out.push(compute_aggregate(name, arg, schema, &group_rows)?);
                }
                SelectItem::Star => return Err(engine_fault("star item in grouped query")),
            }
        }
        keyed_rows.push((key_values, out));
    }

    if let Some(ob) = &stmt.order_by {
        // ORDER BY may name a group key that is not selected, so sort on the
        // key tuple rather than the output row.
        if let Some(pos) = stmt
            .group_by
            .iter()
            .position(|g| g.eq_ignore_ascii_case(&ob.column))
        {
            keyed_rows.sort_by(|a, b| {
                let ord = a.0[pos].cmp_for_sort(&b.0[pos]);
                if ob.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        } else if let Some(pos) = columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(&ob.column))
        {
            keyed_rows.sort_by(|a, b| {
                let ord = a.1[pos].cmp_for_sort(&b.1[pos]);
                if ob.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
    }

    let total_rows = keyed_rows.len() as u64;
    let take = stmt.limit.map(|n| n as usize).unwrap_or(keyed_rows.len());
    let rows: Vec<Vec<Value>> = keyed_rows.into_iter().take(take).map(|(_, r)| r).collect();

    Ok(QueryOutput {
        columns,
        rows,
        total_rows,
    })
}

fn output_name(name: &str, arg: &FuncArg, alias: &Option<String>) -> String {
    if let Some(a) = alias {
        return a.clone();
    }
    match arg {
        FuncArg::Star => format!("{name}(*)"),
        FuncArg::Column(c) => format!("{name}({c})"),
    }
}

fn compute_aggregate(
    name: &str,
    arg: &FuncArg,
    schema: &Schema,
    rows: &[&Vec<Value>],
) -> Result<Value, ExecutionError> {
    let values: Vec<&Value> = match arg {
        FuncArg::Star => {
            if name == "count" {
                return Ok(Value::Integer(rows.len() as i64));
            }
            return Err(engine_fault("star argument outside count"));
        }
        FuncArg::Column(col) => {
            let idx = column_index(schema, col)?;
            rows.iter().map(|r| &r[idx]).filter(|v| !v.is_null()).collect()
        }
    };

    match name {
        "count" => Ok(Value::Integer(values.len() as i64)),
        "sum" => {
            let nums: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if nums.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::Float(nums.iter().sum()))
            }
        }
        "avg" => {
            let nums: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if nums.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::Float(nums.iter().sum::<f64>() / nums.len() as f64))
            }
        }
        "min" => Ok(values
            .iter()
            .min_by(|a, b| a.cmp_for_sort(b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null)),
        "max" => Ok(values
            .iter()
            .max_by(|a, b| a.cmp_for_sort(b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null)),
        other => Err(engine_fault(format!("unknown aggregate {other:?}"))),
    }
}

fn apply_scalar(name: &str, value: &Value) -> Result<Value, ExecutionError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match name {
        "upper" => Ok(value
            .as_text()
            .map(|s| Value::Text(s.to_uppercase()))
            .unwrap_or(Value::Null)),
        "lower" => Ok(value
            .as_text()
            .map(|s| Value::Text(s.to_lowercase()))
            .unwrap_or(Value::Null)),
        "abs" => Ok(match value {
            Value::Integer(i) => Value::Integer(i.saturating_abs()),
            Value::Float(f) => Value::Float(f.abs()),
            _ => Value::Null,
        }),
        "round" => Ok(match value {
            Value::Integer(i) => Value::Integer(*i),
            Value::Float(f) => Value::Float(f.round()),
            _ => Value::Null,
        }),
        "length" => Ok(value
            .as_text()
            .map(|s| Value::Integer(s.chars().count() as i64))
            .unwrap_or(Value::Null)),
        other => Err(engine_fault(format!("unknown scalar function {other:?}"))),
    }
}

/// Filter evaluation is lenient: a type mismatch makes the predicate false
/// for that row rather than failing the whole query.
fn eval_filter(expr: &Expr, schema: &Schema, row: &[Value]) -> Result<bool, ExecutionError> {
    match expr {
        Expr::And(a, b) => Ok(eval_filter(a, schema, row)? && eval_filter(b, schema, row)?),
        Expr::Or(a, b) => Ok(eval_filter(a, schema, row)? || eval_filter(b, schema, row)?),
        Expr::Not(inner) => Ok(!eval_filter(inner, schema, row)?),
        Expr::IsNull { column, negated } => {
            let idx = column_index(schema, column)?;
            let is_null = row[idx].is_null();
            Ok(is_null != *negated)
        }
        Expr::Like {
            column,
            pattern,
            negated,
        } => {
            let idx = column_index(schema, column)?;
            let matched = match &row[idx] {
                Value::Text(s) => like_match(pattern, s),
                Value::Null => false,
                other => like_match(pattern, &other.render()),
            };
            Ok(matched != *negated)
        }
        Expr::Compare { op, left, right } => {
            let lv = eval_operand(left, schema, row)?;
            let rv = eval_operand(right, schema, row)?;
            Ok(compare(op, &lv, &rv))
        }
        Expr::Column(name) => {
            let idx = column_index(schema, name)?;
            Ok(matches!(row[idx], Value::Boolean(true)))
        }
        Expr::Literal(v) => Ok(matches!(v, Value::Boolean(true))),
    }
}

fn eval_operand(expr: &Expr, schema: &Schema, row: &[Value]) -> Result<Value, ExecutionError> {
    match expr {
        Expr::Column(name) => {
            let idx = column_index(schema, name)?;
            Ok(row[idx].clone())
        }
        Expr::Literal(v) => Ok(v.clone()),
        _ => Err(engine_fault("nested expression in comparison operand")),
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    use std::cmp::Ordering;
    if left.is_null() || right.is_null() {
        return false;
    }
    let ord = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::Text(a), Value::Text(b)) => Some(a.as_str().cmp(b.as_str())),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            // timestamp column compared against a date string
            (Value::Timestamp(a), Value::Text(b)) => crate::util::time::parse_timestamp(b)
                .map(|parsed| a.cmp(&parsed)),
            (Value::Text(a), Value::Timestamp(b)) => crate::util::time::parse_timestamp(a)
                .map(|parsed| parsed.cmp(b)),
            _ => None,
        },
    };
    let Some(ord) = ord else { return false };
    match op {
        "=" => ord == Ordering::Equal,
        "!=" => ord != Ordering::Equal,
        "<" => ord == Ordering::Less,
        "<=" => ord != Ordering::Greater,
        ">" => ord == Ordering::Greater,
        ">=" => ord != Ordering::Less,
        _ => false,
    }
}

/// SQL LIKE with `%` and `_` wildcards, case-insensitive. Iterative with
/// single-level backtracking to the most recent `%`, so matching stays
/// O(pattern * text) even for wildcard-heavy patterns.
fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let mut pi = 0;
    let mut ti = 0;
    // last '%' seen and the text position its span currently ends at
    let mut star: Option<usize> = None;
    let mut star_ti = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '%' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if pi < p.len() && (p[pi] == '_' || p[pi].eq_ignore_ascii_case(&t[ti])) {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            // widen the last '%' by one character and retry
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}

fn column_index(schema: &Schema, name: &str) -> Result<usize, ExecutionError> {
    schema
        .column_index(name)
        .ok_or_else(|| engine_fault(format!("column {name:?} missing at execution time")))
}

fn engine_fault(detail: impl Into<String>) -> ExecutionError {
    ExecutionError::new(ExecutionReason::EngineFault, detail)
}
