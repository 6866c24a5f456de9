use crate::error::{ValidationError, ValidationReason};
use crate::sql::parser::{parse_select, split_statements, FuncArg, SelectItem, SelectStatement};
use crate::store::Schema;

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_rows: u64,
    pub require_explicit_limit: bool,
}

/// A statement that passed every safety check. The row limit is already
/// baked into the statement, so the executor never sees an unbounded scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    pub statement: SelectStatement,
}

const AGGREGATES: &[&str] = &["count", "sum", "avg", "min", "max"];
const SCALARS: &[&str] = &["upper", "lower", "abs", "round", "length"];

/// The single chokepoint between generated SQL and the executor. Everything
/// that runs against a segment goes through here first.
pub fn validate_sql(
    sql: &str,
    table: &str,
    schema: &Schema,
    limits: &ResourceLimits,
) -> Result<ValidatedQuery, ValidationError> {
    let statements = split_statements(sql);
    match statements.len() {
        0 => {
            return Err(ValidationError::new(
                ValidationReason::NotASelect,
                "no statement found",
            ))
        }
        1 => {}
        n => {
            return Err(ValidationError::new(
                ValidationReason::MultipleStatements,
                format!("{n} statements found, expected 1"),
            ))
        }
    }

    let mut stmt = parse_select(&statements[0]).map_err(|e| {
        ValidationError::new(ValidationReason::NotASelect, e.to_string())
    })?;

    if !stmt.table.eq_ignore_ascii_case(table) {
        return Err(ValidationError::new(
            ValidationReason::UnknownColumn,
            format!("unknown table {:?}, expected {table:?}", stmt.table),
        ));
    }

    let aliases: Vec<String> = stmt
        .items
        .iter()
        .filter_map(|item| match item {
            SelectItem::Function { alias: Some(a), .. } => Some(a.clone()),
            _ => None,
        })
        .collect();

    for name in stmt.referenced_columns() {
        if schema.column_index(name).is_none() {
            // in a grouped query ORDER BY may target an aggregate alias
            let order_alias = !stmt.group_by.is_empty()
                && stmt
                    .order_by
                    .as_ref()
                    .is_some_and(|ob| ob.column.eq_ignore_ascii_case(name))
                && aliases.iter().any(|a| a.eq_ignore_ascii_case(name));
            if !order_alias {
                return Err(ValidationError::new(
                    ValidationReason::UnknownColumn,
                    format!("column {name:?} does not exist"),
                ));
            }
        }
    }

    let mut has_aggregate = false;
    let mut has_plain = false;
    for item in &stmt.items {
        match item {
            SelectItem::Star | SelectItem::Column { .. } => has_plain = true,
            SelectItem::Function { name, arg, .. } => {
                if AGGREGATES.contains(&name.as_str()) {
                    has_aggregate = true;
                    if matches!(arg, FuncArg::Star) && name != "count" {
                        return Err(ValidationError::new(
                            ValidationReason::DisallowedFunction,
                            format!("{name}(*) is not supported, only count(*)"),
                        ));
                    }
                } else if SCALARS.contains(&name.as_str()) {
                    has_plain = true;
                    if matches!(arg, FuncArg::Star) {
                        return Err(ValidationError::new(
                            ValidationReason::DisallowedFunction,
                            format!("{name}(*) is not supported"),
                        ));
                    }
                } else {
                    return Err(ValidationError::new(
                        ValidationReason::DisallowedFunction,
                        format!("function {name:?} is not on the allow list"),
                    ));
                }
            }
        }
    }

    if stmt.group_by.is_empty() {
        if has_aggregate && has_plain {
            return Err(ValidationError::new(
                ValidationReason::NotASelect,
                "cannot mix plain columns with aggregates without GROUP BY",
            ));
        }
    } else {
        // grouped queries may only select group keys and aggregates
        for item in &stmt.items {
            match item {
                SelectItem::Star => {
                    return Err(ValidationError::new(
                        ValidationReason::NotASelect,
                        "SELECT * is not allowed with GROUP BY",
                    ))
                }
                SelectItem::Column { name } => {
                    if !stmt.group_by.iter().any(|g| g.eq_ignore_ascii_case(name)) {
                        return Err(ValidationError::new(
                            ValidationReason::NotASelect,
                            format!("column {name:?} must appear in GROUP BY"),
                        ));
                    }
                }
                SelectItem::Function { name, .. } => {
                    if !AGGREGATES.contains(&name.as_str()) {
                        return Err(ValidationError::new(
                            ValidationReason::NotASelect,
                            format!("function {name:?} must be an aggregate when grouping"),
                        ));
                    }
                }
            }
        }
        // the executor sorts grouped output by key or by result column, so
        // anything else would be silently unordered
        if let Some(ob) = &stmt.order_by {
            let is_key = stmt
                .group_by
                .iter()
                .any(|g| g.eq_ignore_ascii_case(&ob.column));
            let is_alias = aliases.iter().any(|a| a.eq_ignore_ascii_case(&ob.column));
            if !is_key && !is_alias {
                return Err(ValidationError::new(
                    ValidationReason::NotASelect,
                    format!(
                        "ORDER BY {:?} must name a group key or an aggregate alias",
                        ob.column
                    ),
                ));
            }
        }
    }

    // An aggregate without grouping yields exactly one row, which is
    // inherently bounded.
    let bounded = has_aggregate && stmt.group_by.is_empty();
    if !bounded {
        match stmt.limit {
            Some(n) => stmt.limit = Some(n.min(limits.max_rows)),
            None => {
                if limits.require_explicit_limit {
                    return Err(ValidationError::new(
                        ValidationReason::MissingLimit,
                        "statement has no LIMIT clause",
                    ));
                }
                stmt.limit = Some(limits.max_rows);
            }
        }
    }

    Ok(ValidatedQuery { statement: stmt })
}
