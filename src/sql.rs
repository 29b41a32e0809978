use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: Option<String>,
        open: Minutes,
        close: Minutes,
        step: Option<Minutes>,
        hourly_rate: Option<u64>,
    },
    UpdateResource {
        id: Ulid,
        patch: ResourcePatch,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources,
    SelectAvailability {
        resource_id: Ulid,
        date: NaiveDate,
        /// Hours; the caller defaults it to one hour when absent.
        duration: Option<f64>,
    },
    SelectFreeWindows {
        resource_id: Ulid,
        date: NaiveDate,
        min_duration: Option<Minutes>,
    },
    SelectReservations {
        resource_id: Ulid,
        date: Option<NaiveDate>,
    },
    InsertReservation {
        id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        start: Minutes,
        duration: f64,
        customer: CustomerInfo,
    },
    UpdateReservation {
        id: Ulid,
        date: Option<NaiveDate>,
        start: Option<Minutes>,
        duration: Option<f64>,
    },
    DeleteReservation {
        id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Columns named in `UPDATE resources SET ...`. Unnamed ones keep their value.
#[derive(Debug, Default, PartialEq)]
pub struct ResourcePatch {
    pub name: Option<Option<String>>,
    pub open: Option<Minutes>,
    pub close: Option<Minutes>,
    pub step: Option<Minutes>,
    pub hourly_rate: Option<Option<u64>>,
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "open", "close", "step", "hourly_rate"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "date",
    "start",
    "duration",
    "customer_name",
    "contact_number",
    "email",
    "notes",
    "address",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if let Some(cmd) = parse_listen(trimmed) {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = stmts.first().ok_or(SqlError::Empty)?;

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// LISTEN/UNLISTEN are matched by hand so channel names are taken verbatim.
fn parse_listen(trimmed: &str) -> Option<Command> {
    let (keyword, rest) = trimmed.split_once(char::is_whitespace)?;
    let channel = rest.trim().trim_matches('"').to_string();
    match keyword.to_ascii_uppercase().as_str() {
        "LISTEN" => Some(Command::Listen { channel }),
        "UNLISTEN" if channel == "*" => Some(Command::UnlistenAll),
        "UNLISTEN" => Some(Command::Unlisten { channel }),
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "resources" => {
            let row = named_row(insert, RESOURCE_COLUMNS)?;
            Ok(Command::InsertResource {
                id: parse_ulid(required(&row, "id")?)?,
                name: optional(&row, "name").map(parse_string_or_null).transpose()?.flatten(),
                open: parse_clock_expr(required(&row, "open")?)?,
                close: parse_clock_expr(required(&row, "close")?)?,
                step: optional(&row, "step").map(parse_minutes_or_null).transpose()?.flatten(),
                hourly_rate: optional(&row, "hourly_rate").map(parse_u64_or_null).transpose()?.flatten(),
            })
        }
        "reservations" => {
            let row = named_row(insert, RESERVATION_COLUMNS)?;
            let text = |col: &str| -> Result<Option<String>, SqlError> {
                Ok(optional(&row, col).map(parse_string_or_null).transpose()?.flatten())
            };
            let customer = CustomerInfo {
                name: text("customer_name")?.unwrap_or_default(),
                contact_number: text("contact_number")?,
                email: text("email")?,
                notes: text("notes")?,
                address: text("address")?,
            };
            Ok(Command::InsertReservation {
                id: parse_ulid(required(&row, "id")?)?,
                resource_id: parse_ulid(required(&row, "resource_id")?)?,
                date: parse_date_expr(required(&row, "date")?)?,
                start: parse_clock_expr(required(&row, "start")?)?,
                duration: parse_f64(required(&row, "duration")?)?,
                customer,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set: HashMap<String, &Expr> = HashMap::new();
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(col, &a.value);
    }

    match table.as_str() {
        "resources" => {
            let mut patch = ResourcePatch::default();
            for (col, expr) in set {
                match col.as_str() {
                    "name" => patch.name = Some(parse_string_or_null(expr)?),
                    "open" => patch.open = Some(parse_clock_expr(expr)?),
                    "close" => patch.close = Some(parse_clock_expr(expr)?),
                    "step" => patch.step = Some(parse_minutes(expr)?),
                    "hourly_rate" => patch.hourly_rate = Some(parse_u64_or_null(expr)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateResource { id, patch })
        }
        "reservations" => {
            let (mut date, mut start, mut duration) = (None, None, None);
            for (col, expr) in set {
                match col.as_str() {
                    "date" => date = Some(parse_date_expr(expr)?),
                    "start" => start = Some(parse_clock_expr(expr)?),
                    "duration" => duration = Some(parse_f64(expr)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateReservation { id, date, start, duration })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;

    let mut filters: HashMap<String, &Expr> = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let resource_id = || -> Result<Ulid, SqlError> {
        parse_ulid(filters.get("resource_id").ok_or(SqlError::MissingFilter("resource_id"))?)
    };
    let date = || -> Result<NaiveDate, SqlError> {
        parse_date_expr(filters.get("date").ok_or(SqlError::MissingFilter("date"))?)
    };

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "availability" => Ok(Command::SelectAvailability {
            resource_id: resource_id()?,
            date: date()?,
            duration: filters.get("duration").map(|e| parse_f64(e)).transpose()?,
        }),
        "free_windows" => Ok(Command::SelectFreeWindows {
            resource_id: resource_id()?,
            date: date()?,
            min_duration: filters.get("min_duration").map(|e| parse_minutes(e)).transpose()?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            resource_id: resource_id()?,
            date: filters.get("date").map(|e| parse_date_expr(e)).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into a column → value map.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(col, right);
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// First VALUES row keyed by column name. Without a column list the
/// values are taken in `positional` order.
fn named_row<'a>(insert: &'a ast::Insert, positional: &[&str]) -> Result<HashMap<String, &'a Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if values.rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let row = &values.rows[0];

    let columns: Vec<String> = if insert.columns.is_empty() {
        positional.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    // A bare VALUES list may stop early; an explicit column list must be matched one to one.
    let arity_ok = if insert.columns.is_empty() {
        row.len() <= columns.len()
    } else {
        row.len() == columns.len()
    };
    if !arity_ok {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !positional.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }
    Ok(columns.into_iter().zip(row.iter()).collect())
}

fn required<'a>(row: &HashMap<String, &'a Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(col).copied().ok_or(SqlError::MissingColumn(col))
}

fn optional<'a>(row: &HashMap<String, &'a Expr>, col: &str) -> Option<&'a Expr> {
    row.get(col).copied()
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        _ => Err(SqlError::Parse(format!("expected literal, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_clock_expr(expr: &Expr) -> Result<Minutes, SqlError> {
    let s = parse_text(expr)?;
    parse_clock(s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    parse_date(s).ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_f64(expr)?);
    }
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("bad number {s:?}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("bad integer {s:?}")))
}

fn parse_minutes(expr: &Expr) -> Result<Minutes, SqlError> {
    let v = parse_i64(expr)?;
    Minutes::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_minutes_or_null(expr: &Expr) -> Result<Option<Minutes>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_minutes(expr).map(Some) }
}

fn parse_u64_or_null(expr: &Expr) -> Result<Option<u64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64(expr)?;
    u64::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
