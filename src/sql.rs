use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::NewReservation;
use crate::model::*;

const DEFAULT_OPEN: &str = "08:00";
const DEFAULT_CLOSE: &str = "18:00";

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertGarage {
        id: Ulid,
        name: String,
        bays: u32,
        open_time: ClockTime,
        close_time: ClockTime,
    },
    /// Resize, optionally with hours for any bays created.
    UpdateGarage {
        id: Ulid,
        bays: u32,
        open_time: Option<ClockTime>,
        close_time: Option<ClockTime>,
    },
    DeleteGarage {
        id: Ulid,
    },
    SelectGarages {
        id: Option<Ulid>,
    },
    ToggleBay {
        id: Ulid,
    },
    DeleteBayRange {
        garage_id: Ulid,
        min: u32,
        max: u32,
    },
    SelectBays {
        garage_id: Ulid,
    },
    SelectAvailableBays {
        garage_id: Ulid,
        date: NaiveDate,
        window: Window,
    },
    InsertReservation(NewReservation),
    UpdateReservationStatus {
        id: Ulid,
        status: ReservationStatus,
        comment: Option<String>,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectReservations {
        garage_id: Ulid,
        date: Option<NaiveDate>,
    },
    SelectNotifications {
        user_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            let table = table_factor_name(&table.relation)?;
            parse_update(&table, assignments, selection.as_ref())
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the values
/// are matched to `canonical` by position.
struct Row {
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn from_insert(insert: &ast::Insert, canonical: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() {
            return Err(SqlError::WrongArity("columns", names.len(), values.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !canonical.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self { cells: names.into_iter().zip(values).collect() })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, e)| e)
            .filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "garages" => {
            let row = Row::from_insert(insert, &["id", "name", "bays", "open_time", "close_time"])?;
            Ok(Command::InsertGarage {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                bays: row.get("bays").map(parse_u32).transpose()?.unwrap_or(0),
                open_time: clock_or_default(row.get("open_time"), DEFAULT_OPEN)?,
                close_time: clock_or_default(row.get("close_time"), DEFAULT_CLOSE)?,
            })
        }
        "reservations" => {
            let row = Row::from_insert(
                insert,
                &[
                    "id", "user_id", "garage_id", "car_id", "date", "start_time", "end_time",
                    "services", "comment", "total_amount",
                ],
            )?;
            let window = parse_window(row.required("start_time")?, row.required("end_time")?)?;
            Ok(Command::InsertReservation(NewReservation {
                id: parse_ulid(row.required("id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
                garage_id: parse_ulid(row.required("garage_id")?)?,
                car_id: parse_ulid(row.required("car_id")?)?,
                date: parse_date(row.required("date")?)?,
                window,
                services: row.get("services").map(parse_services).transpose()?.unwrap_or_default(),
                comment: row.get("comment").map(parse_string).transpose()?,
                total_amount: row.get("total_amount").map(parse_u64).transpose()?.unwrap_or(0),
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &str,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &a.value));
    }
    let assigned = |column: &str| set.iter().find(|(c, _)| c == column).map(|(_, e)| *e);
    let filters = Filters::from_selection(selection)?;
    let id = filters.ulid("id")?;

    match table {
        "garages" => {
            let bays = assigned("bays").ok_or(SqlError::MissingColumn("bays"))?;
            Ok(Command::UpdateGarage {
                id,
                bays: parse_u32(bays)?,
                open_time: assigned("open_time").map(parse_clock).transpose()?,
                close_time: assigned("close_time").map(parse_clock).transpose()?,
            })
        }
        "repair_bays" => match assigned("active") {
            Some(Expr::UnaryOp { op: UnaryOperator::Not, expr })
                if expr_column_name(expr).as_deref() == Some("active") =>
            {
                Ok(Command::ToggleBay { id })
            }
            _ => Err(SqlError::Unsupported(
                "repair_bays only supports SET active = NOT active".into(),
            )),
        },
        "reservations" => {
            let status = assigned("status").ok_or(SqlError::MissingColumn("status"))?;
            let status = parse_string(status)?;
            Ok(Command::UpdateReservationStatus {
                id,
                status: ReservationStatus::parse(&status)
                    .ok_or_else(|| SqlError::Invalid(format!("unknown status: {status}")))?,
                comment: assigned("comment")
                    .filter(|e| !is_null(e))
                    .map(parse_string)
                    .transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "garages" => Ok(Command::DeleteGarage { id: filters.ulid("id")? }),
        "repair_bays" => {
            let garage_id = filters.ulid("garage_id")?;
            let (min, max) = match filters.find("bay_number", BinaryOperator::Eq) {
                Some(n) => {
                    let n = parse_u32(n)?;
                    (n, n)
                }
                None => (
                    parse_u32(filters.require("bay_number", BinaryOperator::GtEq)?)?,
                    parse_u32(filters.require("bay_number", BinaryOperator::LtEq)?)?,
                ),
            };
            Ok(Command::DeleteBayRange { garage_id, min, max })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "garages" => Ok(Command::SelectGarages {
            id: filters.equals("id").map(parse_ulid).transpose()?,
        }),
        "repair_bays" => Ok(Command::SelectBays { garage_id: filters.ulid("garage_id")? }),
        "available_bays" => Ok(Command::SelectAvailableBays {
            garage_id: filters.ulid("garage_id")?,
            date: parse_date(filters.require("date", BinaryOperator::Eq)?)?,
            window: parse_window(
                filters.require("start_time", BinaryOperator::Eq)?,
                filters.require("end_time", BinaryOperator::Eq)?,
            )?,
        }),
        "reservations" => {
            if let Some(id) = filters.equals("id") {
                return Ok(Command::SelectReservation { id: parse_ulid(id)? });
            }
            Ok(Command::SelectReservations {
                garage_id: filters.ulid("garage_id")?,
                date: filters.equals("date").map(parse_date).transpose()?,
            })
        }
        "notifications" => Ok(Command::SelectNotifications { user_id: filters.ulid("user_id")? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column <op> value` terms of an AND-only WHERE clause.
struct Filters<'a> {
    terms: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn find(&self, column: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn equals(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, BinaryOperator::Eq)
    }

    fn require(&self, column: &'static str, op: BinaryOperator) -> Result<&'a Expr, SqlError> {
        self.find(column, op).ok_or(SqlError::MissingFilter(column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.require(column, BinaryOperator::Eq)?)
    }
}

fn collect_terms<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_terms(left, out)?;
            collect_terms(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((column, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Invalid(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match (extract_value(expr), expr) {
        (Some(Value::Number(s, _)), _) | (Some(Value::SingleQuotedString(s)), _) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        (None, Expr::UnaryOp { op: UnaryOperator::Minus, expr }) => Ok(-parse_i64(expr)?),
        _ => Err(SqlError::Parse(format!("expected number, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of range")))
}

fn parse_clock(expr: &Expr) -> Result<ClockTime, SqlError> {
    let s = parse_string(expr)?;
    ClockTime::parse(&s).ok_or_else(|| SqlError::Invalid(format!("bad time {s:?}, expected HH:MM")))
}

fn clock_or_default(expr: Option<&Expr>, default: &str) -> Result<ClockTime, SqlError> {
    match expr {
        Some(e) => parse_clock(e),
        None => ClockTime::parse(default)
            .ok_or_else(|| SqlError::Parse(format!("bad default time {default}"))),
    }
}

fn parse_window(start: &Expr, end: &Expr) -> Result<Window, SqlError> {
    let (start, end) = (parse_clock(start)?, parse_clock(end)?);
    Window::new(start, end)
        .ok_or_else(|| SqlError::Invalid(format!("start time {start} must be before end time {end}")))
}

/// `YYYY-MM-DD`, or an RFC 3339 timestamp reduced to its calendar day.
pub fn parse_date_str(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|d| d.date_naive()))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date_str(&s).ok_or_else(|| SqlError::Invalid(format!("bad date {s:?}")))
}

/// Comma-separated service tags; empty string means none.
fn parse_services(expr: &Expr) -> Result<Vec<ServiceType>, SqlError> {
    let s = parse_string(expr)?;
    s.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(|tag| {
            ServiceType::parse(tag).ok_or_else(|| SqlError::Invalid(format!("unknown service: {tag}")))
        })
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    /// Well-formed statement carrying a value outside its domain.
    Invalid(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::Unsupported(_) => "0A000",
            SqlError::Invalid(_) => "22023",
            _ => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Invalid(s) => write!(f, "invalid input: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const G: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const R: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    fn t(s: &str) -> ClockTime {
        ClockTime::parse(s).unwrap()
    }

    #[test]
    fn insert_garage_with_defaults() {
        let cmd = parse_sql(&format!("INSERT INTO garages (id, name, bays) VALUES ('{G}', 'Central', 3)")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertGarage {
                id: ulid(G),
                name: "Central".into(),
                bays: 3,
                open_time: t("08:00"),
                close_time: t("18:00"),
            }
        );
    }

    #[test]
    fn insert_garage_positional() {
        let cmd = parse_sql(&format!("INSERT INTO garages VALUES ('{G}', 'Central', 2, '07:30', '16:00')")).unwrap();
        match cmd {
            Command::InsertGarage { bays, open_time, close_time, .. } => {
                assert_eq!(bays, 2);
                assert_eq!(open_time, t("07:30"));
                assert_eq!(close_time, t("16:00"));
            }
            _ => panic!("expected InsertGarage, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_reservation_full() {
        let sql = format!(
            "INSERT INTO reservations (id, user_id, garage_id, car_id, date, start_time, end_time, services, comment, total_amount) \
             VALUES ('{R}', '{G}', '{G}', '{G}', '2025-06-02', '10:00', '11:30', 'oil_change, brakes', 'rattle', 12000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation(req) => {
                assert_eq!(req.id, ulid(R));
                assert_eq!(req.date, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
                assert_eq!(req.window, Window::new(t("10:00"), t("11:30")).unwrap());
                assert_eq!(req.services, vec![ServiceType::OilChange, ServiceType::Brakes]);
                assert_eq!(req.comment.as_deref(), Some("rattle"));
                assert_eq!(req.total_amount, 12000);
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn insert_reservation_accepts_rfc3339_date() {
        let sql = format!(
            "INSERT INTO reservations (id, user_id, garage_id, car_id, date, start_time, end_time) \
             VALUES ('{R}', '{G}', '{G}', '{G}', '2025-06-02T00:00:00.000Z', '10:00', '11:00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation(req) => {
                assert_eq!(req.date, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
                assert!(req.services.is_empty());
                assert_eq!(req.comment, None);
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn insert_reservation_rejects_bad_input() {
        let bad_window = format!(
            "INSERT INTO reservations (id, user_id, garage_id, car_id, date, start_time, end_time) \
             VALUES ('{R}', '{G}', '{G}', '{G}', '2025-06-02', '11:00', '10:00')"
        );
        assert!(matches!(parse_sql(&bad_window), Err(SqlError::Invalid(_))));

        let bad_service = format!(
            "INSERT INTO reservations (id, user_id, garage_id, car_id, date, start_time, end_time, services) \
             VALUES ('{R}', '{G}', '{G}', '{G}', '2025-06-02', '10:00', '11:00', 'teleport')"
        );
        assert!(matches!(parse_sql(&bad_service), Err(SqlError::Invalid(_))));

        let bad_time = format!(
            "INSERT INTO reservations (id, user_id, garage_id, car_id, date, start_time, end_time) \
             VALUES ('{R}', '{G}', '{G}', '{G}', '2025-06-02', '9:00', '10:00')"
        );
        assert!(matches!(parse_sql(&bad_time), Err(SqlError::Invalid(_))));

        let missing = format!("INSERT INTO reservations (id, user_id) VALUES ('{R}', '{G}')");
        assert!(matches!(parse_sql(&missing), Err(SqlError::MissingColumn(_))));
    }

    #[test]
    fn insert_unknown_column() {
        let sql = format!("INSERT INTO garages (id, name, colour) VALUES ('{G}', 'x', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "colour"));
    }

    #[test]
    fn update_garage_resize() {
        let cmd = parse_sql(&format!("UPDATE garages SET bays = 5, open_time = '09:00' WHERE id = '{G}'")).unwrap();
        assert_eq!(
            cmd,
            Command::UpdateGarage { id: ulid(G), bays: 5, open_time: Some(t("09:00")), close_time: None }
        );
    }

    #[test]
    fn update_repair_bay_toggle() {
        let cmd = parse_sql(&format!("UPDATE repair_bays SET active = NOT active WHERE id = '{G}'")).unwrap();
        assert_eq!(cmd, Command::ToggleBay { id: ulid(G) });

        let sql = format!("UPDATE repair_bays SET active = false WHERE id = '{G}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_reservation_status() {
        let cmd = parse_sql(&format!(
            "UPDATE reservations SET status = 'cancelled', comment = 'car sold' WHERE id = '{R}'"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::UpdateReservationStatus {
                id: ulid(R),
                status: ReservationStatus::Cancelled,
                comment: Some("car sold".into()),
            }
        );
        let sql = format!("UPDATE reservations SET status = 'teleported' WHERE id = '{R}'");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn delete_bay_range() {
        let cmd = parse_sql(&format!(
            "DELETE FROM repair_bays WHERE garage_id = '{G}' AND bay_number >= 2 AND bay_number <= 3"
        ))
        .unwrap();
        assert_eq!(cmd, Command::DeleteBayRange { garage_id: ulid(G), min: 2, max: 3 });

        let single = parse_sql(&format!("DELETE FROM repair_bays WHERE garage_id = '{G}' AND bay_number = 4")).unwrap();
        assert_eq!(single, Command::DeleteBayRange { garage_id: ulid(G), min: 4, max: 4 });
    }

    #[test]
    fn delete_garage() {
        let cmd = parse_sql(&format!("DELETE FROM garages WHERE id = '{G}'")).unwrap();
        assert_eq!(cmd, Command::DeleteGarage { id: ulid(G) });
    }

    #[test]
    fn select_available_bays() {
        let cmd = parse_sql(&format!(
            "SELECT * FROM available_bays WHERE garage_id = '{G}' AND date = '2025-06-02' \
             AND start_time = '10:00' AND end_time = '11:00'"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectAvailableBays {
                garage_id: ulid(G),
                date: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
                window: Window::new(t("10:00"), t("11:00")).unwrap(),
            }
        );
    }

    #[test]
    fn select_reservations_by_id_or_garage() {
        let by_id = parse_sql(&format!("SELECT * FROM reservations WHERE id = '{R}'")).unwrap();
        assert_eq!(by_id, Command::SelectReservation { id: ulid(R) });

        let by_day = parse_sql(&format!(
            "SELECT * FROM reservations WHERE garage_id = '{G}' AND date = '2025-06-02'"
        ))
        .unwrap();
        assert_eq!(
            by_day,
            Command::SelectReservations {
                garage_id: ulid(G),
                date: NaiveDate::from_ymd_opt(2025, 6, 2),
            }
        );
    }

    #[test]
    fn select_garages_and_notifications() {
        assert_eq!(parse_sql("SELECT * FROM garages").unwrap(), Command::SelectGarages { id: None });
        assert_eq!(
            parse_sql(&format!("SELECT * FROM notifications WHERE user_id = '{G}'")).unwrap(),
            Command::SelectNotifications { user_id: ulid(G) }
        );
    }

    #[test]
    fn missing_filter_is_reported() {
        assert!(matches!(
            parse_sql("SELECT * FROM repair_bays"),
            Err(SqlError::MissingFilter("garage_id"))
        ));
        assert!(matches!(
            parse_sql(&format!("SELECT * FROM available_bays WHERE garage_id = '{G}'")),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn unknown_table_and_empty() {
        let err = parse_sql("SELECT * FROM invoices").unwrap_err();
        assert_eq!(err.sqlstate(), "42P01");
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn bad_values_are_invalid_input() {
        let err = parse_sql("DELETE FROM garages WHERE id = 'not-a-ulid'").unwrap_err();
        assert!(matches!(err, SqlError::Invalid(_)));
        assert_eq!(err.sqlstate(), "22023");

        let bad_date = format!(
            "SELECT * FROM available_bays WHERE garage_id = '{G}' AND date = '2025-13-40' \
             AND start_time = '10:00' AND end_time = '11:00'"
        );
        assert_eq!(parse_sql(&bad_date).unwrap_err().sqlstate(), "22023");

        let bad_status = format!("UPDATE reservations SET status = 'teleported' WHERE id = '{R}'");
        assert_eq!(parse_sql(&bad_status).unwrap_err().sqlstate(), "22023");

        // Broken syntax stays a syntax error.
        assert_eq!(parse_sql("SELEC * FROM garages").unwrap_err().sqlstate(), "42601");
    }

    #[test]
    fn date_formats() {
        let d = NaiveDate::from_ymd_opt(2025, 1, 31);
        assert_eq!(parse_date_str("2025-01-31"), d);
        assert_eq!(parse_date_str("2025-01-31T23:00:00+00:00"), d);
        assert_eq!(parse_date_str("31/01/2025"), None);
    }
}
