use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::hours::OperatingHours;
use crate::model::*;

/// Which calendar rows an appointment listing selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppointmentFilter {
    Id(Ulid),
    Business(Ulid),
    Staff(Ulid),
    Client(Ulid),
    Confirmation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentFilter {
    Id(Ulid),
    Appointment(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBusiness {
        id: Ulid,
        name: String,
        hours: Option<OperatingHours>,
    },
    UpdateBusiness {
        id: Ulid,
        update: BusinessUpdate,
    },
    InsertStaff {
        id: Ulid,
        business_id: Ulid,
        name: String,
        specialization: Option<String>,
        schedule: Option<OperatingHours>,
    },
    UpdateStaffSchedule {
        id: Ulid,
        schedule: Option<OperatingHours>,
    },
    InsertService {
        service: Service,
    },
    UpdateService {
        id: Ulid,
        update: ServiceUpdate,
    },
    DeleteService {
        id: Ulid,
    },
    InsertAppointment {
        request: BookingRequest,
    },
    RescheduleAppointment {
        id: Ulid,
        start: Ms,
        staff: Patch<Ulid>,
    },
    UpdateAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
        reason: Option<String>,
    },
    DeleteAppointment {
        id: Ulid,
    },
    InsertFeedback {
        request: FeedbackRequest,
    },
    InsertNotification {
        request: NotificationRequest,
    },
    MarkNotificationRead {
        id: Ulid,
    },
    InsertPayment {
        request: PaymentRequest,
    },
    UpdatePayment {
        id: Ulid,
        update: PaymentUpdate,
    },
    SelectAppointments {
        filter: AppointmentFilter,
        window: Option<Span>,
    },
    SelectConflict {
        resource_id: Ulid,
        start: Ms,
        duration_minutes: i64,
    },
    SelectServices {
        business_id: Ulid,
    },
    SelectRatings {
        business_id: Ulid,
    },
    SelectNotifications {
        user_id: Ulid,
    },
    SelectPayments {
        filter: PaymentFilter,
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const BUSINESS_COLUMNS: &[&str] = &["id", "name", "operating_hours"];
const STAFF_COLUMNS: &[&str] = &["id", "business_id", "name", "specialization", "schedule"];
const SERVICE_COLUMNS: &[&str] = &["id", "business_id", "name", "duration_minutes", "price", "category"];
const APPOINTMENT_COLUMNS: &[&str] =
    &["id", "client_id", "business_id", "service_id", "staff_id", "start", "notes"];
const FEEDBACK_COLUMNS: &[&str] = &[
    "id",
    "appointment_id",
    "rating",
    "service_quality",
    "punctuality",
    "cleanliness",
    "comments",
];
const NOTIFICATION_COLUMNS: &[&str] = &["id", "user_id", "kind", "title", "message", "appointment_id"];
const PAYMENT_COLUMNS: &[&str] = &[
    "id",
    "appointment_id",
    "amount",
    "currency",
    "payment_method",
    "provider_reference",
];

/// One VALUES row keyed by column name. Without an explicit column list the
/// values are matched positionally against the table's default columns.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(
        table: &'static str,
        insert: &ast::Insert,
        defaults: &[&str],
    ) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
            }
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        Ok(Self {
            table,
            values: columns.into_iter().zip(values).collect(),
        })
    }

    /// NULL and absent columns both read as `None`.
    fn optional(&self, column: &str) -> Option<&Expr> {
        self.values.get(column).filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.optional(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "businesses" => {
            let row = Row::from_insert("businesses", insert, BUSINESS_COLUMNS)?;
            let hours = row.optional("operating_hours").map(parse_hours).transpose()?;
            Ok(Command::InsertBusiness {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                hours,
            })
        }
        "staff" => {
            let row = Row::from_insert("staff", insert, STAFF_COLUMNS)?;
            Ok(Command::InsertStaff {
                id: parse_ulid(row.required("id")?)?,
                business_id: parse_ulid(row.required("business_id")?)?,
                name: parse_string(row.required("name")?)?,
                specialization: row.optional("specialization").map(parse_string).transpose()?,
                schedule: row.optional("schedule").map(parse_hours).transpose()?,
            })
        }
        "services" => {
            let row = Row::from_insert("services", insert, SERVICE_COLUMNS)?;
            let price_cents = match (row.optional("price"), row.optional("price_cents")) {
                (Some(price), _) => parse_price(price)?,
                (None, Some(cents)) => parse_i64(cents)?,
                (None, None) => return Err(SqlError::MissingColumn("services", "price")),
            };
            Ok(Command::InsertService {
                service: Service {
                    id: parse_ulid(row.required("id")?)?,
                    business_id: parse_ulid(row.required("business_id")?)?,
                    name: parse_string(row.required("name")?)?,
                    duration_minutes: parse_i64(row.required("duration_minutes")?)?,
                    price_cents,
                    category: row.optional("category").map(parse_string).transpose()?,
                    active: true,
                },
            })
        }
        "appointments" => {
            let row = Row::from_insert("appointments", insert, APPOINTMENT_COLUMNS)?;
            Ok(Command::InsertAppointment {
                request: BookingRequest {
                    id: parse_ulid(row.required("id")?)?,
                    client_id: parse_ulid(row.required("client_id")?)?,
                    business_id: parse_ulid(row.required("business_id")?)?,
                    service_id: parse_ulid(row.required("service_id")?)?,
                    staff_id: row.optional("staff_id").map(parse_ulid).transpose()?,
                    start: parse_timestamp(row.required("start")?)?,
                    notes: row.optional("notes").map(parse_string).transpose()?,
                },
            })
        }
        "feedback" => {
            let row = Row::from_insert("feedback", insert, FEEDBACK_COLUMNS)?;
            Ok(Command::InsertFeedback {
                request: FeedbackRequest {
                    id: parse_ulid(row.required("id")?)?,
                    appointment_id: parse_ulid(row.required("appointment_id")?)?,
                    rating: parse_score(row.required("rating")?)?,
                    service_quality: row.optional("service_quality").map(parse_score).transpose()?,
                    punctuality: row.optional("punctuality").map(parse_score).transpose()?,
                    cleanliness: row.optional("cleanliness").map(parse_score).transpose()?,
                    comments: row.optional("comments").map(parse_string).transpose()?,
                },
            })
        }
        "notifications" => {
            let row = Row::from_insert("notifications", insert, NOTIFICATION_COLUMNS)?;
            let kind = parse_string(row.required("kind")?)?
                .parse::<NotificationKind>()
                .map_err(SqlError::Parse)?;
            Ok(Command::InsertNotification {
                request: NotificationRequest {
                    id: parse_ulid(row.required("id")?)?,
                    user_id: parse_ulid(row.required("user_id")?)?,
                    kind,
                    title: parse_string(row.required("title")?)?,
                    message: parse_string(row.required("message")?)?,
                    appointment_id: row.optional("appointment_id").map(parse_ulid).transpose()?,
                },
            })
        }
        "payments" => {
            let row = Row::from_insert("payments", insert, PAYMENT_COLUMNS)?;
            let amount_cents = match (row.optional("amount"), row.optional("amount_cents")) {
                (Some(amount), _) => Some(parse_price(amount)?),
                (None, Some(cents)) => Some(parse_i64(cents)?),
                (None, None) => None,
            };
            Ok(Command::InsertPayment {
                request: PaymentRequest {
                    id: parse_ulid(row.required("id")?)?,
                    appointment_id: parse_ulid(row.required("appointment_id")?)?,
                    amount_cents,
                    currency: row.optional("currency").map(parse_string).transpose()?,
                    payment_method: row.optional("payment_method").map(parse_string).transpose()?,
                    provider_reference: row
                        .optional("provider_reference")
                        .map(parse_string)
                        .transpose()?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
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
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(column, &a.value);
    }
    let take = |col: &str| set.get(col).copied().filter(|e| !is_null(e));

    match table.as_str() {
        "businesses" => {
            let update = BusinessUpdate {
                name: take("name").map(parse_string).transpose()?,
                hours: patch(&set, "operating_hours", parse_hours)?,
            };
            if update.name.is_none() && update.hours.is_keep() {
                return Err(SqlError::MissingColumn("businesses", "name"));
            }
            Ok(Command::UpdateBusiness { id, update })
        }
        "staff" => match patch(&set, "schedule", parse_hours)? {
            Patch::Keep => Err(SqlError::MissingColumn("staff", "schedule")),
            Patch::Set(hours) => Ok(Command::UpdateStaffSchedule {
                id,
                schedule: Some(hours),
            }),
            Patch::Clear => Ok(Command::UpdateStaffSchedule { id, schedule: None }),
        },
        "services" => {
            let price_cents = match (take("price"), take("price_cents")) {
                (Some(price), _) => Some(parse_price(price)?),
                (None, Some(cents)) => Some(parse_i64(cents)?),
                (None, None) => None,
            };
            let update = ServiceUpdate {
                name: take("name").map(parse_string).transpose()?,
                duration_minutes: take("duration_minutes").map(parse_i64).transpose()?,
                price_cents,
                category: patch(&set, "category", parse_string)?,
            };
            if update == ServiceUpdate::default() {
                return Err(SqlError::MissingColumn("services", "name"));
            }
            Ok(Command::UpdateService { id, update })
        }
        "payments" => {
            let status = parse_string(take("status").ok_or(SqlError::MissingColumn("payments", "status"))?)?
                .parse::<PaymentStatus>()
                .map_err(SqlError::Parse)?;
            Ok(Command::UpdatePayment {
                id,
                update: PaymentUpdate {
                    status,
                    refund_reference: take("refund_reference").map(parse_string).transpose()?,
                    receipt_url: take("receipt_url").map(parse_string).transpose()?,
                },
            })
        }
        "appointments" => {
            if let Some(status) = take("status") {
                if take("start").is_some() {
                    return Err(SqlError::Unsupported(
                        "status and start cannot change in one UPDATE".into(),
                    ));
                }
                let status = parse_string(status)?
                    .parse::<AppointmentStatus>()
                    .map_err(SqlError::Parse)?;
                let reason = take("reason")
                    .or_else(|| take("cancellation_reason"))
                    .map(parse_string)
                    .transpose()?;
                Ok(Command::UpdateAppointmentStatus { id, status, reason })
            } else if let Some(start) = take("start") {
                Ok(Command::RescheduleAppointment {
                    id,
                    start: parse_timestamp(start)?,
                    staff: patch(&set, "staff_id", parse_ulid)?,
                })
            } else {
                Err(SqlError::MissingColumn("appointments", "status"))
            }
        }
        "notifications" => match take("read") {
            Some(read) if parse_bool(read)? => Ok(Command::MarkNotificationRead { id }),
            Some(_) => Err(SqlError::Unsupported("notifications cannot be marked unread".into())),
            None => Err(SqlError::MissingColumn("notifications", "read")),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Column predicates collected from a WHERE clause of `=`, `>=` and `<=`
/// comparisons joined by AND.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    gte: HashMap<String, &'a Expr>,
    lte: HashMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let target = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.gte,
                    ast::BinaryOperator::LtEq => &mut self.lte,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                target.insert(column, right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
        }
    }

    fn eq_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.eq.get(column).map(|e| parse_ulid(e)).transpose()
    }

    fn require_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.eq_ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }

    fn window(&self) -> Result<Option<Span>, SqlError> {
        let start = self.gte.get("start").map(|e| parse_timestamp(e)).transpose()?;
        let end = self.lte.get("end").map(|e| parse_timestamp(e)).transpose()?;
        match (start, end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) if start <= end => Ok(Some(Span::new(start, end))),
            (Some(_), Some(_)) => Err(SqlError::Parse("window start is after its end".into())),
            (None, Some(_)) => Err(SqlError::MissingFilter("start")),
            (Some(_), None) => Err(SqlError::MissingFilter("end")),
        }
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "appointments" => {
            let filter = if let Some(id) = filters.eq_ulid("id")? {
                AppointmentFilter::Id(id)
            } else if let Some(id) = filters.eq_ulid("staff_id")? {
                AppointmentFilter::Staff(id)
            } else if let Some(id) = filters.eq_ulid("business_id")? {
                AppointmentFilter::Business(id)
            } else if let Some(id) = filters.eq_ulid("client_id")? {
                AppointmentFilter::Client(id)
            } else if let Some(c) = filters.eq.get("confirmation") {
                AppointmentFilter::Confirmation(parse_string(c)?)
            } else {
                return Err(SqlError::MissingFilter("business_id"));
            };
            Ok(Command::SelectAppointments {
                filter,
                window: filters.window()?,
            })
        }
        "conflicts" => Ok(Command::SelectConflict {
            resource_id: filters.require_ulid("resource_id")?,
            start: parse_timestamp(filters.eq.get("start").ok_or(SqlError::MissingFilter("start"))?)?,
            duration_minutes: parse_i64(
                filters
                    .eq
                    .get("duration")
                    .or_else(|| filters.eq.get("duration_minutes"))
                    .ok_or(SqlError::MissingFilter("duration"))?,
            )?,
        }),
        "services" => Ok(Command::SelectServices {
            business_id: filters.require_ulid("business_id")?,
        }),
        "ratings" => Ok(Command::SelectRatings {
            business_id: filters.require_ulid("business_id")?,
        }),
        "notifications" => Ok(Command::SelectNotifications {
            user_id: filters.require_ulid("user_id")?,
        }),
        "payments" => {
            let filter = if let Some(id) = filters.eq_ulid("id")? {
                PaymentFilter::Id(id)
            } else {
                PaymentFilter::Appointment(filters.require_ulid("appointment_id")?)
            };
            Ok(Command::SelectPayments { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
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
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(s.clone())
        }
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(other) => Err(SqlError::Parse(format!("expected ULID string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_score(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid score")))
}

/// An UPDATE column: absent keeps the value, NULL clears it.
fn patch<T>(
    set: &HashMap<String, &Expr>,
    column: &str,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Patch<T>, SqlError> {
    match set.get(column) {
        None => Ok(Patch::Keep),
        Some(e) if is_null(e) => Ok(Patch::Clear),
        Some(e) => parse(e).map(Patch::Set),
    }
}

fn parse_hours(expr: &Expr) -> Result<OperatingHours, SqlError> {
    OperatingHours::parse(&parse_string(expr)?).map_err(SqlError::Parse)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds, either as a number or an RFC 3339 string.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    let text = match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s.trim(),
        _ => return parse_i64(expr).map_err(|e| SqlError::InvalidTimestamp(e.to_string())),
    };
    if let Ok(ms) = text.parse::<Ms>() {
        return Ok(ms);
    }
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::InvalidTimestamp(format!("{text:?}: {e}")))
}

/// Non-negative decimal currency amount (`25`, `25.5`, `'25.50'`) to cents.
fn parse_price(expr: &Expr) -> Result<i64, SqlError> {
    let negative = || SqlError::Parse("price must not be negative".into());
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        ..
    } = expr
    {
        return Err(negative());
    }
    let text = match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s.trim(),
        Some(other) => return Err(SqlError::Parse(format!("expected price, got {other}"))),
        None => return Err(SqlError::Parse(format!("expected value, got {expr}"))),
    };
    if text.starts_with('-') {
        return Err(negative());
    }
    let bad = || SqlError::Parse(format!("bad price: {text}"));
    let digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    let (whole, frac) = text.split_once('.').unwrap_or((text, ""));
    if whole.is_empty() || !digits(whole) || frac.len() > 2 || !digits(frac) {
        return Err(bad());
    }
    let whole: i64 = whole.parse().map_err(|_| bad())?;
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<2}").parse().map_err(|_| bad())?
    };
    whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac))
        .ok_or_else(bad)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    InvalidTimestamp(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidTimestamp(s) => write!(f, "invalid timestamp: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_business_with_hours() {
        let sql = format!(
            r#"INSERT INTO businesses (id, name, operating_hours) VALUES ('{A}', 'Island Cuts', '{{"mon": {{"open": "09:00", "close": "17:00"}}}}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBusiness { id, name, hours } => {
                assert_eq!(id, ulid(A));
                assert_eq!(name, "Island Cuts");
                let hours = hours.unwrap();
                assert!(hours.days[0].is_some());
                assert!(hours.days[6].is_none());
            }
            cmd => panic!("expected InsertBusiness, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_business_positional_without_hours() {
        let sql = format!("INSERT INTO businesses VALUES ('{A}', 'Island Cuts')");
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertBusiness {
                id: ulid(A),
                name: "Island Cuts".into(),
                hours: None,
            }
        );
    }

    #[test]
    fn parse_insert_staff_null_specialization() {
        let sql = format!(
            "INSERT INTO staff (id, business_id, name, specialization) VALUES ('{A}', '{B}', 'Maya', NULL)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertStaff {
                business_id,
                specialization,
                ..
            } => {
                assert_eq!(business_id, ulid(B));
                assert_eq!(specialization, None);
            }
            cmd => panic!("expected InsertStaff, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_service_price_to_cents() {
        let sql = format!(
            "INSERT INTO services (id, business_id, name, duration_minutes, price, category) VALUES ('{A}', '{B}', 'Haircut', 45, 25.5, 'hair')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertService { service } => {
                assert_eq!(service.duration_minutes, 45);
                assert_eq!(service.price_cents, 2550);
                assert_eq!(service.category.as_deref(), Some("hair"));
            }
            cmd => panic!("expected InsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment_rfc3339_start() {
        let sql = format!(
            "INSERT INTO appointments (id, client_id, business_id, service_id, start) VALUES ('{A}', '{B}', '{B}', '{A}', '2026-10-15T14:00:00Z')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment { request } => {
                assert_eq!(request.start, 1_792_072_800_000);
                assert_eq!(request.staff_id, None);
                assert_eq!(request.notes, None);
            }
            cmd => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment_bad_timestamp() {
        let sql = format!(
            "INSERT INTO appointments (id, client_id, business_id, service_id, start) VALUES ('{A}', '{B}', '{B}', '{A}', 'next tuesday')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidTimestamp(_))));
    }

    #[test]
    fn parse_insert_missing_required_column() {
        let sql = format!("INSERT INTO staff (id, name) VALUES ('{A}', 'Maya')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("staff", "business_id"))
        ));
    }

    #[test]
    fn parse_insert_column_count_mismatch() {
        let sql = format!("INSERT INTO staff (id, business_id, name) VALUES ('{A}', '{B}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("staff", 3, 2))));
    }

    #[test]
    fn parse_insert_feedback() {
        let sql = format!(
            "INSERT INTO feedback (id, appointment_id, rating, punctuality, comments) VALUES ('{A}', '{B}', 5, 4, 'Lovely')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertFeedback { request } => {
                assert_eq!(request.rating, 5);
                assert_eq!(request.punctuality, Some(4));
                assert_eq!(request.service_quality, None);
                assert_eq!(request.comments.as_deref(), Some("Lovely"));
            }
            cmd => panic!("expected InsertFeedback, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_notification() {
        let sql = format!(
            "INSERT INTO notifications (id, user_id, kind, title, message) VALUES ('{A}', '{B}', 'promotional', 'Sale', '20% off')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertNotification { request } => {
                assert_eq!(request.kind, NotificationKind::Promotional);
                assert_eq!(request.appointment_id, None);
            }
            cmd => panic!("expected InsertNotification, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_reschedule() {
        let sql = format!("UPDATE appointments SET start = 1792072800000, staff_id = '{B}' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RescheduleAppointment {
                id: ulid(A),
                start: 1_792_072_800_000,
                staff: Patch::Set(ulid(B)),
            }
        );
        let sql = format!("UPDATE appointments SET start = 1792072800000 WHERE id = '{A}'");
        match parse_sql(&sql).unwrap() {
            Command::RescheduleAppointment { staff, .. } => assert_eq!(staff, Patch::Keep),
            cmd => panic!("expected RescheduleAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_reschedule_unassigns_with_null() {
        let sql = format!("UPDATE appointments SET start = 1792072800000, staff_id = NULL WHERE id = '{A}'");
        match parse_sql(&sql).unwrap() {
            Command::RescheduleAppointment { staff, .. } => assert_eq!(staff, Patch::Clear),
            cmd => panic!("expected RescheduleAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_business() {
        let sql = format!("UPDATE businesses SET name = 'Island Cuts 2', operating_hours = NULL WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateBusiness {
                id: ulid(A),
                update: BusinessUpdate {
                    name: Some("Island Cuts 2".into()),
                    hours: Patch::Clear,
                },
            }
        );
        let sql = format!("UPDATE businesses SET phone = '555' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("businesses", _))));
    }

    #[test]
    fn parse_staff_schedule() {
        let sql = format!(
            r#"UPDATE staff SET schedule = '{{"fri": {{"open": "10:00", "close": "14:00"}}}}' WHERE id = '{A}'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateStaffSchedule { id, schedule } => {
                assert_eq!(id, ulid(A));
                assert!(schedule.unwrap().days[4].is_some());
            }
            cmd => panic!("expected UpdateStaffSchedule, got {cmd:?}"),
        }
        let sql = format!("UPDATE staff SET schedule = NULL WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateStaffSchedule { id: ulid(A), schedule: None }
        );
    }

    #[test]
    fn parse_update_service() {
        let sql = format!(
            "UPDATE services SET duration_minutes = 90, price = '30.00', category = NULL WHERE id = '{A}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateService {
                id: ulid(A),
                update: ServiceUpdate {
                    name: None,
                    duration_minutes: Some(90),
                    price_cents: Some(3000),
                    category: Patch::Clear,
                },
            }
        );
        let sql = format!("UPDATE services SET colour = 'red' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("services", _))));
    }

    #[test]
    fn parse_payments() {
        let sql = format!(
            "INSERT INTO payments (id, appointment_id, amount, currency) VALUES ('{A}', '{B}', 25.00, 'BZD')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertPayment { request } => {
                assert_eq!(request.appointment_id, ulid(B));
                assert_eq!(request.amount_cents, Some(2500));
                assert_eq!(request.currency.as_deref(), Some("BZD"));
                assert_eq!(request.payment_method, None);
            }
            cmd => panic!("expected InsertPayment, got {cmd:?}"),
        }

        let sql = format!("UPDATE payments SET status = 'refunded', refund_reference = 're_1' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdatePayment {
                id: ulid(A),
                update: PaymentUpdate {
                    status: PaymentStatus::Refunded,
                    refund_reference: Some("re_1".into()),
                    receipt_url: None,
                },
            }
        );

        let sql = format!("SELECT * FROM payments WHERE appointment_id = '{B}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectPayments {
                filter: PaymentFilter::Appointment(ulid(B))
            }
        );
    }

    #[test]
    fn parse_status_update_with_reason() {
        let sql = format!("UPDATE appointments SET status = 'cancelled', reason = 'sick' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateAppointmentStatus {
                id: ulid(A),
                status: AppointmentStatus::Cancelled,
                reason: Some("sick".into()),
            }
        );
    }

    #[test]
    fn parse_status_update_unknown_status() {
        let sql = format!("UPDATE appointments SET status = 'archived' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_update_requires_id() {
        let sql = "UPDATE appointments SET status = 'confirmed'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_mark_notification_read() {
        let sql = format!("UPDATE notifications SET read = true WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::MarkNotificationRead { id: ulid(A) }
        );
    }

    #[test]
    fn parse_deletes() {
        let sql = format!("DELETE FROM appointments WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteAppointment { id: ulid(A) });
        let sql = format!("DELETE FROM services WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteService { id: ulid(A) });
    }

    #[test]
    fn parse_select_business_appointments_window() {
        let sql = format!(
            "SELECT * FROM appointments WHERE business_id = '{A}' AND start >= '2026-10-15T00:00:00Z' AND \"end\" <= 1792108800000"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAppointments {
                filter: AppointmentFilter::Business(ulid(A)),
                window: Some(Span::new(1_792_022_400_000, 1_792_108_800_000)),
            }
        );
    }

    #[test]
    fn parse_select_half_window_errors() {
        let sql = format!("SELECT * FROM appointments WHERE staff_id = '{A}' AND start >= 1000");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_select_by_confirmation() {
        let sql = "SELECT * FROM appointments WHERE confirmation = 'BZMG8X2K1ABC123'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAppointments {
                filter: AppointmentFilter::Confirmation("BZMG8X2K1ABC123".into()),
                window: None,
            }
        );
    }

    #[test]
    fn parse_select_conflict() {
        let sql = format!(
            "SELECT * FROM conflicts WHERE resource_id = '{A}' AND start = 1792072800000 AND duration = 30"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectConflict {
                resource_id: ulid(A),
                start: 1_792_072_800_000,
                duration_minutes: 30,
            }
        );
    }

    #[test]
    fn parse_select_conflict_negative_duration() {
        let sql = format!(
            "SELECT * FROM conflicts WHERE resource_id = '{A}' AND start = 1792072800000 AND duration = -5"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectConflict { duration_minutes, .. } => assert_eq!(duration_minutes, -5),
            cmd => panic!("expected SelectConflict, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_catalogue_ratings_notifications() {
        let sql = format!("SELECT * FROM services WHERE business_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectServices { business_id: ulid(A) }
        );
        let sql = format!("SELECT * FROM ratings WHERE business_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectRatings { business_id: ulid(A) }
        );
        let sql = format!("SELECT * FROM notifications WHERE user_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectNotifications { user_id: ulid(A) }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO invoices (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_price_forms() {
        let price = |s: &str| {
            let sql = format!("SELECT {s}");
            let stmt = Parser::parse_sql(&PostgreSqlDialect {}, &sql).unwrap();
            let Statement::Query(q) = &stmt[0] else { panic!() };
            let SetExpr::Select(sel) = q.body.as_ref() else { panic!() };
            let ast::SelectItem::UnnamedExpr(e) = &sel.projection[0] else { panic!() };
            parse_price(e)
        };
        assert_eq!(price("25").unwrap(), 2500);
        assert_eq!(price("'12.5'").unwrap(), 1250);
        assert_eq!(price("0.05").unwrap(), 5);
        assert!(price("1.005").is_err());
        assert!(price("'.5'").is_err());
    }

    #[test]
    fn negative_prices_rejected() {
        let sql = |price: &str| {
            format!(
                "INSERT INTO services (id, business_id, name, duration_minutes, price) VALUES ('{A}', '{B}', 'Trim', 30, {price})"
            )
        };
        for price in ["'-0.50'", "-0.50", "-1", "'-3'", "'+1.00'"] {
            assert!(matches!(parse_sql(&sql(price)), Err(SqlError::Parse(_))), "{price}");
        }
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
