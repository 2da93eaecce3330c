use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SalonAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, AppointmentFilter, Command, PaymentFilter, SqlError};
use crate::tenant::TenantManager;
use crate::util::format_bzd;

pub struct SalonHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SalonQueryParser>,
}

impl SalonHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SalonQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "parse", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertBusiness { id, name, hours } => {
                engine
                    .create_business(id, name, hours)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::UpdateBusiness { id, update } => {
                engine.update_business(id, update).await.map_err(engine_err)?;
                Ok(vec![update_tag()])
            }
            Command::InsertStaff {
                id,
                business_id,
                name,
                specialization,
                schedule,
            } => {
                engine
                    .add_staff(id, business_id, name, specialization, schedule)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::UpdateStaffSchedule { id, schedule } => {
                engine
                    .set_staff_schedule(id, schedule)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![update_tag()])
            }
            Command::InsertService { service } => {
                engine.create_service(service).await.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::UpdateService { id, update } => {
                engine.update_service(id, update).await.map_err(engine_err)?;
                Ok(vec![update_tag()])
            }
            Command::DeleteService { id } => {
                engine.deactivate_service(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAppointment { request } => {
                engine.book_appointment(request).await.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::RescheduleAppointment { id, start, staff } => {
                engine
                    .reschedule_appointment(id, start, staff)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![update_tag()])
            }
            Command::UpdateAppointmentStatus { id, status, reason } => {
                engine
                    .set_status(id, status, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![update_tag()])
            }
            Command::DeleteAppointment { id } => {
                engine.cancel_appointment(id, None).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertFeedback { request } => {
                engine.submit_feedback(request).await.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::InsertNotification { request } => {
                engine.create_notification(request).await.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::MarkNotificationRead { id } => {
                engine.mark_notification_read(id).await.map_err(engine_err)?;
                Ok(vec![update_tag()])
            }
            Command::InsertPayment { request } => {
                engine.record_payment(request).await.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::UpdatePayment { id, update } => {
                engine.update_payment(id, update).await.map_err(engine_err)?;
                Ok(vec![update_tag()])
            }
            Command::SelectPayments { filter } => {
                let payments = match filter {
                    PaymentFilter::Id(id) => engine.payment(id).into_iter().collect(),
                    PaymentFilter::Appointment(id) => engine.appointment_payments(id),
                };
                Ok(vec![payment_rows(payments)?])
            }
            Command::SelectAppointments { filter, window } => {
                let appointments = select_appointments(engine, filter, window).await?;
                Ok(vec![appointment_rows(appointments)?])
            }
            Command::SelectConflict {
                resource_id,
                start,
                duration_minutes,
            } => {
                let conflict = engine
                    .check_conflict(resource_id, start, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(conflict_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&resource_id.to_string())?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&duration_minutes)?;
                encoder.encode_field(&conflict)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectServices { business_id } => {
                let schema = Arc::new(service_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .business_services(business_id)
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.business_id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.duration_minutes)?;
                        encoder.encode_field(&s.price_cents)?;
                        encoder.encode_field(&format_bzd(s.price_cents))?;
                        encoder.encode_field(&s.category)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRatings { business_id } => {
                let summary = engine.rating_summary(business_id);
                let schema = Arc::new(rating_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&summary.business_id.to_string())?;
                encoder.encode_field(&summary.average)?;
                encoder.encode_field(&(summary.count as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectNotifications { user_id } => {
                let schema = Arc::new(notification_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .user_notifications(user_id)
                    .into_iter()
                    .map(|n| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&n.id.to_string())?;
                        encoder.encode_field(&n.user_id.to_string())?;
                        encoder.encode_field(&n.kind.as_str().to_string())?;
                        encoder.encode_field(&n.title)?;
                        encoder.encode_field(&n.message)?;
                        encoder.encode_field(&n.appointment_id.map(|id| id.to_string()))?;
                        encoder.encode_field(&n.read)?;
                        encoder.encode_field(&n.sent_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

async fn select_appointments(
    engine: &Engine,
    filter: AppointmentFilter,
    window: Option<Span>,
) -> PgWireResult<Vec<Appointment>> {
    let in_window = |a: &Appointment| window.is_none_or(|w| w.contains_span(&a.interval().span()));
    let found = match filter {
        AppointmentFilter::Business(id) => engine
            .business_appointments(id, window)
            .await
            .map_err(engine_err)?,
        AppointmentFilter::Staff(id) => engine
            .staff_schedule(id, window)
            .await
            .map_err(engine_err)?,
        AppointmentFilter::Client(id) => engine.client_appointments(id).await,
        AppointmentFilter::Id(id) => engine.get_appointment(id).await.into_iter().collect(),
        AppointmentFilter::Confirmation(c) => {
            engine.find_by_confirmation(&c).await.into_iter().collect()
        }
    };
    Ok(found.into_iter().filter(|a| in_window(a)).collect())
}

fn appointment_rows(appointments: Vec<Appointment>) -> PgWireResult<Response> {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.confirmation)?;
            encoder.encode_field(&a.client_id.to_string())?;
            encoder.encode_field(&a.business_id.to_string())?;
            encoder.encode_field(&a.service_id.to_string())?;
            encoder.encode_field(&a.staff_id.map(|id| id.to_string()))?;
            encoder.encode_field(&a.start)?;
            encoder.encode_field(&a.end())?;
            encoder.encode_field(&a.duration_minutes)?;
            encoder.encode_field(&a.status.to_string())?;
            encoder.encode_field(&a.notes)?;
            encoder.encode_field(&a.cancellation_reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn payment_rows(payments: Vec<PaymentRecord>) -> PgWireResult<Response> {
    let schema = Arc::new(payment_schema());
    let rows: Vec<PgWireResult<_>> = payments
        .into_iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id.to_string())?;
            encoder.encode_field(&p.appointment_id.to_string())?;
            encoder.encode_field(&p.client_id.to_string())?;
            encoder.encode_field(&p.business_id.to_string())?;
            encoder.encode_field(&p.amount_cents)?;
            encoder.encode_field(&format_bzd(p.amount_cents))?;
            encoder.encode_field(&p.currency)?;
            encoder.encode_field(&p.status.as_str().to_string())?;
            encoder.encode_field(&p.payment_method)?;
            encoder.encode_field(&p.provider_reference)?;
            encoder.encode_field(&p.refund_reference)?;
            encoder.encode_field(&p.receipt_url)?;
            encoder.encode_field(&p.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn update_tag() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("confirmation", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("business_id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("staff_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("duration_minutes", Type::INT8),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("cancellation_reason", Type::VARCHAR),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("duration_minutes", Type::INT8),
        field("conflict", Type::BOOL),
    ]
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("business_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("duration_minutes", Type::INT8),
        field("price_cents", Type::INT8),
        field("price", Type::VARCHAR),
        field("category", Type::VARCHAR),
    ]
}

fn rating_schema() -> Vec<FieldInfo> {
    vec![
        field("business_id", Type::VARCHAR),
        field("average", Type::FLOAT8),
        field("count", Type::INT8),
    ]
}

fn notification_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("message", Type::VARCHAR),
        field("appointment_id", Type::VARCHAR),
        field("read", Type::BOOL),
        field("sent_at", Type::INT8),
    ]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("appointment_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("business_id", Type::VARCHAR),
        field("amount_cents", Type::INT8),
        field("amount", Type::VARCHAR),
        field("currency", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("payment_method", Type::VARCHAR),
        field("provider_reference", Type::VARCHAR),
        field("refund_reference", Type::VARCHAR),
        field("receipt_url", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

/// Result columns of a SELECT, by the table after FROM. Placeholders can
/// still be unbound here, so this looks at the text rather than parsing it.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let mut words = upper.split_whitespace();
    if words.next() != Some("SELECT") {
        return vec![];
    }
    let table = words
        .skip_while(|w| *w != "FROM")
        .nth(1)
        .map(|t| t.trim_matches(|c: char| c == '"' || c == ';'));
    match table {
        Some("APPOINTMENTS") => appointment_schema(),
        Some("CONFLICTS") => conflict_schema(),
        Some("SERVICES") => service_schema(),
        Some("RATINGS") => rating_schema(),
        Some("NOTIFICATIONS") => notification_schema(),
        Some("PAYMENTS") => payment_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SalonHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SalonQueryParser;

#[async_trait]
impl QueryParser for SalonQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SalonHandler {
    type Statement = String;
    type QueryParser = SalonQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SalonFactory {
    handler: Arc<SalonHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SalonAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SalonFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SalonAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SalonHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SalonFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SalonFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error("P0001", e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_follows_from_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM ratings WHERE business_id = $1"), [
            "business_id",
            "average",
            "count"
        ]);
        assert_eq!(names("select * from \"conflicts\" where resource_id = $1")[3], "conflict");
        assert_eq!(names("SELECT * FROM appointments;").len(), 12);
        assert_eq!(names("SELECT * FROM payments WHERE appointment_id = $1")[7], "status");
        assert!(names("INSERT INTO appointments VALUES ($1)").is_empty());
    }

    #[test]
    fn count_params_takes_highest() {
        assert_eq!(count_params("SELECT * FROM services WHERE business_id = $1"), 1);
        assert_eq!(count_params("UPDATE appointments SET start = $2 WHERE id = $10"), 10);
        assert_eq!(count_params("SELECT 'BZ$'"), 0);
    }
}
