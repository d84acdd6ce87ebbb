use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{NotifyHub, UserEvent};
use crate::observability;
use crate::sql::{self, Command, SqlError};

/// Single shared password for every user name.
#[derive(Debug)]
pub struct BaykeeperAuthSource {
    password: String,
}

impl BaykeeperAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for BaykeeperAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct BaykeeperHandler {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    query_parser: Arc<BaykeeperQueryParser>,
}

impl BaykeeperHandler {
    pub fn new(engine: Arc<Engine>, hub: Arc<NotifyHub>) -> Self {
        Self {
            engine,
            hub,
            query_parser: Arc::new(BaykeeperQueryParser),
        }
    }

    async fn run(&self, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertGarage { id, name, bays, open_time, close_time } => {
                engine
                    .create_garage(id, name, bays, open_time, close_time)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateGarage { id, bays, open_time, close_time } => {
                engine
                    .resize(id, bays, open_time, close_time)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteGarage { id } => {
                engine.delete_garage(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectGarages { id } => {
                let garages = match id {
                    Some(id) => vec![engine.garage_info(id).await.map_err(engine_err)?],
                    None => engine.list_garages().await,
                };
                garage_rows(&garages)
            }
            Command::ToggleBay { id } => {
                engine.toggle_active(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBayRange { garage_id, min, max } => {
                let removed = engine
                    .delete_range(garage_id, min, max)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(removed.deleted_bays.len()),
                ))
            }
            Command::SelectBays { garage_id } => {
                let bays = engine.list_bays(garage_id).await.map_err(engine_err)?;
                bay_rows(&bays)
            }
            Command::SelectAvailableBays { garage_id, date, window } => {
                let bays = engine
                    .find_available(garage_id, date, window)
                    .await
                    .map_err(engine_err)?;
                bay_rows(&bays)
            }
            Command::InsertReservation(req) => {
                engine.create_reservation(req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateReservationStatus { id, status, comment } => {
                if comment.is_some() && status != ReservationStatus::Cancelled {
                    return Err(user_error(
                        "0A000",
                        "comment can only be set when cancelling".into(),
                    ));
                }
                let result = match status {
                    ReservationStatus::Confirmed => engine.confirm_reservation(id).await.map(|_| ()),
                    ReservationStatus::Cancelled => {
                        engine.cancel_reservation(id, comment).await.map(|_| ())
                    }
                    ReservationStatus::InProgress => engine.start_service(id).await.map(|_| ()),
                    ReservationStatus::Completed => engine.complete_service(id).await.map(|_| ()),
                    ReservationStatus::Pending => Err(EngineError::Validation(
                        "a reservation cannot be returned to pending".into(),
                    )),
                };
                result.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectReservation { id } => {
                let r = engine.get_reservation(id).await.map_err(engine_err)?;
                reservation_rows(std::slice::from_ref(&r))
            }
            Command::SelectReservations { garage_id, date } => {
                let rs = engine
                    .list_reservations(garage_id, date)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(&rs)
            }
            Command::SelectNotifications { user_id } => notification_rows(&self.hub.inbox(&user_id)),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn garage_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("open_time"),
        text_field("close_time"),
        typed_field("bay_count", Type::INT4),
        typed_field("active_bays", Type::INT4),
    ]
}

fn bay_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("garage_id"),
        typed_field("bay_number", Type::INT4),
        text_field("name"),
        text_field("open_time"),
        text_field("close_time"),
        typed_field("active", Type::BOOL),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("garage_id"),
        text_field("car_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("services"),
        text_field("comment"),
        text_field("status"),
        typed_field("paid", Type::BOOL),
        typed_field("total_amount", Type::INT8),
        text_field("repair_bay_id"),
    ]
}

fn notification_schema() -> Vec<FieldInfo> {
    vec![
        text_field("user_id"),
        text_field("reservation_id"),
        text_field("kind"),
        text_field("message"),
    ]
}

/// Result columns for a statement, judged by the table it selects from.
fn result_schema(sql_text: &str) -> Vec<FieldInfo> {
    let lower = sql_text.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c: char| c == ';' || c == '"'));
    match table {
        Some("garages") => garage_schema(),
        Some("repair_bays") | Some("available_bays") => bay_schema(),
        Some("reservations") => reservation_schema(),
        Some("notifications") => notification_schema(),
        _ => vec![],
    }
}

fn garage_rows(garages: &[GarageInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(garage_schema());
    let rows: Vec<PgWireResult<_>> = garages
        .iter()
        .map(|g| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&g.id.to_string())?;
            encoder.encode_field(&g.name)?;
            encoder.encode_field(&g.open_time.to_string())?;
            encoder.encode_field(&g.close_time.to_string())?;
            encoder.encode_field(&(g.bay_count as i32))?;
            encoder.encode_field(&(g.active_bays as i32))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn bay_rows(bays: &[RepairBay]) -> PgWireResult<Response> {
    let schema = Arc::new(bay_schema());
    let rows: Vec<PgWireResult<_>> = bays
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.garage_id.to_string())?;
            encoder.encode_field(&(b.bay_number as i32))?;
            encoder.encode_field(&b.name)?;
            encoder.encode_field(&b.open_time.to_string())?;
            encoder.encode_field(&b.close_time.to_string())?;
            encoder.encode_field(&b.active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservation_rows(reservations: &[Reservation]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let services: Vec<&str> = r.services.iter().map(|s| s.as_str()).collect();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.user_id.to_string())?;
            encoder.encode_field(&r.garage_id.to_string())?;
            encoder.encode_field(&r.car_id.to_string())?;
            encoder.encode_field(&r.date.to_string())?;
            encoder.encode_field(&r.window.start.to_string())?;
            encoder.encode_field(&r.window.end.to_string())?;
            encoder.encode_field(&services.join(","))?;
            encoder.encode_field(&r.comment)?;
            encoder.encode_field(&r.status.to_string())?;
            encoder.encode_field(&r.paid)?;
            encoder.encode_field(&(r.total_amount as i64))?;
            encoder.encode_field(&r.repair_bay_id.map(|id| id.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn notification_rows(events: &[UserEvent]) -> PgWireResult<Response> {
    let schema = Arc::new(notification_schema());
    let rows: Vec<PgWireResult<_>> = events
        .iter()
        .map(|e| {
            let notice = e.notice();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&notice.user_id.to_string())?;
            encoder.encode_field(&notice.reservation_id.to_string())?;
            encoder.encode_field(&e.kind().to_string())?;
            encoder.encode_field(&e.message())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for BaykeeperHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BaykeeperQueryParser;

#[async_trait]
impl QueryParser for BaykeeperQueryParser {
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
impl ExtendedQueryHandler for BaykeeperHandler {
    type Statement = String;
    type QueryParser = BaykeeperQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(&substitute_params(portal)).await
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

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BaykeeperFactory {
    handler: Arc<BaykeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<BaykeeperAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl BaykeeperFactory {
    pub fn new(engine: Arc<Engine>, hub: Arc<NotifyHub>, password: String) -> Self {
        Self {
            handler: Arc::new(BaykeeperHandler::new(engine, hub)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                BaykeeperAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BaykeeperFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    password: String,
) -> std::io::Result<()> {
    let factory = BaykeeperFactory::new(engine, hub, password);
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_client_error() {
        tracing::error!("engine failure: {e}");
    }
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}
