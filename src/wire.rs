use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_LISTEN_CHANNELS;
use crate::model::*;
use crate::notify::{self, parse_channel};
use crate::observability::{self, command_label};
use crate::service::{BookingRequest, ReservationService};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Availability is reported for one-hour bookings unless the query says otherwise.
const DEFAULT_AVAILABILITY_HOURS: f64 = 1.0;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Auth ─────────────────────────────────────────────────────────

/// Every user shares the one configured password.
#[derive(Debug)]
pub struct SharedPasswordSource {
    password: String,
}

#[async_trait]
impl AuthSource for SharedPasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<Event>,
}

/// Query handler for one connection. Holds that connection's LISTEN set.
pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotbookQueryParser>,
    subscriptions: dashmap::DashMap<Ulid, Subscription>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotbookQueryParser),
            subscriptions: dashmap::DashMap::new(),
        }
    }

    fn resolve_service<C: ClientInfo>(&self, client: &C) -> PgWireResult<ReservationService> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let engine = self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("tenant error: {e}"))
        })?;
        Ok(ReservationService::new(engine))
    }

    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let service = self.resolve_service(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&service, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.deliver_notifications(client).await?;
        result
    }

    async fn execute_command(&self, service: &ReservationService, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = service.engine();
        match cmd {
            Command::InsertResource { id, name, open, close, step, hourly_rate } => {
                let hours = OperatingHours::new(open, close).map_err(engine_err)?;
                let step = step.map(SlotStep::or_default).unwrap_or_default();
                engine
                    .create_resource(id, name, hours, step, hourly_rate)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, patch } => {
                let current = engine.get_resource_info(id).await.map_err(engine_err)?;
                let hours = OperatingHours::new(
                    patch.open.unwrap_or(current.hours.open),
                    patch.close.unwrap_or(current.hours.close),
                )
                .map_err(engine_err)?;
                let step = patch.step.map(SlotStep::or_default).unwrap_or(current.step);
                engine
                    .update_resource(
                        id,
                        patch.name.unwrap_or(current.name),
                        hours,
                        step,
                        patch.hourly_rate.unwrap_or(current.hourly_rate),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(resource_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&format_clock(r.hours.open))?;
                        encoder.encode_field(&format_clock(r.hours.close))?;
                        encoder.encode_field(&r.step.minutes())?;
                        encoder.encode_field(&r.hourly_rate.map(|v| v as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability { resource_id, date, duration } => {
                let hours = duration.unwrap_or(DEFAULT_AVAILABILITY_HOURS);
                let info = engine.get_resource_info(resource_id).await.map_err(engine_err)?;
                let slots = service
                    .get_availability(resource_id, date, hours)
                    .await
                    .map_err(engine_err)?;
                let step = info.step.minutes();
                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let conflicts: Vec<String> = slot.conflicts.iter().map(Ulid::to_string).collect();
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_clock(slot.start))?;
                        encoder.encode_field(&format_clock(slot.start + step))?;
                        encoder.encode_field(&slot.booked)?;
                        encoder.encode_field(&slot.startable)?;
                        encoder.encode_field(&conflicts.join(","))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectFreeWindows { resource_id, date, min_duration } => {
                let windows = engine
                    .free_windows(resource_id, date, min_duration)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(free_window_schema());
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_clock(w.start))?;
                        encoder.encode_field(&format_clock(w.end))?;
                        encoder.encode_field(&w.duration())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectReservations { resource_id, date } => {
                let reservations = engine.list_active(resource_id, date).await.map_err(engine_err)?;
                let schema = Arc::new(reservation_schema());
                let rows: Vec<PgWireResult<_>> = reservations
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&r.date.to_string())?;
                        encoder.encode_field(&format_clock(r.start))?;
                        encoder.encode_field(&format_clock(r.end()))?;
                        encoder.encode_field(&r.duration)?;
                        encoder.encode_field(&r.status.as_str().to_string())?;
                        encoder.encode_field(&r.customer.name)?;
                        encoder.encode_field(&r.customer.contact_number)?;
                        encoder.encode_field(&r.customer.email)?;
                        encoder.encode_field(&r.customer.notes)?;
                        encoder.encode_field(&r.customer.address)?;
                        encoder.encode_field(&r.quoted_price.map(|v| v as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertReservation { id, resource_id, date, start, duration, customer } => {
                let request = BookingRequest {
                    id,
                    ..BookingRequest::new(resource_id, date, start, duration).with_customer(customer)
                };
                service.create_reservation(request).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateReservation { id, date, start, duration } => {
                let current = engine.get_reservation(id).await.map_err(engine_err)?;
                let hours = duration.unwrap_or(current.duration as f64 / 60.0);
                service
                    .update_reservation(id, date.unwrap_or(current.date), start.unwrap_or(current.start), hours)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                let changed = service.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(usize::from(changed)))])
            }
            Command::Listen { channel } => {
                let resource_id = parse_channel(&channel).ok_or_else(|| {
                    user_error("42602", format!("invalid channel {channel:?}, expected resource_<id>"))
                })?;
                engine.get_resource_info(resource_id).await.map_err(engine_err)?;
                if !self.subscriptions.contains_key(&resource_id) {
                    if self.subscriptions.len() >= MAX_LISTEN_CHANNELS {
                        return Err(engine_err(EngineError::LimitExceeded("too many LISTEN channels")));
                    }
                    let receiver = engine.notify.subscribe(resource_id);
                    self.subscriptions.insert(resource_id, Subscription { channel, receiver });
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(resource_id) = parse_channel(&channel) {
                    self.subscriptions.remove(&resource_id);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.subscriptions.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Flush events queued on this connection's channels as NotificationResponse.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        let mut closed = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            let resource_id = *entry.key();
            let sub = entry.value_mut();
            loop {
                match sub.receiver.try_recv() {
                    Ok(event) => pending.push((sub.channel.clone(), notify::payload(&event))),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!("listener on {} lagged, {skipped} notifications dropped", sub.channel);
                    }
                    Err(TryRecvError::Closed) => {
                        closed.push(resource_id);
                        break;
                    }
                }
            }
        }
        for resource_id in closed {
            self.subscriptions.remove(&resource_id);
        }

        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("open", Type::VARCHAR),
        field("close", Type::VARCHAR),
        field("step", Type::INT4),
        field("hourly_rate", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("booked", Type::BOOL),
        field("startable", Type::BOOL),
        field("conflicts", Type::VARCHAR),
    ]
}

fn free_window_schema() -> Vec<FieldInfo> {
    vec![
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("minutes", Type::INT4),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("duration", Type::INT4),
        field("status", Type::VARCHAR),
        field("customer_name", Type::VARCHAR),
        field("contact_number", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("address", Type::VARCHAR),
        field("quoted_price", Type::INT8),
    ]
}

/// Row shape of a statement, judged from the table it selects from.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    if !normalized.starts_with("select") {
        return vec![];
    }
    if normalized.contains("from free_windows") {
        free_window_schema()
    } else if normalized.contains("from availability") {
        availability_schema()
    } else if normalized.contains("from reservations") {
        reservation_schema()
    } else if normalized.contains("from resources") {
        resource_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
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

/// Inline bound text parameters as quoted literals. Higher numbers go first
/// so `$1` never clobbers the prefix of `$10`.
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

/// Built per connection so LISTEN state is never shared between clients.
pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordSource { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// Engine errors keep their SQLSTATE; conflicts also ship as JSON detail.
fn engine_err(e: EngineError) -> PgWireError {
    let mut info = ErrorInfo::new("ERROR".into(), e.sqlstate().into(), e.to_string());
    if !e.conflicts().is_empty() {
        let conflicts: Vec<_> = e
            .conflicts()
            .iter()
            .map(|c| {
                json!({
                    "reservation_id": c.reservation_id.to_string(),
                    "date": c.date.to_string(),
                    "start": format_clock(c.start),
                    "end": format_clock(c.end),
                })
            })
            .collect();
        info.detail = Some(json!({ "conflicts": conflicts }).to_string());
    }
    PgWireError::UserError(Box::new(info))
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
