use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::SharedPasswordAuth;
use crate::calendar;
use crate::engine::{Engine, EngineError, SlotState};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Query handler for one client connection. Holds that connection's LISTEN
/// subscriptions.
pub struct DeskHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<DeskQueryParser>,
    listeners: Mutex<HashMap<String, broadcast::Receiver<Event>>>,
}

impl DeskHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(DeskQueryParser),
            listeners: Mutex::new(HashMap::new()),
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

    /// Parse, execute and time one statement, then deliver pending notifications.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.flush_notifications(client).await?;
        result
    }

    /// Send every event queued on this connection's channels as NotificationResponse.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listeners = self.listeners.lock().await;
            let mut closed = Vec::new();
            for (channel, rx) in listeners.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => match serde_json::to_string(&event) {
                            Ok(payload) => pending.push((channel.clone(), payload)),
                            Err(e) => warn!("notification on {channel} not encodable: {e}"),
                        },
                        Err(broadcast::error::TryRecvError::Empty) => break,
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            warn!("listener on {channel} lagged, {n} notifications dropped");
                        }
                        Err(broadcast::error::TryRecvError::Closed) => {
                            closed.push(channel.clone());
                            break;
                        }
                    }
                }
            }
            for channel in closed {
                listeners.remove(&channel);
            }
        }

        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            // ── Catalog writes ───────────────────────────────
            Command::InsertFacility {
                id,
                name,
                manager_id,
            } => {
                engine
                    .create_facility(id, name, manager_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::UpdateFacility {
                id,
                name,
                manager_id,
            } => {
                engine
                    .update_facility(id, name, manager_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![updated()])
            }
            Command::DeleteFacility { id } => {
                engine.delete_facility(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertUser {
                id,
                name,
                email,
                role,
            } => {
                engine
                    .create_user(id, name, email, role)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::UpdateUser { id, role } => {
                engine.update_user_role(id, role).await.map_err(engine_err)?;
                Ok(vec![updated()])
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertResource { id, name } => {
                engine.create_resource(id, name).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertRoom { room } => {
                engine.create_room(room).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::UpdateRoom { id, changes } => {
                engine.update_room(id, changes).await.map_err(engine_err)?;
                Ok(vec![updated()])
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::LinkResource {
                room_id,
                resource_id,
            } => {
                engine
                    .link_resource(room_id, resource_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::UnlinkResource {
                room_id,
                resource_id,
            } => {
                engine
                    .unlink_resource(room_id, resource_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::SetAvailability {
                room_id,
                availability,
            } => {
                engine
                    .set_availability(room_id, availability)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }

            // ── Bookings ─────────────────────────────────────
            Command::InsertBooking { request } => {
                engine
                    .reserve_if_available(request)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::BatchInsertBookings { requests } => {
                let created = engine.reserve_batch(requests).await.map_err(engine_err)?;
                Ok(vec![inserted(created.len())])
            }
            Command::SetBookingStatus {
                id,
                status,
                actor_id,
                reason,
            } => {
                match (status, reason) {
                    (BookingStatus::Confirmed, _) => engine.approve_booking(id, actor_id).await,
                    (BookingStatus::Cancelled, Some(reason)) => {
                        engine.reject_booking(id, actor_id, Some(reason)).await
                    }
                    (BookingStatus::Cancelled, None) => engine.cancel_booking(id, actor_id).await,
                    (BookingStatus::Pending, _) => engine.resubmit_booking(id, actor_id).await,
                }
                .map_err(engine_err)?;
                Ok(vec![updated()])
            }
            Command::RecordPayment {
                id,
                actor_id,
                reference,
            } => {
                engine
                    .record_payment(id, actor_id, reference)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![updated()])
            }
            Command::DeleteBooking { id, actor_id } => {
                engine.delete_booking(id, actor_id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }

            // ── Reads ────────────────────────────────────────
            Command::SelectFacilities { id } => {
                let facilities = match id {
                    Some(id) => engine.get_facility(&id).into_iter().collect(),
                    None => engine.list_facilities(),
                };
                let rows = facilities.iter().map(facility_row).collect();
                Ok(vec![query_response(facility_schema(), rows)?])
            }
            Command::SelectUsers { id } => {
                let users = match id {
                    Some(id) => engine.get_user(&id).into_iter().collect(),
                    None => engine.list_users(),
                };
                let rows = users.iter().map(user_row).collect();
                Ok(vec![query_response(user_schema(), rows)?])
            }
            Command::SelectResources => {
                let rows = engine.list_resources().iter().map(resource_row).collect();
                Ok(vec![query_response(resource_schema(), rows)?])
            }
            Command::SelectRooms { id, facility_id } => {
                let rooms = match id {
                    Some(id) => engine
                        .get_room(&id)
                        .await
                        .into_iter()
                        .filter(|r| facility_id.is_none_or(|f| r.facility_id == f))
                        .collect(),
                    None => engine.list_rooms(facility_id).await,
                };
                let rows = rooms.iter().map(room_row).collect();
                Ok(vec![query_response(room_schema(), rows)?])
            }
            Command::SelectRoomAvailability { room_id } => {
                let availability = engine
                    .get_availability(&room_id)
                    .await
                    .map_err(engine_err)?;
                let rows = availability
                    .iter()
                    .map(|a| availability_config_row(room_id, a))
                    .collect();
                Ok(vec![query_response(availability_config_schema(), rows)?])
            }
            Command::SelectBookings { query } => {
                let bookings = engine.get_bookings(&query).await.map_err(engine_err)?;
                let rows = bookings.iter().map(booking_row).collect();
                Ok(vec![query_response(booking_schema(), rows)?])
            }
            Command::SelectAvailableRooms { span, filter } => {
                let rooms = engine
                    .available_rooms(&span, &filter)
                    .await
                    .map_err(engine_err)?;
                let rows = rooms.iter().map(room_row).collect();
                Ok(vec![query_response(room_schema(), rows)?])
            }
            Command::SelectAvailability {
                room_id,
                start,
                end,
                min_duration,
            } => {
                let windows = engine
                    .free_windows(&room_id, &Span { start, end }, min_duration)
                    .await
                    .map_err(engine_err)?;
                let rid = room_id.to_string();
                let rows = windows
                    .iter()
                    .map(|w| {
                        vec![
                            Cell::text(&rid),
                            Cell::Int(Some(w.start)),
                            Cell::Int(Some(w.end)),
                        ]
                    })
                    .collect();
                Ok(vec![query_response(free_window_schema(), rows)?])
            }
            Command::SelectSlots {
                room_id,
                day,
                granularity,
            } => {
                let grid = engine
                    .slot_grid(&room_id, day, granularity)
                    .await
                    .map_err(engine_err)?;
                let midnight = calendar::day_start(day);
                let rid = room_id.to_string();
                let rows = grid
                    .iter()
                    .map(|slot| {
                        vec![
                            Cell::text(&rid),
                            Cell::Int(Some(slot.span.start)),
                            Cell::Int(Some(slot.span.end)),
                            Cell::Text(Some(calendar::clock_label(midnight, slot.span.start))),
                            Cell::text(slot.state.as_str()),
                            Cell::Bool(slot.state == SlotState::Open),
                        ]
                    })
                    .collect();
                Ok(vec![query_response(slot_schema(), rows)?])
            }
            Command::SelectEndTimes {
                room_id,
                day,
                start,
                granularity,
            } => {
                let ends = engine
                    .end_options(&room_id, day, start, granularity)
                    .await
                    .map_err(engine_err)?;
                let midnight = calendar::day_start(day);
                let rid = room_id.to_string();
                let rows = ends
                    .iter()
                    .map(|end| {
                        vec![
                            Cell::text(&rid),
                            Cell::Int(Some(start)),
                            Cell::Int(Some(*end)),
                            Cell::Text(Some(calendar::clock_label(midnight, *end))),
                        ]
                    })
                    .collect();
                Ok(vec![query_response(end_time_schema(), rows)?])
            }

            // ── Notifications ────────────────────────────────
            Command::Listen { channel } => {
                check_channel(&channel)?;
                let mut listeners = self.listeners.lock().await;
                if !listeners.contains_key(&channel) {
                    let rx = engine.notify.subscribe(&channel);
                    listeners.insert(channel.clone(), rx);
                    debug!("LISTEN {channel}");
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.listeners.lock().await.remove(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.listeners.lock().await.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// Channels are `room_<ulid>` or `facility_<ulid>`.
fn check_channel(channel: &str) -> PgWireResult<()> {
    let id = channel
        .strip_prefix("room_")
        .or_else(|| channel.strip_prefix("facility_"))
        .ok_or_else(|| {
            user_error(
                "42000",
                format!("invalid channel: {channel} (expected room_{{id}} or facility_{{id}})"),
            )
        })?;
    Ulid::from_string(id)
        .map(|_| ())
        .map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(rows))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

// ── Result sets ──────────────────────────────────────────────────

enum Cell {
    Text(Option<String>),
    Int(Option<i64>),
    Bool(bool),
}

impl Cell {
    fn text(s: &str) -> Self {
        Cell::Text(Some(s.to_string()))
    }

    fn id(id: Ulid) -> Self {
        Cell::Text(Some(id.to_string()))
    }

    fn opt_id(id: Option<Ulid>) -> Self {
        Cell::Text(id.map(|i| i.to_string()))
    }

    fn minutes(m: Option<u32>) -> Self {
        Cell::Int(m.map(i64::from))
    }
}

fn query_response(schema: Vec<FieldInfo>, rows: Vec<Vec<Cell>>) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let mut encoded = Vec::with_capacity(rows.len());
    for row in rows {
        let mut encoder = DataRowEncoder::new(schema.clone());
        for cell in row {
            match cell {
                Cell::Text(v) => encoder.encode_field(&v)?,
                Cell::Int(v) => encoder.encode_field(&v)?,
                Cell::Bool(v) => encoder.encode_field(&v)?,
            }
        }
        encoded.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(encoded),
    )))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn facility_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("manager_id", Type::VARCHAR),
    ]
}

fn facility_row(f: &Facility) -> Vec<Cell> {
    vec![Cell::id(f.id), Cell::text(&f.name), Cell::opt_id(f.manager_id)]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("role", Type::VARCHAR),
    ]
}

fn user_row(u: &User) -> Vec<Cell> {
    vec![
        Cell::id(u.id),
        Cell::text(&u.name),
        Cell::text(&u.email),
        Cell::text(u.role.as_str()),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR), field("name", Type::VARCHAR)]
}

fn resource_row(r: &Resource) -> Vec<Cell> {
    vec![Cell::id(r.id), Cell::text(&r.name)]
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("facility_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("status", Type::VARCHAR),
        field("hourly_rate", Type::INT8),
        field("currency", Type::VARCHAR),
        field("resources", Type::VARCHAR),
    ]
}

fn room_row(r: &Room) -> Vec<Cell> {
    let resources: Vec<String> = r.resources.iter().map(Ulid::to_string).collect();
    vec![
        Cell::id(r.id),
        Cell::id(r.facility_id),
        Cell::text(&r.name),
        Cell::Int(Some(i64::from(r.capacity))),
        Cell::text(r.status.as_str()),
        Cell::Int(r.hourly_rate),
        Cell::Text(r.currency.clone()),
        Cell::Text(Some(resources.join(","))),
    ]
}

fn availability_config_schema() -> Vec<FieldInfo> {
    let mut schema = vec![field("room_id", Type::VARCHAR)];
    for day in [
        "monday",
        "tuesday",
        "wednesday",
        "thursday",
        "friday",
        "saturday",
        "sunday",
    ] {
        schema.push(field(day, Type::VARCHAR));
    }
    for col in [
        "buffer_minutes",
        "min_duration",
        "max_duration",
        "advance_days",
        "max_per_day",
        "max_per_week",
    ] {
        schema.push(field(col, Type::INT8));
    }
    schema
}

fn availability_config_row(room_id: Ulid, a: &RoomAvailability) -> Vec<Cell> {
    let mut row = vec![Cell::id(room_id)];
    row.extend(
        a.weekly
            .iter()
            .map(|hours| Cell::Text(calendar::format_day_hours(hours))),
    );
    row.extend([
        Cell::minutes(a.buffer_minutes),
        Cell::minutes(a.min_duration_minutes),
        Cell::minutes(a.max_duration_minutes),
        Cell::minutes(a.advance_days),
        Cell::minutes(a.max_per_day),
        Cell::minutes(a.max_per_week),
    ]);
    row
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("requester_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("rejection_reason", Type::VARCHAR),
        field("amount", Type::INT8),
        field("currency", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("payment_reference", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn booking_row(b: &Booking) -> Vec<Cell> {
    let payment = b.payment.as_ref();
    vec![
        Cell::id(b.id),
        Cell::id(b.room_id),
        Cell::id(b.requester_id),
        Cell::text(&b.title),
        Cell::Text(b.description.clone()),
        Cell::Int(Some(b.span.start)),
        Cell::Int(Some(b.span.end)),
        Cell::text(b.status.as_str()),
        Cell::Text(b.rejection_reason.clone()),
        Cell::Int(payment.map(|p| p.amount)),
        Cell::Text(payment.map(|p| p.currency.clone())),
        Cell::Text(payment.map(|p| p.status.as_str().to_string())),
        Cell::Text(payment.and_then(|p| p.reference.clone())),
        Cell::Int(Some(b.created_at)),
        Cell::Int(Some(b.updated_at)),
    ]
}

fn free_window_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("label", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("selectable", Type::BOOL),
    ]
}

fn end_time_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("label", Type::VARCHAR),
    ]
}

/// Table a SELECT reads from, for Describe before any parameter is bound.
fn select_table(sql: &str) -> Option<String> {
    let lower = sql.trim_start().to_ascii_lowercase();
    if !lower.starts_with("select") {
        return None;
    }
    let after = &lower[lower.find(" from ")? + 6..];
    let table = after
        .split(|c: char| c.is_whitespace() || c == ';')
        .find(|t| !t.is_empty())?;
    Some(table.trim_matches('"').to_string())
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("facilities") => facility_schema(),
        Some("users") => user_schema(),
        Some("resources") => resource_schema(),
        Some("rooms") | Some("available_rooms") => room_schema(),
        Some("room_availability") => availability_config_schema(),
        Some("bookings") => booking_schema(),
        Some("availability") => free_window_schema(),
        Some("slots") => slot_schema(),
        Some("end_times") => end_time_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for DeskHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
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
pub struct DeskQueryParser;

#[async_trait]
impl QueryParser for DeskQueryParser {
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
impl ExtendedQueryHandler for DeskHandler {
    type Statement = String;
    type QueryParser = DeskQueryParser;

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

/// `$N` placeholders outside quoted literals and identifiers, as
/// `(byte range, N)` in order of appearance.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start
                    && let Ok(n) = sql[start..end].parse::<usize>()
                {
                    found.push((i..end, n));
                }
                i = end.max(i + 1);
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each placeholder with its bound value (text format) in one pass.
/// Bound values are quoted literals and are never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct DeskFactory {
    handler: Arc<DeskHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPasswordAuth, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl DeskFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SharedPasswordAuth::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(DeskHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for DeskFactory {
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

/// Serve one client until it disconnects. Each connection gets its own
/// handler, and with it its own LISTEN set.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = DeskFactory::new(tenant_manager, password);
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

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict { .. } => "23P01",
        EngineError::Forbidden(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Validation(_)
        | EngineError::InvalidSpan { .. }
        | EngineError::RoomNotBookable(..)
        | EngineError::QuotaExceeded(_) => "22023",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let conflict = EngineError::Conflict {
            booking_id: Ulid::new(),
            window: Span::new(0, HOUR_MS),
        };
        assert_eq!(sqlstate(&conflict), "23P01");
        assert_eq!(sqlstate(&EngineError::Forbidden("no")), "42501");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "P0002");
        assert_eq!(sqlstate(&EngineError::Validation("bad".into())), "22023");
        assert_eq!(sqlstate(&EngineError::InvalidSpan { start: 2, end: 1 }), "22023");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "P0001");
    }

    #[test]
    fn channels_must_name_a_room_or_facility() {
        let id = Ulid::new().to_string().to_ascii_lowercase();
        assert!(check_channel(&format!("room_{id}")).is_ok());
        assert!(check_channel(&format!("facility_{id}")).is_ok());
        assert!(check_channel(&format!("desk_{id}")).is_err());
        assert!(check_channel("room_nope").is_err());
    }

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(count_params("SELECT * FROM rooms WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO resources (id, name) VALUES ($2, $10)"),
            10
        );
    }

    #[test]
    fn placeholders_inside_literals_are_not_parameters() {
        assert_eq!(count_params("SELECT '$3' FROM rooms WHERE id = $1"), 1);
        assert_eq!(count_params(r#"SELECT "$2" FROM rooms"#), 0);
    }

    #[test]
    fn bind_params_matches_whole_placeholder_numbers() {
        let params: Vec<Option<Vec<u8>>> =
            (1..=10).map(|i| Some(format!("v{i}").into_bytes())).collect();
        assert_eq!(
            bind_params("VALUES ($1, $10, $2)", &params),
            "VALUES ('v1', 'v10', 'v2')"
        );
    }

    #[test]
    fn bind_params_leaves_quoted_text_and_bound_values_alone() {
        let params = [Some(&b"it's $2"[..]), None];
        assert_eq!(
            bind_params("UPDATE bookings SET title = $1, reason = 'costs $1k', note = $2", &params),
            "UPDATE bookings SET title = 'it''s $2', reason = 'costs $1k', note = NULL"
        );
        assert_eq!(bind_params("SELECT $3", &params), "SELECT $3");
    }

    #[test]
    fn describe_uses_the_selected_table() {
        assert_eq!(select_table("select * from slots where day = $1").as_deref(), Some("slots"));
        assert_eq!(
            select_table(r#"SELECT * FROM "bookings";"#).as_deref(),
            Some("bookings")
        );
        assert_eq!(select_table("INSERT INTO rooms VALUES (1)"), None);
        assert_eq!(result_schema("SELECT * FROM end_times").len(), 4);
        assert!(result_schema("DELETE FROM rooms WHERE id = $1").is_empty());
    }
}
