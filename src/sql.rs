use chrono::NaiveDate;
use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar;
use crate::engine::{BookingQuery, BookingRequest, RoomChanges, RoomFilter};
use crate::limits::*;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertFacility {
        id: Ulid,
        name: String,
        manager_id: Option<Ulid>,
    },
    UpdateFacility {
        id: Ulid,
        name: Option<String>,
        manager_id: Option<Option<Ulid>>,
    },
    DeleteFacility {
        id: Ulid,
    },
    InsertUser {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    UpdateUser {
        id: Ulid,
        role: Role,
    },
    DeleteUser {
        id: Ulid,
    },
    InsertResource {
        id: Ulid,
        name: String,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertRoom {
        room: Room,
    },
    UpdateRoom {
        id: Ulid,
        changes: RoomChanges,
    },
    DeleteRoom {
        id: Ulid,
    },
    LinkResource {
        room_id: Ulid,
        resource_id: Ulid,
    },
    UnlinkResource {
        room_id: Ulid,
        resource_id: Ulid,
    },
    SetAvailability {
        room_id: Ulid,
        availability: RoomAvailability,
    },
    InsertBooking {
        request: BookingRequest,
    },
    BatchInsertBookings {
        requests: Vec<BookingRequest>,
    },
    /// Approve, reject, cancel or resubmit, depending on the target status.
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
        actor_id: Ulid,
        reason: Option<String>,
    },
    RecordPayment {
        id: Ulid,
        actor_id: Ulid,
        reference: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
        actor_id: Ulid,
    },
    SelectFacilities {
        id: Option<Ulid>,
    },
    SelectUsers {
        id: Option<Ulid>,
    },
    SelectResources,
    SelectRooms {
        id: Option<Ulid>,
        facility_id: Option<Ulid>,
    },
    SelectRoomAvailability {
        room_id: Ulid,
    },
    SelectBookings {
        query: BookingQuery,
    },
    SelectAvailableRooms {
        span: Span,
        filter: RoomFilter,
    },
    SelectAvailability {
        room_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectSlots {
        room_id: Ulid,
        day: NaiveDate,
        granularity: Option<u32>,
    },
    SelectEndTimes {
        room_id: Ulid,
        day: NaiveDate,
        start: Ms,
        granularity: Option<u32>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: channel_name(rest)?,
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        if rest == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: channel_name(rest)?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// `LISTEN foo` → `Some("foo")`. Case-insensitive keyword, whitespace required.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace))
        .then(|| rest.trim())
}

fn channel_name(raw: &str) -> Result<String, SqlError> {
    let name = raw.trim_matches('"');
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SqlError::Parse(format!("invalid channel name: {raw}")));
    }
    Ok(name.to_ascii_lowercase())
}

// ── INSERT ────────────────────────────────────────────────────

const FACILITY_COLUMNS: &[&str] = &["id", "name", "manager_id"];
const USER_COLUMNS: &[&str] = &["id", "name", "email", "role"];
const RESOURCE_COLUMNS: &[&str] = &["id", "name"];
const ROOM_COLUMNS: &[&str] = &[
    "id",
    "facility_id",
    "name",
    "capacity",
    "status",
    "hourly_rate",
    "currency",
];
const ROOM_RESOURCE_COLUMNS: &[&str] = &["room_id", "resource_id"];
const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];
const AVAILABILITY_COLUMNS: &[&str] = &[
    "room_id",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
    "buffer_minutes",
    "min_duration",
    "max_duration",
    "advance_days",
    "max_per_day",
    "max_per_week",
];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "room_id",
    "requester_id",
    "title",
    "description",
    "start",
    "end",
];

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's default column order applies.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        explicit: &[String],
        defaults: &[&str],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if explicit.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            explicit.to_vec()
        };
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self {
            table,
            columns,
            values,
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        let pos = self.columns.iter().position(|c| c == column)?;
        self.values.get(pos)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map_or(Ok(None), parse_ulid_or_null)
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_text_expr(self.required(column)?)
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), parse_text_or_null)
    }

    fn opt_u32(&self, column: &str) -> Result<Option<u32>, SqlError> {
        match self.get(column) {
            None => Ok(None),
            Some(e) if is_null(e) => Ok(None),
            Some(e) => parse_u32(e).map(Some),
        }
    }
}

fn insert_columns(insert: &ast::Insert) -> Vec<String> {
    insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns = insert_columns(insert);
    let rows = extract_all_insert_rows(insert)?;

    if table == "bookings" {
        let mut requests = Vec::with_capacity(rows.len());
        for (i, values) in rows.iter().enumerate() {
            let row = Row::new("bookings", &columns, BOOKING_COLUMNS, values)?;
            let request = booking_request(&row)
                .map_err(|e| if rows.len() > 1 { e.in_row(i) } else { e })?;
            requests.push(request);
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(SqlError::TooMany("rows", MAX_BATCH_SIZE));
        }
        return Ok(match requests.len() {
            1 => Command::InsertBooking {
                request: requests.remove(0),
            },
            _ => Command::BatchInsertBookings { requests },
        });
    }

    if rows.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    let values = &rows[0];

    match table.as_str() {
        "facilities" => {
            let row = Row::new("facilities", &columns, FACILITY_COLUMNS, values)?;
            Ok(Command::InsertFacility {
                id: row.ulid("id")?,
                name: row.text("name")?,
                manager_id: row.opt_ulid("manager_id")?,
            })
        }
        "users" => {
            let row = Row::new("users", &columns, USER_COLUMNS, values)?;
            let role = match row.get("role") {
                None => Role::User,
                Some(e) => parse_role(e)?,
            };
            Ok(Command::InsertUser {
                id: row.ulid("id")?,
                name: row.text("name")?,
                email: row.text("email")?,
                role,
            })
        }
        "resources" => {
            let row = Row::new("resources", &columns, RESOURCE_COLUMNS, values)?;
            Ok(Command::InsertResource {
                id: row.ulid("id")?,
                name: row.text("name")?,
            })
        }
        "rooms" => {
            let row = Row::new("rooms", &columns, ROOM_COLUMNS, values)?;
            let status = match row.get("status") {
                None => RoomStatus::Available,
                Some(e) => parse_room_status(e)?,
            };
            let hourly_rate = match row.get("hourly_rate") {
                None => None,
                Some(e) if is_null(e) => None,
                Some(e) => Some(parse_i64_expr(e)?),
            };
            Ok(Command::InsertRoom {
                room: Room {
                    id: row.ulid("id")?,
                    facility_id: row.ulid("facility_id")?,
                    name: row.text("name")?,
                    capacity: parse_u32(row.required("capacity")?)?,
                    status,
                    hourly_rate,
                    currency: row.opt_text("currency")?,
                    resources: Vec::new(),
                },
            })
        }
        "room_resources" => {
            let row = Row::new("room_resources", &columns, ROOM_RESOURCE_COLUMNS, values)?;
            Ok(Command::LinkResource {
                room_id: row.ulid("room_id")?,
                resource_id: row.ulid("resource_id")?,
            })
        }
        "room_availability" => {
            let row = Row::new("room_availability", &columns, AVAILABILITY_COLUMNS, values)?;
            let mut availability = RoomAvailability::default();
            for (i, day) in WEEKDAYS.iter().enumerate() {
                if let Some(cell) = row.opt_text(day)? {
                    availability.weekly[i] = calendar::parse_day_hours(&cell).ok_or_else(|| {
                        SqlError::Parse(format!(
                            "{day}: expected 'closed' or 'HH:MM-HH:MM', got '{cell}'"
                        ))
                    })?;
                }
            }
            availability.buffer_minutes = row.opt_u32("buffer_minutes")?;
            availability.min_duration_minutes = row.opt_u32("min_duration")?;
            availability.max_duration_minutes = row.opt_u32("max_duration")?;
            availability.advance_days = row.opt_u32("advance_days")?;
            availability.max_per_day = row.opt_u32("max_per_day")?;
            availability.max_per_week = row.opt_u32("max_per_week")?;
            Ok(Command::SetAvailability {
                room_id: row.ulid("room_id")?,
                availability,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn booking_request(row: &Row<'_>) -> Result<BookingRequest, SqlError> {
    Ok(BookingRequest {
        id: row.ulid("id")?,
        room_id: row.ulid("room_id")?,
        requester_id: row.ulid("requester_id")?,
        title: row.text("title")?,
        description: row.opt_text("description")?,
        span: Span {
            start: parse_timestamp_expr(row.required("start")?)?,
            end: parse_timestamp_expr(row.required("end")?)?,
        },
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn assignment_map(assignments: &[Assignment]) -> Result<Vec<(String, &Expr)>, SqlError> {
    assignments
        .iter()
        .map(|a| match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .map(|col| (col, &a.value))
                .ok_or_else(|| SqlError::Parse("empty column name".into())),
            AssignmentTarget::Tuple(_) => {
                Err(SqlError::Unsupported("tuple assignment".into()))
            }
        })
        .collect()
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let sets = assignment_map(assignments)?;
    let set = |col: &str| sets.iter().find(|(c, _)| c == col).map(|(_, e)| *e);
    let filters = Filters::from_selection(selection)?;
    let id = filters.required_ulid("id")?;

    let allowed: &[&str] = match table.as_str() {
        "facilities" => &["name", "manager_id"],
        "users" => &["role"],
        "rooms" => &["name", "capacity", "status", "hourly_rate", "currency"],
        "bookings" => &[
            "status",
            "rejection_reason",
            "actor_id",
            "payment_status",
            "payment_reference",
        ],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    if let Some((col, _)) = sets.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn("UPDATE", col.clone()));
    }

    match table.as_str() {
        "facilities" => Ok(Command::UpdateFacility {
            id,
            name: set("name").map(parse_text_expr).transpose()?,
            manager_id: set("manager_id").map(parse_ulid_or_null).transpose()?,
        }),
        "users" => Ok(Command::UpdateUser {
            id,
            role: parse_role(set("role").ok_or(SqlError::MissingColumn("users", "role"))?)?,
        }),
        "rooms" => Ok(Command::UpdateRoom {
            id,
            changes: RoomChanges {
                name: set("name").map(parse_text_expr).transpose()?,
                capacity: set("capacity").map(parse_u32).transpose()?,
                status: set("status").map(parse_room_status).transpose()?,
                hourly_rate: set("hourly_rate")
                    .map(|e| {
                        if is_null(e) {
                            Ok(None)
                        } else {
                            parse_i64_expr(e).map(Some)
                        }
                    })
                    .transpose()?,
                currency: set("currency").map(parse_text_or_null).transpose()?,
            },
        }),
        _ => {
            let actor_id = set("actor_id")
                .map(parse_ulid_expr)
                .transpose()?
                .ok_or(SqlError::MissingColumn("bookings", "actor_id"))?;
            if let Some(payment) = set("payment_status") {
                let status = parse_text_expr(payment)?;
                if !status.eq_ignore_ascii_case(PaymentStatus::Paid.as_str()) {
                    return Err(SqlError::Parse(format!(
                        "payment_status can only be set to 'paid', got '{status}'"
                    )));
                }
                return Ok(Command::RecordPayment {
                    id,
                    actor_id,
                    reference: set("payment_reference")
                        .map(parse_text_or_null)
                        .transpose()?
                        .flatten(),
                });
            }
            let status_expr = set("status").ok_or(SqlError::MissingColumn("bookings", "status"))?;
            let raw = parse_text_expr(status_expr)?;
            let status = BookingStatus::parse(&raw)
                .ok_or_else(|| SqlError::Parse(format!("unknown booking status '{raw}'")))?;
            Ok(Command::SetBookingStatus {
                id,
                status,
                actor_id,
                reason: set("rejection_reason")
                    .map(parse_text_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "facilities" => Ok(Command::DeleteFacility {
            id: filters.required_ulid("id")?,
        }),
        "users" => Ok(Command::DeleteUser {
            id: filters.required_ulid("id")?,
        }),
        "resources" => Ok(Command::DeleteResource {
            id: filters.required_ulid("id")?,
        }),
        "rooms" => Ok(Command::DeleteRoom {
            id: filters.required_ulid("id")?,
        }),
        "room_resources" => Ok(Command::UnlinkResource {
            room_id: filters.required_ulid("room_id")?,
            resource_id: filters.required_ulid("resource_id")?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: filters.required_ulid("id")?,
            actor_id: filters.required_ulid("actor_id")?,
        }),
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
        "facilities" => Ok(Command::SelectFacilities {
            id: filters.opt_ulid("id")?,
        }),
        "users" => Ok(Command::SelectUsers {
            id: filters.opt_ulid("id")?,
        }),
        "resources" => Ok(Command::SelectResources),
        "rooms" => Ok(Command::SelectRooms {
            id: filters.opt_ulid("id")?,
            facility_id: filters.opt_ulid("facility_id")?,
        }),
        "room_availability" => Ok(Command::SelectRoomAvailability {
            room_id: filters.required_ulid("room_id")?,
        }),
        "bookings" => {
            let window = match (filters.ge("start"), filters.le("end")) {
                (Some(s), Some(e)) => Some(Span {
                    start: parse_timestamp_expr(s)?,
                    end: parse_timestamp_expr(e)?,
                }),
                (None, None) => None,
                (Some(_), None) => return Err(SqlError::MissingFilter("end")),
                (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
            };
            let status = match filters.eq("status") {
                None => None,
                Some(e) => {
                    let raw = parse_text_expr(e)?;
                    Some(BookingStatus::parse(&raw).ok_or_else(|| {
                        SqlError::Parse(format!("unknown booking status '{raw}'"))
                    })?)
                }
            };
            Ok(Command::SelectBookings {
                query: BookingQuery {
                    id: filters.opt_ulid("id")?,
                    room_id: filters.opt_ulid("room_id")?,
                    requester_id: filters.opt_ulid("requester_id")?,
                    window,
                    status,
                },
            })
        }
        "available_rooms" => {
            let start = parse_timestamp_expr(
                filters.ge("start").ok_or(SqlError::MissingFilter("start"))?,
            )?;
            let end =
                parse_timestamp_expr(filters.le("end").ok_or(SqlError::MissingFilter("end"))?)?;
            let min_capacity = match filters.eq("min_capacity").or(filters.ge("capacity")) {
                None => None,
                Some(e) => Some(parse_u32(e)?),
            };
            let mut resources = Vec::new();
            for e in filters.eq_any("resource_id") {
                resources.push(parse_ulid_expr(e)?);
            }
            if resources.len() > MAX_IN_CLAUSE_IDS {
                return Err(SqlError::TooMany("resource ids", MAX_IN_CLAUSE_IDS));
            }
            Ok(Command::SelectAvailableRooms {
                span: Span { start, end },
                filter: RoomFilter {
                    facility_id: filters.opt_ulid("facility_id")?,
                    min_capacity,
                    resources,
                },
            })
        }
        "availability" => Ok(Command::SelectAvailability {
            room_id: filters.required_ulid("room_id")?,
            start: parse_timestamp_expr(
                filters.ge("start").ok_or(SqlError::MissingFilter("start"))?,
            )?,
            end: parse_timestamp_expr(filters.le("end").ok_or(SqlError::MissingFilter("end"))?)?,
            min_duration: filters
                .eq("min_duration")
                .map(|e| parse_u32(e).map(|m| m as Ms * MINUTE_MS))
                .transpose()?,
        }),
        "slots" | "end_times" => {
            let room_id = filters.required_ulid("room_id")?;
            let day = parse_date_expr(filters.eq("day").ok_or(SqlError::MissingFilter("day"))?)?;
            let granularity = filters.eq("granularity").map(parse_u32).transpose()?;
            if table == "slots" {
                return Ok(Command::SelectSlots {
                    room_id,
                    day,
                    granularity,
                });
            }
            let start_expr = filters.eq("start").ok_or(SqlError::MissingFilter("start"))?;
            Ok(Command::SelectEndTimes {
                room_id,
                day,
                start: parse_start_on_day(start_expr, day)?,
                granularity,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `'HH:MM'` on `day`, or a full timestamp.
fn parse_start_on_day(expr: &Expr, day: NaiveDate) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && let Some(minutes) = calendar::parse_clock(s)
    {
        return Ok(calendar::day_start(day) + minutes as Ms * MINUTE_MS);
    }
    parse_timestamp_expr(expr)
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunction of simple `column <op> value` predicates.
struct Filters<'a> {
    preds: Vec<(String, Cmp, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut preds = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut preds)?;
        }
        Ok(Self { preds })
    }

    fn find(&self, column: &str, cmp: Cmp) -> Option<&'a Expr> {
        self.preds
            .iter()
            .find(|(c, op, _)| c == column && *op == cmp)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, Cmp::Eq)
    }

    fn ge(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, Cmp::GtEq)
    }

    fn le(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, Cmp::LtEq)
    }

    /// Every value compared for equality with `column`, IN lists included.
    fn eq_any(&self, column: &str) -> Vec<&'a Expr> {
        self.preds
            .iter()
            .filter(|(c, op, _)| c == column && *op == Cmp::Eq)
            .map(|(_, _, e)| *e)
            .collect()
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq(column).map(parse_ulid_expr).transpose()
    }

    fn required_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.eq(column).ok_or(SqlError::MissingFilter(column))?)
    }
}

fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, Cmp, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, cmp, right.as_ref()));
            Ok(())
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let col = expr_column_name(expr)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {expr}")))?;
            if list.len() > MAX_IN_CLAUSE_IDS {
                return Err(SqlError::TooMany("IN values", MAX_IN_CLAUSE_IDS));
            }
            out.extend(list.iter().map(|e| (col.clone(), Cmp::Eq, e)));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text_expr(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|_| SqlError::Parse(format!("expected integer, got '{s}'"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

/// Milliseconds, or a naive local `YYYY-MM-DD[T ]HH:MM[:SS]` string.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && !s.trim().chars().all(|c| c.is_ascii_digit() || c == '-')
    {
        return calendar::parse_timestamp(s)
            .ok_or_else(|| SqlError::Parse(format!("bad timestamp '{s}'")));
    }
    parse_i64_expr(expr)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text_expr(expr)?;
    calendar::parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date '{s}'")))
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_text_expr(expr)?;
    Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown role '{s}'")))
}

fn parse_room_status(expr: &Expr) -> Result<RoomStatus, SqlError> {
    let s = parse_text_expr(expr)?;
    RoomStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown room status '{s}'")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    TooMany(&'static str, usize),
    InRow(usize, Box<SqlError>),
}

impl SqlError {
    fn in_row(self, row: usize) -> Self {
        SqlError::InRow(row, Box::new(self))
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::TooMany(what, max) => write!(f, "too many {what} (max {max})"),
            SqlError::InRow(row, e) => write!(f, "row {row}: {e}"),
        }
    }
}

impl std::error::Error for SqlError {}
