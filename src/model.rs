use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, read as naive local wall-clock time.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The span with `by` added to its end (the buffered footprint of a booking).
    pub fn extend_end(&self, by: Ms) -> Span {
        Span {
            start: self.start,
            end: self.end + by,
        }
    }
}

// ── Enumerations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Available,
    Maintenance,
    Reserved,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Available => "available",
            RoomStatus::Maintenance => "maintenance",
            RoomStatus::Reserved => "reserved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Some(RoomStatus::Available),
            "maintenance" => Some(RoomStatus::Maintenance),
            "reserved" => Some(RoomStatus::Reserved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    FacilityManager,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::FacilityManager => "facility_manager",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "facility_manager" => Some(Role::FacilityManager),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Ulid,
    pub name: String,
    pub manager_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// Equipment a room can offer (projector, whiteboard, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub name: String,
    /// Head count.
    pub capacity: u32,
    pub status: RoomStatus,
    /// Minor currency units per hour. `None` means the room is free of charge.
    pub hourly_rate: Option<i64>,
    pub currency: Option<String>,
    pub resources: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    pub paid_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub status: BookingStatus,
    pub rejection_reason: Option<String>,
    pub payment: Option<Payment>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Operating hours of one weekday, in minutes from midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayHours {
    /// Not configured: the default window applies.
    Unset,
    Closed,
    Open { open: u32, close: u32 },
}

/// Default operating window when a weekday is unset: 08:00–18:00.
pub const DEFAULT_OPEN_MINUTE: u32 = 8 * 60;
pub const DEFAULT_CLOSE_MINUTE: u32 = 18 * 60;

impl DayHours {
    /// Resolve to a concrete `(open, close)` window, or `None` when closed.
    pub fn window(&self) -> Option<(u32, u32)> {
        match *self {
            DayHours::Unset => Some((DEFAULT_OPEN_MINUTE, DEFAULT_CLOSE_MINUTE)),
            DayHours::Closed => None,
            DayHours::Open { open, close } => Some((open, close)),
        }
    }
}

/// Per-room booking rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAvailability {
    /// Indexed Monday = 0 .. Sunday = 6.
    pub weekly: [DayHours; 7],
    /// `None` falls back to the tenant default buffer.
    pub buffer_minutes: Option<u32>,
    pub min_duration_minutes: Option<u32>,
    pub max_duration_minutes: Option<u32>,
    /// How many days ahead a booking may start.
    pub advance_days: Option<u32>,
    pub max_per_day: Option<u32>,
    pub max_per_week: Option<u32>,
}

impl Default for RoomAvailability {
    fn default() -> Self {
        Self {
            weekly: [DayHours::Unset; 7],
            buffer_minutes: None,
            min_duration_minutes: None,
            max_duration_minutes: None,
            advance_days: None,
            max_per_day: None,
            max_per_week: None,
        }
    }
}

// ── Per-room state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub availability: Option<RoomAvailability>,
    /// All bookings of any status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            availability: None,
            bookings: Vec::new(),
        }
    }

    /// Buffer after each booking, from the room's configuration or `default_ms`.
    pub fn buffer_ms(&self, default_ms: Ms) -> Ms {
        self.availability
            .as_ref()
            .and_then(|a| a.buffer_minutes)
            .map_or(default_ms, |m| m as Ms * MINUTE_MS)
    }

    /// Weekday hours (Monday = 0). Unset when the room has no configuration.
    pub fn hours_for(&self, weekday: usize) -> DayHours {
        self.availability
            .as_ref()
            .map_or(DayHours::Unset, |a| a.weekly[weekday % 7])
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The event types. This is the WAL record format and the notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated { facility: Facility },
    FacilityUpdated { facility: Facility },
    FacilityDeleted { id: Ulid },
    UserCreated { user: User },
    UserRoleChanged { id: Ulid, role: Role },
    UserDeleted { id: Ulid },
    ResourceCreated { resource: Resource },
    ResourceDeleted { id: Ulid },
    RoomCreated { room: Room },
    RoomUpdated { room: Room },
    RoomDeleted { id: Ulid, facility_id: Ulid },
    AvailabilitySet {
        room_id: Ulid,
        availability: RoomAvailability,
    },
    BookingRequested { booking: Booking },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
        at: Ms,
    },
    PaymentRecorded {
        id: Ulid,
        room_id: Ulid,
        reference: Option<String>,
        at: Ms,
    },
    BookingDeleted { id: Ulid, room_id: Ulid },
}

impl Event {
    /// The room a booking-level event applies to.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => Some(room.id),
            Event::RoomDeleted { id, .. } => Some(*id),
            Event::AvailabilitySet { room_id, .. }
            | Event::BookingStatusChanged { room_id, .. }
            | Event::PaymentRecorded { room_id, .. }
            | Event::BookingDeleted { room_id, .. } => Some(*room_id),
            Event::BookingRequested { booking } => Some(booking.room_id),
            _ => None,
        }
    }
}
