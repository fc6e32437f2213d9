use ulid::Ulid;

use crate::calendar::describe_window;
use crate::model::{BookingStatus, RoomStatus, Span};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The candidate overlaps (buffer included) an existing blocking booking.
    Conflict { booking_id: Ulid, window: Span },
    InvalidSpan { start: i64, end: i64 },
    Validation(String),
    RoomNotBookable(Ulid, RoomStatus),
    QuotaExceeded(&'static str),
    Forbidden(&'static str),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    HasRooms(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict { window, .. } => write!(
                f,
                "This time slot conflicts with an existing booking ({})",
                describe_window(window)
            ),
            EngineError::InvalidSpan { start, end } => {
                write!(f, "invalid time range: start {start} must be before end {end}")
            }
            EngineError::Validation(msg) => write!(f, "{msg}"),
            EngineError::RoomNotBookable(id, status) => {
                write!(f, "room {id} cannot be booked while {}", status.as_str())
            }
            EngineError::QuotaExceeded(msg) => write!(f, "booking limit reached: {msg}"),
            EngineError::Forbidden(msg) => write!(f, "permission denied: {msg}"),
            EngineError::InvalidTransition { from, to } => write!(
                f,
                "cannot change booking from {} to {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::HasRooms(id) => {
                write!(f, "cannot delete facility {id}: it still has rooms")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
