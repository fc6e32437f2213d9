use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::availability::{self, RoomFilter};
use super::conflict::validate_span;
use super::slots::{self, GridRules, Slot};
use super::{Engine, EngineError};

/// Booking search. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingQuery {
    pub id: Option<Ulid>,
    pub room_id: Option<Ulid>,
    pub requester_id: Option<Ulid>,
    /// Bookings overlapping this window.
    pub window: Option<Span>,
    pub status: Option<BookingStatus>,
}

impl BookingQuery {
    fn matches(&self, b: &Booking) -> bool {
        self.id.is_none_or(|id| b.id == id)
            && self.requester_id.is_none_or(|r| b.requester_id == r)
            && self.status.is_none_or(|s| b.status == s)
            && self.window.is_none_or(|w| b.span.overlaps(&w))
    }
}

fn check_window(span: &Span) -> Result<(), EngineError> {
    validate_span(span)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub fn list_facilities(&self) -> Vec<Facility> {
        let mut out: Vec<Facility> = self.facilities.iter().map(|f| f.value().clone()).collect();
        out.sort_by_key(|f| f.id);
        out
    }

    pub fn get_facility(&self, id: &Ulid) -> Option<Facility> {
        self.facilities.get(id).map(|f| f.value().clone())
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut out: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        out.sort_by_key(|u| u.id);
        out
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        let mut out: Vec<Resource> = self.resources.iter().map(|r| r.value().clone()).collect();
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_room(&self, id: &Ulid) -> Option<Room> {
        let rs = self.get_room_state(id)?;
        let guard = rs.read().await;
        Some(guard.room.clone())
    }

    /// All rooms, or those of one facility, ordered by id.
    pub async fn list_rooms(&self, facility_id: Option<Ulid>) -> Vec<Room> {
        let ids: Vec<Ulid> = match facility_id {
            Some(fid) => self
                .facility_rooms
                .get(&fid)
                .map(|ids| ids.clone())
                .unwrap_or_default(),
            None => self.rooms.iter().map(|e| *e.key()).collect(),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(room) = self.get_room(&id).await {
                out.push(room);
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_availability(
        &self,
        room_id: &Ulid,
    ) -> Result<Option<RoomAvailability>, EngineError> {
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::NotFound(*room_id))?;
        let guard = rs.read().await;
        Ok(guard.availability.clone())
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let room_id = self.room_for_booking(id)?;
        let rs = self.get_room_state(&room_id)?;
        let guard = rs.read().await;
        guard.booking(*id).cloned()
    }

    /// Bookings matching `query`, ordered by start time.
    pub async fn get_bookings(&self, query: &BookingQuery) -> Result<Vec<Booking>, EngineError> {
        if let Some(w) = &query.window {
            check_window(w)?;
        }
        let room_ids: Vec<Ulid> = match (query.id, query.room_id) {
            (Some(id), _) => self.room_for_booking(&id).into_iter().collect(),
            (None, Some(rid)) => vec![rid],
            (None, None) => self.rooms.iter().map(|e| *e.key()).collect(),
        };

        let mut out = Vec::new();
        for rid in room_ids {
            if query.room_id.is_some_and(|r| r != rid) {
                continue;
            }
            let Some(rs) = self.get_room_state(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            match &query.window {
                Some(w) => out.extend(guard.overlapping(w).filter(|b| query.matches(b)).cloned()),
                None => out.extend(guard.bookings.iter().filter(|b| query.matches(b)).cloned()),
            }
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    // ── Availability ─────────────────────────────────────────

    /// Bookable rooms with no blocking booking conflicting with `span`.
    pub async fn available_rooms(
        &self,
        span: &Span,
        filter: &RoomFilter,
    ) -> Result<Vec<Room>, EngineError> {
        validate_span(span)?;
        if filter.resources.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many resource IDs"));
        }
        let mut ids: Vec<Ulid> = match filter.facility_id {
            Some(fid) => self
                .facility_rooms
                .get(&fid)
                .map(|ids| ids.clone())
                .unwrap_or_default(),
            None => self.rooms.iter().map(|e| *e.key()).collect(),
        };
        // Read locks are held together: take them in the same order as batch writers.
        ids.sort();

        let mut pool = Vec::with_capacity(ids.len());
        for rs in ids.iter().filter_map(|id| self.get_room_state(id)) {
            let guard = rs.read_owned().await;
            if filter.matches(&guard.room) {
                pool.push(guard);
            }
        }

        let free = availability::available_rooms(
            pool.iter().map(|g| &**g),
            span,
            self.settings.default_buffer,
            self.settings.policy,
        );
        let mut rooms: Vec<Room> = pool
            .iter()
            .filter(|g| free.contains(&g.room.id))
            .map(|g| g.room.clone())
            .collect();
        rooms.sort_by_key(|r| r.id);
        Ok(rooms)
    }

    /// Open stretches of a room within `query`. Without an explicit minimum the
    /// room's minimum booking duration applies.
    pub async fn free_windows(
        &self,
        room_id: &Ulid,
        query: &Span,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        check_window(query)?;
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::NotFound(*room_id))?;
        let guard = rs.read().await;
        let min = min_duration.unwrap_or_else(|| {
            guard
                .availability
                .as_ref()
                .and_then(|a| a.min_duration_minutes)
                .map_or(0, |m| m as Ms * MINUTE_MS)
        });
        Ok(availability::free_windows(
            &guard,
            query,
            self.settings.default_buffer,
            self.settings.policy,
            min,
        ))
    }

    fn grid_rules(&self, rs: &RoomState, granularity: Option<u32>) -> Result<GridRules, EngineError> {
        let minutes = granularity.unwrap_or(DEFAULT_SLOT_GRANULARITY_MINUTES);
        if !(MIN_SLOT_GRANULARITY_MINUTES..=24 * 60).contains(&minutes) {
            return Err(EngineError::Validation(format!(
                "slot granularity must be between {MIN_SLOT_GRANULARITY_MINUTES} and 1440 minutes"
            )));
        }
        let rules = rs.availability.as_ref();
        let to_ms = |m: u32| m as Ms * MINUTE_MS;
        Ok(GridRules {
            granularity: to_ms(minutes),
            buffer: rs.buffer_ms(self.settings.default_buffer),
            policy: self.settings.policy,
            min_duration: rules.and_then(|a| a.min_duration_minutes).map(to_ms),
            max_duration: rules.and_then(|a| a.max_duration_minutes).map(to_ms),
        })
    }

    /// Bookings relevant to `date`, including those whose buffer spills into it.
    fn day_bookings<'a>(rs: &'a RoomState, date: NaiveDate, buffer: Ms) -> Vec<&'a Booking> {
        let midnight = calendar::day_start(date);
        let reach = Span {
            start: midnight - buffer,
            end: midnight + DAY_MS,
        };
        rs.overlapping(&reach).collect()
    }

    pub async fn slot_grid(
        &self,
        room_id: &Ulid,
        date: NaiveDate,
        granularity: Option<u32>,
    ) -> Result<Vec<Slot>, EngineError> {
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::NotFound(*room_id))?;
        let guard = rs.read().await;
        let rules = self.grid_rules(&guard, granularity)?;
        let bookings = Self::day_bookings(&guard, date, rules.buffer);
        let hours = guard.hours_for(calendar::weekday_index(date));
        Ok(slots::build_slot_grid(date, hours, bookings, &rules))
    }

    /// Valid end times for a booking starting at `start` on `date`.
    pub async fn end_options(
        &self,
        room_id: &Ulid,
        date: NaiveDate,
        start: Ms,
        granularity: Option<u32>,
    ) -> Result<Vec<Ms>, EngineError> {
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::NotFound(*room_id))?;
        let guard = rs.read().await;
        let rules = self.grid_rules(&guard, granularity)?;
        let bookings = Self::day_bookings(&guard, date, rules.buffer);
        let hours = guard.hours_for(calendar::weekday_index(date));
        let grid = slots::build_slot_grid(date, hours, bookings.iter().copied(), &rules);
        Ok(slots::end_options(&grid, start, bookings.iter().copied(), &rules))
    }
}
