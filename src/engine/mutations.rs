use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, find_conflict, now_ms, validate_span};
use super::{Engine, EngineError, WalCommand};

/// Cancellation reason recorded by the reaper.
pub const EXPIRED_REASON: &str = "request expired before approval";

/// A requester's ask for one room and one time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
}

/// Partial room update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomChanges {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub status: Option<RoomStatus>,
    pub hourly_rate: Option<Option<i64>>,
    pub currency: Option<Option<String>>,
}

fn check_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{what} must not be empty")));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_room(room: &Room) -> Result<(), EngineError> {
    check_text(&room.name, MAX_NAME_LEN, "room name")?;
    if room.capacity == 0 {
        return Err(EngineError::Validation("room capacity must be at least 1".into()));
    }
    if let Some(rate) = room.hourly_rate {
        if rate < 0 {
            return Err(EngineError::Validation("hourly rate must not be negative".into()));
        }
        match &room.currency {
            Some(c) if c.len() == 3 && c.chars().all(|ch| ch.is_ascii_uppercase()) => {}
            Some(c) => {
                return Err(EngineError::Validation(format!(
                    "currency must be a three-letter code, got '{c}'"
                )));
            }
            None => {
                return Err(EngineError::Validation(
                    "a paid room needs a currency".into(),
                ));
            }
        }
    }
    if room.resources.len() > MAX_RESOURCES_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many resources on room"));
    }
    Ok(())
}

fn check_availability(a: &RoomAvailability) -> Result<(), EngineError> {
    for hours in &a.weekly {
        if let DayHours::Open { open, close } = *hours
            && (open >= close || close > 24 * 60)
        {
            return Err(EngineError::Validation(
                "opening time must be before closing time".into(),
            ));
        }
    }
    if a.buffer_minutes.is_some_and(|b| b > 24 * 60) {
        return Err(EngineError::Validation("buffer cannot exceed one day".into()));
    }
    if a.min_duration_minutes == Some(0) || a.max_duration_minutes == Some(0) {
        return Err(EngineError::Validation("durations must be positive".into()));
    }
    if let (Some(min), Some(max)) = (a.min_duration_minutes, a.max_duration_minutes)
        && min > max
    {
        return Err(EngineError::Validation(
            "minimum duration exceeds maximum duration".into(),
        ));
    }
    Ok(())
}

/// Amount for `span` at `rate` per hour, rounded up to the next minor unit.
pub(super) fn price(rate: i64, span: &Span) -> i64 {
    let cost = rate as i128 * span.duration_ms() as i128;
    let hour = HOUR_MS as i128;
    ((cost + hour - 1) / hour) as i64
}

fn new_booking(room: &Room, req: BookingRequest, now: Ms) -> Booking {
    let payment = match (room.hourly_rate, &room.currency) {
        (Some(rate), Some(currency)) => Some(Payment {
            amount: price(rate, &req.span),
            currency: currency.clone(),
            status: PaymentStatus::Unpaid,
            reference: None,
            paid_at: None,
        }),
        _ => None,
    };
    Booking {
        id: req.id,
        room_id: req.room_id,
        requester_id: req.requester_id,
        title: req.title,
        description: req.description,
        span: req.span,
        status: BookingStatus::Pending,
        rejection_reason: None,
        payment,
        created_at: now,
        updated_at: now,
    }
}

impl Engine {
    // ── Helpers ──────────────────────────────────────────────

    fn lookup_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Admins manage everything; a facility manager manages the facility naming them.
    fn can_manage(&self, actor: &User, facility_id: Ulid) -> bool {
        match actor.role {
            Role::Admin => true,
            Role::FacilityManager => self
                .facilities
                .get(&facility_id)
                .is_some_and(|f| f.manager_id == Some(actor.id)),
            Role::User => false,
        }
    }

    fn check_manager(&self, manager_id: Option<Ulid>) -> Result<(), EngineError> {
        let Some(id) = manager_id else {
            return Ok(());
        };
        let user = self.lookup_user(id)?;
        match user.role {
            Role::FacilityManager | Role::Admin => Ok(()),
            Role::User => Err(EngineError::Validation(format!(
                "user {id} cannot manage a facility without the facility_manager role"
            ))),
        }
    }

    /// Checks that need no room lock.
    fn check_request_shape(&self, req: &BookingRequest) -> Result<(), EngineError> {
        check_text(&req.title, MAX_TITLE_LEN, "booking title")?;
        if let Some(d) = &req.description
            && d.len() > MAX_DESCRIPTION_LEN
        {
            return Err(EngineError::LimitExceeded("booking description"));
        }
        validate_span(&req.span)?;
        if !self.users.contains_key(&req.requester_id) {
            return Err(EngineError::NotFound(req.requester_id));
        }
        if self.booking_to_room.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        Ok(())
    }

    /// Every rule a new or resubmitted request must satisfy against the room's
    /// current state. `batch` holds requests accepted earlier in the same batch;
    /// `exclude` skips the booking being resubmitted.
    fn validate_request(
        &self,
        rs: &RoomState,
        req: &BookingRequest,
        now: Ms,
        exclude: Option<Ulid>,
        batch: &[Booking],
    ) -> Result<(), EngineError> {
        if rs.room.status != RoomStatus::Available {
            return Err(EngineError::RoomNotBookable(rs.room.id, rs.room.status));
        }
        let span = req.span;
        if span.start < now {
            return Err(EngineError::Validation("cannot book a time in the past".into()));
        }
        let date = calendar::date_of(span.start).ok_or(EngineError::InvalidSpan {
            start: span.start,
            end: span.end,
        })?;

        if let Some(rules) = &rs.availability {
            let minutes = span.duration_ms() / MINUTE_MS;
            if let Some(min) = rules.min_duration_minutes
                && span.duration_ms() < min as Ms * MINUTE_MS
            {
                return Err(EngineError::Validation(format!(
                    "bookings must last at least {min} minutes (requested {minutes})"
                )));
            }
            if let Some(max) = rules.max_duration_minutes
                && span.duration_ms() > max as Ms * MINUTE_MS
            {
                return Err(EngineError::Validation(format!(
                    "bookings may last at most {max} minutes (requested {minutes})"
                )));
            }
            if let Some(days) = rules.advance_days
                && span.start > now + days as Ms * DAY_MS
            {
                return Err(EngineError::Validation(format!(
                    "bookings open at most {days} days in advance"
                )));
            }
        }

        match rs.hours_for(calendar::weekday_index(date)) {
            DayHours::Unset => {}
            DayHours::Closed => {
                return Err(EngineError::Validation(format!(
                    "{} is closed on {}",
                    rs.room.name,
                    date.format("%A")
                )));
            }
            DayHours::Open { open, close } => {
                let midnight = calendar::day_start(date);
                let window = Span::new(
                    midnight + open as Ms * MINUTE_MS,
                    midnight + close as Ms * MINUTE_MS,
                );
                if !window.contains_span(&span) {
                    return Err(EngineError::Validation(format!(
                        "outside operating hours ({}-{})",
                        calendar::format_clock(open),
                        calendar::format_clock(close)
                    )));
                }
            }
        }

        if let Some(rules) = &rs.availability
            && (rules.max_per_day.is_some() || rules.max_per_week.is_some())
        {
            let week = calendar::week_start(date);
            let mut same_day = 0u32;
            let mut same_week = 0u32;
            for b in rs.bookings.iter().chain(batch) {
                if b.requester_id != req.requester_id
                    || b.status == BookingStatus::Cancelled
                    || Some(b.id) == exclude
                {
                    continue;
                }
                let Some(d) = calendar::date_of(b.span.start) else {
                    continue;
                };
                if d == date {
                    same_day += 1;
                }
                if calendar::week_start(d) == week {
                    same_week += 1;
                }
            }
            if rules.max_per_day.is_some_and(|cap| same_day >= cap) {
                return Err(EngineError::QuotaExceeded("daily bookings for this room"));
            }
            if rules.max_per_week.is_some_and(|cap| same_week >= cap) {
                return Err(EngineError::QuotaExceeded("weekly bookings for this room"));
            }
        }

        let buffer = rs.buffer_ms(self.settings.default_buffer);
        check_no_conflict(rs, &span, buffer, self.settings.policy, exclude)?;
        if let Some(existing) = find_conflict(batch, &span, buffer, self.settings.policy, exclude) {
            return Err(EngineError::Conflict {
                booking_id: existing.id,
                window: existing.span,
            });
        }
        Ok(())
    }

    // ── Facilities ───────────────────────────────────────────

    pub async fn create_facility(
        &self,
        id: Ulid,
        name: String,
        manager_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if self.facilities.len() >= MAX_FACILITIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        check_text(&name, MAX_NAME_LEN, "facility name")?;
        if self.facilities.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.check_manager(manager_id)?;

        let facility = Facility { id, name, manager_id };
        self.persist_catalog(Some(id), &Event::FacilityCreated { facility })
            .await
    }

    /// `manager_id: Some(None)` unassigns the manager.
    pub async fn update_facility(
        &self,
        id: Ulid,
        name: Option<String>,
        manager_id: Option<Option<Ulid>>,
    ) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        let mut facility = self
            .facilities
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if let Some(name) = name {
            check_text(&name, MAX_NAME_LEN, "facility name")?;
            facility.name = name;
        }
        if let Some(manager_id) = manager_id {
            self.check_manager(manager_id)?;
            facility.manager_id = manager_id;
        }
        self.persist_catalog(Some(id), &Event::FacilityUpdated { facility })
            .await
    }

    pub async fn delete_facility(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if !self.facilities.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(rooms) = self.facility_rooms.get(&id)
            && !rooms.is_empty()
        {
            return Err(EngineError::HasRooms(id));
        }
        self.persist_catalog(Some(id), &Event::FacilityDeleted { id })
            .await
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    ) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        check_text(&name, MAX_NAME_LEN, "user name")?;
        check_text(&email, MAX_NAME_LEN, "email")?;
        if !email.contains('@') {
            return Err(EngineError::Validation(format!("invalid email address '{email}'")));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self
            .users
            .iter()
            .any(|u| u.email.eq_ignore_ascii_case(&email))
        {
            return Err(EngineError::Validation(format!(
                "email '{email}' is already registered"
            )));
        }
        let user = User {
            id,
            name,
            email,
            role,
        };
        self.persist_catalog(None, &Event::UserCreated { user }).await
    }

    pub async fn update_user_role(&self, id: Ulid, role: Role) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(None, &Event::UserRoleChanged { id, role })
            .await
    }

    /// Fails while the user manages a facility or is the requester of any
    /// booking, cancelled ones included.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(facility) = self.facilities.iter().find(|f| f.manager_id == Some(id)) {
            return Err(EngineError::Validation(format!(
                "user {id} still manages facility {}",
                facility.id
            )));
        }
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            if guard.bookings.iter().any(|b| b.requester_id == id) {
                return Err(EngineError::Validation(format!(
                    "user {id} still has bookings in room {}",
                    guard.room.id
                )));
            }
        }
        self.persist_catalog(None, &Event::UserDeleted { id }).await
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        check_text(&name, MAX_NAME_LEN, "resource name")?;
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let resource = Resource { id, name };
        self.persist_catalog(None, &Event::ResourceCreated { resource })
            .await
    }

    /// Fails while any room still lists the resource.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if !self.resources.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            if guard.room.resources.contains(&id) {
                return Err(EngineError::Validation(format!(
                    "resource {id} is still linked to room {}",
                    guard.room.id
                )));
            }
        }
        self.persist_catalog(None, &Event::ResourceDeleted { id })
            .await
    }

    pub async fn link_resource(&self, room_id: Ulid, resource_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if !self.resources.contains_key(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }
        let mut guard = self.lock_room(&room_id).await?;
        if guard.room.resources.contains(&resource_id) {
            return Err(EngineError::AlreadyExists(resource_id));
        }
        if guard.room.resources.len() >= MAX_RESOURCES_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many resources on room"));
        }
        let mut room = guard.room.clone();
        room.resources.push(resource_id);
        self.persist_and_apply(&mut guard, &Event::RoomUpdated { room })
            .await
    }

    pub async fn unlink_resource(
        &self,
        room_id: Ulid,
        resource_id: Ulid,
    ) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        let mut guard = self.lock_room(&room_id).await?;
        if !guard.room.resources.contains(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }
        let mut room = guard.room.clone();
        room.resources.retain(|r| *r != resource_id);
        self.persist_and_apply(&mut guard, &Event::RoomUpdated { room })
            .await
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, mut room: Room) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        if self.rooms.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        check_room(&room)?;
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }
        if !self.facilities.contains_key(&room.facility_id) {
            return Err(EngineError::NotFound(room.facility_id));
        }
        let mut seen = HashSet::new();
        room.resources.retain(|r| seen.insert(*r));
        if let Some(missing) = room
            .resources
            .iter()
            .find(|r| !self.resources.contains_key(r))
        {
            return Err(EngineError::NotFound(*missing));
        }

        let facility_id = room.facility_id;
        self.persist_catalog(Some(facility_id), &Event::RoomCreated { room })
            .await
    }

    pub async fn update_room(&self, id: Ulid, changes: RoomChanges) -> Result<Room, EngineError> {
        let _gate = self.room_writes().await;
        let mut guard = self.lock_room(&id).await?;

        let mut room = guard.room.clone();
        if let Some(name) = changes.name {
            room.name = name;
        }
        if let Some(capacity) = changes.capacity {
            room.capacity = capacity;
        }
        if let Some(status) = changes.status {
            room.status = status;
        }
        if let Some(rate) = changes.hourly_rate {
            room.hourly_rate = rate;
        }
        if let Some(currency) = changes.currency {
            room.currency = currency;
        }
        check_room(&room)?;

        self.persist_and_apply(&mut guard, &Event::RoomUpdated { room: room.clone() })
            .await?;
        Ok(room)
    }

    /// Fails while the room has pending or confirmed bookings that have not ended.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        let guard = self.lock_room(&id).await?;
        let now = now_ms();
        if guard
            .bookings
            .iter()
            .any(|b| b.status != BookingStatus::Cancelled && b.span.end > now)
        {
            return Err(EngineError::Validation(format!(
                "room {id} still has active bookings"
            )));
        }
        let facility_id = guard.room.facility_id;
        let event = Event::RoomDeleted { id, facility_id };
        self.persist_catalog(Some(facility_id), &event).await?;
        self.notify.remove(&crate::notify::room_channel(id));
        Ok(())
    }

    pub async fn set_availability(
        &self,
        room_id: Ulid,
        availability: RoomAvailability,
    ) -> Result<(), EngineError> {
        let _gate = self.room_writes().await;
        check_availability(&availability)?;
        let mut guard = self.lock_room(&room_id).await?;
        let event = Event::AvailabilitySet {
            room_id,
            availability,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Validate, conflict-check and record a pending booking while holding the
    /// room's write lock, so two racing requests cannot both succeed.
    pub async fn reserve_if_available(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let _gate = self.room_writes().await;
        self.check_request_shape(&req)?;
        let mut guard = self.lock_room(&req.room_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        if self.booking_to_room.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let now = now_ms();
        self.validate_request(&guard, &req, now, None, &[])?;

        let booking = new_booking(&guard.room, req, now);
        let event = Event::BookingRequested {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(booking = %booking.id, room = %booking.room_id, "booking requested");
        Ok(booking)
    }

    /// Submit several requests at once. All-or-nothing: if any request fails
    /// validation or conflicts (with the room or with an earlier request in the
    /// batch), none are recorded. Requests may target different rooms.
    pub async fn reserve_batch(
        &self,
        requests: Vec<BookingRequest>,
    ) -> Result<Vec<Booking>, EngineError> {
        let _gate = self.room_writes().await;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut ids = HashSet::new();
        for req in &requests {
            self.check_request_shape(req)?;
            if !ids.insert(req.id) {
                return Err(EngineError::AlreadyExists(req.id));
            }
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut room_ids: Vec<Ulid> = requests.iter().map(|r| r.room_id).collect();
        room_ids.sort();
        room_ids.dedup();

        let mut guards = HashMap::with_capacity(room_ids.len());
        for rid in &room_ids {
            let guard = self.lock_room(rid).await?;
            if guard.bookings.len() + requests.len() > MAX_BOOKINGS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many bookings on room"));
            }
            guards.insert(*rid, guard);
        }

        // Phase 1: validate everything against current state and the batch so far.
        let now = now_ms();
        let mut accepted: HashMap<Ulid, Vec<Booking>> = HashMap::new();
        let mut created = Vec::with_capacity(requests.len());
        for req in requests {
            let guard = &guards[&req.room_id];
            let earlier = accepted.get(&req.room_id).map(Vec::as_slice).unwrap_or(&[]);
            self.validate_request(guard, &req, now, None, earlier)?;
            let booking = new_booking(&guard.room, req, now);
            accepted
                .entry(booking.room_id)
                .or_default()
                .push(booking.clone());
            created.push(booking);
        }

        // Phase 2: one WAL write for the whole batch, then apply.
        let events: Vec<Event> = created
            .iter()
            .map(|booking| Event::BookingRequested {
                booking: booking.clone(),
            })
            .collect();
        self.wal_append_all(events.clone()).await?;
        for event in &events {
            if let Some(rid) = event.room_id()
                && let Some(guard) = guards.get_mut(&rid)
            {
                self.apply_and_publish(guard, event);
            }
        }
        info!("batch of {} bookings requested", created.len());
        Ok(created)
    }

    async fn set_status(
        &self,
        rs: &mut RoomState,
        id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let event = Event::BookingStatusChanged {
            id,
            room_id: rs.room.id,
            status,
            reason,
            at: now_ms(),
        };
        self.persist_and_apply(rs, &event).await?;
        rs.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Pending → confirmed. Re-checks conflicts under the room lock.
    pub async fn approve_booking(&self, id: Ulid, actor_id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.room_writes().await;
        let actor = self.lookup_user(actor_id)?;
        let mut guard = self.resolve_booking_write(&id).await?;
        if !self.can_manage(&actor, guard.room.facility_id) {
            return Err(EngineError::Forbidden(
                "only the facility manager or an admin can approve bookings",
            ));
        }
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Confirmed,
            });
        }
        let buffer = guard.buffer_ms(self.settings.default_buffer);
        check_no_conflict(&guard, &booking.span, buffer, self.settings.policy, Some(id))?;
        self.set_status(&mut guard, id, BookingStatus::Confirmed, None)
            .await
    }

    /// Pending → cancelled with an optional reason shown to the requester.
    pub async fn reject_booking(
        &self,
        id: Ulid,
        actor_id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let _gate = self.room_writes().await;
        if let Some(r) = &reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("rejection reason"));
        }
        let actor = self.lookup_user(actor_id)?;
        let mut guard = self.resolve_booking_write(&id).await?;
        if !self.can_manage(&actor, guard.room.facility_id) {
            return Err(EngineError::Forbidden(
                "only the facility manager or an admin can reject bookings",
            ));
        }
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Cancelled,
            });
        }
        self.set_status(&mut guard, id, BookingStatus::Cancelled, reason)
            .await
    }

    /// Withdraw a pending or confirmed booking.
    pub async fn cancel_booking(&self, id: Ulid, actor_id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.room_writes().await;
        let actor = self.lookup_user(actor_id)?;
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.requester_id != actor.id && !self.can_manage(&actor, guard.room.facility_id) {
            return Err(EngineError::Forbidden(
                "only the requester, the facility manager or an admin can cancel a booking",
            ));
        }
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Cancelled,
            });
        }
        self.set_status(&mut guard, id, BookingStatus::Cancelled, None)
            .await
    }

    /// Cancelled → pending, by the requester, while the start is still ahead.
    pub async fn resubmit_booking(&self, id: Ulid, actor_id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.room_writes().await;
        let actor = self.lookup_user(actor_id)?;
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.requester_id != actor.id {
            return Err(EngineError::Forbidden("only the requester can resubmit a booking"));
        }
        if booking.status != BookingStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Pending,
            });
        }
        let now = now_ms();
        if booking.span.start <= now {
            return Err(EngineError::Validation(
                "the booking has already started and can no longer be resubmitted".into(),
            ));
        }
        let req = BookingRequest {
            id,
            room_id: booking.room_id,
            requester_id: booking.requester_id,
            title: booking.title.clone(),
            description: booking.description.clone(),
            span: booking.span,
        };
        self.validate_request(&guard, &req, now, Some(id), &[])?;
        self.set_status(&mut guard, id, BookingStatus::Pending, None)
            .await
    }

    /// Physically remove a booking. Admins only.
    pub async fn delete_booking(&self, id: Ulid, actor_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.room_writes().await;
        let actor = self.lookup_user(actor_id)?;
        if actor.role != Role::Admin {
            return Err(EngineError::Forbidden("only an admin can delete bookings"));
        }
        let mut guard = self.resolve_booking_write(&id).await?;
        let event = Event::BookingDeleted {
            id,
            room_id: guard.room.id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Mark the booking's payment as settled by the gateway.
    pub async fn record_payment(
        &self,
        id: Ulid,
        actor_id: Ulid,
        reference: Option<String>,
    ) -> Result<Booking, EngineError> {
        let _gate = self.room_writes().await;
        if let Some(r) = &reference
            && r.len() > MAX_REFERENCE_LEN
        {
            return Err(EngineError::LimitExceeded("payment reference"));
        }
        let actor = self.lookup_user(actor_id)?;
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.requester_id != actor.id && actor.role != Role::Admin {
            return Err(EngineError::Forbidden(
                "only the requester or an admin can record a payment",
            ));
        }
        match &booking.payment {
            None => {
                return Err(EngineError::Validation(format!(
                    "booking {id} is free of charge"
                )));
            }
            Some(p) if p.status == PaymentStatus::Paid => {
                return Err(EngineError::Validation(format!(
                    "booking {id} is already paid"
                )));
            }
            Some(_) => {}
        }
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::Validation(
                "cannot pay for a cancelled booking".into(),
            ));
        }
        let event = Event::PaymentRecorded {
            id,
            room_id: guard.room.id,
            reference,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Pending requests whose start has passed: `(booking_id, room_id)`.
    pub fn collect_stale_requests(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut stale = Vec::new();
        for entry in self.rooms.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for b in &guard.bookings {
                    if b.status == BookingStatus::Pending && b.span.start <= now {
                        stale.push((b.id, guard.room.id));
                    }
                }
            }
        }
        stale
    }

    /// Cancel a stale pending request. Returns false if it was decided meanwhile.
    pub async fn expire_request(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.room_writes().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let still_stale = guard
            .booking(id)
            .is_some_and(|b| b.status == BookingStatus::Pending && b.span.start <= now);
        if !still_stale {
            return Ok(false);
        }
        self.set_status(
            &mut guard,
            id,
            BookingStatus::Cancelled,
            Some(EXPIRED_REASON.to_string()),
        )
        .await?;
        Ok(true)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// All writes wait until the snapshot has replaced the log.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.catalog_writes().await;
        let mut events = Vec::new();

        for user in self.users.iter() {
            events.push(Event::UserCreated {
                user: user.value().clone(),
            });
        }
        for resource in self.resources.iter() {
            events.push(Event::ResourceCreated {
                resource: resource.value().clone(),
            });
        }
        for facility in self.facilities.iter() {
            events.push(Event::FacilityCreated {
                facility: facility.value().clone(),
            });
        }

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            if let Some(availability) = &guard.availability {
                events.push(Event::AvailabilitySet {
                    room_id: guard.room.id,
                    availability: availability.clone(),
                });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingRequested {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
