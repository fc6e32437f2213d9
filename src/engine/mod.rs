mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use availability::{RoomFilter, available_rooms, free_windows, merge_overlapping, subtract_intervals};
pub use conflict::{BlockingPolicy, conflicts, find_conflict, now_ms, room_conflict};
pub use error::EngineError;
pub use mutations::{BookingRequest, EXPIRED_REASON, RoomChanges};
pub use queries::BookingQuery;
pub use slots::{GridRules, Slot, SlotState, build_slot_grid, end_options, start_options};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{
    OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, mpsc, oneshot,
};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{NotifyHub, facility_channel, room_channel};
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Tenant-wide booking rules.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub policy: BlockingPolicy,
    /// Buffer for rooms without their own configuration.
    pub default_buffer: Ms,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: BlockingPolicy::default(),
            default_buffer: 30 * MINUTE_MS,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one call. They become durable together or not at all.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// On failure every sender gets the error and the log is rolled back to the
/// last successful flush.
fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let event_count: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush failed for {event_count} events: {e}");
        if let Err(e) = wal.rollback() {
            warn!("WAL rollback failed: {e}");
        }
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    for (events, _) in batch {
        for event in events {
            wal.append_buffered(event)?;
        }
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// All state of one tenant.
pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    pub facilities: DashMap<Ulid, Facility>,
    pub users: DashMap<Ulid, User>,
    pub resources: DashMap<Ulid, Resource>,
    pub notify: Arc<NotifyHub>,
    pub settings: EngineSettings,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    /// Facility → rooms index.
    pub(super) facility_rooms: DashMap<Ulid, Vec<Ulid>>,
    /// Room-scoped writes hold this shared. Catalog writes and compaction hold
    /// it exclusively, so catalog rules are checked and applied without
    /// interleaving, and a compaction snapshot misses no committed event.
    /// Taken before any room lock.
    pub(super) write_gate: RwLock<()>,
}

/// Apply a room-scoped event. The caller holds the room's write lock.
fn apply_to_room(rs: &mut RoomState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomUpdated { room } => rs.room = room.clone(),
        Event::AvailabilitySet { availability, .. } => {
            rs.availability = Some(availability.clone());
        }
        Event::BookingRequested { booking } => {
            booking_index.insert(booking.id, booking.room_id);
            rs.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged {
            id,
            status,
            reason,
            at,
            ..
        } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = *status;
                b.rejection_reason = match status {
                    BookingStatus::Cancelled => reason.clone(),
                    _ => None,
                };
                b.updated_at = *at;
            }
        }
        Event::PaymentRecorded {
            id, reference, at, ..
        } => {
            if let Some(b) = rs.booking_mut(*id) {
                if let Some(payment) = b.payment.as_mut() {
                    payment.status = PaymentStatus::Paid;
                    payment.reference = reference.clone();
                    payment.paid_at = Some(*at);
                }
                b.updated_at = *at;
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            booking_index.remove(id);
        }
        _ => {}
    }
}

fn is_room_scoped(event: &Event) -> bool {
    matches!(
        event,
        Event::RoomUpdated { .. }
            | Event::AvailabilitySet { .. }
            | Event::BookingRequested { .. }
            | Event::BookingStatusChanged { .. }
            | Event::PaymentRecorded { .. }
            | Event::BookingDeleted { .. }
    )
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            facilities: DashMap::new(),
            users: DashMap::new(),
            resources: DashMap::new(),
            notify,
            settings,
            wal_tx,
            booking_to_room: DashMap::new(),
            facility_rooms: DashMap::new(),
            write_gate: RwLock::new(()),
        };

        // We are the sole owner of every room lock during replay, so try_write
        // never contends. Never block here: this may run inside an async context.
        for event in &events {
            if is_room_scoped(event) {
                let Some(rs) = event.room_id().and_then(|id| engine.get_room_state(&id)) else {
                    continue;
                };
                match rs.try_write() {
                    Ok(mut guard) => apply_to_room(&mut guard, event, &engine.booking_to_room),
                    Err(_) => warn!("replay: room lock contended, event skipped"),
                }
            } else {
                engine.apply_catalog(event);
            }
        }

        Ok(engine)
    }

    /// Apply a tenant-level event (facilities, users, resources, room lifecycle).
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::FacilityCreated { facility } | Event::FacilityUpdated { facility } => {
                self.facilities.insert(facility.id, facility.clone());
            }
            Event::FacilityDeleted { id } => {
                self.facilities.remove(id);
                self.facility_rooms.remove(id);
            }
            Event::UserCreated { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::UserRoleChanged { id, role } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.role = *role;
                }
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
            }
            Event::ResourceCreated { resource } => {
                self.resources.insert(resource.id, resource.clone());
            }
            Event::ResourceDeleted { id } => {
                self.resources.remove(id);
            }
            Event::RoomCreated { room } => {
                self.facility_rooms
                    .entry(room.facility_id)
                    .or_default()
                    .push(room.id);
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
            }
            Event::RoomDeleted { id, facility_id } => {
                self.rooms.remove(id);
                if let Some(mut ids) = self.facility_rooms.get_mut(facility_id) {
                    ids.retain(|r| r != id);
                }
                self.booking_to_room.retain(|_, room_id| room_id != id);
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events that must be durable together.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn room_writes(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().await
    }

    pub(super) async fn catalog_writes(&self) -> RwLockWriteGuard<'_, ()> {
        self.write_gate.write().await
    }

    pub fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// Publish an event on its room channel and on the owning facility's channel.
    pub(super) fn publish(&self, facility_id: Option<Ulid>, event: &Event) {
        if let Some(room_id) = event.room_id() {
            self.notify.send(&room_channel(room_id), event);
        }
        if let Some(fid) = facility_id {
            self.notify.send(&facility_channel(fid), event);
        }
    }

    /// WAL-append + apply + notify for a room-scoped event.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_and_publish(rs, event);
        Ok(())
    }

    /// Apply + notify for a room-scoped event that is already durable.
    pub(super) fn apply_and_publish(&self, rs: &mut RoomState, event: &Event) {
        apply_to_room(rs, event, &self.booking_to_room);
        self.publish(Some(rs.room.facility_id), event);
    }

    /// WAL-append + apply + notify for a tenant-level event.
    pub(super) async fn persist_catalog(
        &self,
        facility_id: Option<Ulid>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        self.publish(facility_id, event);
        Ok(())
    }

    /// Acquire a room's write lock. Fails with `NotFound` if the room was
    /// deleted or replaced while we waited.
    pub(super) async fn lock_room(
        &self,
        room_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::NotFound(*room_id))?;
        let guard = rs.clone().write_owned().await;
        let current = self
            .rooms
            .get(room_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &rs));
        if !current {
            return Err(EngineError::NotFound(*room_id));
        }
        Ok(guard)
    }

    /// Lookup booking → room, get room, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let room_id = self
            .room_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        self.lock_room(&room_id).await
    }
}
