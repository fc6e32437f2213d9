use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomdesk_query_duration_seconds";

/// Counter: submissions and approvals refused because of an overlapping booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roomdesk_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomdesk_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "roomdesk_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomdesk_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::UpdateFacility { .. } => "update_facility",
        Command::DeleteFacility { .. } => "delete_facility",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertResource { .. } => "insert_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::LinkResource { .. } => "link_resource",
        Command::UnlinkResource { .. } => "unlink_resource",
        Command::SetAvailability { .. } => "set_availability",
        Command::InsertBooking { .. } => "insert_booking",
        Command::BatchInsertBookings { .. } => "batch_insert_bookings",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::RecordPayment { .. } => "record_payment",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectFacilities { .. } => "select_facilities",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectResources => "select_resources",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectRoomAvailability { .. } => "select_room_availability",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailableRooms { .. } => "select_available_rooms",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectEndTimes { .. } => "select_end_times",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
