use crate::model::Ms;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_FACILITIES_PER_TENANT: usize = 1_000;
pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;
pub const MAX_RESOURCES_PER_ROOM: usize = 64;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_REFERENCE_LEN: usize = 256;

/// 1970-01-01T00:00:00
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single booking may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Range queries (bookings, free windows) are capped at one year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_BATCH_SIZE: usize = 500;
pub const MAX_IN_CLAUSE_IDS: usize = 1_000;

pub const MIN_SLOT_GRANULARITY_MINUTES: u32 = 5;
pub const DEFAULT_SLOT_GRANULARITY_MINUTES: u32 = 30;
