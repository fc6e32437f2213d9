use ulid::Ulid;

use crate::calendar;
use crate::model::*;

use super::conflict::{BlockingPolicy, room_conflict};

// ── Available-room filter ─────────────────────────────────────────

/// Extra room attributes a search may require.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
    pub facility_id: Option<Ulid>,
    pub min_capacity: Option<u32>,
    /// Every listed resource must be linked to the room.
    pub resources: Vec<Ulid>,
}

impl RoomFilter {
    pub fn matches(&self, room: &Room) -> bool {
        if room.status != RoomStatus::Available {
            return false;
        }
        if let Some(fid) = self.facility_id
            && room.facility_id != fid
        {
            return false;
        }
        if let Some(min) = self.min_capacity
            && room.capacity < min
        {
            return false;
        }
        self.resources.iter().all(|r| room.resources.contains(r))
    }
}

/// Ids of the rooms in `pool` with no blocking booking conflicting with
/// `candidate`, each room judged with its own buffer.
pub fn available_rooms<'a>(
    pool: impl IntoIterator<Item = &'a RoomState>,
    candidate: &Span,
    default_buffer: Ms,
    policy: BlockingPolicy,
) -> Vec<Ulid> {
    pool.into_iter()
        .filter(|rs| {
            let buffer = rs.buffer_ms(default_buffer);
            room_conflict(rs, candidate, buffer, policy, None).is_none()
        })
        .map(|rs| rs.room.id)
        .collect()
}

// ── Free windows ──────────────────────────────────────────────────

/// Operating-hour windows of each day touched by `query`, clamped to it.
pub fn operating_windows(rs: &RoomState, query: &Span) -> Vec<Span> {
    let (Some(first), Some(last)) = (
        calendar::date_of(query.start),
        calendar::date_of(query.end - 1),
    ) else {
        return Vec::new();
    };

    let mut windows = Vec::new();
    let mut date = first;
    while date <= last {
        let midnight = calendar::day_start(date);
        let hours = rs.hours_for(calendar::weekday_index(date));
        if let Some((open, close)) = hours.window() {
            let start = (midnight + open as Ms * MINUTE_MS).max(query.start);
            let end = (midnight + close as Ms * MINUTE_MS).min(query.end);
            if let Some(span) = Span::checked(start, end) {
                windows.push(span);
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    merge_overlapping(&windows)
}

/// Bookable stretches of a room within `query`: operating hours minus every
/// blocking booking extended by the room's buffer. Windows shorter than
/// `min_duration` are dropped.
pub fn free_windows(
    rs: &RoomState,
    query: &Span,
    default_buffer: Ms,
    policy: BlockingPolicy,
    min_duration: Ms,
) -> Vec<Span> {
    let buffer = rs.buffer_ms(default_buffer);
    let base = operating_windows(rs, query);
    if base.is_empty() {
        return base;
    }

    let reach = Span {
        start: query.start - buffer,
        end: query.end,
    };
    let mut blocked: Vec<Span> = rs
        .overlapping(&reach)
        .filter(|b| policy.blocks(b.status))
        .map(|b| b.span.extend_end(buffer))
        .collect();
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);

    subtract_intervals(&base, &blocked)
        .into_iter()
        .filter(|s| s.duration_ms() >= min_duration)
        .collect()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
