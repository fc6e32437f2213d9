//! Per-day slot grid for one room.
//!
//! The grid is recomputed on every request and never stored.

use chrono::NaiveDate;

use crate::calendar;
use crate::model::*;

use super::conflict::{BlockingPolicy, find_conflict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Open,
    /// Slot start falls inside a blocking booking.
    Booked,
    /// Slot start falls inside the buffer after a blocking booking.
    Buffer,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Open => "open",
            SlotState::Booked => "booked",
            SlotState::Buffer => "buffer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub span: Span,
    pub state: SlotState,
}

/// Inputs shared by the grid and the end-time selector.
#[derive(Debug, Clone, Copy)]
pub struct GridRules {
    pub granularity: Ms,
    pub buffer: Ms,
    pub policy: BlockingPolicy,
    pub min_duration: Option<Ms>,
    pub max_duration: Option<Ms>,
}

/// Build the slots of `date` from open to close. A trailing slot that would
/// run past closing time is dropped; a closed day has no slots.
pub fn build_slot_grid<'a>(
    date: NaiveDate,
    hours: DayHours,
    bookings: impl IntoIterator<Item = &'a Booking>,
    rules: &GridRules,
) -> Vec<Slot> {
    let Some((open, close)) = hours.window() else {
        return Vec::new();
    };
    if rules.granularity <= 0 {
        return Vec::new();
    }

    let midnight = calendar::day_start(date);
    let open_at = midnight + open as Ms * MINUTE_MS;
    let close_at = midnight + close as Ms * MINUTE_MS;
    let total = (close_at - open_at) / rules.granularity;

    let blocking: Vec<Span> = bookings
        .into_iter()
        .filter(|b| rules.policy.blocks(b.status))
        .map(|b| b.span)
        .collect();

    (0..total)
        .map(|i| {
            let start = open_at + i * rules.granularity;
            let span = Span::new(start, start + rules.granularity);
            let state = if blocking.iter().any(|s| s.contains_instant(start)) {
                SlotState::Booked
            } else if blocking
                .iter()
                .any(|s| start >= s.end && start < s.end + rules.buffer)
            {
                SlotState::Buffer
            } else {
                SlotState::Open
            };
            Slot { span, state }
        })
        .collect()
}

/// Selectable start times: slots that are neither booked nor in a buffer.
pub fn start_options(grid: &[Slot]) -> Vec<Ms> {
    grid.iter()
        .filter(|s| s.state == SlotState::Open)
        .map(|s| s.span.start)
        .collect()
}

/// Selectable end times for a booking beginning at `start`.
///
/// Ends are slot boundaries after `start` up to closing time. An end is
/// excluded when `[start, end)` would span a booked slot or be rejected by
/// the overlap checker, or when the duration falls outside the room's limits.
/// `start` must itself be a start option, otherwise nothing is selectable.
pub fn end_options<'a>(
    grid: &[Slot],
    start: Ms,
    bookings: impl IntoIterator<Item = &'a Booking> + Clone,
    rules: &GridRules,
) -> Vec<Ms> {
    let Some(first) = grid
        .iter()
        .position(|s| s.span.start == start && s.state == SlotState::Open)
    else {
        return Vec::new();
    };

    let mut ends = Vec::new();
    for (i, slot) in grid[first..].iter().enumerate() {
        // Past the first slot, reaching a booked slot means spanning over it.
        if i > 0 && slot.state == SlotState::Booked {
            break;
        }
        let end = slot.span.end;
        let duration = end - start;
        if let Some(max) = rules.max_duration
            && duration > max
        {
            break;
        }
        let candidate = Span::new(start, end);
        if find_conflict(bookings.clone(), &candidate, rules.buffer, rules.policy, None).is_some() {
            break;
        }
        if let Some(min) = rules.min_duration
            && duration < min
        {
            continue;
        }
        ends.push(end);
    }
    ends
}
