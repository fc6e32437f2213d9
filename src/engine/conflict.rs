use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Which booking statuses occupy a room for conflict purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingPolicy {
    /// Only approved bookings block; pending requests may overlap each other.
    ConfirmedOnly,
    /// Pending requests block as well.
    ConfirmedAndPending,
}

impl Default for BlockingPolicy {
    fn default() -> Self {
        BlockingPolicy::ConfirmedAndPending
    }
}

impl BlockingPolicy {
    pub fn blocks(&self, status: BookingStatus) -> bool {
        match status {
            BookingStatus::Confirmed => true,
            BookingStatus::Pending => *self == BlockingPolicy::ConfirmedAndPending,
            BookingStatus::Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingPolicy::ConfirmedOnly => "confirmed_only",
            BlockingPolicy::ConfirmedAndPending => "confirmed_and_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed_only" => Some(BlockingPolicy::ConfirmedOnly),
            "confirmed_and_pending" => Some(BlockingPolicy::ConfirmedAndPending),
            _ => None,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Does `candidate` collide with `existing` once `buffer` is appended to the
/// existing booking's end?
///
/// Half-open on both sides: ending exactly when `existing` starts is fine, and
/// so is starting exactly at `existing.end + buffer`. The existing booking's
/// buffer never restricts a candidate that ends before it starts. An empty or
/// inverted candidate is reported as a conflict.
pub fn conflicts(candidate: &Span, existing: &Span, buffer: Ms) -> bool {
    if !candidate.is_valid() {
        return true;
    }
    candidate.start < existing.end + buffer && candidate.end > existing.start
}

/// First booking in `bookings` that blocks under `policy` and conflicts with
/// `candidate`. `exclude` skips the booking being re-validated.
pub fn find_conflict<'a>(
    bookings: impl IntoIterator<Item = &'a Booking>,
    candidate: &Span,
    buffer: Ms,
    policy: BlockingPolicy,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    bookings.into_iter().find(|b| {
        Some(b.id) != exclude && policy.blocks(b.status) && conflicts(candidate, &b.span, buffer)
    })
}

/// Conflict check against a room, inspecting only bookings near the candidate.
pub fn room_conflict<'a>(
    rs: &'a RoomState,
    candidate: &Span,
    buffer: Ms,
    policy: BlockingPolicy,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    // Existing bookings whose end + buffer > candidate.start may still collide.
    let search = Span {
        start: candidate.start - buffer,
        end: candidate.end,
    };
    if !search.is_valid() {
        return find_conflict(&rs.bookings, candidate, buffer, policy, exclude);
    }
    find_conflict(rs.overlapping(&search), candidate, buffer, policy, exclude)
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    candidate: &Span,
    buffer: Ms,
    policy: BlockingPolicy,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match room_conflict(rs, candidate, buffer, policy, exclude) {
        Some(existing) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict {
                booking_id: existing.id,
                window: existing.span,
            })
        }
        None => Ok(()),
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if !span.is_valid() {
        return Err(EngineError::InvalidSpan {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;
    const BUFFER: Ms = 30 * M;

    fn at(h: Ms, m: Ms) -> Ms {
        h * H + m * M
    }

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            room_id: Ulid::nil(),
            requester_id: Ulid::nil(),
            title: "Review".into(),
            description: None,
            span: Span::new(start, end),
            status,
            rejection_reason: None,
            payment: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    // ── Scenario: existing 10:00–11:00, buffer 30 min ──────────

    #[test]
    fn candidate_inside_buffer_conflicts() {
        let existing = Span::new(at(10, 0), at(11, 0));
        // 11:00 < 11:30 (buffered end) and 11:30 > 10:00
        assert!(conflicts(&Span::new(at(11, 0), at(11, 30)), &existing, BUFFER));
    }

    #[test]
    fn candidate_at_buffer_boundary_is_free() {
        let existing = Span::new(at(10, 0), at(11, 0));
        assert!(!conflicts(&Span::new(at(11, 30), at(12, 0)), &existing, BUFFER));
    }

    #[test]
    fn candidate_one_ms_before_buffer_boundary_conflicts() {
        let existing = Span::new(at(10, 0), at(11, 0));
        assert!(conflicts(&Span::new(at(11, 30) - 1, at(12, 0)), &existing, BUFFER));
    }

    #[test]
    fn candidate_ending_at_existing_start_is_free() {
        let existing = Span::new(at(10, 0), at(11, 0));
        // 10:00 > 10:00 is false
        assert!(!conflicts(&Span::new(at(9, 0), at(10, 0)), &existing, BUFFER));
    }

    #[test]
    fn candidate_ending_one_ms_into_existing_conflicts() {
        let existing = Span::new(at(10, 0), at(11, 0));
        assert!(conflicts(&Span::new(at(9, 0), at(10, 0) + 1), &existing, BUFFER));
    }

    // ── Properties ─────────────────────────────────────────────

    #[test]
    fn separated_by_buffer_is_free_both_ways() {
        let cases = [
            (Span::new(0, 100), Span::new(130, 200)),
            (Span::new(0, 100), Span::new(500, 600)),
            (Span::new(at(8, 0), at(9, 0)), Span::new(at(9, 30), at(10, 0))),
        ];
        for (a, b) in cases {
            assert!(!conflicts(&a, &b, 30), "{a:?} vs {b:?}");
            assert!(!conflicts(&b, &a, 30), "{b:?} vs {a:?}");
        }
    }

    #[test]
    fn any_raw_overlap_conflicts() {
        let base = Span::new(1000, 2000);
        for (s, e) in [(500, 1001), (1999, 2500), (1200, 1300), (0, 5000), (1000, 2000)] {
            let c = Span::new(s, e);
            for buffer in [0, 1, 30 * M] {
                assert!(conflicts(&c, &base, buffer), "{c:?} buffer={buffer}");
                assert!(conflicts(&base, &c, buffer), "{c:?} buffer={buffer}");
            }
        }
    }

    #[test]
    fn touching_endpoints_never_conflict_without_buffer() {
        let a = Span::new(100, 200);
        let b = Span::new(200, 300);
        assert!(!conflicts(&a, &b, 0));
        assert!(!conflicts(&b, &a, 0));
    }

    #[test]
    fn invalid_candidate_fails_safe() {
        let existing = Span::new(at(10, 0), at(11, 0));
        let empty = Span { start: at(14, 0), end: at(14, 0) };
        let inverted = Span { start: at(15, 0), end: at(14, 0) };
        assert!(conflicts(&empty, &existing, 0));
        assert!(conflicts(&inverted, &existing, 0));
    }

    // ── Policy ─────────────────────────────────────────────────

    #[test]
    fn policy_decides_whether_pending_blocks() {
        assert!(BlockingPolicy::ConfirmedAndPending.blocks(BookingStatus::Pending));
        assert!(!BlockingPolicy::ConfirmedOnly.blocks(BookingStatus::Pending));
        assert!(BlockingPolicy::ConfirmedOnly.blocks(BookingStatus::Confirmed));
        assert!(!BlockingPolicy::ConfirmedAndPending.blocks(BookingStatus::Cancelled));
        assert_eq!(BlockingPolicy::default(), BlockingPolicy::ConfirmedAndPending);
        assert_eq!(BlockingPolicy::parse("CONFIRMED_ONLY"), Some(BlockingPolicy::ConfirmedOnly));
    }

    #[test]
    fn find_conflict_respects_policy_and_exclusion() {
        let pending = booking(at(10, 0), at(11, 0), BookingStatus::Pending);
        let cancelled = booking(at(12, 0), at(13, 0), BookingStatus::Cancelled);
        let bookings = vec![pending.clone(), cancelled];

        let candidate = Span::new(at(10, 30), at(11, 30));
        assert!(find_conflict(&bookings, &candidate, BUFFER, BlockingPolicy::ConfirmedOnly, None).is_none());
        let hit = find_conflict(&bookings, &candidate, BUFFER, BlockingPolicy::ConfirmedAndPending, None);
        assert_eq!(hit.map(|b| b.id), Some(pending.id));
        assert!(
            find_conflict(&bookings, &candidate, BUFFER, BlockingPolicy::ConfirmedAndPending, Some(pending.id))
                .is_none()
        );

        let over_cancelled = Span::new(at(12, 0), at(13, 0));
        assert!(
            find_conflict(&bookings, &over_cancelled, BUFFER, BlockingPolicy::ConfirmedAndPending, None).is_none()
        );
    }

    #[test]
    fn room_conflict_finds_buffer_of_earlier_booking() {
        let room = Room {
            id: Ulid::new(),
            facility_id: Ulid::new(),
            name: "Orion".into(),
            capacity: 4,
            status: RoomStatus::Available,
            hourly_rate: None,
            currency: None,
            resources: vec![],
        };
        let mut rs = RoomState::new(room);
        rs.insert_booking(booking(at(8, 0), at(9, 0), BookingStatus::Confirmed));
        rs.insert_booking(booking(at(10, 0), at(11, 0), BookingStatus::Confirmed));

        // Starts in the buffer of the 10:00 booking; the search window must reach back.
        let hit = room_conflict(&rs, &Span::new(at(11, 15), at(12, 0)), BUFFER, BlockingPolicy::ConfirmedOnly, None);
        assert_eq!(hit.map(|b| b.span.start), Some(at(10, 0)));

        assert!(room_conflict(&rs, &Span::new(at(9, 30), at(10, 0)), BUFFER, BlockingPolicy::ConfirmedOnly, None).is_none());
        assert!(room_conflict(&rs, &Span::new(at(11, 30), at(12, 0)), BUFFER, BlockingPolicy::ConfirmedOnly, None).is_none());
    }

    #[test]
    fn validate_span_rejects_inverted_and_out_of_range() {
        assert!(matches!(
            validate_span(&Span { start: 10, end: 10 }),
            Err(EngineError::InvalidSpan { .. })
        ));
        assert!(matches!(
            validate_span(&Span::new(-1000, 0)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(&Span::new(0, crate::limits::MAX_SPAN_DURATION_MS + 1)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(validate_span(&Span::new(0, crate::limits::MAX_SPAN_DURATION_MS)).is_ok());
    }
}
