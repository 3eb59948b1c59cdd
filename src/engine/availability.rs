use ulid::Ulid;

use crate::model::*;

// ── Conflict detection ────────────────────────────────────────────

/// Why `room` cannot take `span`, or None if it can.
///
/// Checks in the order the reception flow reports them: global maintenance
/// flag, then maintenance blocks, then other bookings' stays. One reason per
/// room is enough for the caller to act on.
///
/// `exclude_booking` skips that booking's own stays, for edits.
pub fn conflict_for_room(
    room: &RoomState,
    span: &DateSpan,
    exclude_booking: Option<Ulid>,
) -> Option<RoomConflict> {
    if room.maintenance {
        return Some(RoomConflict {
            room_id: room.id,
            room_name: room.name.clone(),
            reason: ConflictReason::Maintenance,
        });
    }
    if let Some(block) = room.blocks_overlapping(span).next() {
        return Some(RoomConflict {
            room_id: room.id,
            room_name: room.name.clone(),
            reason: ConflictReason::Blocked(block.id),
        });
    }
    if let Some(stay) = room
        .stays_overlapping(span)
        .find(|s| exclude_booking != Some(s.booking_id))
    {
        return Some(RoomConflict {
            room_id: room.id,
            room_name: room.name.clone(),
            reason: ConflictReason::Reserved(stay.booking_id),
        });
    }
    None
}

pub fn is_available(room: &RoomState, span: &DateSpan, exclude_booking: Option<Ulid>) -> bool {
    conflict_for_room(room, span, exclude_booking).is_none()
}

// ── Free-span computation ─────────────────────────────────────────

/// The free sub-ranges of `query` on one room: the query window minus blocks
/// and stays. Empty if the room is under global maintenance.
pub fn free_spans(room: &RoomState, query: &DateSpan) -> Vec<DateSpan> {
    if room.maintenance {
        return Vec::new();
    }

    let clamp = |s: &DateSpan| {
        DateSpan::new(
            s.checkin.max(query.checkin),
            s.checkout.min(query.checkout),
        )
    };

    let mut occupied: Vec<DateSpan> = room
        .blocks_overlapping(query)
        .map(|b| clamp(&b.span))
        .chain(room.stays_overlapping(query).map(|s| clamp(&s.span)))
        .collect();
    occupied.sort_by_key(|s| s.checkin);

    subtract_spans(std::slice::from_ref(query), &occupied)
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[DateSpan]) -> Vec<DateSpan> {
    let mut out: Vec<DateSpan> = Vec::new();
    for s in sorted {
        match out.last_mut() {
            Some(last) if s.checkin <= last.checkout => {
                if s.checkout > last.checkout {
                    last.checkout = s.checkout;
                }
            }
            _ => out.push(*s),
        }
    }
    out
}

/// Subtract `to_remove` (sorted by checkin) from each span in `base`,
/// returning the leftover pieces in order.
pub fn subtract_spans(base: &[DateSpan], to_remove: &[DateSpan]) -> Vec<DateSpan> {
    let removals = merge_overlapping(to_remove);
    let mut out = Vec::new();
    for b in base {
        let mut cursor = b.checkin;
        for r in &removals {
            if r.checkout <= cursor {
                continue;
            }
            if r.checkin >= b.checkout {
                break;
            }
            if r.checkin > cursor {
                out.push(DateSpan::new(cursor, r.checkin));
            }
            cursor = cursor.max(r.checkout);
            if cursor >= b.checkout {
                break;
            }
        }
        if cursor < b.checkout {
            out.push(DateSpan::new(cursor, b.checkout));
        }
    }
    out
}
