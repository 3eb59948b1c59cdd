use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{self, conflict_for_room};
use super::{Engine, EngineError};

/// Derived money figures for a booking. `remaining` floors at zero: a
/// deposit larger than the total is not a credit.
pub fn booking_totals(b: &Booking) -> BookingTotals {
    let nights = b.span.nights();
    let room_total: f64 = b
        .rooms
        .iter()
        .map(|l| l.price_per_night * nights as f64)
        .sum();
    let total = room_total + b.extras;
    BookingTotals {
        nights,
        room_total,
        total,
        remaining: (total - b.deposit).max(0.0),
    }
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    /// All rooms, sorted by their external number.
    pub async fn rooms(&self) -> Vec<RoomInfo> {
        // Snapshot the Arcs before awaiting: holding a map shard guard across
        // a room lock wait would stall writers on that shard.
        let shared: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            let guard = rs.read().await;
            out.push(RoomInfo {
                id: guard.id,
                number: guard.number.clone(),
                name: guard.name.clone(),
                price: guard.price,
                housekeeping: guard.housekeeping,
                maintenance: guard.maintenance,
            });
        }
        out.sort_by(|a, b| a.number.cmp(&b.number));
        out
    }

    pub async fn get_room_info(&self, id: Ulid) -> Option<RoomInfo> {
        let rs = self.get_room(&id)?;
        let guard = rs.read().await;
        Some(RoomInfo {
            id: guard.id,
            number: guard.number.clone(),
            name: guard.name.clone(),
            price: guard.price,
            housekeeping: guard.housekeeping,
            maintenance: guard.maintenance,
        })
    }

    pub fn room_id_by_number(&self, number: &str) -> Option<Ulid> {
        self.room_numbers.get(number.trim()).map(|e| *e.value())
    }

    // ── Clients ──────────────────────────────────────────────

    pub fn clients(&self) -> Vec<Client> {
        let mut out: Vec<Client> = self.clients.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        out
    }

    pub fn get_client(&self, id: Ulid) -> Option<Client> {
        self.clients.get(&id).map(|e| e.value().clone())
    }

    /// Case-insensitive substring search over name, phone, and email.
    pub fn search_clients(&self, query: &str) -> Vec<Client> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.clients();
        }
        let mut out: Vec<Client> = self
            .clients
            .iter()
            .filter(|e| {
                let c = e.value();
                c.full_name.to_lowercase().contains(&needle)
                    || c.phone.to_lowercase().contains(&needle)
                    || c.email.to_lowercase().contains(&needle)
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        out
    }

    // ── Bookings ─────────────────────────────────────────────

    /// All bookings, newest check-in first.
    pub fn bookings(&self) -> Vec<Booking> {
        let mut out: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| b.span.checkin.cmp(&a.span.checkin));
        out
    }

    pub fn get_booking(&self, id: Ulid) -> Option<Booking> {
        self.bookings.get(&id).map(|e| e.value().clone())
    }

    pub fn bookings_overlapping(&self, span: &DateSpan) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().span.overlaps(span))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| b.span.checkin);
        out
    }

    /// Bookings checking in on the given day — the reception arrival board.
    pub fn arrivals_on(&self, day: NaiveDate) -> Vec<Booking> {
        self.bookings
            .iter()
            .filter(|e| e.value().span.checkin == day)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn departures_on(&self, day: NaiveDate) -> Vec<Booking> {
        self.bookings
            .iter()
            .filter(|e| e.value().span.checkout == day)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn totals_for(&self, id: Ulid) -> Option<BookingTotals> {
        self.bookings.get(&id).map(|b| booking_totals(b.value()))
    }

    /// Everything the invoice-document generator needs for one booking, with
    /// room names resolved and totals computed.
    pub async fn invoice_view(&self, id: Ulid) -> Result<InvoiceView, EngineError> {
        let booking = self.get_booking(id).ok_or(EngineError::NotFound(id))?;
        let client = self
            .get_client(booking.client_id)
            .ok_or(EngineError::NotFound(booking.client_id))?;

        let mut lines = Vec::with_capacity(booking.rooms.len());
        for line in &booking.rooms {
            let room_name = match self.get_room(&line.room_id) {
                Some(rs) => rs.read().await.name.clone(),
                None => line.room_id.to_string(),
            };
            lines.push(InvoiceLine {
                room_id: line.room_id,
                room_name,
                price_per_night: line.price_per_night,
            });
        }

        let totals = booking_totals(&booking);
        Ok(InvoiceView {
            booking,
            client,
            lines,
            totals,
        })
    }

    // ── Availability ─────────────────────────────────────────

    pub async fn is_room_available(
        &self,
        room_id: Ulid,
        span: &DateSpan,
        exclude_booking: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(availability::is_available(&guard, span, exclude_booking))
    }

    /// Read-only conflict report for a candidate room set. Advisory: the
    /// answer can go stale before a subsequent create, which re-checks under
    /// write locks.
    pub async fn find_conflicts(
        &self,
        room_ids: &[Ulid],
        span: &DateSpan,
        exclude_booking: Option<Ulid>,
    ) -> Result<Vec<RoomConflict>, EngineError> {
        let mut out = Vec::new();
        for rid in room_ids {
            let rs = self.get_room(rid).ok_or(EngineError::NotFound(*rid))?;
            let guard = rs.read().await;
            if let Some(c) = conflict_for_room(&guard, span, exclude_booking) {
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Free sub-ranges of `query` on one room.
    pub async fn free_spans_for(
        &self,
        room_id: Ulid,
        query: &DateSpan,
    ) -> Result<Vec<DateSpan>, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(availability::free_spans(&guard, query))
    }

    pub async fn blocks_overlapping(
        &self,
        room_id: Ulid,
        span: &DateSpan,
    ) -> Result<Vec<MaintenanceBlock>, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.blocks_overlapping(span).cloned().collect())
    }

    // ── Audit ────────────────────────────────────────────────

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.read().expect("audit log lock poisoned").clone()
    }
}
