use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::invoice::format_invoice_number;
use crate::model::*;
use crate::observability;

use super::availability::conflict_for_room;
use super::{Engine, EngineError, WalCommand};

fn validate_span(span: &DateSpan) -> Result<(), EngineError> {
    if span.checkout <= span.checkin {
        return Err(EngineError::Validation("checkout must be after checkin"));
    }
    Ok(())
}

fn validate_amount(amount: f64, msg: &'static str) -> Result<(), EngineError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(EngineError::Validation(msg));
    }
    Ok(())
}

impl Engine {
    // ── Room registry ────────────────────────────────────────

    pub async fn create_room(
        &self,
        number: &str,
        name: &str,
        price: f64,
        actor: &str,
    ) -> Result<Ulid, EngineError> {
        let number = number.trim();
        let name = name.trim();
        if number.is_empty() {
            return Err(EngineError::Validation("room number required"));
        }
        if name.is_empty() {
            return Err(EngineError::Validation("room name required"));
        }
        validate_amount(price, "price must be non-negative")?;

        let id = Ulid::new();
        // Claim the number first so two concurrent creates cannot share it.
        match self.room_numbers.entry(number.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                return Err(EngineError::AlreadyExists(*e.get()));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let event = Event::RoomCreated {
            id,
            number: number.to_string(),
            name: name.to_string(),
            price,
            actor: actor.to_string(),
            at: now_ms(),
        };
        if let Err(e) = self.commit(event).await {
            self.room_numbers.remove(number);
            return Err(e);
        }

        let rs = RoomState::new(id, number.to_string(), name.to_string(), price);
        self.rooms.insert(id, Arc::new(RwLock::new(rs)));
        Ok(id)
    }

    /// Rename a room and/or change its external number.
    pub async fn update_room(
        &self,
        id: Ulid,
        number: &str,
        name: &str,
        actor: &str,
    ) -> Result<(), EngineError> {
        let number = number.trim();
        let name = name.trim();
        if number.is_empty() || name.is_empty() {
            return Err(EngineError::Validation("room number and name required"));
        }
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let renumbered = guard.number != number;
        if renumbered {
            match self.room_numbers.entry(number.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(e) => {
                    return Err(EngineError::AlreadyExists(*e.get()));
                }
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(id);
                }
            }
        }

        let event = Event::RoomUpdated {
            id,
            number: number.to_string(),
            name: name.to_string(),
            actor: actor.to_string(),
            at: now_ms(),
        };
        if let Err(e) = self.commit(event).await {
            if renumbered {
                self.room_numbers.remove(number);
            }
            return Err(e);
        }

        if renumbered {
            self.room_numbers.remove(&guard.number);
            guard.number = number.to_string();
        }
        guard.name = name.to_string();
        Ok(())
    }

    /// Change the nightly price. Existing bookings keep their snapshotted
    /// price; only future reservations see the new one.
    pub async fn set_room_price(&self, id: Ulid, price: f64, actor: &str) -> Result<(), EngineError> {
        validate_amount(price, "price must be non-negative")?;
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let event = Event::RoomPriceSet {
            id,
            price,
            actor: actor.to_string(),
            at: now_ms(),
        };
        self.commit(event).await?;
        guard.price = price;
        Ok(())
    }

    /// Toggle the global maintenance flag. While set, the room is
    /// unavailable for any range.
    pub async fn set_room_maintenance(
        &self,
        id: Ulid,
        maintenance: bool,
        actor: &str,
    ) -> Result<(), EngineError> {
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let event = Event::RoomMaintenanceSet {
            id,
            maintenance,
            actor: actor.to_string(),
            at: now_ms(),
        };
        self.commit(event).await?;
        guard.maintenance = maintenance;
        Ok(())
    }

    pub async fn set_room_housekeeping(
        &self,
        id: Ulid,
        status: Housekeeping,
        actor: &str,
    ) -> Result<(), EngineError> {
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let event = Event::RoomHousekeepingSet {
            id,
            status,
            actor: actor.to_string(),
            at: now_ms(),
        };
        self.commit(event).await?;
        guard.housekeeping = status;
        Ok(())
    }

    // ── Clients ──────────────────────────────────────────────

    pub async fn create_client(
        &self,
        full_name: &str,
        phone: &str,
        email: &str,
        address: &str,
        actor: &str,
    ) -> Result<Ulid, EngineError> {
        let full_name = full_name.trim();
        if full_name.is_empty() {
            return Err(EngineError::Validation("client name required"));
        }
        let id = Ulid::new();
        let at = now_ms();
        let event = Event::ClientCreated {
            id,
            full_name: full_name.to_string(),
            phone: phone.trim().to_string(),
            email: email.trim().to_string(),
            address: address.trim().to_string(),
            actor: actor.to_string(),
            at,
        };
        self.commit(event).await?;
        self.clients.insert(
            id,
            Client {
                id,
                full_name: full_name.to_string(),
                phone: phone.trim().to_string(),
                email: email.trim().to_string(),
                address: address.trim().to_string(),
                created_at: at,
            },
        );
        Ok(id)
    }

    // ── Booking ledger ───────────────────────────────────────

    /// Reserve one or more rooms for a stay. All-or-nothing: if any room
    /// cannot take the range, nothing is written and the error names every
    /// failing room with its reason.
    ///
    /// Write locks on the whole room set are held from the availability
    /// check through the WAL fsync, so two concurrent calls for overlapping
    /// ranges on a shared room can never both succeed.
    pub async fn create_booking(
        &self,
        client_id: Ulid,
        room_ids: &[Ulid],
        span: DateSpan,
        deposit: f64,
        payment_method: Option<PaymentMethod>,
        actor: &str,
    ) -> Result<Ulid, EngineError> {
        validate_span(&span)?;
        validate_amount(deposit, "deposit must be non-negative")?;
        if room_ids.is_empty() {
            return Err(EngineError::Validation("at least one room required"));
        }
        if !self.clients.contains_key(&client_id) {
            return Err(EngineError::NotFound(client_id));
        }

        let mut ids: Vec<Ulid> = room_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = self.lock_rooms(&ids).await?;

        let conflicts: Vec<RoomConflict> = guards
            .iter()
            .filter_map(|(_, guard)| conflict_for_room(guard, &span, None))
            .collect();
        if !conflicts.is_empty() {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Unavailable(conflicts));
        }

        let lines: Vec<RoomLine> = guards
            .iter()
            .map(|(rid, guard)| RoomLine {
                room_id: *rid,
                price_per_night: guard.price,
            })
            .collect();

        let id = Ulid::new();
        let at = now_ms();
        let event = Event::BookingCreated {
            id,
            client_id,
            span,
            rooms: lines.clone(),
            deposit,
            payment_method,
            actor: actor.to_string(),
            at,
        };
        self.commit(event).await?;

        for (rid, guard) in guards.iter_mut() {
            let line = lines.iter().find(|l| l.room_id == *rid);
            if let Some(line) = line {
                guard.insert_stay(Stay {
                    booking_id: id,
                    span,
                    price_per_night: line.price_per_night,
                });
            }
        }
        self.bookings.insert(
            id,
            Booking {
                id,
                client_id,
                span,
                rooms: lines,
                extras: 0.0,
                deposit,
                payment_method,
                invoice_number: None,
                paid: false,
                paid_at: None,
                created_by: actor.to_string(),
                created_at: at,
            },
        );

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(id)
    }

    /// Re-stay a booking: new dates, new room set, new payment terms.
    ///
    /// Availability checks exclude the booking's own stays. Rooms kept from
    /// the old set keep their snapshotted price; rooms added snapshot the
    /// current price.
    pub async fn update_booking(
        &self,
        id: Ulid,
        span: DateSpan,
        room_ids: &[Ulid],
        deposit: f64,
        payment_method: Option<PaymentMethod>,
        actor: &str,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_amount(deposit, "deposit must be non-negative")?;
        if room_ids.is_empty() {
            return Err(EngineError::Validation("at least one room required"));
        }

        let snapshot = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;

        let mut new_ids: Vec<Ulid> = room_ids.to_vec();
        new_ids.sort();
        new_ids.dedup();

        // Lock old ∪ new so removed rooms are covered too.
        let mut lock_set: Vec<Ulid> = new_ids.clone();
        lock_set.extend(snapshot.rooms.iter().map(|l| l.room_id));
        lock_set.sort();
        lock_set.dedup();

        let mut guards = self.lock_rooms(&lock_set).await?;

        // The snapshot chose which rooms to lock. If another writer slipped
        // in before we held them, our locks may not cover the booking any
        // more — fail retriably rather than operate on the wrong rooms.
        let current = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;
        if current.span != snapshot.span || current.rooms != snapshot.rooms {
            return Err(EngineError::ConcurrentUpdate(id));
        }

        let mut conflicts = Vec::new();
        for (rid, guard) in &guards {
            if !new_ids.contains(rid) {
                continue;
            }
            if let Some(c) = conflict_for_room(guard, &span, Some(id)) {
                conflicts.push(c);
            }
        }
        if !conflicts.is_empty() {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Unavailable(conflicts));
        }

        let room_prices: HashMap<Ulid, f64> =
            guards.iter().map(|(rid, g)| (*rid, g.price)).collect();
        let lines: Vec<RoomLine> = new_ids
            .iter()
            .map(|rid| RoomLine {
                room_id: *rid,
                price_per_night: match current.rooms.iter().find(|l| l.room_id == *rid) {
                    Some(kept) => kept.price_per_night,
                    None => room_prices[rid],
                },
            })
            .collect();

        let event = Event::BookingUpdated {
            id,
            span,
            rooms: lines.clone(),
            deposit,
            payment_method,
            actor: actor.to_string(),
            at: now_ms(),
        };
        self.commit(event).await?;

        for (rid, guard) in guards.iter_mut() {
            guard.remove_stays_for(id);
            if let Some(line) = lines.iter().find(|l| l.room_id == *rid) {
                guard.insert_stay(Stay {
                    booking_id: id,
                    span,
                    price_per_night: line.price_per_night,
                });
            }
        }
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.span = span;
            b.rooms = lines;
            b.deposit = deposit;
            b.payment_method = payment_method;
        }
        Ok(())
    }

    /// Remove a booking and its room stays in one committed action. The
    /// freed dates become immediately available.
    pub async fn delete_booking(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        let snapshot = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;

        let mut room_set: Vec<Ulid> = snapshot.rooms.iter().map(|l| l.room_id).collect();
        room_set.sort();
        room_set.dedup();

        let mut guards = self.lock_rooms(&room_set).await?;

        let current = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;
        if current.rooms != snapshot.rooms {
            return Err(EngineError::ConcurrentUpdate(id));
        }

        let event = Event::BookingDeleted {
            id,
            actor: actor.to_string(),
            at: now_ms(),
        };
        self.commit(event).await?;

        for (_, guard) in guards.iter_mut() {
            guard.remove_stays_for(id);
        }
        self.bookings.remove(&id);
        metrics::counter!(observability::BOOKINGS_DELETED_TOTAL).increment(1);
        Ok(())
    }

    /// Commit and apply run under the booking's room locks, like every other
    /// booking mutation, so concurrent writes land in WAL order and the live
    /// record never diverges from what a restart would rebuild.
    pub async fn set_extras(&self, id: Ulid, extras: f64, actor: &str) -> Result<(), EngineError> {
        validate_amount(extras, "extras must be non-negative")?;
        let snapshot = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;

        let mut room_set: Vec<Ulid> = snapshot.rooms.iter().map(|l| l.room_id).collect();
        room_set.sort();
        room_set.dedup();
        let _guards = self.lock_rooms(&room_set).await?;

        let current = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;
        if current.rooms != snapshot.rooms {
            return Err(EngineError::ConcurrentUpdate(id));
        }

        let event = Event::ExtrasSet {
            id,
            extras,
            actor: actor.to_string(),
            at: now_ms(),
        };
        self.commit(event).await?;
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.extras = extras;
        }
        Ok(())
    }

    /// Record payment. Idempotent: a booking already paid returns its
    /// invoice number unchanged with no second counter increment. The
    /// sequence lock is held across the WAL append so a failed append never
    /// consumes a number and concurrent payments never share one.
    pub async fn mark_paid(&self, id: Ulid, actor: &str) -> Result<String, EngineError> {
        let mut next = self.invoice_next.lock().await;

        let booking = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;
        if booking.paid {
            return Ok(booking.invoice_number.unwrap_or_default());
        }

        let (invoice_number, seq) = match booking.invoice_number {
            Some(existing) => (existing, None),
            None => {
                let seq = *next;
                (format_invoice_number(seq, Utc::now().date_naive()), Some(seq))
            }
        };

        let at = now_ms();
        let event = Event::BookingPaid {
            id,
            invoice_number: invoice_number.clone(),
            seq,
            actor: actor.to_string(),
            at,
        };
        self.commit(event).await?;

        if seq.is_some() {
            *next += 1;
            metrics::counter!(observability::INVOICES_ISSUED_TOTAL).increment(1);
        }
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.paid = true;
            b.paid_at = Some(at);
            b.invoice_number = Some(invoice_number.clone());
        }
        Ok(invoice_number)
    }

    /// Assign an invoice number ahead of payment, for document generation.
    /// Idempotent: an already-assigned number is returned unchanged.
    pub async fn assign_invoice_number(&self, id: Ulid, actor: &str) -> Result<String, EngineError> {
        let mut next = self.invoice_next.lock().await;

        let booking = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;
        if let Some(existing) = booking.invoice_number {
            return Ok(existing);
        }

        let seq = *next;
        let invoice_number = format_invoice_number(seq, Utc::now().date_naive());
        let event = Event::InvoiceAssigned {
            id,
            invoice_number: invoice_number.clone(),
            seq,
            actor: actor.to_string(),
            at: now_ms(),
        };
        self.commit(event).await?;

        *next += 1;
        metrics::counter!(observability::INVOICES_ISSUED_TOTAL).increment(1);
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.invoice_number = Some(invoice_number.clone());
        }
        Ok(invoice_number)
    }

    // ── Maintenance blocks ───────────────────────────────────

    /// Withhold a room for a date range. Blocks may overlap each other.
    ///
    /// A block may also be laid over existing bookings; the call succeeds
    /// and returns the overlapping booking ids so the caller can surface
    /// the clash for manual resolution.
    pub async fn create_block(
        &self,
        room_id: Ulid,
        span: DateSpan,
        reason: &str,
        actor: &str,
    ) -> Result<(Ulid, Vec<Ulid>), EngineError> {
        validate_span(&span)?;
        let reason = {
            let trimmed = reason.trim();
            if trimmed.is_empty() { "Travaux" } else { trimmed }
        };

        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;

        let mut overlapping: Vec<Ulid> = guard
            .stays_overlapping(&span)
            .map(|s| s.booking_id)
            .collect();
        overlapping.sort();
        overlapping.dedup();

        let id = Ulid::new();
        let at = now_ms();
        let event = Event::BlockCreated {
            id,
            room_id,
            span,
            reason: reason.to_string(),
            actor: actor.to_string(),
            at,
        };
        self.commit(event).await?;

        guard.insert_block(MaintenanceBlock {
            id,
            room_id,
            span,
            reason: reason.to_string(),
            created_by: actor.to_string(),
            created_at: at,
        });
        self.block_to_room.insert(id, room_id);
        Ok((id, overlapping))
    }

    pub async fn delete_block(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        let room_id = self
            .block_to_room
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;

        // Another deleter may have won while we waited for the lock.
        if !guard.blocks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::BlockDeleted {
            id,
            room_id,
            actor: actor.to_string(),
            at: now_ms(),
        };
        self.commit(event).await?;

        guard.remove_block(id);
        self.block_to_room.remove(&id);
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state, plus the full audit history. Call while
    /// the engine is quiescent.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        // Pin the exact counter position: a paid booking may have been
        // deleted, so per-booking seq values alone can undershoot.
        let next = *self
            .invoice_next
            .try_lock()
            .expect("compact: uncontended invoice counter");
        events.push(Event::InvoiceCounter { next });

        for entry in self.rooms.iter() {
            let rs = entry.value().clone();
            let guard = rs.try_read().expect("compact: uncontended read");
            events.push(Event::RoomCreated {
                id: guard.id,
                number: guard.number.clone(),
                name: guard.name.clone(),
                price: guard.price,
                actor: "system".into(),
                at: 0,
            });
            if guard.maintenance {
                events.push(Event::RoomMaintenanceSet {
                    id: guard.id,
                    maintenance: true,
                    actor: "system".into(),
                    at: 0,
                });
            }
            if guard.housekeeping != Housekeeping::Clean {
                events.push(Event::RoomHousekeepingSet {
                    id: guard.id,
                    status: guard.housekeeping,
                    actor: "system".into(),
                    at: 0,
                });
            }
            for block in &guard.blocks {
                events.push(Event::BlockCreated {
                    id: block.id,
                    room_id: block.room_id,
                    span: block.span,
                    reason: block.reason.clone(),
                    actor: block.created_by.clone(),
                    at: block.created_at,
                });
            }
        }

        for entry in self.clients.iter() {
            let c = entry.value();
            events.push(Event::ClientCreated {
                id: c.id,
                full_name: c.full_name.clone(),
                phone: c.phone.clone(),
                email: c.email.clone(),
                address: c.address.clone(),
                actor: "system".into(),
                at: c.created_at,
            });
        }

        for entry in self.bookings.iter() {
            let b = entry.value();
            events.push(Event::BookingCreated {
                id: b.id,
                client_id: b.client_id,
                span: b.span,
                rooms: b.rooms.clone(),
                deposit: b.deposit,
                payment_method: b.payment_method,
                actor: b.created_by.clone(),
                at: b.created_at,
            });
            if b.extras != 0.0 {
                events.push(Event::ExtrasSet {
                    id: b.id,
                    extras: b.extras,
                    actor: "system".into(),
                    at: b.created_at,
                });
            }
            if b.paid {
                if let Some(invoice_number) = &b.invoice_number {
                    events.push(Event::BookingPaid {
                        id: b.id,
                        invoice_number: invoice_number.clone(),
                        seq: None,
                        actor: "system".into(),
                        at: b.paid_at.unwrap_or(b.created_at),
                    });
                }
            } else if let Some(invoice_number) = &b.invoice_number {
                events.push(Event::InvoiceAssigned {
                    id: b.id,
                    invoice_number: invoice_number.clone(),
                    seq: 0,
                    actor: "system".into(),
                    at: b.created_at,
                });
            }
        }

        // Audit history survives compaction verbatim.
        {
            let audit = self.audit.read().expect("audit log lock poisoned");
            events.extend(audit.iter().cloned().map(Event::Audit));
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
