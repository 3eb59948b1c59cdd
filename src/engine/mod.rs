mod availability;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{conflict_for_room, free_spans, is_available, merge_overlapping, subtract_spans};
pub use error::EngineError;
pub use queries::booking_totals;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        /// One logical action: the state event plus its audit record.
        /// Written contiguously so a crash never keeps one without the other.
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type AppendBatch = Vec<(Vec<Event>, oneshot::Sender<io::Result<()>>)>;

fn flush_and_respond(wal: &mut Wal, batch: &mut AppendBatch) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut AppendBatch) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch.iter() {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut AppendBatch, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
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
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The booking engine: room registry, booking ledger, maintenance blocks,
/// invoice sequence, and audit log, all backed by one WAL.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    /// Unique external room number → room id.
    pub(super) room_numbers: DashMap<String, Ulid>,
    pub(super) clients: DashMap<Ulid, Client>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    /// Reverse lookup: maintenance block id → room id.
    pub(super) block_to_room: DashMap<Ulid, Ulid>,
    /// Append-only audit projection, rebuilt from the WAL.
    pub(super) audit: std::sync::RwLock<Vec<AuditEntry>>,
    /// Next invoice sequence value. The lock is held across the WAL append
    /// so concurrent payments can never draw the same number.
    pub(super) invoice_next: tokio::sync::Mutex<u64>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            room_numbers: DashMap::new(),
            clients: DashMap::new(),
            bookings: DashMap::new(),
            block_to_room: DashMap::new(),
            audit: std::sync::RwLock::new(Vec::new()),
            invoice_next: tokio::sync::Mutex::new(1),
            wal_tx,
        };

        let count = events.len();
        for event in events {
            engine.apply_replayed(event);
        }
        tracing::debug!("replayed {count} events from {}", wal_path.display());

        Ok(engine)
    }

    /// Rebuild in-memory state from one replayed event. We're the sole owner
    /// of the room Arcs here, so try_read/try_write always succeed instantly
    /// (no contention). Never use blocking_read/blocking_write here because
    /// this may run inside an async context.
    fn apply_replayed(&self, event: Event) {
        match event {
            Event::RoomCreated { id, number, name, price, .. } => {
                self.room_numbers.insert(number.clone(), id);
                let rs = RoomState::new(id, number, name, price);
                self.rooms.insert(id, Arc::new(RwLock::new(rs)));
            }
            Event::RoomUpdated { id, number, name, .. } => {
                if let Some(entry) = self.rooms.get(&id) {
                    let rs = entry.value().clone();
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    if guard.number != number {
                        self.room_numbers.remove(&guard.number);
                        self.room_numbers.insert(number.clone(), id);
                    }
                    guard.number = number;
                    guard.name = name;
                }
            }
            Event::RoomPriceSet { id, price, .. } => {
                self.with_room_replayed(id, |room| room.price = price);
            }
            Event::RoomMaintenanceSet { id, maintenance, .. } => {
                self.with_room_replayed(id, |room| room.maintenance = maintenance);
            }
            Event::RoomHousekeepingSet { id, status, .. } => {
                self.with_room_replayed(id, |room| room.housekeeping = status);
            }
            Event::ClientCreated { id, full_name, phone, email, address, at, .. } => {
                self.clients.insert(
                    id,
                    Client {
                        id,
                        full_name,
                        phone,
                        email,
                        address,
                        created_at: at,
                    },
                );
            }
            Event::BookingCreated {
                id,
                client_id,
                span,
                rooms,
                deposit,
                payment_method,
                actor,
                at,
            } => {
                for line in &rooms {
                    self.with_room_replayed(line.room_id, |room| {
                        room.insert_stay(Stay {
                            booking_id: id,
                            span,
                            price_per_night: line.price_per_night,
                        });
                    });
                }
                self.bookings.insert(
                    id,
                    Booking {
                        id,
                        client_id,
                        span,
                        rooms,
                        extras: 0.0,
                        deposit,
                        payment_method,
                        invoice_number: None,
                        paid: false,
                        paid_at: None,
                        created_by: actor,
                        created_at: at,
                    },
                );
            }
            Event::BookingUpdated { id, span, rooms, deposit, payment_method, .. } => {
                let old_rooms: Vec<Ulid> = match self.bookings.get(&id) {
                    Some(b) => b.rooms.iter().map(|l| l.room_id).collect(),
                    None => return,
                };
                for rid in old_rooms {
                    self.with_room_replayed(rid, |room| {
                        room.remove_stays_for(id);
                    });
                }
                for line in &rooms {
                    self.with_room_replayed(line.room_id, |room| {
                        room.insert_stay(Stay {
                            booking_id: id,
                            span,
                            price_per_night: line.price_per_night,
                        });
                    });
                }
                if let Some(mut b) = self.bookings.get_mut(&id) {
                    b.span = span;
                    b.rooms = rooms;
                    b.deposit = deposit;
                    b.payment_method = payment_method;
                }
            }
            Event::BookingDeleted { id, .. } => {
                if let Some((_, b)) = self.bookings.remove(&id) {
                    for line in &b.rooms {
                        self.with_room_replayed(line.room_id, |room| {
                            room.remove_stays_for(id);
                        });
                    }
                }
            }
            Event::ExtrasSet { id, extras, .. } => {
                if let Some(mut b) = self.bookings.get_mut(&id) {
                    b.extras = extras;
                }
            }
            Event::InvoiceAssigned { id, invoice_number, seq, .. } => {
                if let Some(mut b) = self.bookings.get_mut(&id) {
                    b.invoice_number = Some(invoice_number);
                }
                self.bump_invoice_next(seq + 1);
            }
            Event::BookingPaid { id, invoice_number, seq, at, .. } => {
                if let Some(mut b) = self.bookings.get_mut(&id) {
                    b.paid = true;
                    b.paid_at = Some(at);
                    b.invoice_number = Some(invoice_number);
                }
                if let Some(seq) = seq {
                    self.bump_invoice_next(seq + 1);
                }
            }
            Event::BlockCreated { id, room_id, span, reason, actor, at } => {
                self.block_to_room.insert(id, room_id);
                self.with_room_replayed(room_id, |room| {
                    room.insert_block(MaintenanceBlock {
                        id,
                        room_id,
                        span,
                        reason,
                        created_by: actor,
                        created_at: at,
                    });
                });
            }
            Event::BlockDeleted { id, room_id, .. } => {
                self.block_to_room.remove(&id);
                self.with_room_replayed(room_id, |room| {
                    room.remove_block(id);
                });
            }
            Event::InvoiceCounter { next } => {
                self.bump_invoice_next(next);
            }
            Event::Audit(entry) => {
                self.push_audit(entry);
            }
        }
    }

    fn with_room_replayed(&self, id: Ulid, f: impl FnOnce(&mut RoomState)) {
        if let Some(entry) = self.rooms.get(&id) {
            let rs = entry.value().clone();
            let mut guard = rs.try_write().expect("replay: uncontended write");
            f(&mut guard);
        }
    }

    fn bump_invoice_next(&self, candidate: u64) {
        let mut next = self
            .invoice_next
            .try_lock()
            .expect("replay: uncontended invoice counter");
        if candidate > *next {
            *next = candidate;
        }
    }

    pub(super) fn push_audit(&self, entry: AuditEntry) {
        self.audit
            .write()
            .expect("audit log lock poisoned")
            .push(entry);
    }

    /// Write one logical action (state event + audit record) to the WAL via
    /// the background group-commit writer. Returns only once fsynced.
    pub(super) async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Persist one committed event and its audit projection, then record the
    /// audit entry in memory. The caller applies the state change itself,
    /// under whatever locks it already holds.
    pub(super) async fn commit(&self, event: Event) -> Result<(), EngineError> {
        let audit = audit_entry_for(&event);
        let mut batch = vec![event];
        if let Some(entry) = &audit {
            batch.push(Event::Audit(entry.clone()));
        }
        self.wal_append(batch).await?;
        if let Some(entry) = audit {
            self.push_audit(entry);
        }
        Ok(())
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Acquire write locks on a sorted, deduplicated set of rooms.
    /// Sorted order keeps concurrent multi-room operations deadlock free.
    pub(super) async fn lock_rooms(
        &self,
        room_ids: &[Ulid],
    ) -> Result<Vec<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>)>, EngineError> {
        debug_assert!(room_ids.windows(2).all(|w| w[0] < w[1]));
        let mut guards = Vec::with_capacity(room_ids.len());
        for rid in room_ids {
            let rs = self.get_room(rid).ok_or(EngineError::NotFound(*rid))?;
            guards.push((*rid, rs.write_owned().await));
        }
        Ok(guards)
    }
}
