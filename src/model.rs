use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Half-open date range `[checkin, checkout)`.
///
/// The exclusive upper bound is what permits back-to-back same-day turnover:
/// a stay ending on a date never conflicts with one starting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSpan {
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
}

impl DateSpan {
    pub fn new(checkin: NaiveDate, checkout: NaiveDate) -> Self {
        debug_assert!(checkin < checkout, "DateSpan checkin must be before checkout");
        Self { checkin, checkout }
    }

    pub fn nights(&self) -> i64 {
        (self.checkout - self.checkin).num_days().max(0)
    }

    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.checkin < other.checkout && other.checkin < self.checkout
    }

    pub fn contains_day(&self, d: NaiveDate) -> bool {
        self.checkin <= d && d < self.checkout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Housekeeping {
    Clean,
    Todo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Card,
    Cash,
    Transfer,
    Cheque,
    Other,
}

/// One room's share of a committed booking — the (booking, room) join row,
/// seen from the room side. `price_per_night` is snapshotted when the room
/// is attached to the booking and never re-read from the room.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stay {
    pub booking_id: Ulid,
    pub span: DateSpan,
    pub price_per_night: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceBlock {
    pub id: Ulid,
    pub room_id: Ulid,
    pub span: DateSpan,
    pub reason: String,
    pub created_by: String,
    pub created_at: Ms,
}

/// A room and everything booked or blocked on it.
///
/// `stays` and `blocks` are kept sorted by span start so overlap queries can
/// binary-search past the tail.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    /// Unique external room number ("101", "102", ...).
    pub number: String,
    pub name: String,
    /// Current nightly price in euros. Snapshotted into stays at booking time.
    pub price: f64,
    pub housekeeping: Housekeeping,
    /// Global maintenance flag: the room is unavailable for any range.
    pub maintenance: bool,
    pub stays: Vec<Stay>,
    pub blocks: Vec<MaintenanceBlock>,
}

impl RoomState {
    pub fn new(id: Ulid, number: String, name: String, price: f64) -> Self {
        Self {
            id,
            number,
            name,
            price,
            housekeeping: Housekeeping::Clean,
            maintenance: false,
            stays: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Insert a stay maintaining sort order by checkin.
    pub fn insert_stay(&mut self, stay: Stay) {
        let pos = self
            .stays
            .binary_search_by_key(&stay.span.checkin, |s| s.span.checkin)
            .unwrap_or_else(|e| e);
        self.stays.insert(pos, stay);
    }

    /// Remove every stay belonging to `booking_id`. Returns how many were removed.
    pub fn remove_stays_for(&mut self, booking_id: Ulid) -> usize {
        let before = self.stays.len();
        self.stays.retain(|s| s.booking_id != booking_id);
        before - self.stays.len()
    }

    /// Stays whose span overlaps the query window.
    /// Everything at index >= the partition point starts at or after
    /// `query.checkout` and cannot overlap.
    pub fn stays_overlapping(&self, query: &DateSpan) -> impl Iterator<Item = &Stay> {
        let right = self
            .stays
            .partition_point(|s| s.span.checkin < query.checkout);
        self.stays[..right]
            .iter()
            .filter(move |s| s.span.checkout > query.checkin)
    }

    pub fn insert_block(&mut self, block: MaintenanceBlock) {
        let pos = self
            .blocks
            .binary_search_by_key(&block.span.checkin, |b| b.span.checkin)
            .unwrap_or_else(|e| e);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<MaintenanceBlock> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    pub fn blocks_overlapping(&self, query: &DateSpan) -> impl Iterator<Item = &MaintenanceBlock> {
        let right = self
            .blocks
            .partition_point(|b| b.span.checkin < query.checkout);
        self.blocks[..right]
            .iter()
            .filter(move |b| b.span.checkout > query.checkin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub address: String,
    pub created_at: Ms,
}

/// One room attached to a booking, with its snapshotted nightly price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoomLine {
    pub room_id: Ulid,
    pub price_per_night: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: Ulid,
    pub span: DateSpan,
    /// Never empty: a booking without rooms is not allowed to persist.
    pub rooms: Vec<RoomLine>,
    pub extras: f64,
    pub deposit: f64,
    pub payment_method: Option<PaymentMethod>,
    /// Assigned at first payment or first invoice-document request, then fixed.
    pub invoice_number: Option<String>,
    pub paid: bool,
    pub paid_at: Option<Ms>,
    pub created_by: String,
    pub created_at: Ms,
}

/// Why a room cannot take a requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    /// Global maintenance flag is set.
    Maintenance,
    /// A maintenance block overlaps the range.
    Blocked(Ulid),
    /// Another booking's stay overlaps the range.
    Reserved(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConflict {
    pub room_id: Ulid,
    pub room_name: String,
    pub reason: ConflictReason,
}

impl std::fmt::Display for RoomConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            ConflictReason::Maintenance => write!(f, "{}: under maintenance", self.room_name),
            ConflictReason::Blocked(id) => write!(f, "{}: blocked ({id})", self.room_name),
            ConflictReason::Reserved(id) => write!(f, "{}: already reserved ({id})", self.room_name),
        }
    }
}

/// Append-only audit record. Rebuilt from the WAL on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: Ms,
    pub actor: String,
    pub action: String,
    /// JSON object, kept as encoded text: audit records travel through the
    /// bincode WAL frames, which cannot carry `serde_json::Value`.
    pub meta: String,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        number: String,
        name: String,
        price: f64,
        actor: String,
        at: Ms,
    },
    RoomUpdated {
        id: Ulid,
        number: String,
        name: String,
        actor: String,
        at: Ms,
    },
    RoomPriceSet {
        id: Ulid,
        price: f64,
        actor: String,
        at: Ms,
    },
    RoomMaintenanceSet {
        id: Ulid,
        maintenance: bool,
        actor: String,
        at: Ms,
    },
    RoomHousekeepingSet {
        id: Ulid,
        status: Housekeeping,
        actor: String,
        at: Ms,
    },
    ClientCreated {
        id: Ulid,
        full_name: String,
        phone: String,
        email: String,
        address: String,
        actor: String,
        at: Ms,
    },
    BookingCreated {
        id: Ulid,
        client_id: Ulid,
        span: DateSpan,
        rooms: Vec<RoomLine>,
        deposit: f64,
        payment_method: Option<PaymentMethod>,
        actor: String,
        at: Ms,
    },
    BookingUpdated {
        id: Ulid,
        span: DateSpan,
        rooms: Vec<RoomLine>,
        deposit: f64,
        payment_method: Option<PaymentMethod>,
        actor: String,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        actor: String,
        at: Ms,
    },
    ExtrasSet {
        id: Ulid,
        extras: f64,
        actor: String,
        at: Ms,
    },
    /// Invoice number assigned ahead of payment (document generation).
    InvoiceAssigned {
        id: Ulid,
        invoice_number: String,
        seq: u64,
        actor: String,
        at: Ms,
    },
    /// `seq` is None when the booking already had an invoice number.
    BookingPaid {
        id: Ulid,
        invoice_number: String,
        seq: Option<u64>,
        actor: String,
        at: Ms,
    },
    BlockCreated {
        id: Ulid,
        room_id: Ulid,
        span: DateSpan,
        reason: String,
        actor: String,
        at: Ms,
    },
    BlockDeleted {
        id: Ulid,
        room_id: Ulid,
        actor: String,
        at: Ms,
    },
    /// Compaction snapshot of the invoice counter position.
    InvoiceCounter { next: u64 },
    /// Historical audit entry re-emitted by compaction.
    Audit(AuditEntry),
}

/// Project a committed event into its audit entry, if the event represents a
/// logical user action. Exactly one entry per mutating call.
pub fn audit_entry_for(event: &Event) -> Option<AuditEntry> {
    use serde_json::json;
    let entry = |at: &Ms, actor: &str, action: &str, meta: serde_json::Value| AuditEntry {
        ts: *at,
        actor: actor.to_string(),
        action: action.to_string(),
        meta: meta.to_string(),
    };
    match event {
        Event::RoomCreated { id, number, actor, at, .. } => Some(entry(
            at,
            actor,
            "ROOM_CREATE",
            json!({ "room": id.to_string(), "number": number }),
        )),
        Event::RoomUpdated { id, actor, at, .. } => Some(entry(
            at,
            actor,
            "ROOM_UPDATE",
            json!({ "room": id.to_string() }),
        )),
        Event::RoomPriceSet { id, price, actor, at } => Some(entry(
            at,
            actor,
            "ROOM_PRICE",
            json!({ "room": id.to_string(), "price": price }),
        )),
        Event::RoomMaintenanceSet { id, maintenance, actor, at } => Some(entry(
            at,
            actor,
            "ROOM_MAINTENANCE_GLOBAL",
            json!({ "room": id.to_string(), "maintenance": maintenance }),
        )),
        Event::RoomHousekeepingSet { id, status, actor, at } => Some(entry(
            at,
            actor,
            "ROOM_HOUSEKEEPING",
            json!({ "room": id.to_string(), "status": format!("{status:?}") }),
        )),
        Event::ClientCreated { id, full_name, actor, at, .. } => Some(entry(
            at,
            actor,
            "CLIENT_CREATE",
            json!({ "client": id.to_string(), "name": full_name }),
        )),
        Event::BookingCreated { id, actor, at, .. } => Some(entry(
            at,
            actor,
            "BOOKING_CREATE",
            json!({ "booking": id.to_string() }),
        )),
        Event::BookingUpdated { id, actor, at, .. } => Some(entry(
            at,
            actor,
            "BOOKING_UPDATE",
            json!({ "booking": id.to_string() }),
        )),
        Event::BookingDeleted { id, actor, at } => Some(entry(
            at,
            actor,
            "BOOKING_DELETE",
            json!({ "booking": id.to_string() }),
        )),
        Event::ExtrasSet { id, extras, actor, at } => Some(entry(
            at,
            actor,
            "BOOKING_EXTRAS",
            json!({ "booking": id.to_string(), "extras": extras }),
        )),
        Event::InvoiceAssigned { id, invoice_number, actor, at, .. } => Some(entry(
            at,
            actor,
            "BOOKING_INVOICE",
            json!({ "booking": id.to_string(), "invoice": invoice_number }),
        )),
        Event::BookingPaid { id, invoice_number, actor, at, .. } => Some(entry(
            at,
            actor,
            "BOOKING_PAID",
            json!({ "booking": id.to_string(), "invoice": invoice_number }),
        )),
        Event::BlockCreated { id, room_id, reason, actor, at, .. } => Some(entry(
            at,
            actor,
            "BLOCK_CREATE",
            json!({ "block": id.to_string(), "room": room_id.to_string(), "reason": reason }),
        )),
        Event::BlockDeleted { id, room_id, actor, at } => Some(entry(
            at,
            actor,
            "BLOCK_DELETE",
            json!({ "block": id.to_string(), "room": room_id.to_string() }),
        )),
        Event::InvoiceCounter { .. } | Event::Audit(_) => None,
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub number: String,
    pub name: String,
    pub price: f64,
    pub housekeeping: Housekeeping,
    pub maintenance: bool,
}

/// Derived money figures for one booking. Computed on read, never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookingTotals {
    pub nights: i64,
    pub room_total: f64,
    pub total: f64,
    pub remaining: f64,
}

/// Read-only snapshot handed to the external invoice-document generator.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceView {
    pub booking: Booking,
    pub client: Client,
    pub lines: Vec<InvoiceLine>,
    pub totals: BookingTotals,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceLine {
    pub room_id: Ulid,
    pub room_name: String,
    pub price_per_night: f64,
}
