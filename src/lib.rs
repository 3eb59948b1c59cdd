//! innkeep — reservation engine for a small lodging property.
//!
//! Rooms, clients, bookings over half-open date ranges, maintenance blocks,
//! invoice numbering, and an audit trail, all held in memory and persisted
//! through a write-ahead log. Embed [`Engine`] behind whatever front end the
//! property runs; every mutation is durable before it returns.

pub mod engine;
pub mod invoice;
pub mod model;
pub mod observability;
pub mod wal;

pub use engine::{Engine, EngineError};
