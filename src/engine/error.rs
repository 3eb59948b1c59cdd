use ulid::Ulid;

use crate::model::RoomConflict;

#[derive(Debug)]
pub enum EngineError {
    /// Referenced room/client/booking/block does not exist.
    NotFound(Ulid),
    /// Room number already in use.
    AlreadyExists(Ulid),
    /// Malformed input — nothing was written.
    Validation(&'static str),
    /// One or more requested rooms cannot take the range. Carries every
    /// failing room with its reason; no partial booking was applied.
    Unavailable(Vec<RoomConflict>),
    /// The booking changed under a concurrent writer between snapshot and
    /// lock acquisition. Safe to retry; no side effect from this attempt.
    ConcurrentUpdate(Ulid),
    /// Underlying log unreachable or failed. Fatal to this operation.
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Unavailable(conflicts) => {
                write!(f, "unavailable: ")?;
                for (i, c) in conflicts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{c}")?;
                }
                Ok(())
            }
            EngineError::ConcurrentUpdate(id) => {
                write!(f, "concurrent update on booking {id}, retry")
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
