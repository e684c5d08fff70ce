use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::TimeOfDay;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input: inverted or out-of-hours range, bad operating hours.
    Validation(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A requested or staged slot is no longer bookable.
    Conflict {
        facility_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    },
    /// Concurrent writers kept replacing a session's cart.
    CartContention(String),
    LimitExceeded(&'static str),
    /// Commit-phase storage failure; nothing was applied.
    Transaction(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. } | EngineError::CartContention(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict {
                facility_id,
                date,
                start,
                end,
            } => write!(
                f,
                "slot {} {start}-{end} on facility {facility_id} is no longer available",
                date.format("%d/%m/%Y")
            ),
            EngineError::CartContention(session) => {
                write!(f, "cart for session {session} changed concurrently, retry")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Transaction(e) => write!(f, "transaction failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
