use crate::model::{ReservationId, RoomId, Span};
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    RoomNotFound(RoomId),
    Conflict {
        room_id: RoomId,
        existing: ReservationId,
    },
    EmptySpan(Span),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::Conflict { room_id, existing } => {
                write!(f, "room {room_id}: conflict with reservation {existing}")
            }
            EngineError::EmptySpan(span) => {
                write!(f, "span [{}, {}) is empty", span.start, span.end)
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EngineError> for StoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::RoomNotFound(id) => StoreError::RoomNotFound(id),
            EngineError::Conflict { room_id, existing } => StoreError::Conflict { room_id, existing },
            EngineError::EmptySpan(_) => StoreError::Rejected("reservation must end after it starts"),
            EngineError::LimitExceeded(msg) => StoreError::Rejected(msg),
            EngineError::WalError(e) => StoreError::Backend(e),
        }
    }
}
