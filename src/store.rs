//! The persistence contract the booking service depends on.
//!
//! Implementations must make `insert` an atomic check-and-insert: no other
//! writer for the same room may slip between the overlap check and the row
//! insertion. `run_in_transaction` extends that to an ordered batch that is
//! committed whole or not at all.

use async_trait::async_trait;

use crate::model::*;

#[async_trait]
pub trait Store: Send + Sync {
    async fn room_list(&self) -> Result<Vec<Room>, StoreError>;

    /// Reservations intersecting `span`, ordered by room then start.
    async fn list_in_range(&self, span: Span) -> Result<Vec<Reservation>, StoreError>;

    /// Number of reservations on `room_id` overlapping `span` under the half-open rule.
    async fn count_overlapping(&self, room_id: RoomId, span: Span) -> Result<usize, StoreError>;

    /// Check-and-insert. Fails with `StoreError::Conflict` if any reservation overlaps.
    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError>;

    /// Check-and-insert each attempt in order inside one transaction.
    /// Any conflict rolls back every earlier insert of the batch.
    async fn run_in_transaction(
        &self,
        attempts: Vec<NewReservation>,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Returns whether a row existed. Deleting an unknown id is not an error.
    async fn delete(&self, id: ReservationId) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Conflict {
        room_id: RoomId,
        existing: ReservationId,
    },
    RoomNotFound(RoomId),
    Rejected(&'static str),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict { room_id, existing } => {
                write!(f, "room {room_id} conflicts with reservation {existing}")
            }
            StoreError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            StoreError::Rejected(reason) => write!(f, "rejected by store: {reason}"),
            StoreError::Backend(e) => write!(f, "store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
