use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};

/// Timezone-aware instant. Ordering and equality compare the instant, not the offset.
pub type Timestamp = DateTime<FixedOffset>;

pub type RoomId = i64;
pub type ReservationId = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.end > other.start && self.start < other.end
    }

    /// The same interval shifted forward by whole days.
    pub fn shifted_days(&self, days: i64) -> Span {
        let by = Duration::days(days);
        Span {
            start: self.start + by,
            end: self.end + by,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
}

/// A persisted booking. Created by a successful booking, removed by cancellation, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub room_id: RoomId,
    pub requester: String,
    pub span: Span,
    pub memo: Option<String>,
}

/// An insert attempt; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub room_id: RoomId,
    pub requester: String,
    pub span: Span,
    pub memo: Option<String>,
}

impl NewReservation {
    pub fn into_reservation(self, id: ReservationId) -> Reservation {
        Reservation {
            id,
            room_id: self.room_id,
            requester: self.requester,
            span: self.span,
            memo: self.memo,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: RoomId,
    pub name: String,
    /// Sorted by `span.start`. Never overlapping.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(id: RoomId, name: String) -> Self {
        Self {
            id,
            name,
            reservations: Vec::new(),
        }
    }

    pub fn room(&self) -> Room {
        Room {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn contains(&self, id: ReservationId) -> bool {
        self.reservations.iter().any(|r| r.id == id)
    }

    /// Reservations whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        let start = query.start;
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > start)
    }
}

/// The log record format. A series is one record so replay never sees half of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: RoomId,
        name: String,
    },
    ReservationMade {
        reservation: Reservation,
    },
    SeriesMade {
        reservations: Vec<Reservation>,
    },
    ReservationCancelled {
        id: ReservationId,
        room_id: RoomId,
    },
    /// Written first by compaction so ids of dropped rows are never handed out again.
    IdCheckpoint {
        next_id: ReservationId,
    },
}
