use crate::model::*;

use super::conflict::count_overlapping;
use super::Engine;

impl Engine {
    /// All rooms, ordered by id.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let shared: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(shared.len());
        for rs in shared {
            rooms.push(rs.read().await.room());
        }
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    /// Reservations intersecting `span` across all rooms, ordered by room id then start.
    pub async fn reservations_in_range(&self, span: &Span) -> Vec<Reservation> {
        let mut shared: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shared.sort_by_key(|(id, _)| *id);

        let mut out = Vec::new();
        for (_, rs) in shared {
            let guard = rs.read().await;
            out.extend(guard.overlapping(span).cloned());
        }
        out
    }

    /// Overlapping reservations on one room. An unknown room has none.
    pub async fn overlap_count(&self, room_id: RoomId, span: &Span) -> usize {
        let Some(rs) = self.get_room(&room_id) else {
            return 0;
        };
        let guard = rs.read().await;
        count_overlapping(&guard, span)
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Option<Reservation> {
        let room_id = self.get_room_for_reservation(&id)?;
        let rs = self.get_room(&room_id)?;
        let guard = rs.read().await;
        guard.reservations.iter().find(|r| r.id == id).cloned()
    }
}
