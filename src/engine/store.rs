use async_trait::async_trait;

use crate::model::*;
use crate::store::{Store, StoreError};

use super::Engine;

#[async_trait]
impl Store for Engine {
    async fn room_list(&self) -> Result<Vec<Room>, StoreError> {
        Ok(self.list_rooms().await)
    }

    async fn list_in_range(&self, span: Span) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.reservations_in_range(&span).await)
    }

    async fn count_overlapping(&self, room_id: RoomId, span: Span) -> Result<usize, StoreError> {
        Ok(self.overlap_count(room_id, &span).await)
    }

    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        Ok(self.make_reservation(new).await?)
    }

    async fn run_in_transaction(
        &self,
        attempts: Vec<NewReservation>,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.make_series(attempts).await?)
    }

    async fn delete(&self, id: ReservationId) -> Result<bool, StoreError> {
        Ok(self.cancel_reservation(id).await?)
    }
}
