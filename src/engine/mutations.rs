use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_new};
use super::{apply_cancel, apply_insert, Engine, EngineError, WalCommand};

impl Engine {
    /// Create a room if it does not exist yet. Returns whether it was created.
    pub async fn create_room(&self, id: RoomId, name: String) -> Result<bool, EngineError> {
        if name.len() > MAX_ROOM_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        let _gate = self.write_gate.read().await;
        if self.rooms.contains_key(&id) {
            return Ok(false);
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }

        let event = Event::RoomCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        // A concurrent create of the same id may have won while we were appending.
        self.rooms
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomState::new(id, name))));
        metrics::gauge!(crate::observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        Ok(true)
    }

    /// Atomic check-and-insert. The room's write lock is held from the overlap
    /// check until the row is durable and visible.
    pub async fn make_reservation(&self, new: NewReservation) -> Result<Reservation, EngineError> {
        validate_new(&new)?;
        let _gate = self.write_gate.read().await;
        let rs = self
            .get_room(&new.room_id)
            .ok_or(EngineError::RoomNotFound(new.room_id))?;
        let mut guard = rs.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }

        check_no_conflict(&guard, &new.span)?;

        let reservation = new.into_reservation(self.allocate_ids(1));
        let event = Event::ReservationMade {
            reservation: reservation.clone(),
        };
        self.wal_append(&event).await?;
        apply_insert(&mut guard, reservation.clone(), &self.reservation_to_room);
        debug!(
            "reservation {} on room {} [{}, {})",
            reservation.id, reservation.room_id, reservation.span.start, reservation.span.end
        );
        Ok(reservation)
    }

    /// Check-and-insert every attempt in order as one unit. If any attempt
    /// overlaps an existing row or an earlier attempt of the same batch,
    /// nothing is written. Attempts may target different rooms.
    pub async fn make_series(
        &self,
        attempts: Vec<NewReservation>,
    ) -> Result<Vec<Reservation>, EngineError> {
        if attempts.is_empty() {
            return Ok(Vec::new());
        }
        if attempts.len() > MAX_REPEAT_COUNT as usize {
            return Err(EngineError::LimitExceeded("series too long"));
        }
        for new in &attempts {
            validate_new(new)?;
        }

        let _gate = self.write_gate.read().await;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut room_ids: Vec<RoomId> = attempts.iter().map(|a| a.room_id).collect();
        room_ids.sort();
        room_ids.dedup();

        let mut guards = Vec::with_capacity(room_ids.len());
        let mut guard_index = HashMap::new();
        for rid in &room_ids {
            let rs = self.get_room(rid).ok_or(EngineError::RoomNotFound(*rid))?;
            let guard = rs.write_owned().await;
            if guard.reservations.len() + attempts.len() > MAX_RESERVATIONS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many reservations on room"));
            }
            guard_index.insert(*rid, guards.len());
            guards.push(guard);
        }

        // Phase 1: check each attempt, in order, against stored rows and the
        // attempts accepted before it.
        let first_id = self.allocate_ids(attempts.len());
        let mut accepted: Vec<Reservation> = Vec::with_capacity(attempts.len());
        for (offset, new) in attempts.into_iter().enumerate() {
            check_no_conflict(&guards[guard_index[&new.room_id]], &new.span)?;
            if let Some(earlier) = accepted
                .iter()
                .find(|r| r.room_id == new.room_id && r.span.overlaps(&new.span))
            {
                return Err(EngineError::Conflict {
                    room_id: new.room_id,
                    existing: earlier.id,
                });
            }
            accepted.push(new.into_reservation(first_id + offset as i64));
        }

        // Phase 2: one log record for the whole batch, then apply.
        let event = Event::SeriesMade {
            reservations: accepted.clone(),
        };
        self.wal_append(&event).await?;
        for reservation in &accepted {
            let guard = &mut guards[guard_index[&reservation.room_id]];
            apply_insert(guard, reservation.clone(), &self.reservation_to_room);
        }
        debug!("series of {} reservations committed", accepted.len());
        Ok(accepted)
    }

    /// Remove a reservation. Returns `false` if it did not exist.
    pub async fn cancel_reservation(&self, id: ReservationId) -> Result<bool, EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(room_id) = self.get_room_for_reservation(&id) else {
            return Ok(false);
        };
        let Some(rs) = self.get_room(&room_id) else {
            return Ok(false);
        };
        let mut guard = rs.write().await;
        // A concurrent cancel may have removed it before we got the lock.
        if !guard.contains(id) {
            return Ok(false);
        }

        let event = Event::ReservationCancelled { id, room_id };
        self.wal_append(&event).await?;
        apply_cancel(&mut guard, id, &self.reservation_to_room);
        debug!("reservation {id} on room {room_id} cancelled");
        Ok(true)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// Blocks all mutations while the snapshot is taken and swapped in.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _gate = self.write_gate.write().await;

        let mut room_ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort();

        let mut events = vec![Event::IdCheckpoint {
            next_id: self.next_id.load(std::sync::atomic::Ordering::SeqCst),
        }];
        for rid in room_ids {
            let Some(rs) = self.get_room(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for reservation in &guard.reservations {
                events.push(Event::ReservationMade {
                    reservation: reservation.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
