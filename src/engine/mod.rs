mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::model::*;
use crate::wal::Wal;

use conflict::check_no_conflict;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared outcome.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    let result = match append_err {
        Some(e) => Err(e),
        None => wal.flush_sync(),
    };
    // None of the batch is acknowledged, so none of it may stay in the log.
    if result.is_err()
        && let Err(e) = wal.discard_unflushed()
    {
        tracing::error!("WAL rollback after failed flush failed: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// In-process reservation store. One `RwLock` per room serializes writers for that room;
/// with a WAL attached every mutation is durable before it becomes visible.
pub struct Engine {
    pub(super) rooms: DashMap<RoomId, SharedRoomState>,
    pub(super) wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Reverse lookup: reservation id → room id
    pub(super) reservation_to_room: DashMap<ReservationId, RoomId>,
    pub(super) next_id: AtomicI64,
    /// Mutations hold this shared; compaction holds it exclusively.
    pub(super) write_gate: RwLock<()>,
}

fn apply_insert(rs: &mut RoomState, reservation: Reservation, index: &DashMap<ReservationId, RoomId>) {
    index.insert(reservation.id, reservation.room_id);
    rs.insert_reservation(reservation);
}

fn apply_cancel(rs: &mut RoomState, id: ReservationId, index: &DashMap<ReservationId, RoomId>) {
    rs.remove_reservation(id);
    index.remove(&id);
}

impl Engine {
    /// Volatile engine with no log. State is lost on drop.
    pub fn in_memory() -> Self {
        Self {
            rooms: DashMap::new(),
            wal_tx: None,
            reservation_to_room: DashMap::new(),
            next_id: AtomicI64::new(1),
            write_gate: RwLock::new(()),
        }
    }

    /// Replay the WAL at `wal_path` and keep appending to it.
    /// Must be called inside a tokio runtime: it spawns the group-commit writer.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::recover(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self::in_memory();
        engine.wal_tx = Some(wal_tx);
        engine.restore(&events);
        tracing::info!(
            "replayed {} events: {} rooms, {} reservations",
            events.len(),
            engine.rooms.len(),
            engine.reservation_to_room.len()
        );
        Ok(engine)
    }

    /// Rebuild state from a replayed event log. Rows referencing unknown rooms
    /// are skipped, as are rows that would overlap one already restored; a
    /// series is restored whole or not at all.
    fn restore(&mut self, events: &[Event]) {
        let mut rooms: HashMap<RoomId, RoomState> = HashMap::new();
        let mut next_id: ReservationId = 1;

        for event in events {
            match event {
                Event::RoomCreated { id, name } => {
                    rooms.entry(*id).or_insert_with(|| RoomState::new(*id, name.clone()));
                }
                Event::ReservationMade { reservation } => {
                    next_id = next_id.max(reservation.id + 1);
                    self.restore_rows(&mut rooms, std::slice::from_ref(reservation));
                }
                Event::SeriesMade { reservations } => {
                    for reservation in reservations {
                        next_id = next_id.max(reservation.id + 1);
                    }
                    self.restore_rows(&mut rooms, reservations);
                }
                Event::ReservationCancelled { id, room_id } => {
                    if let Some(rs) = rooms.get_mut(room_id) {
                        apply_cancel(rs, *id, &self.reservation_to_room);
                    }
                }
                Event::IdCheckpoint { next_id: checkpoint } => {
                    next_id = next_id.max(*checkpoint);
                }
            }
        }

        for (id, rs) in rooms {
            self.rooms.insert(id, Arc::new(RwLock::new(rs)));
        }
        self.next_id.store(next_id, Ordering::SeqCst);
    }

    fn restore_rows(&self, rooms: &mut HashMap<RoomId, RoomState>, rows: &[Reservation]) {
        for (i, row) in rows.iter().enumerate() {
            let Some(rs) = rooms.get(&row.room_id) else {
                tracing::warn!("replay: reservation {} names unknown room {}, skipped", row.id, row.room_id);
                return;
            };
            let earlier = rows[..i]
                .iter()
                .find(|r| r.room_id == row.room_id && r.span.overlaps(&row.span))
                .map(|r| r.id);
            let existing = match check_no_conflict(rs, &row.span) {
                Err(EngineError::Conflict { existing, .. }) => Some(existing),
                _ => earlier,
            };
            if let Some(existing) = existing {
                tracing::warn!(
                    "replay: reservation {} on room {} overlaps {existing}, skipped {} row(s)",
                    row.id,
                    row.room_id,
                    rows.len()
                );
                return;
            }
        }
        for row in rows {
            if let Some(rs) = rooms.get_mut(&row.room_id) {
                apply_insert(rs, row.clone(), &self.reservation_to_room);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer. No-op without a WAL.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_reservation(&self, id: &ReservationId) -> Option<RoomId> {
        self.reservation_to_room.get(id).map(|e| *e.value())
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    /// Reserve `count` consecutive ids. Ids burned by a failed insert are not reused.
    pub(super) fn allocate_ids(&self, count: usize) -> ReservationId {
        self.next_id.fetch_add(count as i64, Ordering::SeqCst)
    }
}
