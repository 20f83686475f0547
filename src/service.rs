//! Booking service: request validation, interval rules, and single vs. weekly
//! series orchestration over a [`Store`].
//!
//! The service keeps no mutable state of its own. Every consistency guarantee
//! (no overlapping rows per room, all-or-nothing series) comes from the store's
//! check-and-insert and transaction contract, so it is safe to share one
//! service between any number of concurrent callers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Timelike};
use tracing::{debug, info, warn};

use crate::limits::*;
use crate::model::*;
use crate::store::{Store, StoreError};

/// Days between consecutive occurrences of a repeat booking.
pub const REPEAT_INTERVAL_DAYS: i64 = 7;

/// Bookings start and end on these minute marks only.
const SLOT_MINUTES: u32 = 30;

/// Optional booking attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraInfo {
    pub memo: Option<String>,
    /// Number of weekly occurrences to book. 0 books a single slot.
    pub repeat: u32,
}

#[derive(Debug)]
pub enum BookingError {
    /// The caller's input breaks a structural rule. Never retried.
    InvalidRequest(String),
    /// The slot, or one occurrence of a series, overlaps an existing reservation.
    Unavailable { room_id: RoomId, existing: ReservationId },
    /// Persistence failed. `op` names the store operation.
    StoreFailure { op: &'static str, source: StoreError },
}

impl BookingError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::InvalidRequest(_) => "invalid_request",
            BookingError::Unavailable { .. } => "unavailable",
            BookingError::StoreFailure { .. } => "store_failure",
        }
    }

    fn invalid(msg: impl Into<String>) -> Self {
        BookingError::InvalidRequest(msg.into())
    }

    fn from_store(op: &'static str, e: StoreError) -> Self {
        match e {
            StoreError::Conflict { room_id, existing } => {
                BookingError::Unavailable { room_id, existing }
            }
            StoreError::RoomNotFound(id) => BookingError::invalid(format!("unknown room {id}")),
            StoreError::Rejected(reason) => BookingError::invalid(reason),
            source @ StoreError::Backend(_) => BookingError::StoreFailure { op, source },
        }
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            BookingError::Unavailable { room_id, existing } => write!(
                f,
                "room {room_id} is unavailable: overlaps reservation {existing}"
            ),
            BookingError::StoreFailure { op, source } => write!(f, "{op} failed: {source}"),
        }
    }
}

impl std::error::Error for BookingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BookingError::StoreFailure { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ── Interval rules ───────────────────────────────────────────────

/// Zero-length intervals are rejected: `end` must be strictly after `start`.
pub fn check_forward(start: Timestamp, end: Timestamp) -> Result<(), BookingError> {
    if end <= start {
        return Err(BookingError::invalid("end must be after start"));
    }
    Ok(())
}

/// Only strictly backwards intervals are rejected.
pub fn check_not_backwards(start: Timestamp, end: Timestamp) -> Result<(), BookingError> {
    if end < start {
        return Err(BookingError::invalid("end precedes start"));
    }
    Ok(())
}

/// Both instants must fall on the same calendar day, as seen in `start`'s offset.
pub fn check_same_day(start: Timestamp, end: Timestamp) -> Result<(), BookingError> {
    let end_local = end.with_timezone(start.offset());
    if start.date_naive() != end_local.date_naive() {
        return Err(BookingError::invalid("booking must start and end on the same day"));
    }
    Ok(())
}

/// Both instants must sit exactly on an hour or half-hour mark.
pub fn check_granularity(start: Timestamp, end: Timestamp) -> Result<(), BookingError> {
    for t in [start, end] {
        if t.minute() % SLOT_MINUTES != 0 || t.second() != 0 || t.nanosecond() != 0 {
            return Err(BookingError::invalid(format!(
                "{t} is not on a {SLOT_MINUTES}-minute boundary"
            )));
        }
    }
    Ok(())
}

fn check_requester(requester: &str) -> Result<(), BookingError> {
    if requester.trim().is_empty() {
        return Err(BookingError::invalid("requester is required"));
    }
    if requester.len() > MAX_REQUESTER_LEN {
        return Err(BookingError::invalid("requester too long"));
    }
    Ok(())
}

fn check_extra(extra: &ExtraInfo) -> Result<(), BookingError> {
    if extra.repeat > MAX_REPEAT_COUNT {
        return Err(BookingError::invalid(format!(
            "repeat count {} exceeds {MAX_REPEAT_COUNT}",
            extra.repeat
        )));
    }
    let budget = memo_budget(extra.repeat);
    if extra.memo.as_ref().is_some_and(|m| m.len() > budget) {
        return Err(BookingError::invalid(format!(
            "memo too long: at most {budget} bytes"
        )));
    }
    Ok(())
}

/// Caller memo bytes left once the longest occurrence annotation is prepended.
fn memo_budget(repeat: u32) -> usize {
    if repeat == 0 {
        return MAX_MEMO_LEN;
    }
    let annotation = occurrence_memo(repeat, repeat, None).len() + 1;
    MAX_MEMO_LEN.saturating_sub(annotation)
}

/// Memo stored on occurrence `index` (1-based) of a `total`-long series.
pub fn occurrence_memo(index: u32, total: u32, memo: Option<&str>) -> String {
    match memo {
        Some(m) if !m.is_empty() => format!("(repeat {index}/{total})\n{m}"),
        _ => format!("(repeat {index}/{total})"),
    }
}

/// Expand a request into `total` weekly occurrences, first one at `span`.
pub fn weekly_occurrences(
    room_id: RoomId,
    requester: &str,
    span: Span,
    memo: Option<&str>,
    total: u32,
) -> Vec<NewReservation> {
    (0..total)
        .map(|i| NewReservation {
            room_id,
            requester: requester.to_string(),
            span: span.shifted_days(REPEAT_INTERVAL_DAYS * i64::from(i)),
            memo: Some(occurrence_memo(i + 1, total, memo)),
        })
        .collect()
}

// ── Service ──────────────────────────────────────────────────────

pub struct BookingService<S> {
    store: Arc<S>,
}

impl<S> Clone for BookingService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> BookingService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// True iff no reservation on `room_id` overlaps `[start, end)`.
    pub async fn available(
        &self,
        room_id: RoomId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<bool, BookingError> {
        check_not_backwards(start, end)?;
        let count = self
            .store
            .count_overlapping(room_id, Span::new(start, end))
            .await
            .map_err(|e| BookingError::from_store("count_overlapping", e))?;
        Ok(count == 0)
    }

    /// Book `[start, end)` on `room_id`. With `extra.repeat > 0` books that many
    /// weekly occurrences as one all-or-nothing unit.
    ///
    /// Returns the stored reservations in occurrence order: one for a single
    /// booking, `extra.repeat` for a series.
    pub async fn make(
        &self,
        room_id: RoomId,
        requester: &str,
        start: Timestamp,
        end: Timestamp,
        extra: ExtraInfo,
    ) -> Result<Vec<Reservation>, BookingError> {
        check_forward(start, end)?;
        check_same_day(start, end)?;
        check_granularity(start, end)?;
        check_requester(requester)?;
        check_extra(&extra)?;

        let span = Span::new(start, end);
        let result = if extra.repeat > 0 {
            let attempts =
                weekly_occurrences(room_id, requester, span, extra.memo.as_deref(), extra.repeat);
            debug!("room {room_id}: booking series of {} from {start}", extra.repeat);
            self.store
                .run_in_transaction(attempts)
                .await
                .map_err(|e| BookingError::from_store("run_in_transaction", e))
        } else {
            let new = NewReservation {
                room_id,
                requester: requester.to_string(),
                span,
                memo: extra.memo,
            };
            self.store
                .insert(new)
                .await
                .map(|r| vec![r])
                .map_err(|e| BookingError::from_store("insert", e))
        };

        match &result {
            Ok(rows) => {
                metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL)
                    .increment(rows.len() as u64);
                info!("room {room_id}: {} reservation(s) made for {requester}", rows.len());
            }
            Err(BookingError::Unavailable { existing, .. }) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                info!("room {room_id}: [{start}, {end}) unavailable, overlaps {existing}");
            }
            Err(e) => warn!("room {room_id}: booking failed: {e}"),
        }
        result
    }

    /// Delete a reservation. Returns whether it existed; unknown ids are not errors.
    pub async fn cancel(&self, id: ReservationId) -> Result<bool, BookingError> {
        let existed = self
            .store
            .delete(id)
            .await
            .map_err(|e| BookingError::from_store("delete", e))?;
        if existed {
            metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
            info!("reservation {id} cancelled");
        } else {
            debug!("cancel of unknown reservation {id}");
        }
        Ok(existed)
    }

    /// Reservations intersecting `[start, end)`, grouped by room. Rooms without
    /// any intersecting reservation have no entry.
    pub async fn list(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<BTreeMap<RoomId, Vec<Reservation>>, BookingError> {
        check_not_backwards(start, end)?;
        if end == start {
            return Ok(BTreeMap::new());
        }
        if end - start > Duration::days(MAX_LIST_WINDOW_DAYS) {
            return Err(BookingError::invalid(format!(
                "list window wider than {MAX_LIST_WINDOW_DAYS} days"
            )));
        }
        let rows = self
            .store
            .list_in_range(Span::new(start, end))
            .await
            .map_err(|e| BookingError::from_store("list_in_range", e))?;

        let mut grouped: BTreeMap<RoomId, Vec<Reservation>> = BTreeMap::new();
        for r in rows {
            grouped.entry(r.room_id).or_default().push(r);
        }
        for list in grouped.values_mut() {
            list.sort_by_key(|r| r.span.start);
        }
        Ok(grouped)
    }

    pub async fn room_list(&self) -> Result<Vec<Room>, BookingError> {
        self.store
            .room_list()
            .await
            .map_err(|e| BookingError::from_store("room_list", e))
    }
}
