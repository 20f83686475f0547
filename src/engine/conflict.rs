use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Structural checks every stored row must pass, independent of other rows.
pub(crate) fn validate_new(new: &NewReservation) -> Result<(), EngineError> {
    if new.span.is_empty() {
        return Err(EngineError::EmptySpan(new.span));
    }
    if new.requester.len() > MAX_REQUESTER_LEN {
        return Err(EngineError::LimitExceeded("requester too long"));
    }
    if new.memo.as_ref().is_some_and(|m| m.len() > MAX_MEMO_LEN) {
        return Err(EngineError::LimitExceeded("memo too long"));
    }
    Ok(())
}

pub(crate) fn count_overlapping(rs: &RoomState, span: &Span) -> usize {
    rs.overlapping(span).count()
}

pub(crate) fn check_no_conflict(rs: &RoomState, span: &Span) -> Result<(), EngineError> {
    match rs.overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict {
            room_id: rs.id,
            existing: existing.id,
        }),
        None => Ok(()),
    }
}
