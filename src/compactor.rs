use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL if at least `threshold` records were appended since the
/// last compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold || !engine.is_durable() {
        debug!("compaction skipped: {appends} appends since last compaction");
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that periodically compacts the WAL.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::wal::Wal;
    use chrono::DateTime;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn new_reservation(day: u32) -> NewReservation {
        let start = DateTime::parse_from_rfc3339(&format!("2018-08-{day:02}T10:00:00+09:00")).unwrap();
        let end = DateTime::parse_from_rfc3339(&format!("2018-08-{day:02}T11:00:00+09:00")).unwrap();
        NewReservation {
            room_id: 1,
            requester: "Ted".into(),
            span: Span::new(start, end),
            memo: None,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::open(&path).unwrap();
        engine.create_room(1, "Room A".into()).await.unwrap();

        let mut ids = Vec::new();
        for day in 1..=4 {
            ids.push(engine.make_reservation(new_reservation(day)).await.unwrap().id);
        }
        for id in &ids[..3] {
            assert!(engine.cancel_reservation(*id).await.unwrap());
        }
        // 1 room + 4 makes + 3 cancels
        assert_eq!(engine.wal_appends_since_compact().await, 8);
        assert!(!compact_if_needed(&engine, 100).await.unwrap());
        assert!(compact_if_needed(&engine, 8).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 3, "checkpoint, room, surviving reservation");
        assert!(matches!(events[0], Event::IdCheckpoint { next_id: 5 }));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn in_memory_engine_never_compacts() {
        let engine = Engine::in_memory();
        assert!(!compact_if_needed(&engine, 0).await.unwrap());
    }
}
