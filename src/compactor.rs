use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL once more than `threshold` events have been appended
/// since the last compaction. Returns whether it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compaction not due: {appends}/{threshold} appends");
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Per-tenant background task; runs until the process exits.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
        let rid = Ulid::new();
        engine
            .create_resource(rid, None, OperatingHours::new(480, 1320).unwrap(), SlotStep::default(), None)
            .await
            .unwrap();
        assert!(!compact_if_due(&engine, 3).await.unwrap());

        let date = chrono::NaiveDate::from_ymd_opt(2099, 2, 2).unwrap();
        for start in [600, 720] {
            engine
                .create_reservation(NewReservation {
                    id: Ulid::new(),
                    resource_id: rid,
                    date,
                    start,
                    duration: 60,
                    customer: CustomerInfo::default(),
                })
                .await
                .unwrap();
        }
        assert!(compact_if_due(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.list_active(rid, Some(date)).await.unwrap().len(), 2);
    }
}
