use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};

/// Background task that cancels pending requests nobody decided on before
/// they started.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_once(&engine, now_ms()).await;
    }
}

/// One reaper pass. Returns how many requests were expired.
pub async fn reap_once(engine: &Engine, now: i64) -> usize {
    let mut expired = 0;
    for (booking_id, room_id) in engine.collect_stale_requests(now) {
        match engine.expire_request(booking_id, now).await {
            Ok(true) => {
                expired += 1;
                info!("expired request {booking_id} on room {room_id}");
            }
            Ok(false) => {}
            // May have been deleted meanwhile
            Err(e) => debug!("reaper skip {booking_id}: {e}"),
        }
    }
    expired
}

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
