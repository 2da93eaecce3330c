use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::{MINUTE_MS, Ms};
use crate::util::now_ms;

const REMINDER_SWEEP: Duration = Duration::from_secs(60);
const COMPACT_CHECK: Duration = Duration::from_secs(30);

/// Background task that records reminders for appointments starting
/// within `lead_minutes`.
pub async fn run_reminders(engine: Arc<Engine>, lead_minutes: i64) {
    let lead: Ms = lead_minutes.saturating_mul(MINUTE_MS);
    let mut interval = tokio::time::interval(REMINDER_SWEEP);
    loop {
        interval.tick().await;
        let sent = engine.send_due_reminders(now_ms(), lead).await;
        if sent > 0 {
            info!("recorded {sent} appointment reminders");
            metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL).increment(sent as u64);
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK);
    loop {
        interval.tick().await;
        if !should_compact(engine.wal_appends_since_compact().await, threshold) {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

fn should_compact(appends: u64, threshold: u64) -> bool {
    threshold > 0 && appends >= threshold
}
