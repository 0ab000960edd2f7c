//! Scheduled cleanup of expired refresh tokens and ledger entries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::ledger::ReplayLedger;
use crate::rate_limit::RateLimitConfig;
use crate::session::SessionRotator;

/// Interval between cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); // 1 hour

/// Everything the cleanup pass touches.
#[derive(Clone)]
pub struct CleanupTargets {
    pub rotator: SessionRotator,
    pub ledger: ReplayLedger,
    pub rate_limits: Arc<RateLimitConfig>,
}

/// Run all cleanup tasks once.
pub async fn run_cleanup(targets: &CleanupTargets) {
    match targets.rotator.sweep_expired().await {
        Ok(count) if count > 0 => info!("Cleaned up {} expired refresh tokens", count),
        Ok(_) => {}
        Err(e) => error!("Failed to clean up expired refresh tokens: {}", e),
    }

    match targets.ledger.purge_expired().await {
        Ok(count) if count > 0 => info!("Cleaned up {} expired ledger entries", count),
        Ok(_) => {}
        Err(e) => error!("Failed to clean up ledger entries: {}", e),
    }

    targets.rate_limits.retain_recent();
}

/// Spawn a background task that runs cleanup periodically.
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_scheduler(targets: CleanupTargets) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        // The first tick completes immediately; startup already ran a pass
        interval.tick().await;

        loop {
            interval.tick().await;
            run_cleanup(&targets).await;
        }
    })
}
