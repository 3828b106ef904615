//! Allocator counters and the periodic metric report

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tracing::info;

use super::VolumeMgr;

/// Operation counters in relaxed atomics; approximate under contention
/// and only ever read for reporting.
#[derive(Debug, Default)]
pub struct AllocStats {
    pub allocations: AtomicU64,
    pub alloc_failures: AtomicU64,
    pub refill_rounds: AtomicU64,
    pub refill_signals_dropped: AtomicU64,
    pub volumes_added: AtomicU64,
    pub volumes_retired: AtomicU64,
    pub volumes_discarded: AtomicU64,
    pub volumes_reclaimed: AtomicU64,
    pub retain_rounds: AtomicU64,
    pub retain_failures: AtomicU64,
}

impl VolumeMgr {
    pub(crate) async fn metric_report_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.metric_report_interval_s);
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.report_metrics();
        }
    }

    fn report_metrics(&self) {
        for (mode, mode_info) in &self.mode_infos {
            info!(
                "code mode {}: {} volumes, free {} / threshold {}",
                mode,
                mode_info.volumes.len(),
                mode_info.total_free.load(Ordering::Relaxed),
                mode_info.total_threshold
            );
        }
        let stats = &self.stats;
        info!(
            "allocations {} (failed {}), refills {} (signals dropped {}), \
             volumes added {} retired {} discarded {} reclaimed {}, \
             retains {} (failed {})",
            stats.allocations.load(Ordering::Relaxed),
            stats.alloc_failures.load(Ordering::Relaxed),
            stats.refill_rounds.load(Ordering::Relaxed),
            stats.refill_signals_dropped.load(Ordering::Relaxed),
            stats.volumes_added.load(Ordering::Relaxed),
            stats.volumes_retired.load(Ordering::Relaxed),
            stats.volumes_discarded.load(Ordering::Relaxed),
            stats.volumes_reclaimed.load(Ordering::Relaxed),
            stats.retain_rounds.load(Ordering::Relaxed),
            stats.retain_failures.load(Ordering::Relaxed),
        );
    }
}
