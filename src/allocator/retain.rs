//! Periodic lease renewal for held volumes

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::clustermgr::RetainVolumeRet;
use crate::volume::Vid;

use super::{unix_now, VolumeMgr};

const RETAIN_BATCH_SIZE: usize = 100;

impl VolumeMgr {
    pub(crate) async fn retain_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.retain_interval_s);
        let mut ticker = interval_at(Instant::now() + period, period);
        info!("retainer started, interval {:?}", period);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.retain_once().await;
        }
        info!("retainer stopped");
    }

    async fn retain_once(&self) {
        // Renew anything expiring within two intervals; one missed tick
        // must not cost a lease.
        let deadline = unix_now() + 2 * self.config.retain_interval_s;
        let mut vids: Vec<Vid> = Vec::new();
        for mode_info in self.mode_infos.values() {
            for vol in mode_info.volumes.list() {
                if vol.expires_within(deadline) {
                    vids.push(vol.vid());
                }
            }
        }
        if vids.is_empty() {
            return;
        }
        debug!("renewing {} volume leases", vids.len());
        for batch in vids.chunks(RETAIN_BATCH_SIZE) {
            let res = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                res = self.cluster_mgr.retain_volume(batch) => res,
            };
            match res {
                Ok(ret) => self.apply_retain(ret),
                Err(err) => {
                    // Next tick retries; in the meantime reclaimed volumes
                    // are simply rejected at selection.
                    self.stats.retain_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("retain volumes failed: {}", err);
                }
            }
        }
        self.stats.retain_rounds.fetch_add(1, Ordering::Relaxed);
    }

    fn apply_retain(&self, ret: RetainVolumeRet) {
        for renewed in ret.renewed {
            if let Some((_, vol)) = self.find_volume(renewed.vid) {
                vol.renew(renewed.expire_at);
            }
        }
        for vid in ret.reclaimed {
            let Some((mode_info, vol)) = self.find_volume(vid) else {
                continue;
            };
            if let Some(remaining) = vol.mark_deleted() {
                mode_info.sub_free(remaining);
                mode_info.volumes.delete(vid);
                self.stats.volumes_reclaimed.fetch_add(1, Ordering::Relaxed);
                info!("volume {} reclaimed by cluster manager", vid);
            }
        }
    }
}
