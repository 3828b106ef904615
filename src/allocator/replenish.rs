//! Background refill workers, one per enabled code mode.
//!
//! A worker owns its mode's mailbox. Every request is filled completely
//! before the worker goes back to waiting: partial cluster manager
//! responses shrink the request and retry, RPC failures pause the round.
//! Writers never block on any of this.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clustermgr::{AllocVolumeArgs, AllocVolumeInfo};
use crate::codemode::CodeMode;
use crate::error::{ArgosyError, Result};
use crate::retry::RetryPolicy;
use crate::volume::VolumeEntry;

use super::{AllocArgs, VolumeMgr};

/// Pause between refill rounds after a cluster manager failure
const ALLOC_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// In-call retry budget before a round counts as failed
const ALLOC_RETRY_ATTEMPTS: usize = 2;
const ALLOC_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

impl VolumeMgr {
    pub(crate) async fn replenish_loop(
        self: Arc<Self>,
        code_mode: CodeMode,
        mut alloc_rx: mpsc::Receiver<AllocArgs>,
    ) {
        info!("replenisher for code mode {} started", code_mode);
        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                msg = alloc_rx.recv() => match msg {
                    Some(request) => request,
                    None => break,
                },
            };
            self.fill_request(request).await;
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        info!("replenisher for code mode {} stopped", code_mode);
    }

    async fn fill_request(&self, request: AllocArgs) {
        let Some(mode_info) = self.mode_infos.get(&request.code_mode) else {
            warn!("refill request for unknown code mode {}", request.code_mode);
            return;
        };
        let mut is_init = request.is_init;
        let mut remaining = request.count;
        loop {
            let args = AllocVolumeArgs {
                is_init,
                code_mode: request.code_mode,
                count: remaining,
            };
            debug!(
                "requesting {} volumes for code mode {}",
                remaining, request.code_mode
            );
            let vols = match self.alloc_volume(&args).await {
                Ok(vols) => vols,
                Err(ArgosyError::Canceled) => return,
                Err(err) => {
                    warn!(
                        "alloc volume for code mode {} failed: {}",
                        request.code_mode, err
                    );
                    is_init = false;
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(ALLOC_RETRY_INTERVAL) => {}
                    }
                    continue;
                }
            };
            let got = vols.len();
            for info in vols {
                mode_info.add_free(info.free);
                mode_info.volumes.put(Arc::new(VolumeEntry::new(info)));
                self.stats.volumes_added.fetch_add(1, Ordering::Relaxed);
            }
            if got < remaining {
                warn!(
                    "cluster manager returned {} of {} volumes for code mode {}",
                    got, remaining, request.code_mode
                );
                remaining -= got;
                is_init = false;
                continue;
            }
            break;
        }
        self.stats.refill_rounds.fetch_add(1, Ordering::Relaxed);

        // Keep refilling until the pool clears its threshold instead of
        // waiting for the next writer to trip it.
        if mode_info.total_free.load(Ordering::Relaxed) < mode_info.total_threshold {
            self.alloc_notify(request.code_mode, self.config.default_alloc_vols_num);
        }
    }

    /// One cluster manager allocation call with a short bounded retry,
    /// raced against shutdown. An empty response counts as transient: the
    /// manager had no volume to hand out yet.
    async fn alloc_volume(&self, args: &AllocVolumeArgs) -> Result<Vec<AllocVolumeInfo>> {
        let mut retry =
            RetryPolicy::exponential(ALLOC_RETRY_ATTEMPTS, ALLOC_RETRY_BASE_DELAY).handle();
        loop {
            let res = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ArgosyError::Canceled),
                res = self.cluster_mgr.alloc_volume(args) => res,
            };
            let err = match res {
                Ok(vols) if !vols.is_empty() => return Ok(vols),
                Ok(_) => ArgosyError::ClusterMgr("empty allocation response".into()),
                Err(err) => err,
            };
            match retry.next_delay() {
                Some(delay) => {
                    debug!("retrying volume allocation in {:?}: {}", delay, err);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            }
        }
    }
}
