//! Volume allocation for the proxy write path.
//!
//! A [`VolumeMgr`] keeps one pool of leased, writable volumes per enabled
//! code mode and hands out `(bid scope, vid)` pairs to writers. Pools are
//! refilled asynchronously from the cluster manager by one replenisher
//! worker per mode; a retainer task keeps the leases alive. Nothing here is
//! persisted: the whole structure is rebuilt from the cluster manager on
//! restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bid::{Bid, BidMgr};
use crate::clustermgr::{
    ClusterId, ClusterMgrApi, AllocVolumeInfo, CODE_MODE_KEY, VOLUME_CHUNK_SIZE_KEY,
    VOLUME_RESERVE_SIZE_KEY,
};
use crate::codemode::{CodeMode, CodeModePolicy};
use crate::error::{ArgosyError, Result};
use crate::volume::{DebitResult, Vid, VolumeEntry, VolumeSet};

mod metrics;
mod replenish;
mod retain;

pub use metrics::AllocStats;

const DEFAULT_RETAIN_INTERVAL_S: u64 = 40;
const DEFAULT_ALLOC_VOLS_NUM: usize = 1;
const DEFAULT_INIT_VOLUME_NUM: usize = 4;
const DEFAULT_TOTAL_THRESHOLD_RATIO: f64 = 0.6;
const DEFAULT_METRIC_INTERVAL_S: u64 = 60;

/// Allocator configuration. Zero or missing values fall back to defaults
/// at construction; `volume_reserve_size` is never configured locally, it
/// is fetched from the cluster manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolConfig {
    pub cluster_id: ClusterId,
    pub idc: String,
    #[serde(default)]
    pub retain_interval_s: u64,
    #[serde(default)]
    pub default_alloc_vols_num: usize,
    #[serde(default)]
    pub init_volume_num: usize,
    #[serde(default)]
    pub total_threshold_ratio: f64,
    #[serde(default)]
    pub metric_report_interval_s: u64,
    #[serde(skip)]
    pub volume_reserve_size: u64,
}

impl Default for VolConfig {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            idc: String::new(),
            retain_interval_s: DEFAULT_RETAIN_INTERVAL_S,
            default_alloc_vols_num: DEFAULT_ALLOC_VOLS_NUM,
            init_volume_num: DEFAULT_INIT_VOLUME_NUM,
            total_threshold_ratio: DEFAULT_TOTAL_THRESHOLD_RATIO,
            metric_report_interval_s: DEFAULT_METRIC_INTERVAL_S,
            volume_reserve_size: 0,
        }
    }
}

impl VolConfig {
    fn check(&mut self) {
        if self.retain_interval_s == 0 {
            self.retain_interval_s = DEFAULT_RETAIN_INTERVAL_S;
        }
        if self.default_alloc_vols_num == 0 {
            self.default_alloc_vols_num = DEFAULT_ALLOC_VOLS_NUM;
        }
        if self.init_volume_num == 0 {
            self.init_volume_num = DEFAULT_INIT_VOLUME_NUM;
        }
        if self.total_threshold_ratio <= 0.0 {
            self.total_threshold_ratio = DEFAULT_TOTAL_THRESHOLD_RATIO;
        }
        if self.metric_report_interval_s == 0 {
            self.metric_report_interval_s = DEFAULT_METRIC_INTERVAL_S;
        }
    }
}

/// Allocation request for the writer-facing facade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocVolsArgs {
    pub code_mode: CodeMode,
    /// Bytes to debit from the selected volume
    pub fsize: u64,
    /// Blob ids to reserve alongside the volume
    pub bid_count: u64,
    /// Vids the caller refuses (e.g. it just failed writing to them)
    pub excludes: Vec<Vid>,
    /// Vids the caller observed broken; dropped from the pool before
    /// selection
    pub discards: Vec<Vid>,
}

/// One allocation result: a contiguous bid scope bound to a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRet {
    pub bid_start: Bid,
    pub bid_end: Bid,
    pub vid: Vid,
}

/// Refill request consumed by a mode's replenisher worker
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocArgs {
    pub is_init: bool,
    pub code_mode: CodeMode,
    pub count: usize,
}

/// Per-code-mode aggregate: the volume pool, an advisory free-space gauge
/// and the capacity-one refill mailbox.
pub(crate) struct ModeInfo {
    pub volumes: VolumeSet,
    /// Approximate sum of `free` over live entries. Only the refill
    /// trigger reads it; admission is decided per entry under its lock.
    pub total_free: AtomicU64,
    pub total_threshold: u64,
    pub alloc_tx: mpsc::Sender<AllocArgs>,
}

impl ModeInfo {
    pub fn add_free(&self, n: u64) {
        self.total_free.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtract with saturation: a racing over-subtract must not wrap the
    /// gauge into a huge value that suppresses refills. Returns the new
    /// value.
    pub fn sub_free(&self, n: u64) -> u64 {
        let mut cur = self.total_free.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(n);
            match self.total_free.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl std::fmt::Debug for VolumeMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMgr")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Writable-volume allocator for one IDC of one cluster
pub struct VolumeMgr {
    config: VolConfig,
    cluster_mgr: Arc<dyn ClusterMgrApi>,
    bid_mgr: Arc<dyn BidMgr>,
    /// Read-only after construction; modes are never added at runtime
    mode_infos: HashMap<CodeMode, Arc<ModeInfo>>,
    /// Round-robin cursor shared by all modes, randomly seeded
    pre_idx: AtomicU64,
    stats: Arc<AllocStats>,
    closed: AtomicBool,
    /// Canceled exactly once by `close`; every background loop and every
    /// in-flight cluster manager call selects on it.
    shutdown: CancellationToken,
    /// Background worker handles, drained by `close`
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VolumeMgr {
    /// Build the allocator from cluster manager configuration, post each
    /// mode's warm-up request and start the background workers. Fails only
    /// on misconfiguration or cancellation; an unreachable cluster manager
    /// at runtime is absorbed by the replenishers.
    pub async fn new(
        mut config: VolConfig,
        cluster_mgr: Arc<dyn ClusterMgrApi>,
        bid_mgr: Arc<dyn BidMgr>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        config.check();

        let reserve_raw =
            fetch_config(cluster_mgr.as_ref(), cancel, VOLUME_RESERVE_SIZE_KEY).await?;
        config.volume_reserve_size = reserve_raw.trim().parse().map_err(|err| {
            ArgosyError::Config(format!(
                "parse {} {:?}: {}",
                VOLUME_RESERVE_SIZE_KEY, reserve_raw, err
            ))
        })?;

        let chunk_raw = fetch_config(cluster_mgr.as_ref(), cancel, VOLUME_CHUNK_SIZE_KEY).await?;
        let chunk_size: u64 = chunk_raw.trim().parse().map_err(|err| {
            ArgosyError::Config(format!(
                "parse {} {:?}: {}",
                VOLUME_CHUNK_SIZE_KEY, chunk_raw, err
            ))
        })?;

        let policy_raw = fetch_config(cluster_mgr.as_ref(), cancel, CODE_MODE_KEY).await?;
        let policies: Vec<CodeModePolicy> =
            serde_json::from_str(&policy_raw).map_err(|err| {
                ArgosyError::Config(format!("parse {} policy: {}", CODE_MODE_KEY, err))
            })?;

        let mut mode_infos = HashMap::new();
        let mut mailboxes = Vec::new();
        for policy in policies {
            if !policy.enable {
                continue;
            }
            let mode = policy.mode_name;
            let tactic = mode.tactic();
            let threshold = (config.init_volume_num as u64 * tactic.n as u64 * chunk_size)
                as f64
                * config.total_threshold_ratio;
            // Capacity one: the warm-up send below must buffer before the
            // worker is scheduled, and later refill signals coalesce.
            let (alloc_tx, alloc_rx) = mpsc::channel(1);
            mode_infos.insert(
                mode,
                Arc::new(ModeInfo {
                    volumes: VolumeSet::new(),
                    total_free: AtomicU64::new(0),
                    total_threshold: threshold as u64,
                    alloc_tx,
                }),
            );
            mailboxes.push((mode, alloc_rx));
            info!(
                "code mode {} enabled, init volume num {}, threshold {}",
                mode, config.init_volume_num, threshold as u64
            );
        }

        let mgr = Arc::new(Self {
            config,
            cluster_mgr,
            bid_mgr,
            mode_infos,
            pre_idx: AtomicU64::new(thread_rng().gen()),
            stats: Arc::new(AllocStats::default()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        for (mode, alloc_rx) in mailboxes {
            let warmup = AllocArgs {
                is_init: true,
                code_mode: mode,
                count: mgr.config.init_volume_num,
            };
            // The mailbox is empty at this point, so the send cannot fail.
            if let Some(mode_info) = mgr.mode_infos.get(&mode) {
                if mode_info.alloc_tx.try_send(warmup).is_err() {
                    warn!("warm-up request for code mode {} dropped", mode);
                }
            }
            tasks.push(tokio::spawn(
                Arc::clone(&mgr).replenish_loop(mode, alloc_rx),
            ));
        }
        tasks.push(tokio::spawn(Arc::clone(&mgr).retain_loop()));
        tasks.push(tokio::spawn(Arc::clone(&mgr).metric_report_loop()));
        *mgr.tasks.lock() = tasks;

        Ok(mgr)
    }

    /// Reserve `bid_count` blob ids and bind every returned scope to one
    /// selected volume. BID manager errors surface unchanged; selection
    /// failure surfaces as `NoAvailableVolume` after signaling a refill.
    /// Canceling `cancel` aborts the call at the BID round-trip; selection
    /// itself never waits on I/O.
    pub async fn alloc(
        &self,
        args: &AllocVolsArgs,
        cancel: &CancellationToken,
    ) -> Result<Vec<AllocRet>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ArgosyError::Closed);
        }
        let bid_scopes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ArgosyError::Canceled),
            res = self.bid_mgr.alloc(args.bid_count) => res?,
        };
        let vid = self.alloc_vid(args)?;
        Ok(bid_scopes
            .iter()
            .map(|scope| AllocRet {
                bid_start: scope.start_bid,
                bid_end: scope.end_bid,
                vid,
            })
            .collect())
    }

    /// Snapshot the live volumes of one code mode
    pub fn list(
        &self,
        code_mode: CodeMode,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Vid>, Vec<AllocVolumeInfo>)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ArgosyError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(ArgosyError::Canceled);
        }
        let mode_info = self
            .mode_infos
            .get(&code_mode)
            .ok_or(ArgosyError::NoAvailableVolume)?;
        let vols = mode_info.volumes.list();
        let mut vids = Vec::with_capacity(vols.len());
        let mut infos = Vec::with_capacity(vols.len());
        for vol in vols {
            // An entry can be tombstoned between the snapshot and this read.
            if let Some(info) = vol.info() {
                vids.push(info.vid);
                infos.push(info);
            }
        }
        debug!("code mode {} has {} available volumes", code_mode, vids.len());
        Ok((vids, infos))
    }

    /// Stop all background workers and fail subsequent operations with
    /// `Closed`. In-flight allocations complete with whatever they hold.
    /// Returns the worker handles so callers can await full termination;
    /// repeated calls return an empty list.
    pub fn close(&self) -> Vec<JoinHandle<()>> {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.shutdown.cancel();
            info!("volume manager closed");
        }
        std::mem::take(&mut *self.tasks.lock())
    }

    /// Operation counters for the metric reporter and tests
    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    /// Advisory free-space gauge of one mode, if it is enabled
    pub fn mode_free(&self, code_mode: CodeMode) -> Option<u64> {
        self.mode_infos
            .get(&code_mode)
            .map(|info| info.total_free.load(Ordering::Relaxed))
    }

    /// Refill threshold of one mode, if it is enabled
    pub fn mode_threshold(&self, code_mode: CodeMode) -> Option<u64> {
        self.mode_infos.get(&code_mode).map(|info| info.total_threshold)
    }

    fn alloc_vid(&self, args: &AllocVolsArgs) -> Result<Vid> {
        let Some(mode_info) = self.mode_infos.get(&args.code_mode) else {
            return Err(ArgosyError::NoAvailableVolume);
        };
        self.apply_discards(mode_info, &args.discards);

        let vols = mode_info.volumes.list();
        let picked = if vols.is_empty() {
            None
        } else {
            self.next_vid(mode_info, &vols, args)
        };
        let Some(vid) = picked else {
            self.stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
            self.alloc_notify(args.code_mode, self.config.default_alloc_vols_num);
            return Err(ArgosyError::NoAvailableVolume);
        };

        let total_free = mode_info.sub_free(args.fsize);
        if total_free < mode_info.total_threshold {
            debug!(
                "code mode {} free {} below threshold {}",
                args.code_mode, total_free, mode_info.total_threshold
            );
            self.alloc_notify(args.code_mode, self.config.default_alloc_vols_num);
        }
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(vid)
    }

    /// Tombstone and drop every discarded vid. Repeats are no-ops: only
    /// the first tombstoning drains the entry's free space from the gauge.
    fn apply_discards(&self, mode_info: &ModeInfo, discards: &[Vid]) {
        for &vid in discards {
            let Some(vol) = mode_info.volumes.get(vid) else {
                continue;
            };
            if let Some(remaining) = vol.mark_deleted() {
                mode_info.sub_free(remaining);
                mode_info.volumes.delete(vid);
                self.stats.volumes_discarded.fetch_add(1, Ordering::Relaxed);
                info!("volume {} discarded by caller", vid);
            }
        }
    }

    /// Round-robin walk over the snapshot starting at the shared cursor.
    /// Each candidate is revalidated under its own lock, so stale
    /// snapshots are harmless.
    fn next_vid(
        &self,
        mode_info: &ModeInfo,
        vols: &[Arc<VolumeEntry>],
        args: &AllocVolsArgs,
    ) -> Option<Vid> {
        let start = (self.pre_idx.fetch_add(1, Ordering::Relaxed) % vols.len() as u64) as usize;
        for i in 0..vols.len() {
            let vol = &vols[(start + i) % vols.len()];
            if args.excludes.contains(&vol.vid()) {
                continue;
            }
            match vol.try_alloc(args.fsize, self.config.volume_reserve_size) {
                DebitResult::Rejected => continue,
                DebitResult::Debited => return Some(vol.vid()),
                DebitResult::Retired { remaining_free } => {
                    // Entry lock already released; safe to touch the set.
                    mode_info.sub_free(remaining_free);
                    mode_info.volumes.delete(vol.vid());
                    self.stats.volumes_retired.fetch_add(1, Ordering::Relaxed);
                    info!("volume {} is full, removed from pool", vol.vid());
                    return Some(vol.vid());
                }
            }
        }
        None
    }

    /// Post a refill request without blocking. A full mailbox means a
    /// refill is already in flight and the signal coalesces into it.
    /// Signaling an unknown mode is a logged no-op.
    pub(crate) fn alloc_notify(&self, code_mode: CodeMode, count: usize) {
        let Some(mode_info) = self.mode_infos.get(&code_mode) else {
            warn!("refill signal for unknown code mode {}", code_mode);
            return;
        };
        let request = AllocArgs {
            is_init: false,
            code_mode,
            count,
        };
        match mode_info.alloc_tx.try_send(request) {
            Ok(()) => debug!("refill signaled for code mode {}, count {}", code_mode, count),
            Err(_) => {
                self.stats
                    .refill_signals_dropped
                    .fetch_add(1, Ordering::Relaxed);
                debug!("code mode {} is already allocating volumes", code_mode);
            }
        }
    }

    pub(crate) fn find_volume(&self, vid: Vid) -> Option<(&Arc<ModeInfo>, Arc<VolumeEntry>)> {
        for mode_info in self.mode_infos.values() {
            if let Some(vol) = mode_info.volumes.get(vid) {
                return Some((mode_info, vol));
            }
        }
        None
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One cluster-manager config lookup raced against the caller's token.
/// Lookup failures at this stage are fatal misconfiguration.
async fn fetch_config(
    cluster_mgr: &dyn ClusterMgrApi,
    cancel: &CancellationToken,
    key: &str,
) -> Result<String> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ArgosyError::Canceled),
        res = cluster_mgr.get_config(key) => {
            res.map_err(|err| ArgosyError::Config(format!("fetch {}: {}", key, err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_zero_values_fall_back_to_defaults() {
        let mut config = VolConfig {
            cluster_id: 1,
            idc: "z0".to_string(),
            retain_interval_s: 0,
            default_alloc_vols_num: 0,
            init_volume_num: 0,
            total_threshold_ratio: 0.0,
            metric_report_interval_s: 0,
            volume_reserve_size: 0,
        };
        config.check();
        assert_eq!(config.retain_interval_s, DEFAULT_RETAIN_INTERVAL_S);
        assert_eq!(config.default_alloc_vols_num, DEFAULT_ALLOC_VOLS_NUM);
        assert_eq!(config.init_volume_num, DEFAULT_INIT_VOLUME_NUM);
        assert_eq!(config.total_threshold_ratio, DEFAULT_TOTAL_THRESHOLD_RATIO);
        assert_eq!(config.metric_report_interval_s, DEFAULT_METRIC_INTERVAL_S);
    }

    #[test]
    fn test_config_explicit_values_are_kept() {
        let mut config = VolConfig {
            retain_interval_s: 7,
            init_volume_num: 9,
            ..VolConfig::default()
        };
        config.check();
        assert_eq!(config.retain_interval_s, 7);
        assert_eq!(config.init_volume_num, 9);
    }

    #[test]
    fn test_mode_info_gauge_saturates() {
        let (alloc_tx, _alloc_rx) = mpsc::channel(1);
        let mode_info = ModeInfo {
            volumes: VolumeSet::new(),
            total_free: AtomicU64::new(0),
            total_threshold: 100,
            alloc_tx,
        };
        mode_info.add_free(50);
        assert_eq!(mode_info.sub_free(20), 30);
        // over-subtract saturates at zero instead of wrapping
        assert_eq!(mode_info.sub_free(80), 0);
        assert_eq!(mode_info.total_free.load(Ordering::Relaxed), 0);
    }
}
