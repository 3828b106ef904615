//! Cluster manager client surface consumed by the allocator.
//!
//! The allocator never implements these RPCs; it talks to a remote cluster
//! manager through [`ClusterMgrApi`] and treats every runtime failure as
//! transient.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codemode::CodeMode;
use crate::error::Result;
use crate::volume::Vid;

/// Unique cluster identifier
pub type ClusterId = u32;

/// Config key holding the per-volume reserved tail in bytes
pub const VOLUME_RESERVE_SIZE_KEY: &str = "volume_reserve_size";
/// Config key holding the chunk size in bytes
pub const VOLUME_CHUNK_SIZE_KEY: &str = "volume_chunk_size";
/// Config key holding the JSON code-mode policy document
pub const CODE_MODE_KEY: &str = "code_mode";

/// Arguments of the volume allocation RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocVolumeArgs {
    pub is_init: bool,
    pub code_mode: CodeMode,
    pub count: usize,
}

/// One leased volume as returned by the cluster manager. `expire_at` is
/// the lease horizon in unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocVolumeInfo {
    pub vid: Vid,
    pub code_mode: CodeMode,
    pub free: u64,
    pub used: u64,
    pub total: u64,
    pub expire_at: u64,
}

/// A volume whose lease the cluster manager extended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewedVolume {
    pub vid: Vid,
    pub expire_at: u64,
}

/// Partition of a retain request: renewed leases get a fresh horizon,
/// reclaimed vids must be dropped from the pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetainVolumeRet {
    pub renewed: Vec<RenewedVolume>,
    pub reclaimed: Vec<Vid>,
}

/// Remote cluster manager operations the allocator depends on
#[async_trait]
pub trait ClusterMgrApi: Send + Sync {
    /// Look up a cluster-scoped config value by key
    async fn get_config(&self, key: &str) -> Result<String>;

    /// Lease up to `args.count` writable volumes for `args.code_mode`.
    /// A shorter-than-requested response is valid and common.
    async fn alloc_volume(&self, args: &AllocVolumeArgs) -> Result<Vec<AllocVolumeInfo>>;

    /// Renew the leases of `vids`, partitioning them into renewed and
    /// reclaimed sets.
    async fn retain_volume(&self, vids: &[Vid]) -> Result<RetainVolumeRet>;
}
