//! Argosy: volume and blob-id allocation for a distributed blob-store proxy.
//!
//! The proxy sits between writers and the cluster manager. Writers ask it
//! for a writable volume plus a range of blob ids; the allocator serves
//! both from in-memory pools and refills the pools in the background so
//! the write path never waits on the cluster manager. All allocator state
//! is a rebuildable cache; nothing is persisted locally.

pub mod allocator;
pub mod bid;
pub mod clustermgr;
pub mod codemode;
pub mod error;
pub mod retry;
pub mod volume;

pub use allocator::{AllocRet, AllocStats, AllocVolsArgs, VolConfig, VolumeMgr};
pub use codemode::CodeMode;
pub use error::{ArgosyError, Result};
pub use volume::Vid;
