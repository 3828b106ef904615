//! Blob-id reservation surface consumed by the allocator facade.
//!
//! Blob ids are issued in contiguous scopes by a separate BID manager;
//! the allocator only pairs scopes with a selected volume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Monotonic blob identifier, unique within a cluster
pub type Bid = u64;

/// A contiguous, inclusive reservation of blob ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidScope {
    pub start_bid: Bid,
    pub end_bid: Bid,
}

impl BidScope {
    pub fn count(&self) -> u64 {
        self.end_bid - self.start_bid + 1
    }
}

/// Issuer of blob-id scopes. Exhaustion surfaces as
/// [`ArgosyError::BidExhausted`](crate::error::ArgosyError::BidExhausted)
/// and is passed to callers unchanged.
#[async_trait]
pub trait BidMgr: Send + Sync {
    /// Reserve `count` blob ids, returned as one or more contiguous scopes.
    async fn alloc(&self, count: u64) -> Result<Vec<BidScope>>;
}
