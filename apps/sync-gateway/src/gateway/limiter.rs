//! Per-source-address connect rate limiting.
//!
//! State lives entirely in the shared counter store (Redis in production),
//! so every gateway process enforces the same window without coordination.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SyncError;
use crate::stores::CounterStore;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Over the threshold; the connection must be scheduled for a forced
    /// close after one yield so a pending frame can still flush.
    RateLimited { count: u64 },
}

pub struct ConnectLimiter {
    counters: Arc<dyn CounterStore>,
    limit: u64,
    window: Duration,
}

impl ConnectLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, limit: u64, window: Duration) -> Self {
        Self {
            counters,
            limit,
            window,
        }
    }

    /// Count one connect attempt from `addr`. The first increment of a
    /// window also arms the window's expiry.
    pub async fn check(&self, addr: IpAddr) -> Result<Admission, SyncError> {
        let key = format!("connect-count:{addr}");
        let count = self.counters.increment(&key).await?;
        if count == 1 {
            self.counters.expire(&key, self.window).await?;
        }
        if count > self.limit {
            tracing::warn!(%addr, count, limit = self.limit, "connect rate limit exceeded");
            Ok(Admission::RateLimited { count })
        } else {
            Ok(Admission::Allowed)
        }
    }
}
