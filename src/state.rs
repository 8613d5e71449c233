//! Process wide counters shared by every connection and tunnel.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

#[derive(Debug, Default)]
pub struct Statistics {
    bytes_relayed: AtomicU64,
    tunnels_established: AtomicU64,
    open_tunnels: AtomicUsize,
}

impl Statistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds the outcome of one relay direction to the running total.
    pub fn record_transfer(&self, bytes: u64) {
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    pub fn tunnels_established(&self) -> u64 {
        self.tunnels_established.load(Ordering::Relaxed)
    }

    pub fn open_tunnels(&self) -> usize {
        self.open_tunnels.load(Ordering::Relaxed)
    }

    /// Counts a new tunnel. It stays open until the returned guard and all of
    /// its clones are dropped.
    pub fn open_tunnel(self: &Arc<Self>) -> Arc<TunnelGuard> {
        self.tunnels_established.fetch_add(1, Ordering::Relaxed);
        self.open_tunnels.fetch_add(1, Ordering::Relaxed);
        Arc::new(TunnelGuard {
            stats: self.clone(),
        })
    }
}

/// Decrements the open tunnel count on drop. Shared by the two relay tasks of
/// one tunnel.
#[derive(Debug)]
pub struct TunnelGuard {
    stats: Arc<Statistics>,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.stats.open_tunnels.fetch_sub(1, Ordering::Relaxed);
    }
}
