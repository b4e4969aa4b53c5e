use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-engine forwarding counters.
///
/// Plain atomics so the engine stays lock-free and instantiable many times
/// per process; exporting them is the embedding server's concern.
#[derive(Default)]
pub struct ForwarderMetrics {
    requests_total: AtomicU64,
    websocket_upgrades_total: AtomicU64,
    upstream_errors_total: AtomicU64,
    open_tunnels: AtomicU64,
}

impl ForwarderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_upgrades(&self) {
        self.websocket_upgrades_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_upstream_errors(&self) {
        self.upstream_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_open_tunnels(&self) {
        self.open_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement_open_tunnels(&self) {
        if self.open_tunnels.load(Ordering::Relaxed) > 0 {
            self.open_tunnels.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn websocket_upgrades_total(&self) -> u64 {
        self.websocket_upgrades_total.load(Ordering::Relaxed)
    }

    pub fn upstream_errors_total(&self) -> u64 {
        self.upstream_errors_total.load(Ordering::Relaxed)
    }

    pub fn open_tunnels(&self) -> u64 {
        self.open_tunnels.load(Ordering::Relaxed)
    }
}

/// Keeps the open-tunnel gauge consistent for the lifetime of a copy task.
pub(crate) struct TunnelGuard {
    metrics: Arc<ForwarderMetrics>,
}

impl TunnelGuard {
    pub(crate) fn new(metrics: Arc<ForwarderMetrics>) -> Self {
        metrics.increment_open_tunnels();
        Self { metrics }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.metrics.decrement_open_tunnels();
    }
}
