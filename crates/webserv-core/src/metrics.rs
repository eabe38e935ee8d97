// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters for one reactor. Shared behind an `Arc` so a handle outside the
/// event loop can read them while it runs.
#[repr(C, align(64))]
pub struct ReactorMetrics {
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub responses: AtomicUsize,
    pub cgi_runs: AtomicUsize,
    pub teardowns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

/// Point-in-time copy of [`ReactorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub accepted: usize,
    pub rejected: usize,
    pub active_conns: usize,
    pub responses: usize,
    pub cgi_runs: usize,
    pub teardowns: usize,
    pub bytes_sent: usize,
}

impl ReactorMetrics {
    pub fn new() -> Self {
        Self {
            accepted: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            responses: AtomicUsize::new(0),
            cgi_runs: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cgi_runs(&self) {
        self.cgi_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_teardowns(&self) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            cgi_runs: self.cgi_runs.load(Ordering::Relaxed),
            teardowns: self.teardowns.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for ReactorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
