//! Serial link counters.
//! One `LinkMetrics` per gateway, shared with handles through an `Arc`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct LinkMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    integrity_errors: AtomicU64,
    malformed_frames: AtomicU64,
    commands_acked: AtomicU64,
    commands_failed: AtomicU64,
    retries: AtomicU64,
    ack_latency_sum_ms: AtomicU64,
    ack_latency_count: AtomicU64,
    write_errors: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_frames_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_integrity_errors(&self) {
        self.integrity_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_acked(&self) {
        self.commands_acked.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_write_errors(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn observe_ack_latency(&self, latency: Duration) {
        self.ack_latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.ack_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        let sum = self.ack_latency_sum_ms.load(Ordering::Relaxed);
        let count = self.ack_latency_count.load(Ordering::Relaxed);
        Snapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            integrity_errors: self.integrity_errors.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            commands_acked: self.commands_acked.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub integrity_errors: u64,
    pub malformed_frames: u64,
    pub commands_acked: u64,
    pub commands_failed: u64,
    pub retries: u64,
    pub write_errors: u64,
    pub ack_latency_avg_ms: Option<u64>,
}
