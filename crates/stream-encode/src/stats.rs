//! Encoder statistics.
//!
//! Writers bump atomic counters from the encode path; readers take a
//! snapshot at any time. A snapshot taken concurrently with writes may
//! mix values from adjacent frames, which is fine for reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared counters updated by an encoder.
#[derive(Debug)]
pub struct EncoderStats {
    frames_encoded: AtomicU64,
    bytes_out: AtomicU64,
    encode_time_us_total: AtomicU64,
    target_bitrate_bps: AtomicU64,
    started: Instant,
}

impl EncoderStats {
    #[must_use]
    pub fn new(target_bitrate_bps: u64) -> Arc<Self> {
        Arc::new(Self {
            frames_encoded: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            encode_time_us_total: AtomicU64::new(0),
            target_bitrate_bps: AtomicU64::new(target_bitrate_bps),
            started: Instant::now(),
        })
    }

    pub fn record_frame(&self, bytes: usize, encode_time_us: u64) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.encode_time_us_total
            .fetch_add(encode_time_us, Ordering::Relaxed);
    }

    pub fn set_target_bitrate(&self, bps: u64) {
        self.target_bitrate_bps.store(bps, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> EncoderStatsSnapshot {
        let frames = self.frames_encoded.load(Ordering::Relaxed);
        let bytes = self.bytes_out.load(Ordering::Relaxed);
        let time_us = self.encode_time_us_total.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();

        EncoderStatsSnapshot {
            frames_encoded: frames,
            bytes_out: bytes,
            avg_encode_us: if frames == 0 { 0 } else { time_us / frames },
            effective_bitrate_bps: if elapsed > 0.0 {
                (bytes as f64 * 8.0 / elapsed) as u64
            } else {
                0
            },
            target_bitrate_bps: self.target_bitrate_bps.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of an encoder's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderStatsSnapshot {
    pub frames_encoded: u64,
    pub bytes_out: u64,
    pub avg_encode_us: u64,
    pub effective_bitrate_bps: u64,
    pub target_bitrate_bps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_averages() {
        let stats = EncoderStats::new(5_000_000);
        stats.record_frame(1000, 200);
        stats.record_frame(3000, 400);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_encoded, 2);
        assert_eq!(snap.bytes_out, 4000);
        assert_eq!(snap.avg_encode_us, 300);
        assert_eq!(snap.target_bitrate_bps, 5_000_000);
    }

    #[test]
    fn empty_snapshot_has_no_average() {
        let stats = EncoderStats::new(0);
        assert_eq!(stats.snapshot().avg_encode_us, 0);
    }
}
