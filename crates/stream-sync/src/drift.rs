//! Clock drift estimation.
//!
//! Each stream keeps a sliding window of `(local_arrival, stream_pts)`
//! samples. The least-squares slope of stream time against local time is
//! 1.0 for a source running exactly at wall speed; the deviation in parts
//! per million is the stream's drift.

use std::collections::VecDeque;

/// Sliding window of arrival samples for one stream.
#[derive(Debug)]
pub struct DriftWindow {
    samples: VecDeque<(i64, i64)>,
    capacity: usize,
}

impl DriftWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one arrival: wall-clock microseconds and the frame's PTS.
    pub fn record(&mut self, local_us: i64, stream_us: i64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((local_us, stream_us));
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Least-squares slope of stream time vs local time, as deviation
    /// from 1.0 in ppm. Returns 0 until the window has enough samples to
    /// be meaningful.
    #[must_use]
    pub fn slope_ppm(&self) -> f64 {
        if self.samples.len() < 8 {
            return 0.0;
        }

        // Center both axes to keep the sums small.
        let n = self.samples.len() as f64;
        let (first_local, first_stream) = self.samples[0];
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        for &(local, stream) in &self.samples {
            sum_x += (local - first_local) as f64;
            sum_y += (stream - first_stream) as f64;
        }
        let mean_x = sum_x / n;
        let mean_y = sum_y / n;

        let mut num = 0.0;
        let mut den = 0.0;
        for &(local, stream) in &self.samples {
            let dx = (local - first_local) as f64 - mean_x;
            let dy = (stream - first_stream) as f64 - mean_y;
            num += dx * dy;
            den += dx * dx;
        }
        if den == 0.0 {
            return 0.0;
        }

        (num / den - 1.0) * 1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_clock_has_zero_drift() {
        let mut window = DriftWindow::new(100);
        for i in 0..50 {
            window.record(i * 20_000, 1_000_000 + i * 20_000);
        }
        assert!(window.slope_ppm().abs() < 1e-6);
    }

    #[test]
    fn fast_source_reads_positive_ppm() {
        let mut window = DriftWindow::new(100);
        // Stream produces 20.01 ms of media per 20 ms of wall time:
        // +500 ppm.
        for i in 0..100 {
            window.record(i * 20_000, i * 20_010);
        }
        let ppm = window.slope_ppm();
        assert!((ppm - 500.0).abs() < 1.0, "expected ~500 ppm, got {ppm}");
    }

    #[test]
    fn slow_source_reads_negative_ppm() {
        let mut window = DriftWindow::new(100);
        for i in 0..100 {
            window.record(i * 20_000, i * 19_990);
        }
        let ppm = window.slope_ppm();
        assert!((ppm + 500.0).abs() < 1.0, "expected ~-500 ppm, got {ppm}");
    }

    #[test]
    fn short_window_reports_zero() {
        let mut window = DriftWindow::new(100);
        for i in 0..5 {
            window.record(i * 20_000, i * 25_000);
        }
        assert_eq!(window.slope_ppm(), 0.0);
    }

    #[test]
    fn window_is_bounded() {
        let mut window = DriftWindow::new(10);
        for i in 0..50 {
            window.record(i, i);
        }
        assert_eq!(window.samples.len(), 10);
    }
}
