//! Audio/video synchronizer.
//!
//! Merges the encoded video and audio streams, which arrive on unrelated
//! cadences, into ordered [`SyncedPair`]s on a single presentation
//! timeline. Producers push without blocking; the transport sender pulls
//! with [`Synchronizer::next`]. Waiting uses a condition variable, never a
//! busy loop, and both internal queues drop their oldest entry under
//! overflow so a stalled consumer cannot violate the realtime deadline.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use stream_capture::clock;
use stream_encode::{EncodedAudioFrame, EncodedVideoFrame};

mod drift;

pub use drift::DriftWindow;

/// Hard cap on accumulated pairing skew per stream.
const MAX_SKEW_US: i64 = 50_000;

/// Synchronization policy and tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Desired `audio_pts - video_pts` at emission, microseconds.
    pub target_offset_us: i64,
    /// Band inside which frames pair with no further action (±20 ms).
    /// A pair beyond it still emits but arms a drift-correction step.
    pub max_desync_us: i64,
    /// Band beyond which the configured policy applies (±100 ms).
    pub hard_desync_us: i64,
    /// Drop the earlier stream's frame when past the hard band.
    ///
    /// When both this and `allow_frame_duplicate` are set, dropping is
    /// tried first; duplication only applies with dropping disabled.
    pub allow_frame_drop: bool,
    /// Re-emit the lagging stream's last frame when past the hard band.
    pub allow_frame_duplicate: bool,
    /// Queue bound per stream; overflow drops the oldest entry.
    pub video_capacity: usize,
    pub audio_capacity: usize,
    /// Recompute drift slopes every this many pushed frames.
    pub drift_check_interval: u64,
    /// Drift magnitude that triggers skew correction, in ppm.
    pub drift_threshold_ppm: f64,
    /// Largest skew adjustment applied per correction step, microseconds.
    pub max_correction_step_us: i64,
    /// Default timeout for [`Synchronizer::next`].
    pub pull_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target_offset_us: 0,
            max_desync_us: 20_000,
            hard_desync_us: 100_000,
            allow_frame_drop: true,
            allow_frame_duplicate: false,
            video_capacity: 30,
            audio_capacity: 30,
            drift_check_interval: 100,
            drift_threshold_ppm: 200.0,
            max_correction_step_us: 500,
            pull_timeout: Duration::from_millis(100),
        }
    }
}

/// The synchronizer's output unit: at least one of video/audio, plus the
/// wall-clock instant both describe.
#[derive(Debug, Clone)]
pub struct SyncedPair {
    pub video: Option<EncodedVideoFrame>,
    pub audio: Option<EncodedAudioFrame>,
    /// Monotonic wall-clock microseconds ([`stream_capture::clock`] epoch).
    pub presentation_us: i64,
}

/// Counters and drift estimates, updated under the state lock and read
/// through [`Synchronizer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncStats {
    pub video_frames_dropped: u64,
    pub audio_frames_dropped: u64,
    pub pairs_emitted: u64,
    pub video_only_emitted: u64,
    pub audio_only_emitted: u64,
    pub duplicates_emitted: u64,
    pub video_drift_ppm: f64,
    pub audio_drift_ppm: f64,
    /// Accumulated pairing skew per stream (≤ 0; holds that stream back).
    pub video_skew_us: i64,
    pub audio_skew_us: i64,
}

/// Maps stream PTS onto the wall clock.
#[derive(Debug, Clone, Copy)]
struct BaseTime {
    local_us: i64,
    stream_us: i64,
}

struct State {
    video: VecDeque<EncodedVideoFrame>,
    audio: VecDeque<EncodedAudioFrame>,
    base: Option<BaseTime>,
    last_video: Option<EncodedVideoFrame>,
    last_audio: Option<EncodedAudioFrame>,
    last_presentation_us: i64,
    /// Pairing skew added to a stream's effective PTS. The skew of a
    /// fast stream goes negative, so its frames read as older and pair
    /// earlier; raw PTS values are never rewritten.
    video_skew_us: i64,
    audio_skew_us: i64,
    video_window: DriftWindow,
    audio_window: DriftWindow,
    pushes_since_check: u64,
    /// Armed when an emitted pair lands in the 20–100 ms band; the next
    /// push runs a correction step without waiting out the interval.
    correction_pending: bool,
    /// Δ of the pair that armed the correction.
    pending_delta_us: i64,
    stats: SyncStats,
}

impl State {
    fn new(config: &SyncConfig) -> Self {
        Self {
            video: VecDeque::with_capacity(config.video_capacity),
            audio: VecDeque::with_capacity(config.audio_capacity),
            base: None,
            last_video: None,
            last_audio: None,
            last_presentation_us: i64::MIN,
            video_skew_us: 0,
            audio_skew_us: 0,
            video_window: DriftWindow::new(100),
            audio_window: DriftWindow::new(100),
            pushes_since_check: 0,
            correction_pending: false,
            pending_delta_us: 0,
            stats: SyncStats::default(),
        }
    }
}

/// The jitter-buffered, drift-corrected A/V merger.
pub struct Synchronizer {
    config: SyncConfig,
    state: Mutex<State>,
    available: Condvar,
}

impl Synchronizer {
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        let state = State::new(&config);
        Self {
            config,
            state: Mutex::new(state),
            available: Condvar::new(),
        }
    }

    /// Push an encoded video frame. Non-blocking; consumes the frame. A
    /// full queue drops its oldest entry.
    pub fn push_video(&self, frame: EncodedVideoFrame) {
        let mut state = self.lock();
        if state.video.len() >= self.config.video_capacity {
            state.video.pop_front();
            state.stats.video_frames_dropped += 1;
        }
        state.video_window.record(clock::monotonic_us(), frame.pts_us);
        state.video.push_back(frame);
        self.after_push(&mut state);
        drop(state);
        self.available.notify_one();
    }

    /// Push an encoded audio frame. Same contract as [`Self::push_video`].
    pub fn push_audio(&self, frame: EncodedAudioFrame) {
        let mut state = self.lock();
        if state.audio.len() >= self.config.audio_capacity {
            state.audio.pop_front();
            state.stats.audio_frames_dropped += 1;
        }
        state.audio_window.record(clock::monotonic_us(), frame.pts_us);
        state.audio.push_back(frame);
        self.after_push(&mut state);
        drop(state);
        self.available.notify_one();
    }

    /// Pull the next pair, waiting up to `timeout` (the configured default
    /// when `None`).
    ///
    /// The first successful call establishes the base time from the
    /// earlier arrival; until both streams have produced at least one
    /// frame the call waits, then falls back to emitting the available
    /// stream alone so a silent or black source cannot stall the session.
    pub fn next(&self, timeout: Option<Duration>) -> Option<SyncedPair> {
        let timeout = timeout.unwrap_or(self.config.pull_timeout);
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            // Before the base time exists a pair needs one frame of each
            // stream; afterwards any head can make progress.
            let ready = if state.base.is_none() {
                !state.video.is_empty() && !state.audio.is_empty()
            } else {
                !state.video.is_empty() || !state.audio.is_empty()
            };

            if ready {
                if let Some(pair) = self.try_emit(&mut state, false) {
                    return Some(pair);
                }
                // One queue is empty (startup, or the policy drained it):
                // fall through and wait for its counterpart.
            }

            let now = Instant::now();
            if now >= deadline {
                // Timed out: emit whatever is available, alone.
                return self.try_emit(&mut state, true);
            }
            let (next_state, wait) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next_state;
            if wait.timed_out() {
                return self.try_emit(&mut state, true);
            }
        }
    }

    /// Clear all state. The next frame of each stream re-arms the base
    /// time; used when the transport re-keys or a codec is reinitialized.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = State::new(&self.config);
    }

    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.lock().stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drift bookkeeping, run on the push path.
    ///
    /// A correction step runs either every `drift_check_interval` pushes
    /// or immediately after a pair crossed the 20 ms band. The faster
    /// stream's skew moves down by one bounded micro-increment per step,
    /// holding its frames back at pairing time; PTS values are never
    /// rewritten.
    fn after_push(&self, state: &mut State) {
        state.pushes_since_check += 1;
        let due = state.pushes_since_check >= self.config.drift_check_interval
            || state.correction_pending;
        if !due {
            return;
        }
        state.pushes_since_check = 0;
        let armed_delta = if state.correction_pending {
            state.correction_pending = false;
            Some(state.pending_delta_us)
        } else {
            None
        };

        let video_ppm = state.video_window.slope_ppm();
        let audio_ppm = state.audio_window.slope_ppm();
        state.stats.video_drift_ppm = video_ppm;
        state.stats.audio_drift_ppm = audio_ppm;

        // Decide which stream is running fast: the drift slopes when they
        // are conclusive, else the sign of the pair that armed us
        // (Δ = audio - video, so Δ > 0 means audio is ahead).
        let relative = video_ppm - audio_ppm;
        let video_fast = if relative.abs() > self.config.drift_threshold_ppm {
            Some(relative > 0.0)
        } else {
            armed_delta.map(|delta| delta < 0)
        };

        if let Some(video_fast) = video_fast {
            let step = self.config.max_correction_step_us;
            if video_fast {
                state.video_skew_us = (state.video_skew_us - step).max(-MAX_SKEW_US);
            } else {
                state.audio_skew_us = (state.audio_skew_us - step).max(-MAX_SKEW_US);
            }
            tracing::debug!(
                video_ppm,
                audio_ppm,
                armed = armed_delta.is_some(),
                video_skew = state.video_skew_us,
                audio_skew = state.audio_skew_us,
                "Applied drift correction step"
            );
        }

        state.stats.video_skew_us = state.video_skew_us;
        state.stats.audio_skew_us = state.audio_skew_us;
    }

    /// Attempt to emit one pair according to the policy bands.
    ///
    /// With `solo` set (pull timed out) a lone stream head is emitted
    /// rather than waiting for its counterpart.
    fn try_emit(&self, state: &mut State, solo: bool) -> Option<SyncedPair> {
        loop {
            // Sample the head timestamps up front so the queues are free
            // to mutate below.
            let v_pts = state.video.front().map(|v| v.pts_us + state.video_skew_us);
            let a_pts = state.audio.front().map(|a| a.pts_us + state.audio_skew_us);

            match (v_pts, a_pts) {
                (Some(v_pts), Some(a_pts)) => {
                    let delta = a_pts - v_pts - self.config.target_offset_us;

                    if delta.abs() <= self.config.hard_desync_us {
                        // Pair the heads. Past the inner band, arm a
                        // drift-correction step for the next push.
                        if delta.abs() > self.config.max_desync_us {
                            state.correction_pending = true;
                            state.pending_delta_us = delta;
                        }
                        let video = state.video.pop_front();
                        let audio = state.audio.pop_front();
                        return Some(self.emit(state, video, audio, false, false));
                    }

                    // Past the hard band: drop first, then duplicate.
                    if self.config.allow_frame_drop {
                        if delta > 0 {
                            // Video head is older; drop it and re-check.
                            state.video.pop_front();
                            state.stats.video_frames_dropped += 1;
                        } else {
                            state.audio.pop_front();
                            state.stats.audio_frames_dropped += 1;
                        }
                        continue;
                    }

                    if self.config.allow_frame_duplicate {
                        // Advance the leading stream, standing in the
                        // lagging stream's last frame at that instant.
                        if delta > 0 {
                            let audio = state.audio.pop_front();
                            let video = state.last_video.clone();
                            state.stats.duplicates_emitted += 1;
                            return Some(self.emit(state, video, audio, true, false));
                        }
                        let video = state.video.pop_front();
                        let audio = state.last_audio.clone();
                        state.stats.duplicates_emitted += 1;
                        return Some(self.emit(state, video, audio, false, true));
                    }

                    // Neither policy: emit the earlier head alone.
                    if delta > 0 {
                        let video = state.video.pop_front();
                        return Some(self.emit(state, video, None, false, false));
                    }
                    let audio = state.audio.pop_front();
                    return Some(self.emit(state, None, audio, false, false));
                }
                (Some(_), None) if solo => {
                    let video = state.video.pop_front();
                    return Some(self.emit(state, video, None, false, false));
                }
                (None, Some(_)) if solo => {
                    let audio = state.audio.pop_front();
                    return Some(self.emit(state, None, audio, false, false));
                }
                _ => return None,
            }
        }
    }

    /// Build the output pair and maintain the timeline invariants.
    ///
    /// `dup_video`/`dup_audio` mark a stood-in frame from the duplicate
    /// policy; it keeps its old PTS and does not drive the presentation
    /// clock or the last-frame bookkeeping.
    fn emit(
        &self,
        state: &mut State,
        video: Option<EncodedVideoFrame>,
        audio: Option<EncodedAudioFrame>,
        dup_video: bool,
        dup_audio: bool,
    ) -> SyncedPair {
        debug_assert!(video.is_some() || audio.is_some());

        let min_pts = match (video.as_ref(), audio.as_ref()) {
            (Some(_), Some(a)) if dup_video => a.pts_us,
            (Some(v), Some(_)) if dup_audio => v.pts_us,
            (Some(v), Some(a)) => v.pts_us.min(a.pts_us),
            (Some(v), None) => v.pts_us,
            (None, Some(a)) => a.pts_us,
            (None, None) => unreachable!("emit requires at least one frame"),
        };

        let base = *state.base.get_or_insert_with(|| BaseTime {
            local_us: clock::monotonic_us(),
            stream_us: min_pts,
        });

        let mut presentation_us = base.local_us + (min_pts - base.stream_us);
        // Outputs are non-decreasing even across policy transitions.
        if presentation_us < state.last_presentation_us {
            presentation_us = state.last_presentation_us;
        }
        state.last_presentation_us = presentation_us;

        match (&video, &audio) {
            (Some(_), Some(_)) => state.stats.pairs_emitted += 1,
            (Some(_), None) => state.stats.video_only_emitted += 1,
            (None, Some(_)) => state.stats.audio_only_emitted += 1,
            (None, None) => {}
        }

        if let Some(v) = &video {
            if !dup_video {
                state.last_video = Some(v.clone());
            }
        }
        if let Some(a) = &audio {
            if !dup_audio {
                state.last_audio = Some(a.clone());
            }
        }

        SyncedPair {
            video,
            audio,
            presentation_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes_helpers::*;

    mod bytes_helpers {
        use super::*;

        pub fn video(pts_us: i64) -> EncodedVideoFrame {
            EncodedVideoFrame {
                data: vec![0xAB; 16].into(),
                pts_us,
                dts_us: pts_us,
                keyframe: false,
            }
        }

        pub fn audio(pts_us: i64) -> EncodedAudioFrame {
            EncodedAudioFrame {
                data: vec![0xCD; 8].into(),
                pts_us,
                duration_us: 20_000,
            }
        }
    }

    fn no_wait() -> Option<Duration> {
        Some(Duration::from_millis(0))
    }

    #[test]
    fn pairs_within_tolerance() {
        let sync = Synchronizer::new(SyncConfig::default());
        sync.push_video(video(1_000_000));
        sync.push_audio(audio(1_015_000));

        let pair = sync.next(no_wait()).expect("pair");
        assert!(pair.video.is_some());
        assert!(pair.audio.is_some());
        assert_eq!(sync.stats().pairs_emitted, 1);
    }

    #[test]
    fn presentation_times_non_decreasing() {
        let sync = Synchronizer::new(SyncConfig::default());
        for i in 0..10 {
            sync.push_video(video(1_000_000 + i * 33_000));
            sync.push_audio(audio(1_000_000 + i * 20_000));
        }

        let mut last = i64::MIN;
        while let Some(pair) = sync.next(no_wait()) {
            assert!(
                pair.presentation_us >= last,
                "presentation went backwards: {} < {last}",
                pair.presentation_us
            );
            last = pair.presentation_us;
        }
    }

    #[test]
    fn paired_streams_stay_inside_hard_band() {
        let sync = Synchronizer::new(SyncConfig::default());
        for i in 0..20 {
            sync.push_video(video(i * 33_000));
        }
        for i in 0..20 {
            sync.push_audio(audio(i * 20_000));
        }
        while let Some(pair) = sync.next(no_wait()) {
            if let (Some(v), Some(a)) = (&pair.video, &pair.audio) {
                assert!(
                    (a.pts_us - v.pts_us).abs() <= 100_000,
                    "paired desync {} too large",
                    (a.pts_us - v.pts_us).abs()
                );
            }
        }
    }

    #[test]
    fn drop_policy_discards_stale_video() {
        let sync = Synchronizer::new(SyncConfig {
            allow_frame_drop: true,
            ..SyncConfig::default()
        });
        // Video far behind audio.
        sync.push_video(video(0));
        sync.push_video(video(33_000));
        sync.push_video(video(500_000));
        sync.push_audio(audio(500_000));

        let pair = sync.next(no_wait()).expect("pair");
        assert_eq!(pair.video.as_ref().unwrap().pts_us, 500_000);
        assert_eq!(sync.stats().video_frames_dropped, 2);
    }

    #[test]
    fn duplicate_policy_stands_in_last_frame() {
        let sync = Synchronizer::new(SyncConfig {
            allow_frame_drop: false,
            allow_frame_duplicate: true,
            ..SyncConfig::default()
        });
        sync.push_video(video(0));
        sync.push_audio(audio(0));
        assert!(sync.next(no_wait()).is_some());

        // Audio leaps far ahead while video stalls at 33ms.
        sync.push_video(video(33_000));
        sync.push_audio(audio(400_000));

        let pair = sync.next(no_wait()).expect("pair");
        // Fresh audio paired with the duplicated last video frame.
        assert_eq!(pair.audio.as_ref().unwrap().pts_us, 400_000);
        assert_eq!(pair.video.as_ref().unwrap().pts_us, 0);
        assert_eq!(sync.stats().duplicates_emitted, 1);
    }

    #[test]
    fn mid_band_pair_arms_correction() {
        let sync = Synchronizer::new(SyncConfig::default());
        // 50 ms desync: inside the hard band, past the inner band.
        sync.push_video(video(1_000_000));
        sync.push_audio(audio(1_050_000));

        let pair = sync.next(no_wait()).expect("pair");
        assert!(pair.video.is_some() && pair.audio.is_some());
        assert_eq!(sync.stats().audio_skew_us, 0);

        // The next push runs the armed step: audio was ahead, so the
        // audio skew moves down by one increment.
        sync.push_video(video(1_033_000));
        let stats = sync.stats();
        assert_eq!(
            stats.audio_skew_us,
            -SyncConfig::default().max_correction_step_us
        );
        assert_eq!(stats.video_skew_us, 0);
    }

    #[test]
    fn inner_band_pair_does_not_arm_correction() {
        let sync = Synchronizer::new(SyncConfig::default());
        // 15 ms desync: inside the inner band, no correction.
        sync.push_video(video(1_000_000));
        sync.push_audio(audio(1_015_000));
        assert!(sync.next(no_wait()).is_some());

        sync.push_video(video(1_033_000));
        let stats = sync.stats();
        assert_eq!(stats.video_skew_us, 0);
        assert_eq!(stats.audio_skew_us, 0);
    }

    #[test]
    fn lone_stream_emits_on_timeout() {
        let sync = Synchronizer::new(SyncConfig::default());
        sync.push_video(video(1_000));
        let pair = sync.next(no_wait()).expect("solo video");
        assert!(pair.video.is_some());
        assert!(pair.audio.is_none());
        assert_eq!(sync.stats().video_only_emitted, 1);
    }

    #[test]
    fn empty_synchronizer_times_out() {
        let sync = Synchronizer::new(SyncConfig::default());
        assert!(sync.next(Some(Duration::from_millis(5))).is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let sync = Synchronizer::new(SyncConfig {
            video_capacity: 3,
            ..SyncConfig::default()
        });
        for i in 0..5 {
            sync.push_video(video(i * 10_000));
        }
        assert_eq!(sync.stats().video_frames_dropped, 2);
        // The oldest surviving frame is #2.
        let pair = sync.next(no_wait()).expect("solo video");
        assert_eq!(pair.video.unwrap().pts_us, 20_000);
    }

    #[test]
    fn reset_replays_identically() {
        let run = |sync: &Synchronizer| -> Vec<(Option<i64>, Option<i64>, i64)> {
            for i in 0..5 {
                sync.push_video(video(i * 33_000));
                sync.push_audio(audio(i * 33_000));
            }
            let mut out = Vec::new();
            let mut first_presentation = None;
            while let Some(pair) = sync.next(no_wait()) {
                let base = *first_presentation.get_or_insert(pair.presentation_us);
                out.push((
                    pair.video.map(|v| v.pts_us),
                    pair.audio.map(|a| a.pts_us),
                    pair.presentation_us - base,
                ));
            }
            out
        };

        let sync = Synchronizer::new(SyncConfig::default());
        let first = run(&sync);
        sync.reset();
        let second = run(&sync);
        assert_eq!(first, second);
    }
}
