//! End-to-end timeline properties of the synchronizer, driven with
//! realistic cadences (60 fps video, 20 ms audio) including jitter.

use std::time::Duration;

use stream_encode::{EncodedAudioFrame, EncodedVideoFrame};
use stream_sync::{SyncConfig, SyncedPair, Synchronizer};

fn video(pts_us: i64) -> EncodedVideoFrame {
    EncodedVideoFrame {
        data: vec![0u8; 128].into(),
        pts_us,
        dts_us: pts_us,
        keyframe: pts_us == 0,
    }
}

fn audio(pts_us: i64) -> EncodedAudioFrame {
    EncodedAudioFrame {
        data: vec![0u8; 32].into(),
        pts_us,
        duration_us: 20_000,
    }
}

fn drain(sync: &Synchronizer) -> Vec<SyncedPair> {
    let mut out = Vec::new();
    while let Some(pair) = sync.next(Some(Duration::from_millis(0))) {
        out.push(pair);
    }
    out
}

#[test]
fn presentation_is_monotonic_under_jitter() {
    let sync = Synchronizer::new(SyncConfig::default());

    // Interleave with deterministic "jitter" in the arrival order.
    for i in 0..120i64 {
        let v_pts = i * 16_667;
        let a_pts = (i * 20_000) + if i % 3 == 0 { 4_000 } else { 0 };
        if i % 2 == 0 {
            sync.push_video(video(v_pts));
            sync.push_audio(audio(a_pts));
        } else {
            sync.push_audio(audio(a_pts));
            sync.push_video(video(v_pts));
        }
        // Keep the bounded queues from overflowing, as the transport
        // sender would.
        if i % 10 == 9 {
            let pairs = drain(&sync);
            assert!(!pairs.is_empty());
        }
    }

    let mut last = i64::MIN;
    let mut paired = 0usize;
    for pair in drain(&sync) {
        assert!(pair.video.is_some() || pair.audio.is_some());
        assert!(pair.presentation_us >= last);
        last = pair.presentation_us;
        if pair.video.is_some() && pair.audio.is_some() {
            paired += 1;
        }
    }
    assert!(paired > 0, "no pairs were formed");
}

#[test]
fn paired_output_respects_desync_bound() {
    let sync = Synchronizer::new(SyncConfig::default());
    for i in 0..60i64 {
        sync.push_video(video(i * 16_667));
    }
    for i in 0..50i64 {
        sync.push_audio(audio(i * 20_000));
    }

    for pair in drain(&sync) {
        if let (Some(v), Some(a)) = (&pair.video, &pair.audio) {
            let delta = (a.pts_us - v.pts_us).abs();
            assert!(delta <= 100_000, "pair desync {delta} exceeds policy band");
        }
    }
}

#[test]
fn stats_account_for_every_frame() {
    let config = SyncConfig {
        video_capacity: 5,
        audio_capacity: 5,
        ..SyncConfig::default()
    };
    let sync = Synchronizer::new(config);

    let pushed = 25u64;
    for i in 0..pushed as i64 {
        sync.push_video(video(i * 16_667));
    }

    let emitted = drain(&sync).len() as u64;
    let stats = sync.stats();
    assert_eq!(stats.video_frames_dropped + emitted, pushed);
}

#[test]
fn reset_gives_a_fresh_timeline() {
    let sync = Synchronizer::new(SyncConfig::default());

    sync.push_video(video(1_000_000_000));
    sync.push_audio(audio(1_000_000_000));
    assert!(sync.next(Some(Duration::from_millis(0))).is_some());

    sync.reset();
    assert_eq!(sync.stats(), stream_sync::SyncStats::default());

    // Wildly different PTS after reset still anchors a new base.
    sync.push_video(video(5));
    sync.push_audio(audio(5));
    let pair = sync.next(Some(Duration::from_millis(0))).expect("pair");
    assert!(pair.video.is_some() && pair.audio.is_some());
}
