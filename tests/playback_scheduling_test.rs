use gemini_live::audio::{PLAYBACK_SAMPLE_RATE, PlaybackQueue, decode_pcm16};

#[test]
fn starts_are_monotone_and_back_to_back() {
    let mut queue = PlaybackQueue::new(PLAYBACK_SAMPLE_RATE);
    let durations = [480usize, 960, 240, 1200, 24];

    let mut expected_start = 0u64;
    for &duration in &durations {
        let start = queue.enqueue(vec![0.1; duration]);
        assert_eq!(start, expected_start);
        expected_start += duration as u64;
    }

    let starts = queue.scheduled_starts();
    assert!(starts.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn continuous_pull_leaves_no_silence_between_buffers() {
    let mut queue = PlaybackQueue::new(PLAYBACK_SAMPLE_RATE);
    queue.enqueue(vec![0.25; 333]);
    queue.enqueue(vec![0.5; 167]);
    queue.enqueue(vec![0.75; 500]);

    let mut out = vec![0.0f32; 1000];
    queue.fill(&mut out);

    // Every sample up to the total queued length is non-silent, with no
    // gap or overlap at buffer boundaries.
    assert!(out[..1000].iter().all(|&s| s > 0.0));
    assert_eq!(out[332], 0.25);
    assert_eq!(out[333], 0.5);
    assert_eq!(out[499], 0.5);
    assert_eq!(out[500], 0.75);
}

#[test]
fn interrupt_clears_queue_and_silences_prior_audio() {
    let mut queue = PlaybackQueue::new(PLAYBACK_SAMPLE_RATE);
    queue.enqueue(vec![0.7; 400]);
    queue.enqueue(vec![0.9; 400]);

    // Part of the first buffer has played when the barge-in lands.
    let mut out = vec![0.0f32; 100];
    queue.fill(&mut out);
    assert_eq!(out[0], 0.7);

    queue.flush();
    assert!(queue.is_idle());
    assert_eq!(queue.queued_samples(), 0);

    // Nothing enqueued before the interruption may play afterwards.
    let mut after = vec![1.0f32; 800];
    queue.fill(&mut after);
    assert!(after.iter().all(|&s| s == 0.0));
}

#[test]
fn audio_arriving_after_idle_starts_at_the_current_clock() {
    let mut queue = PlaybackQueue::new(PLAYBACK_SAMPLE_RATE);
    queue.enqueue(vec![0.1; 100]);

    let mut out = vec![0.0f32; 500];
    queue.fill(&mut out);
    assert_eq!(queue.clock(), 500);

    let start = queue.enqueue(vec![0.2; 100]);
    assert_eq!(start, 500);

    queue.fill(&mut out[..1]);
    assert_eq!(out[0], 0.2);
}

#[test]
fn decode_pcm16_normalizes_to_unit_range() {
    let samples = decode_pcm16(&[0x00, 0x40, 0x00, 0xC0]);
    assert_eq!(samples, vec![0.5, -0.5]);

    let extremes = decode_pcm16(&[0xFF, 0x7F, 0x00, 0x80]);
    assert!((extremes[0] - (32767.0 / 32768.0)).abs() < 1e-6);
    assert_eq!(extremes[1], -1.0);
}
