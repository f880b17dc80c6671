use super::*;

// --- WatermarkTracker tests ---

#[test]
fn test_tracker_single_channel_advances() {
    let mut tracker = WatermarkTracker::new(1);
    assert_eq!(tracker.current_min_timestamp(), MIN_TIMESTAMP);
    // First advance: min goes from MIN to 1000.
    assert_eq!(
        tracker.advance(0, Watermark::new(1_000)),
        Some(Watermark::new(1_000))
    );
    // Older watermark: no advancement.
    assert_eq!(tracker.advance(0, Watermark::new(500)), None);
    assert_eq!(tracker.current_min_timestamp(), 1_000);
    // Newer watermark: advances again.
    assert_eq!(
        tracker.advance(0, Watermark::new(2_000)),
        Some(Watermark::new(2_000))
    );
}

#[test]
fn test_tracker_two_channels_min() {
    let mut tracker = WatermarkTracker::new(2);
    // Channel 0 at 1000; channel 1 still at MIN -> no advance.
    assert_eq!(tracker.advance(0, Watermark::new(1_000)), None);
    // Channel 1 at 500 -> min = 500.
    assert_eq!(
        tracker.advance(1, Watermark::new(500)),
        Some(Watermark::new(500))
    );
    // Channel 1 at 2000 -> min is 1000 (limited by channel 0).
    assert_eq!(
        tracker.advance(1, Watermark::new(2_000)),
        Some(Watermark::new(1_000))
    );
    // Channel 0 at 3000 -> min is now 2000 (channel 1).
    assert_eq!(
        tracker.advance(0, Watermark::new(3_000)),
        Some(Watermark::new(2_000))
    );
}

#[test]
fn test_tracker_without_channels_is_final() {
    let tracker = WatermarkTracker::new(0);
    assert_eq!(tracker.current_min_timestamp(), MAX_TIMESTAMP);
    assert_eq!(tracker.num_channels(), 0);
}

#[test]
fn test_tracker_reaches_end_of_time() {
    let mut tracker = WatermarkTracker::new(2);
    tracker.advance(0, Watermark::new(MAX_TIMESTAMP));
    assert_eq!(
        tracker.advance(1, Watermark::new(MAX_TIMESTAMP)),
        Some(Watermark::new(MAX_TIMESTAMP))
    );
}

// --- Holds ---

#[test]
fn test_hold_tracker_counts_duplicates() {
    let mut holds = HoldTracker::new();
    holds.add(10);
    holds.add(10);
    holds.add(5);
    assert_eq!(holds.min(), Some(5));
    assert!(holds.release(5));
    assert_eq!(holds.min(), Some(10));
    assert!(holds.release(10));
    assert_eq!(holds.min(), Some(10), "one hold at 10 remains");
    assert!(holds.release(10));
    assert!(holds.is_empty());
    assert!(!holds.release(10));
}

#[test]
fn test_output_watermark_is_capped_by_holds() {
    let mut holds = HoldTracker::new();
    assert_eq!(output_watermark(MIN_TIMESTAMP, 100, &holds), 100);
    holds.add(40);
    assert_eq!(output_watermark(MIN_TIMESTAMP, 100, &holds), 40);
    // never regresses below the previous output
    assert_eq!(output_watermark(60, 100, &holds), 60);
    holds.release(40);
    assert_eq!(output_watermark(60, MAX_TIMESTAMP, &holds), MAX_TIMESTAMP);
}

// --- Processing clock ---

#[test]
fn test_synthetic_clock_advances_and_saturates() {
    let mut clock = ProcessingClock::synthetic();
    assert_eq!(clock.now(), 0);
    clock.advance(1_500);
    assert_eq!(clock.now(), 1_500);
    clock.jump_to(1_000); // never backwards
    assert_eq!(clock.now(), 1_500);
    clock.advance(MAX_TIMESTAMP);
    assert_eq!(clock.now(), MAX_TIMESTAMP);
    assert_eq!(clock.until(MAX_TIMESTAMP), None);
}

#[test]
fn test_wall_clock_is_not_moved_by_advance() {
    let mut clock = ProcessingClock::WallClock;
    let before = clock.now();
    clock.advance(1_000_000);
    assert!(clock.now() < before + 1_000_000);
    assert_eq!(clock.until(0), Some(Duration::ZERO));
}

// --- TimerService tests ---

fn key(user: &[u8], tag: &str) -> TimerKey {
    TimerKey {
        transform_id: "t".into(),
        family: "f".into(),
        tag: tag.into(),
        key: user.to_vec(),
        window: Window::Global,
    }
}

#[test]
fn test_timer_register_and_drain() {
    let mut svc = TimerService::new();
    svc.register(key(b"key-a", ""), 1_000, 1_000);

    let fired = svc.drain_due(1_000, |_| true);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].key.key, b"key-a".to_vec());
    assert!(svc.is_empty());
}

#[test]
fn test_timer_does_not_fire_early() {
    let mut svc = TimerService::new();
    svc.register(key(b"key-a", ""), 2_000, 2_000);
    assert!(svc.drain_due(1_999, |_| true).is_empty());
    assert_eq!(svc.len(), 1);
    assert_eq!(svc.next_timer(), Some(2_000));
}

#[test]
fn test_timers_drain_in_ascending_order() {
    let mut svc = TimerService::new();
    svc.register(key(b"k", "c"), 3_000, 3_000);
    svc.register(key(b"k", "a"), 1_000, 1_000);
    svc.register(key(b"k", "b"), 2_000, 2_000);

    let fire_times: Vec<EventTime> = svc
        .drain_due(3_000, |_| true)
        .iter()
        .map(|t| t.fire)
        .collect();
    assert_eq!(fire_times, vec![1_000, 2_000, 3_000]);
}

#[test]
fn test_timer_reset_replaces_previous() {
    let mut svc = TimerService::new();
    assert!(svc.register(key(b"k", ""), 1_000, 900).is_none());
    let replaced = svc.register(key(b"k", ""), 5_000, 4_000).unwrap();
    assert_eq!((replaced.fire, replaced.hold), (1_000, 900));
    assert_eq!(svc.len(), 1, "same identity is registered once");
    assert!(svc.drain_due(1_000, |_| true).is_empty());
}

#[test]
fn test_timer_delete_and_key_filter() {
    let mut svc = TimerService::new();
    svc.register(key(b"a", ""), 1_000, 1_000);
    svc.register(key(b"b", ""), 1_000, 1_000);
    assert!(svc.delete(&key(b"a", "")).is_some());
    assert!(svc.delete(&key(b"a", "")).is_none());

    // b is busy: stays registered
    assert!(svc.drain_due(2_000, |k| k != b"b").is_empty());
    assert!(svc.has_user_key(b"b"));
    assert!(svc.has_window(b"b", &Window::Global));
    assert_eq!(svc.drain_due(2_000, |_| true).len(), 1);
}
