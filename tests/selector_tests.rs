mod common;

use common::{Chunk, ScriptedCapture, CHUNK_MS, RATE};
use parley::capture::selector::{CaptureFormat, FailureContext};
use parley::capture::SourceSelector;
use parley::config::SelectorPolicy;
use parley::devices::CaptureEndpoint;

fn endpoints() -> Vec<CaptureEndpoint> {
    vec![
        CaptureEndpoint::new("20", "cap 0"),
        CaptureEndpoint::new("21", "cap 1"),
        CaptureEndpoint::new("22", "cap 2"),
    ]
}

fn failure(now_ms: u64) -> FailureContext {
    FailureContext {
        now_ms,
        speaking: false,
        fast_endpoint: false,
    }
}

fn selector_without_startup() -> SourceSelector {
    SourceSelector::new(
        endpoints(),
        SelectorPolicy {
            startup_recovery_enabled: false,
            ..SelectorPolicy::default()
        },
    )
}

#[test]
fn test_pinned_format_is_the_only_format() {
    // 1. Unpinned: every candidate, current format first
    let selector = SourceSelector::new(endpoints(), SelectorPolicy::default());
    let mut state = selector.start_session(0);
    let formats = selector.capture_formats(&state);
    assert_eq!(
        formats[0],
        CaptureFormat {
            sample_rate: 48_000,
            channels: 2
        }
    );
    assert_eq!(formats.len(), 4, "two rates by two channel counts");

    // 2. A read succeeds at 16 kHz mono and the source is pinned
    selector.record_format(
        &mut state,
        CaptureFormat {
            sample_rate: 16_000,
            channels: 1,
        },
    );
    assert!(selector.pin(&mut state));
    assert!(!selector.pin(&mut state), "pinning twice changes nothing");

    // 3. Pinned: only the pinned format, and format updates are ignored
    selector.record_format(
        &mut state,
        CaptureFormat {
            sample_rate: 48_000,
            channels: 2,
        },
    );
    assert_eq!(
        selector.capture_formats(&state),
        vec![CaptureFormat {
            sample_rate: 16_000,
            channels: 1
        }]
    );
}

#[test]
fn test_endpoint_hints_filter_formats() {
    let mut mono_only = CaptureEndpoint::new("54", "mono");
    mono_only.channel_counts = vec![1];
    mono_only.sample_rates = vec![16_000];
    let selector = SourceSelector::new(vec![mono_only], SelectorPolicy::default());
    let state = selector.start_session(0);

    assert_eq!(
        selector.capture_formats(&state),
        vec![CaptureFormat {
            sample_rate: 16_000,
            channels: 1
        }]
    );
}

#[test]
fn test_rotation_does_not_move_a_pinned_source() {
    let selector = selector_without_startup();
    let mut state = selector.start_session(0);
    selector.pin(&mut state);

    assert!(selector.rotate(&mut state).is_none());
    assert_eq!(state.endpoint_index, Some(0));

    selector.unpin(&mut state, "test");
    assert_eq!(selector.rotate(&mut state).map(|e| e.id.as_str()), Some("21"));
    assert_eq!(selector.rotate(&mut state).map(|e| e.id.as_str()), Some("22"));
    assert_eq!(selector.rotate(&mut state).map(|e| e.id.as_str()), Some("20"), "rotation wraps");
}

#[test]
fn test_failure_thresholds_restart_unpin_and_rotate() {
    // 1. Pinned source outside startup recovery
    let selector = selector_without_startup();
    let mut state = selector.start_session(0);
    selector.pin(&mut state);

    // 2. The second failure restarts the stream
    let first = selector.record_failure(&mut state, failure(10));
    assert!(!first.restart_stream);
    assert!(first.recover_route);
    let second = selector.record_failure(&mut state, failure(20));
    assert!(second.restart_stream);
    assert!(state.pinned);

    // 3. The twentieth unpins and rotates in the same step
    let mut last = second;
    for n in 3..=20 {
        last = selector.record_failure(&mut state, failure(n * 10));
    }
    assert_eq!(last.failures, 20);
    assert!(last.unpinned);
    assert_eq!(last.rotated_to.as_deref(), Some("21"));
    assert!(!state.pinned);
    assert_eq!(state.current_sample_rate, None, "unpinning forgets the format");

    // 4. A success resets the streak
    selector.record_success(&mut state);
    assert_eq!(state.consecutive_failures, 0);
}

#[test]
fn test_startup_recovery_uses_tighter_thresholds() {
    // 1. Inside the startup window
    let selector = SourceSelector::new(endpoints(), SelectorPolicy::default());
    let mut state = selector.start_session(0);
    assert!(selector.in_startup_recovery(&state, 1_000));
    selector.pin(&mut state);

    // 2. Four failures are enough to unpin and rotate
    let mut last = Default::default();
    for n in 1..=4 {
        last = selector.record_failure(&mut state, failure(n * 100));
    }
    assert!(last.unpinned);
    assert_eq!(last.rotated_to.as_deref(), Some("21"));

    // 3. Completing startup recovery ends the window for good
    assert!(selector.complete_startup_recovery(&mut state));
    assert!(!selector.complete_startup_recovery(&mut state));
    assert!(!selector.in_startup_recovery(&state, 1_000));
    assert_eq!(state.consecutive_failures, 0);
}

#[test]
fn test_startup_window_expires_on_its_own() {
    let selector = SourceSelector::new(endpoints(), SelectorPolicy::default());
    let state = selector.start_session(5_000);
    assert!(selector.in_startup_recovery(&state, 34_999));
    assert!(!selector.in_startup_recovery(&state, 35_000));
}

#[test]
fn test_fast_post_playback_failures_rebind_early() {
    let selector = selector_without_startup();
    let mut state = selector.start_session(0);
    selector.pin(&mut state);
    let fast = FailureContext {
        now_ms: 100,
        speaking: false,
        fast_endpoint: true,
    };

    let first = selector.record_failure(&mut state, fast);
    assert!(!first.restart_stream);
    let second = selector.record_failure(&mut state, fast);
    assert!(second.restart_stream, "rebind after two fast failures");
    assert!(!second.unpinned);

    selector.record_failure(&mut state, fast);
    let fourth = selector.record_failure(&mut state, fast);
    assert!(!fourth.unpinned, "fast unpin waits for twenty outside startup");
}

#[test]
fn test_calibration_picks_the_loudest_source() {
    // 1. Three endpoints; the probe reads return different levels
    let capture = ScriptedCapture::new(CHUNK_MS);
    let policy = SelectorPolicy {
        probe_capture_ms: 480,
        ..SelectorPolicy::default()
    };
    capture.push_window(480, Chunk::Level(100));
    capture.push_window(480, Chunk::Level(2_400));
    capture.push_window(480, Chunk::Level(600));
    let selector = SourceSelector::new(endpoints(), policy);
    let mut state = selector.start_session(0);
    assert!(selector.needs_calibration(&state, 0, false));

    // 2. Probe and apply
    let outcome = selector.probe(&capture, RATE);
    assert_eq!(outcome.scores.len(), 3);
    assert_eq!(outcome.selected, Some(1));
    assert!(selector.apply_probe(&mut state, &outcome, 50));

    // 3. Calibrated state is not probed again until invalidated
    assert_eq!(state.endpoint_index, Some(1));
    assert!(state.calibrated);
    assert!(!state.pinned, "calibration alone does not pin");
    assert!(!selector.needs_calibration(&state, 100, false));
    selector.invalidate_calibration(&mut state);
    assert!(!selector.needs_calibration(&state, 100, false), "throttled after a recent probe");
    assert!(selector.needs_calibration(&state, 50 + 1_600, false));
    assert!(selector.needs_calibration(&state, 100, true));
}

#[test]
fn test_unpin_skips_the_calibration_throttle() {
    // 1. A source calibrated at t=50 and pinned by an accepted turn
    let capture = ScriptedCapture::new(CHUNK_MS);
    capture.push_window(480, Chunk::Level(2_400));
    let selector = SourceSelector::new(endpoints(), SelectorPolicy::default());
    let mut state = selector.start_session(0);
    let outcome = selector.probe(&capture, RATE);
    assert!(selector.apply_probe(&mut state, &outcome, 50));
    selector.pin(&mut state);
    assert!(!selector.needs_calibration(&state, 100, false));

    // 2. Losing the pin well inside the throttle window
    assert!(selector.unpin(&mut state, "no_audio_streak"));

    // 3. The very next capture re-probes
    assert!(!state.calibrated);
    assert_eq!(state.last_calibration_ms, None);
    assert!(selector.needs_calibration(&state, 100, false), "unpinned sources are re-probed at once");
}

#[test]
fn test_calibration_rejects_silent_sources() {
    let capture = ScriptedCapture::new(CHUNK_MS);
    for _ in 0..3 {
        capture.push_window(480, Chunk::Level(0));
    }
    let selector = SourceSelector::new(endpoints(), SelectorPolicy::default());
    let mut state = selector.start_session(0);

    let outcome = selector.probe(&capture, RATE);

    assert_eq!(outcome.selected, None);
    assert_eq!(outcome.best_rms(), 0.0);
    assert!(!selector.apply_probe(&mut state, &outcome, 0));
    assert!(!state.calibrated);
    assert_eq!(state.endpoint_index, Some(0), "a failed probe keeps the current source");
}
