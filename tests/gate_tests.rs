use parley::config::{GatePolicy, ReplyPolicy};
use parley::gate::{is_backend_clarify, sanitize_reply, GateContext, GateDecision, GateRejection, TranscriptGate};
use parley::kernel::RetryClass;

fn gate() -> TranscriptGate {
    TranscriptGate::new(GatePolicy::default())
}

fn after_reply<'a>(reply: &'a str, since_playback_ms: u64) -> GateContext<'a> {
    GateContext {
        last_reply: Some(reply),
        since_playback_ms: Some(since_playback_ms),
        corroboration: None,
    }
}

#[test]
fn test_low_quality_checks_run_in_order() {
    let gate = gate();
    let cases = [
        ("", GateRejection::EmptyNormalized),
        ("?! ...", GateRejection::EmptyNormalized),
        ("no no no no no no no", GateRejection::LowQualityPattern),
        ("a", GateRejection::ShortAlnum),
        ("hmmmmmmmmm ok", GateRejection::RepetitiveChars),
        ("abab abab abab abab abab abab abab", GateRejection::LowCharDiversity),
        ("the cat the cat the cat the cat", GateRejection::RepetitiveTokens),
    ];
    for (transcript, expected) in cases {
        assert_eq!(
            gate.evaluate(transcript, &GateContext::default()),
            GateDecision::Reject(expected),
            "transcript {transcript:?}"
        );
    }
}

#[test]
fn test_clean_transcript_is_accepted_trimmed() {
    let decision = gate().evaluate("  I need a table for two  ", &GateContext::default());
    assert_eq!(decision, GateDecision::Accept("I need a table for two".to_string()));
    assert!(decision.is_accepted());
    assert_eq!(decision.rejection(), None);
}

#[test]
fn test_reply_echo_depends_on_the_window() {
    // 1. The caller's line repeats the assistant's reply shortly after playback
    let gate = gate();
    let reply = "Please hold on while I check that.";
    let heard = "please hold on while I check that";
    assert_eq!(
        gate.evaluate(heard, &after_reply(reply, 2_000)),
        GateDecision::Reject(GateRejection::Echo)
    );

    // 2. Long after playback the same words are taken at face value
    assert!(gate.evaluate(heard, &after_reply(reply, 9_000)).is_accepted());

    // 3. Unrelated speech inside the window passes
    assert!(gate
        .evaluate("I would like to book a table", &after_reply(reply, 2_000))
        .is_accepted());
}

#[test]
fn test_short_echo_right_after_playback() {
    let gate = gate();
    let reply = "Please hold on.";

    // 1. A short tail of the reply inside the post-playback window
    assert_eq!(
        gate.evaluate("hold on please", &after_reply(reply, 500)),
        GateDecision::Reject(GateRejection::PostPlaybackEcho)
    );

    // 2. Later it is still an echo under the wider turn window
    assert_eq!(
        gate.evaluate("hold on please", &after_reply(reply, 3_000)),
        GateDecision::Reject(GateRejection::Echo)
    );

    // 3. Both echo kinds retry with the echo delay
    assert!(GateRejection::PostPlaybackEcho.is_echo());
    assert_eq!(GateRejection::PostPlaybackEcho.retry_class(), RetryClass::Echo);
}

#[test]
fn test_short_turns_need_agreement() {
    let gate = gate();
    assert!(gate.needs_corroboration("yes please"));
    assert!(!gate.needs_corroboration("yes please do that"));
    assert!(!gate.needs_corroboration("   "));

    let with = |other: Option<&'static str>| GateContext {
        corroboration: other,
        ..GateContext::default()
    };
    assert!(gate.evaluate("yes please", &with(Some("Yes, please."))).is_accepted());
    assert_eq!(
        gate.evaluate("yes please", &with(Some("nope"))),
        GateDecision::Reject(GateRejection::ShortTurnUnconfirmed)
    );
    assert_eq!(
        gate.evaluate("yes please", &with(None)),
        GateDecision::Reject(GateRejection::ShortTurnUnconfirmed)
    );
}

#[test]
fn test_evaluation_is_repeatable() {
    let gate = gate();
    let ctx = after_reply("Your table is booked.", 1_000);
    let first = gate.evaluate("thanks a lot for the help", &ctx);
    let second = gate.evaluate("thanks a lot for the help", &ctx);
    assert_eq!(first, second);
}

#[test]
fn test_invalid_patterns_are_skipped() {
    let gate = TranscriptGate::new(GatePolicy {
        low_quality_patterns: vec!["(unclosed".to_string(), r"^um+$".to_string()],
        ..GatePolicy::default()
    });
    assert_eq!(gate.is_low_quality("ummm"), Some(GateRejection::LowQualityPattern));
    assert_eq!(gate.is_low_quality("book a table"), None);
}

#[test]
fn test_rejections_map_to_retry_classes() {
    assert_eq!(GateRejection::EmptyNormalized.retry_class(), RetryClass::Capture);
    assert_eq!(GateRejection::Echo.retry_class(), RetryClass::Echo);
    assert_eq!(GateRejection::RepetitiveTokens.retry_class(), RetryClass::Transcript);
    assert_eq!(GateRejection::ShortTurnUnconfirmed.to_string(), "short_turn_unconfirmed");
}

#[test]
fn test_reply_sanitizing_drops_markup_and_repeats() {
    let policy = ReplyPolicy::default();
    let raw = "**Sure!** We have a table at seven.   We have a table at seven. Anything else? One more.";
    assert_eq!(
        sanitize_reply(raw, &policy),
        "Sure! We have a table at seven. Anything else?"
    );
    assert_eq!(sanitize_reply("  ** `` ", &policy), "");
}

#[test]
fn test_reply_sanitizing_caps_length() {
    let policy = ReplyPolicy {
        max_chars: 10,
        ..ReplyPolicy::default()
    };
    assert_eq!(sanitize_reply("Hello there friend", &policy), "Hello ther");

    let unlimited = ReplyPolicy {
        max_chars: 0,
        max_sentences: 0,
        ..ReplyPolicy::default()
    };
    assert_eq!(sanitize_reply("One. Two. Three. Four.", &unlimited), "One. Two. Three. Four.");
}

#[test]
fn test_backend_clarify_detection() {
    assert!(is_backend_clarify("Sorry, I could not hear that clearly."));
    assert!(is_backend_clarify("I didn't hear you. Please try again."));
    assert!(!is_backend_clarify("Please try again later, the kitchen is closed."));
    assert!(!is_backend_clarify("We hear you, the table is booked."));
}
