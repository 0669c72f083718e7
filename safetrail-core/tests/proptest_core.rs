//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use safetrail_core::classifier::classify;
use safetrail_core::memory::{ConversationTurn, ConversationWindow};
use safetrail_core::planner::parse_plan;
use safetrail_core::types::{RequestContext, Urgency};

fn turn(input: String) -> ConversationTurn {
    ConversationTurn {
        timestamp: chrono::Utc::now(),
        input,
        context: RequestContext::default(),
    }
}

// --- Classifier properties ---

proptest! {
    #[test]
    fn classify_is_deterministic(text in ".{0,200}") {
        prop_assert_eq!(classify(&text), classify(&text));
    }

    #[test]
    fn critical_keyword_always_critical(
        prefix in "[a-z ]{0,40}",
        keyword in prop::sample::select(vec!["emergency", "help", "danger", "urgent", "911", "police", "fire", "ambulance"]),
        suffix in "[a-z ]{0,40}",
    ) {
        let text = format!("{prefix} {keyword} {suffix}");
        prop_assert_eq!(classify(&text).urgency, Urgency::Critical);
    }

    #[test]
    fn classify_ignores_case(text in "[a-zA-Z ]{0,80}") {
        prop_assert_eq!(classify(&text.to_uppercase()), classify(&text.to_lowercase()));
    }
}

// --- Conversation window properties ---

proptest! {
    #[test]
    fn window_never_exceeds_capacity(count in 0usize..60, capacity in 1usize..20) {
        let mut window = ConversationWindow::new(capacity);
        for i in 0..count {
            window.push(turn(format!("m{i}")));
            prop_assert!(window.len() <= capacity);
        }
        prop_assert_eq!(window.total_seen(), count);
    }

    #[test]
    fn window_keeps_newest_in_order(count in 1usize..60) {
        let mut window = ConversationWindow::new(10);
        for i in 0..count {
            window.push(turn(format!("m{i}")));
        }
        let kept: Vec<String> = window.iter().map(|t| t.input.clone()).collect();
        let start = count.saturating_sub(10);
        let expected: Vec<String> = (start..count).map(|i| format!("m{i}")).collect();
        prop_assert_eq!(kept, expected);
    }
}

// --- Plan parsing properties ---

proptest! {
    #[test]
    fn parsed_plans_are_contiguous(ordinals in prop::collection::hash_set(1u32..500, 1..12)) {
        let steps: Vec<serde_json::Value> = ordinals
            .iter()
            .map(|n| serde_json::json!({"step_number": n, "action": format!("act{n}")}))
            .collect();
        let text = serde_json::to_string(&steps).unwrap();
        let parsed = parse_plan(&text).unwrap();
        let numbers: Vec<u32> = parsed.iter().map(|s| s.ordinal()).collect();
        let expected: Vec<u32> = (1..=ordinals.len() as u32).collect();
        prop_assert_eq!(numbers, expected);
    }

    #[test]
    fn parse_plan_never_panics(text in ".{0,300}") {
        let _ = parse_plan(&text);
    }
}
