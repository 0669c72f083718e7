//! Rule-based intent and urgency classification.
//!
//! Classification is pure and deterministic. It never consults the
//! generation capability, so it stays available when the model is down.

use crate::types::{Classification, Intent, Urgency};
use regex::Regex;
use std::sync::LazyLock;

/// Ordered intent table. The first category with a matching pattern wins.
const INTENT_PATTERNS: &[(Intent, &[&str])] = &[
    (
        Intent::RoutePlanning,
        &[
            r"plan.*route",
            r"find.*way",
            r"navigate.*to",
            r"directions.*to",
            r"how.*get.*to",
            r"safest.*route",
            r"best.*path",
        ],
    ),
    (
        Intent::SafetyCheck,
        &[
            r"am.*i.*safe",
            r"safety.*status",
            r"check.*safety",
            r"how.*safe",
            r"risk.*assessment",
            r"danger.*level",
        ],
    ),
    (
        Intent::Emergency,
        &[
            r"emergency",
            r"help.*me",
            r"danger",
            r"urgent",
            r"call.*911",
            r"need.*help",
            r"in.*trouble",
        ],
    ),
    (
        Intent::WeatherInquiry,
        &[
            r"weather",
            r"rain",
            r"storm",
            r"temperature",
            r"forecast",
            r"climate.*conditions",
        ],
    ),
    (
        Intent::TrafficInquiry,
        &[
            r"traffic",
            r"congestion",
            r"road.*conditions",
            r"accidents",
            r"delays",
            r"blocked.*roads",
        ],
    ),
    (
        Intent::LocationSharing,
        &[
            r"my.*location",
            r"where.*am.*i",
            r"current.*position",
            r"share.*location",
            r"gps.*coordinates",
        ],
    ),
    (
        Intent::LearningRequest,
        &[
            r"remember.*this",
            r"learn.*from",
            r"note.*that",
            r"keep.*in.*mind",
            r"preference",
            r"i.*prefer",
            r"i.*like",
            r"i.*usually",
        ],
    ),
];

const CRITICAL_KEYWORDS: &[&str] = &[
    "emergency",
    "help",
    "danger",
    "urgent",
    "911",
    "police",
    "fire",
    "ambulance",
];

const HIGH_KEYWORDS: &[&str] = &["lost", "stuck", "scared", "unsafe", "threat", "suspicious"];

static INTENT_TABLE: LazyLock<Vec<(Intent, Vec<Regex>)>> = LazyLock::new(|| {
    INTENT_PATTERNS
        .iter()
        .map(|(intent, patterns)| {
            let compiled = patterns
                .iter()
                .map(|p| Regex::new(p).expect("intent pattern must compile"))
                .collect();
            (*intent, compiled)
        })
        .collect()
});

static LOCATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\d+\s+\w+\s+(street|st|avenue|ave|road|rd|boulevard|blvd)",
        r"near\s+\w+",
        r"-?\d+\.\d+,\s*-?\d+\.\d+",
        r"\b(latitude|longitude|gps|coordinates|address)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("location pattern must compile"))
    .collect()
});

/// Classify a message into an intent and an urgency level.
pub fn classify(text: &str) -> Classification {
    let lowered = text.to_lowercase();
    let intent = detect_intent(&lowered);
    let urgency = assess_urgency(&lowered, intent);
    Classification { intent, urgency }
}

/// Intent detection over already lower-cased text.
fn detect_intent(lowered: &str) -> Intent {
    INTENT_TABLE
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(lowered)))
        .map(|(intent, _)| *intent)
        .unwrap_or(Intent::GeneralInquiry)
}

/// Keyword cascade: critical, then high, then intent-derived medium.
fn assess_urgency(lowered: &str, intent: Intent) -> Urgency {
    if CRITICAL_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        Urgency::Critical
    } else if HIGH_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        Urgency::High
    } else if matches!(intent, Intent::SafetyCheck | Intent::RoutePlanning) {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

/// Whether the message appears to carry a place or coordinates.
pub fn mentions_location(text: &str) -> bool {
    let lowered = text.to_lowercase();
    LOCATION_PATTERNS.iter().any(|re| re.is_match(&lowered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_emergency_message() {
        let c = classify("help I am in danger");
        assert_eq!(c.intent, Intent::Emergency);
        assert_eq!(c.urgency, Urgency::Critical);
    }

    #[test]
    fn test_learning_request() {
        let c = classify("remember that I prefer quiet streets");
        assert_eq!(c.intent, Intent::LearningRequest);
        assert_eq!(c.urgency, Urgency::Low);
    }

    #[test]
    fn test_route_planning_is_medium() {
        let c = classify("Plan the safest route to the station");
        assert_eq!(c.intent, Intent::RoutePlanning);
        assert_eq!(c.urgency, Urgency::Medium);
    }

    #[test]
    fn test_table_order_route_before_emergency() {
        // Both route_planning and emergency patterns match; route wins by order.
        let c = classify("urgent: find a way to the hospital");
        assert_eq!(c.intent, Intent::RoutePlanning);
        assert_eq!(c.urgency, Urgency::Critical);
    }

    #[test]
    fn test_safety_check_is_medium() {
        let c = classify("Am I safe here?");
        assert_eq!(c.intent, Intent::SafetyCheck);
        assert_eq!(c.urgency, Urgency::Medium);
    }

    #[test]
    fn test_high_keywords() {
        let c = classify("I think I'm lost");
        assert_eq!(c.urgency, Urgency::High);
        assert_eq!(c.intent, Intent::GeneralInquiry);
    }

    #[test]
    fn test_weather_and_traffic() {
        assert_eq!(classify("Is it going to rain?").intent, Intent::WeatherInquiry);
        assert_eq!(
            classify("any congestion on the bridge").intent,
            Intent::TrafficInquiry
        );
        assert_eq!(
            classify("share location with mom").intent,
            Intent::LocationSharing
        );
    }

    #[test]
    fn test_general_inquiry_default() {
        let c = classify("hello there");
        assert_eq!(c.intent, Intent::GeneralInquiry);
        assert_eq!(c.urgency, Urgency::Low);
    }

    #[test]
    fn test_substring_keywords() {
        // "helpful" contains "help", so urgency is critical.
        assert_eq!(classify("that was helpful").urgency, Urgency::Critical);
    }

    #[test]
    fn test_mentions_location() {
        assert!(mentions_location("I'm at 221 Baker Street"));
        assert!(mentions_location("near Central Park"));
        assert!(mentions_location("37.7749, -122.4194"));
        assert!(mentions_location("send my GPS"));
        assert!(!mentions_location("good morning"));
    }

    proptest! {
        #[test]
        fn prop_classify_is_deterministic(text in ".{0,80}") {
            prop_assert_eq!(classify(&text), classify(&text));
        }

        #[test]
        fn prop_critical_keyword_wins(
            prefix in "[a-z ]{0,20}",
            suffix in "[a-z ]{0,20}",
            idx in 0usize..CRITICAL_KEYWORDS.len(),
        ) {
            let text = format!("{prefix}{}{suffix}", CRITICAL_KEYWORDS[idx]);
            prop_assert_eq!(classify(&text).urgency, Urgency::Critical);
        }

        #[test]
        fn prop_case_insensitive(text in "[a-zA-Z ]{0,40}") {
            prop_assert_eq!(classify(&text), classify(&text.to_uppercase()));
        }
    }
}
