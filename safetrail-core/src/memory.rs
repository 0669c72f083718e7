//! Per-user agent memory.
//!
//! `MemoryStore` owns everything one agent remembers: the bounded
//! conversation window, learned behavior patterns, incident history,
//! preferences, and response-effectiveness statistics. Timestamps handed out
//! by the store strictly increase at microsecond resolution, even if the wall
//! clock steps backwards, so timestamp keys never collide.

use crate::types::{Location, RequestContext, Urgency};
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

/// Pattern category for observations bucketed by hour of day.
pub const TIME_PATTERNS: &str = "time_patterns";
/// Pattern category for observations bucketed by location grid cell.
pub const LOCATION_PATTERNS: &str = "location_patterns";

/// Size bounds for a `MemoryStore`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub window_size: usize,
    pub max_observations_per_bucket: usize,
    pub max_contextual_entries: usize,
    pub max_effectiveness_samples: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            window_size: 10,
            max_observations_per_bucket: 50,
            max_contextual_entries: 500,
            max_effectiveness_samples: 200,
        }
    }
}

/// One immutable conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub timestamp: DateTime<Utc>,
    pub input: String,
    pub context: RequestContext,
}

/// Sliding window of the most recent conversation turns.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
    total_seen: usize,
}

impl ConversationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
            total_seen: 0,
        }
    }

    /// Append a turn, evicting the oldest when full.
    pub fn push(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
        self.total_seen += 1;
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Turns ever pushed, including evicted ones.
    pub fn total_seen(&self) -> usize {
        self.total_seen
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// The last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<&ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).collect()
    }
}

/// A single observed input in a pattern bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternObservation {
    pub input: String,
    pub timestamp: DateTime<Utc>,
}

/// An entry in the append-only incident history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyIncident {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub urgency: Urgency,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// The persisted part of an agent's memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    /// category -> bucket -> observations.
    pub user_patterns: HashMap<String, BTreeMap<String, Vec<PatternObservation>>>,
    pub safety_incidents: Vec<SafetyIncident>,
    pub route_preferences: BTreeMap<String, serde_json::Value>,
    pub response_effectiveness: BTreeMap<Urgency, Vec<f64>>,
    /// Timestamp key -> learned fact.
    pub contextual_knowledge: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A point-in-time copy of a user's memory, suitable for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub user_id: String,
    pub memory: AgentMemory,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
    pub saved_at: DateTime<Utc>,
}

impl MemorySnapshot {
    pub fn revision(&self) -> u64 {
        self.memory.revision
    }
}

/// Counts reported by `MemoryStore::stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_conversations: usize,
    pub window_turns: usize,
    pub learning_points: usize,
    pub user_patterns: usize,
    pub safety_incidents: usize,
    pub route_preferences: usize,
    pub response_effectiveness: BTreeMap<Urgency, Vec<f64>>,
}

/// Memory owned by exactly one agent.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    memory: AgentMemory,
    conversation: ConversationWindow,
    limits: MemoryLimits,
    last_stamp: Option<DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            memory: AgentMemory::default(),
            conversation: ConversationWindow::new(limits.window_size),
            limits,
            last_stamp: None,
        }
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }

    pub fn conversation(&self) -> &ConversationWindow {
        &self.conversation
    }

    pub fn revision(&self) -> u64 {
        self.memory.revision
    }

    /// Next timestamp, at least one microsecond after the previous one.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_stamp {
            Some(last) => now.max(last + chrono::Duration::microseconds(1)),
            None => now,
        };
        self.last_stamp = Some(ts);
        ts
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.memory.revision += 1;
        self.memory.updated_at = Some(at);
    }

    /// Append a conversation turn to the window.
    pub fn record_turn(&mut self, input: &str, context: &RequestContext) -> DateTime<Utc> {
        let timestamp = self.stamp();
        self.conversation.push(ConversationTurn {
            timestamp,
            input: input.to_string(),
            context: context.clone(),
        });
        self.touch(timestamp);
        timestamp
    }

    /// Bucket the input by hour of day and, when known, by location cell.
    pub fn observe_patterns(&mut self, input: &str, location: Option<&Location>) {
        let timestamp = self.stamp();
        let observation = PatternObservation {
            input: input.to_string(),
            timestamp,
        };
        let hour = timestamp.hour().to_string();
        self.push_observation(TIME_PATTERNS, hour, observation.clone());
        if let Some(loc) = location {
            self.push_observation(LOCATION_PATTERNS, loc.grid_key(), observation);
        }
        self.touch(timestamp);
    }

    fn push_observation(&mut self, category: &str, bucket: String, obs: PatternObservation) {
        let cap = self.limits.max_observations_per_bucket;
        let entries = self
            .memory
            .user_patterns
            .entry(category.to_string())
            .or_default()
            .entry(bucket)
            .or_default();
        entries.push(obs);
        if entries.len() > cap {
            let excess = entries.len() - cap;
            entries.drain(..excess);
        }
    }

    /// Record a confidence score for `urgency`. Scores are clamped to [0, 1];
    /// NaN is ignored.
    pub fn record_effectiveness(&mut self, urgency: Urgency, confidence: f64) {
        if confidence.is_nan() {
            return;
        }
        let cap = self.limits.max_effectiveness_samples;
        let samples = self
            .memory
            .response_effectiveness
            .entry(urgency)
            .or_default();
        samples.push(confidence.clamp(0.0, 1.0));
        if samples.len() > cap {
            let excess = samples.len() - cap;
            samples.drain(..excess);
        }
        let ts = self.stamp();
        self.touch(ts);
    }

    /// Store learning points as contextual knowledge under timestamp keys.
    pub fn learn(&mut self, points: &[String]) {
        if points.is_empty() {
            return;
        }
        let ts = self.stamp();
        let base = ts.to_rfc3339_opts(SecondsFormat::Micros, true);
        for (i, point) in points.iter().enumerate() {
            self.insert_knowledge(
                format!("{base}#learning-{i}"),
                serde_json::Value::String(point.clone()),
            );
        }
        self.touch(ts);
    }

    /// Fold a monitoring outcome into contextual knowledge.
    pub fn record_monitoring(&mut self, outcome: serde_json::Value) {
        let ts = self.stamp();
        let key = format!("{}#monitoring", ts.to_rfc3339_opts(SecondsFormat::Micros, true));
        self.insert_knowledge(key, outcome);
        self.touch(ts);
    }

    fn insert_knowledge(&mut self, key: String, value: serde_json::Value) {
        self.memory.contextual_knowledge.insert(key, value);
        while self.memory.contextual_knowledge.len() > self.limits.max_contextual_entries {
            self.memory.contextual_knowledge.pop_first();
        }
    }

    /// Remember a stated preference.
    pub fn record_preference(&mut self, statement: &str) {
        let ts = self.stamp();
        let key = ts.to_rfc3339_opts(SecondsFormat::Micros, true);
        self.memory.route_preferences.insert(
            key,
            serde_json::json!({ "statement": statement, "source": "conversation" }),
        );
        self.touch(ts);
    }

    /// Append to the incident history.
    pub fn record_incident(
        &mut self,
        kind: &str,
        urgency: Urgency,
        description: &str,
        location: Option<Location>,
    ) -> Uuid {
        let timestamp = self.stamp();
        let id = Uuid::new_v4();
        self.memory.safety_incidents.push(SafetyIncident {
            id,
            timestamp,
            kind: kind.to_string(),
            urgency,
            description: description.to_string(),
            location,
        });
        self.touch(timestamp);
        id
    }

    /// Summary of what is remembered, for inclusion in generation prompts.
    pub fn relevant_context(&self) -> String {
        let mut parts = Vec::new();
        if !self.memory.user_patterns.is_empty() {
            let categories: Vec<String> = self
                .memory
                .user_patterns
                .iter()
                .map(|(name, buckets)| format!("{name} ({} buckets)", buckets.len()))
                .collect();
            parts.push(format!("User Patterns: {}", categories.join(", ")));
        }
        if !self.memory.route_preferences.is_empty() {
            let prefs: Vec<&str> = self
                .memory
                .route_preferences
                .values()
                .filter_map(|v| v["statement"].as_str())
                .collect();
            parts.push(format!("Route Preferences: {}", prefs.join("; ")));
        }
        if !self.memory.safety_incidents.is_empty() {
            let recent: Vec<String> = self
                .memory
                .safety_incidents
                .iter()
                .rev()
                .take(3)
                .map(|i| format!("{} ({})", i.kind, i.urgency))
                .collect();
            parts.push(format!("Recent Safety Incidents: {}", recent.join(", ")));
        }
        if parts.is_empty() {
            "No relevant memory context available.".to_string()
        } else {
            parts.join("\n")
        }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_conversations: self.conversation.total_seen(),
            window_turns: self.conversation.len(),
            learning_points: self.memory.contextual_knowledge.len(),
            user_patterns: self.memory.user_patterns.len(),
            safety_incidents: self.memory.safety_incidents.len(),
            route_preferences: self.memory.route_preferences.len(),
            response_effectiveness: self.memory.response_effectiveness.clone(),
        }
    }

    pub fn snapshot(&self, user_id: &str) -> MemorySnapshot {
        MemorySnapshot {
            user_id: user_id.to_string(),
            memory: self.memory.clone(),
            conversation: self.conversation.iter().cloned().collect(),
            saved_at: Utc::now(),
        }
    }

    /// Replace the current memory with a persisted snapshot.
    pub fn restore(&mut self, snapshot: MemorySnapshot) {
        let mut conversation = ConversationWindow::new(self.limits.window_size);
        for turn in snapshot.conversation {
            conversation.push(turn);
        }
        let latest_turn = conversation.iter().map(|t| t.timestamp).max();
        self.last_stamp = [snapshot.memory.updated_at, latest_turn]
            .into_iter()
            .flatten()
            .max();
        self.memory = snapshot.memory;
        self.conversation = conversation;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_window_evicts_oldest() {
        let mut store = MemoryStore::default();
        for i in 0..11 {
            store.record_turn(&format!("message {i}"), &RequestContext::default());
        }
        let inputs: Vec<&str> = store
            .conversation()
            .iter()
            .map(|t| t.input.as_str())
            .collect();
        assert_eq!(inputs.len(), 10);
        assert_eq!(inputs[0], "message 1");
        assert_eq!(inputs[9], "message 10");
        assert_eq!(store.conversation().total_seen(), 11);
    }

    #[test]
    fn test_recent_turns() {
        let mut window = ConversationWindow::new(5);
        for i in 0..4 {
            window.push(ConversationTurn {
                timestamp: Utc::now(),
                input: i.to_string(),
                context: RequestContext::default(),
            });
        }
        let recent: Vec<&str> = window.recent(2).iter().map(|t| t.input.as_str()).collect();
        assert_eq!(recent, vec!["2", "3"]);
    }

    #[test]
    fn test_timestamps_monotonic() {
        let mut store = MemoryStore::default();
        let far_future = Utc::now() + chrono::Duration::days(1);
        store.last_stamp = Some(far_future);
        let ts = store.record_turn("hi", &RequestContext::default());
        assert!(ts >= far_future);
        let ts2 = store.record_turn("again", &RequestContext::default());
        assert!(ts2 > ts);
    }

    #[test]
    fn test_preferences_survive_clock_regression() {
        let mut store = MemoryStore::default();
        store.last_stamp = Some(Utc::now() + chrono::Duration::seconds(60));
        store.record_preference("I prefer quiet streets");
        store.record_preference("I like well-lit parks");
        assert_eq!(store.memory().route_preferences.len(), 2);

        store.record_monitoring(serde_json::json!({"risk": "low"}));
        store.record_monitoring(serde_json::json!({"risk": "medium"}));
        assert_eq!(store.memory().contextual_knowledge.len(), 2);
    }

    #[test]
    fn test_effectiveness_clamped() {
        let mut store = MemoryStore::default();
        store.record_effectiveness(Urgency::High, 1.7);
        store.record_effectiveness(Urgency::High, -0.2);
        store.record_effectiveness(Urgency::High, f64::NAN);
        assert_eq!(
            store.memory().response_effectiveness[&Urgency::High],
            vec![1.0, 0.0]
        );
    }

    #[test]
    fn test_patterns_by_location_cell() {
        let mut store = MemoryStore::default();
        let loc = Location::new(37.7749, -122.4194);
        store.observe_patterns("walk home", Some(&loc));
        store.observe_patterns("walk home again", Some(&loc));
        let buckets = &store.memory().user_patterns[LOCATION_PATTERNS];
        assert_eq!(buckets["37.77,-122.42"].len(), 2);
        assert!(store.memory().user_patterns.contains_key(TIME_PATTERNS));
    }

    #[test]
    fn test_pattern_buckets_bounded() {
        let limits = MemoryLimits {
            max_observations_per_bucket: 3,
            ..MemoryLimits::default()
        };
        let mut store = MemoryStore::new(limits);
        for i in 0..5 {
            store.observe_patterns(&i.to_string(), None);
        }
        let buckets = &store.memory().user_patterns[TIME_PATTERNS];
        let total: usize = buckets.values().map(Vec::len).sum();
        assert!(total <= 3 * buckets.len());
    }

    #[test]
    fn test_learning_points_keyed_distinctly() {
        let mut store = MemoryStore::default();
        store.learn(&["prefers lit streets".into(), "walks at night".into()]);
        assert_eq!(store.memory().contextual_knowledge.len(), 2);
        assert!(
            store
                .memory()
                .contextual_knowledge
                .keys()
                .all(|k| k.contains("#learning-"))
        );
    }

    #[test]
    fn test_contextual_knowledge_bounded() {
        let limits = MemoryLimits {
            max_contextual_entries: 2,
            ..MemoryLimits::default()
        };
        let mut store = MemoryStore::new(limits);
        store.learn(&["a".into(), "b".into(), "c".into()]);
        assert_eq!(store.memory().contextual_knowledge.len(), 2);
        assert!(
            store
                .memory()
                .contextual_knowledge
                .values()
                .all(|v| v != "a")
        );
    }

    #[test]
    fn test_revision_increases() {
        let mut store = MemoryStore::default();
        let r0 = store.revision();
        store.record_preference("quiet streets");
        store.record_incident("conversational_emergency", Urgency::Critical, "help", None);
        assert!(store.revision() > r0 + 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut store = MemoryStore::default();
        store.record_turn("hello", &RequestContext::default());
        store.record_preference("avoid parks");
        let snapshot = store.snapshot("u-1");

        let mut restored = MemoryStore::default();
        restored.restore(snapshot.clone());
        assert_eq!(restored.memory(), &snapshot.memory);
        assert_eq!(restored.conversation().len(), 1);
        assert!(restored.relevant_context().contains("avoid parks"));
    }

    #[test]
    fn test_empty_context() {
        assert_eq!(
            MemoryStore::default().relevant_context(),
            "No relevant memory context available."
        );
    }
}
