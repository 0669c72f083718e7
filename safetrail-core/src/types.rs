//! Core types shared across the SafeTrail engine.

use crate::dispatcher::ToolResults;
use crate::planner::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The classified purpose of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RoutePlanning,
    SafetyCheck,
    Emergency,
    WeatherInquiry,
    TrafficInquiry,
    LocationSharing,
    LearningRequest,
    GeneralInquiry,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::RoutePlanning => "route_planning",
            Intent::SafetyCheck => "safety_check",
            Intent::Emergency => "emergency",
            Intent::WeatherInquiry => "weather_inquiry",
            Intent::TrafficInquiry => "traffic_inquiry",
            Intent::LocationSharing => "location_sharing",
            Intent::LearningRequest => "learning_request",
            Intent::GeneralInquiry => "general_inquiry",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a message, ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Urgency::Low),
            "medium" => Ok(Urgency::Medium),
            "high" => Ok(Urgency::High),
            "critical" => Ok(Urgency::Critical),
            other => Err(format!("unknown urgency level: {other}")),
        }
    }
}

/// Result of running the classifier over one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub urgency: Urgency,
}

/// The agent's current primary activity. Recorded for observability; it is
/// not a lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Planning,
    Monitoring,
    Responding,
    Learning,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::Planning => "planning",
            AgentState::Monitoring => "monitoring",
            AgentState::Responding => "responding",
            AgentState::Learning => "learning",
        };
        f.write_str(s)
    }
}

/// A geographic position reported by the user's device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            timestamp: None,
        }
    }

    /// Coarse grid cell (two decimals, roughly 1 km) used to bucket patterns.
    pub fn grid_key(&self) -> String {
        format!("{:.2},{:.2}", self.lat, self.lng)
    }

    pub fn maps_url(&self) -> String {
        format!("https://maps.google.com/?q={},{}", self.lat, self.lng)
    }

    /// Coordinates are finite and inside the valid lat/lng ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.lat, self.lng)
    }
}

/// A person to alert when the user is in trouble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    pub phone: String,
}

impl EmergencyContact {
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
        }
    }
}

/// Context supplied alongside a conversational request.
///
/// Known fields are typed; anything else the client sends is kept in `extra`
/// so it can be echoed into prompts and conversation turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency_level: Option<Urgency>,
    #[serde(default)]
    pub contains_location: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RequestContext {
    pub fn with_location(location: Location) -> Self {
        Self {
            current_location: Some(location),
            ..Self::default()
        }
    }
}

/// The structured answer an agent returns for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub response: String,
    #[serde(default)]
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub requires_planning: bool,
    pub safety_priority: Urgency,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proactive_suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub learning_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Urgency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_results: Option<ToolResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub emergency_activated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub immediate_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enhanced_monitoring: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_escalation: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub route_guidance: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_info: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub learning_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_acknowledgment: Option<String>,
}

impl AgentResponse {
    /// A plain response with no actions.
    pub fn new(response: impl Into<String>, confidence: f64, safety_priority: Urgency) -> Self {
        Self {
            response: response.into(),
            reasoning: String::new(),
            confidence: confidence.clamp(0.0, 1.0),
            actions: Vec::new(),
            requires_planning: false,
            safety_priority,
            proactive_suggestions: Vec::new(),
            learning_points: Vec::new(),
            intent: None,
            urgency: None,
            plan: None,
            action_results: None,
            error: None,
            fallback_actions: Vec::new(),
            emergency_activated: false,
            immediate_actions: Vec::new(),
            enhanced_monitoring: false,
            safety_escalation: Vec::new(),
            route_guidance: false,
            additional_info: Vec::new(),
            learning_confirmed: false,
            learning_acknowledgment: None,
        }
    }

    /// The answer given when request handling itself failed.
    pub fn degraded(error: impl fmt::Display) -> Self {
        let mut response = Self::new(
            "I encountered an error processing your request. Let me try a different approach.",
            0.0,
            Urgency::Medium,
        );
        response.error = Some(error.to_string());
        response.fallback_actions = vec!["basic_safety_check".to_string()];
        response
    }
}
