//! Actions a generated response may request: emergency lookup, routing,
//! risk prediction, safety checks, and pattern learning.

use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use safetrail_core::delivery::ContactDirectory;
use safetrail_core::dispatcher::{Tool, ToolContext};
use safetrail_core::error::ToolError;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::SharedRng;

/// Emergency services details plus how many contacts are on file.
pub struct EmergencyServicesTool {
    contacts: Arc<dyn ContactDirectory>,
}

impl EmergencyServicesTool {
    pub fn new(contacts: Arc<dyn ContactDirectory>) -> Self {
        Self { contacts }
    }
}

#[async_trait]
impl Tool for EmergencyServicesTool {
    fn name(&self) -> &str {
        "emergency_services"
    }

    fn description(&self) -> &str {
        "Emergency service contact details and the user's emergency contact count."
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<Value, ToolError> {
        let contacts = self
            .contacts
            .emergency_contacts(&ctx.user_id)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                message: e.to_string(),
            })?;
        let mut data = json!({
            "status": "Emergency services notified",
            "response_time": "5-10 minutes",
            "contact_number": "911",
            "emergency_contacts": contacts.len(),
        });
        if let Some(location) = &ctx.location {
            data["location_link"] = json!(location.maps_url());
        }
        Ok(data)
    }
}

/// Picks a route optimized for safety.
pub struct RouteOptimizerTool {
    rng: Arc<SharedRng>,
}

impl RouteOptimizerTool {
    pub fn new(rng: Arc<SharedRng>) -> Self {
        Self { rng }
    }
}

#[async_trait]
impl Tool for RouteOptimizerTool {
    fn name(&self) -> &str {
        "route_optimizer"
    }

    fn description(&self) -> &str {
        "Route optimized for well-lit, low-risk streets."
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<Value, ToolError> {
        let (score, minutes) = self
            .rng
            .with(|rng| (rng.gen_range(0.7..0.95), rng.gen_range(15..=60)));
        let mut data = json!({
            "optimized_route": "Route optimized for safety",
            "safety_score": (score * 100.0_f64).round() / 100.0,
            "estimated_time": format!("{minutes} minutes"),
            "safety_features": [
                "Well-lit streets",
                "Low crime areas",
                "Emergency services nearby"
            ],
        });
        if let Some(location) = &ctx.location {
            data["origin"] = json!(location);
        }
        Ok(data)
    }
}

/// Near-term risk forecast.
pub struct RiskPredictorTool {
    rng: Arc<SharedRng>,
}

impl RiskPredictorTool {
    pub fn new(rng: Arc<SharedRng>) -> Self {
        Self { rng }
    }
}

#[async_trait]
impl Tool for RiskPredictorTool {
    fn name(&self) -> &str {
        "risk_predictor"
    }

    fn description(&self) -> &str {
        "Predicted risk level with contributing factors and recommendations."
    }

    async fn execute(&self, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let level = self.rng.with(|rng| {
            ["low", "medium", "high"]
                .choose(rng)
                .copied()
                .unwrap_or("medium")
        });
        Ok(json!({
            "risk_level": level,
            "risk_factors": [
                "Weather conditions",
                "Time of day",
                "Location safety rating"
            ],
            "recommendations": [
                "Stay in well-lit areas",
                "Keep emergency contacts handy",
                "Share location with trusted contacts"
            ],
        }))
    }
}

/// Device and environment readiness check.
pub struct SafetyCheckTool {
    rng: Arc<SharedRng>,
}

impl SafetyCheckTool {
    pub fn new(rng: Arc<SharedRng>) -> Self {
        Self { rng }
    }
}

#[async_trait]
impl Tool for SafetyCheckTool {
    fn name(&self) -> &str {
        "safety_check"
    }

    fn description(&self) -> &str {
        "Checks location, contacts, battery, and signal readiness."
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<Value, ToolError> {
        let battery = self.rng.with(|rng| rng.gen_range(20..=100));
        let location_safety = if ctx.location.is_some() {
            "Good"
        } else {
            "Unknown - share your location"
        };
        Ok(json!({
            "location_safety": location_safety,
            "emergency_contacts": "Available",
            "device_battery": format!("{battery}%"),
            "network_signal": "Strong",
            "recommendations": [
                "All safety systems operational",
                "Continue with planned journey"
            ],
        }))
    }
}

/// Acknowledges a learning action. Actual learning happens in agent memory.
pub struct LearnPatternTool;

#[async_trait]
impl Tool for LearnPatternTool {
    fn name(&self) -> &str {
        "learn_pattern"
    }

    fn description(&self) -> &str {
        "Reports insights learned from the current interaction."
    }

    async fn execute(&self, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(json!({
            "patterns_updated": true,
            "new_insights": [
                "User prefers safer routes",
                "Active during evening hours"
            ],
            "confidence_improvement": 0.05,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetrail_core::delivery::StaticContactDirectory;
    use safetrail_core::types::{EmergencyContact, Location};

    fn rng() -> Arc<SharedRng> {
        Arc::new(SharedRng::new(Some(3)))
    }

    #[tokio::test]
    async fn test_emergency_services_counts_contacts() {
        let contacts = Arc::new(StaticContactDirectory::new());
        contacts
            .set_contacts("u1", vec![EmergencyContact::new("Alice", "+15550001")])
            .await;
        let tool = EmergencyServicesTool::new(contacts);
        let ctx = ToolContext::new("u1").with_location(Some(Location::new(1.0, 2.0)));

        let data = tool.execute(&ctx).await.unwrap();

        assert_eq!(data["emergency_contacts"], 1);
        assert_eq!(data["contact_number"], "911");
        assert_eq!(data["location_link"], "https://maps.google.com/?q=1,2");
    }

    #[tokio::test]
    async fn test_route_score_in_range() {
        let tool = RouteOptimizerTool::new(rng());
        for _ in 0..20 {
            let data = tool.execute(&ToolContext::new("u1")).await.unwrap();
            let score = data["safety_score"].as_f64().unwrap();
            assert!((0.7..=0.95).contains(&score));
            assert!(data.get("origin").is_none());
        }
    }

    #[tokio::test]
    async fn test_safety_check_without_location() {
        let data = SafetyCheckTool::new(rng())
            .execute(&ToolContext::new("u1"))
            .await
            .unwrap();
        assert!(data["location_safety"].as_str().unwrap().starts_with("Unknown"));
        assert!(data["device_battery"].as_str().unwrap().ends_with('%'));
    }

    #[tokio::test]
    async fn test_risk_predictor_level() {
        let data = RiskPredictorTool::new(rng())
            .execute(&ToolContext::new("u1"))
            .await
            .unwrap();
        let level = data["risk_level"].as_str().unwrap();
        assert!(["low", "medium", "high"].contains(&level));
    }

    #[tokio::test]
    async fn test_learn_pattern() {
        let data = LearnPatternTool.execute(&ToolContext::new("u1")).await.unwrap();
        assert_eq!(data["patterns_updated"], true);
    }
}
