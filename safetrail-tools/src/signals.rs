//! Environmental signal providers: weather, traffic, and local news.
//!
//! The monitor reads `safety_impact` from weather, the `safety_alerts` count
//! from traffic, and the `safety_alerts` list from news.

use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use safetrail_core::dispatcher::{Tool, ToolContext};
use safetrail_core::error::ToolError;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::SharedRng;

const NEWS_ALERTS: &[&str] = &[
    "Construction work on Main Street",
    "Weather advisory for evening hours",
    "Power outage reported downtown",
    "Street closure near the central station",
];

const NEWS_INCIDENTS: &[&str] = &[
    "Minor traffic accident reported on Highway 101",
    "Bicycle collision on 5th Avenue",
];

const NEWS_RECOMMENDATIONS: &[&str] = &[
    "Avoid downtown area during rush hour",
    "Use alternate routes if possible",
];

fn pick<'a>(rng: &mut impl Rng, options: &[&'a str]) -> &'a str {
    options.choose(rng).copied().unwrap_or_default()
}

/// Current weather around the user.
pub struct WeatherTool {
    rng: Arc<SharedRng>,
}

impl WeatherTool {
    pub fn new(rng: Arc<SharedRng>) -> Self {
        Self { rng }
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather_api"
    }

    fn description(&self) -> &str {
        "Current weather conditions and their safety impact."
    }

    async fn execute(&self, ctx: &ToolContext) -> Result<Value, ToolError> {
        let mut data = self.rng.with(|rng| {
            json!({
                "temperature": rng.gen_range(15..=35),
                "condition": pick(rng, &["sunny", "cloudy", "rainy", "stormy"]),
                "visibility": pick(rng, &["good", "moderate", "poor"]),
                "safety_impact": pick(rng, &["low", "medium", "high"]),
            })
        });
        if let Some(location) = &ctx.location {
            data["location"] = json!(location.grid_key());
        }
        Ok(data)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Road conditions near the user.
pub struct TrafficTool {
    rng: Arc<SharedRng>,
}

impl TrafficTool {
    pub fn new(rng: Arc<SharedRng>) -> Self {
        Self { rng }
    }
}

#[async_trait]
impl Tool for TrafficTool {
    fn name(&self) -> &str {
        "traffic_api"
    }

    fn description(&self) -> &str {
        "Traffic congestion, incidents, and safety alerts."
    }

    async fn execute(&self, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(self.rng.with(|rng| {
            json!({
                "congestion_level": pick(rng, &["light", "moderate", "heavy"]),
                "incidents": rng.gen_range(0..=5),
                "average_speed": rng.gen_range(20..=80),
                "safety_alerts": rng.gen_range(0..=3),
            })
        }))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Safety-related local news.
pub struct NewsTool {
    rng: Arc<SharedRng>,
}

impl NewsTool {
    pub fn new(rng: Arc<SharedRng>) -> Self {
        Self { rng }
    }
}

#[async_trait]
impl Tool for NewsTool {
    fn name(&self) -> &str {
        "news_api"
    }

    fn description(&self) -> &str {
        "Local safety alerts, incidents, and recommendations."
    }

    async fn execute(&self, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(self.rng.with(|rng| {
            let alert_count = rng.gen_range(0..=3);
            let incident_count = rng.gen_range(0..=NEWS_INCIDENTS.len());
            let alerts: Vec<&str> = NEWS_ALERTS
                .choose_multiple(rng, alert_count)
                .copied()
                .collect();
            let incidents: Vec<&str> = NEWS_INCIDENTS
                .choose_multiple(rng, incident_count)
                .copied()
                .collect();
            json!({
                "safety_alerts": alerts,
                "incidents": incidents,
                "recommendations": NEWS_RECOMMENDATIONS,
            })
        }))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetrail_core::types::Location;

    fn rng() -> Arc<SharedRng> {
        Arc::new(SharedRng::new(Some(1)))
    }

    #[tokio::test]
    async fn test_weather_shape() {
        let ctx = ToolContext::new("u1").with_location(Some(Location::new(40.7128, -74.006)));
        let data = WeatherTool::new(rng()).execute(&ctx).await.unwrap();
        let impact = data["safety_impact"].as_str().unwrap();
        assert!(["low", "medium", "high"].contains(&impact));
        let temperature = data["temperature"].as_i64().unwrap();
        assert!((15..=35).contains(&temperature));
        assert_eq!(data["location"], "40.71,-74.01");
    }

    #[tokio::test]
    async fn test_traffic_alert_range() {
        let tool = TrafficTool::new(rng());
        for _ in 0..20 {
            let data = tool.execute(&ToolContext::new("u1")).await.unwrap();
            assert!(data["safety_alerts"].as_u64().unwrap() <= 3);
        }
    }

    #[tokio::test]
    async fn test_news_alerts_are_known() {
        let tool = NewsTool::new(rng());
        for _ in 0..20 {
            let data = tool.execute(&ToolContext::new("u1")).await.unwrap();
            let alerts = data["safety_alerts"].as_array().unwrap();
            assert!(alerts.len() <= 3);
            assert!(
                alerts
                    .iter()
                    .all(|a| NEWS_ALERTS.contains(&a.as_str().unwrap()))
            );
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_weather() {
        let a = WeatherTool::new(Arc::new(SharedRng::new(Some(9))));
        let b = WeatherTool::new(Arc::new(SharedRng::new(Some(9))));
        let ctx = ToolContext::new("u1");
        assert_eq!(a.execute(&ctx).await.unwrap(), b.execute(&ctx).await.unwrap());
    }
}
