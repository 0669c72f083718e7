//! Autonomous background monitoring.
//!
//! While a user is connected, a monitor task periodically gathers weather,
//! traffic and local news signals through the tool registry, derives a risk
//! assessment, and acts on it. The task holds only a weak reference to its
//! agent, so dropping the agent ends the loop.

use crate::agent::Agent;
use crate::config::MonitorConfig;
use crate::dispatcher::ToolContext;
use crate::error::SafeTrailError;
use crate::notifications::Notification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HIGH_RISK_MESSAGE: &str = "High risk conditions detected. Please take extra precautions.";
pub const ADVISORY_MESSAGE: &str =
    "Moderate risk conditions in your area. Stay alert and consider safer alternatives.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    AdverseWeather,
    TrafficIncidents,
    LocalIncidents,
}

impl fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskFactor::AdverseWeather => "adverse_weather",
            RiskFactor::TrafficIncidents => "traffic_incidents",
            RiskFactor::LocalIncidents => "local_incidents",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Thresholds applied to raw signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskThresholds {
    /// Traffic is a risk factor above this many safety alerts.
    pub traffic_alerts: u64,
    /// News is a risk factor above this many safety alerts.
    pub news_alerts: usize,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            traffic_alerts: 2,
            news_alerts: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAssessment {
    pub risk_factors: Vec<RiskFactor>,
    pub overall_risk: RiskLevel,
    pub requires_action: bool,
    pub data_sources: Value,
    pub assessed_at: DateTime<Utc>,
}

/// Derive risk factors and an overall level from raw signals.
pub fn assess(
    weather: &Value,
    traffic: &Value,
    news: &Value,
    thresholds: &RiskThresholds,
) -> SafetyAssessment {
    let mut risk_factors = Vec::new();
    if weather["safety_impact"].as_str() == Some("high") {
        risk_factors.push(RiskFactor::AdverseWeather);
    }
    if traffic["safety_alerts"].as_u64().unwrap_or(0) > thresholds.traffic_alerts {
        risk_factors.push(RiskFactor::TrafficIncidents);
    }
    let news_alerts = news["safety_alerts"].as_array().map_or(0, Vec::len);
    if news_alerts > thresholds.news_alerts {
        risk_factors.push(RiskFactor::LocalIncidents);
    }

    let overall_risk = match risk_factors.len() {
        0 => RiskLevel::Low,
        1 | 2 => RiskLevel::Medium,
        _ => RiskLevel::High,
    };

    SafetyAssessment {
        requires_action: risk_factors.len() > 1,
        risk_factors,
        overall_risk,
        data_sources: serde_json::json!({
            "weather": weather,
            "traffic": traffic,
            "news": news,
        }),
        assessed_at: Utc::now(),
    }
}

/// Loop timing and policy.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub error_backoff: Duration,
    pub thresholds: RiskThresholds,
    pub promote_high_risk: bool,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            error_backoff: Duration::from_secs(config.error_backoff_secs),
            thresholds: RiskThresholds {
                traffic_alerts: config.traffic_alert_threshold,
                news_alerts: config.news_alert_threshold,
            },
            promote_high_risk: config.promote_high_risk,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// A running monitor task.
pub struct MonitorHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the loop to stop. It exits at its next suspension point.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub(crate) fn spawn(agent: &Arc<Agent>, settings: MonitorSettings) -> MonitorHandle {
    let token = CancellationToken::new();
    let handle = tokio::spawn(monitor_loop(
        Arc::downgrade(agent),
        token.clone(),
        settings,
    ));
    MonitorHandle { token, handle }
}

async fn monitor_loop(agent: Weak<Agent>, token: CancellationToken, settings: MonitorSettings) {
    loop {
        let Some(strong) = agent.upgrade() else {
            debug!("Agent dropped, monitor exiting");
            return;
        };

        let cycle = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = run_cycle(&strong, &settings) => result,
        };
        let delay = match cycle {
            Ok(assessment) => {
                debug!(
                    user_id = strong.user_id(),
                    risk = ?assessment.overall_risk,
                    factors = assessment.risk_factors.len(),
                    "Monitoring cycle complete"
                );
                settings.interval
            }
            Err(e) => {
                warn!(user_id = strong.user_id(), error = %e, "Monitoring cycle failed");
                settings.error_backoff
            }
        };
        drop(strong);

        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One gather, assess, act, learn cycle.
pub async fn run_cycle(
    agent: &Agent,
    settings: &MonitorSettings,
) -> Result<SafetyAssessment, SafeTrailError> {
    let services = agent.services();
    let location = agent.last_location().await;
    let ctx = ToolContext::new(agent.user_id()).with_location(location.clone());

    let weather = services.tools.execute("weather_api", &ctx).await?;
    let traffic = services.tools.execute("traffic_api", &ctx).await?;
    let news = services.tools.execute("news_api", &ctx).await?;

    let assessment = assess(&weather, &traffic, &news, &settings.thresholds);

    if assessment.requires_action {
        let user_id = agent.user_id();
        match assessment.overall_risk {
            RiskLevel::High => {
                if settings.promote_high_risk {
                    services
                        .escalation
                        .activate(user_id, location, HIGH_RISK_MESSAGE)
                        .await;
                } else if let Err(e) = services
                    .escalation
                    .notify_contacts(user_id, location.as_ref(), HIGH_RISK_MESSAGE)
                    .await
                {
                    warn!(user_id, error = %e, "High risk contact notification failed");
                }
                services
                    .notifications
                    .push(
                        user_id,
                        Notification::RiskAlert {
                            message: HIGH_RISK_MESSAGE.to_string(),
                            risk_level: RiskLevel::High,
                            risk_factors: assessment.risk_factors.clone(),
                        },
                    )
                    .await;
            }
            RiskLevel::Medium => {
                services
                    .notifications
                    .push(
                        user_id,
                        Notification::Advisory {
                            message: ADVISORY_MESSAGE.to_string(),
                            risk_factors: assessment.risk_factors.clone(),
                        },
                    )
                    .await;
            }
            RiskLevel::Low => {}
        }
        info!(user_id, risk = ?assessment.overall_risk, "Proactive action taken");
    }

    agent.record_monitoring(&assessment).await;
    Ok(assessment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(weather: Value, traffic: Value, news: Value) -> SafetyAssessment {
        assess(&weather, &traffic, &news, &RiskThresholds::default())
    }

    #[test]
    fn test_all_factors_high_risk() {
        let a = run(
            json!({"safety_impact": "high"}),
            json!({"safety_alerts": 3}),
            json!({"safety_alerts": ["a", "b"]}),
        );
        assert_eq!(a.risk_factors.len(), 3);
        assert_eq!(a.overall_risk, RiskLevel::High);
        assert!(a.requires_action);
    }

    #[test]
    fn test_two_factors_medium_with_action() {
        let a = run(
            json!({"safety_impact": "high"}),
            json!({"safety_alerts": 3}),
            json!({"safety_alerts": ["a"]}),
        );
        assert_eq!(
            a.risk_factors,
            vec![RiskFactor::AdverseWeather, RiskFactor::TrafficIncidents]
        );
        assert_eq!(a.overall_risk, RiskLevel::Medium);
        assert!(a.requires_action);
    }

    #[test]
    fn test_one_factor_no_action() {
        let a = run(
            json!({"safety_impact": "low"}),
            json!({"safety_alerts": 2}),
            json!({"safety_alerts": ["a", "b"]}),
        );
        assert_eq!(a.risk_factors, vec![RiskFactor::LocalIncidents]);
        assert_eq!(a.overall_risk, RiskLevel::Medium);
        assert!(!a.requires_action);
    }

    #[test]
    fn test_missing_fields_are_low() {
        let a = run(json!({}), json!({}), json!({}));
        assert!(a.risk_factors.is_empty());
        assert_eq!(a.overall_risk, RiskLevel::Low);
        assert!(!a.requires_action);
    }

    #[test]
    fn test_settings_from_config() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(60));
        assert_eq!(settings.error_backoff, Duration::from_secs(30));
        assert!(!settings.promote_high_risk);
    }
}
