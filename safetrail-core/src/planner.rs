//! Multi-step plan creation.
//!
//! The planner asks the generator for a JSON array of steps and normalizes it.
//! Anything it cannot trust collapses to a fixed two-step fallback plan, so
//! callers always get a usable plan back.

use crate::generation::{Generator, extract_json_array, generate_with_timeout};
use crate::types::RequestContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// One step of a plan. Ordinals run 1..N without gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub step_number: Option<u32>,
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub fallback_plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub safety_considerations: Vec<String>,
}

impl PlanStep {
    pub fn ordinal(&self) -> u32 {
        self.step_number.unwrap_or(0)
    }
}

/// Where a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Generated,
    Fallback,
}

/// An immutable ordered plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub request: String,
    pub steps: Vec<PlanStep>,
    pub source: PlanSource,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    fn new(request: &str, steps: Vec<PlanStep>, source: PlanSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.to_string(),
            steps,
            source,
            created_at: Utc::now(),
        }
    }

    /// The fixed plan used whenever generation cannot be trusted.
    pub fn fallback(request: &str) -> Self {
        let steps = vec![
            PlanStep {
                step_number: Some(1),
                action: "assess_current_situation".into(),
                description: "Evaluate current safety status and user needs".into(),
                tools_needed: vec!["risk_predictor".into()],
                success_criteria: "Risk assessment completed".into(),
                fallback_plan: "Use basic safety protocols".into(),
                estimated_duration: Some("2 minutes".into()),
                safety_considerations: vec![
                    "Ensure user location is known".into(),
                    "Check emergency contacts".into(),
                ],
            },
            PlanStep {
                step_number: Some(2),
                action: "provide_safety_guidance".into(),
                description: "Offer appropriate safety recommendations".into(),
                tools_needed: vec!["route_optimizer".into()],
                success_criteria: "User receives actionable guidance".into(),
                fallback_plan: "Escalate to emergency protocol if needed".into(),
                estimated_duration: Some("5 minutes".into()),
                safety_considerations: vec![
                    "Prioritize immediate safety".into(),
                    "Consider environmental factors".into(),
                ],
            },
        ];
        Self::new(request, steps, PlanSource::Fallback)
    }

    pub fn ordinals(&self) -> Vec<u32> {
        self.steps.iter().map(PlanStep::ordinal).collect()
    }

    pub fn is_fallback(&self) -> bool {
        self.source == PlanSource::Fallback
    }
}

/// Why generated steps were rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanRejection {
    NoArray,
    Empty,
    UndecodableStep(usize),
    EmptyAction(usize),
    DuplicateOrdinal(u32),
}

/// Decode and normalize generated plan text.
///
/// Steps without an ordinal take their 1-based position. The result is sorted
/// by ordinal and renumbered so gaps close up.
pub fn parse_plan(text: &str) -> Result<Vec<PlanStep>, PlanRejection> {
    let raw = extract_json_array(text).ok_or(PlanRejection::NoArray)?;
    if raw.is_empty() {
        return Err(PlanRejection::Empty);
    }

    let mut steps = Vec::with_capacity(raw.len());
    for (idx, value) in raw.into_iter().enumerate() {
        let mut step: PlanStep =
            serde_json::from_value(value).map_err(|_| PlanRejection::UndecodableStep(idx))?;
        if step.action.trim().is_empty() {
            return Err(PlanRejection::EmptyAction(idx));
        }
        if step.step_number.is_none() {
            step.step_number = Some(idx as u32 + 1);
        }
        steps.push(step);
    }

    let mut seen = HashSet::new();
    for step in &steps {
        if !seen.insert(step.ordinal()) {
            return Err(PlanRejection::DuplicateOrdinal(step.ordinal()));
        }
    }

    steps.sort_by_key(PlanStep::ordinal);
    for (idx, step) in steps.iter_mut().enumerate() {
        step.step_number = Some(idx as u32 + 1);
    }
    Ok(steps)
}

/// Creates plans through the generation capability.
pub struct Planner {
    generator: Arc<dyn Generator>,
    timeout: Duration,
}

impl Planner {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// Produce a plan for `request`. Generation is invoked at most once and
    /// never surfaces an error.
    pub async fn plan(&self, request: &str, context: &RequestContext) -> Plan {
        let prompt = planning_prompt(request, context);
        let text = match generate_with_timeout(self.generator.as_ref(), &prompt, self.timeout).await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Plan generation failed, using fallback plan");
                return Plan::fallback(request);
            }
        };

        match parse_plan(&text) {
            Ok(steps) => {
                debug!(steps = steps.len(), "Generated plan accepted");
                Plan::new(request, steps, PlanSource::Generated)
            }
            Err(reason) => {
                warn!(?reason, "Generated plan rejected, using fallback plan");
                Plan::fallback(request)
            }
        }
    }
}

fn planning_prompt(request: &str, context: &RequestContext) -> String {
    let context_json = serde_json::to_string_pretty(context).unwrap_or_default();
    format!(
        "Create a detailed multi-step safety plan for: \"{request}\"\n\
         Context: {context_json}\n\n\
         Return a JSON array of steps, each with: step_number, action, description, \
         tools_needed, success_criteria, fallback_plan, estimated_duration, \
         safety_considerations."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::generation::MockGenerator;

    fn planner(mock: MockGenerator) -> (Planner, Arc<MockGenerator>) {
        let mock = Arc::new(mock);
        (
            Planner::new(mock.clone(), Duration::from_secs(5)),
            mock,
        )
    }

    #[tokio::test]
    async fn test_garbage_output_gives_fallback() {
        let (planner, mock) = planner(MockGenerator::repeating("lorem ipsum, no json", 1));
        let plan = planner.plan("get me home", &RequestContext::default()).await;
        assert!(plan.is_fallback());
        assert_eq!(plan.ordinals(), vec![1, 2]);
        assert!(plan.steps.iter().all(|s| !s.safety_considerations.is_empty()));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_generation_error_gives_fallback() {
        let mock = MockGenerator::new();
        mock.queue_error(GenerationError::ApiRequest {
            message: "503".into(),
        });
        let (planner, _) = planner(mock);
        let plan = planner.plan("route", &RequestContext::default()).await;
        assert_eq!(plan.steps[0].action, "assess_current_situation");
        assert_eq!(plan.steps[1].action, "provide_safety_guidance");
    }

    #[tokio::test]
    async fn test_valid_plan_is_accepted() {
        let text = r#"Here is the plan:
        [
          {"step_number": 1, "action": "check_weather", "tools_needed": ["weather_api"]},
          {"step_number": 2, "action": "optimize_route", "tools_needed": ["route_optimizer"]}
        ]
        Let me know."#;
        let (planner, _) = planner(MockGenerator::repeating(text, 1));
        let plan = planner.plan("route", &RequestContext::default()).await;
        assert!(!plan.is_fallback());
        assert_eq!(plan.steps[1].action, "optimize_route");
    }

    #[test]
    fn test_missing_ordinals_take_position() {
        let steps = parse_plan(r#"[{"action": "a"}, {"action": "b"}, {"action": "c"}]"#).unwrap();
        let ordinals: Vec<u32> = steps.iter().map(PlanStep::ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
    }

    #[test]
    fn test_gaps_are_renumbered_in_order() {
        let steps = parse_plan(
            r#"[{"step_number": 5, "action": "late"}, {"step_number": 2, "action": "early"}]"#,
        )
        .unwrap();
        assert_eq!(steps[0].action, "early");
        assert_eq!(steps[0].ordinal(), 1);
        assert_eq!(steps[1].ordinal(), 2);
    }

    #[test]
    fn test_malformed_plans_are_rejected() {
        assert_eq!(parse_plan("[]"), Err(PlanRejection::Empty));
        assert_eq!(parse_plan("nothing"), Err(PlanRejection::NoArray));
        assert_eq!(
            parse_plan(r#"[{"action": ""}]"#),
            Err(PlanRejection::EmptyAction(0))
        );
        assert_eq!(
            parse_plan(r#"[{"step_number": 1, "action": "a"}, {"step_number": 1, "action": "b"}]"#),
            Err(PlanRejection::DuplicateOrdinal(1))
        );
        assert_eq!(
            parse_plan(r#"[{"description": "no action"}]"#),
            Err(PlanRejection::UndecodableStep(0))
        );
    }
}
