//! Per-user agent orchestration.
//!
//! An `Agent` runs the classify -> generate -> plan -> dispatch -> learn
//! pipeline for one user. Requests are serialized through a fair mutex, so
//! concurrent messages from the same user are answered in arrival order.
//! `process_request` never fails: internal errors become a degraded response.

use crate::checkin::CheckInCoordinator;
use crate::classifier::{classify, mentions_location};
use crate::config::AgentConfig;
use crate::dispatcher::{ToolContext, ToolRegistry};
use crate::error::{AgentError, MemoryError, SafeTrailError};
use crate::escalation::EscalationEngine;
use crate::generation::{Generator, extract_json_object, generate_with_timeout};
use crate::memory::{MemorySnapshot, MemoryStats, MemoryStore};
use crate::monitor::{self, MonitorHandle, MonitorSettings, SafetyAssessment};
use crate::notifications::NotificationHub;
use crate::persistence::MemoryPersistence;
use crate::planner::{Plan, Planner};
use crate::types::{
    AgentResponse, AgentState, Classification, Intent, Location, RequestContext, Urgency,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared collaborators every agent uses.
#[derive(Clone)]
pub struct AgentServices {
    pub generator: Arc<dyn Generator>,
    pub tools: Arc<ToolRegistry>,
    pub escalation: Arc<EscalationEngine>,
    pub checkins: Arc<CheckInCoordinator>,
    pub persistence: Arc<dyn MemoryPersistence>,
    pub notifications: Arc<NotificationHub>,
}

/// Snapshot of an agent's activity for the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub user_id: String,
    pub current_state: AgentState,
    pub monitoring: bool,
    #[serde(flatten)]
    pub memory: MemoryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_plan: Option<Uuid>,
}

/// Structured fields a generated reply may carry.
#[derive(Debug, Deserialize)]
struct GeneratedReply {
    response: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    requires_planning: bool,
    #[serde(default)]
    safety_priority: Option<String>,
    #[serde(default)]
    proactive_suggestions: Vec<String>,
    #[serde(default)]
    learning_points: Vec<String>,
}

fn default_confidence() -> f64 {
    0.5
}

/// How a request's urgency is acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// A user message: critical and high urgency trigger the safety protocol.
    Conversation,
    /// A system-issued greeting. Runs the pipeline without the urgency policy.
    Greeting,
}

pub struct Agent {
    user_id: String,
    config: Arc<AgentConfig>,
    services: AgentServices,
    planner: Planner,
    memory: Mutex<MemoryStore>,
    state: watch::Sender<AgentState>,
    request_gate: Mutex<()>,
    /// Set under the request gate once the agent has been drained for removal.
    retired: AtomicBool,
    current_plan: RwLock<Option<Plan>>,
    last_location: RwLock<Option<Location>>,
    monitor: Mutex<Option<MonitorHandle>>,
    /// Revision of the newest snapshot written so far.
    saved_revision: Arc<Mutex<u64>>,
}

impl Agent {
    pub fn new(user_id: impl Into<String>, config: Arc<AgentConfig>, services: AgentServices) -> Self {
        let planner = Planner::new(
            services.generator.clone(),
            Duration::from_secs(config.generation.timeout_secs),
        );
        let memory = MemoryStore::new(config.memory.limits());
        let (state, _) = watch::channel(AgentState::Idle);
        Self {
            user_id: user_id.into(),
            config,
            services,
            planner,
            memory: Mutex::new(memory),
            state,
            request_gate: Mutex::new(()),
            retired: AtomicBool::new(false),
            current_plan: RwLock::new(None),
            last_location: RwLock::new(None),
            monitor: Mutex::new(None),
            saved_revision: Arc::new(Mutex::new(0)),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AgentState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(user_id = %self.user_id, from = %previous, to = %state, "Agent state changed");
        }
    }

    pub async fn last_location(&self) -> Option<Location> {
        self.last_location.read().await.clone()
    }

    pub async fn current_plan(&self) -> Option<Plan> {
        self.current_plan.read().await.clone()
    }

    /// Record a new device location.
    pub async fn update_location(&self, mut location: Location) -> Result<(), AgentError> {
        if !location.is_valid() {
            return Err(AgentError::MalformedRequest {
                reason: format!("location out of range: {}", location),
            });
        }
        location.timestamp.get_or_insert_with(Utc::now);
        debug!(user_id = %self.user_id, grid = %location.grid_key(), "Location updated");
        *self.last_location.write().await = Some(location);
        Ok(())
    }

    /// Replace memory with a persisted snapshot.
    pub async fn restore_memory(&self, snapshot: MemorySnapshot) {
        let revision = snapshot.revision();
        self.memory.lock().await.restore(snapshot);
        *self.saved_revision.lock().await = revision;
    }

    /// Handle one user message. Always returns a response.
    pub async fn process_request(&self, text: &str, context: RequestContext) -> AgentResponse {
        let _gate = self.request_gate.lock().await;
        self.run_request(text, context, RequestMode::Conversation).await
    }

    /// Handle one request unless the agent has been retired, in which case
    /// `None` is returned and the caller should look up the current agent.
    pub async fn submit(
        &self,
        text: &str,
        context: RequestContext,
        mode: RequestMode,
    ) -> Option<AgentResponse> {
        let _gate = self.request_gate.lock().await;
        if self.is_retired() {
            return None;
        }
        Some(self.run_request(text, context, mode).await)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Wait for the in-flight request to finish, then refuse further
    /// requests, stop monitoring and flush memory. The returned guard keeps
    /// queued callers waiting until the owner has released the agent.
    pub async fn retire(&self) -> MutexGuard<'_, ()> {
        let gate = self.request_gate.lock().await;
        self.retired.store(true, Ordering::SeqCst);
        // Not running is fine here.
        let _ = self.stop_monitoring().await;
        if let Err(e) = self.persist_now().await {
            warn!(user_id = %self.user_id, error = %e, "Memory flush failed while retiring agent");
        }
        info!(user_id = %self.user_id, "Agent retired");
        gate
    }

    /// Returns once whoever retired this agent has released it.
    pub async fn wait_released(&self) {
        drop(self.request_gate.lock().await);
    }

    async fn run_request(
        &self,
        text: &str,
        context: RequestContext,
        mode: RequestMode,
    ) -> AgentResponse {
        self.set_state(AgentState::Responding);

        let response = match self.handle_request(text, context, mode).await {
            Ok(response) => response,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Request handling failed");
                AgentResponse::degraded(&e)
            }
        };

        self.settle_state().await;
        response
    }

    async fn handle_request(
        &self,
        text: &str,
        mut context: RequestContext,
        mode: RequestMode,
    ) -> Result<AgentResponse, SafeTrailError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::MalformedRequest {
                reason: "message is empty".to_string(),
            }
            .into());
        }

        let classification = classify(text);
        info!(
            user_id = %self.user_id,
            intent = %classification.intent,
            urgency = %classification.urgency,
            "Processing request"
        );

        match context.current_location.clone() {
            Some(location) => self.update_location(location).await?,
            None => context.current_location = self.last_location().await,
        }
        context.detected_intent = Some(classification.intent);
        context.urgency_level = Some(classification.urgency);
        context.contains_location = mentions_location(text);

        self.memory.lock().await.record_turn(text, &context);

        let prompt = self.build_prompt(text, &context).await;
        let timeout = Duration::from_secs(self.config.generation.timeout_secs);
        let mut response =
            match generate_with_timeout(self.services.generator.as_ref(), &prompt, timeout).await {
                Ok(raw) => interpret_generated(&raw),
                Err(e) => {
                    warn!(user_id = %self.user_id, error = %e, "Generation failed, using fallback response");
                    fallback_response(text)
                }
            };
        response.intent = Some(classification.intent);
        response.urgency = Some(classification.urgency);

        if response.requires_planning || classification.intent == Intent::RoutePlanning {
            self.set_state(AgentState::Planning);
            let plan = self.planner.plan(text, &context).await;
            *self.current_plan.write().await = Some(plan.clone());
            response.plan = Some(plan);
            self.set_state(AgentState::Responding);
        }

        if !response.actions.is_empty() {
            let ctx = ToolContext {
                user_id: self.user_id.clone(),
                location: context.current_location.clone(),
                request: context.clone(),
            };
            let results = self.services.tools.dispatch(&response.actions, &ctx).await;
            response.action_results = Some(results);
        }

        if mode == RequestMode::Conversation {
            self.apply_urgency_policy(text, classification, &context, &mut response)
                .await;
        }

        self.set_state(AgentState::Learning);
        self.learn(text, &context, classification, &response).await;
        self.persist_in_background().await;

        Ok(response)
    }

    async fn build_prompt(&self, text: &str, context: &RequestContext) -> String {
        let (memory_context, history) = {
            let memory = self.memory.lock().await;
            let history: Vec<&str> = memory
                .conversation()
                .recent(3)
                .into_iter()
                .map(|turn| turn.input.as_str())
                .collect();
            (memory.relevant_context(), serde_json::to_string(&history).unwrap_or_default())
        };
        let context_json = serde_json::to_string(context).unwrap_or_default();
        format!(
            "You are SafeTrail's safety assistant.\n\
             User input: \"{text}\"\n\
             Context: {context_json}\n\
             Time: {}\n\n\
             Memory:\n{memory_context}\n\n\
             Recent conversation: {history}\n\n\
             Reply with a JSON object containing: response, reasoning, confidence (0-1), \
             actions, requires_planning, safety_priority (low/medium/high/critical), \
             proactive_suggestions, learning_points.",
            Utc::now().to_rfc3339()
        )
    }

    async fn apply_urgency_policy(
        &self,
        text: &str,
        classification: Classification,
        context: &RequestContext,
        response: &mut AgentResponse,
    ) {
        let location = context.current_location.clone();

        if classification.urgency == Urgency::Critical {
            response.emergency_activated = true;
            response.immediate_actions = vec![
                "Emergency services have been notified".to_string(),
                "Your location has been shared with emergency contacts".to_string(),
                "Stay calm and follow emergency procedures".to_string(),
            ];
            self.memory.lock().await.record_incident(
                "conversational_emergency",
                Urgency::Critical,
                text,
                location.clone(),
            );
            let reason = format!("Emergency reported in conversation: \"{text}\"");
            let report = self
                .services
                .escalation
                .activate(&self.user_id, location, &reason)
                .await;
            debug!(
                user_id = %self.user_id,
                incident_id = %report.incident.id,
                reused = report.already_active,
                "Conversational emergency escalated"
            );
        } else if classification.urgency == Urgency::High {
            let window = self.config.escalation.check_in_window_secs;
            response.enhanced_monitoring = true;
            response.safety_escalation = vec![
                "Increased monitoring activated".to_string(),
                format!(
                    "Emergency contacts will be notified if no response in {}",
                    describe_duration(window)
                ),
                "Location tracking enabled".to_string(),
            ];
            self.services
                .checkins
                .initiate(&self.user_id, location)
                .await;
        } else if classification.intent == Intent::RoutePlanning {
            response.route_guidance = true;
            response.additional_info = vec![
                "Real-time safety assessment included".to_string(),
                "Alternative routes provided".to_string(),
                "Continuous monitoring during journey".to_string(),
            ];
        } else if classification.intent == Intent::LearningRequest {
            response.learning_confirmed = true;
            response.learning_acknowledgment = Some(
                "I've noted your preference and will remember it for future interactions."
                    .to_string(),
            );
            self.memory.lock().await.record_preference(text);
        }
    }

    async fn learn(
        &self,
        text: &str,
        context: &RequestContext,
        classification: Classification,
        response: &AgentResponse,
    ) {
        let mut memory = self.memory.lock().await;
        memory.observe_patterns(text, context.current_location.as_ref());
        memory.record_effectiveness(classification.urgency, response.confidence);
        memory.learn(&response.learning_points);
    }

    /// Fold a monitoring assessment into contextual memory.
    pub async fn record_monitoring(&self, assessment: &SafetyAssessment) {
        let value = serde_json::to_value(assessment).unwrap_or(serde_json::Value::Null);
        self.memory.lock().await.record_monitoring(value);
        self.persist_in_background().await;
    }

    /// Append to the incident history and persist.
    pub async fn record_incident(
        &self,
        kind: &str,
        urgency: Urgency,
        description: &str,
        location: Option<Location>,
    ) -> Uuid {
        let id = self
            .memory
            .lock()
            .await
            .record_incident(kind, urgency, description, location);
        self.persist_in_background().await;
        id
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        self.memory.lock().await.snapshot(&self.user_id)
    }

    async fn persist_in_background(&self) {
        if self.is_retired() {
            // The replacement agent owns the stored snapshot now.
            debug!(user_id = %self.user_id, "Skipping save from retired agent");
            return;
        }
        let snapshot = self.snapshot().await;
        let persistence = self.services.persistence.clone();
        let saved = self.saved_revision.clone();
        tokio::spawn(async move {
            if let Err(e) = save_if_newer(persistence.as_ref(), &saved, snapshot).await {
                warn!(error = %e, "Memory persistence failed");
            }
        });
    }

    /// Persist the current memory and wait for the write.
    pub async fn persist_now(&self) -> Result<(), MemoryError> {
        let snapshot = self.snapshot().await;
        save_if_newer(
            self.services.persistence.as_ref(),
            &self.saved_revision,
            snapshot,
        )
        .await
    }

    /// Start the background monitor. Fails if one is already running.
    pub async fn start_monitoring(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut slot = self.monitor.lock().await;
        if slot.as_ref().is_some_and(MonitorHandle::is_running) {
            return Err(AgentError::MonitorAlreadyRunning {
                user_id: self.user_id.clone(),
            });
        }
        let settings = MonitorSettings::from(&self.config.monitor);
        info!(
            user_id = %self.user_id,
            interval_secs = settings.interval.as_secs(),
            "Autonomous monitoring started"
        );
        *slot = Some(monitor::spawn(self, settings));
        self.state.send_if_modified(|state| {
            if *state == AgentState::Idle {
                *state = AgentState::Monitoring;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    pub async fn stop_monitoring(&self) -> Result<(), AgentError> {
        let handle = self
            .monitor
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::MonitorNotRunning {
                user_id: self.user_id.clone(),
            })?;
        handle.stop();
        info!(user_id = %self.user_id, "Autonomous monitoring stopped");
        self.state.send_if_modified(|state| {
            if *state == AgentState::Monitoring {
                *state = AgentState::Idle;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(MonitorHandle::is_running)
    }

    async fn settle_state(&self) {
        let resting = if self.is_monitoring().await {
            AgentState::Monitoring
        } else {
            AgentState::Idle
        };
        self.set_state(resting);
    }

    pub async fn stats(&self) -> AgentStats {
        let memory = self.memory.lock().await.stats();
        AgentStats {
            user_id: self.user_id.clone(),
            current_state: self.state(),
            monitoring: self.is_monitoring().await,
            memory,
            current_plan: self.current_plan.read().await.as_ref().map(|p| p.id),
        }
    }
}

/// Write `snapshot` unless a newer revision has already been saved.
async fn save_if_newer(
    persistence: &dyn MemoryPersistence,
    saved_revision: &Mutex<u64>,
    snapshot: MemorySnapshot,
) -> Result<(), MemoryError> {
    let mut saved = saved_revision.lock().await;
    if snapshot.revision() <= *saved {
        debug!(
            revision = snapshot.revision(),
            saved = *saved,
            "Skipping stale memory snapshot"
        );
        return Ok(());
    }
    persistence.save(&snapshot.user_id, &snapshot).await?;
    *saved = snapshot.revision();
    Ok(())
}

/// Turn raw generated text into a response.
fn interpret_generated(raw: &str) -> AgentResponse {
    let decoded = extract_json_object(raw)
        .map(|map| serde_json::from_value::<GeneratedReply>(serde_json::Value::Object(map)));

    match decoded {
        Some(Ok(reply)) => {
            let priority = reply
                .safety_priority
                .as_deref()
                .and_then(|p| p.parse().ok())
                .unwrap_or(Urgency::Medium);
            let confidence = if reply.confidence.is_nan() {
                default_confidence()
            } else {
                reply.confidence
            };
            let mut response = AgentResponse::new(reply.response, confidence, priority);
            response.reasoning = reply.reasoning;
            response.actions = reply.actions;
            response.requires_planning = reply.requires_planning;
            response.proactive_suggestions = reply.proactive_suggestions;
            response.learning_points = reply.learning_points;
            response
        }
        Some(Err(_)) => unstructured(raw, 0.5, "Could not parse structured response"),
        None if raw.contains('{') => unstructured(raw, 0.5, "Could not parse structured response"),
        None => unstructured(raw, 0.7, "Direct AI response without structured format"),
    }
}

fn unstructured(raw: &str, confidence: f64, reasoning: &str) -> AgentResponse {
    let mut response = AgentResponse::new(raw.trim(), confidence, Urgency::Medium);
    response.reasoning = reasoning.to_string();
    response
}

/// The local answer used when generation fails.
fn fallback_response(text: &str) -> AgentResponse {
    let mut response = AgentResponse::new(
        format!(
            "I understand you're asking about: '{text}'. Let me help you with safety guidance and recommendations."
        ),
        0.6,
        Urgency::Medium,
    );
    response.reasoning = "Using fallback response due to AI processing error".to_string();
    response.actions = vec!["safety_check".to_string()];
    response.proactive_suggestions = vec![
        "Share your current location for better assistance".to_string(),
        "Check your emergency contacts are up to date".to_string(),
        "Consider your planned route for any safety concerns".to_string(),
    ];
    response
}

fn describe_duration(secs: u64) -> String {
    match secs {
        s if s >= 60 && s % 60 == 0 => {
            let minutes = s / 60;
            format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" })
        }
        s => format!("{} seconds", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_structured_reply() {
        let raw = r#"Sure. {"response": "Stay on Main St", "confidence": 0.92,
            "actions": ["route_optimizer"], "safety_priority": "HIGH",
            "learning_points": ["walks home at night"]} Hope that helps."#;
        let resp = interpret_generated(raw);
        assert_eq!(resp.response, "Stay on Main St");
        assert_eq!(resp.confidence, 0.92);
        assert_eq!(resp.safety_priority, Urgency::High);
        assert_eq!(resp.actions, vec!["route_optimizer"]);
        assert_eq!(resp.learning_points.len(), 1);
    }

    #[test]
    fn test_interpret_plain_text() {
        let resp = interpret_generated("Just stay on lit streets.");
        assert_eq!(resp.confidence, 0.7);
        assert_eq!(resp.response, "Just stay on lit streets.");
    }

    #[test]
    fn test_interpret_broken_json() {
        let resp = interpret_generated(r#"{"response": "cut off"#);
        assert_eq!(resp.confidence, 0.5);
        let missing_field = interpret_generated(r#"{"reasoning": "no response field"}"#);
        assert_eq!(missing_field.confidence, 0.5);
    }

    #[test]
    fn test_interpret_clamps_confidence() {
        let resp = interpret_generated(r#"{"response": "ok", "confidence": 3.5}"#);
        assert_eq!(resp.confidence, 1.0);
    }

    #[test]
    fn test_fallback_response() {
        let resp = fallback_response("where is the exit");
        assert_eq!(resp.confidence, 0.6);
        assert_eq!(resp.actions, vec!["safety_check"]);
        assert!(resp.response.contains("where is the exit"));
    }

    #[test]
    fn test_describe_duration() {
        assert_eq!(describe_duration(120), "2 minutes");
        assert_eq!(describe_duration(60), "1 minute");
        assert_eq!(describe_duration(45), "45 seconds");
    }
}
