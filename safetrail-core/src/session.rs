//! Per-user session registry.
//!
//! `SessionManager` owns one `Agent` per user and is the entry point used by
//! transports. Agents are created lazily and race-free: each user maps to a
//! `OnceCell`, so concurrent first messages share one agent and one memory
//! load.

use crate::agent::{Agent, AgentServices, AgentStats, RequestMode};
use crate::checkin::{CheckInOutcome, CheckInStatus};
use crate::config::AgentConfig;
use crate::dispatcher::ToolInfo;
use crate::error::AgentError;
use crate::escalation::{ActivationReport, Incident};
use crate::notifications::{Envelope, Notification};
use crate::types::{AgentResponse, Location, RequestContext, Urgency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tracing::{info, warn};

pub const GREETING: &str = "Hello! I'm your SafeTrail AI assistant. I'm here to help with navigation, safety monitoring, and emergency assistance. How can I help keep you safe today?";
pub const FAREWELL: &str = "Thank you for using SafeTrail. Stay safe!";
pub const MANUAL_EMERGENCY_REASON: &str = "Emergency triggered manually";

const GREETING_PROMPT: &str =
    "Hello! I'm your SafeTrail AI assistant. How can I help keep you safe today?";

pub const AVAILABLE_FEATURES: [&str; 5] = [
    "Route planning with safety optimization",
    "Real-time safety monitoring",
    "Emergency assistance",
    "Weather and traffic updates",
    "Personalized safety recommendations",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    #[serde(flatten)]
    pub response: AgentResponse,
    pub session_started: bool,
    pub available_features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnd {
    pub response: String,
    pub session_ended: bool,
    pub timestamp: DateTime<Utc>,
}

/// Process-wide counters for the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub active_agents: usize,
    pub connected_clients: usize,
    pub active_incidents: usize,
    pub registered_tools: usize,
    pub tools: Vec<ToolInfo>,
    pub uptime_secs: i64,
}

type AgentSlot = Arc<OnceCell<Arc<Agent>>>;

pub struct SessionManager {
    config: Arc<AgentConfig>,
    services: AgentServices,
    agents: Mutex<HashMap<String, AgentSlot>>,
    started_at: DateTime<Utc>,
}

impl SessionManager {
    pub fn new(config: Arc<AgentConfig>, services: AgentServices) -> Self {
        Self {
            config,
            services,
            agents: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Get or create the agent for `user_id`, loading persisted memory on
    /// first use. An agent being retired by `end_session` is waited out, so
    /// its replacement loads the flushed memory.
    pub async fn agent(&self, user_id: &str) -> Result<Arc<Agent>, AgentError> {
        let user_id = validate_user_id(user_id)?;
        loop {
            let slot = {
                let mut agents = self.agents.lock().await;
                agents.entry(user_id.to_string()).or_default().clone()
            };
            let agent = slot
                .get_or_init(|| self.create_agent(user_id))
                .await
                .clone();
            if !agent.is_retired() {
                return Ok(agent);
            }
            agent.wait_released().await;
        }
    }

    /// Run a request on the user's live agent. A request that queued on an
    /// agent which was retired meanwhile is replayed on its replacement.
    async fn run_request(
        &self,
        user_id: &str,
        text: &str,
        context: RequestContext,
        mode: RequestMode,
    ) -> Result<AgentResponse, AgentError> {
        loop {
            let agent = self.agent(user_id).await?;
            if let Some(response) = agent.submit(text, context.clone(), mode).await {
                return Ok(response);
            }
        }
    }

    async fn create_agent(&self, user_id: &str) -> Arc<Agent> {
        let agent = Agent::new(user_id, self.config.clone(), self.services.clone());
        match self.services.persistence.load(user_id).await {
            Ok(Some(snapshot)) => {
                info!(user_id, revision = snapshot.revision(), "Restored agent memory");
                agent.restore_memory(snapshot).await;
            }
            Ok(None) => info!(user_id, "Created agent with fresh memory"),
            Err(e) => warn!(user_id, error = %e, "Memory load failed, starting fresh"),
        }
        Arc::new(agent)
    }

    /// The agent for `user_id` if one has been created.
    pub async fn existing_agent(&self, user_id: &str) -> Option<Arc<Agent>> {
        let slot = self.agents.lock().await.get(user_id).cloned()?;
        slot.get().cloned()
    }

    pub async fn active_agents(&self) -> usize {
        self.agents
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Run one chat message and push the answer to the user's channel.
    pub async fn process_conversation(
        &self,
        user_id: &str,
        message: &str,
        context: RequestContext,
    ) -> Result<AgentResponse, AgentError> {
        let response = self
            .run_request(user_id, message, context, RequestMode::Conversation)
            .await?;
        self.services
            .notifications
            .push(
                user_id,
                Notification::ConversationalResponse {
                    data: Box::new(response.clone()),
                },
            )
            .await;
        Ok(response)
    }

    pub async fn start_session(
        &self,
        user_id: &str,
        context: RequestContext,
    ) -> Result<SessionStart, AgentError> {
        let mut response = self
            .run_request(user_id, GREETING_PROMPT, context, RequestMode::Greeting)
            .await?;
        response.response = GREETING.to_string();
        info!(user_id, "Session started");
        Ok(SessionStart {
            response,
            session_started: true,
            available_features: AVAILABLE_FEATURES.iter().map(|f| f.to_string()).collect(),
        })
    }

    /// Stop monitoring, drop the push channel, drain and flush the agent and
    /// release it. The next message recreates it from persisted memory.
    pub async fn end_session(&self, user_id: &str) -> Result<SessionEnd, AgentError> {
        let user_id = validate_user_id(user_id)?;
        self.disconnect(user_id).await;
        self.services.checkins.cancel(user_id).await;

        if let Some(agent) = self.existing_agent(user_id).await {
            let _drained = agent.retire().await;
            let mut agents = self.agents.lock().await;
            let owns_slot = agents
                .get(user_id)
                .and_then(|slot| slot.get())
                .is_some_and(|current| Arc::ptr_eq(current, &agent));
            if owns_slot {
                agents.remove(user_id);
            }
        }

        info!(user_id, "Session ended");
        Ok(SessionEnd {
            response: FAREWELL.to_string(),
            session_ended: true,
            timestamp: Utc::now(),
        })
    }

    /// Open the user's push channel and start autonomous monitoring.
    pub async fn connect(&self, user_id: &str) -> Result<mpsc::Receiver<Envelope>, AgentError> {
        let agent = self.agent(user_id).await?;
        let receiver = self.services.notifications.connect(user_id).await;
        match agent.start_monitoring().await {
            Ok(()) | Err(AgentError::MonitorAlreadyRunning { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(user_id, "Client connected");
        Ok(receiver)
    }

    pub async fn disconnect(&self, user_id: &str) {
        if let Some(agent) = self.existing_agent(user_id).await {
            // Not running is fine here.
            let _ = agent.stop_monitoring().await;
        }
        if self.services.notifications.disconnect(user_id).await {
            info!(user_id, "Client disconnected");
        }
    }

    pub async fn update_location(
        &self,
        user_id: &str,
        location: Location,
    ) -> Result<(), AgentError> {
        self.agent(user_id).await?.update_location(location).await
    }

    pub async fn check_in_response(
        &self,
        user_id: &str,
        status: CheckInStatus,
        location: Option<Location>,
    ) -> Result<CheckInOutcome, AgentError> {
        let agent = self.agent(user_id).await?;
        if let Some(location) = location.clone() {
            agent.update_location(location).await?;
        }
        let location = match location {
            Some(location) => Some(location),
            None => agent.last_location().await,
        };
        Ok(self
            .services
            .checkins
            .respond(user_id, status, location)
            .await)
    }

    /// Manually start the emergency protocol.
    pub async fn trigger_emergency(
        &self,
        user_id: &str,
        location: Option<Location>,
        reason: Option<&str>,
    ) -> Result<ActivationReport, AgentError> {
        let agent = self.agent(user_id).await?;
        if let Some(location) = location.clone() {
            agent.update_location(location).await?;
        }
        let location = match location {
            Some(location) => Some(location),
            None => agent.last_location().await,
        };
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(MANUAL_EMERGENCY_REASON);

        agent
            .record_incident("manual_emergency", Urgency::Critical, reason, location.clone())
            .await;
        Ok(self
            .services
            .escalation
            .activate(user_id, location, reason)
            .await)
    }

    /// Resolve the user's active incident. `None` when nothing was active.
    pub async fn resolve_emergency(
        &self,
        user_id: &str,
        resolution: &str,
    ) -> Result<Option<Incident>, AgentError> {
        let user_id = validate_user_id(user_id)?;
        Ok(self.services.escalation.resolve(user_id, resolution).await)
    }

    pub async fn stats(&self, user_id: &str) -> Result<AgentStats, AgentError> {
        let agent = self
            .existing_agent(user_id)
            .await
            .ok_or_else(|| AgentError::UnknownUser {
                user_id: user_id.to_string(),
            })?;
        Ok(agent.stats().await)
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_agents: self.active_agents().await,
            connected_clients: self.services.notifications.connected_count().await,
            active_incidents: self.services.escalation.active_incident_count().await,
            registered_tools: self.services.tools.len(),
            tools: self.services.tools.list_tools(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}

fn validate_user_id(user_id: &str) -> Result<&str, AgentError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(AgentError::MalformedRequest {
            reason: "user id is empty".to_string(),
        });
    }
    if trimmed.len() > 128 {
        return Err(AgentError::MalformedRequest {
            reason: "user id is longer than 128 characters".to_string(),
        });
    }
    Ok(trimmed)
}
