//! # SafeTrail Core
//!
//! Core library for the SafeTrail safety agent.
//! Provides the per-user agent orchestrator, intent classifier, planner,
//! tool dispatcher, bounded memory, autonomous monitor, and the staged
//! emergency escalation engine.

pub mod agent;
pub mod checkin;
pub mod classifier;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod escalation;
pub mod generation;
pub mod memory;
pub mod monitor;
pub mod notifications;
pub mod persistence;
pub mod planner;
pub mod session;
pub mod types;

// Re-export commonly used types at the crate root.
pub use agent::{Agent, AgentServices, AgentStats, RequestMode};
pub use checkin::{CheckInCoordinator, CheckInOutcome, CheckInStatus};
pub use classifier::{classify, mentions_location};
pub use config::{AgentConfig, load_config};
pub use dispatcher::{Tool, ToolContext, ToolInfo, ToolRegistry, ToolResult, ToolResults};
pub use error::{Result, SafeTrailError};
pub use escalation::{ActivationReport, EscalationEngine, EscalationStage, Incident};
pub use generation::{GeminiGenerator, Generator, MockGenerator};
pub use memory::{MemorySnapshot, MemoryStore};
pub use monitor::{RiskFactor, RiskLevel, SafetyAssessment};
pub use notifications::{Envelope, Notification, NotificationHub};
pub use persistence::{InMemoryPersistence, JsonFilePersistence, MemoryPersistence};
pub use planner::{Plan, PlanStep, Planner};
pub use session::SessionManager;
pub use types::{
    AgentResponse, AgentState, Classification, EmergencyContact, Intent, Location,
    RequestContext, Urgency,
};
