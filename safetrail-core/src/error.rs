//! Error types for the SafeTrail core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering generation, tool execution, memory, configuration, escalation,
//! message delivery, and agent lifecycle domains.

use std::path::PathBuf;

/// Top-level error type for the SafeTrail core library.
#[derive(Debug, thiserror::Error)]
pub enum SafeTrailError {
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Escalation error: {0}")]
    Escalation(#[from] EscalationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the text generation capability.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Provider returned no text")]
    EmptyResponse,
}

/// Errors from tool registration and execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Tool already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool '{name}' execution failed: {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("Tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },
}

/// Errors from the memory system and its persistence.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory persistence error: {message}")]
    PersistenceError { message: String },

    #[error("Failed to load memory for user {user_id}: {message}")]
    LoadFailed { user_id: String, message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the escalation engine.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("No emergency contacts on file for user {user_id}")]
    NoContacts { user_id: String },

    #[error("Contact lookup failed for user {user_id}: {message}")]
    ContactLookup { user_id: String, message: String },

    #[error("Safety measure '{measure}' failed: {message}")]
    MeasureFailed { measure: String, message: String },
}

/// Errors from outbound message delivery.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to send message to {recipient}: {message}")]
    SendFailed { recipient: String, message: String },

    #[error("Delivery provider rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Recipient has no phone number: {name}")]
    MissingPhone { name: String },

    #[error("Authority notification failed: {message}")]
    AuthorityUnreachable { message: String },
}

/// Errors from the agent orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },

    #[error("Monitoring is already running for user {user_id}")]
    MonitorAlreadyRunning { user_id: String },

    #[error("Monitoring is not running for user {user_id}")]
    MonitorNotRunning { user_id: String },

    #[error("No agent found for user {user_id}")]
    UnknownUser { user_id: String },
}

/// A type alias for results using the top-level `SafeTrailError`.
pub type Result<T> = std::result::Result<T, SafeTrailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_generation() {
        let err = SafeTrailError::Generation(GenerationError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "Generation error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_tool() {
        let err = SafeTrailError::Tool(ToolError::NotFound {
            name: "nonexistent".into(),
        });
        assert_eq!(err.to_string(), "Tool error: Tool not found: nonexistent");
    }

    #[test]
    fn test_error_display_delivery() {
        let err = SafeTrailError::Delivery(DeliveryError::SendFailed {
            recipient: "+15550100".into(),
            message: "timeout".into(),
        });
        assert_eq!(
            err.to_string(),
            "Delivery error: Failed to send message to +15550100: timeout"
        );
    }

    #[test]
    fn test_error_display_agent() {
        let err = SafeTrailError::Agent(AgentError::MalformedRequest {
            reason: "message is empty".into(),
        });
        assert_eq!(
            err.to_string(),
            "Agent error: Malformed request: message is empty"
        );
    }

    #[test]
    fn test_error_display_escalation() {
        let err = EscalationError::NoContacts {
            user_id: "u-1".into(),
        };
        assert_eq!(err.to_string(), "No emergency contacts on file for user u-1");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SafeTrailError = io_err.into();
        assert!(matches!(err, SafeTrailError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: SafeTrailError = serde_err.into();
        assert!(matches!(err, SafeTrailError::Serialization(_)));
    }

    #[test]
    fn test_tool_error_variants() {
        let err = ToolError::Timeout {
            name: "weather_api".into(),
            timeout_secs: 15,
        };
        assert_eq!(err.to_string(), "Tool 'weather_api' timed out after 15s");
    }
}
