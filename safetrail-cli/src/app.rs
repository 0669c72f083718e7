//! Wiring of concrete adapters into a `SessionManager`.

use anyhow::Context;
use safetrail_core::agent::AgentServices;
use safetrail_core::checkin::CheckInCoordinator;
use safetrail_core::config::AgentConfig;
use safetrail_core::delivery::{
    ContactDirectory, LoggingAuthorityNotifier, LogOnlySender, MessageSender,
    StaticContactDirectory, TwilioSender,
};
use safetrail_core::dispatcher::ToolRegistry;
use safetrail_core::escalation::{EscalationEngine, PushSafetyMeasures};
use safetrail_core::generation::{GeminiGenerator, Generator, MockGenerator};
use safetrail_core::notifications::NotificationHub;
use safetrail_core::persistence::JsonFilePersistence;
use safetrail_core::session::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Build the production session manager from configuration.
pub fn build_session_manager(config: AgentConfig) -> anyhow::Result<Arc<SessionManager>> {
    let generator: Arc<dyn Generator> = match GeminiGenerator::new(&config.generation) {
        Ok(generator) => {
            info!(model = generator.model_name(), "Using Gemini generation");
            Arc::new(generator)
        }
        Err(e) => {
            warn!(error = %e, "Generation unavailable, responses will use local fallbacks");
            Arc::new(MockGenerator::new())
        }
    };

    let sender: Arc<dyn MessageSender> = match TwilioSender::from_env(&config.messaging) {
        Some(sender) => {
            info!("Using Twilio SMS delivery");
            Arc::new(sender)
        }
        None => {
            warn!("Twilio credentials not set, outbound messages are logged only");
            Arc::new(LogOnlySender)
        }
    };

    let contacts: Arc<dyn ContactDirectory> = match &config.storage.contacts_file {
        Some(path) => Arc::new(
            StaticContactDirectory::from_json_file(path)
                .with_context(|| format!("loading contacts from {}", path.display()))?,
        ),
        None => Arc::new(StaticContactDirectory::new()),
    };

    let notifications = Arc::new(NotificationHub::new(config.gateway.push_buffer));
    let escalation = Arc::new(
        EscalationEngine::new(
            contacts.clone(),
            sender,
            Arc::new(LoggingAuthorityNotifier),
            Arc::new(PushSafetyMeasures::new(notifications.clone())),
            Duration::from_secs(config.escalation.authority_delay_secs),
        )
        .with_notifications(notifications.clone()),
    );
    let checkins = Arc::new(CheckInCoordinator::new(
        escalation.clone(),
        notifications.clone(),
        Duration::from_secs(config.escalation.check_in_window_secs),
    ));

    let mut tools =
        ToolRegistry::new().with_timeout_cap(Duration::from_secs(config.tools.timeout_secs));
    safetrail_tools::register_builtin_tools(&mut tools, contacts, config.tools.seed);

    let memory_dir = config.storage.memory_dir();
    info!(dir = %memory_dir.display(), tools = tools.len(), "Agent services ready");

    let services = AgentServices {
        generator,
        tools: Arc::new(tools),
        escalation,
        checkins,
        persistence: Arc::new(JsonFilePersistence::new(memory_dir)),
        notifications,
    };
    Ok(Arc::new(SessionManager::new(Arc::new(config), services)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config.generation.api_key_env = "SAFETRAIL_TEST_UNSET_KEY".to_string();

        let manager = build_session_manager(config).unwrap();

        assert_eq!(manager.services().tools.len(), 8);
        let health = manager.health().await;
        assert_eq!(health.active_agents, 0);
        let weather = health
            .tools
            .iter()
            .find(|tool| tool.name == "weather_api")
            .unwrap();
        assert_eq!(
            weather.description,
            "Current weather conditions and their safety impact."
        );
    }

    #[test]
    fn test_missing_contacts_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config.storage.contacts_file = Some(dir.path().join("contacts.json"));
        assert!(build_session_manager(config).is_ok());
    }
}
