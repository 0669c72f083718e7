//! Outbound delivery: emergency contacts, SMS, and authority alerts.

use crate::config::MessagingConfig;
use crate::error::{DeliveryError, EscalationError};
use crate::types::{EmergencyContact, Location};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Looks up the people to alert for a user.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn emergency_contacts(
        &self,
        user_id: &str,
    ) -> Result<Vec<EmergencyContact>, EscalationError>;
}

/// Contacts held in memory, optionally seeded from a JSON file of the form
/// `{"user-id": [{"name": "...", "phone": "..."}]}`.
#[derive(Default)]
pub struct StaticContactDirectory {
    contacts: RwLock<HashMap<String, Vec<EmergencyContact>>>,
}

impl StaticContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, Vec<EmergencyContact>>) -> Self {
        Self {
            contacts: RwLock::new(map),
        }
    }

    /// Load from `path`. A missing file yields an empty directory.
    pub fn from_json_file(path: &Path) -> Result<Self, EscalationError> {
        let map: Option<HashMap<String, Vec<EmergencyContact>>> =
            crate::persistence::load_json(path).map_err(|e| EscalationError::ContactLookup {
                user_id: "*".to_string(),
                message: format!("failed to read {}: {}", path.display(), e),
            })?;
        Ok(Self::from_map(map.unwrap_or_default()))
    }

    pub async fn set_contacts(&self, user_id: &str, contacts: Vec<EmergencyContact>) {
        self.contacts
            .write()
            .await
            .insert(user_id.to_string(), contacts);
    }
}

#[async_trait]
impl ContactDirectory for StaticContactDirectory {
    async fn emergency_contacts(
        &self,
        user_id: &str,
    ) -> Result<Vec<EmergencyContact>, EscalationError> {
        Ok(self
            .contacts
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Sends a text message, returning the provider's message id.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, phone: &str, body: &str) -> Result<String, DeliveryError>;
}

/// SMS through the Twilio Messages API.
pub struct TwilioSender {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSender {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid,
            auth_token,
            from_number,
        }
    }

    /// Build from the environment variables named in `config`, if all are set.
    pub fn from_env(config: &MessagingConfig) -> Option<Self> {
        let sid = std::env::var(&config.account_sid_env).ok()?;
        let token = std::env::var(&config.auth_token_env).ok()?;
        let from = std::env::var(&config.from_number_env).ok()?;
        Some(Self::new(sid, token, from))
    }
}

#[async_trait]
impl MessageSender for TwilioSender {
    async fn send(&self, phone: &str, body: &str) -> Result<String, DeliveryError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );
        let auth = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("{}:{}", self.account_sid, self.auth_token),
        );
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Basic {auth}"))
            .form(&[("To", phone), ("From", &self.from_number), ("Body", body)])
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed {
                recipient: phone.to_string(),
                message: format!("HTTP error: {e}"),
            })?;

        let status = resp.status();
        let json: serde_json::Value = resp.json().await.map_err(|e| DeliveryError::SendFailed {
            recipient: phone.to_string(),
            message: format!("JSON parse error: {e}"),
        })?;

        if !status.is_success() {
            let msg = json["message"].as_str().unwrap_or("unknown error");
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                message: msg.to_string(),
            });
        }

        Ok(json["sid"].as_str().unwrap_or("unknown").to_string())
    }
}

/// Logs messages instead of sending them. Used when no SMS provider is configured.
#[derive(Default)]
pub struct LogOnlySender;

#[async_trait]
impl MessageSender for LogOnlySender {
    async fn send(&self, phone: &str, body: &str) -> Result<String, DeliveryError> {
        let preview: String = body.chars().take(100).collect();
        info!(recipient = phone, preview = %preview, "SMS delivery disabled, message logged");
        Ok(format!("log-{}", Uuid::new_v4()))
    }
}

/// A message captured by `RecordingSender`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub phone: String,
    pub body: String,
}

/// Captures sent messages; selected numbers can be made to fail.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `phone` fail.
    pub fn fail_for(&self, phone: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(phone.to_string());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages whose body contains `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.sent().iter().filter(|m| m.body.contains(needle)).count()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, phone: &str, body: &str) -> Result<String, DeliveryError> {
        let fails = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(phone);
        if fails {
            return Err(DeliveryError::SendFailed {
                recipient: phone.to_string(),
                message: "simulated failure".to_string(),
            });
        }
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent.push(SentMessage {
            phone: phone.to_string(),
            body: body.to_string(),
        });
        Ok(format!("rec-{}", sent.len()))
    }
}

/// An escalation to emergency services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityAlert {
    pub incident_id: Uuid,
    pub user_id: String,
    pub reason: String,
    pub location: Option<Location>,
    pub timestamp: DateTime<Utc>,
}

impl AuthorityAlert {
    /// The fixed-format alert text.
    pub fn render(&self) -> String {
        let location = self
            .location
            .as_ref()
            .map(Location::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "AUTOMATED SAFETY ALERT - SafeTrail App\n\n\
             User ID: {}\n\
             Reason: {}\n\
             Location: {}\n\
             Time: {}\n\n\
             This is an automated alert from SafeTrail safety monitoring system.\n\
             User was unresponsive to safety check-ins or triggered emergency manually.",
            self.user_id,
            self.reason,
            location,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

/// Delivers authority alerts.
#[async_trait]
pub trait AuthorityNotifier: Send + Sync {
    async fn notify(&self, alert: &AuthorityAlert) -> Result<(), DeliveryError>;
}

/// Writes authority alerts to the log. No emergency-dispatch integration exists.
#[derive(Default)]
pub struct LoggingAuthorityNotifier;

#[async_trait]
impl AuthorityNotifier for LoggingAuthorityNotifier {
    async fn notify(&self, alert: &AuthorityAlert) -> Result<(), DeliveryError> {
        warn!(
            user_id = %alert.user_id,
            incident_id = %alert.incident_id,
            message = %alert.render(),
            "Escalating to authorities"
        );
        Ok(())
    }
}

/// Captures authority alerts for inspection.
#[derive(Default)]
pub struct RecordingAuthorityNotifier {
    alerts: Mutex<Vec<AuthorityAlert>>,
}

impl RecordingAuthorityNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<AuthorityAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl AuthorityNotifier for RecordingAuthorityNotifier {
    async fn notify(&self, alert: &AuthorityAlert) -> Result<(), DeliveryError> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_static_directory_unknown_user_is_empty() {
        let dir = StaticContactDirectory::new();
        dir.set_contacts("u1", vec![EmergencyContact::new("Mom", "+15550001")])
            .await;
        assert_eq!(dir.emergency_contacts("u1").await.unwrap().len(), 1);
        assert!(dir.emergency_contacts("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_from_json_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("contacts.json");
        std::fs::write(
            &path,
            r#"{"alice": [{"name": "Bob", "phone": "+15550100"}]}"#,
        )
        .unwrap();
        let dir = StaticContactDirectory::from_json_file(&path).unwrap();
        let contacts = dir.emergency_contacts("alice").await.unwrap();
        assert_eq!(contacts[0].name, "Bob");

        let missing = StaticContactDirectory::from_json_file(&tmp.path().join("none.json"));
        assert!(missing.is_ok());
    }

    #[tokio::test]
    async fn test_recording_sender_failure() {
        let sender = RecordingSender::new();
        sender.fail_for("+1bad");
        assert!(sender.send("+1bad", "hi").await.is_err());
        assert!(sender.send("+1good", "hi").await.is_ok());
        assert_eq!(sender.sent().len(), 1);
    }

    #[test]
    fn test_authority_alert_format() {
        let alert = AuthorityAlert {
            incident_id: Uuid::new_v4(),
            user_id: "u-7".into(),
            reason: "missed safety check-in".into(),
            location: Some(Location::new(1.5, -2.5)),
            timestamp: Utc::now(),
        };
        let text = alert.render();
        assert!(text.starts_with("AUTOMATED SAFETY ALERT - SafeTrail App"));
        assert!(text.contains("User ID: u-7"));
        assert!(text.contains("Reason: missed safety check-in"));
        assert!(text.contains("Location: 1.5, -2.5"));
    }
}
