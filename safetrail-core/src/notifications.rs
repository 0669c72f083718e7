//! Typed push notifications delivered to a user's connected device.

use crate::escalation::EscalationStage;
use crate::monitor::{RiskFactor, RiskLevel};
use crate::types::{AgentResponse, Location};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

/// Commands sent to the device while an emergency is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCommand {
    EnableContinuousTracking,
    ActivateAlarm,
    DisableEmergencyMeasures,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ConversationalResponse {
        data: Box<AgentResponse>,
    },
    RiskAlert {
        message: String,
        risk_level: RiskLevel,
        risk_factors: Vec<RiskFactor>,
    },
    Advisory {
        message: String,
        risk_factors: Vec<RiskFactor>,
    },
    CheckInRequest {
        check_in_id: Uuid,
        message: String,
        timeout_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<Location>,
    },
    EscalationStatus {
        incident_id: Uuid,
        stage: EscalationStage,
        message: String,
    },
    SafetyCommand {
        command: SafetyCommand,
    },
}

/// A notification addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub notification: Notification,
}

/// Per-user bounded push channels.
pub struct NotificationHub {
    channels: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
    capacity: usize,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open a channel for `user_id`, replacing any previous one.
    pub async fn connect(&self, user_id: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let replaced = self
            .channels
            .write()
            .await
            .insert(user_id.to_string(), tx)
            .is_some();
        debug!(user_id, replaced, "Push channel connected");
        rx
    }

    pub async fn disconnect(&self, user_id: &str) -> bool {
        self.channels.write().await.remove(user_id).is_some()
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.channels
            .read()
            .await
            .get(user_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub async fn connected_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Queue a notification. Returns false if the user is not connected or
    /// the channel is full; a full channel drops the notification.
    pub async fn push(&self, user_id: &str, notification: Notification) -> bool {
        let envelope = Envelope {
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
            notification,
        };
        let channels = self.channels.read().await;
        let Some(tx) = channels.get(user_id) else {
            return false;
        };
        match tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id, "Push channel full, dropping notification");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id, "Push channel closed");
                false
            }
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(64)
    }
}
