//! Safety check-ins.
//!
//! A check-in asks the user "are you okay?" and waits a fixed window. No
//! answer, or an explicit request for help, activates the emergency protocol.

use crate::escalation::{ActivationReport, EscalationEngine};
use crate::notifications::{Notification, NotificationHub};
use crate::types::Location;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const CHECK_IN_MESSAGE: &str = "Safety check-in: Are you okay?";
pub const MISSED_CHECK_IN_REASON: &str = "missed safety check-in";
pub const HELP_CHECK_IN_REASON: &str = "user requested help during safety check-in";

/// The user's answer to a check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInStatus {
    Safe,
    Help,
}

impl FromStr for CheckInStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" | "ok" | "okay" => Ok(CheckInStatus::Safe),
            "help" | "sos" => Ok(CheckInStatus::Help),
            other => Err(format!("unknown check-in response: {other}")),
        }
    }
}

/// Result of `CheckInCoordinator::respond`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckInOutcome {
    Acknowledged { check_in_id: Uuid },
    EscalationTriggered { check_in_id: Uuid, report: Box<ActivationReport> },
    NoPending,
}

struct PendingCheckIn {
    id: Uuid,
    location: Option<Location>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingCheckIn>>>;

pub struct CheckInCoordinator {
    escalation: Arc<EscalationEngine>,
    notifications: Arc<NotificationHub>,
    pending: PendingTable,
    window: Duration,
}

impl CheckInCoordinator {
    pub fn new(
        escalation: Arc<EscalationEngine>,
        notifications: Arc<NotificationHub>,
        window: Duration,
    ) -> Self {
        Self {
            escalation,
            notifications,
            pending: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    /// Ask the user to check in. If one is already pending its id is returned
    /// and no new timer is armed.
    pub async fn initiate(&self, user_id: &str, location: Option<Location>) -> Uuid {
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.get(user_id) {
            return existing.id;
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let handle = tokio::spawn(check_in_timer(
            self.pending.clone(),
            self.escalation.clone(),
            user_id.to_string(),
            id,
            token.clone(),
            self.window,
        ));
        pending.insert(
            user_id.to_string(),
            PendingCheckIn {
                id,
                location: location.clone(),
                token,
                handle,
            },
        );
        drop(pending);

        info!(user_id, check_in_id = %id, window_secs = self.window.as_secs(), "Check-in initiated");
        self.notifications
            .push(
                user_id,
                Notification::CheckInRequest {
                    check_in_id: id,
                    message: CHECK_IN_MESSAGE.to_string(),
                    timeout_secs: self.window.as_secs(),
                    location,
                },
            )
            .await;
        id
    }

    /// Handle the user's answer.
    pub async fn respond(
        &self,
        user_id: &str,
        status: CheckInStatus,
        location: Option<Location>,
    ) -> CheckInOutcome {
        let Some(entry) = self.pending.lock().await.remove(user_id) else {
            info!(user_id, ?status, "Check-in response with nothing pending");
            return CheckInOutcome::NoPending;
        };
        entry.token.cancel();
        entry.handle.abort();

        match status {
            CheckInStatus::Safe => {
                info!(user_id, check_in_id = %entry.id, "User checked in safe");
                CheckInOutcome::Acknowledged {
                    check_in_id: entry.id,
                }
            }
            CheckInStatus::Help => {
                warn!(user_id, check_in_id = %entry.id, "User asked for help during check-in");
                let report = self
                    .escalation
                    .activate(user_id, location.or(entry.location), HELP_CHECK_IN_REASON)
                    .await;
                CheckInOutcome::EscalationTriggered {
                    check_in_id: entry.id,
                    report: Box::new(report),
                }
            }
        }
    }

    pub async fn is_pending(&self, user_id: &str) -> bool {
        self.pending.lock().await.contains_key(user_id)
    }

    /// Disarm any pending check-in without escalating.
    pub async fn cancel(&self, user_id: &str) -> bool {
        match self.pending.lock().await.remove(user_id) {
            Some(entry) => {
                entry.token.cancel();
                entry.handle.abort();
                true
            }
            None => false,
        }
    }
}

async fn check_in_timer(
    pending: PendingTable,
    escalation: Arc<EscalationEngine>,
    user_id: String,
    id: Uuid,
    token: CancellationToken,
    window: Duration,
) {
    tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(window) => {}
    }

    let location = {
        let mut pending = pending.lock().await;
        let still_pending = pending.get(&user_id).is_some_and(|entry| entry.id == id);
        if !still_pending || token.is_cancelled() {
            return;
        }
        pending.remove(&user_id).and_then(|entry| entry.location)
    };

    warn!(user_id = %user_id, check_in_id = %id, "Check-in window expired");
    escalation
        .activate(&user_id, location, MISSED_CHECK_IN_REASON)
        .await;
}
