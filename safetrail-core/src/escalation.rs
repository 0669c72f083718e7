//! Staged, cancellable emergency escalation.
//!
//! An incident moves `Notified -> EscalationPending -> Escalated`, and can be
//! `Resolved` from any stage. Entering `EscalationPending` arms one delayed
//! authority alert. Stage changes and the timer's final check both happen
//! under the incident lock, so resolving before the deadline guarantees the
//! authority alert is never sent.

use crate::delivery::{AuthorityAlert, AuthorityNotifier, ContactDirectory, MessageSender};
use crate::error::EscalationError;
use crate::notifications::{Notification, NotificationHub, SafetyCommand};
use crate::types::Location;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStage {
    Notified,
    EscalationPending,
    Escalated,
    Resolved,
}

impl fmt::Display for EscalationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationStage::Notified => "notified",
            EscalationStage::EscalationPending => "escalation_pending",
            EscalationStage::Escalated => "escalated",
            EscalationStage::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

/// One emergency for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub user_id: String,
    pub reason: String,
    pub location: Option<Location>,
    pub stage: EscalationStage,
    pub activated_at: DateTime<Utc>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

impl Incident {
    fn new(user_id: &str, reason: &str, location: Option<Location>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            reason: reason.to_string(),
            location,
            stage: EscalationStage::Notified,
            activated_at: Utc::now(),
            escalated_at: None,
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.stage != EscalationStage::Resolved
    }
}

struct EscalationTimer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct IncidentEntry {
    incident: Incident,
    timer: Option<EscalationTimer>,
}

type IncidentTable = Arc<Mutex<HashMap<String, IncidentEntry>>>;

/// Per-recipient outcome of a contact batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub notified: usize,
    pub failed: usize,
}

/// What `activate` did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationReport {
    pub incident: Incident,
    pub contacts_notified: usize,
    pub contacts_failed: usize,
    /// True when an active incident was reused instead of starting a new one.
    pub already_active: bool,
}

/// Device-side measures taken during an emergency. Each call is best-effort.
#[async_trait]
pub trait SafetyMeasures: Send + Sync {
    async fn enable_continuous_tracking(&self, user_id: &str) -> Result<(), EscalationError>;

    async fn activate_alarm(&self, user_id: &str) -> Result<(), EscalationError>;

    async fn alert_nearby_users(
        &self,
        user_id: &str,
        location: Option<&Location>,
    ) -> Result<(), EscalationError>;

    async fn disable(&self, user_id: &str) -> Result<(), EscalationError>;
}

/// Measures carried out by pushing commands to the user's device.
pub struct PushSafetyMeasures {
    hub: Arc<NotificationHub>,
}

impl PushSafetyMeasures {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }

    async fn command(&self, user_id: &str, command: SafetyCommand) -> Result<(), EscalationError> {
        let measure = format!("{:?}", command);
        if self
            .hub
            .push(user_id, Notification::SafetyCommand { command })
            .await
        {
            Ok(())
        } else {
            Err(EscalationError::MeasureFailed {
                measure,
                message: "device not connected".to_string(),
            })
        }
    }
}

#[async_trait]
impl SafetyMeasures for PushSafetyMeasures {
    async fn enable_continuous_tracking(&self, user_id: &str) -> Result<(), EscalationError> {
        self.command(user_id, SafetyCommand::EnableContinuousTracking)
            .await
    }

    async fn activate_alarm(&self, user_id: &str) -> Result<(), EscalationError> {
        self.command(user_id, SafetyCommand::ActivateAlarm).await
    }

    async fn alert_nearby_users(
        &self,
        user_id: &str,
        location: Option<&Location>,
    ) -> Result<(), EscalationError> {
        // No community network is wired up; the alert is recorded in the log.
        info!(
            user_id,
            location = ?location.map(Location::grid_key),
            "Nearby user alert issued"
        );
        Ok(())
    }

    async fn disable(&self, user_id: &str) -> Result<(), EscalationError> {
        self.command(user_id, SafetyCommand::DisableEmergencyMeasures)
            .await
    }
}

/// Records measure calls, for tests.
#[derive(Default)]
pub struct RecordingSafetyMeasures {
    calls: std::sync::Mutex<Vec<String>>,
}

impl RecordingSafetyMeasures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: &str, user_id: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{call}:{user_id}"));
    }
}

#[async_trait]
impl SafetyMeasures for RecordingSafetyMeasures {
    async fn enable_continuous_tracking(&self, user_id: &str) -> Result<(), EscalationError> {
        self.record("tracking", user_id);
        Ok(())
    }

    async fn activate_alarm(&self, user_id: &str) -> Result<(), EscalationError> {
        self.record("alarm", user_id);
        Ok(())
    }

    async fn alert_nearby_users(
        &self,
        user_id: &str,
        _location: Option<&Location>,
    ) -> Result<(), EscalationError> {
        self.record("nearby", user_id);
        Ok(())
    }

    async fn disable(&self, user_id: &str) -> Result<(), EscalationError> {
        self.record("disable", user_id);
        Ok(())
    }
}

/// Coordinates incidents for all users.
pub struct EscalationEngine {
    contacts: Arc<dyn ContactDirectory>,
    sender: Arc<dyn MessageSender>,
    authority: Arc<dyn AuthorityNotifier>,
    measures: Arc<dyn SafetyMeasures>,
    notifications: Option<Arc<NotificationHub>>,
    incidents: IncidentTable,
    authority_delay: Duration,
}

impl EscalationEngine {
    pub fn new(
        contacts: Arc<dyn ContactDirectory>,
        sender: Arc<dyn MessageSender>,
        authority: Arc<dyn AuthorityNotifier>,
        measures: Arc<dyn SafetyMeasures>,
        authority_delay: Duration,
    ) -> Self {
        Self {
            contacts,
            sender,
            authority,
            measures,
            notifications: None,
            incidents: Arc::new(Mutex::new(HashMap::new())),
            authority_delay,
        }
    }

    /// Push stage changes to the user's device through `hub`.
    pub fn with_notifications(mut self, hub: Arc<NotificationHub>) -> Self {
        self.notifications = Some(hub);
        self
    }

    pub fn authority_delay(&self) -> Duration {
        self.authority_delay
    }

    /// Start the emergency protocol for `user_id`, or return the incident
    /// already in progress.
    pub async fn activate(
        &self,
        user_id: &str,
        location: Option<Location>,
        reason: &str,
    ) -> ActivationReport {
        let incident = {
            let mut incidents = self.incidents.lock().await;
            if let Some(entry) = incidents.get(user_id) {
                if entry.incident.is_active() {
                    info!(
                        user_id,
                        incident_id = %entry.incident.id,
                        stage = %entry.incident.stage,
                        "Emergency already active, reusing incident"
                    );
                    return ActivationReport {
                        incident: entry.incident.clone(),
                        contacts_notified: 0,
                        contacts_failed: 0,
                        already_active: true,
                    };
                }
            }
            let incident = Incident::new(user_id, reason, location.clone());
            incidents.insert(
                user_id.to_string(),
                IncidentEntry {
                    incident: incident.clone(),
                    timer: None,
                },
            );
            incident
        };

        warn!(user_id, incident_id = %incident.id, reason, "Emergency protocol activated");

        let delivery = match self
            .notify_contacts(user_id, location.as_ref(), reason)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                error!(user_id, incident_id = %incident.id, error = %e, "Contact notification failed");
                DeliveryReport::default()
            }
        };
        self.push_status(
            user_id,
            &incident,
            format!(
                "Emergency contacts notified ({} delivered, {} failed)",
                delivery.notified, delivery.failed
            ),
        )
        .await;

        let pending = self.arm_timer(user_id, incident.id).await;
        let current = match pending {
            Some(pending) => {
                self.push_status(
                    user_id,
                    &pending,
                    format!(
                        "Authorities will be alerted in {}s unless resolved",
                        self.authority_delay.as_secs()
                    ),
                )
                .await;
                self.activate_measures(user_id, location.as_ref()).await;
                pending
            }
            // Resolved while contacts were being notified.
            None => self.incident(user_id).await.unwrap_or(incident),
        };

        ActivationReport {
            incident: current,
            contacts_notified: delivery.notified,
            contacts_failed: delivery.failed,
            already_active: false,
        }
    }

    /// Move `Notified -> EscalationPending` and spawn the authority timer.
    async fn arm_timer(&self, user_id: &str, incident_id: Uuid) -> Option<Incident> {
        let mut incidents = self.incidents.lock().await;
        let entry = incidents.get_mut(user_id)?;
        if entry.incident.id != incident_id || entry.incident.stage != EscalationStage::Notified {
            return None;
        }
        entry.incident.stage = EscalationStage::EscalationPending;

        let token = CancellationToken::new();
        let handle = tokio::spawn(escalation_timer(
            self.incidents.clone(),
            self.authority.clone(),
            self.notifications.clone(),
            user_id.to_string(),
            incident_id,
            token.clone(),
            self.authority_delay,
        ));
        entry.timer = Some(EscalationTimer { token, handle });
        info!(
            user_id,
            incident_id = %incident_id,
            delay_secs = self.authority_delay.as_secs(),
            "Authority escalation scheduled"
        );
        Some(entry.incident.clone())
    }

    async fn activate_measures(&self, user_id: &str, location: Option<&Location>) {
        let results = [
            (
                "continuous_tracking",
                self.measures.enable_continuous_tracking(user_id).await,
            ),
            ("alarm", self.measures.activate_alarm(user_id).await),
            (
                "nearby_alert",
                self.measures.alert_nearby_users(user_id, location).await,
            ),
        ];
        for (measure, result) in results {
            if let Err(e) = result {
                warn!(user_id, measure, error = %e, "Safety measure failed");
            }
        }
    }

    /// Resolve the user's incident. Returns the resolved incident, or `None`
    /// when there was nothing to resolve.
    pub async fn resolve(&self, user_id: &str, resolution: &str) -> Option<Incident> {
        let (incident, timer) = {
            let mut incidents = self.incidents.lock().await;
            let entry = incidents.get_mut(user_id)?;
            if !entry.incident.is_active() {
                return None;
            }
            entry.incident.stage = EscalationStage::Resolved;
            entry.incident.resolved_at = Some(Utc::now());
            entry.incident.resolution = Some(resolution.to_string());
            (entry.incident.clone(), entry.timer.take())
        };

        if let Some(timer) = timer {
            timer.token.cancel();
            timer.handle.abort();
        }
        info!(user_id, incident_id = %incident.id, resolution, "Emergency resolved");

        if let Err(e) = self
            .send_update(user_id, &format!("RESOLVED: {resolution}"))
            .await
        {
            error!(user_id, error = %e, "Failed to send resolution update");
        }
        if let Err(e) = self.measures.disable(user_id).await {
            warn!(user_id, error = %e, "Failed to disable safety measures");
        }
        self.push_status(user_id, &incident, format!("Resolved: {resolution}"))
            .await;
        Some(incident)
    }

    /// Send the emergency alert text to every contact, one at a time. A failed
    /// recipient does not stop the others.
    pub async fn notify_contacts(
        &self,
        user_id: &str,
        location: Option<&Location>,
        message: &str,
    ) -> Result<DeliveryReport, EscalationError> {
        let body = emergency_alert_message(message, location, Utc::now());
        self.broadcast(user_id, &body).await
    }

    /// Send a status update to every contact.
    pub async fn send_update(
        &self,
        user_id: &str,
        update: &str,
    ) -> Result<DeliveryReport, EscalationError> {
        let body = format!(
            "SafeTrail Update for {user_id}:\n{update}\n\nTime: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );
        self.broadcast(user_id, &body).await
    }

    async fn broadcast(&self, user_id: &str, body: &str) -> Result<DeliveryReport, EscalationError> {
        let contacts = self.contacts.emergency_contacts(user_id).await?;
        if contacts.is_empty() {
            return Err(EscalationError::NoContacts {
                user_id: user_id.to_string(),
            });
        }

        let mut report = DeliveryReport::default();
        for contact in &contacts {
            if contact.phone.trim().is_empty() {
                warn!(user_id, contact = %contact.name, "Contact has no phone number");
                report.failed += 1;
                continue;
            }
            match self.sender.send(&contact.phone, body).await {
                Ok(message_id) => {
                    info!(user_id, contact = %contact.name, message_id, "Message delivered");
                    report.notified += 1;
                }
                Err(e) => {
                    error!(user_id, contact = %contact.name, error = %e, "Message delivery failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn incident(&self, user_id: &str) -> Option<Incident> {
        self.incidents
            .lock()
            .await
            .get(user_id)
            .map(|entry| entry.incident.clone())
    }

    pub async fn active_incident_count(&self) -> usize {
        self.incidents
            .lock()
            .await
            .values()
            .filter(|entry| entry.incident.is_active())
            .count()
    }

    async fn push_status(&self, user_id: &str, incident: &Incident, message: String) {
        push_status(self.notifications.as_deref(), user_id, incident, message).await;
    }
}

async fn push_status(
    hub: Option<&NotificationHub>,
    user_id: &str,
    incident: &Incident,
    message: String,
) {
    if let Some(hub) = hub {
        hub.push(
            user_id,
            Notification::EscalationStatus {
                incident_id: incident.id,
                stage: incident.stage,
                message,
            },
        )
        .await;
    }
}

/// Wait out the deadline, then escalate if the incident is still pending.
async fn escalation_timer(
    incidents: IncidentTable,
    authority: Arc<dyn AuthorityNotifier>,
    notifications: Option<Arc<NotificationHub>>,
    user_id: String,
    incident_id: Uuid,
    token: CancellationToken,
    delay: Duration,
) {
    tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let (incident, alert) = {
        let mut incidents = incidents.lock().await;
        let Some(entry) = incidents.get_mut(&user_id) else {
            return;
        };
        if token.is_cancelled()
            || entry.incident.id != incident_id
            || entry.incident.stage != EscalationStage::EscalationPending
        {
            return;
        }
        let now = Utc::now();
        entry.incident.stage = EscalationStage::Escalated;
        entry.incident.escalated_at = Some(now);
        entry.timer = None;
        let alert = AuthorityAlert {
            incident_id,
            user_id: user_id.clone(),
            reason: entry.incident.reason.clone(),
            location: entry.incident.location.clone(),
            timestamp: now,
        };
        (entry.incident.clone(), alert)
    };

    warn!(user_id = %user_id, incident_id = %incident_id, "Escalating to authorities");
    if let Err(e) = authority.notify(&alert).await {
        error!(user_id = %user_id, error = %e, "Authority notification failed");
    }
    push_status(
        notifications.as_deref(),
        &user_id,
        &incident,
        "Authorities have been alerted".to_string(),
    )
    .await;
}

/// The contact-facing alert text.
pub fn emergency_alert_message(
    reason: &str,
    location: Option<&Location>,
    at: DateTime<Utc>,
) -> String {
    let location_block = match location {
        Some(loc) => format!(
            "Last known location:\nLatitude: {}\nLongitude: {}\nGoogle Maps: {}",
            loc.lat,
            loc.lng,
            loc.maps_url()
        ),
        None => "Last known location: unknown".to_string(),
    };
    format!(
        "SAFETRAIL EMERGENCY ALERT\n\n{reason}\n\n{location_block}\n\nTime: {}\n\n\
         Please check on this person immediately or contact local authorities.",
        at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{RecordingAuthorityNotifier, RecordingSender, StaticContactDirectory};
    use crate::types::EmergencyContact;

    struct Fixture {
        engine: EscalationEngine,
        sender: Arc<RecordingSender>,
        authority: Arc<RecordingAuthorityNotifier>,
        measures: Arc<RecordingSafetyMeasures>,
    }

    async fn fixture() -> Fixture {
        let contacts = Arc::new(StaticContactDirectory::new());
        contacts
            .set_contacts(
                "u1",
                vec![
                    EmergencyContact::new("Ana", "+15550001"),
                    EmergencyContact::new("Ben", "+15550002"),
                ],
            )
            .await;
        let sender = Arc::new(RecordingSender::new());
        let authority = Arc::new(RecordingAuthorityNotifier::new());
        let measures = Arc::new(RecordingSafetyMeasures::new());
        let engine = EscalationEngine::new(
            contacts,
            sender.clone(),
            authority.clone(),
            measures.clone(),
            Duration::from_secs(300),
        );
        Fixture {
            engine,
            sender,
            authority,
            measures,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_notifies_and_arms_timer() {
        let f = fixture().await;
        let report = f
            .engine
            .activate("u1", Some(Location::new(1.0, 2.0)), "help requested")
            .await;
        assert_eq!(report.contacts_notified, 2);
        assert_eq!(report.incident.stage, EscalationStage::EscalationPending);
        assert_eq!(f.sender.count_containing("SAFETRAIL EMERGENCY ALERT"), 2);
        assert_eq!(
            f.measures.calls(),
            vec!["tracking:u1", "alarm:u1", "nearby:u1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_activation_reuses_incident() {
        let f = fixture().await;
        let first = f.engine.activate("u1", None, "first").await;
        let second = f.engine.activate("u1", None, "second").await;
        assert!(second.already_active);
        assert_eq!(first.incident.id, second.incident.id);
        assert_eq!(f.sender.count_containing("SAFETRAIL EMERGENCY ALERT"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_after_deadline() {
        let f = fixture().await;
        f.engine.activate("u1", None, "no response").await;
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(f.authority.count(), 1);
        let incident = f.engine.incident("u1").await.unwrap();
        assert_eq!(incident.stage, EscalationStage::Escalated);
        assert_eq!(f.authority.alerts()[0].reason, "no response");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_cancels_timer() {
        let f = fixture().await;
        f.engine.activate("u1", None, "scare").await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        let resolved = f.engine.resolve("u1", "false alarm").await;
        assert!(resolved.is_some());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(f.authority.count(), 0);
        assert_eq!(f.sender.count_containing("RESOLVED: false alarm"), 2);
        assert!(f.measures.calls().contains(&"disable:u1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_twice_is_noop() {
        let f = fixture().await;
        f.engine.activate("u1", None, "scare").await;
        assert!(f.engine.resolve("u1", "ok").await.is_some());
        assert!(f.engine.resolve("u1", "ok").await.is_none());
        assert_eq!(f.sender.count_containing("RESOLVED"), 2);
        assert_eq!(f.engine.active_incident_count().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_without_incident() {
        let f = fixture().await;
        assert!(f.engine.resolve("nobody", "ok").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_contact_does_not_block_others() {
        let f = fixture().await;
        f.sender.fail_for("+15550001");
        let report = f.engine.activate("u1", None, "help").await;
        assert_eq!(report.contacts_notified, 1);
        assert_eq!(report.contacts_failed, 1);
        assert_eq!(report.incident.stage, EscalationStage::EscalationPending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_contacts_still_escalates() {
        let f = fixture().await;
        let report = f.engine.activate("loner", None, "help").await;
        assert_eq!(report.contacts_notified, 0);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(f.authority.count(), 1);
    }

    #[test]
    fn test_alert_message_format() {
        let text = emergency_alert_message("Test reason", Some(&Location::new(3.0, 4.0)), Utc::now());
        assert!(text.contains("Test reason"));
        assert!(text.contains("Latitude: 3"));
        assert!(text.contains("https://maps.google.com/?q=3,4"));
        assert!(text.ends_with("contact local authorities."));
    }
}
