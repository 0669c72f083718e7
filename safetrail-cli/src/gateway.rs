//! HTTP and WebSocket gateway built on axum.
//!
//! REST routes cover chat, session lifecycle, stats, and manual emergencies.
//! `/ws/agentic/{user_id}` carries push notifications to the device and
//! accepts chat, location, and check-in messages from it.

use futures::SinkExt;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use safetrail_core::checkin::CheckInStatus;
use safetrail_core::config::GatewayConfig;
use safetrail_core::error::AgentError;
use safetrail_core::session::SessionManager;
use safetrail_core::types::{Location, RequestContext};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub type SharedSessions = Arc<SessionManager>;

const DEFAULT_RESOLUTION: &str = "Resolved by user";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub context: RequestContext,
}

#[derive(Debug, Deserialize)]
pub struct EmergencyRequest {
    pub user_id: String,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub user_id: String,
    #[serde(default)]
    pub resolution: Option<String>,
}

/// Messages a device sends over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ChatMessage {
        message: String,
        #[serde(default)]
        context: RequestContext,
    },
    LocationUpdate {
        location: Location,
    },
    CheckInResponse {
        #[serde(alias = "status")]
        response: String,
        #[serde(default)]
        location: Option<Location>,
    },
}

/// Direct replies on the WebSocket. Push notifications are sent as
/// `Envelope`s.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    LocationAck,
    CheckInResult {
        #[serde(flatten)]
        outcome: serde_json::Value,
    },
    Error {
        code: String,
        message: String,
    },
}

/// An `AgentError` rendered as an HTTP response.
pub struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            AgentError::UnknownUser { .. } => StatusCode::NOT_FOUND,
            AgentError::MonitorAlreadyRunning { .. } | AgentError::MonitorNotRunning { .. } => {
                StatusCode::CONFLICT
            }
        };
        let body = json!({ "status": "error", "detail": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the router with all REST and WebSocket routes.
pub fn router(sessions: SharedSessions, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/agentic/chat/{user_id}", post(chat_handler))
        .route(
            "/api/agentic/start-session/{user_id}",
            post(start_session_handler),
        )
        .route("/api/agentic/end-session/{user_id}", post(end_session_handler))
        .route("/api/agentic/stats/{user_id}", get(stats_handler))
        .route("/api/emergency/trigger", post(trigger_handler))
        .route("/api/emergency/resolve", post(resolve_handler))
        .route("/ws/agentic/{user_id}", get(ws_handler))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(sessions)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

async fn health_handler(State(sessions): State<SharedSessions>) -> impl IntoResponse {
    Json(sessions.health().await)
}

async fn chat_handler(
    State(sessions): State<SharedSessions>,
    Path(user_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = sessions
        .process_conversation(&user_id, &request.message, request.context)
        .await?;
    Ok(Json(json!({ "status": "success", "response": response })))
}

async fn start_session_handler(
    State(sessions): State<SharedSessions>,
    Path(user_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let context = if body.is_empty() {
        RequestContext::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AgentError::MalformedRequest {
            reason: format!("invalid session context: {e}"),
        })?
    };
    let start = sessions.start_session(&user_id, context).await?;
    Ok(Json(json!({ "status": "session_started", "response": start })))
}

async fn end_session_handler(
    State(sessions): State<SharedSessions>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let end = sessions.end_session(&user_id).await?;
    Ok(Json(json!({ "status": "session_ended", "response": end })))
}

async fn stats_handler(
    State(sessions): State<SharedSessions>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = sessions.stats(&user_id).await?;
    Ok(Json(json!({ "status": "success", "stats": stats })))
}

async fn trigger_handler(
    State(sessions): State<SharedSessions>,
    Json(request): Json<EmergencyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = sessions
        .trigger_emergency(
            &request.user_id,
            request.location,
            request.message.as_deref(),
        )
        .await?;
    Ok(Json(json!({
        "status": "emergency_activated",
        "user_id": request.user_id,
        "incident": report,
    })))
}

async fn resolve_handler(
    State(sessions): State<SharedSessions>,
    Json(request): Json<ResolveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolution = request.resolution.as_deref().unwrap_or(DEFAULT_RESOLUTION);
    let body = match sessions
        .resolve_emergency(&request.user_id, resolution)
        .await?
    {
        Some(incident) => json!({ "status": "resolved", "incident": incident }),
        None => json!({ "status": "no_active_emergency", "user_id": request.user_id }),
    };
    Ok(Json(body))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(sessions): State<SharedSessions>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, sessions, user_id))
}

/// Forward pushes to the socket and handle inbound messages until either side
/// closes.
async fn handle_socket(mut socket: WebSocket, sessions: SharedSessions, user_id: String) {
    let mut pushes = match sessions.connect(&user_id).await {
        Ok(rx) => rx,
        Err(e) => {
            let reply = ServerReply::Error {
                code: "CONNECT_FAILED".to_string(),
                message: e.to_string(),
            };
            send_json(&mut socket, &reply).await;
            let _ = socket.close().await;
            return;
        }
    };
    info!(user_id = %user_id, "WebSocket connected");

    loop {
        tokio::select! {
            push = pushes.recv() => {
                // Channel replaced by a newer connection or hub dropped.
                let Some(envelope) = push else { break };
                if !send_json(&mut socket, &envelope).await {
                    break;
                }
            }
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(WsMessage::Text(t))) => t.to_string(),
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                if let Some(reply) = handle_client_text(&sessions, &user_id, &text).await {
                    if !send_json(&mut socket, &reply).await {
                        break;
                    }
                }
            }
        }
    }

    // Only tear down if this socket still owns the channel.
    if pushes.is_closed() {
        debug!(user_id = %user_id, "Channel taken over by a newer connection");
    } else {
        sessions.disconnect(&user_id).await;
    }
    info!(user_id = %user_id, "WebSocket disconnected");
}

async fn handle_client_text(
    sessions: &SessionManager,
    user_id: &str,
    text: &str,
) -> Option<ServerReply> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return Some(ServerReply::Error {
                code: "PARSE_ERROR".to_string(),
                message: format!("Invalid message: {}", e),
            });
        }
    };

    let result = match message {
        ClientMessage::ChatMessage { message, context } => sessions
            .process_conversation(user_id, &message, context)
            .await
            // The answer arrives as a conversational_response push.
            .map(|_| None),
        ClientMessage::LocationUpdate { location } => sessions
            .update_location(user_id, location)
            .await
            .map(|()| Some(ServerReply::LocationAck)),
        ClientMessage::CheckInResponse { response, location } => {
            let status: CheckInStatus = match response.parse() {
                Ok(status) => status,
                Err(reason) => {
                    return Some(ServerReply::Error {
                        code: "INVALID_CHECK_IN".to_string(),
                        message: reason,
                    });
                }
            };
            sessions
                .check_in_response(user_id, status, location)
                .await
                .map(|outcome| {
                    Some(ServerReply::CheckInResult {
                        outcome: serde_json::to_value(outcome).unwrap_or_default(),
                    })
                })
        }
    };

    result.unwrap_or_else(|e| {
        Some(ServerReply::Error {
            code: "REJECTED".to_string(),
            message: e.to_string(),
        })
    })
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => socket.send(WsMessage::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode WebSocket message");
            true
        }
    }
}

/// Serve until the process is interrupted.
pub async fn run(sessions: SharedSessions, config: &GatewayConfig) -> anyhow::Result<()> {
    let app = router(sessions, &config.allowed_origins);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use pretty_assertions::assert_eq;
    use safetrail_core::agent::AgentServices;
    use safetrail_core::checkin::CheckInCoordinator;
    use safetrail_core::config::AgentConfig;
    use safetrail_core::delivery::{
        RecordingAuthorityNotifier, RecordingSender, StaticContactDirectory,
    };
    use safetrail_core::dispatcher::ToolRegistry;
    use safetrail_core::escalation::{EscalationEngine, RecordingSafetyMeasures};
    use safetrail_core::generation::MockGenerator;
    use safetrail_core::notifications::NotificationHub;
    use safetrail_core::persistence::InMemoryPersistence;
    use std::time::Duration;
    use tower::ServiceExt;

    fn sessions() -> SharedSessions {
        let hub = Arc::new(NotificationHub::default());
        let escalation = Arc::new(
            EscalationEngine::new(
                Arc::new(StaticContactDirectory::new()),
                Arc::new(RecordingSender::new()),
                Arc::new(RecordingAuthorityNotifier::new()),
                Arc::new(RecordingSafetyMeasures::new()),
                Duration::from_secs(300),
            )
            .with_notifications(hub.clone()),
        );
        let checkins = Arc::new(CheckInCoordinator::new(
            escalation.clone(),
            hub.clone(),
            Duration::from_secs(120),
        ));
        let services = AgentServices {
            generator: Arc::new(MockGenerator::new()),
            tools: Arc::new(ToolRegistry::new()),
            escalation,
            checkins,
            persistence: Arc::new(InMemoryPersistence::new()),
            notifications: hub,
        };
        Arc::new(SessionManager::new(Arc::new(AgentConfig::default()), services))
    }

    fn app(sessions: SharedSessions) -> Router {
        router(sessions, &["http://localhost:3000".to_string()])
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let req = builder.body(body).unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, json) = send(app(sessions()), "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active_agents"], 0);
    }

    #[tokio::test]
    async fn test_chat_endpoint() {
        let (status, json) = send(
            app(sessions()),
            "POST",
            "/api/agentic/chat/u1",
            Some(json!({"message": "remember that I prefer quiet streets"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["response"]["intent"], "learning_request");
        assert_eq!(json["response"]["learning_confirmed"], true);
    }

    #[tokio::test]
    async fn test_start_and_end_session() {
        let sessions = sessions();
        let (status, json) = send(
            app(sessions.clone()),
            "POST",
            "/api/agentic/start-session/u1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "session_started");
        assert_eq!(json["response"]["session_started"], true);
        assert_eq!(json["response"]["available_features"].as_array().unwrap().len(), 5);

        let (status, json) = send(app(sessions), "POST", "/api/agentic/end-session/u1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["response"]["session_ended"], true);
    }

    #[tokio::test]
    async fn test_stats_unknown_user_is_404() {
        let (status, json) = send(app(sessions()), "GET", "/api/agentic/stats/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["status"], "error");
    }

    #[tokio::test]
    async fn test_stats_after_chat() {
        let sessions = sessions();
        send(
            app(sessions.clone()),
            "POST",
            "/api/agentic/chat/u1",
            Some(json!({"message": "hello"})),
        )
        .await;
        let (status, json) = send(app(sessions), "GET", "/api/agentic/stats/u1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stats"]["total_conversations"], 1);
        assert_eq!(json["stats"]["current_state"], "idle");
    }

    #[tokio::test]
    async fn test_trigger_and_resolve() {
        let sessions = sessions();
        let (status, json) = send(
            app(sessions.clone()),
            "POST",
            "/api/emergency/trigger",
            Some(json!({"user_id": "u1", "location": {"lat": 40.7, "lng": -74.0}, "message": "followed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "emergency_activated");
        assert_eq!(json["incident"]["incident"]["stage"], "escalation_pending");

        let (_, json) = send(
            app(sessions.clone()),
            "POST",
            "/api/emergency/resolve",
            Some(json!({"user_id": "u1", "resolution": "safe now"})),
        )
        .await;
        assert_eq!(json["status"], "resolved");
        assert_eq!(json["incident"]["resolution"], "safe now");

        let (_, json) = send(
            app(sessions),
            "POST",
            "/api/emergency/resolve",
            Some(json!({"user_id": "u1"})),
        )
        .await;
        assert_eq!(json["status"], "no_active_emergency");
    }

    #[tokio::test]
    async fn test_invalid_location_is_400() {
        let (status, _) = send(
            app(sessions()),
            "POST",
            "/api/emergency/trigger",
            Some(json!({"user_id": "u1", "location": {"lat": 400.0, "lng": 0.0}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_client_message_handling() {
        let sessions = sessions();
        let reply = handle_client_text(&sessions, "u1", "not json").await;
        assert!(matches!(reply, Some(ServerReply::Error { ref code, .. }) if code == "PARSE_ERROR"));

        let reply = handle_client_text(
            &sessions,
            "u1",
            r#"{"type": "location_update", "location": {"lat": 1.0, "lng": 2.0}}"#,
        )
        .await;
        assert!(matches!(reply, Some(ServerReply::LocationAck)));

        let reply = handle_client_text(
            &sessions,
            "u1",
            r#"{"type": "check_in_response", "response": "safe"}"#,
        )
        .await;
        match reply {
            Some(ServerReply::CheckInResult { outcome }) => assert_eq!(outcome["outcome"], "no_pending"),
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = handle_client_text(
            &sessions,
            "u1",
            r#"{"type": "check_in_response", "response": "maybe"}"#,
        )
        .await;
        assert!(matches!(reply, Some(ServerReply::Error { ref code, .. }) if code == "INVALID_CHECK_IN"));
    }
}
