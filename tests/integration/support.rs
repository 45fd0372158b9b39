//! Fake analysis service shared by the integration tests.
//!
//! Serves `/ws/exercise/:exercise` with a scripted reply per received frame,
//! plus `/api/login` and `/api/exercises` for the collaborator client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lfk_stream::{Config, SessionEvent};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Token the fake service accepts.
pub const GOOD_TOKEN: &str = "good-token";

/// The basic feedback message from the reference scenario.
pub const BASIC_FEEDBACK: &str = r#"{"hand_detected":true,"raised_fingers":3,"finger_states":[true,true,true,false,false],"message":"ok","processed_frame":"","structured":null}"#;

/// Builds a feedback message with a structured progress state.
pub fn structured_feedback(state: &str, cycle: u32, countdown: Option<u32>) -> String {
    json!({
        "hand_detected": true,
        "raised_fingers": 0,
        "finger_states": [false, false, false, false, false],
        "message": "",
        "processed_frame": "",
        "current_exercise": "fist-palm",
        "structured": {
            "state": state,
            "state_name": state,
            "current_cycle": cycle,
            "total_cycles": 5,
            "countdown": countdown,
            "progress_percent": 25.0,
            "message": "keep going"
        }
    })
    .to_string()
}

/// How the fake service behaves on the exercise channel.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// One reply per received frame, in order.
    pub replies: Vec<String>,
    /// Reply to every frame once `replies` is exhausted.
    pub repeat_last: bool,
    /// Close frame sent once `replies` is exhausted.
    pub close_with: Option<(u16, String)>,
    /// Accept the upgrade, then never read from the socket.
    pub stall: bool,
}

impl Script {
    pub fn replies(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn then_close(mut self, code: u16, reason: &str) -> Self {
        self.close_with = Some((code, reason.to_string()));
        self
    }

    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }
}

/// What the fake service observed.
#[derive(Debug, Default)]
pub struct Observed {
    pub exercises: Vec<String>,
    pub tokens: Vec<String>,
    pub frames: Vec<String>,
    pub closes: Vec<(u16, String)>,
}

#[derive(Clone)]
struct ServiceState {
    script: Script,
    observed: Arc<Mutex<Observed>>,
}

/// A running fake service.
pub struct TestService {
    pub host: String,
    pub observed: Arc<Mutex<Observed>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestService {
    /// Starts the service on an ephemeral port.
    pub async fn spawn(script: Script) -> Self {
        let observed = Arc::new(Mutex::new(Observed::default()));
        let state = ServiceState {
            script,
            observed: Arc::clone(&observed),
        };

        let router = Router::new()
            .route("/ws/exercise/:exercise", get(ws_handler))
            .route("/api/login", post(login_handler))
            .route("/api/exercises", get(exercises_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let host = listener
            .local_addr()
            .expect("Failed to get local addr")
            .to_string();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("Server failed");
        });

        Self {
            host,
            observed,
            _handle: handle,
        }
    }

    /// Client configuration pointing at this service.
    pub fn config(&self) -> Config {
        Config {
            host: self.host.clone(),
            api_base_url: format!("http://{}", self.host),
            frame_interval_ms: 50,
            connect_timeout_secs: 5,
            ..Config::default()
        }
    }

    /// Waits until `check` holds for the observations, or panics after 5s.
    pub async fn wait_for(&self, what: &str, check: impl Fn(&Observed) -> bool) {
        let waited = timeout(Duration::from_secs(5), async {
            loop {
                if check(&*self.observed.lock().await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "Timed out waiting for {what}");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(exercise): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<ServiceState>,
) -> Response {
    let token = query.get("token").cloned().unwrap_or_default();
    {
        let mut observed = state.observed.lock().await;
        observed.exercises.push(exercise);
        observed.tokens.push(token.clone());
    }
    if token != GOOD_TOKEN && !token.starts_with("good ") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServiceState) {
    if state.script.stall {
        // Holding the socket unread lets the client's send buffers fill up.
        let _socket = socket;
        std::future::pending::<()>().await;
        return;
    }

    let mut replies = state.script.replies.iter();
    let mut last: Option<&String> = None;
    let mut closing = false;

    // Keep reading after a close so the close handshake completes.
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                state.observed.lock().await.frames.push(text);
                if closing {
                    continue;
                }
                let reply = match replies.next() {
                    Some(reply) => {
                        last = Some(reply);
                        Some(reply)
                    }
                    None if state.script.repeat_last => last,
                    None => None,
                };
                if let Some(reply) = reply {
                    if socket.send(Message::Text(reply.clone())).await.is_err() {
                        break;
                    }
                } else if let Some((code, reason)) = &state.script.close_with {
                    closing = true;
                    let frame = CloseFrame {
                        code: *code,
                        reason: reason.clone().into(),
                    };
                    if socket.send(Message::Close(Some(frame))).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    state
                        .observed
                        .lock()
                        .await
                        .closes
                        .push((frame.code, frame.reason.to_string()));
                }
            }
            _ => {}
        }
    }
}

async fn login_handler(Json(body): Json<serde_json::Value>) -> Response {
    if body["password"] == "secret" {
        Json(json!({
            "token": GOOD_TOKEN,
            "user": {"id": "u-1", "username": "anna", "email": body["email"]}
        }))
        .into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid email or password"})),
        )
            .into_response()
    }
}

async fn exercises_handler(headers: HeaderMap) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {GOOD_TOKEN}"));
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid or expired token"})),
        )
            .into_response();
    }
    Json(json!([
        {"id": "e-1", "name": "fist", "description": "Clench and release"},
        {"id": "e-2", "name": "fist-palm"}
    ]))
    .into_response()
}

/// Receives the next event or panics after 5s.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timeout waiting for session event")
        .expect("Event channel closed")
}

/// Receives events until one matches `pred`, returning it.
pub async fn event_matching(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}
