//! # Session Event Stream
//!
//! `/ws/events` pushes everything the live session reports to a browser or
//! any other observer, and accepts a couple of control messages back.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server sends a `snapshot` message with the current
//!    session state
//! 2. **Events**: every session event is forwarded as-is:
//!    `{"type": "live-audio-status", "detail": {...}}`,
//!    `{"type": "ai-speech", "detail": {...}}`,
//!    `{"type": "analyzers", "detail": {"input": [...], "output": [...]}}`.
//!    Analyzer frames are skipped when the client connects with
//!    `?analyzers=false`
//! 3. **Control**: the client may send `{"type": "activate"}`,
//!    `{"type": "stop"}` or `{"type": "ping", "timestamp": n}`
//! 4. **Heartbeat**: the server pings every 30 seconds and drops clients that
//!    stay silent for 60

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use live_voice::session::{SessionEvent, SessionHandle, SessionSnapshot};

use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages a client may send.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "activate")]
    Activate,

    #[serde(rename = "stop")]
    Stop,

    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// Messages the server sends besides forwarded session events.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "snapshot")]
    Snapshot { session: SessionSnapshot },

    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },

    /// Events were dropped because this client fell behind
    #[serde(rename = "lagged")]
    Lagged { skipped: u64 },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One connected observer.
pub struct EventsWebSocket {
    state: web::Data<AppState>,
    session: SessionHandle,
    include_analyzers: bool,
    last_heartbeat: Instant,
}

impl EventsWebSocket {
    pub fn new(state: web::Data<AppState>, include_analyzers: bool) -> Self {
        let session = state.session.clone();
        Self {
            state,
            session,
            include_analyzers,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize server message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: String) {
        self.send(ctx, &ServerMessage::Error { code: code.to_string(), message });
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::Activate => {
                let session = self.session.clone();
                // Status events report progress; only a failure needs an answer here
                let activation = async move { session.activate().await }
                    .into_actor(self)
                    .map(|result, act, ctx| {
                        if let Err(e) = result {
                            let code = e.code().map(|c| c.as_str()).unwrap_or("activation_failed");
                            act.send_error(ctx, code, e.to_string());
                        }
                    });
                ctx.spawn(activation);
            }
            ClientMessage::Stop => {
                if let Err(e) = self.session.stop() {
                    self.send_error(ctx, "session_unavailable", e.to_string());
                }
            }
            ClientMessage::Ping { timestamp } => self.send(ctx, &ServerMessage::Pong { timestamp }),
            ClientMessage::Pong { .. } => self.last_heartbeat = Instant::now(),
        }
    }
}

impl Actor for EventsWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Event stream client connected");
        self.state.subscriber_connected();

        ctx.add_stream(BroadcastStream::new(self.session.subscribe()));
        self.send(ctx, &ServerMessage::Snapshot { session: self.session.snapshot() });

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Event stream heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            act.send(ctx, &ServerMessage::Ping { timestamp: now_millis() });
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.subscriber_disconnected();
        info!("Event stream client disconnected");
    }
}

/// Session events from the driver's broadcast channel.
impl StreamHandler<Result<SessionEvent, BroadcastStreamRecvError>> for EventsWebSocket {
    fn handle(&mut self, item: Result<SessionEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(SessionEvent::Analyzers(_)) if !self.include_analyzers => {}
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => ctx.text(json),
                Err(e) => error!("Failed to serialize session event: {}", e),
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream client lagging, events dropped");
                self.send(ctx, &ServerMessage::Lagged { skipped });
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        info!("Session event stream ended, closing connection");
        ctx.stop();
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for EventsWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => self.handle_client_message(message, ctx),
                    Err(err) => self.send_error(ctx, "invalid_json", format!("Invalid JSON: {}", err)),
                }
            }
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary frames are not accepted".to_string());
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!("Event stream closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upgrade `/ws/events` to a WebSocket.
pub async fn events_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New event stream connection from: {:?}", req.connection_info().peer_addr());

    let query = web::Query::<std::collections::HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(std::collections::HashMap::new()));
    let include_analyzers = query.get("analyzers").map(|v| v != "false").unwrap_or(true);

    ws::start(EventsWebSocket::new(app_state, include_analyzers), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "activate"}"#).unwrap(),
            ClientMessage::Activate
        ));
        match serde_json::from_str::<ClientMessage>(r#"{"type": "ping", "timestamp": 42}"#).unwrap() {
            ClientMessage::Ping { timestamp } => assert_eq!(timestamp, 42),
            other => panic!("Wrong message type: {:?}", other),
        }
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "transcribe"}"#).is_err());
    }

    #[test]
    fn test_server_message_serialization() {
        let json = serde_json::to_value(ServerMessage::Lagged { skipped: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "lagged", "skipped": 3 }));

        let json = serde_json::to_value(ServerMessage::Snapshot { session: SessionSnapshot::default() }).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["session"]["state"], "idle");
    }
}
