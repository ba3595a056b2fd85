//! Gemini Live API client over WebSocket.
//!
//! `connect` performs the WebSocket handshake and sends the `setup` message.
//! After that two tasks own the socket halves: a writer draining an outbound
//! queue, and a reader turning server frames into [`RemoteEvent`]s. The
//! service acknowledges `setup` with `setupComplete`, which is reported as
//! [`RemoteEvent::Open`].

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::protocol::{parse_server_message, RealtimeInputMessage, SetupMessage};
use super::{ConnectParams, RealtimeInput, RemoteConnector, RemoteError, RemoteEvent, RemoteEventSink, RemoteSession};

/// Public Live API endpoint (the key is appended as a query parameter).
pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

enum Outbound {
    Frame(Message),
    Close,
}

/// Connects to the Gemini Live API with an API key.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveConnector {
    /// Fails with [`RemoteError::MissingApiKey`] when the key is blank.
    pub fn new(api_key: impl Into<String>) -> Result<Self, RemoteError> {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Result<Self, RemoteError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(RemoteError::MissingApiKey);
        }
        let _ = rustls::crypto::ring::default_provider().install_default();
        Ok(Self {
            api_key,
            endpoint: endpoint.into(),
        })
    }

    /// Endpoint with the key appended. ws/wss URLs without a path get `/`.
    fn url(&self) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| RemoteError::Connect(format!("invalid endpoint '{}': {}", self.endpoint, e)))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

impl RemoteConnector for GeminiLiveConnector {
    fn connect(&self, params: ConnectParams, events: RemoteEventSink) -> BoxFuture<'static, Result<Box<dyn RemoteSession>, RemoteError>> {
        let url = self.url();
        let endpoint = self.endpoint.clone();

        Box::pin(async move {
            let url = url?;
            info!(endpoint = %endpoint, model = %params.model, voice = %params.voice_name, "Connecting to Live API");

            let (stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| RemoteError::Connect(e.to_string()))?;
            let (mut write, mut read) = stream.split();

            let setup = serde_json::to_string(&SetupMessage::from_params(&params))
                .map_err(|e| RemoteError::Protocol(e.to_string()))?;
            write
                .send(Message::Text(setup.into()))
                .await
                .map_err(|e| RemoteError::Connect(e.to_string()))?;

            let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

            tokio::spawn(async move {
                while let Some(outbound) = rx.recv().await {
                    match outbound {
                        Outbound::Frame(frame) => {
                            if let Err(e) = write.send(frame).await {
                                warn!("Live API write failed: {}", e);
                                break;
                            }
                        }
                        Outbound::Close => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                let _ = write.close().await;
                debug!("Live API writer finished");
            });

            tokio::spawn(async move {
                let mut opened = false;
                while let Some(frame) = read.next().await {
                    let payload = match frame {
                        Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                        Ok(Message::Binary(data)) => data.to_vec(),
                        Ok(Message::Close(close)) => {
                            let reason = close.map(|c| c.reason.to_string()).filter(|r| !r.is_empty());
                            info!(reason = ?reason, "Live API closed the connection");
                            events(RemoteEvent::Close(reason));
                            return;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            error!("Live API connection error: {}", e);
                            events(RemoteEvent::Error(e.to_string()));
                            return;
                        }
                    };

                    match parse_server_message(&payload) {
                        Ok(message) => {
                            if message.is_setup_complete() && !opened {
                                opened = true;
                                events(RemoteEvent::Open);
                            }
                            let message = message.without_setup();
                            if !message.events.is_empty() || message.has_model_turn {
                                events(RemoteEvent::Message(message));
                            }
                        }
                        Err(e) => warn!("Ignoring unparseable Live API frame: {}", e),
                    }
                }
                events(RemoteEvent::Close(None));
            });

            let session: Box<dyn RemoteSession> = Box::new(GeminiLiveSession { outbound: Some(tx) });
            Ok(session)
        })
    }

    fn name(&self) -> &'static str {
        "gemini-live"
    }
}

/// Client half of an open Live API connection.
struct GeminiLiveSession {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl RemoteSession for GeminiLiveSession {
    fn send_realtime_input(&mut self, input: RealtimeInput) -> Result<(), RemoteError> {
        let outbound = self.outbound.as_ref().ok_or(RemoteError::Closed)?;
        let json = serde_json::to_string(&RealtimeInputMessage::from(input))
            .map_err(|e| RemoteError::Send(e.to_string()))?;
        outbound
            .send(Outbound::Frame(Message::Text(json.into())))
            .map_err(|_| RemoteError::Send("connection writer has stopped".to_string()))
    }

    fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close);
            debug!("Live API session close requested");
        }
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_blank_api_key_is_rejected() {
        assert!(matches!(GeminiLiveConnector::new("  "), Err(RemoteError::MissingApiKey)));
    }

    #[test]
    fn test_url_carries_key() {
        let connector = GeminiLiveConnector::with_endpoint("k", "ws://localhost:1/live").unwrap();
        assert_eq!(connector.url().unwrap().as_str(), "ws://localhost:1/live?key=k");
        let connector = GeminiLiveConnector::with_endpoint("k", "ws://localhost:1/live?alt=1").unwrap();
        assert_eq!(connector.url().unwrap().as_str(), "ws://localhost:1/live?alt=1&key=k");
    }

    #[test]
    fn test_url_without_path_gets_root() {
        let connector = GeminiLiveConnector::with_endpoint("k", "ws://127.0.0.1:9000").unwrap();
        assert_eq!(connector.url().unwrap().as_str(), "ws://127.0.0.1:9000/?key=k");

        let connector = GeminiLiveConnector::with_endpoint("k", "not a url").unwrap();
        assert!(matches!(connector.url(), Err(RemoteError::Connect(_))));
    }

    #[tokio::test]
    async fn test_session_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();

            let setup = ws.next().await.unwrap().unwrap();
            let setup: serde_json::Value = serde_json::from_str(setup.to_text().unwrap()).unwrap();
            assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");

            ws.send(Message::Binary(br#"{"setupComplete":{}}"#.to_vec().into())).await.unwrap();

            let input = ws.next().await.unwrap().unwrap();
            let input: serde_json::Value = serde_json::from_str(input.to_text().unwrap()).unwrap();
            assert_eq!(input["realtimeInput"]["text"], "hello");

            ws.send(Message::Text(r#"{"serverContent":{"interrupted":true}}"#.to_string().into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let events: RemoteEventSink = Arc::new(move |event| sink_seen.lock().unwrap().push(event));

        let connector = GeminiLiveConnector::with_endpoint("test-key", format!("ws://{}", addr)).unwrap();
        let mut session = connector.connect(ConnectParams::default(), events).await.unwrap();
        session.send_realtime_input(RealtimeInput::Text("hello".to_string())).unwrap();

        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], RemoteEvent::Open);
        assert!(matches!(&seen[1], RemoteEvent::Message(m) if m.description() == "interruption"));
        assert!(matches!(seen[2], RemoteEvent::Close(_)));

        drop(seen);
        session.close();
        session.close();
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = GeminiLiveConnector::with_endpoint("test-key", format!("ws://{}", addr)).unwrap();
        let events: RemoteEventSink = Arc::new(|_| {});
        let result = connector.connect(ConnectParams::default(), events).await;
        assert!(matches!(result, Err(RemoteError::Connect(_))));
    }
}
