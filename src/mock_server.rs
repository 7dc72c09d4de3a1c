//! In-process stand-in for the voice service, used by the integration tests
//! and the `mock-voice-server` binary.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use xiaozhi_protocol::{ControlMessage, MessageType, TRANSPORT_NAME};

/// Configuration for the mock voice server
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Address to bind to (use "127.0.0.1:0" for a random port)
    pub bind_address: String,
    /// Answer the client's `hello`
    pub reply_hello: bool,
    /// Session id put in the `hello` reply
    pub session_id: String,
    /// Send every received binary frame straight back
    pub echo_audio: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            reply_hello: true,
            session_id: "mock-session".to_string(),
            echo_audio: false,
        }
    }
}

#[derive(Debug)]
enum ServerCommand {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Default)]
struct Recorded {
    connections: usize,
    headers: Vec<HashMap<String, String>>,
    texts: Vec<String>,
    binaries: Vec<Vec<u8>>,
}

/// Serves one client connection at a time and records what it receives
pub struct MockVoiceServer {
    config: MockServerConfig,
}

impl MockVoiceServer {
    pub fn new(config: MockServerConfig) -> Self {
        Self { config }
    }

    /// Bind and start accepting in a background task
    pub async fn start(self) -> std::io::Result<MockServerHandle> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        let port = listener.local_addr()?.port();
        info!("🎭 Mock voice server listening on 127.0.0.1:{}", port);

        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(accept_loop(
            listener,
            self.config,
            Arc::clone(&recorded),
            command_rx,
        ));

        Ok(MockServerHandle {
            port,
            recorded,
            commands: command_tx,
            task,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: MockServerConfig,
    recorded: Arc<Mutex<Recorded>>,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        info!("📡 Client connected from {}", peer);

        let mut headers = HashMap::new();
        let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            for (name, value) in request.headers() {
                headers.insert(
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                );
            }
            Ok(response)
        };

        let ws = match accept_hdr_async(stream, capture).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket upgrade failed: {}", e);
                continue;
            }
        };

        {
            let mut recorded = lock(&recorded);
            recorded.connections += 1;
            recorded.headers.push(headers);
        }

        serve_connection(ws, &config, &recorded, &mut commands).await;
        info!("🔌 Client {} disconnected", peer);
    }
}

async fn serve_connection(
    ws: WebSocketStream<TcpStream>,
    config: &MockServerConfig,
    recorded: &Mutex<Recorded>,
    commands: &mut mpsc::UnboundedReceiver<ServerCommand>,
) {
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let message = match command {
                    Some(ServerCommand::Text(text)) => Message::Text(text.into()),
                    Some(ServerCommand::Binary(data)) => Message::Binary(data.into()),
                    Some(ServerCommand::Close) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    debug!("Send to client failed: {}", e);
                    break;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str().to_string();
                        debug!("📥 {}", text);
                        let is_hello = ControlMessage::parse(&text)
                            .map(|m| m.is_type(&MessageType::Hello))
                            .unwrap_or(false);
                        lock(recorded).texts.push(text);

                        if is_hello && config.reply_hello {
                            let reply = hello_reply(&config.session_id);
                            if let Err(e) = sink.send(Message::Text(reply.into())).await {
                                debug!("Hello reply failed: {}", e);
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let data = data.as_slice().to_vec();
                        lock(recorded).binaries.push(data.clone());
                        if config.echo_audio {
                            if let Err(e) = sink.send(Message::Binary(data.into())).await {
                                debug!("Echo failed: {}", e);
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Read from client failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

fn hello_reply(session_id: &str) -> String {
    json!({
        "type": "hello",
        "transport": TRANSPORT_NAME,
        "session_id": session_id,
        "audio_params": {
            "format": "opus",
            "sample_rate": 24000,
            "channels": 1,
            "frame_duration": 60,
        },
    })
    .to_string()
}

fn lock(recorded: &Mutex<Recorded>) -> MutexGuard<'_, Recorded> {
    recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle for a mock server running in the background
pub struct MockServerHandle {
    pub port: u16,
    recorded: Arc<Mutex<Recorded>>,
    commands: mpsc::UnboundedSender<ServerCommand>,
    task: JoinHandle<()>,
}

impl MockServerHandle {
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/xiaozhi/v1/", self.port)
    }

    /// Queue a text frame for the current (or next) client
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.commands.send(ServerCommand::Text(text.into()));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.commands.send(ServerCommand::Binary(data));
    }

    /// Close the current client connection
    pub fn close_connection(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.recorded).connections
    }

    /// Upgrade request headers of the latest connection, names lowercased
    pub fn last_headers(&self) -> Option<HashMap<String, String>> {
        lock(&self.recorded).headers.last().cloned()
    }

    pub fn received_texts(&self) -> Vec<String> {
        lock(&self.recorded).texts.clone()
    }

    pub fn received_binaries(&self) -> Vec<Vec<u8>> {
        lock(&self.recorded).binaries.clone()
    }

    /// Wait until at least `count` text frames arrived
    pub async fn wait_for_texts(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let texts = self.received_texts();
            if texts.len() >= count || tokio::time::Instant::now() >= deadline {
                return texts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `count` binary frames arrived
    pub async fn wait_for_binaries(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let binaries = self.received_binaries();
            if binaries.len() >= count || tokio::time::Instant::now() >= deadline {
                return binaries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MockServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
