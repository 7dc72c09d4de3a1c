use crate::config::ClientSettings;
use crate::pipeline::FrameSender;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use xiaozhi_protocol::{headers, AudioParams, ControlMessage, MessageType, PROTOCOL_VERSION};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Invalid connection request: {0}")]
    InvalidRequest(String),
    #[error("No hello acknowledgment within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Send failed: {0}")]
    Send(#[source] WsError),
    #[error("Failed to encode control message: {0}")]
    Encode(#[from] xiaozhi_protocol::ProtocolError),
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// True when the failure means the peer is gone and further sends are
    /// pointless.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            TransportError::NotConnected => true,
            TransportError::Send(e) => is_closed_error(e),
            _ => false,
        }
    }
}

fn is_closed_error(error: &WsError) -> bool {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(WsProtocolError::SendAfterClosing)
        | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

/// Why the receive loop stopped on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server sent a close frame (code and reason, if any)
    ServerClosed(Option<String>),
    /// Stream ended without a close frame
    StreamEnded,
    /// Transport-level read failure
    ReadError(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerClosed(Some(frame)) => write!(f, "server closed ({})", frame),
            DisconnectReason::ServerClosed(None) => write!(f, "server closed"),
            DisconnectReason::StreamEnded => write!(f, "stream ended"),
            DisconnectReason::ReadError(e) => write!(f, "read error: {}", e),
        }
    }
}

/// Receives everything the server sends, in wire order.
///
/// Handlers are awaited inline by the receive loop, so a slow handler delays
/// the next message.
#[async_trait]
pub trait TransportEvents: Send + Sync {
    async fn on_control(&self, message: ControlMessage);
    async fn on_audio(&self, frame: Vec<u8>);
    /// Called at most once per connection, never after `close()`
    async fn on_disconnect(&self, reason: DisconnectReason);
}

/// Progress of the `hello` exchange on the current connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Down,
    Open,
    Acked,
}

struct ReceiverTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// One WebSocket connection to the voice service carrying both the JSON
/// control channel and the binary audio channel.
pub struct StreamTransport {
    settings: Arc<ClientSettings>,
    audio_params: AudioParams,
    events: Arc<dyn TransportEvents>,
    sink: Arc<Mutex<Option<WsSink>>>,
    link: Arc<watch::Sender<Link>>,
    receiver: Mutex<Option<ReceiverTask>>,
}

impl StreamTransport {
    pub fn new(
        settings: Arc<ClientSettings>,
        audio_params: AudioParams,
        events: Arc<dyn TransportEvents>,
    ) -> Self {
        let (link, _) = watch::channel(Link::Down);
        Self {
            settings,
            audio_params,
            events,
            sink: Arc::new(Mutex::new(None)),
            link: Arc::new(link),
            receiver: Mutex::new(None),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Open the connection and start the receive loop
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected().await {
            log::warn!("⚠️  Transport already connected, ignoring connect()");
            return Ok(());
        }

        let network = &self.settings.network;
        let request = build_request(&self.settings)?;
        let connector = if network.is_secure() {
            Some(Connector::NativeTls(insecure_tls_connector()?))
        } else {
            None
        };

        log::info!("🌐 Connecting to {}", network.websocket_url);

        let (ws_stream, response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        log::info!("✅ WebSocket connected, status: {}", response.status());

        let (sink, source) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        self.link.send_replace(Link::Open);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(receive_loop(
            source,
            Arc::clone(&self.events),
            Arc::clone(&self.link),
            Arc::clone(&self.sink),
            cancel.clone(),
            self.settings.keepalive_interval,
        ));
        *self.receiver.lock().await = Some(ReceiverTask { handle, cancel });

        Ok(())
    }

    /// Send our `hello` and wait for the server's. Fails as soon as the
    /// connection drops instead of waiting out the timeout.
    pub async fn handshake(&self) -> Result<(), TransportError> {
        self.link.send_if_modified(|link| {
            if *link == Link::Acked {
                *link = Link::Open;
                true
            } else {
                false
            }
        });
        let mut link_rx = self.link.subscribe();
        if *link_rx.borrow() == Link::Down {
            return Err(TransportError::NotConnected);
        }

        self.send_control(&ControlMessage::hello(&self.audio_params))
            .await?;
        log::debug!("👋 Sent hello, waiting for acknowledgment");

        let timeout = self.settings.handshake_timeout;
        let outcome = tokio::time::timeout(timeout, link_rx.wait_for(|link| *link != Link::Open))
            .await
            .map(|changed| changed.map(|link| *link));

        match outcome {
            Ok(Ok(Link::Acked)) => {
                log::info!("🤝 Handshake complete");
                Ok(())
            }
            Ok(_) => {
                log::warn!("🔌 Connection closed before the server said hello");
                Err(TransportError::Connection(
                    "connection closed before hello".to_string(),
                ))
            }
            Err(_) => {
                log::warn!("⏰ No hello from server within {:?}", timeout);
                Err(TransportError::HandshakeTimeout(timeout))
            }
        }
    }

    pub async fn start_listening(&self, mode: &str) -> Result<(), TransportError> {
        log::info!("🎤 Start listening (mode: {})", mode);
        self.send_control(&ControlMessage::listen_start(mode)).await
    }

    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), TransportError> {
        let text = message.to_text()?;
        log::debug!("📤 {}", text);
        self.send_message(Message::Text(text.into())).await
    }

    pub async fn send_audio(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        log::trace!("📤 Sending {} bytes of audio", frame.len());
        self.send_message(Message::Binary(frame.into())).await
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(message).await.map_err(TransportError::Send)
    }

    /// Stop the receive loop, wait for it, then close the connection.
    /// Safe to call on a closed transport.
    pub async fn close(&self) {
        let task = self.receiver.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                log::warn!("Receive loop ended abnormally: {}", e);
            }
        }

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                log::debug!("Close handshake did not complete: {}", e);
            }
            log::info!("🔚 WebSocket closed");
        }
        self.link.send_replace(Link::Down);
    }
}

#[async_trait]
impl FrameSender for StreamTransport {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.send_audio(frame).await
    }
}

fn build_request(settings: &ClientSettings) -> Result<Request, TransportError> {
    let network = &settings.network;
    let mut request = network
        .websocket_url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

    let mut authorization = header_value(&format!("Bearer {}", network.access_token()))?;
    authorization.set_sensitive(true);

    let request_headers = request.headers_mut();
    request_headers.insert(headers::AUTHORIZATION, authorization);
    request_headers.insert(
        headers::PROTOCOL_VERSION,
        header_value(&PROTOCOL_VERSION.to_string())?,
    );
    request_headers.insert(headers::DEVICE_ID, header_value(&network.device_id)?);
    request_headers.insert(headers::CLIENT_ID, header_value(&network.client_id)?);

    Ok(request)
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::InvalidRequest(format!("invalid header value: {}", e)))
}

/// The service runs behind a self-signed certificate
fn insecure_tls_connector() -> Result<native_tls::TlsConnector, TransportError> {
    native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| TransportError::Connection(format!("TLS setup failed: {}", e)))
}

async fn receive_loop(
    mut source: WsSource,
    events: Arc<dyn TransportEvents>,
    link: Arc<watch::Sender<Link>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    cancel: CancellationToken,
    keepalive_interval: Duration,
) {
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    let mut message_count: u64 = 0;

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("Receive loop cancelled after {} messages", message_count);
                return;
            }
            _ = keepalive.tick() => {
                send_ping(&sink).await;
                continue;
            }
            next = source.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                message_count += 1;
                handle_text(text.as_str(), events.as_ref(), &link).await;
            }
            Some(Ok(Message::Binary(data))) => {
                message_count += 1;
                log::trace!("📥 Received {} bytes of audio", data.len());
                events.on_audio(data.as_slice().to_vec()).await;
            }
            Some(Ok(Message::Close(frame))) => {
                let detail = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason));
                break DisconnectReason::ServerClosed(detail);
            }
            Some(Ok(_)) => {
                // ping/pong are answered by tungstenite
            }
            Some(Err(e)) => break DisconnectReason::ReadError(e.to_string()),
            None => break DisconnectReason::StreamEnded,
        }
    };

    log::info!(
        "🔌 Receive loop stopped after {} messages: {}",
        message_count,
        reason
    );

    let dead = sink.lock().await.take();
    if let Some(mut dead) = dead {
        if let Err(e) = dead.close().await {
            log::debug!("Closing the write half failed: {}", e);
        }
    }
    link.send_replace(Link::Down);

    events.on_disconnect(reason).await;
}

async fn handle_text(text: &str, events: &dyn TransportEvents, link: &watch::Sender<Link>) {
    let message = match ControlMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping malformed control message ({}): {}", e, text);
            return;
        }
    };

    if message.is_type(&MessageType::Hello) {
        match message.session_id() {
            Some(id) => log::info!("👋 Server hello (session {})", id),
            None => log::info!("👋 Server hello"),
        }
        link.send_replace(Link::Acked);
    }

    events.on_control(message).await;
}

async fn send_ping(sink: &Mutex<Option<WsSink>>) {
    let mut guard = sink.lock().await;
    if let Some(sink) = guard.as_mut() {
        if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
            log::debug!("Keepalive ping failed: {}", e);
        }
    }
}
