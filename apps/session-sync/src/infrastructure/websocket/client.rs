//! Realtime WebSocket Client
//!
//! Holds one persistent connection to a media server's notification feed.
//!
//! - `connect` dials once and, on success, spawns a read loop and a
//!   keepalive loop.
//! - The read loop dispatches text frames to [`Callbacks`] and answers server
//!   pings. On any read failure, clean close or read deadline it drops the
//!   connection and re-dials with exponential backoff until shut down.
//! - The keepalive loop pings on a fixed interval; a failed ping drops the
//!   connection, which the read loop then re-establishes.
//!
//! The connection handle and the callbacks sit behind separate locks, so
//! replacing callbacks never waits on socket I/O.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::time::error::Elapsed;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::callbacks::{Callbacks, Dispatch};
use super::envelope::{Envelope, EnvelopeCodec};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::RealtimeError;
use crate::domain::Source;
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;
type Frame = Result<Option<Result<Message, tungstenite::Error>>, Elapsed>;

/// Time allowed for the close handshake when dropping a connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Configuration
// =============================================================================

/// Realtime client configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Authenticated `ws://` or `wss://` URL.
    pub url: Url,
    /// Maximum time for the opening handshake.
    pub handshake_timeout: Duration,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Deadline for writing a single frame.
    pub write_timeout: Duration,
    /// Maximum silence (no frame of any kind) before reconnecting.
    pub read_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Messages sent after every successful (re)connect.
    pub initial_messages: Vec<Envelope>,
}

impl RealtimeConfig {
    /// Configuration with default timings for `url`.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            reconnect: ReconnectConfig::default(),
            initial_messages: Vec::new(),
        }
    }

    /// Add a message to send after each connect.
    #[must_use]
    pub fn with_initial_message(mut self, envelope: Envelope) -> Self {
        self.initial_messages.push(envelope);
        self
    }
}

/// URL without its query string, for logs.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

// =============================================================================
// Connection State
// =============================================================================

struct Inner {
    source: Source,
    config: RealtimeConfig,
    display_url: String,
    codec: Arc<dyn EnvelopeCodec>,
    callbacks: RwLock<Arc<Callbacks>>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    connected: RwLock<bool>,
    lost: Mutex<CancellationToken>,
}

impl Inner {
    async fn dial(&self) -> Result<WsReader, RealtimeError> {
        tracing::debug!(url = %self.display_url, "Dialling realtime feed");

        let (stream, _) = tokio::time::timeout(
            self.config.handshake_timeout,
            connect_async(self.config.url.as_str()),
        )
        .await
        .map_err(|_| RealtimeError::Timeout {
            operation: "handshake".to_string(),
        })?
        .map_err(|e| RealtimeError::ConnectFailed {
            message: e.to_string(),
        })?;

        let (mut sink, reader) = stream.split();
        for envelope in &self.config.initial_messages {
            let text = self
                .codec
                .encode(envelope)
                .map_err(|e| RealtimeError::Encode {
                    message: e.to_string(),
                })?;
            tokio::time::timeout(
                self.config.write_timeout,
                sink.send(Message::Text(text.into())),
            )
            .await
            .map_err(|_| RealtimeError::Timeout {
                operation: "subscribe".to_string(),
            })?
            .map_err(|e| RealtimeError::SendFailed {
                message: e.to_string(),
            })?;
        }

        // Sink, loss token and flag change together under the sink lock.
        {
            let mut guard = self.sink.lock().await;
            *self.lost.lock() = CancellationToken::new();
            *guard = Some(sink);
            *self.connected.write() = true;
        }
        metrics::set_websocket_connected(self.source, true);

        tracing::info!(url = %self.display_url, "Realtime feed connected");
        Ok(reader)
    }

    fn lost_token(&self) -> CancellationToken {
        self.lost.lock().clone()
    }

    /// Drop the current connection, if any. Safe to call repeatedly.
    async fn drop_connection(&self) {
        let sink = {
            let mut guard = self.sink.lock().await;
            *self.connected.write() = false;
            self.lost.lock().cancel();
            guard.take()
        };

        if let Some(mut sink) = sink {
            metrics::set_websocket_connected(self.source, false);
            let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
                sink.send(Message::Close(None)).await?;
                sink.close().await
            })
            .await;
            if !matches!(closed, Ok(Ok(()))) {
                tracing::debug!("Realtime close handshake did not complete");
            }
            tracing::info!("Realtime feed disconnected");
        }
    }

    async fn send_frame(&self, message: Message) -> Result<(), RealtimeError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(RealtimeError::NotConnected);
        };

        tokio::time::timeout(self.config.write_timeout, sink.send(message))
            .await
            .map_err(|_| RealtimeError::Timeout {
                operation: "write".to_string(),
            })?
            .map_err(|e| RealtimeError::SendFailed {
                message: e.to_string(),
            })
    }

    fn dispatch(&self, text: &str) {
        let envelope = match self.codec.decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed realtime message");
                return;
            }
        };

        let callbacks = Arc::clone(&*self.callbacks.read());
        match callbacks.dispatch(&envelope) {
            Dispatch::Handled => {
                tracing::trace!(message_type = %envelope.message_type, "Realtime message handled");
            }
            Dispatch::Ignored => {}
            Dispatch::Unknown => {
                tracing::debug!(
                    message_type = %envelope.message_type,
                    "Ignoring unknown realtime message type"
                );
            }
            Dispatch::DecodeFailed(e) => {
                tracing::warn!(
                    message_type = %envelope.message_type,
                    error = %e,
                    "Failed to decode realtime payload"
                );
            }
        }
    }

    /// Handle one read result. Returns `false` when the connection is done.
    async fn handle_frame(&self, frame: Frame) -> bool {
        match frame {
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.read_timeout.as_secs(),
                    "Realtime read deadline exceeded"
                );
                false
            }
            Ok(None) => {
                tracing::info!("Realtime stream ended");
                false
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "Realtime read error");
                false
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                self.dispatch(text.as_str());
                true
            }
            Ok(Some(Ok(Message::Ping(payload)))) => {
                if let Err(e) = self.send_frame(Message::Pong(payload)).await {
                    tracing::debug!(error = %e, "Failed to answer ping");
                }
                true
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                let clean = frame
                    .as_ref()
                    .is_some_and(|f| matches!(f.code, CloseCode::Normal | CloseCode::Away));
                tracing::info!(clean, "Realtime feed closed by server");
                false
            }
            Ok(Some(Ok(_))) => true,
        }
    }
}

// =============================================================================
// Background Loops
// =============================================================================

async fn read_loop(inner: Arc<Inner>, reader: WsReader, stop: CancellationToken) {
    let mut reader = Some(reader);
    let mut policy = ReconnectPolicy::new(inner.config.reconnect);

    loop {
        let Some(mut stream) = reader.take() else {
            let delay = policy.next_delay();
            metrics::record_websocket_reconnect(inner.source);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = policy.attempt_count(),
                "Reconnecting realtime feed"
            );

            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            let dialled = tokio::select! {
                () = stop.cancelled() => break,
                dialled = inner.dial() => dialled,
            };
            match dialled {
                Ok(fresh) => {
                    policy.reset();
                    reader = Some(fresh);
                }
                Err(e) => tracing::warn!(error = %e, "Realtime reconnect failed"),
            }
            continue;
        };

        let lost = inner.lost_token();
        let frame = tokio::select! {
            () = stop.cancelled() => break,
            () = lost.cancelled() => None,
            frame = tokio::time::timeout(inner.config.read_timeout, stream.next()) => Some(frame),
        };

        let keep = match frame {
            Some(frame) => inner.handle_frame(frame).await,
            None => false,
        };
        if keep {
            reader = Some(stream);
        } else {
            inner.drop_connection().await;
        }
    }

    inner.drop_connection().await;
    tracing::debug!("Realtime read loop stopped");
}

async fn keepalive_loop(inner: Arc<Inner>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                match inner.send_frame(Message::Ping(Vec::new().into())).await {
                    Ok(()) => tracing::trace!("Realtime ping sent"),
                    Err(RealtimeError::NotConnected) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Realtime ping failed");
                        inner.drop_connection().await;
                    }
                }
            }
        }
    }

    tracing::debug!("Realtime keepalive loop stopped");
}

// =============================================================================
// Client
// =============================================================================

struct Tasks {
    stop: CancellationToken,
    read: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

/// Auto-reconnecting WebSocket client for one media server feed.
pub struct RealtimeClient {
    inner: Arc<Inner>,
    tasks: tokio::sync::Mutex<Option<Tasks>>,
    span: tracing::Span,
}

impl RealtimeClient {
    /// Create a disconnected client. `span` scopes every log line it emits.
    #[must_use]
    pub fn new(
        source: Source,
        mut config: RealtimeConfig,
        codec: Arc<dyn EnvelopeCodec>,
        span: tracing::Span,
    ) -> Self {
        config.ping_interval = config.ping_interval.max(Duration::from_millis(1));
        let display_url = redacted(&config.url);

        Self {
            inner: Arc::new(Inner {
                source,
                config,
                display_url,
                codec,
                callbacks: RwLock::new(Arc::new(Callbacks::new())),
                sink: tokio::sync::Mutex::new(None),
                connected: RwLock::new(false),
                lost: Mutex::new(CancellationToken::new()),
            }),
            tasks: tokio::sync::Mutex::new(None),
            span,
        }
    }

    /// Server family this client listens to.
    #[must_use]
    pub fn source(&self) -> Source {
        self.inner.source
    }

    /// Replace the message handlers.
    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.inner.callbacks.write() = Arc::new(callbacks);
    }

    /// Connect and start the background loops.
    ///
    /// A no-op while the loops are running. Fails when the first dial fails;
    /// after that, reconnection is automatic until [`Self::close`] or
    /// `cancel` fires.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), RealtimeError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.as_ref().is_some_and(|t| !t.read.is_finished()) {
            return Ok(());
        }

        let reader = self.inner.dial().instrument(self.span.clone()).await?;

        let stop = cancel.child_token();
        let read = tokio::spawn(
            read_loop(Arc::clone(&self.inner), reader, stop.clone()).instrument(self.span.clone()),
        );
        let keepalive = tokio::spawn(
            keepalive_loop(Arc::clone(&self.inner), stop.clone()).instrument(self.span.clone()),
        );
        *tasks = Some(Tasks {
            stop,
            read,
            keepalive,
        });
        Ok(())
    }

    /// Send a message on the current connection.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), RealtimeError> {
        let text = self
            .inner
            .codec
            .encode(envelope)
            .map_err(|e| RealtimeError::Encode {
                message: e.to_string(),
            })?;
        self.inner.send_frame(Message::Text(text.into())).await
    }

    /// Stop the background loops, close the connection and wait for both
    /// loops to exit.
    pub async fn close(&self) {
        let tasks = self.tasks.lock().await.take();
        if let Some(Tasks {
            stop,
            read,
            keepalive,
        }) = tasks
        {
            stop.cancel();
            for (name, handle) in [("read", read), ("keepalive", keepalive)] {
                if let Err(e) = handle.await {
                    tracing::error!(parent: &self.span, task = name, error = %e, "Realtime task panicked");
                }
            }
        }
        self.inner.drop_connection().instrument(self.span.clone()).await;
    }

    /// Whether a connection is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.read()
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("source", &self.inner.source)
            .field("url", &self.inner.display_url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::super::envelope::MessageTypeCodec;
    use super::*;

    fn client(url: &str) -> RealtimeClient {
        RealtimeClient::new(
            Source::Emby,
            RealtimeConfig::new(Url::parse(url).unwrap()),
            Arc::new(MessageTypeCodec),
            tracing::Span::none(),
        )
    }

    #[test]
    fn test_default_timings() {
        let config = RealtimeConfig::new(Url::parse("ws://localhost:8096/socket").unwrap());
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert!(config.initial_messages.is_empty());
    }

    #[test]
    fn test_redacts_credentials_from_logged_url() {
        let url = Url::parse("wss://emby.local/embywebsocket?api_key=secret&deviceId=x").unwrap();
        assert_eq!(redacted(&url), "wss://emby.local/embywebsocket");
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = client("ws://127.0.0.1:9/socket");
        assert!(!client.is_connected());
        let err = client
            .send(&Envelope::new("SessionsStart", None))
            .await
            .unwrap_err();
        assert_eq!(err, RealtimeError::NotConnected);
        assert_eq!(err.to_string(), "not connected");
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let client = client("ws://127.0.0.1:9/socket");
        let err = client.connect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RealtimeError::ConnectFailed { .. } | RealtimeError::Timeout { .. }
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connected_flag_matches_sink_when_dial_races_drop() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/socket", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        let client = client(&url);
        let inner = Arc::clone(&client.inner);
        for _ in 0..25 {
            let dialer = tokio::spawn({
                let inner = Arc::clone(&inner);
                async move { inner.dial().await.map(|_| ()) }
            });
            let dropper = tokio::spawn({
                let inner = Arc::clone(&inner);
                async move { inner.drop_connection().await }
            });
            dialer.await.unwrap().unwrap();
            dropper.await.unwrap();

            let has_sink = inner.sink.lock().await.is_some();
            assert_eq!(client.is_connected(), has_sink);
            assert_eq!(inner.lost_token().is_cancelled(), !has_sink);
        }

        client.close().await;
        assert!(!client.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn test_failed_ping_drops_the_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/socket", listener.local_addr().unwrap())).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Handshake, then hang up so later writes fail.
            drop(tokio_tungstenite::accept_async(stream).await.unwrap());
        });

        let mut config = RealtimeConfig::new(url);
        config.ping_interval = Duration::from_millis(20);
        config.write_timeout = Duration::from_millis(500);
        let client = RealtimeClient::new(
            Source::Jellyfin,
            config,
            Arc::new(MessageTypeCodec),
            tracing::Span::none(),
        );

        // Keepalive alone, so only a failed ping can drop the connection.
        let reader = client.inner.dial().await.unwrap();
        assert!(client.is_connected());
        server.await.unwrap();

        let stop = CancellationToken::new();
        let keepalive = tokio::spawn(keepalive_loop(Arc::clone(&client.inner), stop.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(client.inner.lost_token().is_cancelled());
        assert_eq!(
            client.send(&Envelope::new("SessionsStart", None)).await,
            Err(RealtimeError::NotConnected)
        );

        stop.cancel();
        keepalive.await.unwrap();
        drop(reader);
    }

    #[tokio::test]
    async fn test_close_without_connect_is_safe() {
        let client = client("ws://127.0.0.1:9/socket");
        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
    }
}
