use super::config::ChannelConfig;
use super::dispatch::{Listener, ListenerTable};
use super::messages::{EventKind, OutboundFrame, SendEvent, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected and not trying (no credential yet, or not started).
    Disconnected,
    /// A connection attempt is in flight or about to be retried.
    Connecting,
    Connected,
    /// `close()` was called; the channel will not reconnect.
    Closed,
}

/// Connection milestones surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    /// The server answered on a new connection after fewer than
    /// `restore_threshold` failed attempts.
    Connected,
    /// The server answered again after a run of failed attempts. Sessions
    /// dropped before the first server frame count as failures.
    Restored { failed_attempts: u32 },
    /// An established connection dropped; reconnecting.
    Lost,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("not connected to server")]
    NotConnected,
    #[error("connection driver already running")]
    AlreadyRunning,
    #[error("channel closed")]
    Closed,
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Internal message type for the write channel
enum WriteMessage {
    Data(String),
    Close,
}

/// How a connected session ended.
enum SessionEnd {
    Closed,
    /// The socket dropped. `established` is false when the server never sent
    /// a frame, which counts as a failed attempt.
    Lost { established: bool },
}

/// State shared between the [`Channel`] handle and its driver task.
struct Shared {
    config: ChannelConfig,
    listeners: StdMutex<ListenerTable>,
    /// Present only while connected
    write_tx: StdMutex<Option<mpsc::UnboundedSender<WriteMessage>>>,
    state_tx: watch::Sender<ChannelState>,
    credential_tx: watch::Sender<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
    notice_tx: broadcast::Sender<ChannelNotice>,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_if_modified(|current| {
            if *current == ChannelState::Closed || *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "Channel state change");
            *current = state;
            true
        });
    }

    fn install_writer(&self, writer: Option<mpsc::UnboundedSender<WriteMessage>>) {
        *self
            .write_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = writer;
    }

    fn notify(&self, notice: ChannelNotice) {
        // No subscribers is fine
        let _ = self.notice_tx.send(notice);
    }

    fn dispatch_text(&self, text: &str) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable frame from server");
                return;
            }
        };

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners_for(event.kind());
        debug!(kind = event.kind().as_str(), listeners = listeners.len(), "Dispatching event");
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Authenticated, self-reconnecting realtime connection to the relay server.
///
/// One driver task owns the socket and runs the
/// `Disconnected -> Connecting -> Connected -> Connecting ...` loop.
/// Listeners are registered on the channel, not on a socket, so they survive
/// reconnects.
pub struct Channel {
    shared: Arc<Shared>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (credential_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        let (notice_tx, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                config,
                listeners: StdMutex::new(ListenerTable::new()),
                write_tx: StdMutex::new(None),
                state_tx,
                credential_tx,
                shutdown_tx,
                notice_tx,
            }),
            driver: StdMutex::new(None),
        }
    }

    /// Provide (or replace) the session token used for the next attempt.
    /// A driver waiting for a credential wakes up immediately.
    pub fn set_credential(&self, token: impl Into<String>) {
        self.shared.credential_tx.send_replace(Some(token.into()));
    }

    pub fn clear_credential(&self) {
        self.shared.credential_tx.send_replace(None);
    }

    /// Start the connection driver. Must be called from a tokio runtime.
    pub fn connect(&self) -> Result<(), ChannelError> {
        if *self.shared.shutdown_tx.borrow() {
            return Err(ChannelError::Closed);
        }

        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(ChannelError::AlreadyRunning);
        }

        let shared = self.shared.clone();
        *driver = Some(tokio::spawn(run_driver(shared)));
        Ok(())
    }

    /// Close the connection for good: stops keep-alive and reconnects.
    pub fn close(&self) {
        info!("Closing realtime channel");
        self.shared.shutdown_tx.send_replace(true);
        if let Some(tx) = self
            .shared
            .write_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(WriteMessage::Close);
        }
        self.shared.install_writer(None);
        self.shared.state_tx.send_replace(ChannelState::Closed);
    }

    /// Wait for the driver task to finish after [`Channel::close`].
    pub async fn closed(&self) {
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Channel driver task failed");
            }
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.shared.notice_tx.subscribe()
    }

    /// Register a listener for `kind`. Returns false if it was already registered.
    pub fn on(&self, kind: EventKind, listener: Listener) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, listener)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind, listener)
    }

    /// Send a frame. Fails immediately when not connected; nothing is queued.
    pub fn send(&self, kind: EventKind, data: Value) -> Result<(), ChannelError> {
        let json = serde_json::to_string(&OutboundFrame::new(kind, data))?;

        let guard = self
            .shared
            .write_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx
                .send(WriteMessage::Data(json))
                .map_err(|_| ChannelError::NotConnected),
            None => {
                warn!(kind = kind.as_str(), "Cannot send message: not connected to server");
                Err(ChannelError::NotConnected)
            }
        }
    }

    /// Send a chat message envelope to `chat`.
    pub fn send_event(&self, chat: &str, content: &str) -> Result<(), ChannelError> {
        let data = serde_json::to_value(SendEvent {
            chat: chat.to_string(),
            content: content.to_string(),
        })?;
        self.send(EventKind::Event, data)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Stop the driver; it holds its own Arc to the shared state
        self.shared.shutdown_tx.send_replace(true);
    }
}

fn endpoint_url(server_url: &str, token: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(server_url)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

async fn wait_for_credential(rx: &mut watch::Receiver<Option<String>>) -> Option<String> {
    match rx.wait_for(Option::is_some).await {
        Ok(token) => token.clone(),
        Err(_) => None,
    }
}

/// The reconnect loop. Exactly one attempt is in flight at a time and every
/// attempt after the first is preceded by a backoff sleep.
async fn run_driver(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut credential_rx = shared.credential_tx.subscribe();
    let config = shared.config.clone();
    let mut failed_attempts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let token = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => continue,
            token = wait_for_credential(&mut credential_rx) => token,
        };
        let Some(token) = token else {
            break;
        };

        shared.set_state(ChannelState::Connecting);
        info!(url = %config.server_url, attempt = failed_attempts + 1, "Connecting to Veil server");

        let attempt = match endpoint_url(&config.server_url, &token) {
            Ok(url) => tokio::select! {
                biased;
                _ = shutdown_rx.changed() => continue,
                result = timeout(config.connect_timeout, connect_async(url.as_str())) => match result {
                    Ok(Ok((ws_stream, _))) => Ok(ws_stream),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", config.connect_timeout)),
                },
            },
            Err(e) => Err(format!("invalid server URL: {}", e)),
        };

        match attempt {
            Ok(ws_stream) => {
                let notice = if failed_attempts >= config.restore_threshold {
                    ChannelNotice::Restored { failed_attempts }
                } else {
                    ChannelNotice::Connected
                };

                match run_session(&shared, ws_stream, &mut shutdown_rx, notice).await {
                    SessionEnd::Closed => break,
                    SessionEnd::Lost { established: true } => {
                        failed_attempts = 0;
                        shared.notify(ChannelNotice::Lost);
                    }
                    SessionEnd::Lost { established: false } => {
                        failed_attempts = failed_attempts.saturating_add(1);
                        warn!(failed_attempts, "Connection dropped before the server answered");
                    }
                }
            }
            Err(reason) => {
                failed_attempts = failed_attempts.saturating_add(1);
                warn!(%reason, failed_attempts, "Failed to connect to Veil server");
            }
        }

        // A lost session waits `reconnect_delay` like a first failure
        let delay = config.backoff_delay(failed_attempts);
        debug!(?delay, "Reconnecting after backoff");
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {}
            _ = sleep(delay) => {}
        }
    }

    shared.install_writer(None);
    shared.state_tx.send_replace(ChannelState::Closed);
    info!("Channel driver stopped");
}

async fn run_session(
    shared: &Shared,
    ws_stream: WsStream,
    shutdown_rx: &mut watch::Receiver<bool>,
    notice: ChannelNotice,
) -> SessionEnd {
    // Reported once the server answers, so an accept-then-close server
    // never produces connect notices.
    let mut pending_notice = Some(notice);
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WriteMessage>();
    shared.install_writer(Some(tx));
    shared.set_state(ChannelState::Connected);

    let config = &shared.config;
    let mut keep_alive = interval_at(
        Instant::now() + config.keep_alive_interval,
        config.keep_alive_interval,
    );

    // Identity confirmation
    let me_sent = match frame_json(EventKind::Me) {
        Some(me) => ws_write.send(Message::Text(me)).await.is_ok(),
        None => true,
    };

    let end = if !me_sent {
        error!("Failed to send identity confirmation");
        SessionEnd::Lost { established: false }
    } else {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, closing connection gracefully");
                    if let Err(e) = ws_write.send(Message::Close(None)).await {
                        warn!(error = %e, "Failed to send close frame");
                    }
                    break SessionEnd::Closed;
                }
                _ = keep_alive.tick() => {
                    if let Some(ping) = frame_json(EventKind::KeepAlive) {
                        if ws_write.send(Message::Text(ping)).await.is_err() {
                            error!("Failed to send keep-alive");
                            break SessionEnd::Lost { established: pending_notice.is_none() };
                        }
                    }
                }
                Some(msg) = rx.recv() => {
                    match msg {
                        WriteMessage::Data(data) => {
                            if ws_write.send(Message::Text(data)).await.is_err() {
                                error!("Failed to send message to server");
                                break SessionEnd::Lost { established: pending_notice.is_none() };
                            }
                        }
                        WriteMessage::Close => {
                            info!("Close requested, sending close frame");
                            if let Err(e) = ws_write.send(Message::Close(None)).await {
                                warn!(error = %e, "Failed to send close frame");
                            }
                            break SessionEnd::Closed;
                        }
                    }
                }
                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(notice) = pending_notice.take() {
                                match &notice {
                                    ChannelNotice::Restored { failed_attempts } => {
                                        info!(failed_attempts, "Connection restored")
                                    }
                                    _ => info!("Connected to Veil server"),
                                }
                                shared.notify(notice);
                            }
                            shared.dispatch_text(&text);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Server closed connection");
                            break SessionEnd::Lost { established: pending_notice.is_none() };
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break SessionEnd::Lost { established: pending_notice.is_none() };
                        }
                        _ => {}
                    }
                }
            }
        }
    };

    // Keep-alive interval is dropped with this frame
    shared.install_writer(None);
    if let SessionEnd::Lost { .. } = end {
        shared.set_state(ChannelState::Connecting);
    }
    info!("Disconnected from Veil server");
    end
}

fn frame_json(kind: EventKind) -> Option<String> {
    match serde_json::to_string(&OutboundFrame::new(kind, Value::Null)) {
        Ok(json) => Some(json),
        Err(e) => {
            error!(error = %e, kind = kind.as_str(), "Failed to serialize frame");
            None
        }
    }
}
