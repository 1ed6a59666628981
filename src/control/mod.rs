//! The shared management socket.
//!
//! [`ControlChannel`] creates, closes and renames tabs and keeps the local
//! [`Roster`] in sync with the server. A single actor task owns the socket;
//! the handle talks to it over a command channel and observes the roster
//! through a `watch` channel.

mod pending;
mod roster;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

pub use self::roster::Roster;

use self::pending::PendingRequests;
use crate::protocol::{
    self, ControlClientMessage, ControlServerMessage, Tab, TabAction, TabChange, TabResponse,
};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("control channel is not authenticated")]
    NotAuthenticated,
    #[error("server requires a password but none is configured")]
    AuthRequired,
    #[error("authentication failed ({attempts_remaining} attempts remaining)")]
    AuthFailed { attempts_remaining: u32 },
    #[error("control channel closed")]
    ChannelClosed,
    #[error("request timed out")]
    Timeout,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("failed to connect control channel: {0}")]
    Connect(String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Websocket base URL, e.g. `ws://127.0.0.1:8000`.
    pub base_url: String,
    pub password: Option<String>,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl ControlConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            password: None,
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The roster changed; read it from [`ControlChannel::roster`].
    RosterChanged,
    AuthFailed { attempts_remaining: u32 },
    /// The socket is gone. The channel does not reconnect by itself.
    Closed,
}

#[derive(Debug, Default)]
struct ChannelStatus {
    authenticated: bool,
    closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Create { shell_id: Option<String> },
    Close { tab_id: String },
    Rename { tab_id: String, name: String },
}

impl RequestKind {
    fn to_message(&self, request_id: String) -> ControlClientMessage {
        match self {
            Self::Create { shell_id } => {
                ControlClientMessage::CreateTab { request_id, shell_id: shell_id.clone() }
            }
            Self::Close { tab_id } => ControlClientMessage::CloseTab { request_id, tab_id: tab_id.clone() },
            Self::Rename { tab_id, name } => ControlClientMessage::RenameTab {
                request_id,
                tab_id: tab_id.clone(),
                name: name.clone(),
            },
        }
    }

    /// The roster edit implied by a successful response. The server may
    /// leave the requester out of its own broadcast.
    fn roster_change(&self, response: &TabResponse, roster: &Roster) -> Option<TabChange> {
        let (action, tab_id, tab) = match self {
            Self::Create { .. } => {
                let tab = response.tab.clone()?;
                (TabAction::Add, tab.id.clone(), Some(tab))
            }
            Self::Close { tab_id } => (TabAction::Remove, tab_id.clone(), None),
            Self::Rename { tab_id, name } => {
                let tab = response.tab.clone().or_else(|| {
                    roster.get(tab_id).map(|t| Tab { name: name.clone(), ..t.clone() })
                })?;
                (TabAction::Update, tab_id.clone(), Some(tab))
            }
        };
        Some(TabChange { action, tab_id, tab, reason: None })
    }
}

struct Command {
    kind: RequestKind,
    reply: pending::Reply,
}

pub struct ControlChannel {
    commands: mpsc::UnboundedSender<Command>,
    roster: watch::Receiver<Roster>,
    events: broadcast::Sender<ControlEvent>,
    status: Arc<Mutex<ChannelStatus>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Open the management socket. Resolves once the first roster snapshot
    /// has arrived (after authenticating, if the server asks for it).
    pub async fn connect(config: ControlConfig) -> Result<Self, ControlError> {
        let url = protocol::control_url(&config.base_url);
        tracing::debug!(%url, "opening control channel");
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ControlError::Connect(e.to_string()))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (roster_tx, roster_rx) = watch::channel(Roster::new());
        let (events_tx, _) = broadcast::channel(64);
        let status = Arc::new(Mutex::new(ChannelStatus::default()));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let snapshot_timeout = config.request_timeout;

        let actor = Actor {
            config,
            pending: PendingRequests::new(),
            roster: Roster::new(),
            roster_tx,
            events: events_tx.clone(),
            status: status.clone(),
            ready: Some(ready_tx),
        };
        let task = tokio::spawn(actor.run(ws, commands_rx, cancel.clone()));

        let channel = Self {
            commands: commands_tx,
            roster: roster_rx,
            events: events_tx,
            status,
            cancel,
            task: Some(task),
        };

        let outcome = match tokio::time::timeout(snapshot_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ControlError::ChannelClosed),
            Err(_) => Err(ControlError::Timeout),
        };
        match outcome {
            Ok(()) => {
                tracing::info!(tabs = channel.roster().len(), "control channel ready");
                Ok(channel)
            }
            Err(e) => {
                channel.shutdown().await;
                Err(e)
            }
        }
    }

    /// Ask the server for a new tab. `shell_id` picks a configured shell.
    pub async fn create_session(&self, shell_id: Option<String>) -> Result<Tab, ControlError> {
        let response = self.request(RequestKind::Create { shell_id }).await?;
        response
            .tab
            .ok_or_else(|| ControlError::UnexpectedResponse("create_tab_response without tab".into()))
    }

    pub async fn close_session(&self, tab_id: &str) -> Result<(), ControlError> {
        self.request(RequestKind::Close { tab_id: tab_id.to_string() }).await?;
        Ok(())
    }

    /// Rename a tab. Returns the updated tab when the server includes it.
    pub async fn rename_session(&self, tab_id: &str, name: &str) -> Result<Option<Tab>, ControlError> {
        let response = self
            .request(RequestKind::Rename { tab_id: tab_id.to_string(), name: name.to_string() })
            .await?;
        Ok(response.tab)
    }

    /// Current roster.
    pub fn roster(&self) -> Roster {
        self.roster.borrow().clone()
    }

    pub fn watch_roster(&self) -> watch::Receiver<Roster> {
        self.roster.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status.lock().authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.status.lock().closed
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn request(&self, kind: RequestKind) -> Result<TabResponse, ControlError> {
        {
            let status = self.status.lock();
            if status.closed {
                return Err(ControlError::ChannelClosed);
            }
            if !status.authenticated {
                return Err(ControlError::NotAuthenticated);
            }
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { kind, reply })
            .map_err(|_| ControlError::ChannelClosed)?;
        let response = rx.await.map_err(|_| ControlError::ChannelClosed)??;

        if !response.success {
            let message = response.error.unwrap_or_else(|| "request failed".to_string());
            return Err(ControlError::Rejected(message));
        }
        Ok(response)
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status.lock();
        f.debug_struct("ControlChannel")
            .field("authenticated", &status.authenticated)
            .field("closed", &status.closed)
            .finish_non_exhaustive()
    }
}

/// Why the actor loop ended.
enum Exit {
    Shutdown,
    Closed,
    Failed(ControlError),
}

struct Actor {
    config: ControlConfig,
    pending: PendingRequests,
    roster: Roster,
    roster_tx: watch::Sender<Roster>,
    events: broadcast::Sender<ControlEvent>,
    status: Arc<Mutex<ChannelStatus>>,
    ready: Option<oneshot::Sender<Result<(), ControlError>>>,
}

impl Actor {
    async fn run(
        mut self,
        ws: WsStream,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        let (mut sink, mut stream) = ws.split();
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        let exit = loop {
            let deadline = self.pending.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break Exit::Shutdown;
                }
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break Exit::Shutdown };
                    if !self.on_command(cmd, &mut sink).await {
                        break Exit::Closed;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(exit) = self.on_text(&text, &mut sink).await {
                                break exit;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(frame = ?frame, "control channel closed by server");
                            break Exit::Closed;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "control channel error");
                            break Exit::Closed;
                        }
                        None => break Exit::Closed,
                    }
                }
                _ = heartbeat.tick() => {
                    if !send(&mut sink, &ControlClientMessage::Ping).await {
                        break Exit::Closed;
                    }
                }
                _ = sleep_until(deadline) => {
                    for request_id in self.pending.expire(Instant::now()) {
                        tracing::warn!(%request_id, "control request timed out");
                    }
                }
            }
        };

        self.finish(exit);
    }

    async fn on_command(&mut self, cmd: Command, sink: &mut WsSink) -> bool {
        let request_id = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.request_timeout;
        let message = cmd.kind.to_message(request_id.clone());
        self.pending.insert(request_id.clone(), cmd.kind, cmd.reply, deadline);
        tracing::debug!(%request_id, in_flight = self.pending.len(), "sending control request");
        send(sink, &message).await
    }

    async fn on_text(&mut self, text: &str, sink: &mut WsSink) -> Option<Exit> {
        let msg = match serde_json::from_str::<ControlServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed control message");
                return None;
            }
        };

        match msg {
            ControlServerMessage::TabStateSync { tabs } => {
                self.roster.apply_snapshot(tabs);
                self.status.lock().authenticated = true;
                self.publish_roster();
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            ControlServerMessage::TabStateUpdate { changes } => {
                if self.roster.apply_changes(changes) {
                    self.publish_roster();
                }
            }
            ControlServerMessage::AuthRequired => {
                self.status.lock().authenticated = false;
                match self.config.password.clone() {
                    Some(password) => {
                        tracing::debug!("control channel authenticating");
                        if !send(sink, &ControlClientMessage::Auth { password }).await {
                            return Some(Exit::Closed);
                        }
                    }
                    None => return Some(Exit::Failed(ControlError::AuthRequired)),
                }
            }
            ControlServerMessage::AuthSuccess => {
                tracing::info!("control channel authenticated");
                self.status.lock().authenticated = true;
            }
            ControlServerMessage::AuthFailed { attempts_remaining, error } => {
                tracing::warn!(attempts_remaining, error = ?error, "control channel authentication failed");
                self.status.lock().authenticated = false;
                let _ = self.events.send(ControlEvent::AuthFailed { attempts_remaining });
                if self.ready.is_some() {
                    return Some(Exit::Failed(ControlError::AuthFailed { attempts_remaining }));
                }
            }
            ControlServerMessage::Ping => {
                if !send(sink, &ControlClientMessage::Pong).await {
                    return Some(Exit::Closed);
                }
            }
            ControlServerMessage::Pong => {}
            ControlServerMessage::Unknown => {
                tracing::debug!("ignoring unknown control message");
            }
            response => {
                if let Some((request_id, body)) = response.into_response() {
                    self.on_response(&request_id, body);
                }
            }
        }
        None
    }

    /// The roster is updated before the caller hears back, so it already
    /// reflects the request when the reply arrives.
    fn on_response(&mut self, request_id: &str, body: TabResponse) {
        let Some((kind, reply)) = self.pending.take(request_id) else {
            tracing::debug!(%request_id, "response for unknown request");
            return;
        };
        if body.success {
            if let Some(change) = kind.roster_change(&body, &self.roster) {
                if self.roster.apply_changes(vec![change]) {
                    self.publish_roster();
                }
            }
        }
        let _ = reply.send(Ok(body));
    }

    fn publish_roster(&self) {
        self.roster_tx.send_replace(self.roster.clone());
        let _ = self.events.send(ControlEvent::RosterChanged);
    }

    fn finish(&mut self, exit: Exit) {
        {
            let mut status = self.status.lock();
            status.closed = true;
            status.authenticated = false;
        }
        self.pending.fail_all();

        let error = match exit {
            Exit::Failed(e) => e,
            Exit::Shutdown | Exit::Closed => ControlError::ChannelClosed,
        };
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(error));
        }
        let _ = self.events.send(ControlEvent::Closed);
        tracing::debug!("control channel stopped");
    }
}

async fn send(sink: &mut WsSink, msg: &ControlClientMessage) -> bool {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode control message");
            return true;
        }
    };
    match sink.send(Message::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "control channel send failed");
            false
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
