//! Data-plane session connections.
//!
//! [`SessionConnection`] is the handle the rest of the client holds. It owns
//! a driver task that feeds a [`SessionCore`] and executes its effects:
//! opening and closing transports, arming timers, rendering output and
//! forwarding notifications.

mod state;
mod early;
mod timers;
mod transport;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use self::state::{
    ConnectionState, Effect, Event, LocalId, SessionCore, SessionEvent, SessionSettings,
    TimerKind, MAX_INPUT_CHUNK,
};
pub use self::early::{EarlyBuffer, EARLY_BUFFER_MAX_BYTES};

use self::timers::Timers;
use self::transport::Transport;
use crate::protocol;
use crate::sink::{RenderSink, RenderTicket};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session has no server session id")]
    MissingSessionId,
    #[error("session driver has stopped")]
    Stopped,
}

/// Where to connect and how to behave once connected.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Websocket base URL, e.g. `ws://127.0.0.1:8000`.
    pub base_url: String,
    pub settings: SessionSettings,
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), settings: SessionSettings::default() }
    }
}

pub struct SessionConnection {
    local_id: LocalId,
    server_session_id: String,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionConnection {
    /// Spawn the driver. The connection starts disconnected.
    pub fn spawn(
        local_id: LocalId,
        server_session_id: String,
        config: SessionConfig,
        sink: Box<dyn RenderSink>,
        notify: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let driver = Driver {
            core: SessionCore::new(local_id, server_session_id.clone(), config.settings.clone()),
            base_url: config.base_url,
            sink,
            notify,
            transport: None,
            closing: None,
            timers: Timers::new(events_tx.clone()),
            events: events_tx.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(driver.run(events_rx, cancel.clone()));

        Self {
            local_id,
            server_session_id,
            events: events_tx,
            state: state_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    pub fn server_session_id(&self) -> &str {
        &self.server_session_id
    }

    /// Open the data socket, tearing down any existing one first.
    pub fn connect(&self, skip_buffer: bool) -> Result<(), SessionError> {
        if self.server_session_id.is_empty() {
            return Err(SessionError::MissingSessionId);
        }
        self.post(Event::Connect { skip_buffer })
    }

    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.post(Event::Disconnect)
    }

    /// Send keystrokes. Dropped silently unless connected.
    pub fn send_input(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        self.post(Event::SendInput(data.into()))
    }

    pub fn send_resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.post(Event::Resize { cols, rows })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Disconnect and wait for the driver to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn post(&self, event: Event) -> Result<(), SessionError> {
        self.events.send(event).map_err(|_| SessionError::Stopped)
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("local_id", &self.local_id)
            .field("server_session_id", &self.server_session_id)
            .field("state", &self.state())
            .finish()
    }
}

struct Driver {
    core: SessionCore,
    base_url: String,
    sink: Box<dyn RenderSink>,
    notify: mpsc::UnboundedSender<SessionEvent>,
    transport: Option<Transport>,
    /// Task of the last transport closed without a successor.
    closing: Option<JoinHandle<()>>,
    timers: Timers,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Sender<ConnectionState>,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.dispatch(Event::Disconnect);
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        let pending = self.timers.pending();
        self.timers.cancel_all();
        if let Some(transport) = self.transport.take() {
            drop(transport.close());
        }
        self.closing = None;
        tracing::debug!(local_id = self.core.local_id(), pending, "session driver stopped");
    }

    fn dispatch(&mut self, event: Event) {
        for effect in self.core.handle_event(event) {
            self.apply(effect);
        }
        self.state.send_if_modified(|state| {
            let next = self.core.state();
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport { generation, session_id, skip_buffer } => {
                let previous = self
                    .transport
                    .take()
                    .map(Transport::close)
                    .or_else(|| self.closing.take());
                let url = protocol::data_url(&self.base_url, &session_id, skip_buffer);
                tracing::debug!(%url, generation, "opening data socket");
                self.transport = Some(Transport::open(url, generation, self.events.clone(), previous));
            }
            Effect::CloseTransport => {
                if let Some(transport) = self.transport.take() {
                    tracing::trace!(generation = transport.generation(), "closing data socket");
                    self.closing = Some(transport.close());
                }
            }
            Effect::Send(msg) => match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Some(transport) = &self.transport {
                        transport.send_text(text);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode control message"),
            },
            Effect::SendBinary(data) => {
                if let Some(transport) = &self.transport {
                    transport.send_binary(data);
                }
            }
            Effect::Render(batch) => {
                let ticket = RenderTicket::new(batch.generation, batch.data.len(), self.events.clone());
                self.sink.render(batch.data, ticket);
            }
            Effect::Schedule { timer, after, generation } => {
                self.timers.schedule(timer, after, generation);
            }
            Effect::Cancel(timer) => self.timers.cancel(timer),
            Effect::CancelAllTimers => self.timers.cancel_all(),
            Effect::Notify(event) => {
                let _ = self.notify.send(event);
            }
        }
    }
}
