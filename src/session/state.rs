//! Per-session connection state machine.
//!
//! [`SessionCore`] owns no sockets and no timers. Every input (user intent,
//! socket event, timer fire, render completion) arrives as an [`Event`]
//! through [`SessionCore::handle_event`], and every side effect leaves as an
//! [`Effect`] for the driver to execute. Asynchronous inputs carry the
//! generation they were issued under; anything from an older generation is
//! discarded, so a torn-down socket can never touch the current one's state.

use std::time::Duration;

use bytes::Bytes;

use super::early::{EarlyBuffer, EARLY_BUFFER_MAX_BYTES};
use crate::backoff::BackoffPolicy;
use crate::flow::{FlowAction, FlowController, FlowThresholds, RenderBatch};
use crate::protocol::{
    classify_close, CloseClass, DataClientMessage, DataServerMessage, TerminalDimensions,
};

/// Client-local session handle, stable across reconnects.
pub type LocalId = u64;

/// Largest binary input frame the server accepts.
pub const MAX_INPUT_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Heartbeat,
    /// First rendering frame after the socket opened.
    LayoutSettle,
    /// Second rendering frame; geometry is trusted after this one.
    GeometrySettle,
    /// Coalesced delivery of queued output.
    Flush,
    Reconnect,
    PauseRetry,
    Emergency,
}

/// Tunables for one session connection.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub backoff: BackoffPolicy,
    pub flow: FlowThresholds,
    pub heartbeat_interval: Duration,
    /// Length of one rendering frame.
    pub frame_interval: Duration,
    pub early_buffer_bytes: usize,
    /// Sent as `{"type":"auth"}` right after the socket opens.
    pub auth_token: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            flow: FlowThresholds::default(),
            heartbeat_interval: Duration::from_secs(30),
            frame_interval: Duration::from_millis(16),
            early_buffer_bytes: EARLY_BUFFER_MAX_BYTES,
            auth_token: None,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect { skip_buffer: bool },
    Disconnect,
    SendInput(Bytes),
    Resize { cols: u16, rows: u16 },
    TransportOpened { generation: u64 },
    /// The socket could not be opened at all.
    TransportFailed { generation: u64, reason: String },
    TransportClosed { generation: u64, code: Option<u16>, reason: String },
    Binary { generation: u64, data: Bytes },
    Text { generation: u64, text: String },
    TimerFired { timer: TimerKind, generation: u64 },
    Rendered { generation: u64, len: usize },
}

/// Notifications for whoever owns the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged { local_id: LocalId, state: ConnectionState },
    SessionInfo {
        local_id: LocalId,
        session_id: String,
        dimensions: Option<TerminalDimensions>,
    },
    ResizeSync { local_id: LocalId, dimensions: TerminalDimensions },
    ServerError { local_id: LocalId, message: String },
    Reconnecting { local_id: LocalId, attempt: u32, delay: Duration },
    /// Retries exhausted. The UI should offer a manual retry.
    PermanentFailure { local_id: LocalId, attempts: u32 },
    /// The server rejected the session id. The UI should offer a new session.
    Stale { local_id: LocalId, code: u16 },
}

impl SessionEvent {
    pub fn local_id(&self) -> LocalId {
        match self {
            Self::StateChanged { local_id, .. }
            | Self::SessionInfo { local_id, .. }
            | Self::ResizeSync { local_id, .. }
            | Self::ServerError { local_id, .. }
            | Self::Reconnecting { local_id, .. }
            | Self::PermanentFailure { local_id, .. }
            | Self::Stale { local_id, .. } => *local_id,
        }
    }
}

/// Outputs of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport { generation: u64, session_id: String, skip_buffer: bool },
    /// Detach and close the current transport, if any.
    CloseTransport,
    Send(DataClientMessage),
    SendBinary(Bytes),
    Render(RenderBatch),
    Schedule { timer: TimerKind, after: Duration, generation: u64 },
    Cancel(TimerKind),
    CancelAllTimers,
    Notify(SessionEvent),
}

#[derive(Debug)]
pub struct SessionCore {
    local_id: LocalId,
    server_session_id: String,
    settings: SessionSettings,
    state: ConnectionState,
    reconnect_attempts: u32,
    reconnect_pending: bool,
    generation: u64,
    has_transport: bool,
    skip_buffer: bool,
    dimensions: Option<TerminalDimensions>,
    early: EarlyBuffer,
    flow: FlowController,
    effects: Vec<Effect>,
}

impl SessionCore {
    pub fn new(local_id: LocalId, server_session_id: String, settings: SessionSettings) -> Self {
        let early = EarlyBuffer::new(settings.early_buffer_bytes);
        let flow = FlowController::new(settings.flow);
        Self {
            local_id,
            server_session_id,
            settings,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            reconnect_pending: false,
            generation: 0,
            has_transport: false,
            skip_buffer: false,
            dimensions: None,
            early,
            flow,
            effects: Vec::new(),
        }
    }

    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    pub fn server_session_id(&self) -> &str {
        &self.server_session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_transport(&self) -> bool {
        self.has_transport
    }

    pub fn dimensions(&self) -> Option<TerminalDimensions> {
        self.dimensions
    }

    pub fn early_buffered(&self) -> usize {
        self.early.len_bytes()
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Feed one event through the state machine and collect its effects.
    pub fn handle_event(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Connect { skip_buffer } => self.on_connect(skip_buffer),
            Event::Disconnect => self.on_disconnect(),
            Event::SendInput(data) => self.on_send_input(data),
            Event::Resize { cols, rows } => self.on_resize(cols, rows),
            Event::TransportOpened { generation } => self.on_open(generation),
            Event::TransportFailed { generation, reason } => {
                self.on_close(generation, None, &reason)
            }
            Event::TransportClosed { generation, code, reason } => {
                self.on_close(generation, code, &reason)
            }
            Event::Binary { generation, data } => self.on_binary(generation, data),
            Event::Text { generation, text } => self.on_text(generation, &text),
            Event::TimerFired { timer, generation } => self.on_timer(timer, generation),
            Event::Rendered { generation, len } => {
                let actions = self.flow.on_rendered(generation, len);
                self.apply_flow(actions);
            }
        }
        std::mem::take(&mut self.effects)
    }

    // ── User intents ───────────────────────────────────────────────

    fn on_connect(&mut self, skip_buffer: bool) {
        if self.server_session_id.is_empty() {
            tracing::warn!(local_id = self.local_id, "connect refused: no server session id");
            return;
        }
        self.reconnect_attempts = 0;
        self.open(skip_buffer);
    }

    fn on_disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected
            && !self.reconnect_pending
            && !self.has_transport
        {
            return;
        }

        // Disconnecting first, so the close that follows is not mistaken
        // for a drop.
        self.set_state(ConnectionState::Disconnecting);
        self.effects.push(Effect::CancelAllTimers);
        self.reconnect_pending = false;
        self.teardown_transport();
        self.begin_generation();
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(
            local_id = self.local_id,
            session_id = %self.server_session_id,
            "session disconnected"
        );
    }

    fn on_send_input(&mut self, data: Bytes) {
        if !self.is_live() {
            tracing::trace!(
                local_id = self.local_id,
                len = data.len(),
                state = %self.state,
                "dropping input while not connected"
            );
            return;
        }
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_INPUT_CHUNK).min(data.len());
            self.effects.push(Effect::SendBinary(data.slice(offset..end)));
            offset = end;
        }
    }

    fn on_resize(&mut self, cols: u16, rows: u16) {
        let dims = TerminalDimensions::clamped(cols, rows);
        self.dimensions = Some(dims);
        if self.is_live() {
            self.send(DataClientMessage::Resize { cols: dims.cols, rows: dims.rows });
        }
    }

    // ── Transport events ───────────────────────────────────────────

    fn on_open(&mut self, generation: u64) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            tracing::trace!(
                local_id = self.local_id,
                generation,
                "ignoring open of superseded transport"
            );
            return;
        }

        self.reconnect_attempts = 0;
        tracing::debug!(local_id = self.local_id, generation, "data socket open");

        if let Some(token) = self.settings.auth_token.clone() {
            self.send(DataClientMessage::Auth { password: token });
        }
        self.schedule(TimerKind::Heartbeat, self.settings.heartbeat_interval);
        self.schedule(TimerKind::LayoutSettle, self.settings.frame_interval);
    }

    fn on_close(&mut self, generation: u64, code: Option<u16>, reason: &str) {
        if generation != self.generation {
            return;
        }
        self.teardown_transport();

        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        self.effects.push(Effect::CancelAllTimers);
        self.early.clear();

        match (classify_close(code), code) {
            (CloseClass::Rejected, Some(code)) => {
                tracing::warn!(
                    local_id = self.local_id,
                    session_id = %self.server_session_id,
                    code,
                    reason,
                    "server rejected session, not reconnecting"
                );
                self.set_state(ConnectionState::Disconnected);
                self.notify(SessionEvent::Stale { local_id: self.local_id, code });
            }
            _ => {
                tracing::info!(
                    local_id = self.local_id,
                    code = ?code,
                    reason,
                    "data socket dropped"
                );
                self.schedule_reconnect();
            }
        }
    }

    fn on_binary(&mut self, generation: u64, data: Bytes) {
        if generation != self.generation {
            return;
        }
        match self.state {
            ConnectionState::Connecting => self.early.push(data),
            ConnectionState::Connected => {
                let actions = self.flow.on_data(data);
                self.apply_flow(actions);
            }
            _ => {}
        }
    }

    fn on_text(&mut self, generation: u64, text: &str) {
        if generation != self.generation
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            return;
        }

        let msg = match serde_json::from_str::<DataServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(local_id = self.local_id, error = %e, "dropping malformed control frame");
                return;
            }
        };

        match msg {
            DataServerMessage::Ping => self.send(DataClientMessage::Pong),
            DataServerMessage::Pong => {}
            DataServerMessage::SessionInfo { session_id, cols, rows, .. } => {
                let dimensions = match (cols, rows) {
                    (Some(cols), Some(rows)) => Some(TerminalDimensions::clamped(cols, rows)),
                    _ => None,
                };
                self.notify(SessionEvent::SessionInfo {
                    local_id: self.local_id,
                    session_id,
                    dimensions,
                });
            }
            DataServerMessage::ResizeSync { cols, rows } => {
                let dims = TerminalDimensions::clamped(cols, rows);
                self.dimensions = Some(dims);
                self.notify(SessionEvent::ResizeSync { local_id: self.local_id, dimensions: dims });
            }
            DataServerMessage::Error { message } => {
                tracing::warn!(local_id = self.local_id, %message, "server reported error");
                self.notify(SessionEvent::ServerError { local_id: self.local_id, message });
            }
            DataServerMessage::PauseAck => {
                let actions = self.flow.on_pause_ack();
                self.apply_flow(actions);
            }
            DataServerMessage::Unknown => {
                tracing::debug!(local_id = self.local_id, "ignoring unknown control frame");
            }
        }
    }

    // ── Timers ─────────────────────────────────────────────────────

    fn on_timer(&mut self, timer: TimerKind, generation: u64) {
        if generation != self.generation {
            return;
        }
        match timer {
            TimerKind::Heartbeat => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    self.send(DataClientMessage::Ping);
                    self.schedule(TimerKind::Heartbeat, self.settings.heartbeat_interval);
                }
            }
            TimerKind::LayoutSettle => {
                if self.state == ConnectionState::Connecting {
                    self.schedule(TimerKind::GeometrySettle, self.settings.frame_interval);
                }
            }
            TimerKind::GeometrySettle => {
                if self.state == ConnectionState::Connecting {
                    self.finish_connect();
                }
            }
            TimerKind::Flush => {
                if let Some(batch) = self.flow.take_batch() {
                    if self.state == ConnectionState::Connected {
                        self.effects.push(Effect::Render(batch));
                    }
                }
            }
            TimerKind::Reconnect => {
                if self.reconnect_pending && self.state == ConnectionState::Disconnected {
                    self.reconnect_pending = false;
                    tracing::info!(
                        local_id = self.local_id,
                        attempt = self.reconnect_attempts,
                        "reconnecting"
                    );
                    self.open(self.skip_buffer);
                }
            }
            TimerKind::PauseRetry => {
                let actions = self.flow.on_pause_retry();
                self.apply_flow(actions);
            }
            TimerKind::Emergency => {
                let actions = self.flow.on_emergency();
                self.apply_flow(actions);
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn open(&mut self, skip_buffer: bool) {
        if self.state != ConnectionState::Disconnected || self.has_transport {
            self.teardown_transport();
        }
        self.effects.push(Effect::CancelAllTimers);
        self.reconnect_pending = false;
        self.begin_generation();
        self.skip_buffer = skip_buffer;
        self.set_state(ConnectionState::Connecting);
        self.effects.push(Effect::OpenTransport {
            generation: self.generation,
            session_id: self.server_session_id.clone(),
            skip_buffer,
        });
        self.has_transport = true;
    }

    /// Layout has settled: go live, fix the remote geometry, then replay
    /// whatever arrived in the meantime.
    fn finish_connect(&mut self) {
        self.set_state(ConnectionState::Connected);
        tracing::info!(
            local_id = self.local_id,
            session_id = %self.server_session_id,
            generation = self.generation,
            "session connected"
        );

        if let Some(dims) = self.dimensions {
            self.send(DataClientMessage::Resize { cols: dims.cols, rows: dims.rows });
        }

        let backlog = self.early.drain();
        if backlog.is_empty() {
            return;
        }
        for chunk in backlog {
            let actions = self.flow.on_data(chunk);
            self.apply_flow(actions);
        }
        if let Some(batch) = self.flow.take_batch() {
            self.effects.push(Effect::Render(batch));
            self.effects.push(Effect::Cancel(TimerKind::Flush));
        }
    }

    fn schedule_reconnect(&mut self) {
        self.set_state(ConnectionState::Disconnected);

        if !self.settings.backoff.allows(self.reconnect_attempts) {
            tracing::warn!(
                local_id = self.local_id,
                attempts = self.reconnect_attempts,
                "giving up on session after repeated failures"
            );
            self.notify(SessionEvent::PermanentFailure {
                local_id: self.local_id,
                attempts: self.reconnect_attempts,
            });
            return;
        }

        self.reconnect_attempts += 1;
        let delay = self.settings.backoff.delay(self.reconnect_attempts);
        self.reconnect_pending = true;
        tracing::info!(
            local_id = self.local_id,
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.notify(SessionEvent::Reconnecting {
            local_id: self.local_id,
            attempt: self.reconnect_attempts,
            delay,
        });
        self.schedule(TimerKind::Reconnect, delay);
    }

    fn begin_generation(&mut self) {
        self.generation += 1;
        self.flow.reset(self.generation);
        self.early.clear();
    }

    fn teardown_transport(&mut self) {
        if self.has_transport {
            self.effects.push(Effect::CloseTransport);
            self.has_transport = false;
        }
    }

    fn is_live(&self) -> bool {
        self.state == ConnectionState::Connected && self.has_transport
    }

    fn apply_flow(&mut self, actions: Vec<FlowAction>) {
        for action in actions {
            match action {
                FlowAction::SendPause => self.send(DataClientMessage::Pause),
                FlowAction::SendResume => self.send(DataClientMessage::Ack),
                FlowAction::ScheduleFlush => {
                    self.schedule(TimerKind::Flush, self.settings.frame_interval)
                }
                FlowAction::ArmPauseRetry(after) => self.schedule(TimerKind::PauseRetry, after),
                FlowAction::CancelPauseRetry => {
                    self.effects.push(Effect::Cancel(TimerKind::PauseRetry))
                }
                FlowAction::ArmEmergency(after) => self.schedule(TimerKind::Emergency, after),
                FlowAction::CancelEmergency => {
                    self.effects.push(Effect::Cancel(TimerKind::Emergency))
                }
            }
        }
    }

    fn send(&mut self, msg: DataClientMessage) {
        if self.has_transport {
            self.effects.push(Effect::Send(msg));
        }
    }

    fn schedule(&mut self, timer: TimerKind, after: Duration) {
        self.effects.push(Effect::Schedule { timer, after, generation: self.generation });
    }

    fn notify(&mut self, event: SessionEvent) {
        self.effects.push(Effect::Notify(event));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.notify(SessionEvent::StateChanged { local_id: self.local_id, state });
    }
}
