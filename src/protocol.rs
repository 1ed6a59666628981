//! WebSocket protocol spoken by porterm against the terminal server.
//!
//! Two sockets are involved:
//!
//! - the **data plane** (`/ws?session_id=...`), one per terminal session.
//!   Binary frames carry raw terminal bytes in both directions; text frames
//!   carry `type`-tagged JSON control messages.
//! - the **control plane** (`/ws/management`), a single shared socket for
//!   tab lifecycle requests and roster synchronization.
//!
//! Both planes use the same JSON envelope: an object with a `type` field
//! naming the message, remaining fields flattened alongside it.

use serde::{Deserialize, Serialize};

// ── Close codes ────────────────────────────────────────────────────

/// Close code sent when the connect URL carried no session id.
pub const CLOSE_SESSION_ID_REQUIRED: u16 = 4001;
/// Close code sent when the session id is unknown to the server.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4004;
/// Close code sent when the session's shell process has exited.
pub const CLOSE_SESSION_ENDED: u16 = 4010;

/// How the client should react to a data-plane close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// The session handle is permanently invalid. Never reconnect.
    Rejected,
    /// Anything else: network drop, server restart, abnormal closure.
    Transient,
}

/// Classify a close code. A missing code (the socket dropped without a
/// close frame) is always transient.
pub fn classify_close(code: Option<u16>) -> CloseClass {
    match code {
        Some(CLOSE_SESSION_ID_REQUIRED | CLOSE_SESSION_NOT_FOUND | CLOSE_SESSION_ENDED) => {
            CloseClass::Rejected
        }
        _ => CloseClass::Transient,
    }
}

// ── Terminal geometry ──────────────────────────────────────────────

pub const MIN_COLS: u16 = 40;
pub const MAX_COLS: u16 = 500;
pub const MIN_ROWS: u16 = 10;
pub const MAX_ROWS: u16 = 200;

/// Terminal size in character cells, always within the server's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDimensions {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalDimensions {
    /// Build dimensions, clamping both axes into the accepted range.
    pub fn clamped(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.clamp(MIN_COLS, MAX_COLS),
            rows: rows.clamp(MIN_ROWS, MAX_ROWS),
        }
    }
}

impl Default for TerminalDimensions {
    fn default() -> Self {
        Self { cols: 120, rows: 30 }
    }
}

// ── Data plane ─────────────────────────────────────────────────────

/// Client → server text frames on a data-plane socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataClientMessage {
    Ping,
    Pong,
    Resize { cols: u16, rows: u16 },
    Auth { password: String },
    /// Ask the server to stop reading the PTY until an `Ack` arrives.
    Pause,
    /// Resume after a `Pause`.
    Ack,
}

/// Server → client text frames on a data-plane socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataServerMessage {
    Ping,
    Pong,
    SessionInfo {
        session_id: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        shell: Option<String>,
    },
    /// Another client resized the shared PTY.
    ResizeSync { cols: u16, rows: u16 },
    Error { message: String },
    PauseAck,
    #[serde(other)]
    Unknown,
}

// ── Control plane ──────────────────────────────────────────────────

/// A terminal tab as described by the server's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: String,
    pub session_id: String,
    pub shell_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabAction {
    Add,
    Remove,
    Update,
}

/// One entry of a `tab_state_update` delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabChange {
    pub action: TabAction,
    pub tab_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<Tab>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Client → server messages on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlClientMessage {
    CreateTab {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        shell_id: Option<String>,
    },
    CloseTab {
        request_id: String,
        tab_id: String,
    },
    RenameTab {
        request_id: String,
        tab_id: String,
        name: String,
    },
    Auth {
        password: String,
    },
    Ping,
    Pong,
}

/// Server → client messages on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlServerMessage {
    CreateTabResponse {
        request_id: String,
        success: bool,
        #[serde(default)]
        tab: Option<Tab>,
        #[serde(default)]
        error: Option<String>,
    },
    CloseTabResponse {
        request_id: String,
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    RenameTabResponse {
        request_id: String,
        success: bool,
        #[serde(default)]
        tab: Option<Tab>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Full roster snapshot.
    #[serde(alias = "tab_list")]
    TabStateSync { tabs: Vec<Tab> },
    /// Incremental roster delta.
    TabStateUpdate { changes: Vec<TabChange> },
    AuthRequired,
    AuthSuccess,
    AuthFailed {
        attempts_remaining: u32,
        #[serde(default)]
        error: Option<String>,
    },
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

/// The body shared by every `*_tab_response`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabResponse {
    pub success: bool,
    pub tab: Option<Tab>,
    pub error: Option<String>,
}

impl ControlServerMessage {
    /// Split a response message into its request id and body.
    /// Returns `None` for broadcasts and heartbeats.
    pub fn into_response(self) -> Option<(String, TabResponse)> {
        match self {
            Self::CreateTabResponse { request_id, success, tab, error }
            | Self::RenameTabResponse { request_id, success, tab, error } => {
                Some((request_id, TabResponse { success, tab, error }))
            }
            Self::CloseTabResponse { request_id, success, error } => {
                Some((request_id, TabResponse { success, tab: None, error }))
            }
            _ => None,
        }
    }
}

// ── Endpoints ──────────────────────────────────────────────────────

/// Turn a configured server address into a websocket base URL.
///
/// Accepts `ws://`, `wss://`, `http://`, `https://` or a bare `host:port`
/// (treated as plain `ws://`). Trailing slashes are dropped.
pub fn websocket_base(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        format!("ws://{}", server)
    }
}

/// Data-plane URL for one session.
pub fn data_url(base: &str, session_id: &str, skip_buffer: bool) -> String {
    let mut url = format!("{}/ws?session_id={}", base, encode_query_value(session_id));
    if skip_buffer {
        url.push_str("&skip_buffer=1");
    }
    url
}

pub fn control_url(base: &str) -> String {
    format!("{}/ws/management", base)
}

fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(b as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", b)),
        }
    }
    encoded
}
