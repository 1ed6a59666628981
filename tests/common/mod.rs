#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use porterm::control::ControlConfig;
use porterm::protocol::Tab;
use porterm::session::{SessionConfig, SessionEvent};

pub const WAIT: Duration = Duration::from_secs(5);

/// In-process websocket server. Every accepted connection is handed to the
/// test together with the request path, in accept order.
pub struct MockServer {
    pub addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<MockConn>,
}

pub struct MockConn {
    /// Request URI, e.g. `/ws?session_id=abc`.
    pub path: String,
    pub ws: WebSocketStream<TcpStream>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut path = String::new();
                    let callback = |req: &Request, resp: Response| {
                        path = req.uri().to_string();
                        Ok(resp)
                    };
                    if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                        let _ = tx.send(MockConn { path, ws });
                    }
                });
            }
        });
        Self { addr, conns: rx }
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.base_url())
    }

    pub fn control_config(&self) -> ControlConfig {
        ControlConfig::new(self.base_url())
    }

    pub async fn next_conn(&mut self) -> MockConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection within timeout")
            .expect("server stopped")
    }

    /// Assert no client connects within `window`.
    pub async fn expect_no_conn(&mut self, window: Duration) {
        if let Ok(Some(conn)) = timeout(window, self.conns.recv()).await {
            panic!("unexpected connection to {}", conn.path);
        }
    }
}

impl MockConn {
    pub async fn send_json(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    pub async fn send_binary(&mut self, data: &[u8]) {
        self.ws.send(Message::Binary(data.to_vec().into())).await.unwrap();
    }

    pub async fn close_with(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.to_string().into() };
        let _ = self.ws.send(Message::Close(Some(frame))).await;
    }

    /// Next message that is not a websocket-level ping/pong.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let msg = timeout(WAIT, self.ws.next()).await.expect("no message within timeout");
            match msg {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(msg)) => return Some(msg),
                Some(Err(_)) | None => return None,
            }
        }
    }

    /// Next JSON text frame, skipping application-level pings.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            match self.recv().await {
                Some(Message::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "ping" {
                        continue;
                    }
                    return value;
                }
                Some(other) => panic!("expected text frame, got {:?}", other),
                None => panic!("connection closed while waiting for text"),
            }
        }
    }
}

pub fn tab(id: &str, session_id: &str) -> Tab {
    Tab {
        id: id.to_string(),
        session_id: session_id.to_string(),
        shell_id: "bash".to_string(),
        name: format!("tab-{}", id),
        created_at: None,
        last_accessed: None,
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("no session event within timeout")
        .expect("event channel closed")
}

/// Wait for the first event matching `pred`, discarding others.
pub async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}
