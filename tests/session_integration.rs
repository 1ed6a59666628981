mod common;

use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use common::{next_event, wait_for, MockServer, WAIT};
use porterm::backoff::BackoffPolicy;
use porterm::registry::{ConnectionRegistry, RegistryError};
use porterm::session::{ConnectionState, SessionConfig, SessionConnection, SessionEvent};
use porterm::sink::{ChannelSink, RenderTicket};

fn fast(mut config: SessionConfig) -> SessionConfig {
    config.settings.backoff = BackoffPolicy::new(Duration::from_millis(20), 5, 5);
    config
}

async fn wait_state(conn: &SessionConnection, want: ConnectionState) {
    let mut rx = conn.subscribe_state();
    timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .expect("state not reached in time")
        .unwrap();
}

/// Collect rendered bytes until `len` have arrived, completing every ticket.
async fn collect(rx: &mut mpsc::UnboundedReceiver<(Bytes, RenderTicket)>, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        let (data, ticket) = timeout(WAIT, rx.recv()).await.expect("render timeout").unwrap();
        out.extend_from_slice(&data);
        ticket.complete();
    }
    out
}

#[tokio::test]
async fn early_output_rendered_once_after_connect() {
    let mut server = MockServer::start().await;
    let (sink, mut rendered) = ChannelSink::new();
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let conn = SessionConnection::spawn(1, "abc".into(), server.session_config(), Box::new(sink), events);

    conn.send_resize(100, 40).unwrap();
    conn.connect(false).unwrap();
    let mut ws = server.next_conn().await;
    assert_eq!(ws.path, "/ws?session_id=abc");

    // Output starts flowing before the client has settled.
    let payload: Vec<u8> = (0..200u8).collect();
    for piece in payload.chunks(50) {
        ws.send_binary(piece).await;
    }

    // Geometry is sent once the client is live.
    let resize = ws.recv_json().await;
    assert_eq!(resize, json!({"type": "resize", "cols": 100, "rows": 40}));

    assert_eq!(collect(&mut rendered, 200).await, payload);
    wait_state(&conn, ConnectionState::Connected).await;
    assert!(
        timeout(Duration::from_millis(100), rendered.recv()).await.is_err(),
        "nothing rendered twice"
    );

    let ev = wait_for(&mut events_rx, |e| matches!(e, SessionEvent::StateChanged { state: ConnectionState::Connected, .. })).await;
    assert_eq!(ev.local_id(), 1);
    conn.shutdown().await;
}

#[tokio::test]
async fn skip_buffer_is_forwarded_in_url() {
    let mut server = MockServer::start().await;
    let (events, _events_rx) = mpsc::unbounded_channel();
    let conn = SessionConnection::spawn(
        1,
        "id with space".into(),
        server.session_config(),
        Box::new(ChannelSink::new().0),
        events,
    );
    conn.connect(true).unwrap();
    let ws = server.next_conn().await;
    assert_eq!(ws.path, "/ws?session_id=id%20with%20space&skip_buffer=1");
    conn.shutdown().await;
}

#[tokio::test]
async fn input_and_heartbeats_reach_server() {
    let mut server = MockServer::start().await;
    let (events, _events_rx) = mpsc::unbounded_channel();
    let conn = SessionConnection::spawn(1, "s".into(), server.session_config(), Box::new(ChannelSink::new().0), events);
    conn.connect(false).unwrap();
    let mut ws = server.next_conn().await;
    wait_state(&conn, ConnectionState::Connected).await;

    conn.send_input(Bytes::from_static(b"echo hi\r")).unwrap();
    match ws.recv().await {
        Some(Message::Binary(data)) => assert_eq!(data.as_ref(), b"echo hi\r"),
        other => panic!("expected input frame, got {:?}", other),
    }

    ws.send_json(json!({"type": "ping"})).await;
    assert_eq!(ws.recv_json().await, json!({"type": "pong"}));
    conn.shutdown().await;
}

#[tokio::test]
async fn session_not_found_is_stale_and_discarded() {
    let mut server = MockServer::start().await;
    let mut registry = ConnectionRegistry::new(fast(server.session_config()));
    let id = registry.open("gone", Box::new(ChannelSink::new().0));
    registry.connect(id, false).unwrap();

    let mut ws = server.next_conn().await;
    ws.close_with(4004, "Session not found").await;

    let event = loop {
        let event = timeout(WAIT, registry.next_event()).await.unwrap().unwrap();
        if matches!(event, SessionEvent::Stale { .. }) {
            break event;
        }
    };
    assert_eq!(event, SessionEvent::Stale { local_id: id, code: 4004 });
    assert_eq!(registry.state(id), Err(RegistryError::UnknownSession(id)));
    assert!(registry.find_by_session("gone").is_none());

    server.expect_no_conn(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn stale_event_survives_interrupted_poll() {
    let mut server = MockServer::start().await;
    let mut registry = ConnectionRegistry::new(fast(server.session_config()));
    let id = registry.open("gone", Box::new(ChannelSink::new().0));
    registry.connect(id, false).unwrap();

    let mut ws = server.next_conn().await;
    ws.close_with(4004, "Session not found").await;

    // Each poll gets one chance before a competing branch wins, the way the
    // attach loop races input against session events.
    let stale = timeout(WAIT, async {
        loop {
            let polled = tokio::select! {
                biased;
                event = registry.next_event() => event,
                _ = std::future::ready(()) => None,
            };
            match polled {
                Some(SessionEvent::Stale { local_id, code }) => break (local_id, code),
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await
    .expect("stale notification lost");

    assert_eq!(stale, (id, 4004));
    assert_eq!(registry.state(id), Err(RegistryError::UnknownSession(id)));
}

#[tokio::test]
async fn dropped_socket_reconnects() {
    let mut server = MockServer::start().await;
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let conn = SessionConnection::spawn(1, "s".into(), fast(server.session_config()), Box::new(ChannelSink::new().0), events);
    conn.connect(false).unwrap();

    let first = server.next_conn().await;
    wait_state(&conn, ConnectionState::Connected).await;
    drop(first);

    let ev = wait_for(&mut events_rx, |e| matches!(e, SessionEvent::Reconnecting { .. })).await;
    assert_eq!(
        ev,
        SessionEvent::Reconnecting { local_id: 1, attempt: 1, delay: Duration::from_millis(20) }
    );

    let second = server.next_conn().await;
    assert_eq!(second.path, "/ws?session_id=s");
    wait_state(&conn, ConnectionState::Connected).await;
    conn.shutdown().await;
}

#[tokio::test]
async fn unreachable_server_gives_up() {
    // Grab a free port and release it so nothing listens there.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = SessionConfig::new(format!("ws://{}", addr));
    config.settings.backoff = BackoffPolicy::new(Duration::from_millis(10), 5, 3);

    let (events, mut events_rx) = mpsc::unbounded_channel();
    let conn = SessionConnection::spawn(7, "s".into(), config, Box::new(ChannelSink::new().0), events);
    conn.connect(false).unwrap();

    let mut attempts = Vec::new();
    let failure = loop {
        match next_event(&mut events_rx).await {
            SessionEvent::Reconnecting { attempt, .. } => attempts.push(attempt),
            e @ SessionEvent::PermanentFailure { .. } => break e,
            _ => {}
        }
    };
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(failure, SessionEvent::PermanentFailure { local_id: 7, attempts: 3 });
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    conn.shutdown().await;
}

#[tokio::test]
async fn disconnect_closes_cleanly_without_retry() {
    let mut server = MockServer::start().await;
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let conn = SessionConnection::spawn(1, "s".into(), fast(server.session_config()), Box::new(ChannelSink::new().0), events);
    conn.connect(false).unwrap();
    let mut ws = server.next_conn().await;
    wait_state(&conn, ConnectionState::Connected).await;

    conn.disconnect().unwrap();
    loop {
        match ws.recv().await {
            Some(Message::Close(_)) | None => break,
            Some(_) => continue,
        }
    }
    wait_state(&conn, ConnectionState::Disconnected).await;
    server.expect_no_conn(Duration::from_millis(200)).await;

    while let Ok(event) = events_rx.try_recv() {
        assert!(!matches!(event, SessionEvent::Reconnecting { .. }));
    }
    conn.shutdown().await;
}

#[tokio::test]
async fn backpressure_pauses_and_resumes_once() {
    let mut server = MockServer::start().await;
    let (sink, mut rendered) = ChannelSink::new();
    let (events, _events_rx) = mpsc::unbounded_channel();
    let conn = SessionConnection::spawn(1, "s".into(), server.session_config(), Box::new(sink), events);
    conn.connect(false).unwrap();
    let mut ws = server.next_conn().await;
    wait_state(&conn, ConnectionState::Connected).await;

    // 120 KB of output without completing any render.
    let chunk = vec![b'x'; 10_000];
    for _ in 0..12 {
        ws.send_binary(&chunk).await;
    }
    assert_eq!(ws.recv_json().await, json!({"type": "pause"}));
    ws.send_json(json!({"type": "pause_ack"})).await;

    // The renderer catches up.
    let mut total = 0;
    while total < 120_000 {
        let (data, ticket) = timeout(WAIT, rendered.recv()).await.unwrap().unwrap();
        total += data.len();
        ticket.complete();
    }
    assert_eq!(ws.recv_json().await, json!({"type": "ack"}));
    conn.shutdown().await;
}

#[tokio::test]
async fn reconnect_drops_stalled_handshake_first() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = SessionConfig::new(format!("ws://{}", listener.local_addr().unwrap()));
    let (events, _events_rx) = mpsc::unbounded_channel();
    let conn = SessionConnection::spawn(1, "s".into(), config, Box::new(ChannelSink::new().0), events);

    // The first upgrade request is read but never answered.
    conn.connect(false).unwrap();
    let (mut stalled, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut request = [0u8; 1024];
    let n = timeout(WAIT, stalled.read(&mut request)).await.unwrap().unwrap();
    assert!(n > 0);

    conn.connect(false).unwrap();
    let mut rest = Vec::new();
    let eof = timeout(WAIT, stalled.read_to_end(&mut rest)).await;
    assert!(eof.is_ok(), "stalled socket left open after reconnect");

    let (second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let _ws = tokio_tungstenite::accept_async(second).await.unwrap();
    wait_state(&conn, ConnectionState::Connected).await;
    conn.shutdown().await;
}
